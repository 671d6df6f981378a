//! Whole-site build orchestration.
//!
//! A [`BuildCoordinator`] owns the page queue, the report and the worker
//! registry. One worker first resolves [`ALL_PATHS_ROUTE`]; until it does,
//! nothing else is dequeued. After that every ready worker pulls the next
//! pathname. Page failures are recorded and the build carries on; failing to
//! learn the page list ends the build.

mod output;

use std::{
    collections::{BTreeSet, HashMap},
    num::NonZeroUsize,
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use frostline_protocol::{BuildError, RenderOutcome};
use metrics::counter;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use output::{CONTENT_FILE, INDEX_FILE, OutputError, OutputStage, PageArtifacts, assemble_document};

use crate::{
    application::{
        render::{RenderInput, SessionError},
        worker::{RenderTask, WorkerError, WorkerEvent, WorkerHandle, WorkerId, WorkerSpec},
    },
    domain::{
        request::{ALL_PATHS_ROUTE, RenderRequest},
        routes::{RouteDeclaration, RouteError, RoutePattern},
    },
};

pub const ROUTE_PATTERNS_FILE: &str = "route-patterns.json";

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub output_dir: PathBuf,
    pub workers: NonZeroUsize,
}

#[derive(Debug, Error)]
pub enum BuildFailure {
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("no render thread could start: {0}")]
    NoWorkers(String),
    #[error("resolving {ALL_PATHS_ROUTE} failed: {0}")]
    AllPaths(#[source] SessionError),
    #[error("{ALL_PATHS_ROUTE} returned an unusable page list: {0}")]
    InvalidPageList(String),
    #[error("invalid route declaration: {0}")]
    Route(#[from] RouteError),
    #[error("failed to write {ROUTE_PATTERNS_FILE}: {0}")]
    RoutePatterns(#[source] OutputError),
    #[error("render threads stopped with {0} page(s) left")]
    Stalled(usize),
}

impl BuildFailure {
    pub fn diagnostics(&self) -> Vec<BuildError> {
        match self {
            BuildFailure::AllPaths(err) => err
                .diagnostics(ALL_PATHS_ROUTE)
                .into_iter()
                .map(BuildError::fatal)
                .collect(),
            other => vec![BuildError::new("Build failed", "", other.to_string()).fatal()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub pathname: String,
    pub artifacts: PageArtifacts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFailure {
    pub pathname: String,
    pub errors: Vec<BuildError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub rendered: Vec<RenderedPage>,
    /// Pages that answered with a server response and have nothing to write.
    pub skipped: Vec<String>,
    pub failures: Vec<PageFailure>,
    pub routes: Vec<RoutePattern>,
}

impl BuildReport {
    pub fn failed(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Colorized diagnostics for every failed page.
    pub fn render_failures(&self) -> String {
        self.failures
            .iter()
            .flat_map(|failure| failure.errors.iter())
            .map(BuildError::to_ansi)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PageList {
    Paths(Vec<String>),
    Manifest {
        paths: Vec<String>,
        #[serde(default)]
        routes: Vec<RouteDeclaration>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllPaths {
    Waiting,
    InFlight { ticket: u64 },
    Resolved,
}

pub struct BuildCoordinator {
    queue: Vec<String>,
    workers: Vec<WorkerHandle>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    in_flight: HashMap<u64, String>,
    next_ticket: u64,
    all_paths: AllPaths,
    base_path: String,
    output: OutputStage,
    report: BuildReport,
}

/// Render every page and write it under `options.output_dir`.
///
/// Blocks the calling thread; run it off any async runtime.
pub fn run_build(spec: WorkerSpec, options: BuildOptions) -> Result<BuildReport, BuildFailure> {
    spec.resolver.watched.clear();
    let coordinator = BuildCoordinator::start(spec, &options)?;
    coordinator.run()
}

impl BuildCoordinator {
    pub fn start(spec: WorkerSpec, options: &BuildOptions) -> Result<Self, BuildFailure> {
        let base_path = spec.base_path.clone();
        let spec = Arc::new(spec);
        let (events_tx, events) = mpsc::unbounded_channel();
        let workers = (0..options.workers.get())
            .map(|slot| WorkerHandle::spawn(slot, Arc::clone(&spec), events_tx.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            target = "application::build",
            workers = workers.len(),
            output_dir = %options.output_dir.display(),
            "Build started"
        );

        Ok(Self {
            queue: Vec::new(),
            workers,
            events,
            in_flight: HashMap::new(),
            next_ticket: 0,
            all_paths: AllPaths::Waiting,
            base_path,
            output: OutputStage::new(&options.output_dir),
            report: BuildReport::default(),
        })
    }

    pub fn run(mut self) -> Result<BuildReport, BuildFailure> {
        let started_at = Instant::now();
        let result = self.drive();
        self.shutdown();

        let report = result?;
        info!(
            target = "application::build",
            op = "build",
            result = if report.failed() { "failed" } else { "ok" },
            rendered = report.rendered.len(),
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Build finished"
        );
        Ok(report)
    }

    fn drive(&mut self) -> Result<BuildReport, BuildFailure> {
        loop {
            self.dispatch();
            if self.all_paths == AllPaths::Resolved
                && self.queue.is_empty()
                && self.in_flight.is_empty()
            {
                return Ok(std::mem::take(&mut self.report));
            }
            if !self.workers.iter().any(|worker| worker.is_live()) {
                return Err(self.stalled("every render thread exited"));
            }

            let Some(event) = self.events.blocking_recv() else {
                return Err(self.stalled("render threads hung up"));
            };
            let worker = event.worker();
            match event {
                WorkerEvent::Ready(_) => {
                    if let Some(handle) = self.handle_mut(worker) {
                        handle.mark_ready();
                    }
                }
                WorkerEvent::Finished { ticket, result, .. } => {
                    if let Some(handle) = self.handle_mut(worker) {
                        handle.finish();
                    }
                    if self.all_paths == (AllPaths::InFlight { ticket }) {
                        self.accept_page_list(result)?;
                    } else if let Some(pathname) = self.in_flight.remove(&ticket) {
                        self.record(pathname, result);
                    }
                }
                WorkerEvent::Failed { message, .. } => {
                    if let Some(handle) = self.handle_mut(worker) {
                        handle.retire();
                    }
                    warn!(
                        target = "application::build",
                        slot = worker.slot,
                        error = %message,
                        "Render thread unavailable"
                    );
                }
            }
        }
    }

    /// Hand work to every ready worker. Before the page list is known only
    /// the all-paths render is handed out.
    fn dispatch(&mut self) {
        if self.all_paths == AllPaths::Waiting {
            let Some(index) = self.workers.iter().position(WorkerHandle::is_ready) else {
                return;
            };
            let ticket = self.ticket();
            let task = RenderTask {
                ticket,
                input: self.input_for(ALL_PATHS_ROUTE),
            };
            if self.workers[index].assign(task).is_ok() {
                debug!(
                    target = "application::build",
                    slot = self.workers[index].id().slot,
                    "Resolving page list"
                );
                self.all_paths = AllPaths::InFlight { ticket };
            }
            return;
        }
        if self.all_paths != AllPaths::Resolved {
            return;
        }

        for index in 0..self.workers.len() {
            if !self.workers[index].is_ready() {
                continue;
            }
            let Some(pathname) = self.queue.pop() else {
                break;
            };
            let ticket = self.ticket();
            let task = RenderTask {
                ticket,
                input: self.input_for(&pathname),
            };
            match self.workers[index].assign(task) {
                Ok(()) => {
                    self.in_flight.insert(ticket, pathname);
                }
                Err(_) => self.queue.push(pathname),
            }
        }
    }

    fn accept_page_list(
        &mut self,
        result: Result<RenderOutcome, SessionError>,
    ) -> Result<(), BuildFailure> {
        let outcome = result.map_err(BuildFailure::AllPaths)?;
        let body = match outcome {
            RenderOutcome::ApiResponse(response) if (200..300).contains(&response.status_code) => {
                if response.is_base64 {
                    BASE64
                        .decode(&response.body)
                        .map_err(|err| BuildFailure::InvalidPageList(err.to_string()))?
                } else {
                    response.body.into_bytes()
                }
            }
            RenderOutcome::ApiResponse(response) => {
                return Err(BuildFailure::InvalidPageList(format!(
                    "status {}",
                    response.status_code
                )));
            }
            other => {
                return Err(BuildFailure::InvalidPageList(format!(
                    "expected a JSON response, got status {} page",
                    other.status_code()
                )));
            }
        };

        let list: PageList = serde_json::from_slice(&body)
            .map_err(|err| BuildFailure::InvalidPageList(err.to_string()))?;
        let (paths, routes) = match list {
            PageList::Paths(paths) => (paths, Vec::new()),
            PageList::Manifest { paths, routes } => (paths, routes),
        };

        if !routes.is_empty() {
            let patterns = routes
                .into_iter()
                .map(RoutePattern::try_from)
                .collect::<Result<Vec<_>, _>>()?;
            self.output
                .write_json(ROUTE_PATTERNS_FILE, &patterns)
                .map_err(BuildFailure::RoutePatterns)?;
            self.report.routes = patterns;
        }

        let unique: BTreeSet<String> = paths
            .iter()
            .map(|path| format!("/{}", path.trim_matches('/')))
            .collect();
        info!(
            target = "application::build",
            pages = unique.len(),
            routes = self.report.routes.len(),
            "Page list resolved"
        );
        self.queue = unique.into_iter().rev().collect();
        self.all_paths = AllPaths::Resolved;
        Ok(())
    }

    fn record(&mut self, pathname: String, result: Result<RenderOutcome, SessionError>) {
        let written = match result {
            Ok(outcome) => self
                .output
                .write(&pathname, &outcome)
                .map_err(|err| match err {
                    OutputError::ServerResponse { .. } => None,
                    other => Some(vec![BuildError::new(
                        "Output failed",
                        pathname.as_str(),
                        other.to_string(),
                    )]),
                }),
            Err(err) => Err(Some(err.diagnostics(&pathname))),
        };

        match written {
            Ok(artifacts) => {
                counter!("frostline_pages_rendered_total").increment(1);
                debug!(
                    target = "application::build",
                    pathname = %pathname,
                    regions = artifacts.regions,
                    "Page written"
                );
                self.report.rendered.push(RenderedPage {
                    pathname,
                    artifacts,
                });
            }
            Err(None) => {
                debug!(
                    target = "application::build",
                    pathname = %pathname,
                    "Skipping server response"
                );
                self.report.skipped.push(pathname);
            }
            Err(Some(errors)) => {
                counter!("frostline_pages_failed_total").increment(1);
                warn!(
                    target = "application::build",
                    pathname = %pathname,
                    errors = errors.len(),
                    "Page failed"
                );
                self.report.failures.push(PageFailure { pathname, errors });
            }
        }
    }

    fn input_for(&self, pathname: &str) -> RenderInput {
        let raw_url = format!("{}{}", self.base_path.trim_end_matches('/'), pathname);
        RenderInput::new(RenderRequest::get(raw_url)).with_pathname(pathname)
    }

    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn handle_mut(&mut self, id: WorkerId) -> Option<&mut WorkerHandle> {
        self.workers.iter_mut().find(|worker| worker.id() == id)
    }

    fn stalled(&self, reason: &str) -> BuildFailure {
        if self.all_paths != AllPaths::Resolved {
            return BuildFailure::NoWorkers(reason.to_string());
        }
        BuildFailure::Stalled(self.queue.len() + self.in_flight.len())
    }

    fn shutdown(&mut self) {
        for worker in &mut self.workers {
            if let Some(thread) = worker.retire()
                && thread.join().is_err()
            {
                warn!(
                    target = "application::build",
                    slot = worker.id().slot,
                    "Render thread panicked"
                );
            }
        }
    }
}
