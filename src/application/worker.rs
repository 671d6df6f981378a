//! Render threads shared by the build orchestrator and the dev pool.
//!
//! Each worker is one OS thread running a current-thread tokio runtime and
//! owning its own [`JobResolver`]. Workers talk to their coordinator only
//! through channels: tasks in, [`WorkerEvent`]s out. Dropping a worker's task
//! sender retires it once its current render finishes.

use std::{
    any::Any,
    io,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use frostline_protocol::RenderOutcome;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::application::{
    jobs::{JobResolver, ResolverConfig},
    render::{RenderContext, RenderInput, Runtime, SessionError, render},
};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Ready,
    Busy,
    /// Busy when the pool was invalidated; recycled once it returns.
    Stale,
    Terminating,
}

/// `slot` is the pool position; `instance` changes every time a slot is respawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId {
    pub slot: usize,
    pub instance: u64,
}

/// Everything a worker thread needs to build its own render context.
pub struct WorkerSpec {
    pub resolver: ResolverConfig,
    pub runtime: Arc<dyn Runtime>,
    pub base_path: String,
    pub session_timeout: Option<Duration>,
}

pub struct RenderTask {
    pub ticket: u64,
    pub input: RenderInput,
}

pub enum WorkerEvent {
    Ready(WorkerId),
    Finished {
        worker: WorkerId,
        ticket: u64,
        result: Result<RenderOutcome, SessionError>,
    },
    /// The thread could not set itself up and has exited.
    Failed { worker: WorkerId, message: String },
}

impl WorkerEvent {
    pub fn worker(&self) -> WorkerId {
        match self {
            WorkerEvent::Ready(worker)
            | WorkerEvent::Finished { worker, .. }
            | WorkerEvent::Failed { worker, .. } => *worker,
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to start render thread {slot}: {source}")]
pub struct WorkerError {
    pub slot: usize,
    #[source]
    pub source: io::Error,
}

pub struct WorkerHandle {
    id: WorkerId,
    state: WorkerState,
    tasks: Option<mpsc::UnboundedSender<RenderTask>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn(
        slot: usize,
        spec: Arc<WorkerSpec>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Self, WorkerError> {
        let id = WorkerId {
            slot,
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
        };
        let (tasks, inbox) = mpsc::unbounded_channel();
        let thread = thread::Builder::new()
            .name(format!("frostline-render-{slot}"))
            .spawn(move || run_worker(id, spec, inbox, events))
            .map_err(|source| WorkerError { slot, source })?;

        Ok(Self {
            id,
            state: WorkerState::Starting,
            tasks: Some(tasks),
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state != WorkerState::Terminating
    }

    pub fn is_ready(&self) -> bool {
        self.state == WorkerState::Ready
    }

    pub fn mark_ready(&mut self) {
        if self.state == WorkerState::Starting {
            self.state = WorkerState::Ready;
        }
    }

    /// Hand a task to a ready worker. Gives the task back if the worker is not
    /// ready or its thread is gone.
    pub fn assign(&mut self, task: RenderTask) -> Result<(), RenderTask> {
        if self.state != WorkerState::Ready {
            return Err(task);
        }
        let Some(tasks) = &self.tasks else {
            return Err(task);
        };
        match tasks.send(task) {
            Ok(()) => {
                self.state = WorkerState::Busy;
                Ok(())
            }
            Err(mpsc::error::SendError(task)) => {
                self.state = WorkerState::Terminating;
                Err(task)
            }
        }
    }

    /// Record a finished render. Returns `true` when the worker went stale
    /// while busy and must be recycled instead of reused.
    pub fn finish(&mut self) -> bool {
        match self.state {
            WorkerState::Stale => true,
            WorkerState::Busy => {
                self.state = WorkerState::Ready;
                false
            }
            _ => false,
        }
    }

    pub fn mark_stale(&mut self) {
        if self.state == WorkerState::Busy {
            self.state = WorkerState::Stale;
        }
    }

    /// Close the task channel. The thread exits after its current render.
    pub fn retire(&mut self) -> Option<thread::JoinHandle<()>> {
        self.state = WorkerState::Terminating;
        self.tasks = None;
        self.thread.take()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.tasks = None;
    }
}

fn run_worker(
    id: WorkerId,
    spec: Arc<WorkerSpec>,
    mut inbox: mpsc::UnboundedReceiver<RenderTask>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let fail = |message: String| {
        error!(
            target = "application::worker",
            slot = id.slot,
            instance = id.instance,
            error = %message,
            "Render thread failed to start"
        );
        let _ = events.send(WorkerEvent::Failed {
            worker: id,
            message,
        });
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => return fail(format!("failed to build async runtime: {err}")),
    };

    runtime.block_on(async {
        // The HTTP client is bound to this thread's runtime.
        let jobs = match JobResolver::new(spec.resolver.clone()) {
            Ok(jobs) => jobs,
            Err(err) => return fail(err.to_string()),
        };
        debug!(
            target = "application::worker",
            slot = id.slot,
            instance = id.instance,
            "Render thread ready"
        );
        if events.send(WorkerEvent::Ready(id)).is_err() {
            return;
        }

        while let Some(task) = inbox.recv().await {
            let ctx = RenderContext {
                jobs: &jobs,
                runtime: spec.runtime.as_ref(),
                base_path: &spec.base_path,
                session_timeout: spec.session_timeout,
            };
            let result = match AssertUnwindSafe(render(ctx, task.input)).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(
                        target = "application::worker",
                        slot = id.slot,
                        instance = id.instance,
                        ticket = task.ticket,
                        error = %message,
                        "Render panicked"
                    );
                    Err(SessionError::Panicked(message))
                }
            };
            let finished = WorkerEvent::Finished {
                worker: id,
                ticket: task.ticket,
                result,
            };
            if events.send(finished).is_err() {
                break;
            }
        }
    });

    debug!(
        target = "application::worker",
        slot = id.slot,
        instance = id.instance,
        "Render thread exited"
    );
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use frostline_protocol::{
        ApiResponse, ApiResponseKind, COMPATIBILITY_KEY, FromRuntime, RenderMode, RequestPayload,
    };
    use tempfile::TempDir;

    use super::*;
    use crate::application::render::FnRuntime;

    fn spec(dir: &TempDir) -> Arc<WorkerSpec> {
        let runtime = FnRuntime::new(COMPATIBILITY_KEY, |init, out, _| async move {
            let _ = out.send(Ok(FromRuntime::ApiResponse {
                response: ApiResponse {
                    subkind: ApiResponseKind::ServerResponse,
                    status_code: 200,
                    headers: Vec::new(),
                    body: init.pathname,
                    is_base64: false,
                },
            }));
        });
        Arc::new(WorkerSpec {
            resolver: ResolverConfig::new(RenderMode::Build, dir.path()).quiet(true),
            runtime: Arc::new(runtime),
            base_path: "/".into(),
            session_timeout: None,
        })
    }

    #[tokio::test]
    async fn worker_reports_ready_then_renders() {
        let dir = TempDir::new().expect("temp dir");
        let (events, mut received) = mpsc::unbounded_channel();
        let mut worker = WorkerHandle::spawn(0, spec(&dir), events).expect("spawn");
        assert_eq!(worker.state(), WorkerState::Starting);

        let ready = received.recv().await.expect("ready event");
        assert!(matches!(ready, WorkerEvent::Ready(id) if id == worker.id()));
        worker.mark_ready();

        let input = RenderInput::new(RequestPayload::get("/about"));
        assert!(worker.assign(RenderTask { ticket: 7, input }).is_ok());
        assert_eq!(worker.state(), WorkerState::Busy);

        let WorkerEvent::Finished { ticket, result, .. } =
            received.recv().await.expect("finished event")
        else {
            panic!("expected finished event");
        };
        assert_eq!(ticket, 7);
        let outcome = result.expect("rendered");
        assert!(matches!(outcome, RenderOutcome::ApiResponse(ref r) if r.body == "/about"));
        assert!(!worker.finish());
        assert!(worker.is_ready());

        if let Some(thread) = worker.retire() {
            tokio::task::spawn_blocking(move || thread.join())
                .await
                .expect("join task")
                .expect("thread exits cleanly");
        }
    }

    #[tokio::test]
    async fn stale_worker_is_recycled_after_finishing() {
        let dir = TempDir::new().expect("temp dir");
        let (events, mut received) = mpsc::unbounded_channel();
        let mut worker = WorkerHandle::spawn(1, spec(&dir), events).expect("spawn");
        let _ = received.recv().await;
        worker.mark_ready();

        let input = RenderInput::new(RequestPayload::get("/"));
        assert!(worker.assign(RenderTask { ticket: 1, input }).is_ok());
        worker.mark_stale();
        assert_eq!(worker.state(), WorkerState::Stale);

        let _ = received.recv().await;
        assert!(worker.finish());

        let input = RenderInput::new(RequestPayload::get("/"));
        assert!(worker.assign(RenderTask { ticket: 2, input }).is_err());
    }
}
