//! Render thread pool for the dev server.
//!
//! Same workers as a build, tuned for latency: requests queue as pending
//! resolvers and go to whichever thread is idle, several at once when several
//! are idle. A source change respawns idle threads immediately and marks busy
//! ones stale so they are recycled when their render returns.

use std::{
    collections::{HashMap, VecDeque},
    num::NonZeroUsize,
    sync::Arc,
};

use frostline_protocol::RenderOutcome;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::application::{
    render::{RenderInput, SessionError},
    worker::{RenderTask, WorkerError, WorkerEvent, WorkerHandle, WorkerId, WorkerSpec, WorkerState},
};

#[derive(Debug, Error)]
pub enum DevPoolError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("no render thread is available")]
    Unavailable,
    #[error("render pool has shut down")]
    Closed,
}

type Reply = oneshot::Sender<Result<RenderOutcome, DevPoolError>>;

enum PoolCommand {
    Render { input: RenderInput, reply: Reply },
    Invalidate,
    Status {
        reply: oneshot::Sender<Vec<(WorkerId, WorkerState)>>,
    },
}

/// Handle to a running pool. Cheap to clone; the pool stops once every
/// handle is dropped.
#[derive(Clone)]
pub struct DevPool {
    commands: mpsc::UnboundedSender<PoolCommand>,
}

impl DevPool {
    /// Spawn `size` render threads and the coordinator task. Must be called
    /// from within a tokio runtime.
    pub fn start(spec: WorkerSpec, size: NonZeroUsize) -> Result<Self, WorkerError> {
        let spec = Arc::new(spec);
        let (events_tx, events) = mpsc::unbounded_channel();
        let workers = (0..size.get())
            .map(|slot| WorkerHandle::spawn(slot, Arc::clone(&spec), events_tx.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        let (commands, inbox) = mpsc::unbounded_channel();

        let coordinator = DevCoordinator {
            spec,
            workers,
            pending: VecDeque::new(),
            replies: HashMap::new(),
            next_ticket: 0,
            events_tx,
        };
        tokio::spawn(coordinator.run(inbox, events));
        info!(
            target = "application::dev",
            workers = size.get(),
            "Dev render pool started"
        );
        Ok(Self { commands })
    }

    pub async fn render(&self, input: RenderInput) -> Result<RenderOutcome, DevPoolError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(PoolCommand::Render { input, reply })
            .map_err(|_| DevPoolError::Closed)?;
        response.await.map_err(|_| DevPoolError::Closed)?
    }

    /// Source changed: recycle every render thread.
    pub fn invalidate(&self) {
        let _ = self.commands.send(PoolCommand::Invalidate);
    }

    pub async fn status(&self) -> Result<Vec<(WorkerId, WorkerState)>, DevPoolError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(PoolCommand::Status { reply })
            .map_err(|_| DevPoolError::Closed)?;
        response.await.map_err(|_| DevPoolError::Closed)
    }
}

struct Pending {
    input: RenderInput,
    reply: Reply,
}

struct DevCoordinator {
    spec: Arc<WorkerSpec>,
    workers: Vec<WorkerHandle>,
    pending: VecDeque<Pending>,
    replies: HashMap<u64, Reply>,
    next_ticket: u64,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl DevCoordinator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<PoolCommand>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
            self.dispatch();
        }

        for worker in &mut self.workers {
            worker.retire();
        }
        for pending in self.pending.drain(..) {
            let _ = pending.reply.send(Err(DevPoolError::Closed));
        }
        debug!(target = "application::dev", "Dev render pool stopped");
    }

    fn handle_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Render { input, reply } => {
                self.pending.push_back(Pending { input, reply });
            }
            PoolCommand::Invalidate => self.invalidate(),
            PoolCommand::Status { reply } => {
                let states = self
                    .workers
                    .iter()
                    .map(|worker| (worker.id(), worker.state()))
                    .collect();
                let _ = reply.send(states);
            }
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        let worker = event.worker();
        let Some(index) = self.workers.iter().position(|handle| handle.id() == worker) else {
            // Events from a retired instance only matter for in-flight replies.
            if let WorkerEvent::Finished { ticket, result, .. } = event {
                self.reply(ticket, result);
            }
            return;
        };

        match event {
            WorkerEvent::Ready(_) => self.workers[index].mark_ready(),
            WorkerEvent::Finished { ticket, result, .. } => {
                self.reply(ticket, result);
                if self.workers[index].finish() {
                    self.respawn(index);
                }
            }
            WorkerEvent::Failed { message, .. } => {
                self.workers[index].retire();
                error!(
                    target = "application::dev",
                    slot = worker.slot,
                    error = %message,
                    "Render thread unavailable"
                );
            }
        }
    }

    fn invalidate(&mut self) {
        let mut recycled = 0;
        let mut marked = 0;
        for index in 0..self.workers.len() {
            match self.workers[index].state() {
                WorkerState::Ready | WorkerState::Starting => {
                    self.respawn(index);
                    recycled += 1;
                }
                WorkerState::Busy => {
                    self.workers[index].mark_stale();
                    marked += 1;
                }
                WorkerState::Stale | WorkerState::Terminating => {}
            }
        }
        info!(
            target = "application::dev",
            recycled,
            stale = marked,
            "Render threads invalidated"
        );
    }

    fn respawn(&mut self, index: usize) {
        let slot = self.workers[index].id().slot;
        self.workers[index].retire();
        match WorkerHandle::spawn(slot, Arc::clone(&self.spec), self.events_tx.clone()) {
            Ok(handle) => self.workers[index] = handle,
            Err(err) => error!(
                target = "application::dev",
                slot,
                error = %err,
                "Failed to respawn render thread"
            ),
        }
    }

    /// Hand pending requests to every idle thread in one pass.
    fn dispatch(&mut self) {
        for index in 0..self.workers.len() {
            if self.pending.is_empty() {
                break;
            }
            if !self.workers[index].is_ready() {
                continue;
            }
            let Some(Pending { input, reply }) = self.pending.pop_front() else {
                break;
            };
            self.next_ticket += 1;
            let ticket = self.next_ticket;
            match self.workers[index].assign(RenderTask { ticket, input }) {
                Ok(()) => {
                    self.replies.insert(ticket, reply);
                }
                Err(task) => {
                    warn!(
                        target = "application::dev",
                        slot = self.workers[index].id().slot,
                        "Render thread went away; respawning"
                    );
                    self.pending.push_front(Pending {
                        input: task.input,
                        reply,
                    });
                    self.respawn(index);
                }
            }
        }

        if !self.pending.is_empty() && !self.workers.iter().any(WorkerHandle::is_live) {
            for pending in self.pending.drain(..) {
                let _ = pending.reply.send(Err(DevPoolError::Unavailable));
            }
        }
    }

    fn reply(&mut self, ticket: u64, result: Result<RenderOutcome, SessionError>) {
        if let Some(reply) = self.replies.remove(&ticket) {
            let _ = reply.send(result.map_err(DevPoolError::from));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use frostline_protocol::{
        ApiResponse, ApiResponseKind, COMPATIBILITY_KEY, FromRuntime, RenderMode, RequestPayload,
    };
    use tempfile::TempDir;
    use tokio::{sync::Barrier, time::timeout};

    use super::*;
    use crate::application::{
        jobs::ResolverConfig,
        render::{FnRuntime, Runtime},
    };

    fn respond(body: String) -> FromRuntime {
        FromRuntime::ApiResponse {
            response: ApiResponse {
                subkind: ApiResponseKind::ServerResponse,
                status_code: 200,
                headers: Vec::new(),
                body,
                is_base64: false,
            },
        }
    }

    fn pool(dir: &TempDir, runtime: impl Runtime + 'static, size: usize) -> DevPool {
        let spec = WorkerSpec {
            resolver: ResolverConfig::new(RenderMode::Dev, dir.path()).quiet(true),
            runtime: Arc::new(runtime),
            base_path: "/".into(),
            session_timeout: None,
        };
        DevPool::start(spec, NonZeroUsize::new(size).expect("non-zero")).expect("pool")
    }

    #[tokio::test]
    async fn idle_threads_serve_requests_in_parallel() {
        let dir = TempDir::new().expect("temp dir");
        let barrier = Arc::new(Barrier::new(2));
        let runtime = FnRuntime::new(COMPATIBILITY_KEY, move |init, out, _| {
            let barrier = Arc::clone(&barrier);
            async move {
                barrier.wait().await;
                let _ = out.send(Ok(respond(init.pathname)));
            }
        });
        let pool = pool(&dir, runtime, 2);

        let first = pool.render(RenderInput::new(RequestPayload::get("/one")));
        let second = pool.render(RenderInput::new(RequestPayload::get("/two")));
        let (first, second) = timeout(Duration::from_secs(10), async { tokio::join!(first, second) })
            .await
            .expect("both renders complete together");

        assert!(matches!(first, Ok(RenderOutcome::ApiResponse(ref r)) if r.body == "/one"));
        assert!(matches!(second, Ok(RenderOutcome::ApiResponse(ref r)) if r.body == "/two"));
    }

    #[tokio::test]
    async fn invalidation_respawns_idle_threads() {
        let dir = TempDir::new().expect("temp dir");
        let runtime = FnRuntime::new(COMPATIBILITY_KEY, |init, out, _| async move {
            let _ = out.send(Ok(respond(init.pathname)));
        });
        let pool = pool(&dir, runtime, 2);

        pool.render(RenderInput::new(RequestPayload::get("/")))
            .await
            .expect("warm render");
        let before = pool.status().await.expect("status");
        pool.invalidate();
        let after = pool.status().await.expect("status");

        for ((old, _), (new, _)) in before.iter().zip(&after) {
            assert_eq!(old.slot, new.slot);
            assert_ne!(old.instance, new.instance);
        }

        let outcome = pool
            .render(RenderInput::new(RequestPayload::get("/after")))
            .await
            .expect("render after invalidation");
        assert!(matches!(outcome, RenderOutcome::ApiResponse(ref r) if r.body == "/after"));
    }

    #[tokio::test]
    async fn busy_thread_is_recycled_after_its_render() {
        let dir = TempDir::new().expect("temp dir");
        let gate = Arc::new(tokio::sync::Notify::new());
        let release = Arc::clone(&gate);
        let runtime = FnRuntime::new(COMPATIBILITY_KEY, move |init, out, _| {
            let gate = Arc::clone(&gate);
            async move {
                if init.pathname == "/slow" {
                    gate.notified().await;
                }
                let _ = out.send(Ok(respond(init.pathname)));
            }
        });
        let pool = pool(&dir, runtime, 1);

        let slow = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.render(RenderInput::new(RequestPayload::get("/slow")))
                    .await
            })
        };
        let busy = loop {
            let status = pool.status().await.expect("status");
            if status[0].1 == WorkerState::Busy {
                break status[0].0;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        pool.invalidate();
        assert_eq!(pool.status().await.expect("status")[0].1, WorkerState::Stale);

        release.notify_one();
        let outcome = slow.await.expect("join").expect("slow render");
        assert!(matches!(outcome, RenderOutcome::ApiResponse(ref r) if r.body == "/slow"));

        let recycled = pool.status().await.expect("status")[0].0;
        assert_ne!(recycled.instance, busy.instance);
    }
}
