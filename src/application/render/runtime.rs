//! Runtime instances driven by a render session.
//!
//! A [`Runtime`] spawns one fresh instance per session and hands back a
//! [`RuntimeChannel`]: an outgoing sender for host messages, a receiver the
//! session awaits for runtime messages, and the tasks that keep the instance
//! alive. Tearing the channel down aborts those tasks, which kills the
//! instance.

use std::{
    future::Future,
    io,
    path::{Path, PathBuf},
    process::Stdio,
};

use frostline_protocol::{FromRuntime, InitPayload, ToRuntime};
use serde::Deserialize;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::Command,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to read runtime manifest `{path}`: {source}")]
    Manifest { path: PathBuf, source: io::Error },
    #[error("runtime manifest `{path}` is invalid: {message}")]
    InvalidManifest { path: PathBuf, message: String },
    #[error("failed to start runtime `{command}`: {source}")]
    Spawn { command: String, source: io::Error },
    #[error("runtime `{command}` did not expose {stream}")]
    MissingPipe {
        command: String,
        stream: &'static str,
    },
}

/// A message from a runtime, or the reason it could not be read.
pub type Incoming = Result<FromRuntime, String>;

pub struct RuntimeChannel {
    pub outgoing: mpsc::UnboundedSender<ToRuntime>,
    pub incoming: mpsc::UnboundedReceiver<Incoming>,
    tasks: Vec<JoinHandle<()>>,
}

impl RuntimeChannel {
    pub fn new(
        outgoing: mpsc::UnboundedSender<ToRuntime>,
        incoming: mpsc::UnboundedReceiver<Incoming>,
    ) -> Self {
        Self {
            outgoing,
            incoming,
            tasks: Vec::new(),
        }
    }

    /// Tie a task's lifetime to this channel.
    pub fn attach(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Stop receiving and kill the instance. Returns messages that were
    /// already buffered when the channel closed.
    pub fn teardown(mut self) -> Vec<Incoming> {
        self.incoming.close();
        let mut buffered = Vec::new();
        while let Ok(message) = self.incoming.try_recv() {
            buffered.push(message);
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        buffered
    }
}

impl Drop for RuntimeChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub trait Runtime: Send + Sync {
    /// Key the compiled runtime was built against.
    fn compatibility_key(&self) -> Result<u32, RuntimeError>;

    /// Start a fresh instance. The first message it receives is `Init(init)`.
    /// Must be called from within a tokio runtime.
    fn spawn(&self, init: InitPayload) -> Result<RuntimeChannel, RuntimeError>;
}

/// In-process runtime backed by an async function, for embedders and tests.
///
/// The function receives the init payload, a sender for its own messages and
/// a receiver for host replies.
pub struct FnRuntime<F> {
    key: u32,
    body: F,
}

impl<F, Fut> FnRuntime<F>
where
    F: Fn(InitPayload, mpsc::UnboundedSender<Incoming>, mpsc::UnboundedReceiver<ToRuntime>) -> Fut
        + Send
        + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub fn new(key: u32, body: F) -> Self {
        Self { key, body }
    }
}

impl<F, Fut> Runtime for FnRuntime<F>
where
    F: Fn(InitPayload, mpsc::UnboundedSender<Incoming>, mpsc::UnboundedReceiver<ToRuntime>) -> Fut
        + Send
        + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn compatibility_key(&self) -> Result<u32, RuntimeError> {
        Ok(self.key)
    }

    fn spawn(&self, init: InitPayload) -> Result<RuntimeChannel, RuntimeError> {
        let (to_runtime, from_host) = mpsc::unbounded_channel();
        let (to_host, from_runtime) = mpsc::unbounded_channel();
        let mut channel = RuntimeChannel::new(to_runtime, from_runtime);
        channel.attach(tokio::spawn((self.body)(init, to_host, from_host)));
        Ok(channel)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    compatibility_key: u32,
}

/// A runtime module executed by an interpreter, speaking newline-delimited
/// JSON over stdin/stdout. Stderr lines are forwarded to tracing.
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    command: PathBuf,
    module: PathBuf,
    manifest: PathBuf,
    cwd: PathBuf,
}

impl ProcessRuntime {
    pub fn new(
        command: impl Into<PathBuf>,
        module: impl Into<PathBuf>,
        manifest: impl Into<PathBuf>,
        cwd: impl Into<PathBuf>,
    ) -> Self {
        Self {
            command: command.into(),
            module: module.into(),
            manifest: manifest.into(),
            cwd: cwd.into(),
        }
    }

    pub fn module(&self) -> &Path {
        &self.module
    }

    fn label(&self) -> String {
        format!("{} {}", self.command.display(), self.module.display())
    }
}

impl Runtime for ProcessRuntime {
    fn compatibility_key(&self) -> Result<u32, RuntimeError> {
        let path = self.cwd.join(&self.manifest);
        let raw = std::fs::read(&path).map_err(|source| RuntimeError::Manifest {
            path: path.clone(),
            source,
        })?;
        let manifest: Manifest =
            serde_json::from_slice(&raw).map_err(|err| RuntimeError::InvalidManifest {
                path,
                message: err.to_string(),
            })?;
        Ok(manifest.compatibility_key)
    }

    fn spawn(&self, init: InitPayload) -> Result<RuntimeChannel, RuntimeError> {
        let label = self.label();
        let mut child = Command::new(&self.command)
            .arg(&self.module)
            .current_dir(&self.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                command: label.clone(),
                source,
            })?;

        let missing = |stream| RuntimeError::MissingPipe {
            command: label.clone(),
            stream,
        };
        let mut stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (to_runtime, mut from_host) = mpsc::unbounded_channel::<ToRuntime>();
        let (to_host, from_runtime) = mpsc::unbounded_channel::<Incoming>();
        let mut channel = RuntimeChannel::new(to_runtime, from_runtime);

        let pathname = init.pathname.clone();
        // Cannot fail: the receiver is held by the writer task below.
        let _ = channel.outgoing.send(ToRuntime::Init(init));

        channel.attach(tokio::spawn(async move {
            while let Some(message) = from_host.recv().await {
                let mut line = match serde_json::to_vec(&message) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(
                            target = "application::render::runtime",
                            error = %err,
                            "Failed to encode host message"
                        );
                        continue;
                    }
                };
                line.push(b'\n');
                if stdin.write_all(&line).await.is_err() || stdin.flush().await.is_err() {
                    break;
                }
            }
        }));

        let reader_label = label.clone();
        channel.attach(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => {
                        let message = serde_json::from_str::<FromRuntime>(&line)
                            .map_err(|err| format!("{err}: {}", truncate(&line, 200)));
                        if to_host.send(message).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = to_host.send(Err(format!("failed to read runtime output: {err}")));
                        break;
                    }
                }
            }
            drop(to_host);
            match child.wait().await {
                Ok(status) => debug!(
                    target = "application::render::runtime",
                    runtime = %reader_label,
                    pathname = %pathname,
                    exit_code = status.code(),
                    "Runtime instance exited"
                ),
                Err(err) => warn!(
                    target = "application::render::runtime",
                    runtime = %reader_label,
                    error = %err,
                    "Failed to reap runtime instance"
                ),
            }
        }));

        channel.attach(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(target = "frostline::runtime", runtime = %label, "{line}");
            }
        }));

        Ok(channel)
    }
}

fn truncate(line: &str, max: usize) -> &str {
    match line.char_indices().nth(max) {
        Some((index, _)) => &line[..index],
        None => line,
    }
}
