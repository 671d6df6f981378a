//! User-supplied backend tasks looked up by name.
//!
//! A [`TaskModule`] exposes named exports. Each render session resolves the
//! module's exports once into [`Capabilities`]; every failure mode (missing
//! module, unknown name, non-callable export, synchronous throw, asynchronous
//! rejection) becomes its own [`JobErrorTag`].

use std::{
    collections::BTreeMap,
    future::Future,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use async_trait::async_trait;
use frostline_protocol::{JobError, JobErrorTag};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;

/// Future returned by a task that did not throw; an `Err` is a rejection.
pub type TaskFuture = BoxFuture<'static, Result<Value, String>>;

/// `Err` from the outer result means the task threw before producing a future.
pub type TaskFn = Arc<dyn Fn(Value, TaskContext) -> Result<TaskFuture, String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContext {
    pub cwd: String,
    pub quiet: bool,
    pub env: BTreeMap<String, String>,
}

impl TaskContext {
    pub fn from_process(cwd: &Path, quiet: bool) -> Self {
        Self {
            cwd: cwd.to_string_lossy().into_owned(),
            quiet,
            env: std::env::vars().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportKind {
    Function,
    Other(String),
}

#[derive(Debug, Error)]
pub enum TaskLoadError {
    #[error("custom task module `{module}` was not found")]
    Missing { module: String },
    #[error("custom task module `{module}` could not be loaded: {message}")]
    Invalid { module: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    Threw(String),
    Rejected(String),
}

#[async_trait]
pub trait TaskModule: Send + Sync {
    fn describe(&self) -> String;

    async fn exports(&self) -> Result<BTreeMap<String, ExportKind>, TaskLoadError>;

    async fn call(
        &self,
        name: &str,
        input: Value,
        context: TaskContext,
    ) -> Result<Value, CallFailure>;
}

/// Exports of one task module, resolved once per render session.
pub struct Capabilities {
    module: Arc<dyn TaskModule>,
    exports: Result<BTreeMap<String, ExportKind>, String>,
}

impl Capabilities {
    pub async fn load(module: Arc<dyn TaskModule>) -> Self {
        let exports = module.exports().await.map_err(|err| err.to_string());
        debug!(
            target = "application::jobs::custom",
            module = %module.describe(),
            loaded = exports.is_ok(),
            exports = exports.as_ref().map_or(0, BTreeMap::len),
            "Resolved custom task capabilities"
        );
        Self { module, exports }
    }

    pub async fn invoke(
        &self,
        name: &str,
        input: Value,
        context: TaskContext,
    ) -> Result<Value, JobError> {
        let exports = self.exports.as_ref().map_err(|message| {
            JobError::new(JobErrorTag::MissingCustomTaskModule, message.clone())
        })?;

        match exports.get(name) {
            None => Err(JobError::new(
                JobErrorTag::CustomTaskNotDefined,
                format!(
                    "custom task `{name}` is not exported by {}",
                    self.module.describe()
                ),
            )
            .with_detail(json!({ "available": exports.keys().collect::<Vec<_>>() }))),
            Some(ExportKind::Other(kind)) => Err(JobError::new(
                JobErrorTag::CustomTaskNotAFunction,
                format!("custom task `{name}` is a {kind}, not a function"),
            )),
            Some(ExportKind::Function) => match self.module.call(name, input, context).await {
                Ok(value) => Ok(value),
                Err(CallFailure::Threw(message)) => Err(JobError::new(
                    JobErrorTag::CustomTaskThrew,
                    format!("custom task `{name}` threw: {message}"),
                )),
                Err(CallFailure::Rejected(message)) => Err(JobError::new(
                    JobErrorTag::CustomTaskRejected,
                    format!("custom task `{name}` rejected: {message}"),
                )),
            },
        }
    }
}

enum StaticExport {
    Function(TaskFn),
    Other(String),
}

/// In-process task module for embedders.
#[derive(Default)]
pub struct StaticTaskModule {
    exports: BTreeMap<String, StaticExport>,
}

impl StaticTaskModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async task; an `Err` from its future is a rejection.
    pub fn with_async<F, Fut>(mut self, name: impl Into<String>, task: F) -> Self
    where
        F: Fn(Value, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let task: TaskFn = Arc::new(
            move |input: Value, context: TaskContext| -> Result<TaskFuture, String> {
                Ok(Box::pin(task(input, context)))
            },
        );
        self.exports
            .insert(name.into(), StaticExport::Function(task));
        self
    }

    /// Register a task with full control over throwing versus rejecting.
    pub fn with_fn(mut self, name: impl Into<String>, task: TaskFn) -> Self {
        self.exports
            .insert(name.into(), StaticExport::Function(task));
        self
    }

    /// Register an export that is not callable, e.g. a constant.
    pub fn with_value(mut self, name: impl Into<String>, kind: impl Into<String>) -> Self {
        self.exports
            .insert(name.into(), StaticExport::Other(kind.into()));
        self
    }
}

#[async_trait]
impl TaskModule for StaticTaskModule {
    fn describe(&self) -> String {
        "in-process task module".to_string()
    }

    async fn exports(&self) -> Result<BTreeMap<String, ExportKind>, TaskLoadError> {
        Ok(self
            .exports
            .iter()
            .map(|(name, export)| {
                let kind = match export {
                    StaticExport::Function(_) => ExportKind::Function,
                    StaticExport::Other(kind) => ExportKind::Other(kind.clone()),
                };
                (name.clone(), kind)
            })
            .collect())
    }

    async fn call(
        &self,
        name: &str,
        input: Value,
        context: TaskContext,
    ) -> Result<Value, CallFailure> {
        match self.exports.get(name) {
            Some(StaticExport::Function(task)) => match task(input, context) {
                Ok(future) => future.await.map_err(CallFailure::Rejected),
                Err(thrown) => Err(CallFailure::Threw(thrown)),
            },
            Some(StaticExport::Other(kind)) => {
                Err(CallFailure::Threw(format!("`{name}` is a {kind}")))
            }
            None => Err(CallFailure::Threw(format!("`{name}` is not defined"))),
        }
    }
}

/// Task module backed by an executable.
///
/// `<module> exports` prints a JSON object mapping export names to their type
/// (`"function"` for callables). `<module> call <name>` reads
/// `{"input", "context"}` on stdin and prints `{"ok": value}`,
/// `{"threw": message}` or `{"rejected": message}`.
#[derive(Debug, Clone)]
pub struct ScriptTaskModule {
    path: PathBuf,
    root: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum CallReply {
    Ok(Value),
    Threw(String),
    Rejected(String),
}

impl ScriptTaskModule {
    pub fn new(path: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            root: root.into(),
        }
    }

    fn resolved_path(&self) -> PathBuf {
        if self.path.is_absolute() {
            self.path.clone()
        } else {
            self.root.join(&self.path)
        }
    }
}

#[async_trait]
impl TaskModule for ScriptTaskModule {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn exports(&self) -> Result<BTreeMap<String, ExportKind>, TaskLoadError> {
        let module = self.describe();
        let path = self.resolved_path();
        if !path.is_file() {
            return Err(TaskLoadError::Missing { module });
        }

        let output = Command::new(&path)
            .arg("exports")
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => TaskLoadError::Missing {
                    module: module.clone(),
                },
                _ => TaskLoadError::Invalid {
                    module: module.clone(),
                    message: err.to_string(),
                },
            })?;
        if !output.status.success() {
            return Err(TaskLoadError::Invalid {
                module,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let listing: BTreeMap<String, String> = serde_json::from_slice(&output.stdout)
            .map_err(|err| TaskLoadError::Invalid {
                module: module.clone(),
                message: format!("export listing is not a JSON object: {err}"),
            })?;
        Ok(listing
            .into_iter()
            .map(|(name, kind)| {
                let kind = if kind == "function" {
                    ExportKind::Function
                } else {
                    ExportKind::Other(kind)
                };
                (name, kind)
            })
            .collect())
    }

    async fn call(
        &self,
        name: &str,
        input: Value,
        context: TaskContext,
    ) -> Result<Value, CallFailure> {
        let request = serde_json::to_vec(&json!({ "input": input, "context": context }))
            .map_err(|err| CallFailure::Threw(err.to_string()))?;

        let mut child = Command::new(self.resolved_path())
            .arg("call")
            .arg(name)
            .current_dir(&self.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| CallFailure::Threw(err.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&request)
                .await
                .map_err(|err| CallFailure::Threw(err.to_string()))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|err| CallFailure::Threw(err.to_string()))?;

        match serde_json::from_slice::<CallReply>(&output.stdout) {
            Ok(CallReply::Ok(value)) => Ok(value),
            Ok(CallReply::Threw(message)) => Err(CallFailure::Threw(message)),
            Ok(CallReply::Rejected(message)) => Err(CallFailure::Rejected(message)),
            Err(_) if !output.status.success() => Err(CallFailure::Threw(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
            Err(err) => Err(CallFailure::Threw(format!("unreadable task reply: {err}"))),
        }
    }
}
