//! Job requests emitted by a runtime and the normalized responses sent back.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A job the runtime wants the host to perform.
///
/// On the wire: `{"hash", "kind": "http"}` or
/// `{"hash", "kind": "internal", "name": "read-file"}`, each with an optional
/// `payload` object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPendingJob", into = "RawPendingJob")]
pub struct PendingJob {
    pub hash: String,
    pub kind: JobKind,
    pub payload: Value,
}

impl PendingJob {
    pub fn http(hash: impl Into<String>, payload: Value) -> Self {
        Self {
            hash: hash.into(),
            kind: JobKind::Http,
            payload,
        }
    }

    pub fn internal(hash: impl Into<String>, job: InternalJob, payload: Value) -> Self {
        Self {
            hash: hash.into(),
            kind: JobKind::Internal(job),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    Http,
    Internal(InternalJob),
}

/// Host-resolved operations other than plain HTTP fetches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InternalJob {
    Log,
    ReadFile,
    Glob,
    RandomSeed,
    Now,
    Env,
    Encrypt,
    Decrypt,
    WriteFile,
    Sleep,
    Which,
    Question,
    Shell,
    Stream,
    StartSpinner,
    StopSpinner,
    Custom,
    /// A name this host does not know; resolved as an `UnsupportedJob` error.
    Unsupported(String),
}

impl InternalJob {
    pub fn as_str(&self) -> &str {
        match self {
            InternalJob::Log => "log",
            InternalJob::ReadFile => "read-file",
            InternalJob::Glob => "glob",
            InternalJob::RandomSeed => "random-seed",
            InternalJob::Now => "now",
            InternalJob::Env => "env",
            InternalJob::Encrypt => "encrypt",
            InternalJob::Decrypt => "decrypt",
            InternalJob::WriteFile => "write-file",
            InternalJob::Sleep => "sleep",
            InternalJob::Which => "which",
            InternalJob::Question => "question",
            InternalJob::Shell => "shell",
            InternalJob::Stream => "stream",
            InternalJob::StartSpinner => "start-spinner",
            InternalJob::StopSpinner => "stop-spinner",
            InternalJob::Custom => "custom",
            InternalJob::Unsupported(name) => name.as_str(),
        }
    }

    /// Jobs that read the filesystem and therefore feed the watched-patterns set.
    pub fn touches_files(&self) -> bool {
        matches!(self, InternalJob::ReadFile | InternalJob::Glob)
    }
}

impl FromStr for InternalJob {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "log" => InternalJob::Log,
            "read-file" => InternalJob::ReadFile,
            "glob" => InternalJob::Glob,
            "random-seed" => InternalJob::RandomSeed,
            "now" => InternalJob::Now,
            "env" => InternalJob::Env,
            "encrypt" => InternalJob::Encrypt,
            "decrypt" => InternalJob::Decrypt,
            "write-file" => InternalJob::WriteFile,
            "sleep" => InternalJob::Sleep,
            "which" => InternalJob::Which,
            "question" => InternalJob::Question,
            "shell" => InternalJob::Shell,
            "stream" => InternalJob::Stream,
            "start-spinner" => InternalJob::StartSpinner,
            "stop-spinner" => InternalJob::StopSpinner,
            "custom" => InternalJob::Custom,
            other => InternalJob::Unsupported(other.to_string()),
        })
    }
}

impl fmt::Display for InternalJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawPendingJob {
    hash: String,
    kind: RawKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RawKind {
    Http,
    Internal,
}

impl TryFrom<RawPendingJob> for PendingJob {
    type Error = String;

    fn try_from(raw: RawPendingJob) -> Result<Self, Self::Error> {
        let kind = match (raw.kind, raw.name) {
            (RawKind::Http, _) => JobKind::Http,
            (RawKind::Internal, Some(name)) => match name.parse::<InternalJob>() {
                Ok(job) => JobKind::Internal(job),
                Err(never) => match never {},
            },
            (RawKind::Internal, None) => {
                return Err(format!("internal job `{}` is missing a name", raw.hash));
            }
        };
        Ok(PendingJob {
            hash: raw.hash,
            kind,
            payload: raw.payload,
        })
    }
}

impl From<PendingJob> for RawPendingJob {
    fn from(job: PendingJob) -> Self {
        let (kind, name) = match job.kind {
            JobKind::Http => (RawKind::Http, None),
            JobKind::Internal(internal) => (RawKind::Internal, Some(internal.as_str().to_string())),
        };
        RawPendingJob {
            hash: job.hash,
            kind,
            name,
            payload: job.payload,
        }
    }
}

/// Normalized outcome of one job: `{"ok": value}` or `{"error": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobResponse {
    Ok(Value),
    Error(JobError),
}

impl JobResponse {
    pub fn is_ok(&self) -> bool {
        matches!(self, JobResponse::Ok(_))
    }

    pub fn error_tag(&self) -> Option<JobErrorTag> {
        match self {
            JobResponse::Ok(_) => None,
            JobResponse::Error(err) => Some(err.tag),
        }
    }
}

impl From<Result<Value, JobError>> for JobResponse {
    fn from(result: Result<Value, JobError>) -> Self {
        match result {
            Ok(value) => JobResponse::Ok(value),
            Err(err) => JobResponse::Error(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub hash: String,
    pub response: JobResponse,
}

/// Structured job failure delivered to the runtime as data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub tag: JobErrorTag,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

impl JobError {
    pub fn new(tag: JobErrorTag, message: impl Into<String>) -> Self {
        Self {
            tag,
            message: message.into(),
            detail: Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.tag, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobErrorTag {
    NetworkError,
    Timeout,
    BadPayload,
    FileNotFound,
    Io,
    FrontmatterError,
    GlobError,
    DecryptFailed,
    CommandFailed,
    CommandNotFound,
    MissingCustomTaskModule,
    CustomTaskNotDefined,
    CustomTaskNotAFunction,
    CustomTaskThrew,
    CustomTaskRejected,
    UnsupportedJob,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_internal_job_wire_shape() {
        let job: PendingJob = serde_json::from_value(json!({
            "hash": "abc",
            "kind": "internal",
            "name": "read-file",
            "payload": {"path": "content/a.md"}
        }))
        .expect("valid job");

        assert_eq!(job.kind, JobKind::Internal(InternalJob::ReadFile));
        assert_eq!(job.payload["path"], "content/a.md");
    }

    #[test]
    fn unknown_internal_names_survive_parsing() {
        let job: PendingJob = serde_json::from_value(json!({
            "hash": "h",
            "kind": "internal",
            "name": "teleport"
        }))
        .expect("valid job");

        assert_eq!(
            job.kind,
            JobKind::Internal(InternalJob::Unsupported("teleport".to_string()))
        );
        assert!(job.payload.is_null());
    }

    #[test]
    fn internal_job_requires_name() {
        let err = serde_json::from_value::<PendingJob>(json!({"hash": "h", "kind": "internal"}))
            .expect_err("missing name");
        assert!(err.to_string().contains("missing a name"));
    }

    #[test]
    fn job_response_wire_shape() {
        let ok = serde_json::to_value(JobResponse::Ok(json!(1))).expect("serialize");
        assert_eq!(ok, json!({"ok": 1}));

        let err = serde_json::to_value(JobResponse::Error(JobError::new(
            JobErrorTag::Timeout,
            "took too long",
        )))
        .expect("serialize");
        assert_eq!(
            err,
            json!({"error": {"tag": "Timeout", "message": "took too long"}})
        );
    }

    #[test]
    fn http_job_serializes_without_name() {
        let value = serde_json::to_value(PendingJob::http("h1", json!({"url": "https://x"})))
            .expect("serialize");
        assert_eq!(
            value,
            json!({"hash": "h1", "kind": "http", "payload": {"url": "https://x"}})
        );
    }
}
