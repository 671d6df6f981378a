//! Host ⇄ runtime message channel.
//!
//! A runtime receives exactly one [`ToRuntime::Init`], then one
//! [`ToRuntime::JobBatch`] per [`FromRuntime::JobRequests`] it emitted, and
//! finishes by emitting a single terminal message.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    diagnostics::BuildError,
    jobs::{JobResponse, PendingJob},
    outcome::{ApiResponse, PageProgress, RequestPayload},
};

/// Version handshake between host and compiled runtime.
pub const COMPATIBILITY_KEY: u32 = 24;

/// Selects cache policy only: `Build` consults the on-disk HTTP cache, `Dev` bypasses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenderMode {
    Build,
    Dev,
}

impl RenderMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RenderMode::Build => "build",
            RenderMode::Dev => "dev",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPayload {
    pub compatibility_key: u32,
    pub mode: RenderMode,
    pub base_path: String,
    pub pathname: String,
    pub request: RequestPayload,
    pub has_fs_access: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "kebab-case")]
pub enum ToRuntime {
    Init(InitPayload),
    JobBatch { results: BTreeMap<String, JobResponse> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "kebab-case")]
pub enum FromRuntime {
    Log { message: String },
    JobRequests { jobs: Vec<PendingJob> },
    PageProgress { page: PageProgress },
    ApiResponse { response: ApiResponse },
    Errors { errors: Vec<BuildError> },
}

impl FromRuntime {
    /// Terminal messages end a render session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FromRuntime::PageProgress { .. }
                | FromRuntime::ApiResponse { .. }
                | FromRuntime::Errors { .. }
        )
    }

    pub fn tag(&self) -> &'static str {
        match self {
            FromRuntime::Log { .. } => "log",
            FromRuntime::JobRequests { .. } => "job-requests",
            FromRuntime::PageProgress { .. } => "page-progress",
            FromRuntime::ApiResponse { .. } => "api-response",
            FromRuntime::Errors { .. } => "errors",
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::jobs::JobKind;

    #[test]
    fn decodes_job_request_message() {
        let message: FromRuntime = serde_json::from_value(json!({
            "tag": "job-requests",
            "jobs": [
                {"hash": "a", "kind": "http", "payload": {"url": "https://example.com"}},
                {"hash": "b", "kind": "internal", "name": "now"}
            ]
        }))
        .expect("valid message");

        let FromRuntime::JobRequests { jobs } = &message else {
            panic!("unexpected message: {message:?}");
        };
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].kind, JobKind::Http);
        assert!(!message.is_terminal());
    }

    #[test]
    fn api_response_is_terminal() {
        let message: FromRuntime = serde_json::from_value(json!({
            "tag": "api-response",
            "response": {
                "subkind": "server-response",
                "statusCode": 200,
                "headers": [["content-type", "text/plain"]],
                "body": "Hello"
            }
        }))
        .expect("valid message");
        assert!(message.is_terminal());
        assert_eq!(message.tag(), "api-response");
    }

    #[test]
    fn init_payload_uses_camel_case() {
        let value = serde_json::to_value(ToRuntime::Init(InitPayload {
            compatibility_key: COMPATIBILITY_KEY,
            mode: RenderMode::Dev,
            base_path: "/".into(),
            pathname: "/blog".into(),
            request: RequestPayload::get("http://localhost/blog"),
            has_fs_access: true,
        }))
        .expect("serialize");

        assert_eq!(value["tag"], "init");
        assert_eq!(value["compatibilityKey"], COMPATIBILITY_KEY);
        assert_eq!(value["mode"], "dev");
        assert_eq!(value["request"]["rawUrl"], "http://localhost/blog");
    }
}
