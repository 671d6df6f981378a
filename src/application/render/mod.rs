//! Render entry point.
//!
//! One call to [`render`] runs exactly one session against a fresh runtime
//! instance. Callers own the job resolver and the runtime; this module only
//! derives the canonical pathname and builds the init payload.

mod runtime;
mod session;

use std::time::Duration;

use frostline_protocol::{COMPATIBILITY_KEY, InitPayload, RenderMode, RenderOutcome};

pub use runtime::{FnRuntime, Incoming, ProcessRuntime, Runtime, RuntimeChannel, RuntimeError};
pub use session::{SessionError, run_session};

use crate::{
    application::jobs::JobResolver,
    domain::request::{RenderRequest, canonical_pathname},
};

/// Long-lived collaborators shared by every render on one worker.
#[derive(Clone, Copy)]
pub struct RenderContext<'a> {
    pub jobs: &'a JobResolver,
    pub runtime: &'a dyn Runtime,
    pub base_path: &'a str,
    pub session_timeout: Option<Duration>,
}

/// Per-request inputs.
#[derive(Debug, Clone)]
pub struct RenderInput {
    pub request: RenderRequest,
    /// Overrides the pathname derived from the request URL.
    pub pathname: Option<String>,
    pub has_fs_access: bool,
}

impl RenderInput {
    pub fn new(request: RenderRequest) -> Self {
        Self {
            request,
            pathname: None,
            has_fs_access: true,
        }
    }

    pub fn with_pathname(mut self, pathname: impl Into<String>) -> Self {
        self.pathname = Some(pathname.into());
        self
    }
}

impl RenderContext<'_> {
    pub fn mode(&self) -> RenderMode {
        self.jobs.mode()
    }
}

/// Render one request. Resolves to an outcome or a session error; callers
/// decide whether to surface the error as a 500 via
/// [`SessionError::into_outcome`].
pub async fn render(
    ctx: RenderContext<'_>,
    input: RenderInput,
) -> Result<RenderOutcome, SessionError> {
    let pathname = match input.pathname {
        Some(pathname) => pathname,
        None => canonical_pathname(&input.request.raw_url, ctx.base_path)
            .map_err(|err| SessionError::Malformed(err.to_string()))?,
    };
    let init = InitPayload {
        compatibility_key: COMPATIBILITY_KEY,
        mode: ctx.mode(),
        base_path: ctx.base_path.to_string(),
        pathname,
        request: input.request,
        has_fs_access: input.has_fs_access,
    };
    run_session(ctx.runtime, ctx.jobs, init, ctx.session_timeout).await
}

/// Render and fold session failures into a 500 outcome.
pub async fn render_or_error(ctx: RenderContext<'_>, input: RenderInput) -> RenderOutcome {
    let path = input
        .pathname
        .clone()
        .unwrap_or_else(|| input.request.raw_url.clone());
    match render(ctx, input).await {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::warn!(
                target = "application::render",
                path = %path,
                error = %err,
                "Render failed"
            );
            err.into_outcome(ctx.mode(), &path)
        }
    }
}
