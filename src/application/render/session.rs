use std::time::{Duration, Instant};

use frostline_protocol::{
    ApiResponse, ApiResponseKind, BuildError, COMPATIBILITY_KEY, FromRuntime, InitPayload,
    RenderMode, RenderOutcome, ToRuntime,
};
use metrics::histogram;
use serde_json::json;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::runtime::{Incoming, Runtime, RuntimeChannel, RuntimeError};
use crate::application::jobs::JobResolver;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("runtime compatibility key {found} does not match host key {expected}")]
    Incompatible { expected: u32, found: u32 },
    #[error(transparent)]
    Spawn(#[from] RuntimeError),
    #[error("runtime sent a malformed message: {0}")]
    Malformed(String),
    #[error("runtime exited before sending a terminal message")]
    Exited,
    #[error("runtime sent a second terminal message (`{tag}`)")]
    DuplicateTerminal { tag: &'static str },
    #[error("runtime did not respond for {seconds}s")]
    Hung { seconds: u64 },
    #[error("runtime reported {} error(s)", .0.len())]
    Runtime(Vec<BuildError>),
    #[error("runtime stopped accepting job results")]
    ChannelClosed,
    #[error("render panicked: {0}")]
    Panicked(String),
}

impl SessionError {
    /// Structured diagnostics for this failure, attributed to `path`.
    pub fn diagnostics(&self, path: &str) -> Vec<BuildError> {
        match self {
            SessionError::Runtime(errors) => errors.clone(),
            SessionError::Incompatible { .. } => vec![
                BuildError::new(
                    "Incompatible runtime",
                    path,
                    format!("{self}. Recompile the application with this version of frostline."),
                )
                .fatal(),
            ],
            other => vec![BuildError::new("Render failed", path, other.to_string())],
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SessionError::Incompatible { .. } => "incompatible",
            SessionError::Spawn(_) => "spawn",
            SessionError::Malformed(_) => "malformed",
            SessionError::Exited => "exited",
            SessionError::DuplicateTerminal { .. } => "duplicate_terminal",
            SessionError::Hung { .. } => "hung",
            SessionError::Runtime(_) => "runtime",
            SessionError::ChannelClosed => "channel_closed",
            SessionError::Panicked(_) => "panicked",
        }
    }

    /// 500 outcome describing the failure. Dev mode carries the diagnostics;
    /// build mode answers with a generic body.
    pub fn into_outcome(self, mode: RenderMode, path: &str) -> RenderOutcome {
        let (headers, body) = match mode {
            RenderMode::Dev => {
                let errors = self.diagnostics(path);
                let message = errors
                    .iter()
                    .map(BuildError::to_plain)
                    .collect::<Vec<_>>()
                    .join("\n\n");
                (
                    vec![("content-type".to_string(), "application/json".to_string())],
                    json!({ "message": message, "errors": errors }).to_string(),
                )
            }
            RenderMode::Build => (
                vec![("content-type".to_string(), "text/plain".to_string())],
                "Internal Server Error".to_string(),
            ),
        };
        RenderOutcome::ApiResponse(ApiResponse {
            subkind: ApiResponseKind::ServerResponse,
            status_code: 500,
            headers,
            body,
            is_base64: false,
        })
    }
}

/// Drive one fresh runtime instance from init to its terminal message.
///
/// The instance is torn down on every exit path and never reused.
pub async fn run_session(
    runtime: &dyn Runtime,
    jobs: &JobResolver,
    init: InitPayload,
    idle_timeout: Option<Duration>,
) -> Result<RenderOutcome, SessionError> {
    let started_at = Instant::now();
    let pathname = init.pathname.clone();
    let result = drive(runtime, jobs, init, idle_timeout).await;

    let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
    let outcome = match &result {
        Ok(_) => "ok",
        Err(err) => err.label(),
    };
    histogram!("frostline_session_ms", "result" => outcome).record(elapsed_ms);
    debug!(
        target = "application::render::session",
        op = "run_session",
        pathname = %pathname,
        result = outcome,
        elapsed_ms = elapsed_ms as u64,
        "Render session finished"
    );
    result
}

async fn drive(
    runtime: &dyn Runtime,
    jobs: &JobResolver,
    mut init: InitPayload,
    idle_timeout: Option<Duration>,
) -> Result<RenderOutcome, SessionError> {
    let found = runtime.compatibility_key()?;
    if found != COMPATIBILITY_KEY {
        return Err(SessionError::Incompatible {
            expected: COMPATIBILITY_KEY,
            found,
        });
    }
    init.compatibility_key = COMPATIBILITY_KEY;

    let mut channel = runtime.spawn(init)?;
    let terminal = pump(&mut channel, jobs, idle_timeout).await;
    let buffered = channel.teardown();

    let terminal = terminal?;
    if let Some(extra) = buffered
        .into_iter()
        .filter_map(Result::ok)
        .find(FromRuntime::is_terminal)
    {
        return Err(SessionError::DuplicateTerminal { tag: extra.tag() });
    }

    match terminal {
        FromRuntime::PageProgress { page } => Ok(page.into()),
        FromRuntime::ApiResponse { response } => Ok(response.into()),
        FromRuntime::Errors { errors } => Err(SessionError::Runtime(errors)),
        other => Err(SessionError::Malformed(format!(
            "`{}` is not a terminal message",
            other.tag()
        ))),
    }
}

async fn pump(
    channel: &mut RuntimeChannel,
    jobs: &JobResolver,
    idle_timeout: Option<Duration>,
) -> Result<FromRuntime, SessionError> {
    let batches = jobs.session();
    loop {
        let next = match idle_timeout {
            Some(limit) => timeout(limit, channel.incoming.recv())
                .await
                .map_err(|_| SessionError::Hung {
                    seconds: limit.as_secs(),
                })?,
            None => channel.incoming.recv().await,
        };
        let message: Incoming = next.ok_or(SessionError::Exited)?;
        match message.map_err(SessionError::Malformed)? {
            FromRuntime::Log { message } => {
                info!(target = "frostline::runtime", "{message}");
            }
            FromRuntime::JobRequests { jobs } => {
                let results = batches.resolve_batch(jobs).await;
                channel
                    .outgoing
                    .send(ToRuntime::JobBatch { results })
                    .map_err(|_| SessionError::ChannelClosed)?;
            }
            terminal => {
                if let FromRuntime::Errors { errors } = &terminal {
                    warn!(
                        target = "application::render::session",
                        error_count = errors.len(),
                        "Runtime reported errors"
                    );
                }
                return Ok(terminal);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use frostline_protocol::{
        HtmlPage, InternalJob, JobResponse, PageProgress, PendingJob, RequestPayload,
    };
    use serde_json::Value;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use super::*;
    use crate::application::{jobs::ResolverConfig, render::FnRuntime};

    fn init(pathname: &str) -> InitPayload {
        InitPayload {
            compatibility_key: 0,
            mode: RenderMode::Build,
            base_path: "/".into(),
            pathname: pathname.into(),
            request: RequestPayload::get(pathname),
            has_fs_access: true,
        }
    }

    fn resolver(dir: &TempDir) -> JobResolver {
        JobResolver::new(ResolverConfig::new(RenderMode::Build, dir.path()).quiet(true))
            .expect("resolver")
    }

    fn page(title: &str) -> FromRuntime {
        FromRuntime::PageProgress {
            page: PageProgress::Html(HtmlPage {
                is_404: false,
                title: title.into(),
                body_html: format!("<h1>{title}</h1>"),
                head_tags: String::new(),
                root_attrs: Default::default(),
                page_data: Vec::new(),
            }),
        }
    }

    #[tokio::test]
    async fn incompatible_runtime_fails_before_spawning() {
        let dir = TempDir::new().expect("temp dir");
        let runtime = FnRuntime::new(COMPATIBILITY_KEY + 1, |_, _, _| async {});

        let err = run_session(&runtime, &resolver(&dir), init("/"), None)
            .await
            .expect_err("mismatch");
        assert!(matches!(
            err,
            SessionError::Incompatible { expected: COMPATIBILITY_KEY, found } if found == COMPATIBILITY_KEY + 1
        ));
    }

    #[tokio::test]
    async fn job_batches_are_answered_once_each() {
        let dir = TempDir::new().expect("temp dir");
        let runtime = FnRuntime::new(COMPATIBILITY_KEY, |init, out, mut replies| async move {
            assert_eq!(init.compatibility_key, COMPATIBILITY_KEY);
            let batch = vec![
                PendingJob::internal("a", InternalJob::Now, Value::Null),
                PendingJob::internal("a", InternalJob::Now, Value::Null),
                PendingJob::internal("b", InternalJob::RandomSeed, Value::Null),
            ];
            let _ = out.send(Ok(FromRuntime::Log {
                message: "rendering".into(),
            }));
            let _ = out.send(Ok(FromRuntime::JobRequests { jobs: batch }));
            let Some(ToRuntime::JobBatch { results }) = replies.recv().await else {
                return;
            };
            let keys: Vec<_> = results.keys().cloned().collect();
            let title = if keys == ["a", "b"] && results.values().all(JobResponse::is_ok) {
                "complete"
            } else {
                "incomplete"
            };
            let _ = out.send(Ok(page(title)));
        });

        let outcome = run_session(&runtime, &resolver(&dir), init("/"), None)
            .await
            .expect("outcome");
        let RenderOutcome::Html(page) = outcome else {
            panic!("unexpected outcome: {outcome:?}");
        };
        assert_eq!(page.title, "complete");
    }

    #[tokio::test]
    async fn second_terminal_message_fails_the_session() {
        let dir = TempDir::new().expect("temp dir");
        let runtime = FnRuntime::new(COMPATIBILITY_KEY, |_, out, _replies| async move {
            let _ = out.send(Ok(page("one")));
            let _ = out.send(Ok(page("two")));
            std::future::pending::<()>().await;
        });

        let err = run_session(&runtime, &resolver(&dir), init("/"), None)
            .await
            .expect_err("duplicate");
        assert!(matches!(
            err,
            SessionError::DuplicateTerminal { tag: "page-progress" }
        ));
    }

    #[tokio::test]
    async fn runtime_errors_and_early_exit_are_reported() {
        let dir = TempDir::new().expect("temp dir");
        let failing = FnRuntime::new(COMPATIBILITY_KEY, |_, out, _| async move {
            let _ = out.send(Ok(FromRuntime::Errors {
                errors: vec![BuildError::new("Missing data", "/blog", "no posts")],
            }));
        });
        let err = run_session(&failing, &resolver(&dir), init("/blog"), None)
            .await
            .expect_err("errors");
        assert!(matches!(&err, SessionError::Runtime(errors) if errors.len() == 1));
        assert_eq!(err.diagnostics("/blog")[0].title, "Missing data");

        let silent = FnRuntime::new(COMPATIBILITY_KEY, |_, _out, _| async move {});
        let err = run_session(&silent, &resolver(&dir), init("/"), None)
            .await
            .expect_err("exit");
        assert!(matches!(err, SessionError::Exited));
    }

    #[tokio::test]
    async fn idle_timeout_marks_session_hung() {
        let dir = TempDir::new().expect("temp dir");
        let runtime = FnRuntime::new(
            COMPATIBILITY_KEY,
            |_, _out: mpsc::UnboundedSender<Incoming>, _| async move {
                std::future::pending::<()>().await;
            },
        );
        let err = run_session(
            &runtime,
            &resolver(&dir),
            init("/"),
            Some(Duration::from_millis(50)),
        )
        .await
        .expect_err("hung");
        assert!(matches!(err, SessionError::Hung { .. }));
    }

    #[test]
    fn failure_outcome_depends_on_mode() {
        let err = SessionError::Runtime(vec![BuildError::new("Oops", "/", "broken")]);
        let dev = err.into_outcome(RenderMode::Dev, "/");
        assert_eq!(dev.status_code(), 500);
        let RenderOutcome::ApiResponse(response) = dev else {
            panic!("expected api response");
        };
        let body: Value = serde_json::from_str(&response.body).expect("json body");
        assert!(body["message"].as_str().expect("message").contains("broken"));
        assert_eq!(body["errors"][0]["title"], "Oops");

        let build = SessionError::Exited.into_outcome(RenderMode::Build, "/");
        let RenderOutcome::ApiResponse(response) = build else {
            panic!("expected api response");
        };
        assert_eq!(response.body, "Internal Server Error");
    }
}
