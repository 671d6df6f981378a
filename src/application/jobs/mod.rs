//! Backend job resolution.
//!
//! A runtime emits batches of [`PendingJob`]s; [`BatchResolver::resolve_batch`]
//! runs one batch concurrently and returns a result for every distinct hash,
//! failures included. Errors never escape as Rust errors: each becomes a
//! tagged [`JobError`] delivered to the runtime as data.

pub mod cache;
pub mod crypto;
pub mod custom;
pub mod files;
pub mod http;
pub mod process;
pub mod spinner;
pub mod watch;

use std::{collections::BTreeMap, io, path::PathBuf, sync::Arc, time::Instant};

use frostline_protocol::{
    InternalJob, JobError, JobErrorTag, JobKind, JobResponse, PendingJob, RenderMode,
};
use futures::future::join_all;
use metrics::counter;
use reqwest::Client;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use uuid::Uuid;

pub use cache::HttpResponseCache;
pub use custom::{
    Capabilities, ScriptTaskModule, StaticTaskModule, TaskContext, TaskFn, TaskModule,
};
pub use spinner::SpinnerRegistry;
pub use watch::WatchedPatterns;

const USER_AGENT: &str = concat!("frostline/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("failed to prepare HTTP response cache: {0}")]
    Cache(#[from] io::Error),
}

/// Read-only resolver configuration handed to every render thread.
///
/// Each thread builds its own [`JobResolver`] from it; the watched-pattern set
/// and spinner registry are the only pieces shared between them.
#[derive(Clone)]
pub struct ResolverConfig {
    pub mode: RenderMode,
    pub root: PathBuf,
    pub http_cache_dir: Option<PathBuf>,
    pub task_module: Arc<dyn TaskModule>,
    pub watched: WatchedPatterns,
    pub spinners: SpinnerRegistry,
    pub quiet: bool,
}

impl ResolverConfig {
    pub fn new(mode: RenderMode, root: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            root: root.into(),
            http_cache_dir: None,
            task_module: Arc::new(StaticTaskModule::new()),
            watched: WatchedPatterns::new(),
            spinners: SpinnerRegistry::new(),
            quiet: false,
        }
    }

    pub fn with_http_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.http_cache_dir = Some(dir.into());
        self
    }

    pub fn with_task_module(mut self, module: Arc<dyn TaskModule>) -> Self {
        self.task_module = module;
        self
    }

    pub fn with_watched(mut self, watched: WatchedPatterns) -> Self {
        self.watched = watched;
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }
}

pub struct JobResolver {
    config: ResolverConfig,
    client: Client,
    http_cache: Option<HttpResponseCache>,
}

impl JobResolver {
    pub fn new(config: ResolverConfig) -> Result<Self, ResolverError> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        let http_cache = match (&config.http_cache_dir, config.mode) {
            (Some(dir), RenderMode::Build) => Some(HttpResponseCache::new(dir.clone())?),
            _ => None,
        };
        Ok(Self {
            config,
            client,
            http_cache,
        })
    }

    pub fn mode(&self) -> RenderMode {
        self.config.mode
    }

    pub fn watched(&self) -> &WatchedPatterns {
        &self.config.watched
    }

    /// Per-session view; custom task capabilities are resolved at most once
    /// for its lifetime.
    pub fn session(&self) -> BatchResolver<'_> {
        BatchResolver {
            resolver: self,
            capabilities: OnceCell::new(),
            context: TaskContext::from_process(&self.config.root, self.config.quiet),
        }
    }
}

pub struct BatchResolver<'a> {
    resolver: &'a JobResolver,
    capabilities: OnceCell<Capabilities>,
    context: TaskContext,
}

#[derive(Debug, Deserialize)]
struct LogMessage {
    message: String,
}

#[derive(Debug, Deserialize)]
struct EnvLookup {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Sleep {
    ms: u64,
}

#[derive(Debug, Deserialize)]
struct CustomCall {
    name: String,
    #[serde(default)]
    input: Value,
}

impl BatchResolver<'_> {
    /// Resolve every job concurrently. Duplicate hashes run once; the result
    /// map holds exactly one entry per distinct hash.
    pub async fn resolve_batch(&self, jobs: Vec<PendingJob>) -> BTreeMap<String, JobResponse> {
        let mut unique: BTreeMap<String, PendingJob> = BTreeMap::new();
        for job in jobs {
            unique.entry(job.hash.clone()).or_insert(job);
        }

        join_all(unique.into_values().map(|job| async move {
            let hash = job.hash.clone();
            (hash, self.resolve_one(job).await)
        }))
        .await
        .into_iter()
        .collect()
    }

    async fn resolve_one(&self, job: PendingJob) -> JobResponse {
        let started_at = Instant::now();
        let label = match &job.kind {
            JobKind::Http => "http".to_string(),
            JobKind::Internal(internal) => internal.to_string(),
        };

        let result = match job.kind {
            JobKind::Http => self.http(job.payload).await,
            JobKind::Internal(internal) => self.internal(internal, job.payload).await,
        };

        let outcome = if result.is_ok() { "ok" } else { "error" };
        counter!("frostline_jobs_resolved_total", "kind" => label.clone(), "result" => outcome)
            .increment(1);
        debug!(
            target = "application::jobs",
            op = "jobs::resolve_one",
            result = outcome,
            job = %label,
            hash = %job.hash,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            error = result.as_ref().err().map(tracing::field::display),
            "Resolved backend job"
        );

        JobResponse::from(result)
    }

    async fn http(&self, payload: Value) -> Result<Value, JobError> {
        let job: http::HttpJob = parse_payload("http", payload)?;
        http::resolve(
            &self.resolver.client,
            self.resolver.http_cache.as_ref(),
            job,
        )
        .await
    }

    async fn internal(&self, job: InternalJob, payload: Value) -> Result<Value, JobError> {
        let config = &self.resolver.config;
        let root = config.root.as_path();
        let name = job.to_string();

        match job {
            InternalJob::Log => {
                let log: LogMessage = parse_payload(&name, payload)?;
                info!(target = "frostline::runtime", "{}", log.message);
                Ok(Value::Null)
            }
            InternalJob::ReadFile => {
                let read: files::ReadFile = parse_payload(&name, payload)?;
                config.watched.insert(read.path.clone());
                files::read_file(root, &read).await
            }
            InternalJob::Glob => {
                let glob: files::GlobPattern = parse_payload(&name, payload)?;
                config.watched.insert(glob.pattern.clone());
                files::glob(root, &glob).await
            }
            InternalJob::RandomSeed => Ok(json!(Uuid::new_v4().as_u128() as u32)),
            InternalJob::Now => Ok(json!(now_ms())),
            InternalJob::Env => {
                let lookup: EnvLookup = parse_payload(&name, payload)?;
                Ok(std::env::var(&lookup.name).map_or(Value::Null, Value::String))
            }
            InternalJob::Encrypt => crypto::encrypt(&parse_payload(&name, payload)?),
            InternalJob::Decrypt => crypto::decrypt(&parse_payload(&name, payload)?),
            InternalJob::WriteFile => {
                files::write_file(root, &parse_payload(&name, payload)?).await
            }
            InternalJob::Sleep => {
                let sleep: Sleep = parse_payload(&name, payload)?;
                tokio::time::sleep(std::time::Duration::from_millis(sleep.ms)).await;
                Ok(Value::Null)
            }
            InternalJob::Which => Ok(process::which(&parse_payload(&name, payload)?)),
            InternalJob::Question => process::question(&parse_payload(&name, payload)?).await,
            InternalJob::Shell => process::shell(root, &parse_payload(&name, payload)?).await,
            InternalJob::Stream => process::stream(root, &parse_payload(&name, payload)?).await,
            InternalJob::StartSpinner => {
                let start: spinner::StartSpinner = parse_payload(&name, payload)?;
                Ok(Value::String(config.spinners.start(&start)))
            }
            InternalJob::StopSpinner => {
                config.spinners.stop(&parse_payload(&name, payload)?);
                Ok(Value::Null)
            }
            InternalJob::Custom => {
                let call: CustomCall = parse_payload(&name, payload)?;
                let capabilities = self
                    .capabilities
                    .get_or_init(|| Capabilities::load(Arc::clone(&config.task_module)))
                    .await;
                capabilities
                    .invoke(&call.name, call.input, self.context.clone())
                    .await
            }
            InternalJob::Unsupported(name) => Err(JobError::new(
                JobErrorTag::UnsupportedJob,
                format!("this host does not support the `{name}` job"),
            )),
        }
    }
}

fn parse_payload<T: DeserializeOwned>(job: &str, payload: Value) -> Result<T, JobError> {
    serde_json::from_value(payload).map_err(|err| {
        JobError::new(
            JobErrorTag::BadPayload,
            format!("invalid `{job}` payload: {err}"),
        )
    })
}

fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn resolver(dir: &TempDir) -> JobResolver {
        let module = StaticTaskModule::new()
            .with_async("double", |input, _| async move {
                Ok(json!(input.as_i64().unwrap_or(0) * 2))
            });
        JobResolver::new(
            ResolverConfig::new(RenderMode::Dev, dir.path())
                .with_task_module(Arc::new(module))
                .quiet(true),
        )
        .expect("resolver")
    }

    #[tokio::test]
    async fn every_distinct_hash_gets_a_result() {
        let dir = TempDir::new().expect("temp dir");
        let resolver = resolver(&dir);
        let session = resolver.session();

        let jobs = vec![
            PendingJob::internal("a", InternalJob::Now, Value::Null),
            PendingJob::internal("b", InternalJob::ReadFile, json!({"path": "missing.md"})),
            PendingJob::internal("c", InternalJob::Unsupported("teleport".into()), Value::Null),
            PendingJob::internal("d", InternalJob::Env, json!({"wrong": true})),
            PendingJob::internal("e", InternalJob::Custom, json!({"name": "double", "input": 21})),
            PendingJob::internal("f", InternalJob::Custom, json!({"name": "nope"})),
        ];
        let results = session.resolve_batch(jobs).await;

        assert_eq!(results.len(), 6);
        assert!(results["a"].is_ok());
        assert_eq!(results["b"].error_tag(), Some(JobErrorTag::FileNotFound));
        assert_eq!(results["c"].error_tag(), Some(JobErrorTag::UnsupportedJob));
        assert_eq!(results["d"].error_tag(), Some(JobErrorTag::BadPayload));
        assert_eq!(results["e"], JobResponse::Ok(json!(42)));
        assert_eq!(
            results["f"].error_tag(),
            Some(JobErrorTag::CustomTaskNotDefined)
        );
    }

    #[tokio::test]
    async fn duplicate_hashes_resolve_once() {
        let dir = TempDir::new().expect("temp dir");
        let resolver = resolver(&dir);
        let session = resolver.session();

        let jobs = vec![
            PendingJob::internal("same", InternalJob::StartSpinner, json!({"text": "a"})),
            PendingJob::internal("same", InternalJob::StartSpinner, json!({"text": "a"})),
        ];
        let results = session.resolve_batch(jobs).await;
        assert_eq!(results.len(), 1);
        assert_eq!(resolver.config.spinners.active_count(), 1);
    }

    #[tokio::test]
    async fn file_jobs_register_watched_patterns() {
        let dir = TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join("site.json"), "{}").expect("seed");
        let resolver = resolver(&dir);
        let session = resolver.session();

        let results = session
            .resolve_batch(vec![
                PendingJob::internal("r", InternalJob::ReadFile, json!({"path": "site.json"})),
                PendingJob::internal("g", InternalJob::Glob, json!({"pattern": "content/*.md"})),
            ])
            .await;

        assert!(results["r"].is_ok());
        assert!(results["g"].is_ok());
        assert_eq!(
            resolver.watched().snapshot(),
            vec!["content/*.md".to_string(), "site.json".to_string()]
        );
    }

    #[tokio::test]
    async fn dev_mode_never_builds_a_cache() {
        let dir = TempDir::new().expect("temp dir");
        let config = ResolverConfig::new(RenderMode::Dev, dir.path())
            .with_http_cache_dir(dir.path().join("cache"));
        let resolver = JobResolver::new(config).expect("resolver");
        assert!(resolver.http_cache.is_none());
        assert!(!dir.path().join("cache").exists());
    }

    #[tokio::test]
    async fn env_lookup_returns_null_when_unset() {
        let dir = TempDir::new().expect("temp dir");
        let resolver = resolver(&dir);
        let results = resolver
            .session()
            .resolve_batch(vec![PendingJob::internal(
                "env",
                InternalJob::Env,
                json!({"name": "FROSTLINE_TEST_DEFINITELY_UNSET"}),
            )])
            .await;
        assert_eq!(results["env"], JobResponse::Ok(Value::Null));
    }
}
