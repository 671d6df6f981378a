//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    net::SocketAddr,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

pub use cli::{BuildArgs, CliArgs, Command, DevArgs, LoggingOverrides, PatchArgs, RenderOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "frostline";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 1234;
const DEFAULT_RUNTIME_COMMAND: &str = "node";
const DEFAULT_RUNTIME_MODULE: &str = ".frostline/render.js";
const DEFAULT_RUNTIME_MANIFEST_NAME: &str = "runtime.json";
const DEFAULT_CUSTOM_TASK_MODULE: &str = "custom-backend-task";
const DEFAULT_BASE_PATH: &str = "/";
const DEFAULT_OUTPUT_DIR: &str = "dist";
pub(crate) const DEFAULT_HTTP_CACHE_DIR: &str = ".frostline/http-response-cache";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub render: RenderSettings,
    pub build: BuildSettings,
    pub server: ServerSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub runtime_command: PathBuf,
    pub runtime_module: PathBuf,
    pub runtime_manifest: PathBuf,
    pub base_path: String,
    pub session_timeout: Option<Duration>,
    pub custom_task_module: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub output_dir: PathBuf,
    pub workers: NonZeroUsize,
    pub http_cache_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub workers: NonZeroUsize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("FROSTLINE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Build(args)) => raw.apply_build_overrides(args),
        Some(Command::Dev(args)) => raw.apply_dev_overrides(args),
        Some(Command::PatchVdom(args)) => raw.apply_logging_overrides(&args.logging),
        None => {}
    }

    Settings::from_raw(raw)
}

/// Default worker count: one thread per logical core, leaving one for the coordinator.
pub fn default_worker_count() -> NonZeroUsize {
    let cores = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
    NonZeroUsize::new(cores.saturating_sub(1)).unwrap_or(NonZeroUsize::MIN)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    render: RawRenderSettings,
    build: RawBuildSettings,
    server: RawServerSettings,
}

impl RawSettings {
    fn apply_build_overrides(&mut self, args: &BuildArgs) {
        self.apply_render_overrides(&args.render);
        self.apply_logging_overrides(&args.logging);
        if let Some(dir) = args.output_dir.as_ref() {
            self.build.output_dir = Some(dir.clone());
        }
        if let Some(workers) = args.workers {
            self.build.workers = Some(workers.into());
        }
        if let Some(dir) = args.http_cache_dir.as_ref() {
            self.build.http_cache_dir = Some(dir.clone());
        }
    }

    fn apply_dev_overrides(&mut self, args: &DevArgs) {
        self.apply_render_overrides(&args.render);
        self.apply_logging_overrides(&args.logging);
        if let Some(host) = args.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = args.server_port {
            self.server.port = Some(port);
        }
        if let Some(workers) = args.workers {
            self.server.workers = Some(workers.into());
        }
    }

    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_render_overrides(&mut self, overrides: &RenderOverrides) {
        if let Some(module) = overrides.runtime_module.as_ref() {
            self.render.runtime_module = Some(module.clone());
        }
        if let Some(command) = overrides.runtime_command.as_ref() {
            self.render.runtime_command = Some(command.clone());
        }
        if let Some(base) = overrides.base_path.as_ref() {
            self.render.base_path = Some(base.clone());
        }
        if let Some(module) = overrides.custom_task_module.as_ref() {
            self.render.custom_task_module = Some(module.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            render,
            build,
            server,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            render: build_render_settings(render)?,
            build: build_build_settings(build)?,
            server: build_server_settings(server)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let runtime_command = render
        .runtime_command
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RUNTIME_COMMAND));
    if runtime_command.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "render.runtime_command",
            "path must not be empty",
        ));
    }

    let runtime_module = render
        .runtime_module
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RUNTIME_MODULE));
    if runtime_module.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "render.runtime_module",
            "path must not be empty",
        ));
    }

    let runtime_manifest = render
        .runtime_manifest
        .unwrap_or_else(|| manifest_beside(&runtime_module));

    let base_path = normalize_base_path(
        render
            .base_path
            .as_deref()
            .unwrap_or(DEFAULT_BASE_PATH),
    );

    let session_timeout = match render.session_timeout_seconds {
        None => None,
        Some(0) => {
            return Err(LoadError::invalid(
                "render.session_timeout_seconds",
                "must be greater than zero when set",
            ));
        }
        Some(seconds) => Some(Duration::from_secs(seconds)),
    };

    let custom_task_module = render
        .custom_task_module
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CUSTOM_TASK_MODULE));

    Ok(RenderSettings {
        runtime_command,
        runtime_module,
        runtime_manifest,
        base_path,
        session_timeout,
        custom_task_module,
    })
}

fn build_build_settings(build: RawBuildSettings) -> Result<BuildSettings, LoadError> {
    let output_dir = build
        .output_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));
    if output_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "build.output_dir",
            "path must not be empty",
        ));
    }

    let workers = match build.workers {
        Some(value) => non_zero_usize(value, "build.workers")?,
        None => default_worker_count(),
    };

    let http_cache_dir = build
        .http_cache_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_HTTP_CACHE_DIR));

    Ok(BuildSettings {
        output_dir,
        workers,
        http_cache_dir,
    })
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let workers = match server.workers {
        Some(value) => non_zero_usize(value, "server.workers")?,
        None => default_worker_count(),
    };

    Ok(ServerSettings { addr, workers })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    runtime_command: Option<PathBuf>,
    runtime_module: Option<PathBuf>,
    runtime_manifest: Option<PathBuf>,
    base_path: Option<String>,
    session_timeout_seconds: Option<u64>,
    custom_task_module: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBuildSettings {
    output_dir: Option<PathBuf>,
    workers: Option<u64>,
    http_cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    workers: Option<u64>,
}

fn manifest_beside(module: &Path) -> PathBuf {
    match module.parent() {
        Some(parent) => parent.join(DEFAULT_RUNTIME_MANIFEST_NAME),
        None => PathBuf::from(DEFAULT_RUNTIME_MANIFEST_NAME),
    }
}

/// Base paths always start and end with `/`.
pub fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}/")
    }
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
