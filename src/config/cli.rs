use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the frostline binary.
#[derive(Debug, Parser)]
#[command(
    name = "frostline",
    version,
    about = "Render pipeline host for compiled UI applications"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "FROSTLINE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Render every page of the site into the output directory.
    Build(BuildArgs),
    /// Serve pages on demand from a pool of warm render threads.
    Dev(Box<DevArgs>),
    /// Patch a compiled virtual-DOM engine so it adopts frozen regions.
    #[command(name = "patch-vdom")]
    PatchVdom(PatchArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct RenderOverrides {
    /// Override the compiled runtime module to execute.
    #[arg(long = "runtime-module", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub runtime_module: Option<PathBuf>,

    /// Override the interpreter used to execute the runtime module.
    #[arg(long = "runtime-command", value_name = "PATH")]
    pub runtime_command: Option<PathBuf>,

    /// Override the base path the site is served under.
    #[arg(long = "base-path", value_name = "PATH")]
    pub base_path: Option<String>,

    /// Override the custom backend task module.
    #[arg(long = "custom-task-module", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub custom_task_module: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct BuildArgs {
    #[command(flatten)]
    pub render: RenderOverrides,

    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Override the output directory.
    #[arg(long = "output-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub output_dir: Option<PathBuf>,

    /// Override the number of render threads.
    #[arg(long = "workers", value_name = "COUNT")]
    pub workers: Option<u32>,

    /// Override the directory holding cached HTTP responses.
    #[arg(long = "http-cache-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub http_cache_dir: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct DevArgs {
    #[command(flatten)]
    pub render: RenderOverrides,

    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Override the dev server host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the dev server port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the number of render threads.
    #[arg(long = "workers", value_name = "COUNT")]
    pub workers: Option<u32>,
}

#[derive(Debug, Args, Clone)]
pub struct PatchArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Compiled engine source to patch.
    #[arg(value_name = "INPUT", value_hint = ValueHint::FilePath)]
    pub input: PathBuf,

    /// Destination for the patched source; defaults to rewriting INPUT in place.
    #[arg(long = "output", short = 'o', value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub output: Option<PathBuf>,
}
