use std::{fs, path::Path, process, sync::Arc};

use frostline::{
    application::{
        build::{BuildOptions, run_build},
        dev::DevPool,
        error::AppError,
        jobs::{ResolverConfig, ScriptTaskModule, WatchedPatterns},
        patch,
        render::ProcessRuntime,
        worker::WorkerSpec,
    },
    config,
    infra::{
        error::InfraError,
        http::{self, DevState},
        telemetry,
        watch::{self, WatchScope},
    },
    protocol::RenderMode,
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Build(config::BuildArgs::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Build(_) => run_build_command(settings).await,
        config::Command::Dev(_) => run_dev(settings).await,
        config::Command::PatchVdom(args) => run_patch(&args.input, args.output.as_deref()),
    }
}

fn worker_spec(
    settings: &config::Settings,
    mode: RenderMode,
    watched: WatchedPatterns,
) -> Result<WorkerSpec, AppError> {
    let root = std::env::current_dir().map_err(InfraError::from)?;
    let render = &settings.render;

    let task_module = ScriptTaskModule::new(&render.custom_task_module, &root);
    let resolver = ResolverConfig::new(mode, &root)
        .with_http_cache_dir(root.join(&settings.build.http_cache_dir))
        .with_task_module(Arc::new(task_module))
        .with_watched(watched);
    let runtime = ProcessRuntime::new(
        &render.runtime_command,
        root.join(&render.runtime_module),
        root.join(&render.runtime_manifest),
        &root,
    );

    Ok(WorkerSpec {
        resolver,
        runtime: Arc::new(runtime),
        base_path: render.base_path.clone(),
        session_timeout: render.session_timeout,
    })
}

async fn run_build_command(settings: config::Settings) -> Result<(), AppError> {
    let spec = worker_spec(&settings, RenderMode::Build, WatchedPatterns::new())?;
    let options = BuildOptions {
        output_dir: settings.build.output_dir.clone(),
        workers: settings.build.workers,
    };

    let report = tokio::task::spawn_blocking(move || run_build(spec, options))
        .await
        .map_err(|err| AppError::unexpected(format!("build thread panicked: {err}")))??;

    if report.failed() {
        eprintln!("{}", report.render_failures());
        return Err(AppError::PagesFailed {
            failed: report.failures.len(),
        });
    }

    info!(
        target = "frostline::build",
        rendered = report.rendered.len(),
        skipped = report.skipped.len(),
        routes = report.routes.len(),
        output_dir = %settings.build.output_dir.display(),
        "Site built"
    );
    Ok(())
}

async fn run_dev(settings: config::Settings) -> Result<(), AppError> {
    let watched = WatchedPatterns::new();
    let spec = worker_spec(&settings, RenderMode::Dev, watched.clone())?;
    let root = spec.resolver.root.clone();
    let pool = DevPool::start(spec, settings.server.workers)?;

    let runtime_dir = settings
        .render
        .runtime_module
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let scope = WatchScope::new(root, runtime_dir, watched)
        .ignore(&settings.build.http_cache_dir)
        .ignore(&settings.build.output_dir);
    let _watcher = watch::watch(scope, pool.clone())?;

    let router = http::build_router(DevState::new(pool));
    http::serve(settings.server.addr, router).await?;
    Ok(())
}

fn run_patch(input: &Path, output: Option<&Path>) -> Result<(), AppError> {
    let source = fs::read_to_string(input).map_err(InfraError::from)?;
    let patched = patch::patch(&source)?;
    let destination = output.unwrap_or(input);
    fs::write(destination, patched.source).map_err(InfraError::from)?;

    info!(
        target = "frostline::patch",
        variant = patched.variant.as_str(),
        input = %input.display(),
        output = %destination.display(),
        "Virtual-DOM engine patched"
    );
    Ok(())
}
