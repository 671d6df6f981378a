//! Jobs that run external commands or talk to the terminal.

use std::{io::ErrorKind, path::Path, process::Stdio, time::Duration};

use frostline_protocol::{JobError, JobErrorTag};
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
};
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shell {
    pub commands: Vec<CommandSpec>,
    #[serde(default = "default_capture")]
    pub capture: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_capture() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct Stream {
    pub parts: Vec<StreamPart>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StreamPart {
    File { path: String },
    Command(CommandSpec),
    WriteFile { path: String },
    Stdout,
}

#[derive(Debug, Deserialize)]
pub struct Which {
    pub command: String,
}

#[derive(Debug, Deserialize)]
pub struct Question {
    pub prompt: String,
}

/// Run a pipeline of commands, each stdout feeding the next stdin.
///
/// A non-zero exit from the last command is `CommandFailed`; `timeout_ms`
/// bounds the whole pipeline and kills every stage when exceeded.
pub async fn shell(root: &Path, job: &Shell) -> Result<Value, JobError> {
    if job.commands.is_empty() {
        return Err(JobError::new(
            JobErrorTag::BadPayload,
            "shell job needs at least one command",
        ));
    }

    let run = run_pipeline(root, &job.commands, job.capture);
    let output = match job.timeout_ms {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), run)
            .await
            .map_err(|_| {
                JobError::new(
                    JobErrorTag::Timeout,
                    format!("shell pipeline exceeded {ms}ms"),
                )
            })??,
        None => run.await?,
    };

    let result = json!({
        "stdout": output.stdout,
        "stderr": output.stderr,
        "exitCode": output.exit_code,
    });
    if output.exit_code == Some(0) {
        Ok(result)
    } else {
        Err(JobError::new(
            JobErrorTag::CommandFailed,
            format!(
                "`{}` exited with {}",
                pipeline_label(&job.commands),
                output
                    .exit_code
                    .map_or_else(|| "a signal".to_string(), |code| format!("status {code}"))
            ),
        )
        .with_detail(result))
    }
}

struct PipelineOutput {
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
}

async fn run_pipeline(
    root: &Path,
    commands: &[CommandSpec],
    capture: bool,
) -> Result<PipelineOutput, JobError> {
    let mut children: Vec<Child> = Vec::with_capacity(commands.len());
    let mut previous_stdout: Option<Stdio> = None;

    for (index, spec) in commands.iter().enumerate() {
        let last = index + 1 == commands.len();
        let mut command = Command::new(&spec.name);
        command
            .args(&spec.args)
            .current_dir(root)
            .kill_on_drop(true)
            .stdin(previous_stdout.take().unwrap_or_else(Stdio::null));
        if !last || capture {
            command.stdout(Stdio::piped());
        } else {
            command.stdout(Stdio::inherit());
        }
        command.stderr(if capture {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });

        let mut child = command.spawn().map_err(|err| spawn_error(&spec.name, err))?;
        if !last && let Some(stdout) = child.stdout.take() {
            let stdio: Stdio = stdout.try_into().map_err(|err: std::io::Error| {
                JobError::new(JobErrorTag::Io, format!("failed to pipe `{}`: {err}", spec.name))
            })?;
            previous_stdout = Some(stdio);
        }
        children.push(child);
    }

    let outputs = join_all(children.into_iter().map(Child::wait_with_output)).await;
    let mut stderr = String::new();
    let mut stdout = String::new();
    let mut exit_code = None;
    for output in outputs {
        let output = output.map_err(|err| JobError::new(JobErrorTag::Io, err.to_string()))?;
        stderr.push_str(&String::from_utf8_lossy(&output.stderr));
        stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        exit_code = output.status.code();
    }

    Ok(PipelineOutput {
        stdout,
        stderr,
        exit_code,
    })
}

/// Run a sequence of stream stages over an in-memory buffer.
pub async fn stream(root: &Path, job: &Stream) -> Result<Value, JobError> {
    let mut buffer: Vec<u8> = Vec::new();

    for part in &job.parts {
        match part {
            StreamPart::File { path } => {
                buffer = tokio::fs::read(root.join(path)).await.map_err(|err| {
                    let tag = if err.kind() == ErrorKind::NotFound {
                        JobErrorTag::FileNotFound
                    } else {
                        JobErrorTag::Io
                    };
                    JobError::new(tag, format!("{path}: {err}"))
                })?;
            }
            StreamPart::Command(spec) => {
                buffer = filter_through(root, spec, buffer).await?;
            }
            StreamPart::WriteFile { path } => {
                let target = root.join(path);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|err| JobError::new(JobErrorTag::Io, err.to_string()))?;
                }
                tokio::fs::write(&target, &buffer)
                    .await
                    .map_err(|err| JobError::new(JobErrorTag::Io, format!("{path}: {err}")))?;
            }
            StreamPart::Stdout => {
                let mut out = tokio::io::stdout();
                out.write_all(&buffer)
                    .await
                    .map_err(|err| JobError::new(JobErrorTag::Io, err.to_string()))?;
                out.flush()
                    .await
                    .map_err(|err| JobError::new(JobErrorTag::Io, err.to_string()))?;
            }
        }
    }

    Ok(json!({ "body": String::from_utf8_lossy(&buffer) }))
}

async fn filter_through(
    root: &Path,
    spec: &CommandSpec,
    input: Vec<u8>,
) -> Result<Vec<u8>, JobError> {
    let mut child = Command::new(&spec.name)
        .args(&spec.args)
        .current_dir(root)
        .kill_on_drop(true)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| spawn_error(&spec.name, err))?;

    let stdin = child.stdin.take();
    let writer = async move {
        if let Some(mut stdin) = stdin {
            stdin.write_all(&input).await?;
            stdin.shutdown().await?;
        }
        Ok::<_, std::io::Error>(())
    };
    let (written, output) = tokio::join!(writer, child.wait_with_output());
    let output = output.map_err(|err| JobError::new(JobErrorTag::Io, err.to_string()))?;
    if let Err(err) = written
        && err.kind() != ErrorKind::BrokenPipe
    {
        return Err(JobError::new(JobErrorTag::Io, err.to_string()));
    }

    if !output.status.success() {
        return Err(JobError::new(
            JobErrorTag::CommandFailed,
            format!("`{}` failed in stream", spec.name),
        )
        .with_detail(json!({
            "stderr": String::from_utf8_lossy(&output.stderr),
            "exitCode": output.status.code(),
        })));
    }
    Ok(output.stdout)
}

pub fn which(job: &Which) -> Value {
    match ::which::which(&job.command) {
        Ok(path) => Value::String(path.to_string_lossy().into_owned()),
        Err(err) => {
            debug!(
                target = "application::jobs::process",
                command = %job.command,
                error = %err,
                "Command not found on PATH"
            );
            Value::Null
        }
    }
}

pub async fn question(job: &Question) -> Result<Value, JobError> {
    let mut out = tokio::io::stderr();
    out.write_all(job.prompt.as_bytes())
        .await
        .map_err(|err| JobError::new(JobErrorTag::Io, err.to_string()))?;
    out.flush()
        .await
        .map_err(|err| JobError::new(JobErrorTag::Io, err.to_string()))?;

    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .map_err(|err| JobError::new(JobErrorTag::Io, err.to_string()))?;
    Ok(Value::String(
        line.trim_end_matches(['\r', '\n']).to_string(),
    ))
}

fn spawn_error(name: &str, err: std::io::Error) -> JobError {
    if err.kind() == ErrorKind::NotFound {
        JobError::new(
            JobErrorTag::CommandNotFound,
            format!("command `{name}` was not found"),
        )
    } else {
        JobError::new(JobErrorTag::Io, format!("failed to start `{name}`: {err}"))
    }
}

fn pipeline_label(commands: &[CommandSpec]) -> String {
    commands
        .iter()
        .map(|spec| {
            std::iter::once(spec.name.as_str())
                .chain(spec.args.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join(" | ")
}
