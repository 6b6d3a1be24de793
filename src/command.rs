use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use uuid::Uuid;

use crate::error::JobError;
use crate::models::{ArtifactName, ConversionJob, Invocation, State};

/// How to start a converter: an executable plus the arguments that always
/// precede the per-job ones (typically an interpreter and its script).
#[derive(Debug, Clone, PartialEq)]
pub struct ConverterCommand {
    pub program: String,
    pub leading_args: Vec<String>,
}

impl ConverterCommand {
    pub fn new(program: impl Into<String>, leading_args: Vec<String>) -> Self {
        ConverterCommand {
            program: program.into(),
            leading_args,
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace().map(|word| word.to_owned());
        let program = words.next()?;
        Some(ConverterCommand::new(program, words.collect()))
    }
}

/// What a successful job produced.
#[derive(Debug, PartialEq)]
pub enum JobOutput {
    File(std::path::PathBuf),
    Clients(Vec<Value>),
    Fdf(ArtifactName),
    Zip(ArtifactName),
}

#[derive(Deserialize)]
struct FdfReply {
    fdf_filename: String,
}

#[derive(Deserialize)]
struct ZipReply {
    zip_filename: String,
}

/// Runs one converter process per job and classifies how it went.
#[derive(Debug, Clone)]
pub struct Supervisor {
    pdf: ConverterCommand,
    fdf: ConverterCommand,
    timeout: Option<Duration>,
}

impl Supervisor {
    pub fn new(pdf: ConverterCommand, fdf: ConverterCommand, timeout: Option<Duration>) -> Self {
        Supervisor { pdf, fdf, timeout }
    }

    fn converter_for(&self, invocation: &Invocation) -> &ConverterCommand {
        match invocation {
            Invocation::FlattenPdf { .. } => &self.pdf,
            _ => &self.fdf,
        }
    }

    pub async fn run(&self, job: &mut ConversionJob) -> Result<JobOutput, JobError> {
        if job.state != State::Pending {
            return Err(JobError::AlreadyStarted {
                job_id: job.id.to_string(),
            });
        }

        job.state = State::Running;
        tracing::info!(
            job_id = %job.id,
            command = job.invocation.name(),
            input = %job.input.display(),
            "conversion started"
        );

        let result = self.execute(job).await;

        match &result {
            Ok(_) => {
                job.state = State::Succeeded;
                tracing::info!(job_id = %job.id, command = job.invocation.name(), "conversion finished");
            }
            Err(err) => {
                job.state = State::Failed;
                tracing::warn!(
                    job_id = %job.id,
                    command = job.invocation.name(),
                    exit_code = ?job.exit_code,
                    error = %err,
                    "conversion failed"
                );
            }
        }

        result
    }

    async fn execute(&self, job: &mut ConversionJob) -> Result<JobOutput, JobError> {
        let converter = self.converter_for(&job.invocation);

        let mut child = Command::new(&converter.program)
            .args(&converter.leading_args)
            .args(job.invocation.arguments(&job.input))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| JobError::Spawn {
                program: converter.program.clone(),
                source,
            })?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        let status = match self.timeout {
            Some(limit) => {
                let collected =
                    tokio::time::timeout(limit, collect(&mut child, job.id, &mut stdout, &mut stderr)).await;
                match collected {
                    Ok(status) => status,
                    Err(_) => {
                        if let Err(err) = child.kill().await {
                            tracing::warn!(job_id = %job.id, error = %err, "failed to kill converter");
                        }
                        tracing::warn!(
                            job_id = %job.id,
                            stderr = %stderr.trim_end(),
                            "converter timed out"
                        );
                        job.stdout = stdout;
                        job.stderr = stderr;
                        return Err(JobError::TimedOut {
                            secs: limit.as_secs(),
                        });
                    }
                }
            }
            None => collect(&mut child, job.id, &mut stdout, &mut stderr).await,
        };

        job.stdout = stdout;
        job.stderr = stderr;
        let status = status?;
        job.exit_code = status.code();

        if !status.success() {
            return Err(JobError::Conversion {
                code: status.to_string(),
                stderr: job.stderr.clone(),
            });
        }

        interpret(&job.invocation, &job.stdout).await
    }
}

/// Drains both pipes while waiting for exit, so a chatty converter never
/// stalls on a full pipe. Lines land in the buffers as they arrive and stay
/// there if the future is dropped early.
async fn collect(
    child: &mut Child,
    job_id: Uuid,
    stdout: &mut String,
    stderr: &mut String,
) -> std::io::Result<ExitStatus> {
    let out = child.stdout.take();
    let err = child.stderr.take();

    let (_, _, status) = tokio::join!(
        drain(out, job_id, "stdout", stdout),
        drain(err, job_id, "stderr", stderr),
        child.wait(),
    );

    status
}

async fn drain<R>(stream: Option<R>, job_id: Uuid, name: &'static str, captured: &mut String)
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return;
    };

    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                tracing::debug!(job_id = %job_id, stream = name, line = %text.trim_end(), "converter output");
                captured.push_str(&text);
            }
            Err(err) => {
                tracing::warn!(job_id = %job_id, stream = name, error = %err, "failed reading converter output");
                break;
            }
        }
    }
}

/// Parses the whole of stdout as JSON, falling back to its last non-empty
/// line when the converter printed diagnostics first.
fn parse_reply<T>(stdout: &str) -> Result<T, JobError>
where
    T: serde::de::DeserializeOwned,
{
    let trimmed = stdout.trim();
    if let Ok(reply) = serde_json::from_str(trimmed) {
        return Ok(reply);
    }

    let last_line = trimmed.lines().rev().find(|line| !line.trim().is_empty()).unwrap_or("");
    serde_json::from_str(last_line.trim()).map_err(|err| JobError::Protocol {
        detail: format!("{err} in {:?}", truncate(trimmed, 200)),
    })
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

fn reported_name(name: &str) -> Result<ArtifactName, JobError> {
    ArtifactName::parse(name).ok_or_else(|| JobError::Protocol {
        detail: format!("{name:?} is not a usable file name"),
    })
}

async fn require_file(path: &Path) -> Result<(), JobError> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => Ok(()),
        _ => Err(JobError::MissingOutput {
            path: path.to_path_buf(),
        }),
    }
}

/// The caller-chosen output path, which must now exist.
async fn declared_file(invocation: &Invocation) -> Result<&Path, JobError> {
    let path = invocation.declared_output().ok_or_else(|| JobError::Protocol {
        detail: format!("{} declares no output path", invocation.name()),
    })?;
    require_file(path).await?;
    Ok(path)
}

async fn interpret(invocation: &Invocation, stdout: &str) -> Result<JobOutput, JobError> {
    match invocation {
        Invocation::FlattenPdf { .. } => {
            let output = declared_file(invocation).await?;
            Ok(JobOutput::File(output.to_path_buf()))
        }

        Invocation::ListClients => Ok(JobOutput::Clients(parse_reply::<Vec<Value>>(stdout)?)),

        Invocation::ConvertClient { output_dir, .. } | Invocation::GenerateEmptyFdf { output_dir } => {
            let reply: FdfReply = parse_reply(stdout)?;
            let name = reported_name(&reply.fdf_filename)?;
            require_file(&output_dir.join(name.as_str())).await?;
            Ok(JobOutput::Fdf(name))
        }

        Invocation::ConvertAllToZip { .. } => {
            let reply: ZipReply = parse_reply(stdout)?;
            reported_name(&reply.zip_filename)?;
            let zip_path = declared_file(invocation).await?;

            let file_name = zip_path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default();
            Ok(JobOutput::Zip(reported_name(file_name)?))
        }
    }
}
