//! Spawning and supervision of external scanner processes.
//!
//! A run forwards stdout and stderr, chunk by chunk and in arrival order, into
//! an [`OutputSink`]. Only a bounded tail of the output stays in memory.

use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
    process::Command,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const READ_CHUNK: usize = 8 * 1024;
const TAIL_LIMIT: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("binary not allowed: {0}")]
    NotAllowed(String),

    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error while supervising process: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Spawn failures worth retrying, e.g. resource exhaustion. A missing
    /// binary or a permission problem will not fix itself.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Spawn { source, .. } => !matches!(
                source.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Invocation {
    pub binary: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(binary: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            args,
            ..Self::default()
        }
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.binary.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub killed: bool,
    pub timed_out: bool,
    /// Last few KiB of combined output, for error reporting.
    pub output_tail: String,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        !self.killed && !self.timed_out && self.exit_code == Some(0)
    }
}

/// Receives output chunks as the process produces them.
#[async_trait]
pub trait OutputSink: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()>;
}

#[async_trait]
impl OutputSink for Vec<u8> {
    async fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.extend_from_slice(chunk);
        Ok(())
    }
}

/// Append-only log artifact, flushed after every chunk so tailing observers
/// see output as soon as it is produced.
pub struct LogArtifact {
    file: File,
}

impl LogArtifact {
    pub async fn create(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self { file })
    }

    pub async fn note(&mut self, line: &str) -> std::io::Result<()> {
        self.write_chunk(format!("\n{line}\n").as_bytes()).await
    }
}

#[async_trait]
impl OutputSink for LogArtifact {
    async fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.file.write_all(chunk).await?;
        self.file.flush().await
    }
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        invocation: &Invocation,
        sink: &mut dyn OutputSink,
        cancel: CancellationToken,
    ) -> Result<ProcessOutcome, RunnerError>;
}

/// Runs real processes through `tokio::process`, restricted to an allowlist
/// of binaries.
#[derive(Debug, Clone)]
pub struct TokioProcessRunner {
    allowed: Vec<String>,
}

impl TokioProcessRunner {
    pub fn new(allowed: Vec<String>) -> Self {
        Self { allowed }
    }

    fn is_allowed(&self, binary: &str) -> bool {
        self.allowed.iter().any(|b| b == binary)
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        sink: &mut dyn OutputSink,
        cancel: CancellationToken,
    ) -> Result<ProcessOutcome, RunnerError> {
        if !self.is_allowed(&invocation.binary) {
            return Err(RunnerError::NotAllowed(invocation.binary.clone()));
        }

        info!(command = %invocation.command_line(), "audit: launching external tool");
        let mut child = Command::new(&invocation.binary)
            .args(&invocation.args)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                binary: invocation.binary.clone(),
                source,
            })?;

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut out_buf = vec![0u8; READ_CHUNK];
        let mut err_buf = vec![0u8; READ_CHUNK];
        let mut tail = Tail::default();
        let mut killed = false;
        let mut timed_out = false;

        let deadline = invocation.timeout.map(|t| tokio::time::Instant::now() + t);
        let timeout = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timeout);

        while stdout.is_some() || stderr.is_some() {
            tokio::select! {
                read = read_pipe(&mut stdout, &mut out_buf), if stdout.is_some() => {
                    match read? {
                        0 => stdout = None,
                        n => {
                            sink.write_chunk(&out_buf[..n]).await?;
                            tail.push(&out_buf[..n]);
                        }
                    }
                }
                read = read_pipe(&mut stderr, &mut err_buf), if stderr.is_some() => {
                    match read? {
                        0 => stderr = None,
                        n => {
                            sink.write_chunk(&err_buf[..n]).await?;
                            tail.push(&err_buf[..n]);
                        }
                    }
                }
                _ = cancel.cancelled(), if !killed => {
                    warn!(binary = %invocation.binary, "stop requested, killing process");
                    child.start_kill()?;
                    killed = true;
                }
                _ = &mut timeout, if !killed => {
                    warn!(binary = %invocation.binary, "run timed out, killing process");
                    child.start_kill()?;
                    killed = true;
                    timed_out = true;
                }
            }
        }

        let status = child.wait().await?;
        Ok(ProcessOutcome {
            exit_code: status.code(),
            killed: killed && !timed_out,
            timed_out,
            output_tail: tail.into_string(),
        })
    }
}

async fn read_pipe<R>(pipe: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncReadExt + Unpin,
{
    match pipe.as_mut() {
        Some(p) => p.read(buf).await,
        None => Ok(0),
    }
}

#[derive(Default)]
struct Tail {
    bytes: VecDeque<u8>,
}

impl Tail {
    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend(chunk);
        let excess = self.bytes.len().saturating_sub(TAIL_LIMIT);
        self.bytes.drain(..excess);
    }

    fn into_string(self) -> String {
        let bytes: Vec<u8> = self.bytes.into();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
