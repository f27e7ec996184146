//! Engine boundary
//!
//! The engine is untrusted. It receives one [`EngineInput`] per call and
//! answers with one [`EngineOutput`]; everything it claims is checked by the
//! orchestrator before it reaches the WAL.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use cabincrew_types::{EngineInput, EngineOutput, Secrets};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use crate::config::EngineConfig;

/// Errors from an engine call
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine is not configured")]
    NotConfigured,

    #[error("failed to spawn engine `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },

    #[error("engine output is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("engine {stream} exceeded {limit} bytes")]
    OutputTooLarge { stream: &'static str, limit: u64 },

    #[error("engine did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("engine protocol violation: {0}")]
    Protocol(String),

    #[error("engine reported failure: {0}")]
    Failed(String),
}

/// Something that runs flight-plans and take-offs
#[async_trait]
pub trait Engine: Send + Sync {
    async fn invoke(&self, input: EngineInput) -> Result<EngineOutput, EngineError>;
}

/// Per-call secret material.
///
/// Copied into the engine request only; never part of a WAL entry.
#[derive(Clone, Debug, Default)]
pub struct EngineCredentials {
    pub secrets: Option<Secrets>,
    pub allowed_secrets: Vec<String>,
    pub identity_token: Option<Secrets>,
}

impl EngineCredentials {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_secrets(mut self, secrets: Secrets) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn allow_secret(mut self, name: impl Into<String>) -> Self {
        self.allowed_secrets.push(name.into());
        self
    }

    pub fn with_identity_token(mut self, token: Secrets) -> Self {
        self.identity_token = Some(token);
        self
    }

    pub(crate) fn apply(self, input: &mut EngineInput) {
        input.secrets = self.secrets;
        input.allowed_secrets = self.allowed_secrets;
        input.identity_token = self.identity_token;
    }
}

/// Runs the engine as a child process speaking JSON over stdin/stdout.
///
/// The child is killed when the call future is dropped, which is how a
/// timeout in the orchestrator cancels it.
#[derive(Debug, Clone)]
pub struct SubprocessEngine {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    max_output_bytes: u64,
}

impl SubprocessEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            max_output_bytes: EngineConfig::default().max_output_bytes,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        let program = config.command.clone().ok_or(EngineError::NotConfigured)?;
        Ok(Self {
            program,
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
            max_output_bytes: config.max_output_bytes,
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn max_output_bytes(mut self, limit: u64) -> Self {
        self.max_output_bytes = limit;
        self
    }
}

/// Read a child stream to its end, or fail once it passes `limit` bytes.
async fn read_bounded<R: AsyncRead + Unpin>(
    reader: R,
    stream: &'static str,
    limit: u64,
) -> Result<Vec<u8>, EngineError> {
    let mut buf = Vec::new();
    reader.take(limit.saturating_add(1)).read_to_end(&mut buf).await?;
    if buf.len() as u64 > limit {
        return Err(EngineError::OutputTooLarge { stream, limit });
    }
    Ok(buf)
}

#[async_trait]
impl Engine for SubprocessEngine {
    async fn invoke(&self, input: EngineInput) -> Result<EngineOutput, EngineError> {
        let request = serde_json::to_vec(&input)?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| EngineError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        debug!(
            program = %self.program,
            mode = %input.mode,
            workflow_id = %input.meta.workflow_id,
            "Engine spawned"
        );

        let unavailable = |stream: &str| EngineError::Protocol(format!("engine {stream} unavailable"));
        let mut stdin = child.stdin.take().ok_or_else(|| unavailable("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| unavailable("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| unavailable("stderr"))?;
        let write = async move {
            let written = async {
                stdin.write_all(&request).await?;
                stdin.shutdown().await
            };
            match written.await {
                // An engine may exit cleanly without reading all of stdin.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                other => other.map_err(EngineError::Io),
            }
        };

        // On error the child is dropped, and killed, with the streams unread
        let limit = self.max_output_bytes;
        let ((), stdout, stderr) = tokio::try_join!(
            write,
            read_bounded(stdout, "stdout", limit),
            read_bounded(stderr, "stderr", limit),
        )?;
        let status = child.wait().await?;

        if !status.success() {
            return Err(EngineError::Exit {
                status: status.to_string(),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }
        Ok(serde_json::from_slice(&stdout)?)
    }
}
