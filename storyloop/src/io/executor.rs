//! Agent executor abstraction.
//!
//! The [`AgentExecutor`] trait decouples the iteration driver from the actual
//! agent backend. An execution yields a stream of [`ExecutorMessage`]s: any
//! number of text/tool messages followed by one terminal verdict. Tests use
//! scripted executors that return predetermined streams without spawning
//! processes.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::core::types::Story;
use crate::io::config::ExecutorConfig;

/// Buffer between the executor and the relay task.
const MESSAGE_BUFFER: usize = 64;

/// How long a process may keep running after it reported its verdict.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Everything the agent needs to work on one story.
#[derive(Debug, Clone)]
pub struct StoryContext {
    pub run_id: String,
    pub iteration: u32,
    /// 1-based attempt number for this story.
    pub attempt: u32,
    pub story: Story,
    pub branch: String,
    /// Rendered story prompt.
    pub prompt: String,
}

/// One message of the executor's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ExecutorMessage {
    Text {
        text: String,
    },
    Tool {
        name: String,
        #[serde(default)]
        input: Value,
    },
    /// Terminal: the agent confirmed the acceptance criteria.
    Success {
        #[serde(default)]
        cost_usd: f64,
        #[serde(default)]
        summary: Option<String>,
    },
    /// Terminal: the agent could not finish. `fatal` means retrying is pointless.
    Failure {
        reason: String,
        #[serde(default)]
        fatal: bool,
        #[serde(default)]
        cost_usd: f64,
    },
}

impl ExecutorMessage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success { .. } | Self::Failure { .. })
    }
}

/// Abstraction over agent execution backends.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Start working on a story. The credential is passed through uninspected.
    ///
    /// Dropping the returned receiver abandons the execution.
    async fn execute(
        &self,
        context: &StoryContext,
        credential: Option<&SecretString>,
    ) -> Result<mpsc::Receiver<ExecutorMessage>>;
}

/// Executor that spawns a local agent process speaking JSON lines on stdout.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    command: Vec<String>,
    workdir: PathBuf,
    credential_env: String,
    stderr_limit_bytes: usize,
}

impl ProcessExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            command: config.command.clone(),
            workdir: config.workdir.clone(),
            credential_env: config.credential_env.clone(),
            stderr_limit_bytes: config.stderr_limit_bytes,
        }
    }
}

#[async_trait]
impl AgentExecutor for ProcessExecutor {
    #[instrument(skip_all, fields(run_id = %context.run_id, iteration = context.iteration, story_id = %context.story.id))]
    async fn execute(
        &self,
        context: &StoryContext,
        credential: Option<&SecretString>,
    ) -> Result<mpsc::Receiver<ExecutorMessage>> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("executor command is empty"))?;
        info!(program = %program, workdir = %self.workdir.display(), "starting agent process");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("STORYLOOP_RUN_ID", &context.run_id)
            .env("STORYLOOP_ITERATION", context.iteration.to_string())
            .env("STORYLOOP_STORY_ID", &context.story.id)
            .env("STORYLOOP_ATTEMPT", context.attempt.to_string())
            .env("STORYLOOP_BRANCH", &context.branch)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(credential) = credential {
            cmd.env(&self.credential_env, credential.expose_secret());
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn agent process '{program}'"))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let prompt = context.prompt.clone();
        tokio::spawn(async move {
            if let Err(err) = stdin.write_all(prompt.as_bytes()).await {
                warn!(err = %err, "failed to write prompt to agent stdin");
            }
        });
        let stderr_limit = self.stderr_limit_bytes;
        let stderr_task = tokio::spawn(read_tail(stderr, stderr_limit));

        let (tx, rx) = mpsc::channel(MESSAGE_BUFFER);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut verdict_sent = false;
            loop {
                let line = tokio::select! {
                    () = tx.closed() => {
                        debug!("receiver dropped, killing agent process");
                        return;
                    }
                    line = lines.next_line() => line,
                };
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(err = %err, "failed to read agent stdout");
                        break;
                    }
                };
                let Some(message) = parse_line(&line) else {
                    continue;
                };
                let terminal = message.is_terminal();
                if tx.send(message).await.is_err() {
                    return;
                }
                if terminal {
                    verdict_sent = true;
                    break;
                }
            }

            let status = match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => Some(status),
                Ok(Err(err)) => {
                    warn!(err = %err, "failed to wait for agent process");
                    None
                }
                Err(_) => {
                    debug!("agent process still running after verdict, killing");
                    None
                }
            };
            if verdict_sent {
                return;
            }
            let stderr_tail = stderr_task.await.unwrap_or_default();
            let code = status
                .and_then(|status| status.code())
                .map_or_else(|| "unknown".to_string(), |code| code.to_string());
            let mut reason = format!("agent exited without a verdict (exit code {code})");
            let tail = stderr_tail.trim();
            if !tail.is_empty() {
                reason.push_str(": ");
                reason.push_str(tail);
            }
            warn!(exit_code = %code, "agent process ended without verdict");
            let _ = tx
                .send(ExecutorMessage::Failure {
                    reason,
                    fatal: false,
                    cost_usd: 0.0,
                })
                .await;
        });
        Ok(rx)
    }
}

/// Parse one stdout line. Lines that are not protocol messages are relayed as text.
fn parse_line(line: &str) -> Option<ExecutorMessage> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<ExecutorMessage>(trimmed) {
        Ok(message) => Some(message),
        Err(_) => Some(ExecutorMessage::Text {
            text: line.to_string(),
        }),
    }
}

/// Drain a stream, keeping only the last `limit` bytes.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> String {
    let mut kept = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                kept.extend_from_slice(&buf[..n]);
                if kept.len() > limit {
                    let excess = kept.len() - limit;
                    kept.drain(..excess);
                }
            }
            Err(err) => {
                warn!(err = %err, "failed to read agent stderr");
                break;
            }
        }
    }
    String::from_utf8_lossy(&kept).to_string()
}
