//! Orchestrator configuration stored under `.storyloop/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::backoff::BackoffPolicy;

/// What to do when a single story fails fatally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalStoryPolicy {
    /// Stop the whole run (later stories may depend on this one).
    #[default]
    FailRun,
    /// Mark the story skipped and continue with the rest of the backlog.
    SkipStory,
}

/// Orchestrator configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Per-iteration wall-clock timeout in seconds.
    pub iteration_timeout_secs: u64,

    /// Iterations a story may consume before a retryable failure becomes fatal.
    pub max_attempts_per_story: u32,

    pub fatal_story_policy: FatalStoryPolicy,

    /// Merge the run's pull request once every story passes.
    pub auto_merge: bool,

    /// Maximum bytes for the rendered story prompt before dropping sections.
    pub prompt_budget_bytes: usize,

    /// Live broadcast buffer per run; lagging subscribers fall back to the log.
    pub event_channel_capacity: usize,

    /// Root directory of the file run store.
    pub state_dir: PathBuf,

    /// Environment variable the binaries read the agent credential from.
    pub credential_env: String,

    pub executor: ExecutorConfig,

    pub source_control: SourceControlConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Command to execute for each iteration (e.g. `["storyloop-agent"]`).
    pub command: Vec<String>,
    pub workdir: PathBuf,
    /// Environment variable the credential is passed through in.
    pub credential_env: String,
    /// Keep at most this many trailing stderr bytes for error reports.
    pub stderr_limit_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: vec!["storyloop-agent".to_string()],
            workdir: PathBuf::from("."),
            credential_env: "AGENT_CREDENTIAL".to_string(),
            stderr_limit_bytes: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SourceControlConfig {
    pub workdir: PathBuf,
    pub remote: String,
    /// Base branch pull requests target.
    pub base_branch: String,
    pub retry: BackoffPolicy,
}

impl Default for SourceControlConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("."),
            remote: "origin".to_string(),
            base_branch: "main".to_string(),
            retry: BackoffPolicy::default(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            iteration_timeout_secs: 30 * 60,
            max_attempts_per_story: 3,
            fatal_story_policy: FatalStoryPolicy::FailRun,
            auto_merge: false,
            prompt_budget_bytes: 40_000,
            event_channel_capacity: 256,
            state_dir: PathBuf::from(".storyloop"),
            credential_env: "STORYLOOP_AGENT_CREDENTIAL".to_string(),
            executor: ExecutorConfig::default(),
            source_control: SourceControlConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.iteration_timeout_secs == 0 {
            return Err(anyhow!("iteration_timeout_secs must be > 0"));
        }
        if self.max_attempts_per_story == 0 {
            return Err(anyhow!("max_attempts_per_story must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.event_channel_capacity == 0 {
            return Err(anyhow!("event_channel_capacity must be > 0"));
        }
        if self.executor.command.is_empty() || self.executor.command[0].trim().is_empty() {
            return Err(anyhow!("executor.command must be a non-empty array"));
        }
        if self.executor.stderr_limit_bytes == 0 {
            return Err(anyhow!("executor.stderr_limit_bytes must be > 0"));
        }
        if self.source_control.retry.attempts == 0 {
            return Err(anyhow!("source_control.retry.attempts must be > 0"));
        }
        if self.source_control.remote.trim().is_empty() {
            return Err(anyhow!("source_control.remote must not be blank"));
        }
        Ok(())
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, OrchestratorConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/config.toml");
        let cfg = OrchestratorConfig {
            fatal_story_policy: FatalStoryPolicy::SkipStory,
            auto_merge: true,
            ..OrchestratorConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "iteration_timeout_secs = 60\nfatal_story_policy = \"skip_story\"\n\n[source_control.retry]\nattempts = 5\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.iteration_timeout_secs, 60);
        assert_eq!(cfg.fatal_story_policy, FatalStoryPolicy::SkipStory);
        assert_eq!(cfg.source_control.retry.attempts, 5);
        assert_eq!(cfg.source_control.retry.base_delay_ms, 1_000);
        assert_eq!(cfg.max_attempts_per_story, 3);
    }

    #[test]
    fn rejects_zero_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "iteration_timeout_secs = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("iteration_timeout_secs"));
    }
}
