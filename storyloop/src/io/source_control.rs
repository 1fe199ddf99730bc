//! Source-control provider contract and the git + `gh` implementation.
//!
//! Every provider call fails either transiently (network, rate limits) or
//! permanently (authentication, permissions, missing objects). The branch
//! manager retries the former and fails the run on the latter.

use std::path::PathBuf;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::core::classifier::{ProviderFailureKind, classify_provider_output};
use crate::io::config::SourceControlConfig;
use crate::io::git::Git;

/// A failed source-control call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("transient source-control error: {0}")]
    Transient(String),
    #[error("permanent source-control error: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify a provider failure from its diagnostic output.
    pub fn from_output(message: impl Into<String>) -> Self {
        let message = message.into();
        match classify_provider_output(&message) {
            ProviderFailureKind::Transient => Self::Transient(message),
            ProviderFailureKind::Permanent => Self::Permanent(message),
        }
    }
}

/// A branch known to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRef {
    pub name: String,
}

/// Changes to publish on a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestSpec {
    pub branch: BranchRef,
    pub title: String,
    pub body: String,
}

/// Narrow contract the branch manager drives.
#[async_trait]
pub trait SourceControl: Send + Sync {
    async fn branch_exists(&self, name: &str) -> Result<bool, ProviderError>;
    async fn create_branch(&self, name: &str) -> Result<BranchRef, ProviderError>;
    async fn push(&self, branch: &BranchRef, changes: &ChangeSet) -> Result<(), ProviderError>;
    async fn open_pull_request(&self, spec: &PullRequestSpec) -> Result<u64, ProviderError>;
    async fn merge_pull_request(&self, pr_number: u64) -> Result<(), ProviderError>;
}

/// Local git working copy plus the GitHub CLI for pull requests.
#[derive(Debug, Clone)]
pub struct GitSourceControl {
    git: Git,
    workdir: PathBuf,
    remote: String,
    base_branch: String,
}

impl GitSourceControl {
    pub fn new(config: &SourceControlConfig) -> Self {
        Self {
            git: Git::new(&config.workdir),
            workdir: config.workdir.clone(),
            remote: config.remote.clone(),
            base_branch: config.base_branch.clone(),
        }
    }

    async fn gh(&self, args: &[&str]) -> Result<String, ProviderError> {
        let output = Command::new("gh")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .await
            .map_err(|err| ProviderError::Permanent(format!("spawn gh {}: {err}", args.join(" "))))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::from_output(format!(
                "gh {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn classify(err: &anyhow::Error) -> ProviderError {
    ProviderError::from_output(format!("{err:#}"))
}

#[async_trait]
impl SourceControl for GitSourceControl {
    async fn branch_exists(&self, name: &str) -> Result<bool, ProviderError> {
        let local = self.git.branch_exists(name).await.map_err(|e| classify(&e))?;
        if local {
            return Ok(true);
        }
        self.git
            .remote_branch_exists(&self.remote, name)
            .await
            .map_err(|e| classify(&e))
    }

    #[instrument(skip_all, fields(branch = name))]
    async fn create_branch(&self, name: &str) -> Result<BranchRef, ProviderError> {
        self.git
            .checkout_new_branch(name)
            .await
            .map_err(|e| classify(&e))?;
        Ok(BranchRef {
            name: name.to_string(),
        })
    }

    #[instrument(skip_all, fields(branch = %branch.name))]
    async fn push(&self, branch: &BranchRef, changes: &ChangeSet) -> Result<(), ProviderError> {
        let current = self.git.current_branch().await.map_err(|e| classify(&e))?;
        if current != branch.name {
            self.git
                .checkout_branch(&branch.name)
                .await
                .map_err(|e| classify(&e))?;
        }
        self.git.add_all().await.map_err(|e| classify(&e))?;
        let committed = self
            .git
            .commit_staged(&changes.message)
            .await
            .map_err(|e| classify(&e))?;
        debug!(committed, "pushing run branch");
        self.git
            .push(&self.remote, &branch.name)
            .await
            .map_err(|e| classify(&e))
    }

    #[instrument(skip_all, fields(branch = %spec.branch.name))]
    async fn open_pull_request(&self, spec: &PullRequestSpec) -> Result<u64, ProviderError> {
        let out = self
            .gh(&[
                "pr",
                "create",
                "--head",
                &spec.branch.name,
                "--base",
                &self.base_branch,
                "--title",
                &spec.title,
                "--body",
                &spec.body,
            ])
            .await?;
        parse_pr_number(&out).ok_or_else(|| {
            ProviderError::Permanent(format!("could not parse pull request number from '{}'", out.trim()))
        })
    }

    #[instrument(skip_all, fields(pr_number))]
    async fn merge_pull_request(&self, pr_number: u64) -> Result<(), ProviderError> {
        self.gh(&["pr", "merge", &pr_number.to_string(), "--merge"])
            .await?;
        Ok(())
    }
}

static PR_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/pull/(\d+)").expect("pull request url pattern"));

/// Extract the PR number from `gh pr create` output (a PR URL).
fn parse_pr_number(output: &str) -> Option<u64> {
    PR_URL_RE
        .captures_iter(output)
        .last()
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
