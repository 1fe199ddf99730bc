//! Branch and pull-request lifecycle for a run.
//!
//! The manager keeps no state of its own: the run branch and the run's single
//! open pull request are recorded on the [`Run`] it is handed. Transient
//! provider errors are retried with bounded exponential backoff; anything else
//! is returned to the caller, which fails the run.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::backoff::BackoffPolicy;
use crate::core::types::{Run, Story};
use crate::io::source_control::{
    BranchRef, ChangeSet, ProviderError, PullRequestSpec, SourceControl,
};

/// Give up looking for a free branch name after this many suffixes.
const MAX_BRANCH_SUFFIX: u32 = 100;

/// Result of [`BranchManager::ensure_run_branch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsuredBranch {
    pub branch: BranchRef,
    /// True when this call created the branch.
    pub created: bool,
}

/// Result of [`BranchManager::on_story_success`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorySuccess {
    pub pr_created: bool,
    pub pr_number: Option<u64>,
}

pub struct BranchManager {
    provider: Arc<dyn SourceControl>,
    retry: BackoffPolicy,
}

impl BranchManager {
    pub fn new(provider: Arc<dyn SourceControl>, retry: BackoffPolicy) -> Self {
        Self { provider, retry }
    }

    /// Return the run branch, creating it on first use.
    ///
    /// The name derives from the backlog's declared branch; when that name is
    /// taken, `-2`, `-3`, ... are appended until a free name is found.
    #[instrument(skip_all, fields(run_id = %run.id))]
    pub async fn ensure_run_branch(&self, run: &mut Run) -> Result<EnsuredBranch> {
        if let Some(name) = &run.branch_name {
            return Ok(EnsuredBranch {
                branch: BranchRef { name: name.clone() },
                created: false,
            });
        }
        let base = run.declared_branch.trim().to_string();
        for suffix in 1..=MAX_BRANCH_SUFFIX {
            let candidate = if suffix == 1 {
                base.clone()
            } else {
                format!("{base}-{suffix}")
            };
            let exists = self
                .with_retry("branch_exists", || self.provider.branch_exists(&candidate))
                .await
                .with_context(|| format!("check branch {candidate}"))?;
            if exists {
                debug!(branch = %candidate, "branch name taken");
                continue;
            }
            let branch = self
                .with_retry("create_branch", || self.provider.create_branch(&candidate))
                .await
                .with_context(|| format!("create branch {candidate}"))?;
            info!(branch = %branch.name, "created run branch");
            run.branch_name = Some(branch.name.clone());
            return Ok(EnsuredBranch {
                branch,
                created: true,
            });
        }
        bail!("no free branch name for '{base}' after {MAX_BRANCH_SUFFIX} attempts")
    }

    /// Publish a passed story: push its commit and open the run's pull
    /// request if none is open yet.
    #[instrument(skip_all, fields(run_id = %run.id, story_id = %story.id))]
    pub async fn on_story_success(&self, run: &mut Run, story: &Story) -> Result<StorySuccess> {
        let Some(name) = run.branch_name.clone() else {
            bail!("run {} has no branch to publish story {}", run.id, story.id);
        };
        let branch = BranchRef { name };
        let changes = ChangeSet {
            message: format!("{}: {}", story.id, story.title),
        };
        self.with_retry("push", || self.provider.push(&branch, &changes))
            .await
            .with_context(|| format!("push branch {}", branch.name))?;

        if let Some(pr_number) = run.pr_number {
            debug!(pr_number, "pushed to existing pull request");
            return Ok(StorySuccess {
                pr_created: false,
                pr_number: Some(pr_number),
            });
        }
        let spec = PullRequestSpec {
            branch: branch.clone(),
            title: format!("storyloop: {}", run.declared_branch),
            body: pull_request_body(run),
        };
        let pr_number = self
            .with_retry("open_pull_request", || self.provider.open_pull_request(&spec))
            .await
            .with_context(|| format!("open pull request for {}", branch.name))?;
        info!(pr_number, "opened pull request");
        run.pr_number = Some(pr_number);
        Ok(StorySuccess {
            pr_created: true,
            pr_number: Some(pr_number),
        })
    }

    /// Merge the run's pull request, if it has one.
    #[instrument(skip_all, fields(run_id = %run.id))]
    pub async fn merge_run_pr(&self, run: &Run) -> Result<Option<u64>> {
        let Some(pr_number) = run.pr_number else {
            return Ok(None);
        };
        self.with_retry("merge_pull_request", || {
            self.provider.merge_pull_request(pr_number)
        })
        .await
        .with_context(|| format!("merge pull request #{pr_number}"))?;
        info!(pr_number, "merged pull request");
        Ok(Some(pr_number))
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => match self.retry.delay_after(attempt) {
                    Some(delay) => {
                        warn!(op, attempt, delay_ms = delay.as_millis() as u64, err = %err, "transient provider error, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        warn!(op, attempt, err = %err, "transient provider error, retries exhausted");
                        return Err(err);
                    }
                },
                Err(err) => return Err(err),
            }
        }
    }
}

fn pull_request_body(run: &Run) -> String {
    let mut body = format!(
        "Automated run `{}` for project `{}`.\n\nStories:\n",
        run.id, run.project_id
    );
    for story in &run.backlog.stories {
        let mark = if story.passes { "x" } else { " " };
        body.push_str(&format!("- [{mark}] {}: {}\n", story.id, story.title));
    }
    body
}
