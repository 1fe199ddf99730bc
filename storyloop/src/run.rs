//! Run state machine worker.
//!
//! One worker drives one run: select a story, check the budget, prepare the
//! branch, run one iteration, apply the outcome, checkpoint. Control requests
//! (pause, cancel) are honoured only at the top of the loop, so an iteration in
//! flight always runs to completion or timeout. A checkpoint that cannot be
//! written halts the loop.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::branch::BranchManager;
use crate::core::budget;
use crate::core::selector::select_next;
use crate::core::transitions::is_allowed;
use crate::core::types::{IterationOutcome, Run, RunStatus};
use crate::driver::IterationDriver;
use crate::events::{EventBus, EventPayload};
use crate::io::config::{FatalStoryPolicy, OrchestratorConfig};
use crate::io::store::RunStore;
use crate::registry::{RunCommand, RunHandle};

/// Collaborators shared by every run worker of one orchestrator.
pub struct RunDeps {
    pub config: OrchestratorConfig,
    pub store: Arc<dyn RunStore>,
    pub bus: Arc<EventBus>,
    pub branches: BranchManager,
    pub driver: IterationDriver,
}

impl RunDeps {
    /// Persist the run and publish the new snapshot.
    pub async fn checkpoint(&self, handle: &RunHandle, run: &mut Run) -> Result<()> {
        run.next_sequence = self.bus.next_sequence(&run.id).await?;
        run.updated_at = Utc::now();
        run.revision = self
            .store
            .save(run)
            .await
            .with_context(|| format!("checkpoint run {}", run.id))?;
        handle.publish(run);
        Ok(())
    }

    /// Move the run to `to`, emitting `run_status_changed` before persisting.
    pub async fn transition(
        &self,
        handle: &RunHandle,
        run: &mut Run,
        to: RunStatus,
        reason: Option<String>,
    ) -> Result<()> {
        let from = run.status;
        if !is_allowed(from, to) {
            bail!("illegal run transition {from} -> {to}");
        }
        info!(run_id = %run.id, %from, %to, reason = reason.as_deref().unwrap_or(""), "run status changed");
        self.bus
            .publish(
                &run.id,
                None,
                EventPayload::RunStatusChanged {
                    from,
                    to,
                    reason: reason.clone(),
                },
            )
            .await?;
        run.status = to;
        if to == RunStatus::Failed {
            run.error = reason;
        }
        self.checkpoint(handle, run).await
    }
}

/// Worker entry point. Detaches from the handle when the run stops.
pub async fn drive(deps: Arc<RunDeps>, handle: Arc<RunHandle>, mut run: Run) {
    if let Err(err) = drive_loop(&deps, &handle, &mut run).await {
        let message = format!("{err:#}");
        error!(run_id = %run.id, err = %message, "run halted");
        halt(&deps, &handle, &mut run, message).await;
    }
    finish(&deps, &handle, &mut run).await;
}

#[instrument(skip_all, fields(run_id = %run.id))]
async fn drive_loop(deps: &RunDeps, handle: &RunHandle, run: &mut Run) -> Result<()> {
    if run.status != RunStatus::Running {
        let reason = match run.status {
            RunStatus::Paused => "resumed",
            _ => "started",
        };
        deps.transition(handle, run, RunStatus::Running, Some(reason.to_string()))
            .await?;
    }

    loop {
        match handle.command() {
            RunCommand::Continue => {}
            RunCommand::Pause => {
                return deps
                    .transition(handle, run, RunStatus::Paused, Some("pause requested".to_string()))
                    .await;
            }
            RunCommand::Cancel => {
                return deps
                    .transition(handle, run, RunStatus::Cancelled, Some("cancel requested".to_string()))
                    .await;
            }
        }

        let Some(story) = select_next(&run.backlog).cloned() else {
            return complete(deps, handle, run).await;
        };

        if let Some(stop) = budget::exhaustion(run) {
            let remaining = run.backlog.remaining_ids();
            let reason = format!(
                "{stop}; {} stories remaining: {}",
                remaining.len(),
                remaining.join(", ")
            );
            return deps
                .transition(handle, run, RunStatus::Exhausted, Some(reason))
                .await;
        }

        let ensured = match deps.branches.ensure_run_branch(run).await {
            Ok(ensured) => ensured,
            Err(err) => {
                return deps
                    .transition(handle, run, RunStatus::Failed, Some(format!("{err:#}")))
                    .await;
            }
        };
        if ensured.created {
            deps.bus
                .publish(
                    &run.id,
                    None,
                    EventPayload::BranchCreated {
                        branch_name: ensured.branch.name.clone(),
                    },
                )
                .await?;
        }

        let number = run.iterations_used + 1;
        run.current_story_id = Some(story.id.clone());
        deps.checkpoint(handle, run).await?;

        let record = deps
            .driver
            .run_iteration(run, &story, &ensured.branch, number)
            .await?;
        budget::charge(run, &record)?;
        let attempts = {
            let entry = run
                .backlog
                .get_mut(&story.id)
                .ok_or_else(|| anyhow!("story {} vanished from backlog", story.id))?;
            entry.attempts += 1;
            if record.outcome == IterationOutcome::Success {
                entry.passes = true;
            }
            entry.attempts
        };
        let outcome = record.outcome;
        let error = record.error.clone();
        run.iterations.push(record);
        run.current_story_id = None;
        debug!(iteration = number, story_id = %story.id, ?outcome, "iteration applied");

        match outcome {
            IterationOutcome::Success => {
                let published = deps.branches.on_story_success(run, &story).await;
                let success = match published {
                    Ok(success) => success,
                    Err(err) => {
                        return deps
                            .transition(handle, run, RunStatus::Failed, Some(format!("{err:#}")))
                            .await;
                    }
                };
                if success.pr_created
                    && let Some(pr_number) = success.pr_number
                {
                    deps.bus
                        .publish(
                            &run.id,
                            None,
                            EventPayload::PrCreated {
                                pr_number,
                                branch_name: ensured.branch.name.clone(),
                            },
                        )
                        .await?;
                }
                deps.bus
                    .publish(
                        &run.id,
                        Some(number),
                        EventPayload::StoryCompleted {
                            story_id: story.id.clone(),
                            attempts,
                        },
                    )
                    .await?;
                deps.checkpoint(handle, run).await?;
            }
            IterationOutcome::RetryableFailure => {
                deps.checkpoint(handle, run).await?;
            }
            IterationOutcome::FatalFailure => {
                let reason = format!(
                    "story {} failed: {}",
                    story.id,
                    error.unwrap_or_else(|| "unknown error".to_string())
                );
                match deps.config.fatal_story_policy {
                    FatalStoryPolicy::FailRun => {
                        return deps
                            .transition(handle, run, RunStatus::Failed, Some(reason))
                            .await;
                    }
                    FatalStoryPolicy::SkipStory => {
                        warn!(story_id = %story.id, reason = %reason, "skipping story");
                        if let Some(entry) = run.backlog.get_mut(&story.id) {
                            entry.skipped = true;
                        }
                        deps.checkpoint(handle, run).await?;
                    }
                }
            }
        }
    }
}

/// No eligible story remains.
async fn complete(deps: &RunDeps, handle: &RunHandle, run: &mut Run) -> Result<()> {
    let skipped = run.backlog.skipped_ids();
    if !skipped.is_empty() {
        let reason = format!("stories skipped after fatal failures: {}", skipped.join(", "));
        return deps
            .transition(handle, run, RunStatus::Failed, Some(reason))
            .await;
    }
    if deps.config.auto_merge {
        match deps.branches.merge_run_pr(run).await {
            Ok(Some(pr_number)) => {
                deps.bus
                    .publish(&run.id, None, EventPayload::PrMerged { pr_number })
                    .await?;
            }
            Ok(None) => {}
            Err(err) => {
                return deps
                    .transition(handle, run, RunStatus::Failed, Some(format!("{err:#}")))
                    .await;
            }
        }
    }
    deps.transition(
        handle,
        run,
        RunStatus::Completed,
        Some("all stories passed".to_string()),
    )
    .await
}

/// The loop failed internally (usually persistence). Record the failure in
/// memory and make a best-effort attempt to persist it.
async fn halt(deps: &RunDeps, handle: &RunHandle, run: &mut Run, message: String) {
    if run.status.is_terminal() {
        handle.publish(run);
        return;
    }
    if let Err(err) = deps
        .transition(handle, run, RunStatus::Failed, Some(message.clone()))
        .await
    {
        warn!(run_id = %run.id, err = %format!("{err:#}"), "could not persist failed status");
    }
    if run.status != RunStatus::Failed {
        run.status = RunStatus::Failed;
        run.error = Some(message);
        run.updated_at = Utc::now();
    }
    handle.publish(run);
}

/// Detach the worker. A cancel that raced with a pause is applied here.
async fn finish(deps: &RunDeps, handle: &RunHandle, run: &mut Run) {
    let _lifecycle = handle.lock_lifecycle().await;
    if run.status == RunStatus::Paused && handle.command() == RunCommand::Cancel {
        if let Err(err) = deps
            .transition(handle, run, RunStatus::Cancelled, Some("cancel requested".to_string()))
            .await
        {
            warn!(run_id = %run.id, err = %format!("{err:#}"), "could not cancel paused run");
        }
    }
    handle.set_busy(false);
    debug!(run_id = %run.id, status = %run.status, "worker detached");
}
