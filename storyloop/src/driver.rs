//! Iteration driver: one attempt at one story.
//!
//! ```text
//! idle -> preparing -> executing -> evaluating -> succeeded
//!                                              -> retryable_failed
//!                                              -> fatally_failed
//! ```
//!
//! The relay reads the executor stream and publishes text/tool messages in
//! arrival order until the verdict arrives. The per-iteration timeout is the
//! only thing that stops an execution, and it never interrupts a publish.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use secrecy::SecretString;
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::{FailureKind, classify_failure};
use crate::core::types::{IterationOutcome, IterationRecord, Run, Story};
use crate::events::{EventBus, EventPayload};
use crate::io::executor::{AgentExecutor, ExecutorMessage, StoryContext};
use crate::io::prompt::{PromptBuilder, PromptInputs};
use crate::io::source_control::BranchRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverState {
    Preparing,
    Executing,
    Evaluating,
    Succeeded,
    RetryableFailed,
    FatallyFailed,
}

/// How the execution ended, before classification.
#[derive(Debug, Clone, PartialEq)]
enum Verdict {
    Success { cost: f64, summary: Option<String> },
    Failure { reason: String, fatal: bool, cost: f64 },
    /// The executor could not start or its stream ended without a verdict.
    Crashed(String),
    TimedOut(Duration),
}

impl Verdict {
    fn cost(&self) -> f64 {
        match self {
            Self::Success { cost, .. } | Self::Failure { cost, .. } => *cost,
            Self::Crashed(_) | Self::TimedOut(_) => 0.0,
        }
    }
}

pub struct IterationDriver {
    executor: Arc<dyn AgentExecutor>,
    bus: Arc<EventBus>,
    prompts: PromptBuilder,
    timeout: Duration,
    max_attempts: u32,
    credential: Option<SecretString>,
}

impl IterationDriver {
    pub fn new(
        executor: Arc<dyn AgentExecutor>,
        bus: Arc<EventBus>,
        prompts: PromptBuilder,
        timeout: Duration,
        max_attempts: u32,
        credential: Option<SecretString>,
    ) -> Self {
        Self {
            executor,
            bus,
            prompts,
            timeout,
            max_attempts,
            credential,
        }
    }

    /// Execute iteration `number` of `run` against `story`.
    ///
    /// Emits exactly one `iteration_started` and then exactly one of
    /// `iteration_completed` / `iteration_failed`. Errors are reserved for
    /// failures of the orchestrator itself (event persistence, prompt
    /// rendering); every executor failure is reported through the record.
    #[instrument(skip_all, fields(run_id = %run.id, iteration = number, story_id = %story.id))]
    pub async fn run_iteration(
        &self,
        run: &Run,
        story: &Story,
        branch: &BranchRef,
        number: u32,
    ) -> Result<IterationRecord> {
        let run_id = run.id.as_str();
        let mut state = DriverState::Preparing;
        debug!(?state, "iteration state");
        let inputs = PromptInputs::from_run(run, story, &branch.name);
        let attempt = inputs.attempt;
        let prompt = self.prompts.build(&inputs)?;
        let context = StoryContext {
            run_id: run.id.clone(),
            iteration: number,
            attempt,
            story: story.clone(),
            branch: branch.name.clone(),
            prompt,
        };

        let started_at = Utc::now();
        let clock = Instant::now();
        self.bus
            .publish(
                run_id,
                Some(number),
                EventPayload::IterationStarted {
                    story_id: story.id.clone(),
                    attempt,
                },
            )
            .await?;
        state = DriverState::Executing;
        debug!(?state, attempt, "iteration state");

        let verdict = self.execute(context).await?;

        state = DriverState::Evaluating;
        debug!(?state, ?verdict, "iteration state");
        let duration_seconds = clock.elapsed().as_secs_f64();
        let cost = verdict.cost();
        let (outcome, error, summary) = match verdict {
            Verdict::Success { summary, .. } => (IterationOutcome::Success, None, summary),
            Verdict::Failure {
                reason,
                fatal: true,
                ..
            } => (
                classify_failure(FailureKind::Unrecoverable, attempt, self.max_attempts),
                Some(reason),
                None,
            ),
            Verdict::Failure { reason, .. } | Verdict::Crashed(reason) => (
                classify_failure(FailureKind::Recoverable, attempt, self.max_attempts),
                Some(reason),
                None,
            ),
            Verdict::TimedOut(limit) => (
                classify_failure(FailureKind::Recoverable, attempt, self.max_attempts),
                Some(format!("iteration timed out after {}s", limit.as_secs())),
                None,
            ),
        };
        state = match outcome {
            IterationOutcome::Success => DriverState::Succeeded,
            IterationOutcome::RetryableFailure => DriverState::RetryableFailed,
            IterationOutcome::FatalFailure => DriverState::FatallyFailed,
        };
        info!(?state, cost, duration_seconds, "iteration finished");

        let payload = match (&outcome, &error) {
            (IterationOutcome::Success, _) => EventPayload::IterationCompleted {
                story_id: story.id.clone(),
                cost_usd: cost,
                duration_seconds,
                summary: summary.clone(),
            },
            (_, error) => EventPayload::IterationFailed {
                story_id: story.id.clone(),
                retryable: outcome == IterationOutcome::RetryableFailure,
                error: error.clone().unwrap_or_default(),
                cost_usd: cost,
                duration_seconds,
            },
        };
        self.bus.publish(run_id, Some(number), payload).await?;

        Ok(IterationRecord {
            number,
            story_id: story.id.clone(),
            outcome,
            cost,
            duration_seconds,
            started_at,
            ended_at: Utc::now(),
            error,
            summary,
        })
    }

    /// Run the executor under the iteration timeout.
    async fn execute(&self, context: StoryContext) -> Result<Verdict> {
        let verdict = relay(
            self.executor.as_ref(),
            &self.bus,
            &context,
            self.credential.as_ref(),
            self.timeout,
        )
        .await?;
        if let Verdict::TimedOut(limit) = &verdict {
            warn!(timeout_secs = limit.as_secs(), "iteration timed out, dropping executor");
        }
        Ok(verdict)
    }
}

/// Forward executor messages onto the bus until a verdict arrives.
///
/// The deadline bounds only the waits on the executor. A publish that has
/// started always completes, so its sequence number is never reused.
async fn relay(
    executor: &dyn AgentExecutor,
    bus: &EventBus,
    context: &StoryContext,
    credential: Option<&SecretString>,
    timeout: Duration,
) -> Result<Verdict> {
    let deadline = tokio::time::Instant::now() + timeout;
    let started = tokio::time::timeout_at(deadline, executor.execute(context, credential)).await;
    let mut rx = match started {
        Ok(Ok(rx)) => rx,
        Ok(Err(err)) => {
            warn!(err = %format!("{err:#}"), "executor failed to start");
            return Ok(Verdict::Crashed(format!("executor failed to start: {err:#}")));
        }
        Err(_) => return Ok(Verdict::TimedOut(timeout)),
    };
    let run_id = context.run_id.as_str();
    let iteration = Some(context.iteration);
    loop {
        let message = match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            // Dropping the receiver stops the executor.
            Err(_) => return Ok(Verdict::TimedOut(timeout)),
        };
        match message {
            ExecutorMessage::Text { text } => {
                bus.publish(run_id, iteration, EventPayload::AgentText { text })
                    .await?;
            }
            ExecutorMessage::Tool { name, input } => {
                bus.publish(run_id, iteration, EventPayload::AgentTool { name, input })
                    .await?;
            }
            ExecutorMessage::Success { cost_usd, summary } => {
                return Ok(Verdict::Success {
                    cost: cost_usd,
                    summary,
                });
            }
            ExecutorMessage::Failure {
                reason,
                fatal,
                cost_usd,
            } => {
                return Ok(Verdict::Failure {
                    reason,
                    fatal,
                    cost: cost_usd,
                });
            }
        }
    }
    Ok(Verdict::Crashed(
        "executor stream ended without a verdict".to_string(),
    ))
}
