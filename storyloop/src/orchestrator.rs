//! Run control and event stream surfaces.
//!
//! [`Orchestrator`] owns the run registry and spawns one worker task per
//! active run. Pausing lets the worker persist `paused` and exit; resuming
//! reloads the checkpoint and attaches a fresh worker, which is the same path
//! crash recovery takes.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::StreamExt;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::branch::BranchManager;
use crate::core::budget::BudgetConfig;
use crate::core::types::{Run, RunFilter, RunStatus, RunSummary};
use crate::driver::IterationDriver;
use crate::events::{EventBus, EventPayload, EventStream};
use crate::io::backlog::{BacklogRef, load_backlog};
use crate::io::config::OrchestratorConfig;
use crate::io::executor::AgentExecutor;
use crate::io::prompt::PromptBuilder;
use crate::io::source_control::SourceControl;
use crate::io::store::RunStore;
use crate::registry::{RunCommand, RunHandle, RunRegistry};
use crate::run::{self, RunDeps};

/// Control-surface rejections callers are expected to branch on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("run {0} not found")]
    RunNotFound(String),
    #[error("cannot {action} run {run_id} in status {status}")]
    InvalidTransition {
        run_id: String,
        status: RunStatus,
        action: &'static str,
    },
    #[error("backlog {source_id} is in use by run {run_id}")]
    BacklogInUse { source_id: String, run_id: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Clone)]
pub struct StartRunRequest {
    pub project_id: String,
    pub backlog: BacklogRef,
    /// Carries `maxIterations` and the optional cost / wall-clock ceilings.
    pub budget: BudgetConfig,
}

/// Outcome of [`Orchestrator::recover`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// Runs whose worker was restarted.
    pub resumed: Vec<String>,
    /// Paused or terminal runs registered without a worker.
    pub idle: Vec<String>,
}

struct Inner {
    deps: Arc<RunDeps>,
    registry: RunRegistry,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn RunStore>,
        executor: Arc<dyn AgentExecutor>,
        source_control: Arc<dyn SourceControl>,
        credential: Option<SecretString>,
    ) -> Self {
        let bus = Arc::new(EventBus::new(
            Arc::clone(&store),
            config.event_channel_capacity,
        ));
        let branches = BranchManager::new(source_control, config.source_control.retry.clone());
        let driver = IterationDriver::new(
            executor,
            Arc::clone(&bus),
            PromptBuilder::new(config.prompt_budget_bytes),
            config.iteration_timeout(),
            config.max_attempts_per_story,
            credential,
        );
        let deps = Arc::new(RunDeps {
            config,
            store,
            bus,
            branches,
            driver,
        });
        Self {
            inner: Arc::new(Inner {
                deps,
                registry: RunRegistry::new(),
            }),
        }
    }

    fn deps(&self) -> &RunDeps {
        &self.inner.deps
    }

    async fn handle(&self, run_id: &str) -> Result<Arc<RunHandle>> {
        self.inner
            .registry
            .get(run_id)
            .await
            .ok_or_else(|| ControlError::RunNotFound(run_id.to_string()).into())
    }

    /// Attach a worker. Callers hold the handle's lifecycle lock.
    fn spawn_worker(&self, handle: &Arc<RunHandle>, run: Run) {
        handle.request(RunCommand::Continue);
        handle.set_busy(true);
        tokio::spawn(run::drive(
            Arc::clone(&self.inner.deps),
            Arc::clone(handle),
            run,
        ));
    }

    /// Reject a source that a non-terminal stored run still holds, including
    /// runs owned by another process sharing the store.
    async fn ensure_source_free(&self, source_id: &str) -> Result<()> {
        let stored = self
            .deps()
            .store
            .list()
            .await
            .context("list stored runs")?;
        if let Some(holder) = stored
            .iter()
            .find(|run| run.source_id == source_id && !run.status.is_terminal())
        {
            return Err(ControlError::BacklogInUse {
                source_id: source_id.to_string(),
                run_id: holder.id.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Validate the request, persist a pending run and start its worker.
    #[instrument(skip_all, fields(project_id = %request.project_id))]
    pub async fn start_run(&self, request: StartRunRequest) -> Result<String> {
        if request.project_id.trim().is_empty() {
            return Err(ControlError::InvalidRequest("projectId must not be blank".to_string()).into());
        }
        request
            .budget
            .validate()
            .map_err(|err| ControlError::InvalidRequest(err.to_string()))?;
        let loaded = load_backlog(&request.backlog)
            .map_err(|err| ControlError::InvalidRequest(format!("{err:#}")))?;

        let now = Utc::now();
        let run = Run {
            id: Uuid::new_v4().to_string(),
            project_id: request.project_id.clone(),
            source_id: loaded.source_id,
            source_digest: loaded.digest,
            status: RunStatus::Pending,
            budget: request.budget,
            iterations_used: 0,
            total_cost: 0.0,
            elapsed_seconds: 0.0,
            declared_branch: loaded.document.branch_name.clone(),
            branch_name: None,
            pr_number: None,
            current_story_id: None,
            backlog: loaded.document.to_backlog(),
            iterations: Vec::new(),
            error: None,
            next_sequence: 0,
            revision: 0,
            created_at: now,
            updated_at: now,
        };
        let run_id = run.id.clone();
        self.ensure_source_free(&run.source_id).await?;
        let handle = Arc::new(RunHandle::new(run.clone()));
        self.inner.registry.insert_exclusive(Arc::clone(&handle)).await?;

        let persisted = async {
            self.deps().store.create(&run).await?;
            self.deps().bus.open(&run_id).await
        }
        .await;
        if let Err(err) = persisted {
            self.inner.registry.remove(&run_id).await;
            return Err(err.context(format!("persist new run {run_id}")));
        }

        info!(run_id = %run_id, source_id = %run.source_id, stories = run.backlog.len(), "starting run");
        let _lifecycle = handle.lock_lifecycle().await;
        self.spawn_worker(&handle, run);
        Ok(run_id)
    }

    /// Ask the worker to pause at the next iteration boundary.
    #[instrument(skip(self))]
    pub async fn pause_run(&self, run_id: &str) -> Result<()> {
        let handle = self.handle(run_id).await?;
        let _lifecycle = handle.lock_lifecycle().await;
        let status = handle.snapshot().status;
        match status {
            RunStatus::Paused => Ok(()),
            RunStatus::Pending | RunStatus::Running if handle.is_busy() => {
                // A pending cancel outranks the pause.
                if handle.command() != RunCommand::Cancel {
                    handle.request(RunCommand::Pause);
                }
                Ok(())
            }
            _ => Err(ControlError::InvalidTransition {
                run_id: run_id.to_string(),
                status,
                action: "pause",
            }
            .into()),
        }
    }

    /// Re-enter the main loop from the persisted checkpoint.
    #[instrument(skip(self))]
    pub async fn resume_run(&self, run_id: &str) -> Result<()> {
        let handle = self.handle(run_id).await?;
        loop {
            let lifecycle = handle.lock_lifecycle().await;
            let status = handle.snapshot().status;
            if status.is_terminal() {
                return Err(ControlError::InvalidTransition {
                    run_id: run_id.to_string(),
                    status,
                    action: "resume",
                }
                .into());
            }
            if handle.is_busy() {
                if status == RunStatus::Paused {
                    // The worker is still detaching.
                    drop(lifecycle);
                    handle.wait_idle().await;
                    continue;
                }
                if handle.command() == RunCommand::Cancel {
                    return Err(ControlError::InvalidTransition {
                        run_id: run_id.to_string(),
                        status,
                        action: "resume",
                    }
                    .into());
                }
                // Pause not yet honoured; withdraw it.
                handle.request(RunCommand::Continue);
                return Ok(());
            }
            let run = self
                .deps()
                .store
                .load(run_id)
                .await?
                .ok_or_else(|| ControlError::RunNotFound(run_id.to_string()))?;
            if run.status.is_terminal() {
                return Err(ControlError::InvalidTransition {
                    run_id: run_id.to_string(),
                    status: run.status,
                    action: "resume",
                }
                .into());
            }
            info!(run_id, iterations_used = run.iterations_used, "resuming run");
            self.spawn_worker(&handle, run);
            return Ok(());
        }
    }

    /// Cancel the run. A busy worker stops at the next iteration boundary; an
    /// idle (paused) run is cancelled immediately.
    #[instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: &str) -> Result<()> {
        let handle = self.handle(run_id).await?;
        let _lifecycle = handle.lock_lifecycle().await;
        let status = handle.snapshot().status;
        if status.is_terminal() {
            return Err(ControlError::InvalidTransition {
                run_id: run_id.to_string(),
                status,
                action: "cancel",
            }
            .into());
        }
        if handle.is_busy() {
            handle.request(RunCommand::Cancel);
            return Ok(());
        }
        let mut run = self
            .deps()
            .store
            .load(run_id)
            .await?
            .ok_or_else(|| ControlError::RunNotFound(run_id.to_string()))?;
        self.deps()
            .transition(
                &handle,
                &mut run,
                RunStatus::Cancelled,
                Some("cancel requested".to_string()),
            )
            .await
    }

    /// Latest snapshot of a run (registered or archived).
    pub async fn get_run(&self, run_id: &str) -> Result<Run> {
        if let Some(handle) = self.inner.registry.get(run_id).await {
            return Ok(handle.snapshot());
        }
        self.deps()
            .store
            .load(run_id)
            .await?
            .ok_or_else(|| ControlError::RunNotFound(run_id.to_string()).into())
    }

    /// Summaries of a project's runs (all projects when `project_id` is None),
    /// oldest first.
    pub async fn list_runs(
        &self,
        project_id: Option<&str>,
        filter: &RunFilter,
    ) -> Result<Vec<RunSummary>> {
        let mut runs = self.deps().store.list().await?;
        for run in &mut runs {
            if let Some(handle) = self.inner.registry.get(&run.id).await {
                *run = handle.snapshot();
            }
        }
        Ok(runs
            .iter()
            .filter(|run| project_id.is_none_or(|project| run.project_id == project))
            .filter(|run| filter.matches(run))
            .map(Run::summary)
            .collect())
    }

    /// Ordered events with `sequence >= from`. Registered runs keep streaming
    /// live events until archived; archived runs replay their stored log.
    pub async fn subscribe_events(&self, run_id: &str, from: u64) -> Result<EventStream> {
        if self.inner.registry.contains(run_id).await {
            return self.deps().bus.subscribe(run_id, from).await;
        }
        if self.deps().store.load(run_id).await?.is_none() {
            return Err(ControlError::RunNotFound(run_id.to_string()).into());
        }
        let events = self.deps().store.load_events(run_id, from).await?;
        Ok(futures::stream::iter(events).boxed())
    }

    /// First event sequence number not yet published for a run.
    pub async fn next_event_sequence(&self, run_id: &str) -> Result<u64> {
        if self.inner.registry.contains(run_id).await {
            return self.deps().bus.next_sequence(run_id).await;
        }
        let run = self
            .deps()
            .store
            .load(run_id)
            .await?
            .ok_or_else(|| ControlError::RunNotFound(run_id.to_string()))?;
        let events = self.deps().store.load_events(run_id, run.next_sequence).await?;
        Ok(events.last().map_or(run.next_sequence, |event| event.sequence + 1))
    }

    /// Remove a terminal run from the registry and end its live streams.
    #[instrument(skip(self))]
    pub async fn archive_run(&self, run_id: &str) -> Result<()> {
        let handle = self.handle(run_id).await?;
        let _lifecycle = handle.lock_lifecycle().await;
        let status = handle.snapshot().status;
        if !status.is_terminal() || handle.is_busy() {
            return Err(ControlError::InvalidTransition {
                run_id: run_id.to_string(),
                status,
                action: "archive",
            }
            .into());
        }
        self.inner.registry.remove(run_id).await;
        self.deps().bus.close(run_id).await;
        info!(run_id, "archived run");
        Ok(())
    }

    /// Resolve once the run has no worker attached (terminal or paused).
    pub async fn wait_settled(&self, run_id: &str) -> Result<Run> {
        let handle = self.handle(run_id).await?;
        handle.wait_idle().await;
        Ok(handle.snapshot())
    }

    /// Register every persisted run and restart workers for runs that were
    /// active when the previous process stopped.
    #[instrument(skip_all)]
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for run in self.deps().store.list().await.context("list persisted runs")? {
            if self.inner.registry.contains(&run.id).await {
                continue;
            }
            let run_id = run.id.clone();
            if self.adopt(run).await? {
                report.resumed.push(run_id);
            } else {
                report.idle.push(run_id);
            }
        }
        Ok(report)
    }

    /// Register a single persisted run, restarting its worker if it was
    /// active. Returns whether a worker was started.
    #[instrument(skip(self))]
    pub async fn recover_run(&self, run_id: &str) -> Result<bool> {
        if self.inner.registry.contains(run_id).await {
            return Ok(false);
        }
        let run = self
            .deps()
            .store
            .load(run_id)
            .await?
            .ok_or_else(|| ControlError::RunNotFound(run_id.to_string()))?;
        self.adopt(run).await
    }

    async fn adopt(&self, mut run: Run) -> Result<bool> {
        self.deps().bus.open(&run.id).await?;
        if !run.status.is_active() {
            self.inner.registry.insert(Arc::new(RunHandle::new(run))).await;
            return Ok(false);
        }

        let replay = self
            .deps()
            .store
            .load_events(&run.id, run.next_sequence)
            .await?;
        apply_resource_events(&mut run, &replay);
        if let Some(story_id) = run.current_story_id.take() {
            warn!(run_id = %run.id, story_id = %story_id, iteration = run.iterations_used + 1, "re-running interrupted iteration");
        }
        let handle = Arc::new(RunHandle::new(run.clone()));
        let _lifecycle = handle.lock_lifecycle().await;
        self.inner.registry.insert(Arc::clone(&handle)).await;
        info!(run_id = %run.id, status = %run.status, "recovering run");
        self.spawn_worker(&handle, run);
        Ok(true)
    }
}

/// Re-apply external resource facts recorded after the checkpoint, so a
/// branch or pull request created just before a crash is not created again.
fn apply_resource_events(run: &mut Run, events: &[crate::events::RunEvent]) {
    for event in events {
        match &event.payload {
            EventPayload::BranchCreated { branch_name } if run.branch_name.is_none() => {
                run.branch_name = Some(branch_name.clone());
            }
            EventPayload::PrCreated { pr_number, .. } if run.pr_number.is_none() => {
                run.pr_number = Some(*pr_number);
            }
            _ => {}
        }
    }
}
