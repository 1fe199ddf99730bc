//! Process-wide registry of runs known to an orchestrator.
//!
//! A run is registered on start (or recovery) and removed only when it is
//! terminal and explicitly archived. Each entry carries the latest snapshot,
//! the control command the worker polls between iterations, and whether a
//! worker is currently attached.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, RwLock, watch};

use crate::core::types::Run;
use crate::orchestrator::ControlError;

/// What the worker should do at the next iteration boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCommand {
    Continue,
    Pause,
    Cancel,
}

pub struct RunHandle {
    id: String,
    snapshot: watch::Sender<Run>,
    command: watch::Sender<RunCommand>,
    busy: watch::Sender<bool>,
    /// Serialises worker start/stop against control requests.
    lifecycle: Mutex<()>,
}

impl RunHandle {
    pub fn new(run: Run) -> Self {
        let id = run.id.clone();
        Self {
            id,
            snapshot: watch::Sender::new(run),
            command: watch::Sender::new(RunCommand::Continue),
            busy: watch::Sender::new(false),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Run {
        self.snapshot.borrow().clone()
    }

    pub fn publish(&self, run: &Run) {
        self.snapshot.send_replace(run.clone());
    }

    pub fn command(&self) -> RunCommand {
        *self.command.borrow()
    }

    pub fn request(&self, command: RunCommand) {
        self.command.send_replace(command);
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.borrow()
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.send_replace(busy);
    }

    /// Resolve once no worker is attached.
    pub async fn wait_idle(&self) {
        let mut rx = self.busy.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|busy| !*busy).await;
    }

    pub async fn lock_lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().await
    }
}

#[derive(Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<String, Arc<RunHandle>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run, rejecting it if a non-terminal run already holds the
    /// same backlog source.
    pub async fn insert_exclusive(&self, handle: Arc<RunHandle>) -> Result<(), ControlError> {
        let mut runs = self.runs.write().await;
        let incoming = handle.snapshot();
        if let Some(existing) = runs.values().find(|other| {
            let run = other.snapshot.borrow();
            run.source_id == incoming.source_id && !run.status.is_terminal()
        }) {
            return Err(ControlError::BacklogInUse {
                source_id: incoming.source_id,
                run_id: existing.id.clone(),
            });
        }
        runs.insert(handle.id.clone(), handle);
        Ok(())
    }

    /// Register a run unconditionally (recovery).
    pub async fn insert(&self, handle: Arc<RunHandle>) {
        self.runs.write().await.insert(handle.id.clone(), handle);
    }

    pub async fn get(&self, run_id: &str) -> Option<Arc<RunHandle>> {
        self.runs.read().await.get(run_id).cloned()
    }

    pub async fn contains(&self, run_id: &str) -> bool {
        self.runs.read().await.contains_key(run_id)
    }

    pub async fn remove(&self, run_id: &str) -> Option<Arc<RunHandle>> {
        self.runs.write().await.remove(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::budget::BudgetConfig;
    use crate::core::types::RunStatus;
    use crate::test_support::{backlog, run_with, story};

    fn run(id: &str, source: &str, status: RunStatus) -> Run {
        let mut run = run_with(backlog(vec![story("a", 0)]), BudgetConfig::iterations(1));
        run.id = id.to_string();
        run.source_id = source.to_string();
        run.status = status;
        run
    }

    #[tokio::test]
    async fn rejects_second_active_run_on_same_backlog() {
        let registry = RunRegistry::new();
        registry
            .insert_exclusive(Arc::new(RunHandle::new(run("r1", "prd.json", RunStatus::Paused))))
            .await
            .expect("first");
        let err = registry
            .insert_exclusive(Arc::new(RunHandle::new(run("r2", "prd.json", RunStatus::Pending))))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::BacklogInUse { ref run_id, .. } if run_id == "r1"));
        registry
            .insert_exclusive(Arc::new(RunHandle::new(run("r3", "other.json", RunStatus::Pending))))
            .await
            .expect("other backlog");
    }

    #[tokio::test]
    async fn terminal_runs_release_the_backlog() {
        let registry = RunRegistry::new();
        registry
            .insert_exclusive(Arc::new(RunHandle::new(run("r1", "prd.json", RunStatus::Completed))))
            .await
            .expect("first");
        registry
            .insert_exclusive(Arc::new(RunHandle::new(run("r2", "prd.json", RunStatus::Pending))))
            .await
            .expect("second");
        assert!(registry.contains("r1").await);
        assert!(registry.contains("r2").await);
    }

    #[tokio::test]
    async fn wait_idle_resolves_when_worker_detaches() {
        let handle = Arc::new(RunHandle::new(run("r1", "prd.json", RunStatus::Running)));
        handle.set_busy(true);
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_idle().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        handle.set_busy(false);
        waiter.await.expect("join");
    }
}
