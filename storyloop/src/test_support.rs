//! Test-only helpers: deterministic fixtures, scripted collaborators and a
//! throwaway git repository.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::{Notify, mpsc};

use crate::core::backoff::BackoffPolicy;
use crate::core::budget::BudgetConfig;
use crate::core::types::{Backlog, Run, RunStatus, Story};
use crate::events::RunEvent;
use crate::io::backlog::BacklogRef;
use crate::io::config::OrchestratorConfig;
use crate::io::executor::{AgentExecutor, ExecutorMessage, StoryContext};
use crate::io::source_control::{
    BranchRef, ChangeSet, ProviderError, PullRequestSpec, SourceControl,
};
use crate::io::store::{MemoryRunStore, RunStore};
use crate::orchestrator::{Orchestrator, StartRunRequest};

/// Create a deterministic open story.
pub fn story(id: &str, priority: i64) -> Story {
    Story {
        id: id.to_string(),
        epic: None,
        title: format!("{id} title"),
        description: None,
        acceptance_criteria: vec![format!("{id} works")],
        priority,
        passes: false,
        attempts: 0,
        skipped: false,
    }
}

pub fn backlog(stories: Vec<Story>) -> Backlog {
    Backlog::new(stories)
}

/// A pending run over `backlog` with a fixed id and branch.
pub fn run_with(backlog: Backlog, budget: BudgetConfig) -> Run {
    let now = Utc::now();
    Run {
        id: "run-test".to_string(),
        project_id: "project-test".to_string(),
        source_id: "test-source".to_string(),
        source_digest: "test".to_string(),
        status: RunStatus::Pending,
        budget,
        iterations_used: 0,
        total_cost: 0.0,
        elapsed_seconds: 0.0,
        declared_branch: "feature/test".to_string(),
        branch_name: None,
        pr_number: None,
        current_story_id: None,
        backlog,
        iterations: Vec::new(),
        error: None,
        next_sequence: 0,
        revision: 0,
        created_at: now,
        updated_at: now,
    }
}

/// Backlog document as it would appear in `prd.json`.
pub fn backlog_document(branch: &str, stories: &[Story]) -> Value {
    json!({
        "branchName": branch,
        "project": "demo",
        "userStories": stories,
    })
}

/// Start request for an inline backlog on `feature/test`.
pub fn inline_request(source_id: &str, stories: Vec<Story>, budget: BudgetConfig) -> StartRunRequest {
    StartRunRequest {
        project_id: "project-test".to_string(),
        backlog: BacklogRef::Inline {
            source_id: source_id.to_string(),
            document: backlog_document("feature/test", &stories),
        },
        budget,
    }
}

/// Orchestrator settings suited to tests: short timeout, millisecond retries.
pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig {
        iteration_timeout_secs: 5,
        ..OrchestratorConfig::default()
    };
    config.source_control.retry = BackoffPolicy {
        attempts: 3,
        base_delay_ms: 1,
        factor: 2,
    };
    config
}

/// Every event of a run published so far, in sequence order.
pub async fn collect_events(orchestrator: &Orchestrator, run_id: &str) -> Vec<RunEvent> {
    let end = orchestrator
        .next_event_sequence(run_id)
        .await
        .expect("next sequence");
    orchestrator
        .subscribe_events(run_id, 0)
        .await
        .expect("subscribe")
        .take(end as usize)
        .collect()
        .await
}

pub fn kinds(events: &[RunEvent]) -> Vec<&'static str> {
    events.iter().map(|event| event.payload.kind()).collect()
}

/// Temporary git repository on `main` with one commit, optionally wired to a
/// bare `origin` remote.
pub struct TestRepo {
    dir: TempDir,
    _remote: Option<TempDir>,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create repo dir")?;
        let root = dir.path();
        git(root, &["init", "-q", "-b", "main"])?;
        git(root, &["config", "user.email", "test@example.com"])?;
        git(root, &["config", "user.name", "test"])?;
        std::fs::write(root.join("README.md"), "hi\n").context("write README")?;
        git(root, &["add", "README.md"])?;
        git(root, &["commit", "-q", "-m", "chore: init"])?;
        Ok(Self { dir, _remote: None })
    }

    pub fn with_remote() -> Result<Self> {
        let mut repo = Self::new()?;
        let remote = tempfile::tempdir().context("create remote dir")?;
        git(remote.path(), &["init", "-q", "--bare"])?;
        let url = remote.path().to_string_lossy().to_string();
        git(repo.path(), &["remote", "add", "origin", &url])?;
        git(repo.path(), &["push", "-q", "origin", "main"])?;
        repo._remote = Some(remote);
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

fn git(root: &Path, args: &[&str]) -> Result<()> {
    let status = Command::new("git")
        .args(args)
        .current_dir(root)
        .status()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !status.success() {
        bail!("git {} failed with {status}", args.join(" "));
    }
    Ok(())
}

/// Rendezvous point that holds a scripted execution until released.
#[derive(Default)]
pub struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Resolve once a gated execution has started.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// One predetermined execution.
pub struct Script {
    messages: Vec<ExecutorMessage>,
    verdict: Option<ExecutorMessage>,
    hang: bool,
    gate: Option<Arc<Gate>>,
}

impl Script {
    fn with_verdict(verdict: Option<ExecutorMessage>) -> Self {
        Self {
            messages: Vec::new(),
            verdict,
            hang: false,
            gate: None,
        }
    }

    pub fn succeed(cost_usd: f64) -> Self {
        Self::with_verdict(Some(ExecutorMessage::Success {
            cost_usd,
            summary: Some("done".to_string()),
        }))
    }

    pub fn fail(reason: &str) -> Self {
        Self::with_verdict(Some(ExecutorMessage::Failure {
            reason: reason.to_string(),
            fatal: false,
            cost_usd: 0.0,
        }))
    }

    pub fn fatal(reason: &str) -> Self {
        Self::with_verdict(Some(ExecutorMessage::Failure {
            reason: reason.to_string(),
            fatal: true,
            cost_usd: 0.0,
        }))
    }

    /// Stream ends without a verdict.
    pub fn crash() -> Self {
        Self::with_verdict(None)
    }

    /// Never produces a verdict and keeps the stream open.
    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Self::with_verdict(None)
        }
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.messages.push(ExecutorMessage::Text {
            text: text.to_string(),
        });
        self
    }

    pub fn with_tool(mut self, name: &str, input: Value) -> Self {
        self.messages.push(ExecutorMessage::Tool {
            name: name.to_string(),
            input,
        });
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        if let Some(ExecutorMessage::Success { cost_usd, .. } | ExecutorMessage::Failure { cost_usd, .. }) =
            &mut self.verdict
        {
            *cost_usd = cost;
        }
        self
    }

    /// Wait on `gate` before emitting anything.
    pub fn gated(mut self, gate: &Arc<Gate>) -> Self {
        self.gate = Some(Arc::clone(gate));
        self
    }
}

/// Executor that replays [`Script`]s in order. Once the scripts run out every
/// execution fails fatally.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<VecDeque<Script>>,
    calls: Mutex<Vec<StoryContext>>,
    credentials: Mutex<Vec<Option<String>>>,
}

impl ScriptedExecutor {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<StoryContext> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn credentials(&self) -> Vec<Option<String>> {
        self.credentials.lock().expect("credentials lock").clone()
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        context: &StoryContext,
        credential: Option<&SecretString>,
    ) -> Result<mpsc::Receiver<ExecutorMessage>> {
        self.calls.lock().expect("calls lock").push(context.clone());
        self.credentials
            .lock()
            .expect("credentials lock")
            .push(credential.map(|secret| secret.expose_secret().to_string()));
        let script = self
            .scripts
            .lock()
            .expect("scripts lock")
            .pop_front()
            .unwrap_or_else(|| Script::fatal("no scripted response left"));

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            if let Some(gate) = &script.gate {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
            for message in script.messages {
                if tx.send(message).await.is_err() {
                    return;
                }
            }
            if let Some(verdict) = script.verdict {
                let _ = tx.send(verdict).await;
            }
            if script.hang {
                tx.closed().await;
            }
        });
        Ok(rx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    BranchExists,
    CreateBranch,
    Push,
    OpenPullRequest,
    MergePullRequest,
}

#[derive(Default)]
struct FakeState {
    existing: HashSet<String>,
    created: Vec<String>,
    pushes: Vec<(String, String)>,
    prs: Vec<PullRequestSpec>,
    merged: Vec<u64>,
    failures: HashMap<FakeOp, VecDeque<ProviderError>>,
    calls: HashMap<FakeOp, usize>,
}

/// In-memory source-control provider with injectable failures.
#[derive(Default)]
pub struct FakeSourceControl {
    state: Mutex<FakeState>,
}

impl FakeSourceControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_existing_branch(self, name: &str) -> Self {
        self.state
            .lock()
            .expect("fake lock")
            .existing
            .insert(name.to_string());
        self
    }

    /// Fail the next call of `op` with `err`. Queued failures are consumed in order.
    pub fn fail_next(&self, op: FakeOp, err: ProviderError) {
        self.state
            .lock()
            .expect("fake lock")
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    pub fn calls(&self, op: FakeOp) -> usize {
        self.state
            .lock()
            .expect("fake lock")
            .calls
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    pub fn created_branches(&self) -> Vec<String> {
        self.state.lock().expect("fake lock").created.clone()
    }

    /// `(branch, commit message)` per push.
    pub fn pushes(&self) -> Vec<(String, String)> {
        self.state.lock().expect("fake lock").pushes.clone()
    }

    pub fn opened_prs(&self) -> Vec<PullRequestSpec> {
        self.state.lock().expect("fake lock").prs.clone()
    }

    pub fn merged_prs(&self) -> Vec<u64> {
        self.state.lock().expect("fake lock").merged.clone()
    }

    /// Count the call and return the injected failure, if any.
    fn enter(&self, op: FakeOp) -> Result<std::sync::MutexGuard<'_, FakeState>, ProviderError> {
        let mut state = self.state.lock().expect("fake lock");
        *state.calls.entry(op).or_default() += 1;
        if let Some(err) = state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(state)
    }
}

#[async_trait]
impl SourceControl for FakeSourceControl {
    async fn branch_exists(&self, name: &str) -> Result<bool, ProviderError> {
        let state = self.enter(FakeOp::BranchExists)?;
        Ok(state.existing.contains(name))
    }

    async fn create_branch(&self, name: &str) -> Result<BranchRef, ProviderError> {
        let mut state = self.enter(FakeOp::CreateBranch)?;
        if !state.existing.insert(name.to_string()) {
            return Err(ProviderError::Permanent(format!("branch {name} already exists")));
        }
        state.created.push(name.to_string());
        Ok(BranchRef {
            name: name.to_string(),
        })
    }

    async fn push(&self, branch: &BranchRef, changes: &ChangeSet) -> Result<(), ProviderError> {
        let mut state = self.enter(FakeOp::Push)?;
        state
            .pushes
            .push((branch.name.clone(), changes.message.clone()));
        Ok(())
    }

    async fn open_pull_request(&self, spec: &PullRequestSpec) -> Result<u64, ProviderError> {
        let mut state = self.enter(FakeOp::OpenPullRequest)?;
        state.prs.push(spec.clone());
        Ok(state.prs.len() as u64)
    }

    async fn merge_pull_request(&self, pr_number: u64) -> Result<(), ProviderError> {
        let mut state = self.enter(FakeOp::MergePullRequest)?;
        state.merged.push(pr_number);
        Ok(())
    }
}

/// [`MemoryRunStore`] whose checkpoints can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryRunStore,
    fail_saves: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RunStore for FlakyStore {
    async fn create(&self, run: &Run) -> Result<()> {
        self.inner.create(run).await
    }

    async fn save(&self, run: &Run) -> Result<u64> {
        if self.fail_saves.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        self.inner.save(run).await
    }

    async fn load(&self, run_id: &str) -> Result<Option<Run>> {
        self.inner.load(run_id).await
    }

    async fn list(&self) -> Result<Vec<Run>> {
        self.inner.list().await
    }

    async fn append_event(&self, event: &RunEvent) -> Result<()> {
        self.inner.append_event(event).await
    }

    async fn load_events(&self, run_id: &str, from: u64) -> Result<Vec<RunEvent>> {
        self.inner.load_events(run_id, from).await
    }
}
