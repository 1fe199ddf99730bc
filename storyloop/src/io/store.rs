//! Run persistence: checkpoints plus the append-only event log.
//!
//! A checkpoint is the whole [`Run`] written atomically. Writes carry the
//! revision they were based on and are rejected when another writer got there
//! first, so checkpoint updates are never lost.

use std::collections::HashMap;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::core::types::Run;
use crate::events::RunEvent;

const RUN_FILE: &str = "run.json";
const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("run {0} already exists")]
    AlreadyExists(String),
    #[error("run {0} not found")]
    NotFound(String),
    #[error("checkpoint conflict for run {run_id}: based on revision {expected}, stored revision is {found}")]
    Conflict {
        run_id: String,
        expected: u64,
        found: u64,
    },
}

/// Durable storage keyed by run id.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist a new run. Fails if the id is taken.
    async fn create(&self, run: &Run) -> Result<()>;

    /// Write a whole-run checkpoint. `run.revision` must match the stored
    /// revision; returns the new revision.
    async fn save(&self, run: &Run) -> Result<u64>;

    async fn load(&self, run_id: &str) -> Result<Option<Run>>;

    /// All stored runs, oldest first.
    async fn list(&self) -> Result<Vec<Run>>;

    async fn append_event(&self, event: &RunEvent) -> Result<()>;

    /// Stored events with `sequence >= from`, in order.
    async fn load_events(&self, run_id: &str, from: u64) -> Result<Vec<RunEvent>>;
}

fn check_revision(run: &Run, stored: u64) -> Result<u64> {
    if run.revision != stored {
        return Err(StoreError::Conflict {
            run_id: run.id.clone(),
            expected: run.revision,
            found: stored,
        }
        .into());
    }
    Ok(stored + 1)
}

/// File-backed store: `<root>/runs/<run_id>/{run.json,events.jsonl}`.
pub struct FileRunStore {
    runs_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileRunStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            runs_dir: state_dir.as_ref().join("runs"),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    async fn lock_for(&self, run_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(run_id.to_string()).or_default())
    }

    async fn read_run(&self, run_id: &str) -> Result<Option<Run>> {
        let path = self.run_dir(run_id).join(RUN_FILE);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        let run = serde_json::from_str(&contents)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(run))
    }

    async fn write_run(&self, run: &Run) -> Result<()> {
        let dir = self.run_dir(&run.id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create directory {}", dir.display()))?;
        let path = dir.join(RUN_FILE);
        let tmp_path = dir.join(format!("{RUN_FILE}.tmp"));
        let mut buf = serde_json::to_string_pretty(run).context("serialize run")?;
        buf.push('\n');
        fs::write(&tmp_path, buf)
            .await
            .with_context(|| format!("write temp checkpoint {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .await
            .with_context(|| format!("replace checkpoint {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    #[instrument(skip_all, fields(run_id = %run.id))]
    async fn create(&self, run: &Run) -> Result<()> {
        let lock = self.lock_for(&run.id).await;
        let _guard = lock.lock().await;
        if self.read_run(&run.id).await?.is_some() {
            return Err(StoreError::AlreadyExists(run.id.clone()).into());
        }
        self.write_run(run).await?;
        debug!("created run checkpoint");
        Ok(())
    }

    #[instrument(skip_all, fields(run_id = %run.id, revision = run.revision))]
    async fn save(&self, run: &Run) -> Result<u64> {
        let lock = self.lock_for(&run.id).await;
        let _guard = lock.lock().await;
        let stored = self
            .read_run(&run.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(run.id.clone()))?;
        let revision = check_revision(run, stored.revision)?;
        let mut next = run.clone();
        next.revision = revision;
        self.write_run(&next).await?;
        debug!(revision, "saved run checkpoint");
        Ok(revision)
    }

    async fn load(&self, run_id: &str) -> Result<Option<Run>> {
        let lock = self.lock_for(run_id).await;
        let _guard = lock.lock().await;
        self.read_run(run_id).await
    }

    async fn list(&self) -> Result<Vec<Run>> {
        let mut entries = match fs::read_dir(&self.runs_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.runs_dir.display()));
            }
        };
        let mut runs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("read {}", self.runs_dir.display()))?
        {
            let Some(run_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Some(run) = self.load(&run_id).await? {
                runs.push(run);
            }
        }
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(runs)
    }

    async fn append_event(&self, event: &RunEvent) -> Result<()> {
        let lock = self.lock_for(&event.run_id).await;
        let _guard = lock.lock().await;
        let dir = self.run_dir(&event.run_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create directory {}", dir.display()))?;
        let path = dir.join(EVENTS_FILE);
        let mut line = serde_json::to_string(event).context("serialize event")?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await
            .with_context(|| format!("open {}", path.display()))?;
        let end = truncate_torn_tail(&mut file)
            .await
            .with_context(|| format!("repair {}", path.display()))?;
        file.seek(SeekFrom::Start(end))
            .await
            .with_context(|| format!("seek {}", path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("append {}", path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flush {}", path.display()))?;
        Ok(())
    }

    async fn load_events(&self, run_id: &str, from: u64) -> Result<Vec<RunEvent>> {
        let path = self.run_dir(run_id).join(EVENTS_FILE);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        parse_event_log(&contents, from).with_context(|| format!("parse {}", path.display()))
    }
}

/// Cut a partial record left by a crash mid-append so the next record starts
/// on a fresh line. Returns the length of the log after repair.
async fn truncate_torn_tail(file: &mut fs::File) -> std::io::Result<u64> {
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(0);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1)).await?;
    file.read_exact(&mut last).await?;
    if last[0] == b'\n' {
        return Ok(len);
    }
    file.seek(SeekFrom::Start(0)).await?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents).await?;
    let keep = contents
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map_or(0, |idx| idx as u64 + 1);
    warn!(dropped = len - keep, "truncating torn trailing event line");
    file.set_len(keep).await?;
    Ok(keep)
}

/// Parse JSONL events. A torn final line (crash mid-append) is ignored.
fn parse_event_log(contents: &str, from: u64) -> Result<Vec<RunEvent>> {
    let complete = contents.ends_with('\n');
    let lines: Vec<&str> = contents.lines().collect();
    let mut events = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RunEvent>(line) {
            Ok(event) if event.sequence >= from => events.push(event),
            Ok(_) => {}
            Err(err) if !complete && idx + 1 == lines.len() => {
                warn!(err = %err, "ignoring torn trailing event line");
            }
            Err(err) => return Err(anyhow!("line {}: {err}", idx + 1)),
        }
    }
    Ok(events)
}

#[derive(Default)]
struct MemoryState {
    runs: HashMap<String, Run>,
    events: HashMap<String, Vec<RunEvent>>,
}

/// In-process store with the same semantics as [`FileRunStore`].
#[derive(Default)]
pub struct MemoryRunStore {
    state: Mutex<MemoryState>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create(&self, run: &Run) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.runs.contains_key(&run.id) {
            return Err(StoreError::AlreadyExists(run.id.clone()).into());
        }
        state.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn save(&self, run: &Run) -> Result<u64> {
        let mut state = self.state.lock().await;
        let stored = state
            .runs
            .get(&run.id)
            .ok_or_else(|| StoreError::NotFound(run.id.clone()))?;
        let revision = check_revision(run, stored.revision)?;
        let mut next = run.clone();
        next.revision = revision;
        state.runs.insert(run.id.clone(), next);
        Ok(revision)
    }

    async fn load(&self, run_id: &str) -> Result<Option<Run>> {
        Ok(self.state.lock().await.runs.get(run_id).cloned())
    }

    async fn list(&self) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self.state.lock().await.runs.values().cloned().collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(runs)
    }

    async fn append_event(&self, event: &RunEvent) -> Result<()> {
        self.state
            .lock()
            .await
            .events
            .entry(event.run_id.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn load_events(&self, run_id: &str, from: u64) -> Result<Vec<RunEvent>> {
        Ok(self
            .state
            .lock()
            .await
            .events
            .get(run_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|event| event.sequence >= from)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::budget::BudgetConfig;
    use crate::events::EventPayload;
    use crate::test_support::{backlog, run_with, story};

    fn sample_run(id: &str) -> Run {
        let mut run = run_with(backlog(vec![story("a", 0)]), BudgetConfig::iterations(3));
        run.id = id.to_string();
        run
    }

    fn event(run_id: &str, sequence: u64) -> RunEvent {
        RunEvent {
            run_id: run_id.to_string(),
            sequence,
            timestamp: chrono::Utc::now(),
            iteration: None,
            payload: EventPayload::AgentText {
                text: format!("line {sequence}"),
            },
        }
    }

    async fn exercise_checkpoints(store: &dyn RunStore) {
        let mut run = sample_run("run-1");
        store.create(&run).await.expect("create");
        let err = store.create(&run).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::AlreadyExists(_))
        ));

        run.iterations_used = 1;
        run.revision = store.save(&run).await.expect("save");
        assert_eq!(run.revision, 1);

        let mut stale = run.clone();
        stale.revision = 0;
        let err = store.save(&stale).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Conflict {
                expected: 0,
                found: 1,
                ..
            })
        ));

        let loaded = store.load("run-1").await.expect("load").expect("exists");
        assert_eq!(loaded.iterations_used, 1);
        assert_eq!(loaded.revision, 1);
        assert!(store.load("missing").await.expect("load").is_none());
    }

    async fn exercise_events(store: &dyn RunStore) {
        for seq in 0..4 {
            store.append_event(&event("run-1", seq)).await.expect("append");
        }
        store.append_event(&event("run-2", 0)).await.expect("append");
        let events = store.load_events("run-1", 2).await.expect("load");
        assert_eq!(
            events.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert!(store.load_events("run-3", 0).await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn memory_store_checkpoints() {
        exercise_checkpoints(&MemoryRunStore::new()).await;
    }

    #[tokio::test]
    async fn memory_store_events() {
        exercise_events(&MemoryRunStore::new()).await;
    }

    #[tokio::test]
    async fn file_store_checkpoints() {
        let temp = tempfile::tempdir().expect("tempdir");
        exercise_checkpoints(&FileRunStore::new(temp.path())).await;
        assert!(temp.path().join("runs/run-1/run.json").exists());
        assert!(!temp.path().join("runs/run-1/run.json.tmp").exists());
    }

    #[tokio::test]
    async fn file_store_events() {
        let temp = tempfile::tempdir().expect("tempdir");
        exercise_events(&FileRunStore::new(temp.path())).await;
    }

    #[tokio::test]
    async fn file_store_lists_runs_oldest_first() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileRunStore::new(temp.path());
        let mut older = sample_run("run-b");
        older.created_at = chrono::Utc::now() - chrono::TimeDelta::seconds(10);
        store.create(&sample_run("run-a")).await.expect("create");
        store.create(&older).await.expect("create");
        let ids: Vec<String> = store
            .list()
            .await
            .expect("list")
            .into_iter()
            .map(|run| run.id)
            .collect();
        assert_eq!(ids, vec!["run-b", "run-a"]);
    }

    /// Verifies a partial last record from a crash is skipped on load.
    #[test]
    fn torn_trailing_line_is_ignored() {
        let good = serde_json::to_string(&event("run-1", 0)).expect("serialize");
        let log = format!("{good}\n{{\"runId\":\"run-1\",\"seq");
        let events = parse_event_log(&log, 0).expect("parse");
        assert_eq!(events.len(), 1);
    }

    /// Verifies a crash mid-append does not poison the log.
    ///
    /// The partial record is dropped by the next append, so later loads see
    /// every complete event in order instead of a corrupt middle line.
    #[tokio::test]
    async fn append_after_torn_line_repairs_the_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileRunStore::new(temp.path());
        store.append_event(&event("run-1", 0)).await.expect("append");
        let path = temp.path().join("runs/run-1/events.jsonl");
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .expect("open");
        file.write_all(b"{\"runId\":\"run-1\",\"seq").await.expect("write");
        file.flush().await.expect("flush");
        drop(file);
        assert_eq!(store.load_events("run-1", 0).await.expect("load").len(), 1);

        store.append_event(&event("run-1", 1)).await.expect("append");
        let events = store.load_events("run-1", 0).await.expect("load");
        assert_eq!(
            events.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![0, 1]
        );
        let contents = std::fs::read_to_string(&path).expect("read");
        assert!(!contents.contains("\"seq{"), "{contents}");
    }

    /// Verifies corruption anywhere but the tail is reported, not skipped.
    #[test]
    fn corrupt_middle_line_is_an_error() {
        let good = serde_json::to_string(&event("run-1", 1)).expect("serialize");
        let log = format!("not json\n{good}\n");
        let err = parse_event_log(&log, 0).unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }
}
