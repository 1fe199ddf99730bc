//! Run events and the per-run event bus.
//!
//! Every event gets its sequence number from the run's channel while the
//! channel lock is held, is appended to the store, and only then is broadcast.
//! Subscribers replay the stored log from any offset and then follow the live
//! broadcast, deduplicating by sequence number. A subscriber that falls behind
//! the broadcast buffer catches up from the store.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_stream::stream;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, warn};

use crate::core::types::RunStatus;
use crate::io::store::RunStore;

/// Ordered stream of run events.
pub type EventStream = Pin<Box<dyn Stream<Item = RunEvent> + Send>>;

/// One immutable entry of a run's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub run_id: String,
    /// Unique and strictly increasing within the run, starting at 0.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Closed set of event kinds. Serializes as `{"type": ..., "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum EventPayload {
    AgentText {
        text: String,
    },
    AgentTool {
        name: String,
        input: Value,
    },
    IterationStarted {
        story_id: String,
        attempt: u32,
    },
    IterationCompleted {
        story_id: String,
        cost_usd: f64,
        duration_seconds: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    IterationFailed {
        story_id: String,
        retryable: bool,
        error: String,
        cost_usd: f64,
        duration_seconds: f64,
    },
    BranchCreated {
        branch_name: String,
    },
    PrCreated {
        pr_number: u64,
        branch_name: String,
    },
    PrMerged {
        pr_number: u64,
    },
    StoryCompleted {
        story_id: String,
        attempts: u32,
    },
    RunStatusChanged {
        from: RunStatus,
        to: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl EventPayload {
    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AgentText { .. } => "agent_text",
            Self::AgentTool { .. } => "agent_tool",
            Self::IterationStarted { .. } => "iteration_started",
            Self::IterationCompleted { .. } => "iteration_completed",
            Self::IterationFailed { .. } => "iteration_failed",
            Self::BranchCreated { .. } => "branch_created",
            Self::PrCreated { .. } => "pr_created",
            Self::PrMerged { .. } => "pr_merged",
            Self::StoryCompleted { .. } => "story_completed",
            Self::RunStatusChanged { .. } => "run_status_changed",
        }
    }
}

struct ChannelState {
    next_sequence: u64,
    sender: broadcast::Sender<RunEvent>,
}

/// Run-scoped ordering authority.
struct RunChannel {
    state: Mutex<ChannelState>,
}

/// Fan-out of run events to any number of subscribers.
pub struct EventBus {
    store: Arc<dyn RunStore>,
    capacity: usize,
    channels: RwLock<HashMap<String, Arc<RunChannel>>>,
}

impl EventBus {
    pub fn new(store: Arc<dyn RunStore>, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Open the channel for a run, continuing after any events already stored.
    pub async fn open(&self, run_id: &str) -> Result<()> {
        if self.channels.read().await.contains_key(run_id) {
            return Ok(());
        }
        let next_sequence = self
            .store
            .load_events(run_id, 0)
            .await?
            .last()
            .map_or(0, |event| event.sequence + 1);
        let (sender, _) = broadcast::channel(self.capacity);
        let channel = Arc::new(RunChannel {
            state: Mutex::new(ChannelState {
                next_sequence,
                sender,
            }),
        });
        self.channels
            .write()
            .await
            .entry(run_id.to_string())
            .or_insert(channel);
        debug!(run_id, next_sequence, "opened event channel");
        Ok(())
    }

    /// Close a run's channel. Live subscribers end after draining their buffer.
    pub async fn close(&self, run_id: &str) {
        if self.channels.write().await.remove(run_id).is_some() {
            debug!(run_id, "closed event channel");
        }
    }

    async fn channel(&self, run_id: &str) -> Result<Arc<RunChannel>> {
        self.channels
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| anyhow!("no event channel for run {run_id}"))
    }

    /// Assign the next sequence number, persist, then broadcast.
    pub async fn publish(
        &self,
        run_id: &str,
        iteration: Option<u32>,
        payload: EventPayload,
    ) -> Result<RunEvent> {
        let channel = self.channel(run_id).await?;
        let mut state = channel.state.lock().await;
        let event = RunEvent {
            run_id: run_id.to_string(),
            sequence: state.next_sequence,
            timestamp: Utc::now(),
            iteration,
            payload,
        };
        self.store.append_event(&event).await?;
        state.next_sequence += 1;
        // No receivers is fine; the log is the source of truth.
        let _ = state.sender.send(event.clone());
        Ok(event)
    }

    /// First sequence number not yet assigned.
    pub async fn next_sequence(&self, run_id: &str) -> Result<u64> {
        let channel = self.channel(run_id).await?;
        let state = channel.state.lock().await;
        Ok(state.next_sequence)
    }

    /// Events with `sequence >= from`, in order, followed by live events.
    pub async fn subscribe(&self, run_id: &str, from: u64) -> Result<EventStream> {
        let channel = self.channel(run_id).await?;
        let (backlog, mut rx) = {
            let state = channel.state.lock().await;
            let backlog = self.store.load_events(run_id, from).await?;
            (backlog, state.sender.subscribe())
        };
        drop(channel);
        let store = Arc::clone(&self.store);
        let run_id = run_id.to_string();

        Ok(Box::pin(stream! {
            let mut next = from;
            for event in backlog {
                if event.sequence >= next {
                    next = event.sequence + 1;
                    yield event;
                }
            }
            loop {
                let gap = match rx.recv().await {
                    Ok(event) if event.sequence < next => continue,
                    Ok(event) if event.sequence == next => {
                        next += 1;
                        yield event;
                        continue;
                    }
                    Ok(event) => {
                        debug!(run_id = %run_id, expected = next, got = event.sequence, "event gap, catching up");
                        Some(event)
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(run_id = %run_id, skipped, "subscriber lagged, catching up from log");
                        None
                    }
                    Err(RecvError::Closed) => break,
                };
                match store.load_events(&run_id, next).await {
                    Ok(events) => {
                        for event in events {
                            if event.sequence >= next {
                                next = event.sequence + 1;
                                yield event;
                            }
                        }
                    }
                    Err(err) => {
                        warn!(run_id = %run_id, err = %format!("{err:#}"), "failed to read event log");
                        break;
                    }
                }
                if let Some(event) = gap
                    && event.sequence >= next
                {
                    next = event.sequence + 1;
                    yield event;
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::io::store::MemoryRunStore;

    fn text(text: &str) -> EventPayload {
        EventPayload::AgentText {
            text: text.to_string(),
        }
    }

    async fn bus_with_run(capacity: usize) -> (EventBus, Arc<MemoryRunStore>) {
        let store = Arc::new(MemoryRunStore::new());
        let bus = EventBus::new(store.clone(), capacity);
        bus.open("run-1").await.expect("open");
        (bus, store)
    }

    #[test]
    fn serializes_tagged_record() {
        let event = RunEvent {
            run_id: "run-1".to_string(),
            sequence: 3,
            timestamp: Utc::now(),
            iteration: Some(2),
            payload: EventPayload::StoryCompleted {
                story_id: "US-1".to_string(),
                attempts: 2,
            },
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "story_completed");
        assert_eq!(value["runId"], "run-1");
        assert_eq!(value["sequence"], 3);
        assert_eq!(value["iteration"], 2);
        assert_eq!(value["payload"]["storyId"], "US-1");
        let back: RunEvent = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, event);
    }

    #[tokio::test]
    async fn sequences_start_at_zero_and_persist() {
        let (bus, store) = bus_with_run(16).await;
        let first = bus.publish("run-1", None, text("a")).await.expect("publish");
        let second = bus.publish("run-1", Some(1), text("b")).await.expect("publish");
        assert_eq!((first.sequence, second.sequence), (0, 1));
        assert_eq!(bus.next_sequence("run-1").await.expect("next"), 2);
        let stored = store.load_events("run-1", 0).await.expect("load");
        assert_eq!(stored, vec![first, second]);
    }

    /// Verifies a subscriber joining late gets stored events, then live ones.
    ///
    /// Replay starts at the requested offset and the switch to the live feed
    /// neither skips nor repeats a sequence.
    #[tokio::test]
    async fn late_subscriber_replays_from_offset_then_follows_live() {
        let (bus, _store) = bus_with_run(16).await;
        for word in ["a", "b", "c"] {
            bus.publish("run-1", None, text(word)).await.expect("publish");
        }
        let mut stream = bus.subscribe("run-1", 1).await.expect("subscribe");
        bus.publish("run-1", None, text("d")).await.expect("publish");

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(stream.next().await.expect("event").sequence);
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    /// Verifies a subscriber that overflows the broadcast buffer recovers from the log.
    #[tokio::test]
    async fn lagging_subscriber_catches_up_without_gaps_or_duplicates() {
        let (bus, _store) = bus_with_run(2).await;
        let mut stream = bus.subscribe("run-1", 0).await.expect("subscribe");
        for idx in 0..10 {
            bus.publish("run-1", None, text(&idx.to_string()))
                .await
                .expect("publish");
        }
        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.push(stream.next().await.expect("event").sequence);
        }
        assert_eq!(seen, (0..10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn independent_subscribers_each_see_everything() {
        let (bus, _store) = bus_with_run(16).await;
        let mut a = bus.subscribe("run-1", 0).await.expect("subscribe");
        let mut b = bus.subscribe("run-1", 0).await.expect("subscribe");
        bus.publish("run-1", None, text("x")).await.expect("publish");
        bus.publish("run-1", None, text("y")).await.expect("publish");
        for stream in [&mut a, &mut b] {
            assert_eq!(stream.next().await.expect("event").sequence, 0);
            assert_eq!(stream.next().await.expect("event").sequence, 1);
        }
    }

    #[tokio::test]
    async fn close_ends_live_streams() {
        let (bus, _store) = bus_with_run(16).await;
        let mut stream = bus.subscribe("run-1", 0).await.expect("subscribe");
        bus.publish("run-1", None, text("x")).await.expect("publish");
        bus.close("run-1").await;
        assert_eq!(stream.next().await.map(|e| e.sequence), Some(0));
        assert!(stream.next().await.is_none());
        assert!(bus.publish("run-1", None, text("y")).await.is_err());
    }

    /// Verifies numbering resumes after the last stored event when a bus is reopened.
    #[tokio::test]
    async fn reopen_continues_numbering_from_store() {
        let (bus, store) = bus_with_run(16).await;
        bus.publish("run-1", None, text("a")).await.expect("publish");
        bus.publish("run-1", None, text("b")).await.expect("publish");

        let restarted = EventBus::new(store, 16);
        restarted.open("run-1").await.expect("open");
        let event = restarted
            .publish("run-1", None, text("c"))
            .await
            .expect("publish");
        assert_eq!(event.sequence, 2);
    }
}
