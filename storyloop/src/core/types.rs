//! Shared deterministic types for the orchestrator core.
//!
//! These types define stable contracts between core components and the
//! persisted checkpoint format. They should not depend on external state or
//! I/O. Field names serialize in camelCase to match the backlog document.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::budget::BudgetConfig;

/// Epic label used for stories that do not declare one.
pub const UNGROUPED_EPIC: &str = "ungrouped";

/// One unit of work with acceptance criteria and a priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Lower value means higher precedence.
    #[serde(default)]
    pub priority: i64,
    /// Set only by the orchestrator after a successful iteration.
    #[serde(default)]
    pub passes: bool,
    /// Incremented on every iteration outcome for this story.
    #[serde(default)]
    pub attempts: u32,
    /// Set when the story failed fatally under the `skip_story` policy.
    #[serde(default, skip_serializing_if = "is_false")]
    pub skipped: bool,
}

impl Story {
    pub fn epic_label(&self) -> &str {
        self.epic
            .as_deref()
            .filter(|epic| !epic.trim().is_empty())
            .unwrap_or(UNGROUPED_EPIC)
    }

    /// Eligible for selection: not passed and not skipped.
    pub fn is_open(&self) -> bool {
        !self.passes && !self.skipped
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// The Run-owned, mutable copy of the story list. Order is the backlog order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Backlog {
    pub stories: Vec<Story>,
}

impl Backlog {
    pub fn new(stories: Vec<Story>) -> Self {
        Self { stories }
    }

    pub fn get(&self, id: &str) -> Option<&Story> {
        self.stories.iter().find(|story| story.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Story> {
        self.stories.iter_mut().find(|story| story.id == id)
    }

    pub fn len(&self) -> usize {
        self.stories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stories.is_empty()
    }

    pub fn passed_count(&self) -> usize {
        self.stories.iter().filter(|story| story.passes).count()
    }

    /// Ids of stories that have not passed, in backlog order.
    pub fn remaining_ids(&self) -> Vec<String> {
        self.stories
            .iter()
            .filter(|story| !story.passes)
            .map(|story| story.id.clone())
            .collect()
    }

    pub fn skipped_ids(&self) -> Vec<String> {
        self.stories
            .iter()
            .filter(|story| story.skipped)
            .map(|story| story.id.clone())
            .collect()
    }
}

/// Lifecycle status of a Run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Exhausted,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Exhausted | Self::Failed | Self::Cancelled
        )
    }

    /// True while a worker may be (or should be) driving the run.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Exhausted => "exhausted",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let status = match value {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "exhausted" => Self::Exhausted,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        };
        Some(status)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified result of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationOutcome {
    Success,
    RetryableFailure,
    FatalFailure,
}

/// One attempt at one story. Immutable once appended to the run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationRecord {
    /// 1-based, monotonically increasing per run.
    pub number: u32,
    pub story_id: String,
    pub outcome: IterationOutcome,
    pub cost: f64,
    pub duration_seconds: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Present iff `outcome != Success`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Executor summary of a successful iteration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// One execution of a backlog. This is also the persisted checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub project_id: String,
    /// Reference to the originating backlog document.
    pub source_id: String,
    /// SHA-256 of the backlog document as loaded at start.
    pub source_digest: String,
    pub status: RunStatus,
    #[serde(flatten)]
    pub budget: BudgetConfig,
    pub iterations_used: u32,
    /// Monotonically increasing monetary accumulator (USD).
    pub total_cost: f64,
    /// Accumulated iteration wall-clock time.
    pub elapsed_seconds: f64,
    /// Branch name declared by the backlog document.
    pub declared_branch: String,
    /// The run-level integration branch, once created.
    #[serde(default)]
    pub branch_name: Option<String>,
    /// The single open pull request associated with the run.
    #[serde(default)]
    pub pr_number: Option<u64>,
    /// Set only while an iteration is in flight.
    #[serde(default)]
    pub current_story_id: Option<String>,
    pub backlog: Backlog,
    #[serde(default)]
    pub iterations: Vec<IterationRecord>,
    /// Final error summary when the run failed.
    #[serde(default)]
    pub error: Option<String>,
    /// First event sequence not covered by this checkpoint.
    #[serde(default)]
    pub next_sequence: u64,
    /// Optimistic-concurrency revision of the persisted checkpoint.
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn max_iterations(&self) -> u32 {
        self.budget.max_iterations
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id.clone(),
            project_id: self.project_id.clone(),
            source_id: self.source_id.clone(),
            status: self.status,
            iterations_used: self.iterations_used,
            max_iterations: self.budget.max_iterations,
            total_cost: self.total_cost,
            stories_total: self.backlog.len(),
            stories_passed: self.backlog.passed_count(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Most recent iteration for a story, if any.
    pub fn last_iteration_for(&self, story_id: &str) -> Option<&IterationRecord> {
        self.iterations
            .iter()
            .rev()
            .find(|record| record.story_id == story_id)
    }
}

/// Lightweight summary for listing runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub id: String,
    pub project_id: String,
    pub source_id: String,
    pub status: RunStatus,
    pub iterations_used: u32,
    pub max_iterations: u32,
    pub total_cost: f64,
    pub stories_total: usize,
    pub stories_passed: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Filters for `list_runs`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFilter {
    #[serde(default)]
    pub status: Option<RunStatus>,
    /// Only runs that are pending, running or paused.
    #[serde(default)]
    pub active_only: bool,
}

impl RunFilter {
    pub fn matches(&self, run: &Run) -> bool {
        if let Some(status) = self.status
            && run.status != status
        {
            return false;
        }
        if self.active_only && run.status.is_terminal() {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn story_defaults_epic_to_ungrouped() {
        let story: Story = serde_json::from_str(r#"{"id":"US-1","title":"Login"}"#).expect("parse");
        assert_eq!(story.epic_label(), UNGROUPED_EPIC);
        assert!(story.is_open());
        assert_eq!(story.attempts, 0);
    }

    #[test]
    fn run_status_terminal_set() {
        let terminal: Vec<RunStatus> = [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Paused,
            RunStatus::Completed,
            RunStatus::Exhausted,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ]
        .into_iter()
        .filter(|status| status.is_terminal())
        .collect();
        assert_eq!(
            terminal,
            vec![
                RunStatus::Completed,
                RunStatus::Exhausted,
                RunStatus::Failed,
                RunStatus::Cancelled
            ]
        );
    }

    #[test]
    fn run_status_parse_matches_display() {
        for status in [RunStatus::Paused, RunStatus::Exhausted, RunStatus::Cancelled] {
            assert_eq!(RunStatus::parse(&status.to_string()), Some(status));
        }
        assert_eq!(RunStatus::parse("done"), None);
    }
}
