//! Story prompt builder for executor input.
//!
//! The prompt is rendered from an embedded minijinja template whose sections are
//! delimited by `<!-- section:KEY required|droppable -->` markers. When the
//! rendered prompt exceeds the byte budget, droppable sections are removed.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::types::{IterationOutcome, Run, Story};

const STORY_TEMPLATE: &str = include_str!("prompts/story.md");

/// Drop order when over budget.
const DROP_ORDER: [&str; 2] = ["progress", "failure"];

#[derive(Debug, Clone, Serialize)]
struct StoryView {
    id: String,
    title: String,
    epic: String,
    priority: i64,
    description: Option<String>,
    acceptance_criteria: Vec<String>,
}

impl StoryView {
    fn from_story(story: &Story) -> Self {
        Self {
            id: story.id.clone(),
            title: story.title.clone(),
            epic: story.epic_label().to_string(),
            priority: story.priority,
            description: story
                .description
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            acceptance_criteria: story.acceptance_criteria.clone(),
        }
    }
}

/// Summary of an earlier successful iteration in the same run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEntry {
    pub story_id: String,
    pub summary: String,
}

/// Everything the template needs for one iteration.
#[derive(Debug, Clone)]
pub struct PromptInputs {
    pub story: Story,
    pub branch: String,
    /// 1-based attempt number for this story.
    pub attempt: u32,
    pub progress: Vec<ProgressEntry>,
    /// Error of the previous attempt at the same story, if it failed.
    pub failure: Option<String>,
}

impl PromptInputs {
    /// Gather accumulated context for `story` from the run history.
    pub fn from_run(run: &Run, story: &Story, branch: &str) -> Self {
        let progress = run
            .iterations
            .iter()
            .filter(|record| record.outcome == IterationOutcome::Success)
            .filter_map(|record| {
                let summary = record.summary.as_deref()?.trim();
                (!summary.is_empty()).then(|| ProgressEntry {
                    story_id: record.story_id.clone(),
                    summary: summary.to_string(),
                })
            })
            .collect();
        let failure = run
            .last_iteration_for(&story.id)
            .filter(|record| record.outcome != IterationOutcome::Success)
            .and_then(|record| record.error.clone());
        Self {
            story: story.clone(),
            branch: branch.to_string(),
            attempt: story.attempts + 1,
            progress,
            failure,
        }
    }
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("story", STORY_TEMPLATE)
            .expect("story template should be valid");
        Self { env }
    }

    fn render(&self, input: &PromptInputs) -> Result<String> {
        let template = self.env.get_template("story")?;
        let rendered = template.render(context! {
            story => StoryView::from_story(&input.story),
            branch => input.branch.as_str(),
            attempt => input.attempt,
            progress => (!input.progress.is_empty()).then_some(&input.progress),
            failure => input.failure.as_deref().map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }
}

/// Builds a prompt within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build(&self, inputs: &PromptInputs) -> Result<String> {
        let rendered = PromptEngine::new().render(inputs)?;
        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section marker")
});

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (idx, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(idx + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    let total = |secs: &[Section]| -> usize { secs.iter().map(|s| s.content.len()).sum() };
    for key in DROP_ORDER {
        if total(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped prompt section for budget"
            );
            sections.remove(idx);
        }
    }
}

fn render_sections(sections: &[Section]) -> String {
    let mut out = sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::IterationRecord;
    use crate::test_support::{backlog, run_with, story};

    fn inputs() -> PromptInputs {
        let mut s = story("US-2", 1);
        s.acceptance_criteria = vec!["shows a list".to_string(), "has tests".to_string()];
        s.epic = Some("Catalog".to_string());
        PromptInputs {
            story: s,
            branch: "feature/catalog".to_string(),
            attempt: 2,
            progress: vec![ProgressEntry {
                story_id: "US-1".to_string(),
                summary: "added the model".to_string(),
            }],
            failure: Some("cargo test failed".to_string()),
        }
    }

    #[test]
    fn renders_story_and_context() {
        let prompt = PromptBuilder::new(40_000).build(&inputs()).expect("build");
        assert!(prompt.contains("## Story US-2: US-2 title"));
        assert!(prompt.contains("Epic: Catalog"));
        assert!(prompt.contains("- shows a list"));
        assert!(prompt.contains("- US-1: added the model"));
        assert!(prompt.contains("cargo test failed"));
        assert!(prompt.contains("`feature/catalog`"));
        assert!(!prompt.contains("section:"));
    }

    /// Verifies optional sections are dropped first when the prompt is too large.
    #[test]
    fn drops_droppable_sections_over_budget() {
        let prompt = PromptBuilder::new(10).build(&inputs()).expect("build");
        assert!(prompt.contains("Acceptance criteria"));
        assert!(!prompt.contains("Progress so far"));
        assert!(!prompt.contains("Previous attempt failed"));
    }

    #[test]
    fn from_run_collects_successes_and_last_failure() {
        let mut run = run_with(
            backlog(vec![story("a", 0), story("b", 1)]),
            crate::core::budget::BudgetConfig::iterations(5),
        );
        let now = chrono::Utc::now();
        run.iterations.push(IterationRecord {
            number: 1,
            story_id: "a".to_string(),
            outcome: IterationOutcome::Success,
            cost: 0.0,
            duration_seconds: 1.0,
            started_at: now,
            ended_at: now,
            error: None,
            summary: Some("did a".to_string()),
        });
        run.iterations.push(IterationRecord {
            number: 2,
            story_id: "b".to_string(),
            outcome: IterationOutcome::RetryableFailure,
            cost: 0.0,
            duration_seconds: 1.0,
            started_at: now,
            ended_at: now,
            error: Some("timed out".to_string()),
            summary: None,
        });
        let mut b = story("b", 1);
        b.attempts = 1;

        let inputs = PromptInputs::from_run(&run, &b, "feature/x");
        assert_eq!(inputs.attempt, 2);
        assert_eq!(
            inputs.progress,
            vec![ProgressEntry {
                story_id: "a".to_string(),
                summary: "did a".to_string()
            }]
        );
        assert_eq!(inputs.failure.as_deref(), Some("timed out"));
    }
}
