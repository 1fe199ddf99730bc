//! Deterministic backlog invariant checks.

use std::collections::BTreeSet;

use crate::core::types::Backlog;

/// Validate backlog invariants. Returns a list of human-readable errors.
pub fn validate_backlog(branch_name: &str, backlog: &Backlog) -> Vec<String> {
    let mut errors = Vec::new();
    if branch_name.trim().is_empty() {
        errors.push("branchName must not be blank".to_string());
    }
    if backlog.is_empty() {
        errors.push("backlog must contain at least one story".to_string());
    }

    let mut seen = BTreeSet::new();
    for (idx, story) in backlog.stories.iter().enumerate() {
        if story.id.trim().is_empty() {
            errors.push(format!("story at position {idx} has a blank id"));
        } else if !seen.insert(story.id.as_str()) {
            errors.push(format!("duplicate story id '{}'", story.id));
        }
        if story.title.trim().is_empty() {
            errors.push(format!("story '{}' has a blank title", story.id));
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{backlog, story};

    #[test]
    fn accepts_valid_backlog() {
        let errors = validate_backlog("feature/x", &backlog(vec![story("a", 0), story("b", 0)]));
        assert!(errors.is_empty(), "{errors:?}");
    }

    /// Verifies validation reports every violation, not just the first.
    #[test]
    fn reports_all_violations() {
        let mut untitled = story("b", 0);
        untitled.title = "  ".to_string();
        let errors = validate_backlog(
            "",
            &backlog(vec![story("a", 0), story("a", 1), untitled, story("", 2)]),
        );
        assert!(errors.iter().any(|e| e.contains("branchName")));
        assert!(errors.iter().any(|e| e.contains("duplicate story id 'a'")));
        assert!(errors.iter().any(|e| e.contains("'b' has a blank title")));
        assert!(errors.iter().any(|e| e.contains("position 3 has a blank id")));
    }

    #[test]
    fn rejects_empty_backlog() {
        let errors = validate_backlog("feature/x", &Backlog::default());
        assert_eq!(errors, vec!["backlog must contain at least one story"]);
    }
}
