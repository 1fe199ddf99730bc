//! Deterministic story selection for the backlog.

use crate::core::types::{Backlog, Story};

/// Pick the next story to work on.
///
/// Among open stories (`passes=false`, not skipped) returns the one with the
/// minimal `priority`; ties go to the earliest backlog position. Returns `None`
/// when nothing is eligible, which signals run completion.
pub fn select_next(backlog: &Backlog) -> Option<&Story> {
    // `min_by_key` returns the first of equal minima.
    backlog
        .stories
        .iter()
        .filter(|story| story.is_open())
        .min_by_key(|story| story.priority)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{backlog, story};

    #[test]
    fn selects_lowest_priority_value() {
        let backlog = backlog(vec![story("a", 2), story("b", 1), story("c", 3)]);
        assert_eq!(select_next(&backlog).map(|s| s.id.as_str()), Some("b"));
    }

    #[test]
    fn ties_keep_backlog_order() {
        let backlog = backlog(vec![story("x", 5), story("a", 1), story("b", 1)]);
        assert_eq!(select_next(&backlog).map(|s| s.id.as_str()), Some("a"));
    }

    #[test]
    fn skips_passed_and_skipped_stories() {
        let mut passed = story("a", 0);
        passed.passes = true;
        let mut skipped = story("b", 0);
        skipped.skipped = true;
        let backlog = backlog(vec![passed, skipped, story("c", 9)]);
        assert_eq!(select_next(&backlog).map(|s| s.id.as_str()), Some("c"));
    }

    #[test]
    fn returns_none_when_all_pass() {
        let mut a = story("a", 0);
        a.passes = true;
        let mut b = story("b", 1);
        b.passes = true;
        assert!(select_next(&backlog(vec![a, b])).is_none());
        assert!(select_next(&Backlog::default()).is_none());
    }

    /// Exhaustive check over small backlogs: the selection is always the open
    /// story with globally minimal priority (first in order on ties), or none
    /// iff every story passes.
    #[test]
    fn selection_is_global_minimum_over_small_backlogs() {
        let priorities = [0i64, 1, 2];
        for p0 in priorities {
            for p1 in priorities {
                for p2 in priorities {
                    for mask in 0u8..8 {
                        let stories: Vec<Story> = [p0, p1, p2]
                            .iter()
                            .enumerate()
                            .map(|(idx, &priority)| {
                                let mut s = story(&format!("s{idx}"), priority);
                                s.passes = mask & (1 << idx) != 0;
                                s
                            })
                            .collect();
                        let backlog = backlog(stories);
                        let selected = select_next(&backlog);

                        let open: Vec<&Story> =
                            backlog.stories.iter().filter(|s| !s.passes).collect();
                        match selected {
                            None => assert!(open.is_empty()),
                            Some(chosen) => {
                                let min = open.iter().map(|s| s.priority).min();
                                assert_eq!(Some(chosen.priority), min);
                                let first = open
                                    .iter()
                                    .find(|s| Some(s.priority) == min)
                                    .map(|s| s.id.as_str());
                                assert_eq!(Some(chosen.id.as_str()), first);
                            }
                        }
                    }
                }
            }
        }
    }
}
