//! Stable exit codes for storyloop CLI commands.

use crate::core::types::RunStatus;

/// Command succeeded, a story was selected, or the run completed.
pub const OK: i32 = 0;
/// Invalid backlog/config/arguments or an internal error.
pub const INVALID: i32 = 1;
/// `storyloop select` found no eligible story.
pub const NOTHING_SELECTED: i32 = 2;
/// The run stopped on its budget.
pub const EXHAUSTED: i32 = 3;
/// The run failed.
pub const FAILED: i32 = 4;
pub const CANCELLED: i32 = 5;
/// The run was paused and can be resumed.
pub const PAUSED: i32 = 6;

/// Exit code reported for a run that stopped in `status`.
pub fn for_status(status: RunStatus) -> i32 {
    match status {
        RunStatus::Completed => OK,
        RunStatus::Exhausted => EXHAUSTED,
        RunStatus::Failed => FAILED,
        RunStatus::Cancelled => CANCELLED,
        RunStatus::Paused => PAUSED,
        RunStatus::Pending | RunStatus::Running => INVALID,
    }
}
