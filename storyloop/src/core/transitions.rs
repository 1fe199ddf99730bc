//! Run status transition table.
//!
//! Status only moves forward, except `running <-> paused`. Terminal states
//! accept no transitions.

use crate::core::types::RunStatus;

/// Returns true if `from -> to` is a legal run status transition.
pub fn is_allowed(from: RunStatus, to: RunStatus) -> bool {
    use RunStatus as S;
    match from {
        S::Pending => matches!(to, S::Running | S::Paused | S::Cancelled | S::Failed),
        S::Running => matches!(
            to,
            S::Paused | S::Completed | S::Exhausted | S::Failed | S::Cancelled
        ),
        S::Paused => matches!(to, S::Running | S::Cancelled | S::Failed),
        S::Completed | S::Exhausted | S::Failed | S::Cancelled => false,
    }
}
