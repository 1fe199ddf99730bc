//! Iteration, cost and wall-clock budget tracking for a run.
//!
//! The tracker keeps no state of its own: every counter lives on the [`Run`]
//! so it is persisted with each checkpoint.

use std::fmt;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::{IterationRecord, Run};

/// Per-run budget ceilings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetConfig {
    /// Hard cap on the number of iterations.
    pub max_iterations: u32,
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
    /// Ceiling on accumulated iteration time.
    #[serde(default)]
    pub max_wall_clock_seconds: Option<f64>,
}

impl BudgetConfig {
    pub fn iterations(max_iterations: u32) -> Self {
        Self {
            max_iterations,
            max_cost_usd: None,
            max_wall_clock_seconds: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("maxIterations must be >= 1"));
        }
        if let Some(cost) = self.max_cost_usd
            && !(cost.is_finite() && cost > 0.0)
        {
            return Err(anyhow!("maxCostUsd must be a positive number"));
        }
        if let Some(secs) = self.max_wall_clock_seconds
            && !(secs.is_finite() && secs > 0.0)
        {
            return Err(anyhow!("maxWallClockSeconds must be a positive number"));
        }
        Ok(())
    }
}

/// Which ceiling stopped the run.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetStop {
    Iterations { used: u32, max: u32 },
    Cost { spent: f64, max: f64 },
    WallClock { elapsed: f64, max: f64 },
}

impl fmt::Display for BudgetStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Iterations { used, max } => {
                write!(f, "iteration budget exhausted ({used}/{max})")
            }
            Self::Cost { spent, max } => {
                write!(f, "cost budget exhausted (${spent:.2} of ${max:.2})")
            }
            Self::WallClock { elapsed, max } => {
                write!(f, "wall-clock budget exhausted ({elapsed:.0}s of {max:.0}s)")
            }
        }
    }
}

/// Return the first exceeded ceiling, if any.
pub fn exhaustion(run: &Run) -> Option<BudgetStop> {
    let budget = &run.budget;
    if run.iterations_used >= budget.max_iterations {
        return Some(BudgetStop::Iterations {
            used: run.iterations_used,
            max: budget.max_iterations,
        });
    }
    if let Some(max) = budget.max_cost_usd
        && run.total_cost >= max
    {
        return Some(BudgetStop::Cost {
            spent: run.total_cost,
            max,
        });
    }
    if let Some(max) = budget.max_wall_clock_seconds
        && run.elapsed_seconds >= max
    {
        return Some(BudgetStop::WallClock {
            elapsed: run.elapsed_seconds,
            max,
        });
    }
    None
}

pub fn can_continue(run: &Run) -> bool {
    exhaustion(run).is_none()
}

/// Charge one finished iteration against the run.
///
/// Must be called exactly once per iteration: the record's number has to be the
/// next unused iteration number, so a repeated charge is rejected.
pub fn charge(run: &mut Run, record: &IterationRecord) -> Result<()> {
    let expected = run.iterations_used + 1;
    if record.number != expected {
        return Err(anyhow!(
            "refuse to charge iteration {} (next chargeable iteration is {expected})",
            record.number
        ));
    }
    if run.iterations_used >= run.budget.max_iterations {
        return Err(anyhow!(
            "iteration {} exceeds maxIterations {}",
            record.number,
            run.budget.max_iterations
        ));
    }
    run.iterations_used = expected;
    if record.cost.is_finite() && record.cost > 0.0 {
        run.total_cost += record.cost;
    }
    if record.duration_seconds.is_finite() && record.duration_seconds > 0.0 {
        run.elapsed_seconds += record.duration_seconds;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::IterationOutcome;
    use crate::test_support::{backlog, run_with, story};

    fn record(number: u32, cost: f64, duration: f64) -> IterationRecord {
        let now = chrono::Utc::now();
        IterationRecord {
            number,
            story_id: "a".to_string(),
            outcome: IterationOutcome::Success,
            cost,
            duration_seconds: duration,
            started_at: now,
            ended_at: now,
            error: None,
            summary: None,
        }
    }

    #[test]
    fn stops_at_max_iterations() {
        let mut run = run_with(backlog(vec![story("a", 0)]), BudgetConfig::iterations(2));
        assert!(can_continue(&run));
        charge(&mut run, &record(1, 0.5, 1.0)).expect("charge 1");
        charge(&mut run, &record(2, 0.5, 1.0)).expect("charge 2");
        assert_eq!(
            exhaustion(&run),
            Some(BudgetStop::Iterations { used: 2, max: 2 })
        );
        assert!(charge(&mut run, &record(3, 0.5, 1.0)).is_err());
        assert_eq!(run.iterations_used, 2);
    }

    /// Verifies the cost ceiling can stop a run before the iteration cap.
    #[test]
    fn cost_ceiling_stops_before_iteration_cap() {
        let budget = BudgetConfig {
            max_iterations: 10,
            max_cost_usd: Some(1.0),
            max_wall_clock_seconds: None,
        };
        let mut run = run_with(backlog(vec![story("a", 0)]), budget);
        charge(&mut run, &record(1, 0.75, 1.0)).expect("charge");
        assert!(can_continue(&run));
        charge(&mut run, &record(2, 0.25, 1.0)).expect("charge");
        assert!(matches!(exhaustion(&run), Some(BudgetStop::Cost { .. })));
    }

    /// Verifies wall-clock use is the sum of iteration durations.
    ///
    /// Only time charged by iterations counts toward the ceiling.
    #[test]
    fn wall_clock_counts_iteration_durations() {
        let budget = BudgetConfig {
            max_iterations: 10,
            max_cost_usd: None,
            max_wall_clock_seconds: Some(60.0),
        };
        let mut run = run_with(backlog(vec![story("a", 0)]), budget);
        charge(&mut run, &record(1, 0.0, 61.0)).expect("charge");
        assert!(matches!(exhaustion(&run), Some(BudgetStop::WallClock { .. })));
    }

    /// Verifies the same iteration is never charged twice.
    #[test]
    fn repeated_charge_is_rejected() {
        let mut run = run_with(backlog(vec![story("a", 0)]), BudgetConfig::iterations(5));
        let first = record(1, 1.0, 2.0);
        charge(&mut run, &first).expect("charge");
        let err = charge(&mut run, &first).unwrap_err();
        assert!(err.to_string().contains("refuse to charge iteration 1"));
        assert_eq!(run.iterations_used, 1);
        assert!((run.total_cost - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn validate_rejects_insane_config() {
        assert!(BudgetConfig::iterations(0).validate().is_err());
        let negative = BudgetConfig {
            max_iterations: 1,
            max_cost_usd: Some(-1.0),
            max_wall_clock_seconds: None,
        };
        assert!(negative.validate().is_err());
        let nan = BudgetConfig {
            max_iterations: 1,
            max_cost_usd: None,
            max_wall_clock_seconds: Some(f64::NAN),
        };
        assert!(nan.validate().is_err());
        assert!(BudgetConfig::iterations(1).validate().is_ok());
    }
}
