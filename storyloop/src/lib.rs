//! Autonomous agent run orchestrator.
//!
//! A run takes a prioritised story backlog, repeatedly hands the next open
//! story to an agent executor, and records every outcome until the backlog
//! passes, the budget runs out, or an operator stops it. The crate keeps a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (selection, budgets, failure
//!   classification, allowed transitions). No I/O.
//! - **[`io`]**: Side-effecting operations (backlog files, agent processes,
//!   git, persistence). Behind traits so tests can script them.
//!
//! [`orchestrator`] ties the two together: it registers runs, spawns one
//! [`run`] worker per active run and exposes the control and event surfaces.

pub mod branch;
pub mod core;
pub mod driver;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod registry;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
