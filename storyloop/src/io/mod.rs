//! Side-effecting collaborators: backlog loading, configuration, the agent
//! process, git and the source-control provider, and run persistence.

pub mod backlog;
pub mod config;
pub mod executor;
pub mod git;
pub mod prompt;
pub mod source_control;
pub mod store;
