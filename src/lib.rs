//! Gastown - work dispatch for fleets of AI coding agents

pub mod address;
pub mod beads;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod feed;
pub mod git;
pub mod lock;
pub mod patrol;
pub mod polecat;
pub mod queue;
pub mod session;
pub mod shell;
pub mod sling;
pub mod subprocess;
pub mod telemetry;
pub mod template;
pub mod town;

#[cfg(test)]
pub mod testing;
