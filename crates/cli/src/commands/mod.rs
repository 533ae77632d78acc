//! Subcommand implementations

pub mod health;
pub mod stats;
