//! CLI module for orbit.

pub mod args;
pub mod commands;

pub use args::{AuthCommands, Cli, Commands};
