//! Command-line runner for weaver workflows.
//!
//! Loads a workflow file, registers the built-in node types, runs one
//! execution and streams its lifecycle events as JSON lines.

pub mod cli;
pub mod config;
pub mod error;
pub mod load;
pub mod run;

pub use cli::Cli;
pub use config::RunnerConfig;
pub use error::RunnerError;
pub use run::run;
