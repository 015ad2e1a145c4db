//! Runner errors.

use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
    /// Environment or config file could not be turned into settings.
    Config { reason: String },
    /// An input file could not be read or parsed.
    Load { path: PathBuf, reason: String },
    /// Trigger data given on the command line is not JSON.
    InvalidTriggerData { reason: String },
    /// The persistence sink could not be reached.
    Sink { reason: String },
    /// The built-in node types could not be registered.
    Registry,
    /// Progress could not be written out.
    Output { reason: String },
    /// The engine refused or lost the execution.
    Execution,
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { reason } => write!(f, "invalid configuration: {reason}"),
            Self::Load { path, reason } => {
                write!(f, "failed to load {}: {reason}", path.display())
            }
            Self::InvalidTriggerData { reason } => {
                write!(f, "trigger data is not valid JSON: {reason}")
            }
            Self::Sink { reason } => write!(f, "execution sink unavailable: {reason}"),
            Self::Registry => write!(f, "failed to register node types"),
            Self::Output { reason } => write!(f, "failed to write output: {reason}"),
            Self::Execution => write!(f, "workflow execution failed to run"),
        }
    }
}

impl std::error::Error for RunnerError {}
