//! Runner configuration.
//!
//! Loaded with the `config` crate from an optional file, then from
//! environment variables prefixed `WEAVER` with `__` between levels:
//!
//! ```text
//! WEAVER__ENGINE__CONCURRENCY__GLOBAL=32
//! WEAVER__ENGINE__SECURITY__ALLOW_PRIVATE_NETWORKS=true
//! WEAVER__NATS__URL=nats://nats:4222
//! ```

use crate::error::RunnerError;
use serde::Deserialize;
use std::path::Path;
use weaver_workflow::{EngineConfig, NatsConfig};

/// Runner configuration composed from library configs.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    /// Persist executions to JetStream when set.
    #[serde(default)]
    pub nats: Option<NatsConfig>,
}

impl RunnerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable does not fit its setting.
    pub fn from_env() -> Result<Self, RunnerError> {
        Self::load(None, environment())
    }

    /// Loads `path`, with environment variables taking precedence.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or a value is invalid.
    pub fn from_file_and_env(path: &Path) -> Result<Self, RunnerError> {
        Self::load(Some(path), environment())
    }

    fn load(file: Option<&Path>, env: config::Environment) -> Result<Self, RunnerError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }
        builder
            .add_source(env)
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|e| RunnerError::Config {
                reason: e.to_string(),
            })
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("WEAVER")
        .separator("__")
        .try_parsing(true)
}
