//! NATS JetStream persistence.
//!
//! Records are published as [`Envelope`]s under one subject tree per
//! execution:
//! - `execution.<id>.node`: node state snapshots
//! - `execution.<id>.record`: execution records
//! - `execution.<id>.events`: lifecycle events, for the WebSocket fan-out
//!
//! All three land in the `WEAVER_EXECUTIONS` stream.

use crate::envelope::{Envelope, RecordKind};
use crate::error::SinkError;
use crate::events::LifecycleEvent;
use crate::execution::{Execution, NodeSnapshot};
use crate::sink::ExecutionSink;
use async_nats::jetstream;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use weaver_core::ExecutionId;

const SUBJECT_PREFIX: &str = "execution";

const STREAM_NAME: &str = "WEAVER_EXECUTIONS";

fn default_url() -> String {
    "nats://localhost:4222".to_string()
}

/// Connection settings for the JetStream sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatsConfig {
    #[serde(default = "default_url")]
    pub url: String,
    /// Overrides `WEAVER_EXECUTIONS`.
    #[serde(default)]
    pub stream_name: Option<String>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self::new(default_url())
    }
}

impl NatsConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream_name: None,
        }
    }

    fn stream(&self) -> &str {
        self.stream_name.as_deref().unwrap_or(STREAM_NAME)
    }
}

/// Subject a record of `kind` for `execution_id` is published to.
#[must_use]
pub fn subject_for(execution_id: ExecutionId, kind: RecordKind) -> String {
    format!("{SUBJECT_PREFIX}.{execution_id}.{}", kind.subject_suffix())
}

/// Creates the stream if it does not exist yet.
///
/// # Errors
///
/// Returns an error if JetStream refuses the stream.
pub async fn ensure_stream(
    jetstream: &jetstream::Context,
    config: &NatsConfig,
) -> Result<(), SinkError> {
    let stream = jetstream::stream::Config {
        name: config.stream().to_string(),
        subjects: vec![format!("{SUBJECT_PREFIX}.>")],
        storage: jetstream::stream::StorageType::File,
        retention: jetstream::stream::RetentionPolicy::Limits,
        ..Default::default()
    };
    jetstream
        .get_or_create_stream(stream)
        .await
        .map_err(|e| SinkError::Unavailable {
            reason: format!("failed to create stream {}: {e}", config.stream()),
        })?;
    Ok(())
}

async fn publish<T: Serialize>(
    jetstream: &jetstream::Context,
    subject: String,
    envelope: &Envelope<T>,
) -> Result<(), SinkError> {
    let bytes = envelope
        .to_json_bytes()
        .map_err(|e| SinkError::Serialization {
            reason: e.to_string(),
        })?;

    jetstream
        .publish(subject.clone(), bytes.into())
        .await
        .map_err(|e| SinkError::Publish {
            subject: subject.clone(),
            reason: e.to_string(),
        })?
        .await
        .map_err(|e| SinkError::Publish {
            subject,
            reason: e.to_string(),
        })?;
    Ok(())
}

/// [`ExecutionSink`] backed by JetStream.
#[derive(Clone)]
pub struct NatsExecutionSink {
    jetstream: jetstream::Context,
}

impl std::fmt::Debug for NatsExecutionSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsExecutionSink").finish_non_exhaustive()
    }
}

impl NatsExecutionSink {
    /// Connects and makes sure the stream exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable or the stream cannot be
    /// created.
    pub async fn connect(config: &NatsConfig) -> Result<Self, SinkError> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| SinkError::Unavailable {
                reason: format!("failed to connect to {}: {e}", config.url),
            })?;
        let jetstream = jetstream::new(client);
        ensure_stream(&jetstream, config).await?;
        info!(url = %config.url, stream = config.stream(), "connected execution sink");
        Ok(Self { jetstream })
    }

    /// Uses an existing JetStream context. The stream must already exist.
    #[must_use]
    pub fn from_context(jetstream: jetstream::Context) -> Self {
        Self { jetstream }
    }

    /// The underlying context, for [`forward_events`].
    #[must_use]
    pub fn context(&self) -> &jetstream::Context {
        &self.jetstream
    }
}

#[async_trait]
impl ExecutionSink for NatsExecutionSink {
    async fn record_node(&self, snapshot: &NodeSnapshot) -> Result<(), SinkError> {
        let subject = subject_for(snapshot.execution_id, RecordKind::NodeState);
        publish(&self.jetstream, subject, &Envelope::new(RecordKind::NodeState, snapshot)).await
    }

    async fn record_execution(&self, execution: &Execution) -> Result<(), SinkError> {
        let subject = subject_for(execution.id, RecordKind::Execution);
        publish(&self.jetstream, subject, &Envelope::new(RecordKind::Execution, execution)).await
    }
}

/// Republishes lifecycle events until the broadcaster closes.
///
/// Lagging drops events rather than stalling; the gap is logged.
pub fn forward_events(
    jetstream: jetstream::Context,
    mut events: broadcast::Receiver<LifecycleEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let subject = subject_for(event.execution_id, RecordKind::LifecycleEvent);
                    let envelope = Envelope::new(RecordKind::LifecycleEvent, &event);
                    if let Err(e) = publish(&jetstream, subject, &envelope).await {
                        warn!(execution_id = %event.execution_id, seq = event.seq, error = %e, "failed to forward event");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = NatsConfig::default();
        assert_eq!(config.url, "nats://localhost:4222");
        assert_eq!(config.stream(), STREAM_NAME);

        let custom = NatsConfig {
            stream_name: Some("CUSTOM".to_string()),
            ..NatsConfig::new("nats://nats:4222")
        };
        assert_eq!(custom.stream(), "CUSTOM");
    }

    #[test]
    fn subjects_are_per_execution() {
        let id = ExecutionId::new();
        assert_eq!(
            subject_for(id, RecordKind::NodeState),
            format!("execution.{id}.node")
        );
        assert!(subject_for(id, RecordKind::Execution).ends_with(".record"));
        assert!(subject_for(id, RecordKind::LifecycleEvent).ends_with(".events"));
    }
}
