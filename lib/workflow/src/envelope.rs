//! Versioned wrapper for records leaving the engine.
//!
//! Anything written to NATS carries a schema version and a record kind next
//! to the payload, so consumers can route and migrate without decoding the
//! payload first.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Schema version written by this build.
pub const SCHEMA_VERSION: u32 = 1;

/// What an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordKind {
    NodeState,
    Execution,
    LifecycleEvent,
}

impl RecordKind {
    /// Last subject token for this kind.
    #[must_use]
    pub fn subject_suffix(self) -> &'static str {
        match self {
            Self::NodeState => "node",
            Self::Execution => "record",
            Self::LifecycleEvent => "events",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub version: u32,
    pub kind: RecordKind,
    pub recorded_at: DateTime<Utc>,
    pub payload: T,
}

impl<T> Envelope<T> {
    #[must_use]
    pub fn new(kind: RecordKind, payload: T) -> Self {
        Self {
            version: SCHEMA_VERSION,
            kind,
            recorded_at: Utc::now(),
            payload,
        }
    }

    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }
}

impl<T: Serialize> Envelope<T> {
    /// Encodes as JSON.
    ///
    /// # Errors
    ///
    /// Returns the serializer error.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Decodes JSON, rejecting versions newer than this build understands.
    ///
    /// # Errors
    ///
    /// Returns the deserializer error, or a custom error for a future version.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let envelope: Self = serde_json::from_slice(bytes)?;
        if envelope.version > SCHEMA_VERSION {
            return Err(serde::de::Error::custom(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn header_sits_next_to_payload() {
        let envelope = Envelope::new(RecordKind::NodeState, json!({"status": "success"}));
        let json = serde_json::to_value(&envelope).expect("to_value");
        assert_eq!(json["version"], SCHEMA_VERSION);
        assert_eq!(json["kind"], "node-state");
        assert!(json.get("recordedAt").is_some());
        assert_eq!(json["payload"]["status"], "success");
    }

    #[test]
    fn decodes_current_version() {
        let envelope = Envelope::new(RecordKind::Execution, json!({"id": 1}));
        let bytes = envelope.to_json_bytes().expect("encode");
        let decoded: Envelope<serde_json::Value> =
            Envelope::from_json_bytes(&bytes).expect("decode");
        assert_eq!(decoded.kind, RecordKind::Execution);
        assert_eq!(decoded.into_payload(), json!({"id": 1}));
    }

    #[test]
    fn rejects_future_versions() {
        let bytes = serde_json::to_vec(&json!({
            "version": SCHEMA_VERSION + 1,
            "kind": "execution",
            "recordedAt": "2026-01-01T00:00:00Z",
            "payload": {}
        }))
        .expect("encode");
        let err = Envelope::<serde_json::Value>::from_json_bytes(&bytes).expect_err("too new");
        assert!(err.to_string().contains("unsupported envelope version"));
    }

    #[test]
    fn subject_suffixes() {
        assert_eq!(RecordKind::NodeState.subject_suffix(), "node");
        assert_eq!(RecordKind::Execution.subject_suffix(), "record");
        assert_eq!(RecordKind::LifecycleEvent.subject_suffix(), "events");
    }
}
