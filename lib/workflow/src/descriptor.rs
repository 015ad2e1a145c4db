//! Node type descriptors.
//!
//! A descriptor is the static contract of a node type: its name, the ports
//! it exposes, the credentials it needs and whether it continues on failure
//! by default. The registry validates descriptors once at registration; the
//! engine checks graphs against them at submit time.

use crate::connection::MAIN_PORT;
use crate::error::PortDirection;
use serde::{Deserialize, Serialize};

/// A named port on a node type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PortSpec {
    /// Creates a port with no description.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }
}

/// A credential slot on a node type.
///
/// Slots are filled positionally from the node's `credentialRefs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSlot {
    pub name: String,
    pub required: bool,
}

/// The static contract of a node type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescriptor {
    pub type_name: String,
    pub inputs: Vec<PortSpec>,
    pub outputs: Vec<PortSpec>,
    #[serde(default)]
    pub credentials: Vec<CredentialSlot>,
    #[serde(default)]
    pub continue_on_fail: bool,
}

impl NodeDescriptor {
    /// Creates a descriptor with one `main` input and one `main` output.
    #[must_use]
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            inputs: vec![PortSpec::new(MAIN_PORT)],
            outputs: vec![PortSpec::new(MAIN_PORT)],
            credentials: Vec::new(),
            continue_on_fail: false,
        }
    }

    /// Creates a trigger descriptor: no inputs, one `main` output.
    #[must_use]
    pub fn trigger(type_name: impl Into<String>) -> Self {
        Self {
            inputs: Vec::new(),
            ..Self::new(type_name)
        }
    }

    /// Replaces the input ports.
    #[must_use]
    pub fn with_inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = names.into_iter().map(PortSpec::new).collect();
        self
    }

    /// Replaces the output ports. The first one receives error items.
    #[must_use]
    pub fn with_outputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = names.into_iter().map(PortSpec::new).collect();
        self
    }

    /// Adds a credential slot.
    #[must_use]
    pub fn with_credential(mut self, name: impl Into<String>, required: bool) -> Self {
        self.credentials.push(CredentialSlot {
            name: name.into(),
            required,
        });
        self
    }

    /// Sets the type-level continue-on-fail default.
    #[must_use]
    pub fn with_continue_on_fail(mut self, enabled: bool) -> Self {
        self.continue_on_fail = enabled;
        self
    }

    /// Whether the type declares `port` on the given side.
    #[must_use]
    pub fn has_port(&self, direction: PortDirection, port: &str) -> bool {
        let ports = match direction {
            PortDirection::Input => &self.inputs,
            PortDirection::Output => &self.outputs,
        };
        ports.iter().any(|p| p.name == port)
    }

    /// The first declared output.
    #[must_use]
    pub fn first_output(&self) -> Option<&str> {
        self.outputs.first().map(|p| p.name.as_str())
    }
}
