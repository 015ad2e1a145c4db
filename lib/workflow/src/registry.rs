//! Node type registry.
//!
//! The engine only depends on [`NodeProvider`]. [`NodeRegistry`] is the
//! standard implementation: its type map lives behind an `ArcSwap`, so
//! lookups on the dispatch path never take a lock, and a full [`reload`]
//! swaps in a new set atomically while running executions keep the logic
//! they already resolved.
//!
//! [`reload`]: NodeRegistry::reload

use crate::error::{PortDirection, RegistrationError};
use crate::descriptor::{NodeDescriptor, PortSpec};
use crate::runtime::NodeLogic;
use arc_swap::ArcSwap;
use rootcause::prelude::Report;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Lookup of node logic by type name.
pub trait NodeProvider: Send + Sync {
    /// Returns the logic registered for `node_type`.
    fn get(&self, node_type: &str) -> Option<Arc<dyn NodeLogic>>;

    /// Registered type names, sorted.
    fn type_names(&self) -> Vec<String>;
}

type TypeMap = HashMap<String, Arc<dyn NodeLogic>>;

/// Hot-swappable node type registry.
pub struct NodeRegistry {
    types: ArcSwap<TypeMap>,
    // Serializes writers; readers go through `types` without locking.
    writer: Mutex<()>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

impl NodeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            types: ArcSwap::from_pointee(HashMap::new()),
            writer: Mutex::new(()),
        }
    }

    /// Registers one node type.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor is invalid or the type name is
    /// already taken.
    pub fn register(&self, logic: Arc<dyn NodeLogic>) -> Result<(), Report<RegistrationError>> {
        let descriptor = logic.descriptor();
        validate_descriptor(&descriptor)?;

        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.types.load();
        if current.contains_key(&descriptor.type_name) {
            return Err(RegistrationError::DuplicateType {
                node_type: descriptor.type_name,
            }
            .into());
        }
        let mut next = TypeMap::clone(&current);
        next.insert(descriptor.type_name.clone(), logic);
        self.types.store(Arc::new(next));

        info!(node_type = %descriptor.type_name, "registered node type");
        Ok(())
    }

    /// Replaces the whole set of node types.
    ///
    /// Either every type is valid and the new set is swapped in, or nothing
    /// changes.
    ///
    /// # Errors
    ///
    /// Returns the first invalid descriptor or duplicate type name.
    pub fn reload(&self, logics: Vec<Arc<dyn NodeLogic>>) -> Result<(), Report<RegistrationError>> {
        let mut next = TypeMap::with_capacity(logics.len());
        for logic in logics {
            let descriptor = logic.descriptor();
            validate_descriptor(&descriptor)?;
            if next.contains_key(&descriptor.type_name) {
                return Err(RegistrationError::DuplicateType {
                    node_type: descriptor.type_name,
                }
                .into());
            }
            next.insert(descriptor.type_name, logic);
        }

        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let count = next.len();
        self.types.store(Arc::new(next));
        info!(count, "reloaded node types");
        Ok(())
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.load().len()
    }

    /// Returns true when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NodeProvider for NodeRegistry {
    fn get(&self, node_type: &str) -> Option<Arc<dyn NodeLogic>> {
        self.types.load().get(node_type).cloned()
    }

    fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.load().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Checks a descriptor in isolation.
///
/// # Errors
///
/// Returns the first problem found.
pub fn validate_descriptor(descriptor: &NodeDescriptor) -> Result<(), RegistrationError> {
    if descriptor.type_name.trim().is_empty() {
        return Err(RegistrationError::EmptyTypeName);
    }
    if descriptor.outputs.is_empty() {
        return Err(RegistrationError::NoOutputPorts {
            node_type: descriptor.type_name.clone(),
        });
    }
    check_ports(&descriptor.type_name, &descriptor.inputs, PortDirection::Input)?;
    check_ports(&descriptor.type_name, &descriptor.outputs, PortDirection::Output)
}

fn check_ports(
    node_type: &str,
    ports: &[PortSpec],
    direction: PortDirection,
) -> Result<(), RegistrationError> {
    let mut seen = HashSet::with_capacity(ports.len());
    for port in ports {
        if port.name.trim().is_empty() {
            return Err(RegistrationError::EmptyPortName {
                node_type: node_type.to_string(),
                direction,
            });
        }
        if !seen.insert(port.name.as_str()) {
            return Err(RegistrationError::DuplicatePort {
                node_type: node_type.to_string(),
                port: port.name.clone(),
                direction,
            });
        }
    }
    Ok(())
}
