//! Stored workflows.
//!
//! A [`WorkflowDefinition`] is what a [`WorkflowSource`](crate::WorkflowSource)
//! returns: the graph plus descriptive metadata. Metadata is flattened into
//! the same JSON object as `id` and `graph`.

use crate::graph::WorkflowGraph;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use weaver_core::WorkflowId;

/// Descriptive fields of a workflow. None of them affect execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Bumped each time the stored graph is replaced. Compiled plans are
    /// keyed by graph content, so this is informational.
    #[serde(default)]
    pub revision: u32,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl WorkflowMetadata {
    fn named(name: String) -> Self {
        Self {
            name,
            description: None,
            tags: Vec::new(),
            revision: 0,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    #[serde(flatten)]
    pub metadata: WorkflowMetadata,
    pub graph: WorkflowGraph,
}

impl WorkflowDefinition {
    /// A first revision with a fresh id.
    #[must_use]
    pub fn new(name: impl Into<String>, graph: WorkflowGraph) -> Self {
        Self::with_id(WorkflowId::new(), name, graph)
    }

    #[must_use]
    pub fn with_id(id: WorkflowId, name: impl Into<String>, graph: WorkflowGraph) -> Self {
        Self {
            id,
            metadata: WorkflowMetadata::named(name.into()),
            graph,
        }
    }

    #[must_use]
    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn tagged(mut self, tag: impl Into<String>) -> Self {
        self.metadata.tags.push(tag.into());
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Marks this definition as the successor of `previous`.
    pub fn supersede(&mut self, previous: &Self) {
        self.metadata.revision = previous.metadata.revision.saturating_add(1);
        self.metadata.updated_at = Utc::now();
    }
}
