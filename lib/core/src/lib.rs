//! Shared building blocks for the weaver workflow engine.
//!
//! Every other crate in the workspace depends on this one for strongly typed
//! identifiers and the `Result` alias used at public API boundaries.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{ExecutionId, Id, IdKind, ParseIdError, UserId, WorkflowId};
