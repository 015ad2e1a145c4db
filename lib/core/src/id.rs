//! Strongly-typed identifiers.
//!
//! Every id is a ULID tagged with the kind of thing it names, so a
//! `WorkflowId` can never be passed where an `ExecutionId` is expected.
//! Ids sort by creation time, display with a short prefix (`exec_01H...`)
//! and parse with or without that prefix. On the wire they are bare ULIDs.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// The kind of entity an [`Id`] names.
pub trait IdKind {
    /// Type name used in parse errors.
    const NAME: &'static str;
    /// Prefix written before the ULID when displayed.
    const PREFIX: &'static str;
}

/// Marker for [`UserId`].
#[derive(Debug)]
pub enum UserKind {}

impl IdKind for UserKind {
    const NAME: &'static str = "UserId";
    const PREFIX: &'static str = "usr";
}

/// Marker for [`WorkflowId`].
#[derive(Debug)]
pub enum WorkflowKind {}

impl IdKind for WorkflowKind {
    const NAME: &'static str = "WorkflowId";
    const PREFIX: &'static str = "wf";
}

/// Marker for [`ExecutionId`].
#[derive(Debug)]
pub enum ExecutionKind {}

impl IdKind for ExecutionKind {
    const NAME: &'static str = "ExecutionId";
    const PREFIX: &'static str = "exec";
}

/// Identifies the user a workflow runs on behalf of.
pub type UserId = Id<UserKind>;

/// Identifies a stored workflow definition.
pub type WorkflowId = Id<WorkflowKind>;

/// Identifies one run of a workflow, from trigger to terminal status.
pub type ExecutionId = Id<ExecutionKind>;

/// A ULID tagged with the kind of entity it identifies.
pub struct Id<K> {
    ulid: Ulid,
    kind: PhantomData<fn() -> K>,
}

impl<K: IdKind> Id<K> {
    /// Generates a fresh id stamped with the current time.
    #[must_use]
    pub fn new() -> Self {
        Self::from_ulid(Ulid::new())
    }

    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            kind: PhantomData,
        }
    }

    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.ulid
    }

    /// Prefix used when displaying this kind of id.
    #[must_use]
    pub const fn prefix() -> &'static str {
        K::PREFIX
    }
}

impl<K: IdKind> Default for Id<K> {
    fn default() -> Self {
        Self::new()
    }
}

// Manual impls: derives would demand the same traits of the marker type.
impl<K> Clone for Id<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Id<K> {}

impl<K> PartialEq for Id<K> {
    fn eq(&self, other: &Self) -> bool {
        self.ulid == other.ulid
    }
}

impl<K> Eq for Id<K> {}

impl<K> PartialOrd for Id<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Id<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ulid.cmp(&other.ulid)
    }
}

impl<K> Hash for Id<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ulid.hash(state);
    }
}

impl<K: IdKind> fmt::Debug for Id<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", K::NAME, self.ulid)
    }
}

impl<K: IdKind> fmt::Display for Id<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", K::PREFIX, self.ulid)
    }
}

/// Error returned when a string is not a valid id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// Which id type was being parsed.
    pub id_type: &'static str,
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

impl<K: IdKind> FromStr for Id<K> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s
            .strip_prefix(K::PREFIX)
            .and_then(|rest| rest.strip_prefix('_'))
            .unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|e| ParseIdError {
                id_type: K::NAME,
                reason: e.to_string(),
            })
    }
}

impl<K: IdKind> From<Ulid> for Id<K> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<K> From<Id<K>> for Ulid {
    fn from(id: Id<K>) -> Self {
        id.ulid
    }
}

impl<K> Serialize for Id<K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.ulid.serialize(serializer)
    }
}

impl<'de, K: IdKind> Deserialize<'de> for Id<K> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ulid::deserialize(deserializer).map(Self::from_ulid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn displays_with_kind_prefix() {
        assert!(UserId::new().to_string().starts_with("usr_"));
        assert!(WorkflowId::new().to_string().starts_with("wf_"));
        assert!(ExecutionId::new().to_string().starts_with("exec_"));
        assert_eq!(ExecutionId::prefix(), "exec");
    }

    #[test]
    fn parses_display_output_and_bare_ulids() {
        let id = WorkflowId::new();
        assert_eq!(id.to_string().parse::<WorkflowId>(), Ok(id));

        let ulid = Ulid::new();
        let bare: ExecutionId = ulid.to_string().parse().expect("bare ulid");
        assert_eq!(bare.as_ulid(), ulid);
    }

    #[test]
    fn another_kinds_prefix_is_rejected() {
        let user = UserId::new().to_string();
        let err = user.parse::<WorkflowId>().expect_err("usr_ is not wf_");
        assert_eq!(err.id_type, "WorkflowId");
        assert!(err.to_string().starts_with("invalid WorkflowId"));
    }

    #[test]
    fn garbage_is_rejected() {
        let err = "not_a_ulid".parse::<ExecutionId>().expect_err("garbage");
        assert_eq!(err.id_type, "ExecutionId");
    }

    #[test]
    fn equal_ulids_are_equal_ids() {
        let ulid = Ulid::new();
        let mut seen = HashSet::new();
        seen.insert(UserId::from_ulid(ulid));
        seen.insert(UserId::from(ulid));
        seen.insert(UserId::new());
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn ordered_by_creation_time() {
        let first = ExecutionId::from_ulid(Ulid::from_parts(1_000, 0));
        let second = ExecutionId::from_ulid(Ulid::from_parts(2_000, 0));
        assert!(first < second);
    }

    #[test]
    fn serializes_as_bare_ulid() {
        let id = ExecutionId::new();
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, format!("\"{}\"", id.as_ulid()));
        let parsed: ExecutionId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(id, parsed);
    }
}
