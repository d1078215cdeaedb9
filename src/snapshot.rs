//! Snapshot identities and descriptors.

use std::fmt;

use crate::membership::Configuration;
use crate::types::Index;
use crate::types::Term;

/// Identifier of a point-in-time image held by the application state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct SnapshotId(pub u128);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Identifies a snapshot: which state machine image it is, how much of the
/// log it supersedes, and the membership at that point.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SnapshotDescriptor {
    pub id: SnapshotId,
    pub term: Term,
    pub index: Index,
    pub config: Configuration,
}
