//! Scalar protocol types.

use std::fmt;

/// Election epoch. Once observed by a replica it never decreases.
pub type Term = u64;

/// Log position. Indexes are dense, starting one above the snapshot index.
pub type Index = u64;

/// Identifier of a read barrier issued by a leader, monotonic per leader.
pub type ReadId = u64;

/// Unique identity of a replica.
///
/// 128 bits wide so identities can be minted without coordination. The zero
/// value is reserved; server construction rejects it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ServerId(pub u128);

impl ServerId {
    pub fn is_nil(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// The id of a log entry: the term it was appended in and its position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LogId {
    pub term: Term,
    pub index: Index,
}

impl LogId {
    pub fn new(term: Term, index: Index) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}
