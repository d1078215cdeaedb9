//! Log entries and their payloads.

use bytes::Bytes;

use crate::membership::Configuration;
use crate::types::Index;
use crate::types::LogId;
use crate::types::Term;

/// Log entry payload variants.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EntryPayload {
    /// An empty entry. A new leader appends one to settle commitment in its
    /// term; callers use one to wait out a membership change.
    Dummy,

    /// An opaque application command.
    Command(Bytes),

    /// A membership change.
    Configuration(Configuration),
}

impl EntryPayload {
    /// Label used for per-entry-type statistics.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            EntryPayload::Dummy => "dummy",
            EntryPayload::Command(_) => "command",
            EntryPayload::Configuration(_) => "configuration",
        }
    }
}

/// A single log entry.
///
/// Entries are handed around as `Rc<LogEntry>`: the FSM's in-memory log, the
/// persistence layer and the apply queue all hold the same allocation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LogEntry {
    pub term: Term,
    pub index: Index,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn log_id(&self) -> LogId {
        LogId::new(self.term, self.index)
    }
}
