//! Durable storage contract.

use std::rc::Rc;

use async_trait::async_trait;

use crate::entry::LogEntry;
use crate::error::StorageError;
use crate::snapshot::SnapshotDescriptor;
use crate::types::Index;
use crate::types::ServerId;
use crate::types::Term;

/// Durable storage for one replica.
///
/// Log mutation is append-plus-truncate: the driver never rewrites an entry
/// in place, it truncates the tail first and appends the replacement. The
/// driver serializes all calls, so implementations need not be reentrant.
///
/// Implementations are typically used behind an `Rc<dyn Persistence>`.
#[async_trait(?Send)]
pub trait Persistence {
    /// Load the persisted term and vote, or their defaults on first boot.
    async fn load_term_and_vote(&self) -> Result<(Term, Option<ServerId>), StorageError>;

    /// Load the latest snapshot descriptor, if one was ever stored.
    async fn load_snapshot_descriptor(&self) -> Result<Option<SnapshotDescriptor>, StorageError>;

    /// Load the log tail: every entry above the snapshot.
    async fn load_log(&self) -> Result<Vec<Rc<LogEntry>>, StorageError>;

    /// Persist term and vote atomically. A vote may change independently of
    /// the term, but they are always stored together.
    async fn store_term_and_vote(&self, term: Term, vote: Option<ServerId>)
        -> Result<(), StorageError>;

    /// Persist a snapshot descriptor, keeping `trailing` log entries below
    /// its index.
    async fn store_snapshot_descriptor(
        &self,
        snapshot: &SnapshotDescriptor,
        trailing: u64,
    ) -> Result<(), StorageError>;

    /// Append entries to the log.
    async fn store_log_entries(&self, entries: &[Rc<LogEntry>]) -> Result<(), StorageError>;

    /// Drop persisted entries at `index` and above.
    async fn truncate_log(&self, index: Index) -> Result<(), StorageError>;

    /// Abort in-flight operations so a pending store returns promptly.
    async fn abort(&self);
}
