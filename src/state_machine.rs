//! Application state machine contract.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StateMachineError;
use crate::snapshot::SnapshotId;

/// The user's replicated state machine.
///
/// The driver feeds it committed commands in log order, exactly once, and
/// manages its snapshots by id. Implementations are typically used behind an
/// `Rc<dyn StateMachine>`.
#[async_trait(?Send)]
pub trait StateMachine {
    /// Apply a batch of committed commands, in order. An error here is fatal
    /// for the replica's applier.
    async fn apply(&self, commands: Vec<Bytes>) -> Result<(), StateMachineError>;

    /// Capture the current state, returning an id the driver can later load
    /// or drop.
    async fn take_snapshot(&self) -> Result<SnapshotId, StateMachineError>;

    /// Replace the current state with a previously transferred snapshot.
    async fn load_snapshot(&self, id: SnapshotId) -> Result<(), StateMachineError>;

    /// Discard a snapshot image that is no longer referenced.
    fn drop_snapshot(&self, id: SnapshotId);

    /// Abort in-flight operations so a pending call returns promptly.
    async fn abort(&self);
}
