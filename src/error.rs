//! Error types exposed by this crate.

use anyerror::AnyError;

use crate::config::ConfigError;
use crate::types::ServerId;

/// The operation required leadership this replica does not hold.
///
/// `leader` names the replica believed to be the leader, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("not a leader; believed leader: {leader:?}")]
pub struct NotLeader {
    pub leader: Option<ServerId>,
}

/// Errors surfaced by [`RaftServer`](crate::RaftServer) operations.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    /// The log position of the submitted entry was overwritten by a later
    /// leader; the command did not take effect.
    #[error("entry dropped: its log position was overwritten by a later leader")]
    DroppedEntry,

    /// The replica lost the ability to determine the outcome of a submitted
    /// entry: it left the configuration while entries were uncommitted, or a
    /// remote snapshot leapt over them.
    #[error("commit status unknown")]
    CommitStatusUnknown,

    #[error(transparent)]
    NotLeader(#[from] NotLeader),

    /// Leadership transfer did not finish within its budget.
    #[error("leadership transfer timed out")]
    Timeout,

    /// At most one leadership transfer may be in progress.
    #[error("a stepdown is already in progress")]
    StepdownInProgress,

    /// The server was shut down while the operation was outstanding.
    #[error("server stopped")]
    Stopped,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Metrics(#[from] prometheus::Error),
}

/// A failure in the durable storage layer. Fatal for the replica.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("storage error: {source}")]
pub struct StorageError {
    pub source: AnyError,
}

impl StorageError {
    pub fn new(msg: impl ToString) -> Self {
        Self {
            source: AnyError::error(msg),
        }
    }

    pub fn from_error<E: std::error::Error + 'static>(err: &E) -> Self {
        Self {
            source: AnyError::new(err),
        }
    }
}

/// A failure to reach a peer. The protocol tolerates message loss, so these
/// are logged and absorbed by the driver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transport error: {source}")]
pub struct TransportError {
    pub source: AnyError,
}

impl TransportError {
    pub fn new(msg: impl ToString) -> Self {
        Self {
            source: AnyError::error(msg),
        }
    }

    pub fn from_error<E: std::error::Error + 'static>(err: &E) -> Self {
        Self {
            source: AnyError::new(err),
        }
    }
}

/// A failure in the application state machine. Fatal for the applier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("state machine error: {source}")]
pub struct StateMachineError {
    pub source: AnyError,
}

impl StateMachineError {
    pub fn new(msg: impl ToString) -> Self {
        Self {
            source: AnyError::error(msg),
        }
    }

    pub fn from_error<E: std::error::Error + 'static>(err: &E) -> Self {
        Self {
            source: AnyError::new(err),
        }
    }
}
