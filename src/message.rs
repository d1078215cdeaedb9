//! Messages exchanged between replicas.
//!
//! The wire encoding is the transport's business; these types only fix the
//! information content of each message.

use std::rc::Rc;

use crate::entry::LogEntry;
use crate::snapshot::SnapshotDescriptor;
use crate::types::Index;
use crate::types::ReadId;
use crate::types::ServerId;
use crate::types::Term;

/// A request sent by a leader to replicate log entries (§5.3), also used as a
/// heartbeat when `entries` is empty.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AppendRequest {
    pub current_term: Term,
    pub prev_log_index: Index,
    pub prev_log_term: Term,
    pub leader_commit_index: Index,
    pub entries: Vec<Rc<LogEntry>>,
}

/// Follower's verdict on an [`AppendRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AppendResult {
    Accepted {
        last_new_index: Index,
    },
    Rejected {
        /// First index at which the follower's log does not match.
        non_matching_index: Index,
        last_index: Index,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AppendReply {
    pub current_term: Term,
    pub commit_index: Index,
    pub result: AppendResult,
}

/// A request for a vote (§5.2), or for a pre-vote when `is_prevote` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VoteRequest {
    pub current_term: Term,
    pub last_log_index: Index,
    pub last_log_term: Term,
    pub is_prevote: bool,
    /// Set during leadership transfer: the receiver votes even if it heard
    /// from a leader recently.
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VoteReply {
    pub current_term: Term,
    pub vote_granted: bool,
    pub is_prevote: bool,
}

/// Sent by a leader transferring leadership: the receiver starts an election
/// immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimeoutNow {
    pub current_term: Term,
}

/// Leader's probe establishing that it still holds a quorum, carrying the
/// read id the probe accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReadQuorum {
    pub current_term: Term,
    pub leader_commit_index: Index,
    pub id: ReadId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReadQuorumReply {
    pub current_term: Term,
    pub commit_index: Index,
    pub id: ReadId,
}

/// A request to install a snapshot on a lagging follower.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InstallSnapshot {
    pub current_term: Term,
    pub snapshot: SnapshotDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SnapshotReply {
    pub current_term: Term,
    pub success: bool,
}

/// Every message exchanged between replicas, as one tagged variant.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Message {
    AppendRequest(AppendRequest),
    AppendReply(AppendReply),
    VoteRequest(VoteRequest),
    VoteReply(VoteReply),
    TimeoutNow(TimeoutNow),
    ReadQuorum(ReadQuorum),
    ReadQuorumReply(ReadQuorumReply),
    InstallSnapshot(InstallSnapshot),
    SnapshotReply(SnapshotReply),
}

impl Message {
    /// Label used for per-message-type statistics.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::AppendRequest(_) => "append_entries",
            Message::AppendReply(_) => "append_entries_reply",
            Message::VoteRequest(_) => "request_vote",
            Message::VoteReply(_) => "request_vote_reply",
            Message::TimeoutNow(_) => "timeout_now",
            Message::ReadQuorum(_) => "read_quorum",
            Message::ReadQuorumReply(_) => "read_quorum_reply",
            Message::InstallSnapshot(_) => "install_snapshot",
            Message::SnapshotReply(_) => "snapshot_reply",
        }
    }
}

/// Reply to a read-barrier request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ReadBarrierReply {
    /// The leader has no committed entry in its current term yet; retry
    /// after the next apply.
    NotReady,

    /// Commit-index floor the reader must observe applied before reading.
    ReadIndex(Index),

    /// The addressee is not the leader; the hint names its best guess.
    NotALeader(Option<ServerId>),
}
