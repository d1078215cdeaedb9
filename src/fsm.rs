//! Contract between the driver and the deterministic protocol state machine.

use std::rc::Rc;

use crate::entry::EntryPayload;
use crate::entry::LogEntry;
use crate::error::NotLeader;
use crate::failure_detector::FailureDetector;
use crate::membership::AddressSet;
use crate::membership::Configuration;
use crate::message::Message;
use crate::snapshot::SnapshotDescriptor;
use crate::snapshot::SnapshotId;
use crate::types::Index;
use crate::types::LogId;
use crate::types::ReadId;
use crate::types::ServerId;
use crate::types::Term;

/// Number of ticks without leader contact after which a follower starts an
/// election.
pub const ELECTION_TIMEOUT_TICKS: u64 = 10;

/// One drained batch of protocol effects.
///
/// The I/O activity executes a batch in a fixed order: persist term and vote,
/// persist the snapshot, persist log entries, update the transport address
/// map, dispatch messages, queue committed entries, resolve reads.
#[derive(Debug, Default)]
pub struct FsmOutput {
    /// Term/vote pair to persist before anything else in the batch.
    pub term_and_vote: Option<(Term, Option<ServerId>)>,

    /// New snapshot to persist, with its provenance.
    pub snapshot: Option<SnapshotUpdate>,

    /// Entries to append to the durable log.
    pub log_entries: Vec<Rc<LogEntry>>,

    /// Address set of the configuration the replica should be able to talk
    /// to: the union of current and previous while a joint configuration is
    /// in the log.
    pub configuration: Option<AddressSet>,

    /// Messages to dispatch once the entries of this batch are durable.
    pub messages: Vec<(ServerId, Message)>,

    /// Entries whose commitment the protocol has established, in log order.
    pub committed: Vec<Rc<LogEntry>>,

    /// Highest read id for which the leader has confirmed a quorum.
    pub max_read_id_with_quorum: Option<ReadId>,

    /// The in-flight leadership transfer was given up.
    pub abort_leadership_transfer: bool,
}

/// A snapshot surfaced in an output batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotUpdate {
    pub snapshot: SnapshotDescriptor,

    /// Whether this snapshot was taken locally, as opposed to received from
    /// a leader. Remote snapshots must still be loaded into the application
    /// state machine.
    pub local: bool,

    /// Snapshot superseded by this one, to be dropped from the application
    /// state machine.
    pub previous_id: Option<SnapshotId>,
}

/// Protocol tunables forwarded from [`Config`](crate::Config).
#[derive(Debug, Clone)]
pub struct FsmConfig {
    pub append_request_threshold: u64,
    pub max_log_size: u64,
    pub enable_prevoting: bool,
}

/// State handed to the FSM factory at server start, recovered from
/// persistence.
pub struct FsmInit {
    pub id: ServerId,
    pub term: Term,
    pub vote: Option<ServerId>,
    pub snapshot: Option<SnapshotDescriptor>,
    pub log: Vec<Rc<LogEntry>>,
    pub failure_detector: Rc<dyn FailureDetector>,
    pub config: FsmConfig,
}

/// The deterministic Raft protocol state machine.
///
/// Implementations are pure: every method returns synchronously and performs
/// no I/O. Effects are communicated exclusively through [`poll_output`]
/// batches, which the driver persists and dispatches. The driver owns all
/// waiting; an implementation never blocks.
///
/// [`poll_output`]: ProtocolFsm::poll_output
pub trait ProtocolFsm {
    /// Feed one inbound message.
    fn step(&mut self, from: ServerId, message: Message);

    /// Append a new entry on a leader, assigning its term and index.
    fn add_entry(&mut self, payload: EntryPayload) -> Result<LogId, NotLeader>;

    /// Drain pending output, if any.
    fn poll_output(&mut self) -> Option<FsmOutput>;

    /// Number of entries in the unsnapshotted in-memory log.
    fn in_memory_log_size(&self) -> u64;

    fn is_leader(&self) -> bool;

    fn is_follower(&self) -> bool;

    fn is_candidate(&self) -> bool;

    /// The believed leader, if any.
    fn current_leader(&self) -> Option<ServerId>;

    fn current_term(&self) -> Term;

    fn log_last_index(&self) -> Index;

    fn log_last_term(&self) -> Term;

    /// Index covered by the latest snapshot the protocol accepted.
    fn log_last_snapshot_index(&self) -> Index;

    /// The last configuration in the log at or below `index`.
    fn log_configuration_for(&self, index: Index) -> Configuration;

    /// The active configuration.
    fn configuration(&self) -> Configuration;

    /// Start a linearizable read on a leader. `Ok(None)` means the leader
    /// cannot serve reads yet because it has no committed entry in its term.
    fn start_read_barrier(&mut self, from: ServerId) -> Result<Option<(ReadId, Index)>, NotLeader>;

    /// Present a snapshot to the protocol. Returns `false` if a later
    /// snapshot was already accepted and this one should be discarded.
    fn apply_snapshot(&mut self, snapshot: SnapshotDescriptor, trailing: u64, local: bool) -> bool;

    /// Begin transferring leadership away, bounded by a logical-clock
    /// budget of `timeout_ticks`.
    fn transfer_leadership(&mut self, timeout_ticks: u64) -> Result<(), NotLeader>;

    /// Stop the protocol. Subsequent steps are no-ops and no further output
    /// is produced.
    fn stop(&mut self);

    /// Advance the logical clock by one tick.
    fn tick(&mut self);

    /// Ticks elapsed since the last contact from a leader.
    fn election_elapsed(&self) -> u64;
}
