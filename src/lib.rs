//! quoraft — the driver layer of a Raft consensus replica.
//!
//! This crate is the runtime half of a Raft implementation: the long-lived
//! [`RaftServer`] that glues a deterministic protocol state machine (the
//! [`ProtocolFsm`]) to durable storage ([`Persistence`]), an inter-replica
//! transport ([`Transport`]), and a user-supplied application state machine
//! ([`StateMachine`]). The protocol decisions themselves — elections, log
//! matching, quorum arithmetic — live behind the [`ProtocolFsm`] contract
//! and are not part of this crate.
//!
//! The driver runs two internal activities:
//!
//! - an **I/O activity** draining the FSM's output batches: it persists term
//!   and vote, log entries, and snapshot descriptors, maintains the
//!   transport's address map, and dispatches outgoing messages;
//! - an **applier activity** feeding committed entries and received
//!   snapshots to the application state machine and triggering local
//!   snapshots.
//!
//! Callers [`submit`](RaftServer::submit) commands, perform linearizable
//! reads through [`read_barrier`](RaftServer::read_barrier), change
//! membership with [`set_configuration`](RaftServer::set_configuration),
//! transfer leadership with [`stepdown`](RaftServer::stepdown), and shut the
//! replica down with [`abort`](RaftServer::abort).
//!
//! A replica is single-threaded and cooperative: the server type is `!Send`,
//! its activities run on the spawning thread's
//! [`LocalSet`](tokio::task::LocalSet), and parallelism across replicas
//! happens only through the transport.

#![allow(clippy::uninlined_format_args)]
#![deny(unused_qualifications)]

pub mod config;
pub mod entry;
pub mod error;
pub mod failure_detector;
pub mod fsm;
pub mod membership;
pub mod message;
mod metrics;
pub mod network;
pub mod server;
pub mod snapshot;
pub mod state_machine;
pub mod storage;
pub mod types;

pub use anyerror;
pub use anyerror::AnyError;
pub use prometheus;

pub use crate::config::Config;
pub use crate::config::ConfigError;
pub use crate::entry::EntryPayload;
pub use crate::entry::LogEntry;
pub use crate::error::NotLeader;
pub use crate::error::RaftError;
pub use crate::error::StateMachineError;
pub use crate::error::StorageError;
pub use crate::error::TransportError;
pub use crate::failure_detector::FailureDetector;
pub use crate::fsm::FsmConfig;
pub use crate::fsm::FsmInit;
pub use crate::fsm::FsmOutput;
pub use crate::fsm::ProtocolFsm;
pub use crate::fsm::SnapshotUpdate;
pub use crate::fsm::ELECTION_TIMEOUT_TICKS;
pub use crate::membership::AddressSet;
pub use crate::membership::Configuration;
pub use crate::membership::ConfigurationDiff;
pub use crate::membership::ServerAddress;
pub use crate::message::AppendReply;
pub use crate::message::AppendRequest;
pub use crate::message::AppendResult;
pub use crate::message::InstallSnapshot;
pub use crate::message::Message;
pub use crate::message::ReadBarrierReply;
pub use crate::message::ReadQuorum;
pub use crate::message::ReadQuorumReply;
pub use crate::message::SnapshotReply;
pub use crate::message::TimeoutNow;
pub use crate::message::VoteReply;
pub use crate::message::VoteRequest;
pub use crate::network::Transport;
pub use crate::server::RaftServer;
pub use crate::server::WaitMode;
pub use crate::snapshot::SnapshotDescriptor;
pub use crate::snapshot::SnapshotId;
pub use crate::state_machine::StateMachine;
pub use crate::storage::Persistence;
pub use crate::types::Index;
pub use crate::types::LogId;
pub use crate::types::ReadId;
pub use crate::types::ServerId;
pub use crate::types::Term;
