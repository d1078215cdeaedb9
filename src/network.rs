//! Inter-replica transport contract.

use async_trait::async_trait;

use crate::error::TransportError;
use crate::membership::ServerAddress;
use crate::message::AppendReply;
use crate::message::AppendRequest;
use crate::message::InstallSnapshot;
use crate::message::ReadBarrierReply;
use crate::message::ReadQuorum;
use crate::message::ReadQuorumReply;
use crate::message::SnapshotReply;
use crate::message::TimeoutNow;
use crate::message::VoteReply;
use crate::message::VoteRequest;
use crate::types::ServerId;

/// The network between cluster members.
///
/// One method per message variant; the driver records per-variant statistics
/// around the calls. Send failures are reported but not fatal: the protocol
/// tolerates message loss and the FSM re-emits what matters.
///
/// Implementations are typically used behind an `Rc<dyn Transport>`.
#[async_trait(?Send)]
pub trait Transport {
    async fn send_append_request(
        &self,
        dst: ServerId,
        request: AppendRequest,
    ) -> Result<(), TransportError>;

    async fn send_append_reply(&self, dst: ServerId, reply: AppendReply)
        -> Result<(), TransportError>;

    async fn send_vote_request(
        &self,
        dst: ServerId,
        request: VoteRequest,
    ) -> Result<(), TransportError>;

    async fn send_vote_reply(&self, dst: ServerId, reply: VoteReply) -> Result<(), TransportError>;

    async fn send_timeout_now(
        &self,
        dst: ServerId,
        request: TimeoutNow,
    ) -> Result<(), TransportError>;

    async fn send_read_quorum(
        &self,
        dst: ServerId,
        request: ReadQuorum,
    ) -> Result<(), TransportError>;

    async fn send_read_quorum_reply(
        &self,
        dst: ServerId,
        reply: ReadQuorumReply,
    ) -> Result<(), TransportError>;

    /// Stream a snapshot to `dst` and wait for the peer's verdict.
    ///
    /// Long-running. The driver cancels an obsolete transfer by dropping
    /// the future.
    async fn send_snapshot(
        &self,
        dst: ServerId,
        request: InstallSnapshot,
    ) -> Result<SnapshotReply, TransportError>;

    /// Ask `leader` for a read index on behalf of this replica.
    async fn execute_read_barrier_on_leader(
        &self,
        leader: ServerId,
    ) -> Result<ReadBarrierReply, TransportError>;

    /// Make `id` addressable. Called before any message is sent to it.
    fn add_server(&self, id: ServerId, address: &ServerAddress);

    /// Forget `id`'s address. Sends to a removed server fail.
    fn remove_server(&self, id: ServerId);

    /// Abort in-flight sends so pending calls return promptly.
    async fn abort(&self);
}
