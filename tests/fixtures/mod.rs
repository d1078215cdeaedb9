//! Shared fakes and harness for the integration suite.
//!
//! The protocol state machine is out of scope for this crate, so the tests
//! drive the driver through a scriptable FSM: a test queues output batches
//! and nudges the driver with a tick, then observes what the driver did to
//! persistence, the transport and the application state machine.
#![allow(dead_code)]

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::rc::Rc;

use async_trait::async_trait;
use bytes::Bytes;
use quoraft::config::Config;
use quoraft::entry::EntryPayload;
use quoraft::entry::LogEntry;
use quoraft::error::NotLeader;
use quoraft::error::StateMachineError;
use quoraft::error::StorageError;
use quoraft::error::TransportError;
use quoraft::failure_detector::FailureDetector;
use quoraft::fsm::FsmInit;
use quoraft::fsm::FsmOutput;
use quoraft::fsm::ProtocolFsm;
use quoraft::membership::Configuration;
use quoraft::membership::ServerAddress;
use quoraft::message::AppendReply;
use quoraft::message::AppendRequest;
use quoraft::message::InstallSnapshot;
use quoraft::message::Message;
use quoraft::message::ReadBarrierReply;
use quoraft::message::ReadQuorum;
use quoraft::message::ReadQuorumReply;
use quoraft::message::SnapshotReply;
use quoraft::message::TimeoutNow;
use quoraft::message::VoteReply;
use quoraft::message::VoteRequest;
use quoraft::network::Transport;
use quoraft::server::RaftServer;
use quoraft::snapshot::SnapshotDescriptor;
use quoraft::snapshot::SnapshotId;
use quoraft::state_machine::StateMachine;
use quoraft::storage::Persistence;
use quoraft::types::Index;
use quoraft::types::LogId;
use quoraft::types::ReadId;
use quoraft::types::ServerId;
use quoraft::types::Term;
use tokio::sync::Notify;

/// Id of the replica under test.
pub const SELF_ID: ServerId = ServerId(1);

/// Run a test future on a current-thread runtime with a `LocalSet`, the
/// deployment model of the `!Send` server.
pub fn run<F: Future>(fut: F) -> F::Output {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(false)
        .with_test_writer()
        .try_init();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime");
    tokio::task::LocalSet::new().block_on(&rt, fut)
}

/// Yield until `cond` holds. Progress in these tests is purely cooperative,
/// so a bounded number of turns either settles the condition or never will.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached: {}", what);
}

/// Give background activities a fixed number of turns, for negative
/// assertions ("still not resolved").
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Follower,
    Candidate,
    Leader,
}

/// Observable, scriptable state behind [`ScriptedFsm`]. Tests keep the
/// controller half and mutate it between driver calls.
pub struct FsmState {
    pub id: ServerId,
    pub term: Term,
    pub role: Role,
    pub leader: Option<ServerId>,
    /// Index the next added entry gets.
    pub next_index: Index,
    pub log_size: u64,
    pub snapshot_index: Index,
    pub config: Configuration,
    /// Commit index handed out by local read barriers.
    pub commit_index: Index,
    pub next_read_id: ReadId,
    pub outputs: VecDeque<FsmOutput>,
    pub steps: Vec<(ServerId, Message)>,
    pub added: Vec<Rc<LogEntry>>,
    pub snapshots_applied: Vec<(SnapshotDescriptor, u64, bool)>,
    pub reject_snapshots: bool,
    pub read_barrier_script: VecDeque<Result<Option<(ReadId, Index)>, NotLeader>>,
    pub transfer_requests: Vec<u64>,
    pub stopped: bool,
    pub ticks: u64,
}

impl FsmState {
    pub fn new(id: ServerId) -> Self {
        Self {
            id,
            term: 1,
            role: Role::Follower,
            leader: None,
            next_index: 1,
            log_size: 0,
            snapshot_index: 0,
            config: Configuration::default(),
            commit_index: 0,
            next_read_id: 1,
            outputs: VecDeque::new(),
            steps: Vec::new(),
            added: Vec::new(),
            snapshots_applied: Vec::new(),
            reject_snapshots: false,
            read_barrier_script: VecDeque::new(),
            transfer_requests: Vec::new(),
            stopped: false,
            ticks: 0,
        }
    }
}

/// Test handle to the FSM state shared with the server.
pub struct FsmControl(pub Rc<RefCell<FsmState>>);

impl FsmControl {
    pub fn with<R>(&self, f: impl FnOnce(&mut FsmState) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }

    pub fn added(&self) -> Vec<Rc<LogEntry>> {
        self.0.borrow().added.clone()
    }

    pub fn steps(&self) -> Vec<(ServerId, Message)> {
        self.0.borrow().steps.clone()
    }

    pub fn snapshots_applied(&self) -> Vec<(SnapshotDescriptor, u64, bool)> {
        self.0.borrow().snapshots_applied.clone()
    }
}

pub struct ScriptedFsm {
    pub state: Rc<RefCell<FsmState>>,
}

impl ProtocolFsm for ScriptedFsm {
    fn step(&mut self, from: ServerId, message: Message) {
        let mut state = self.state.borrow_mut();
        if state.stopped {
            return;
        }
        state.steps.push((from, message));
    }

    fn add_entry(&mut self, payload: EntryPayload) -> Result<LogId, NotLeader> {
        let mut state = self.state.borrow_mut();
        if state.role != Role::Leader {
            return Err(NotLeader { leader: state.leader });
        }
        let entry = Rc::new(LogEntry {
            term: state.term,
            index: state.next_index,
            payload,
        });
        state.next_index += 1;
        state.log_size += 1;
        state.added.push(Rc::clone(&entry));
        Ok(entry.log_id())
    }

    fn poll_output(&mut self) -> Option<FsmOutput> {
        let mut state = self.state.borrow_mut();
        if state.stopped {
            return None;
        }
        state.outputs.pop_front()
    }

    fn in_memory_log_size(&self) -> u64 {
        self.state.borrow().log_size
    }

    fn is_leader(&self) -> bool {
        self.state.borrow().role == Role::Leader
    }

    fn is_follower(&self) -> bool {
        self.state.borrow().role == Role::Follower
    }

    fn is_candidate(&self) -> bool {
        self.state.borrow().role == Role::Candidate
    }

    fn current_leader(&self) -> Option<ServerId> {
        self.state.borrow().leader
    }

    fn current_term(&self) -> Term {
        self.state.borrow().term
    }

    fn log_last_index(&self) -> Index {
        self.state.borrow().next_index - 1
    }

    fn log_last_term(&self) -> Term {
        self.state.borrow().term
    }

    fn log_last_snapshot_index(&self) -> Index {
        self.state.borrow().snapshot_index
    }

    fn log_configuration_for(&self, _index: Index) -> Configuration {
        self.state.borrow().config.clone()
    }

    fn configuration(&self) -> Configuration {
        self.state.borrow().config.clone()
    }

    fn start_read_barrier(
        &mut self,
        _from: ServerId,
    ) -> Result<Option<(ReadId, Index)>, NotLeader> {
        let mut state = self.state.borrow_mut();
        if let Some(scripted) = state.read_barrier_script.pop_front() {
            return scripted;
        }
        if state.role != Role::Leader {
            return Err(NotLeader { leader: state.leader });
        }
        let id = state.next_read_id;
        state.next_read_id += 1;
        Ok(Some((id, state.commit_index)))
    }

    fn apply_snapshot(&mut self, snapshot: SnapshotDescriptor, trailing: u64, local: bool) -> bool {
        let mut state = self.state.borrow_mut();
        let index = snapshot.index;
        state.snapshots_applied.push((snapshot, trailing, local));
        if state.reject_snapshots {
            return false;
        }
        state.snapshot_index = index;
        state.log_size = 0;
        true
    }

    fn transfer_leadership(&mut self, timeout_ticks: u64) -> Result<(), NotLeader> {
        let mut state = self.state.borrow_mut();
        if state.role != Role::Leader {
            return Err(NotLeader { leader: state.leader });
        }
        state.transfer_requests.push(timeout_ticks);
        Ok(())
    }

    fn stop(&mut self) {
        self.state.borrow_mut().stopped = true;
    }

    fn tick(&mut self) {
        self.state.borrow_mut().ticks += 1;
    }

    fn election_elapsed(&self) -> u64 {
        self.state.borrow().ticks
    }
}

/// Everything the transport observed, in one ordered event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    AddServer(ServerId),
    RemoveServer(ServerId),
    Append { dst: ServerId, prev_log_index: Index },
    AppendReplySent(ServerId),
    Vote(ServerId),
    VoteReplySent(ServerId),
    TimeoutNow(ServerId),
    ReadQuorum(ServerId),
    ReadQuorumReplySent(ServerId),
    SnapshotStarted(ServerId),
    ReadBarrier(ServerId),
}

#[derive(Default)]
pub struct RecordingTransport {
    pub events: RefCell<Vec<NetEvent>>,
    pub fail_sends: Cell<bool>,
    pub fail_snapshots: Cell<bool>,
    pub snapshot_replies: RefCell<VecDeque<SnapshotReply>>,
    snapshot_release: Notify,
    pub read_barrier_script: RefCell<VecDeque<Result<ReadBarrierReply, TransportError>>>,
    pub aborted: Cell<bool>,
}

impl RecordingTransport {
    pub fn recorded(&self) -> Vec<NetEvent> {
        self.events.borrow().clone()
    }

    pub fn position_of(&self, event: &NetEvent) -> usize {
        self.events
            .borrow()
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("event not recorded: {:?}", event))
    }

    /// Append completion order towards one destination.
    pub fn appends_to(&self, dst: ServerId) -> Vec<Index> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                NetEvent::Append { dst: d, prev_log_index } if *d == dst => Some(*prev_log_index),
                _ => None,
            })
            .collect()
    }

    /// Let the pending snapshot transfer finish with `reply`.
    pub fn release_snapshot(&self, reply: SnapshotReply) {
        self.snapshot_replies.borrow_mut().push_back(reply);
        self.snapshot_release.notify_one();
    }

    /// Let the pending snapshot transfer fail.
    pub fn release_snapshot_error(&self) {
        self.fail_snapshots.set(true);
        self.snapshot_release.notify_one();
    }

    fn check_send(&self) -> Result<(), TransportError> {
        if self.fail_sends.get() {
            return Err(TransportError::new("injected send failure"));
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl Transport for RecordingTransport {
    async fn send_append_request(
        &self,
        dst: ServerId,
        request: AppendRequest,
    ) -> Result<(), TransportError> {
        self.check_send()?;
        // A variable number of yields gives unserialized sends a chance to
        // overtake each other; the per-destination chain must prevent that.
        for _ in 0..(request.prev_log_index % 3) {
            tokio::task::yield_now().await;
        }
        self.events.borrow_mut().push(NetEvent::Append {
            dst,
            prev_log_index: request.prev_log_index,
        });
        Ok(())
    }

    async fn send_append_reply(
        &self,
        dst: ServerId,
        _reply: AppendReply,
    ) -> Result<(), TransportError> {
        self.check_send()?;
        self.events.borrow_mut().push(NetEvent::AppendReplySent(dst));
        Ok(())
    }

    async fn send_vote_request(
        &self,
        dst: ServerId,
        _request: VoteRequest,
    ) -> Result<(), TransportError> {
        self.check_send()?;
        self.events.borrow_mut().push(NetEvent::Vote(dst));
        Ok(())
    }

    async fn send_vote_reply(&self, dst: ServerId, _reply: VoteReply) -> Result<(), TransportError> {
        self.check_send()?;
        self.events.borrow_mut().push(NetEvent::VoteReplySent(dst));
        Ok(())
    }

    async fn send_timeout_now(
        &self,
        dst: ServerId,
        _request: TimeoutNow,
    ) -> Result<(), TransportError> {
        self.check_send()?;
        self.events.borrow_mut().push(NetEvent::TimeoutNow(dst));
        Ok(())
    }

    async fn send_read_quorum(
        &self,
        dst: ServerId,
        _request: ReadQuorum,
    ) -> Result<(), TransportError> {
        self.check_send()?;
        self.events.borrow_mut().push(NetEvent::ReadQuorum(dst));
        Ok(())
    }

    async fn send_read_quorum_reply(
        &self,
        dst: ServerId,
        _reply: ReadQuorumReply,
    ) -> Result<(), TransportError> {
        self.check_send()?;
        self.events.borrow_mut().push(NetEvent::ReadQuorumReplySent(dst));
        Ok(())
    }

    async fn send_snapshot(
        &self,
        dst: ServerId,
        _request: InstallSnapshot,
    ) -> Result<SnapshotReply, TransportError> {
        self.events.borrow_mut().push(NetEvent::SnapshotStarted(dst));
        self.snapshot_release.notified().await;
        if self.fail_snapshots.get() {
            return Err(TransportError::new("injected snapshot failure"));
        }
        Ok(self
            .snapshot_replies
            .borrow_mut()
            .pop_front()
            .expect("snapshot released without a scripted reply"))
    }

    async fn execute_read_barrier_on_leader(
        &self,
        leader: ServerId,
    ) -> Result<ReadBarrierReply, TransportError> {
        self.events.borrow_mut().push(NetEvent::ReadBarrier(leader));
        self.read_barrier_script
            .borrow_mut()
            .pop_front()
            .expect("unscripted read barrier request")
    }

    fn add_server(&self, id: ServerId, _address: &ServerAddress) {
        self.events.borrow_mut().push(NetEvent::AddServer(id));
    }

    fn remove_server(&self, id: ServerId) {
        self.events.borrow_mut().push(NetEvent::RemoveServer(id));
    }

    async fn abort(&self) {
        self.aborted.set(true);
    }
}

/// In-memory persistence recording stores and truncations.
#[derive(Default)]
pub struct MemPersistence {
    pub term_and_vote: RefCell<(Term, Option<ServerId>)>,
    pub snapshot: RefCell<Option<(SnapshotDescriptor, u64)>>,
    pub log: RefCell<Vec<Rc<LogEntry>>>,
    pub truncations: RefCell<Vec<Index>>,
    pub fail_stores: Cell<bool>,
    pub aborted: Cell<bool>,
}

impl MemPersistence {
    pub fn log_indexes(&self) -> Vec<Index> {
        self.log.borrow().iter().map(|e| e.index).collect()
    }

    fn check_store(&self) -> Result<(), StorageError> {
        if self.fail_stores.get() {
            return Err(StorageError::new("injected store failure"));
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl Persistence for MemPersistence {
    async fn load_term_and_vote(&self) -> Result<(Term, Option<ServerId>), StorageError> {
        Ok(*self.term_and_vote.borrow())
    }

    async fn load_snapshot_descriptor(&self) -> Result<Option<SnapshotDescriptor>, StorageError> {
        Ok(self.snapshot.borrow().as_ref().map(|(snp, _)| snp.clone()))
    }

    async fn load_log(&self) -> Result<Vec<Rc<LogEntry>>, StorageError> {
        Ok(self.log.borrow().clone())
    }

    async fn store_term_and_vote(
        &self,
        term: Term,
        vote: Option<ServerId>,
    ) -> Result<(), StorageError> {
        self.check_store()?;
        *self.term_and_vote.borrow_mut() = (term, vote);
        Ok(())
    }

    async fn store_snapshot_descriptor(
        &self,
        snapshot: &SnapshotDescriptor,
        trailing: u64,
    ) -> Result<(), StorageError> {
        self.check_store()?;
        *self.snapshot.borrow_mut() = Some((snapshot.clone(), trailing));
        Ok(())
    }

    async fn store_log_entries(&self, entries: &[Rc<LogEntry>]) -> Result<(), StorageError> {
        self.check_store()?;
        self.log.borrow_mut().extend(entries.iter().cloned());
        Ok(())
    }

    async fn truncate_log(&self, index: Index) -> Result<(), StorageError> {
        self.check_store()?;
        self.log.borrow_mut().retain(|e| e.index < index);
        self.truncations.borrow_mut().push(index);
        Ok(())
    }

    async fn abort(&self) {
        self.aborted.set(true);
    }
}

/// Application state machine recording everything it was told.
#[derive(Default)]
pub struct RecordingStateMachine {
    pub applied: RefCell<Vec<Bytes>>,
    pub loaded: RefCell<Vec<SnapshotId>>,
    pub dropped: RefCell<Vec<SnapshotId>>,
    pub taken: Cell<u64>,
    pub gate_applies: Cell<bool>,
    gate: Notify,
    pub fail_apply: Cell<bool>,
    pub aborted: Cell<bool>,
}

impl RecordingStateMachine {
    pub fn applied(&self) -> Vec<Bytes> {
        self.applied.borrow().clone()
    }

    pub fn release_applies(&self) {
        self.gate_applies.set(false);
        self.gate.notify_waiters();
    }
}

#[async_trait(?Send)]
impl StateMachine for RecordingStateMachine {
    async fn apply(&self, commands: Vec<Bytes>) -> Result<(), StateMachineError> {
        while self.gate_applies.get() {
            self.gate.notified().await;
        }
        if self.fail_apply.get() {
            return Err(StateMachineError::new("injected apply failure"));
        }
        self.applied.borrow_mut().extend(commands);
        Ok(())
    }

    async fn take_snapshot(&self) -> Result<SnapshotId, StateMachineError> {
        self.taken.set(self.taken.get() + 1);
        Ok(SnapshotId(0xA000 + self.taken.get() as u128))
    }

    async fn load_snapshot(&self, id: SnapshotId) -> Result<(), StateMachineError> {
        self.loaded.borrow_mut().push(id);
        Ok(())
    }

    fn drop_snapshot(&self, id: SnapshotId) {
        self.dropped.borrow_mut().push(id);
    }

    async fn abort(&self) {
        self.aborted.set(true);
    }
}

pub struct AlwaysAlive;

impl FailureDetector for AlwaysAlive {
    fn is_alive(&self, _server: ServerId) -> bool {
        true
    }
}

/// One replica under test, wired to the fakes above.
pub struct Harness {
    pub server: RaftServer,
    pub fsm: FsmControl,
    pub transport: Rc<RecordingTransport>,
    pub sm: Rc<RecordingStateMachine>,
    pub persistence: Rc<MemPersistence>,
    pub registry: prometheus::Registry,
}

impl Harness {
    /// Start a replica that believes it is the leader of term 1.
    pub async fn leader() -> Harness {
        Self::with_setup(Config::default(), |state| {
            state.role = Role::Leader;
            state.leader = Some(SELF_ID);
        })
        .await
    }

    /// Start a follower that believes `leader` leads.
    pub async fn follower(leader: Option<ServerId>) -> Harness {
        Self::with_setup(Config::default(), |state| {
            state.role = Role::Follower;
            state.leader = leader;
        })
        .await
    }

    pub async fn with_setup(config: Config, setup: impl FnOnce(&mut FsmState)) -> Harness {
        Self::with_storage(config, Rc::new(MemPersistence::default()), setup).await
    }

    pub async fn with_storage(
        config: Config,
        persistence: Rc<MemPersistence>,
        setup: impl FnOnce(&mut FsmState),
    ) -> Harness {
        let state = Rc::new(RefCell::new(FsmState::new(SELF_ID)));
        setup(&mut state.borrow_mut());

        let transport = Rc::new(RecordingTransport::default());
        let sm = Rc::new(RecordingStateMachine::default());
        let registry = prometheus::Registry::new();

        let fsm_state = Rc::clone(&state);
        let server = RaftServer::start(
            SELF_ID,
            move |init: FsmInit| {
                {
                    let mut s = fsm_state.borrow_mut();
                    s.term = s.term.max(init.term);
                    if let Some(snp) = &init.snapshot {
                        s.snapshot_index = snp.index;
                        s.next_index = s.next_index.max(snp.index + 1);
                    }
                    if let Some(last) = init.log.last() {
                        s.next_index = s.next_index.max(last.index + 1);
                    }
                }
                Box::new(ScriptedFsm { state: fsm_state })
            },
            transport.clone(),
            sm.clone(),
            persistence.clone(),
            Rc::new(AlwaysAlive),
            config,
            &registry,
        )
        .await
        .expect("server start");

        Harness {
            server,
            fsm: FsmControl(state),
            transport,
            sm,
            persistence,
            registry,
        }
    }

    /// Queue an FSM output batch and nudge the driver.
    pub fn feed(&self, batch: FsmOutput) {
        self.fsm.with(|state| state.outputs.push_back(batch));
        self.server.tick();
    }

    /// Gathered value of a counter family, summed over label values.
    pub fn counter(&self, name: &str) -> u64 {
        self.registry
            .gather()
            .iter()
            .find(|family| family.get_name() == name)
            .map(|family| {
                family
                    .get_metric()
                    .iter()
                    .map(|m| m.get_counter().get_value() as u64)
                    .sum()
            })
            .unwrap_or(0)
    }
}

pub fn cmd(text: &str) -> Bytes {
    Bytes::copy_from_slice(text.as_bytes())
}

pub fn command_entry(term: Term, index: Index, text: &str) -> Rc<LogEntry> {
    Rc::new(LogEntry {
        term,
        index,
        payload: EntryPayload::Command(cmd(text)),
    })
}

pub fn dummy_entry(term: Term, index: Index) -> Rc<LogEntry> {
    Rc::new(LogEntry {
        term,
        index,
        payload: EntryPayload::Dummy,
    })
}

pub fn config_entry(term: Term, index: Index, config: Configuration) -> Rc<LogEntry> {
    Rc::new(LogEntry {
        term,
        index,
        payload: EntryPayload::Configuration(config),
    })
}

/// A batch that only commits `entries`.
pub fn committed(entries: Vec<Rc<LogEntry>>) -> FsmOutput {
    FsmOutput {
        committed: entries,
        ..Default::default()
    }
}

pub fn addr(id: u128) -> ServerAddress {
    ServerAddress::new(ServerId(id), format!("10.0.0.{}:7000", id))
}

pub fn append_request(term: Term, prev_log_index: Index) -> AppendRequest {
    AppendRequest {
        current_term: term,
        prev_log_index,
        prev_log_term: term,
        leader_commit_index: 0,
        entries: Vec::new(),
    }
}
