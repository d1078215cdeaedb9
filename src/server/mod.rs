//! The replica driver: a long-lived server gluing the protocol state machine
//! to durable storage, the inter-replica transport, the application state
//! machine, and external callers.

mod applier;
mod io_task;

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::rc::Weak;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use futures::future::AbortHandle;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::Instrument;
use tracing::Level;

use crate::config::Config;
use crate::entry::EntryPayload;
use crate::entry::LogEntry;
use crate::error::RaftError;
use crate::failure_detector::FailureDetector;
use crate::fsm::FsmConfig;
use crate::fsm::FsmInit;
use crate::fsm::ProtocolFsm;
use crate::fsm::ELECTION_TIMEOUT_TICKS;
use crate::membership::AddressSet;
use crate::membership::Configuration;
use crate::message::AppendRequest;
use crate::message::InstallSnapshot;
use crate::message::Message;
use crate::message::ReadBarrierReply;
use crate::message::SnapshotReply;
use crate::metrics::ServerMetrics;
use crate::network::Transport;
use crate::snapshot::SnapshotDescriptor;
use crate::state_machine::StateMachine;
use crate::storage::Persistence;
use crate::types::Index;
use crate::types::LogId;
use crate::types::ReadId;
use crate::types::ServerId;
use crate::types::Term;

/// Capacity of the commit-to-apply queue. Bounds how far application
/// progress may trail commitment before the I/O activity backs off, which in
/// turn bounds in-memory log growth together with `max_log_size`.
const APPLY_QUEUE_DEPTH: usize = 10;

/// How a [`RaftServer::submit`] call waits for its entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Resolve when the entry is known committed.
    Committed,

    /// Resolve when the entry has been applied to the application state
    /// machine.
    Applied,
}

/// Tracks the commit or apply status of one submitted entry.
struct Waiter {
    /// Term the entry was added with. A mismatch at notification time means
    /// a later leader replaced the entry.
    term: Term,
    tx: oneshot::Sender<Result<(), RaftError>>,
}

struct ActiveRead {
    id: ReadId,
    index: Index,
    tx: oneshot::Sender<ReadBarrierReply>,
}

struct SnapshotTransfer {
    task: JoinHandle<()>,
    abort: AbortHandle,
    id: u64,
}

struct AppendQueue {
    tx: mpsc::UnboundedSender<AppendRequest>,
    task: JoinHandle<()>,
}

/// Work items of the applier activity.
pub(crate) enum ApplyItem {
    Entries(Vec<Rc<LogEntry>>),
    Snapshot(SnapshotDescriptor),
}

/// A running Raft replica driver.
///
/// Cheap to clone; all clones refer to the same replica. The type is
/// deliberately `!Send`: one replica lives on one thread, all of its state is
/// mutated from that thread, and its background activities run on the same
/// [`LocalSet`](tokio::task::LocalSet). Parallelism across replicas happens
/// only through the transport.
#[derive(Clone)]
pub struct RaftServer {
    inner: Rc<ServerInner>,
}

pub(crate) struct ServerInner {
    weak: Weak<ServerInner>,

    id: ServerId,
    config: Config,
    fsm: RefCell<Box<dyn ProtocolFsm>>,
    transport: Rc<dyn Transport>,
    state_machine: Rc<dyn StateMachine>,
    persistence: Rc<dyn Persistence>,
    metrics: ServerMetrics,

    /// Signalled after every FSM mutation. The I/O activity and admission
    /// waits re-check their conditions on each ping.
    fsm_events: Notify,

    /// Index of the last entry applied to the application state machine.
    applied_index: Cell<Index>,

    /// Waiters to notify when their entry is known committed.
    awaited_commits: RefCell<BTreeMap<Index, Waiter>>,

    /// Waiters to notify after their entry is applied.
    awaited_applies: RefCell<BTreeMap<Index, Waiter>>,

    /// Callers waiting for the applied index to reach a target.
    awaited_indexes: RefCell<BTreeMap<Index, Vec<oneshot::Sender<Result<(), RaftError>>>>>,

    /// Read barriers started on this replica, in read-id order.
    reads: RefCell<VecDeque<ActiveRead>>,

    /// Callers blocked until some leader is known.
    leader_waiters: RefCell<Vec<oneshot::Sender<Result<(), RaftError>>>>,

    stepdown: RefCell<Option<oneshot::Sender<Result<(), RaftError>>>>,

    /// Address set the transport currently knows about. Built from the last
    /// configuration entry observed: the plain current set, or the union of
    /// current and previous while that entry is joint, because messages may
    /// have to reach both joining and leaving servers.
    rpc_config: RefCell<AddressSet>,

    apply_tx: mpsc::Sender<ApplyItem>,

    next_transfer_id: Cell<u64>,
    snapshot_transfers: RefCell<HashMap<ServerId, SnapshotTransfer>>,

    /// Aborted transfers whose tasks have not finished yet; awaited at
    /// shutdown.
    aborted_transfers: RefCell<HashMap<u64, JoinHandle<()>>>,

    /// At most one in-progress snapshot application per sender.
    snapshot_applications: RefCell<HashMap<ServerId, oneshot::Sender<SnapshotReply>>>,

    append_queues: RefCell<HashMap<ServerId, AppendQueue>>,

    /// Queue tasks of departed destinations, still draining; awaited at
    /// shutdown.
    detached_append_tasks: RefCell<Vec<JoinHandle<()>>>,

    shutdown_tx: watch::Sender<bool>,
    io_task: RefCell<Option<JoinHandle<()>>>,
    applier_task: RefCell<Option<JoinHandle<()>>>,
    stopped: Cell<bool>,
}

impl RaftServer {
    /// Recover persisted state, construct the FSM, and start the replica.
    ///
    /// `fsm_factory` receives everything loaded from persistence and returns
    /// the protocol state machine. The failure detector is passed through to
    /// it. Metrics are registered on `registry`.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        id: ServerId,
        fsm_factory: impl FnOnce(FsmInit) -> Box<dyn ProtocolFsm>,
        transport: Rc<dyn Transport>,
        state_machine: Rc<dyn StateMachine>,
        persistence: Rc<dyn Persistence>,
        failure_detector: Rc<dyn FailureDetector>,
        config: Config,
        registry: &prometheus::Registry,
    ) -> Result<RaftServer, RaftError> {
        assert!(!id.is_nil(), "server id must be nonzero");
        let config = config.validate()?;
        let metrics = ServerMetrics::new(id, registry)?;

        let (term, vote) = persistence.load_term_and_vote().await?;
        let snapshot = persistence.load_snapshot_descriptor().await?;
        let log = persistence.load_log().await?;

        let last_stable = log
            .last()
            .map(|e| e.index)
            .or_else(|| snapshot.as_ref().map(|s| s.index))
            .unwrap_or(0);
        let startup_config = last_configuration(snapshot.as_ref(), &log);

        tracing::debug!(
            id = %id,
            term,
            last_stable,
            "starting replica, snapshot: {:?}",
            snapshot.as_ref().map(|s| s.index)
        );

        let fsm = fsm_factory(FsmInit {
            id,
            term,
            vote,
            snapshot: snapshot.clone(),
            log,
            failure_detector,
            config: FsmConfig {
                append_request_threshold: config.append_request_threshold,
                max_log_size: config.max_log_size,
                enable_prevoting: config.enable_prevoting,
            },
        });

        let mut applied_index = 0;
        if let Some(snp) = &snapshot {
            state_machine.load_snapshot(snp.id).await?;
            applied_index = snp.index;
        }

        let (apply_tx, apply_rx) = mpsc::channel(APPLY_QUEUE_DEPTH);
        let (shutdown_tx, _) = watch::channel(false);

        let inner = Rc::new_cyclic(|weak| ServerInner {
            weak: weak.clone(),
            id,
            config,
            fsm: RefCell::new(fsm),
            transport,
            state_machine,
            persistence,
            metrics,
            fsm_events: Notify::new(),
            applied_index: Cell::new(applied_index),
            awaited_commits: RefCell::new(BTreeMap::new()),
            awaited_applies: RefCell::new(BTreeMap::new()),
            awaited_indexes: RefCell::new(BTreeMap::new()),
            reads: RefCell::new(VecDeque::new()),
            leader_waiters: RefCell::new(Vec::new()),
            stepdown: RefCell::new(None),
            rpc_config: RefCell::new(AddressSet::new()),
            apply_tx,
            next_transfer_id: Cell::new(0),
            snapshot_transfers: RefCell::new(HashMap::new()),
            aborted_transfers: RefCell::new(HashMap::new()),
            snapshot_applications: RefCell::new(HashMap::new()),
            append_queues: RefCell::new(HashMap::new()),
            detached_append_tasks: RefCell::new(Vec::new()),
            shutdown_tx,
            io_task: RefCell::new(None),
            applier_task: RefCell::new(None),
            stopped: Cell::new(false),
        });

        // Seed the transport's address map from the configuration found in
        // the loaded state, before any activity can send a message.
        {
            let mut rpc = inner.rpc_config.borrow_mut();
            for addr in startup_config.address_set() {
                inner.transport.add_server(addr.id, &addr);
                rpc.insert(addr);
            }
        }

        let io_span = tracing::span!(Level::DEBUG, "io_task", id = %id);
        let io = tokio::task::spawn_local(
            Rc::clone(&inner)
                .io_main(last_stable, inner.shutdown_tx.subscribe())
                .instrument(io_span),
        );
        let applier_span = tracing::span!(Level::DEBUG, "applier", id = %id);
        let applier = tokio::task::spawn_local(
            Rc::clone(&inner)
                .applier_main(apply_rx, inner.shutdown_tx.subscribe())
                .instrument(applier_span),
        );
        *inner.io_task.borrow_mut() = Some(io);
        *inner.applier_task.borrow_mut() = Some(applier);

        Ok(RaftServer { inner })
    }

    /// Submit a command, resolving per `mode`.
    ///
    /// Fails with [`RaftError::NotLeader`] on a non-leader,
    /// [`RaftError::DroppedEntry`] if a later leader overwrote the entry's
    /// log position, [`RaftError::CommitStatusUnknown`] if this replica can
    /// no longer determine the outcome, and [`RaftError::Stopped`] on
    /// shutdown.
    pub async fn submit(&self, command: Bytes, mode: WaitMode) -> Result<(), RaftError> {
        self.inner.submit_entry(EntryPayload::Command(command), mode).await
    }

    /// Guarantee that a subsequent read of the application state machine
    /// observes every write committed before this call returned.
    pub async fn read_barrier(&self) -> Result<(), RaftError> {
        let inner = &self.inner;
        if inner.stopped.get() {
            return Err(RaftError::Stopped);
        }
        tracing::trace!(id = %inner.id, "read_barrier start");

        let mut leader = inner.fsm(|f| f.current_leader());
        let read_index;
        loop {
            match leader {
                None => {
                    inner.wait_for_leader().await?;
                    leader = inner.fsm(|f| f.current_leader());
                }
                Some(l) => {
                    let applied = inner.applied_index.get();
                    let reply = if l == inner.id {
                        inner.execute_read_barrier(inner.id).await
                    } else {
                        tracing::trace!(id = %inner.id, leader = %l, "read_barrier forwarded");
                        inner.transport.execute_read_barrier_on_leader(l).await?
                    };
                    match reply {
                        ReadBarrierReply::NotReady => {
                            // The leader has not committed anything in its
                            // term yet; wait for any apply and retry.
                            inner.wait_for_apply(applied + 1).await?;
                        }
                        ReadBarrierReply::NotALeader(hint) => leader = hint,
                        ReadBarrierReply::ReadIndex(index) => {
                            read_index = index;
                            break;
                        }
                    }
                }
            }
        }

        tracing::trace!(
            id = %inner.id,
            read_index,
            applied_index = inner.applied_index.get(),
            "read_barrier resolved"
        );
        inner.wait_for_apply(read_index).await
    }

    /// Leader-side surface of [`read_barrier`](Self::read_barrier), invoked
    /// by the transport layer for barrier requests from other replicas.
    pub async fn execute_read_barrier(&self, from: ServerId) -> ReadBarrierReply {
        self.inner.execute_read_barrier(from).await
    }

    /// Change the cluster membership to `target`.
    ///
    /// Returns once the final, non-joint configuration is committed; a no-op
    /// change returns immediately.
    pub async fn set_configuration(&self, target: AddressSet) -> Result<(), RaftError> {
        let inner = &self.inner;
        let diff = inner.fsm(|f| f.configuration()).diff(&target);
        if diff.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            id = %inner.id,
            joining = diff.joining.len(),
            leaving = diff.leaving.len(),
            "configuration change submitted"
        );

        inner
            .submit_entry(
                EntryPayload::Configuration(Configuration::new(target)),
                WaitMode::Committed,
            )
            .await?;

        // Once the joint entry commits, the FSM appends the non-joint entry
        // without yielding, so it precedes the dummy in the log. Waiting for
        // the dummy to commit therefore waits for the non-joint entry too.
        inner.submit_entry(EntryPayload::Dummy, WaitMode::Committed).await
    }

    /// Transfer leadership away, resolving when it is actually lost.
    ///
    /// `timeout_ticks` bounds the transfer on the FSM's logical clock;
    /// [`RaftError::Timeout`] reports an aborted transfer.
    pub async fn stepdown(&self, timeout_ticks: u64) -> Result<(), RaftError> {
        let inner = &self.inner;
        if inner.stopped.get() {
            return Err(RaftError::Stopped);
        }
        if inner.stepdown.borrow().is_some() {
            return Err(RaftError::StepdownInProgress);
        }
        inner.with_fsm(|f| f.transfer_leadership(timeout_ticks))?;

        let (tx, rx) = oneshot::channel();
        *inner.stepdown.borrow_mut() = Some(tx);
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(RaftError::Stopped),
        }
    }

    /// Accept a snapshot pushed by a leader and wait for the applier to
    /// finish loading it.
    ///
    /// On failure the snapshot image is dropped from the application state
    /// machine. At most one application per sender may be in flight.
    pub async fn apply_snapshot(&self, from: ServerId, request: InstallSnapshot) -> SnapshotReply {
        let inner = &self.inner;
        let snapshot_id = request.snapshot.id;
        inner.metrics.messages_received.with_label_values(&["install_snapshot"]).inc();
        inner.with_fsm(|f| f.step(from, Message::InstallSnapshot(request)));

        let (tx, rx) = oneshot::channel();
        let previous = inner.snapshot_applications.borrow_mut().insert(from, tx);
        assert!(
            previous.is_none(),
            "snapshot application from {} already in progress",
            from
        );

        let reply = match rx.await {
            Ok(reply) => reply,
            Err(_) => {
                tracing::error!(id = %inner.id, from = %from, "snapshot application aborted");
                SnapshotReply {
                    current_term: inner.fsm(|f| f.current_term()),
                    success: false,
                }
            }
        };
        if !reply.success {
            inner.state_machine.drop_snapshot(snapshot_id);
        }
        reply
    }

    /// Feed one inbound message to the protocol.
    ///
    /// Install-snapshot requests must go through
    /// [`apply_snapshot`](Self::apply_snapshot) instead, because their reply
    /// is produced asynchronously.
    pub fn step(&self, from: ServerId, message: Message) {
        let inner = &self.inner;
        inner.metrics.messages_received.with_label_values(&[message.kind()]).inc();
        inner.with_fsm(|f| f.step(from, message));
    }

    /// Shut the replica down.
    ///
    /// Stops both activities, aborts the collaborators, resolves every
    /// outstanding waiter, read, and awaited index, and waits for all
    /// background tasks, including in-flight snapshot transfers and
    /// per-destination append chains.
    pub async fn abort(&self) {
        let inner = &self.inner;
        if inner.stopped.replace(true) {
            return;
        }
        tracing::debug!(id = %inner.id, "abort requested");

        inner.with_fsm(|f| f.stop());
        let _ = inner.shutdown_tx.send(true);

        // The activities may still resolve waiters and start snapshot
        // transfers; stop them before draining the tables.
        let io = inner.io_task.borrow_mut().take();
        let applier = inner.applier_task.borrow_mut().take();
        let activities = async {
            if let Some(task) = io {
                let _ = task.await;
            }
            if let Some(task) = applier {
                let _ = task.await;
            }
        };
        tokio::join!(
            activities,
            inner.transport.abort(),
            inner.state_machine.abort(),
            inner.persistence.abort()
        );

        for (_, waiter) in std::mem::take(&mut *inner.awaited_commits.borrow_mut()) {
            let _ = waiter.tx.send(Err(RaftError::Stopped));
        }
        for (_, waiter) in std::mem::take(&mut *inner.awaited_applies.borrow_mut()) {
            let _ = waiter.tx.send(Err(RaftError::Stopped));
        }
        for tx in std::mem::take(&mut *inner.leader_waiters.borrow_mut()) {
            let _ = tx.send(Err(RaftError::Stopped));
        }
        for read in std::mem::take(&mut *inner.reads.borrow_mut()) {
            let _ = read.tx.send(ReadBarrierReply::NotALeader(None));
        }
        for (_, txs) in std::mem::take(&mut *inner.awaited_indexes.borrow_mut()) {
            for tx in txs {
                let _ = tx.send(Err(RaftError::Stopped));
            }
        }
        if let Some(tx) = inner.stepdown.borrow_mut().take() {
            let _ = tx.send(Err(RaftError::Stopped));
        }
        // Pending incoming snapshot applications observe the closed channel
        // and reply failure.
        inner.snapshot_applications.borrow_mut().clear();

        inner.abort_snapshot_transfers();
        let aborted: Vec<JoinHandle<()>> =
            inner.aborted_transfers.borrow_mut().drain().map(|(_, task)| task).collect();
        let mut drains: Vec<JoinHandle<()>> =
            std::mem::take(&mut *inner.detached_append_tasks.borrow_mut());
        for (_, AppendQueue { tx, task }) in inner.append_queues.borrow_mut().drain() {
            drop(tx);
            drains.push(task);
        }
        join_all(aborted.into_iter().chain(drains)).await;
        tracing::debug!(id = %inner.id, "abort complete");
    }

    pub fn id(&self) -> ServerId {
        self.inner.id
    }

    pub fn is_leader(&self) -> bool {
        self.inner.fsm(|f| f.is_leader())
    }

    pub fn current_term(&self) -> Term {
        self.inner.fsm(|f| f.current_term())
    }

    pub fn get_configuration(&self) -> Configuration {
        self.inner.fsm(|f| f.configuration())
    }

    /// Term and index of the last entry in the FSM's log.
    pub fn log_last_id(&self) -> LogId {
        self.inner.fsm(|f| LogId::new(f.log_last_term(), f.log_last_index()))
    }

    /// Index of the last entry delivered to the application state machine.
    pub fn applied_index(&self) -> Index {
        self.inner.applied_index.get()
    }

    /// Advance the FSM's logical clock by one tick.
    pub fn tick(&self) {
        self.inner.with_fsm(|f| f.tick());
    }

    /// Tick until the follower's election timeout has elapsed.
    pub fn elapse_election(&self) {
        while self.inner.fsm(|f| f.election_elapsed()) < ELECTION_TIMEOUT_TICKS {
            self.tick();
        }
    }

    /// Tick until the replica leaves follower state.
    pub fn wait_until_candidate(&self) {
        while self.inner.fsm(|f| f.is_follower()) {
            self.tick();
        }
    }

    /// Wait until the candidate either wins or reverts to follower.
    pub async fn wait_election_done(&self) {
        while self.inner.fsm(|f| f.is_candidate()) {
            tokio::task::yield_now().await;
        }
    }

    /// Wait until the FSM's log caught up to `target`.
    pub async fn wait_log_id(&self, target: LogId) {
        loop {
            let caught_up = self
                .inner
                .fsm(|f| f.log_last_term() >= target.term && f.log_last_index() >= target.index);
            if caught_up {
                return;
            }
            tokio::time::sleep(Duration::from_micros(5)).await;
        }
    }
}

impl fmt::Display for RaftServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[id: {}, term: {}, leader: {:?}]",
            self.inner.id,
            self.current_term(),
            self.inner.fsm(|fsm| fsm.current_leader()),
        )
    }
}

impl ServerInner {
    fn rc(&self) -> Rc<ServerInner> {
        self.weak.upgrade().expect("server inner gone while in use")
    }

    /// Run `f` against the FSM and ping everyone re-checking FSM state: the
    /// I/O activity waiting for output, and submitters waiting for log room.
    pub(crate) fn with_fsm<R>(&self, f: impl FnOnce(&mut dyn ProtocolFsm) -> R) -> R {
        let r = {
            let mut fsm = self.fsm.borrow_mut();
            f(fsm.as_mut())
        };
        self.fsm_events.notify_waiters();
        r
    }

    /// Read-only FSM access; no ping.
    pub(crate) fn fsm<R>(&self, f: impl FnOnce(&dyn ProtocolFsm) -> R) -> R {
        let fsm = self.fsm.borrow();
        f(fsm.as_ref())
    }

    async fn submit_entry(&self, payload: EntryPayload, mode: WaitMode) -> Result<(), RaftError> {
        // Admission: wait for room in the FSM's in-memory log.
        loop {
            if self.stopped.get() {
                return Err(RaftError::Stopped);
            }
            if self.fsm(|f| f.in_memory_log_size()) < self.config.max_log_size {
                break;
            }
            self.fsm_events.notified().await;
        }

        let kind = payload.kind();
        let log_id = self.with_fsm(|f| f.add_entry(payload))?;
        self.metrics.entries_added.with_label_values(&[kind]).inc();
        tracing::trace!(id = %self.id, entry = %log_id, "entry admitted");

        let table = match mode {
            WaitMode::Committed => &self.awaited_commits,
            WaitMode::Applied => &self.awaited_applies,
        };
        let (tx, rx) = oneshot::channel();
        let previous = table.borrow_mut().insert(log_id.index, Waiter { term: log_id.term, tx });
        assert!(previous.is_none(), "duplicate waiter for index {}", log_id.index);

        match rx.await {
            Ok(res) => res,
            Err(_) => Err(RaftError::Stopped),
        }
    }

    async fn execute_read_barrier(&self, from: ServerId) -> ReadBarrierReply {
        if self.stopped.get() {
            return ReadBarrierReply::NotALeader(None);
        }
        match self.with_fsm(|f| f.start_read_barrier(from)) {
            Err(err) => ReadBarrierReply::NotALeader(err.leader),
            Ok(None) => ReadBarrierReply::NotReady,
            Ok(Some((id, index))) => {
                tracing::trace!(id = %self.id, read_id = id, index, "read barrier started");
                let (tx, rx) = oneshot::channel();
                self.reads.borrow_mut().push_back(ActiveRead { id, index, tx });
                match rx.await {
                    Ok(reply) => reply,
                    Err(_) => ReadBarrierReply::NotALeader(None),
                }
            }
        }
    }

    async fn wait_for_leader(&self) -> Result<(), RaftError> {
        if self.stopped.get() {
            return Err(RaftError::Stopped);
        }
        let (tx, rx) = oneshot::channel();
        self.leader_waiters.borrow_mut().push(tx);
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(RaftError::Stopped),
        }
    }

    /// Wait until the applied index reaches `index`.
    async fn wait_for_apply(&self, index: Index) -> Result<(), RaftError> {
        if index <= self.applied_index.get() {
            return Ok(());
        }
        if self.stopped.get() {
            return Err(RaftError::Stopped);
        }
        let (tx, rx) = oneshot::channel();
        self.awaited_indexes.borrow_mut().entry(index).or_default().push(tx);
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(RaftError::Stopped),
        }
    }

    /// Notify `table` about a batch of committed or applied entries.
    fn notify_waiters(&self, table: &RefCell<BTreeMap<Index, Waiter>>, entries: &[Rc<LogEntry>]) {
        let first = entries.first().expect("empty batch").index;
        let last = entries.last().expect("empty batch").index;
        let last_term = entries.last().expect("empty batch").term;

        let mut waiters = table.borrow_mut();
        loop {
            let Some((&index, _)) = waiters.iter().next() else {
                break;
            };
            if index > last {
                break;
            }
            // A waiter below the batch means a notification went missing.
            assert!(
                index >= first,
                "waiter at {} predates batch [{}..{}]",
                index,
                first,
                last
            );
            let (index, waiter) = waiters.pop_first().expect("peeked entry");
            let entry = &entries[(index - first) as usize];
            let outcome = if waiter.term == entry.term {
                Ok(())
            } else {
                // A leadership change replaced the entry between submission
                // and commitment.
                Err(RaftError::DroppedEntry)
            };
            let _ = waiter.tx.send(outcome);
            self.metrics.waiters_awaken.inc();
        }

        // Terms only grow along the log; entries submitted in an older term
        // can no longer commit.
        loop {
            let stale = matches!(waiters.iter().next(), Some((_, w)) if w.term < last_term);
            if !stale {
                break;
            }
            let (_, waiter) = waiters.pop_first().expect("peeked entry");
            let _ = waiter.tx.send(Err(RaftError::DroppedEntry));
            self.metrics.waiters_awaken.inc();
        }
    }

    /// Drop waiters we lost track of: everything at or below `upto`, or all
    /// of them. Happens when a remote snapshot leaps over entries, or when
    /// this replica left the configuration while not a leader.
    pub(crate) fn drop_waiters(&self, upto: Option<Index>) {
        for table in [&self.awaited_commits, &self.awaited_applies] {
            let drained = {
                let mut waiters = table.borrow_mut();
                match upto {
                    Some(index) => {
                        let rest = waiters.split_off(&(index + 1));
                        std::mem::replace(&mut *waiters, rest)
                    }
                    None => std::mem::take(&mut *waiters),
                }
            };
            for (_, waiter) in drained {
                let _ = waiter.tx.send(Err(RaftError::CommitStatusUnknown));
                self.metrics.waiters_dropped.inc();
            }
        }
    }

    /// Wake every caller whose awaited index has been applied.
    pub(crate) fn signal_applied(&self) {
        let applied = self.applied_index.get();
        let mut awaited = self.awaited_indexes.borrow_mut();
        loop {
            let Some((&index, _)) = awaited.iter().next() else {
                break;
            };
            if index > applied {
                break;
            }
            let (_, txs) = awaited.pop_first().expect("peeked entry");
            for tx in txs {
                let _ = tx.send(Ok(()));
            }
        }
    }

    /// Request abort of the snapshot transfer to `dst`, if one is in flight.
    /// Called when a server leaves the configuration.
    pub(crate) fn abort_snapshot_transfer(&self, dst: ServerId) {
        if let Some(transfer) = self.snapshot_transfers.borrow_mut().remove(&dst) {
            tracing::trace!(id = %self.id, to = %dst, "aborting snapshot transfer");
            transfer.abort.abort();
            self.aborted_transfers.borrow_mut().insert(transfer.id, transfer.task);
        }
    }

    /// Request abort of every outgoing snapshot transfer. Called on
    /// leadership loss and on shutdown.
    pub(crate) fn abort_snapshot_transfers(&self) {
        let transfers: Vec<_> = self.snapshot_transfers.borrow_mut().drain().collect();
        if transfers.is_empty() {
            return;
        }
        let mut aborted = self.aborted_transfers.borrow_mut();
        for (dst, transfer) in transfers {
            tracing::trace!(id = %self.id, to = %dst, "aborting snapshot transfer");
            transfer.abort.abort();
            aborted.insert(transfer.id, transfer.task);
        }
    }
}

/// The last configuration present in the loaded state: from the log tail if
/// it holds a configuration entry, else from the snapshot.
fn last_configuration(
    snapshot: Option<&SnapshotDescriptor>,
    log: &[Rc<LogEntry>],
) -> Configuration {
    for entry in log.iter().rev() {
        if let EntryPayload::Configuration(config) = &entry.payload {
            return config.clone();
        }
    }
    snapshot.map(|s| s.config.clone()).unwrap_or_default()
}
