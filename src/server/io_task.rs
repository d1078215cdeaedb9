//! The I/O activity: turns FSM output batches into persistence and outgoing
//! messages.

use std::rc::Rc;

use futures::future::AbortHandle;
use futures::future::Abortable;
use futures::future::Aborted;
use tokio::sync::mpsc;
use tokio::sync::watch;

use crate::error::RaftError;
use crate::error::StorageError;
use crate::fsm::FsmOutput;
use crate::fsm::SnapshotUpdate;
use crate::membership::contains_id;
use crate::membership::diff_address_sets;
use crate::membership::AddressSet;
use crate::message::AppendRequest;
use crate::message::InstallSnapshot;
use crate::message::Message;
use crate::message::ReadBarrierReply;
use crate::message::SnapshotReply;
use crate::server::AppendQueue;
use crate::server::ApplyItem;
use crate::server::ServerInner;
use crate::server::SnapshotTransfer;
use crate::types::Index;
use crate::types::ServerId;

/// Why the I/O activity stopped.
enum IoStop {
    /// Orderly shutdown.
    Shutdown,
    /// Unrecoverable persistence failure; already logged. Fatal for the
    /// replica.
    Fatal,
}

impl ServerInner {
    /// Body of the I/O activity.
    ///
    /// `last_stable` is the highest index known durable at start; it tracks
    /// the persisted log so entry regressions can be detected and truncated.
    pub(crate) async fn io_main(
        self: Rc<Self>,
        mut last_stable: Index,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::trace!(id = %self.id, "io activity started");
        loop {
            let batch = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                batch = self.next_output() => batch,
            };
            self.metrics.polls.inc();

            match self.process_batch(batch, &mut last_stable, &mut shutdown).await {
                Ok(()) => {}
                Err(IoStop::Shutdown) => break,
                Err(IoStop::Fatal) => return,
            }
        }
        tracing::trace!(id = %self.id, "io activity stopped");
    }

    /// Wait until the FSM has output and drain one batch.
    async fn next_output(&self) -> FsmOutput {
        loop {
            let polled = self.fsm.borrow_mut().poll_output();
            if let Some(batch) = polled {
                return batch;
            }
            self.fsm_events.notified().await;
        }
    }

    fn fatal<T>(&self, what: &str, res: Result<T, StorageError>) -> Result<T, IoStop> {
        res.map_err(|err| {
            tracing::error!(id = %self.id, error = %err, "io activity stopping: {what} failed");
            IoStop::Fatal
        })
    }

    async fn process_batch(
        &self,
        batch: FsmOutput,
        last_stable: &mut Index,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), IoStop> {
        if let Some((term, vote)) = batch.term_and_vote {
            // A vote can change while the term does not, but persisting both
            // together is always safe.
            self.fatal(
                "store term and vote",
                self.persistence.store_term_and_vote(term, vote).await,
            )?;
            self.metrics.store_term_and_vote.inc();
        }

        if let Some(SnapshotUpdate { snapshot, local, previous_id }) = batch.snapshot {
            tracing::trace!(id = %self.id, snapshot = %snapshot.id, "storing snapshot");
            // A remote snapshot truncates the whole log; only locally taken
            // snapshots keep trailing entries for lagging followers.
            let trailing = if local { self.config.snapshot_trailing } else { 0 };
            self.fatal(
                "store snapshot",
                self.persistence.store_snapshot_descriptor(&snapshot, trailing).await,
            )?;
            self.metrics.store_snapshot.inc();
            if let Some(previous) = previous_id {
                self.state_machine.drop_snapshot(previous);
            }
            // A locally generated snapshot is already reflected in the
            // application state machine; a remote one must be loaded by the
            // applier.
            if !local {
                self.queue_for_apply(ApplyItem::Snapshot(snapshot), shutdown).await?;
            }
        }

        if !batch.log_entries.is_empty() {
            let entries = &batch.log_entries;
            let first = entries[0].index;
            if *last_stable >= first {
                self.fatal("truncate log", self.persistence.truncate_log(first).await)?;
                self.metrics.truncate_persisted_log.inc();
            }
            self.fatal(
                "store log entries",
                self.persistence.store_log_entries(entries).await,
            )?;
            *last_stable = entries.last().expect("nonempty").index;
            self.metrics.persisted_log_entries.inc_by(entries.len() as u64);
        }

        // The transport must know the joiners' addresses before any message
        // of this batch is dispatched; leavers are removed only afterwards,
        // because this batch may still address them.
        let mut leaving = AddressSet::new();
        if let Some(active) = &batch.configuration {
            let diff = {
                let rpc = self.rpc_config.borrow();
                diff_address_sets(&rpc, active)
            };
            for addr in diff.joining {
                self.transport.add_server(addr.id, &addr);
                self.rpc_config.borrow_mut().insert(addr);
            }
            leaving = diff.leaving;
        }

        for (dst, message) in batch.messages {
            self.dispatch_message(dst, message).await;
        }

        for addr in leaving {
            self.abort_snapshot_transfer(addr.id);
            self.retire_append_queue(addr.id);
            self.rpc_config.borrow_mut().remove(&addr);
            self.transport.remove_server(addr.id);
        }

        if !batch.committed.is_empty() {
            self.metrics.queued_for_apply.inc_by(batch.committed.len() as u64);
            self.queue_for_apply(ApplyItem::Entries(batch.committed), shutdown).await?;
        }

        if let Some(watermark) = batch.max_read_id_with_quorum {
            let mut reads = self.reads.borrow_mut();
            while reads.front().map_or(false, |r| r.id <= watermark) {
                let read = reads.pop_front().expect("peeked entry");
                let _ = read.tx.send(ReadBarrierReply::ReadIndex(read.index));
            }
        }

        if !self.fsm(|f| f.is_leader()) {
            if let Some(tx) = self.stepdown.borrow_mut().take() {
                let _ = tx.send(Ok(()));
            }
            if !contains_id(&self.rpc_config.borrow(), self.id) {
                // Neither leader nor part of the configuration: this replica
                // will never learn the fate of entries it accepted.
                self.drop_waiters(None);
            }
            self.abort_snapshot_transfers();

            let current_leader = self.fsm(|f| f.current_leader());
            for read in std::mem::take(&mut *self.reads.borrow_mut()) {
                let _ = read.tx.send(ReadBarrierReply::NotALeader(current_leader));
            }
        } else if batch.abort_leadership_transfer {
            if let Some(tx) = self.stepdown.borrow_mut().take() {
                let _ = tx.send(Err(RaftError::Timeout));
            }
        }

        if self.fsm(|f| f.current_leader()).is_some() {
            for tx in std::mem::take(&mut *self.leader_waiters.borrow_mut()) {
                let _ = tx.send(Ok(()));
            }
        }

        self.metrics.in_memory_log_size.set(self.fsm(|f| f.in_memory_log_size()) as i64);
        Ok(())
    }

    /// Push one item to the applier. The bounded queue is the backpressure
    /// keeping an overloaded state machine from divorcing log growth from
    /// application progress.
    async fn queue_for_apply(
        &self,
        item: ApplyItem,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), IoStop> {
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => Err(IoStop::Shutdown),
            res = self.apply_tx.send(item) => res.map_err(|_| IoStop::Shutdown),
        }
    }

    async fn dispatch_message(&self, dst: ServerId, message: Message) {
        self.metrics.messages_sent.with_label_values(&[message.kind()]).inc();
        let res = match message {
            Message::AppendRequest(request) => {
                self.enqueue_append(dst, request);
                Ok(())
            }
            Message::InstallSnapshot(request) => {
                self.send_snapshot(dst, request);
                Ok(())
            }
            Message::SnapshotReply(reply) => {
                // Emitted once the snapshot received from `dst` has been
                // dealt with; resolves the pending application.
                let tx = self.snapshot_applications.borrow_mut().remove(&dst);
                let tx = tx.expect("snapshot reply without a pending application");
                let _ = tx.send(reply);
                Ok(())
            }
            Message::AppendReply(reply) => self.transport.send_append_reply(dst, reply).await,
            Message::VoteRequest(request) => self.transport.send_vote_request(dst, request).await,
            Message::VoteReply(reply) => self.transport.send_vote_reply(dst, reply).await,
            Message::TimeoutNow(request) => self.transport.send_timeout_now(dst, request).await,
            Message::ReadQuorum(request) => self.transport.send_read_quorum(dst, request).await,
            Message::ReadQuorumReply(reply) => {
                self.transport.send_read_quorum_reply(dst, reply).await
            }
        };
        if let Err(err) = res {
            // Message loss is tolerated by the protocol; the FSM re-emits
            // anything that matters.
            tracing::debug!(id = %self.id, to = %dst, error = %err, "failed to send message");
        }
    }

    /// Queue an append request behind every earlier one to the same
    /// destination. Sends to one peer never overtake each other; sends to
    /// different peers proceed in parallel.
    fn enqueue_append(&self, dst: ServerId, request: AppendRequest) {
        let mut queues = self.append_queues.borrow_mut();
        let queue = queues.entry(dst).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let task = tokio::task::spawn_local(self.rc().append_queue_main(dst, rx));
            AppendQueue { tx, task }
        });
        queue.tx.send(request).expect("append queue task gone");
    }

    async fn append_queue_main(
        self: Rc<Self>,
        dst: ServerId,
        mut rx: mpsc::UnboundedReceiver<AppendRequest>,
    ) {
        while let Some(request) = rx.recv().await {
            if let Err(err) = self.transport.send_append_request(dst, request).await {
                tracing::debug!(id = %self.id, to = %dst, error = %err, "failed to send append request");
            }
        }
    }

    /// Stop accepting appends for a departed destination. Its queue task
    /// drains in the background and is awaited at shutdown.
    fn retire_append_queue(&self, dst: ServerId) {
        if let Some(AppendQueue { tx, task }) = self.append_queues.borrow_mut().remove(&dst) {
            drop(tx);
            self.detached_append_tasks.borrow_mut().push(task);
        }
    }

    /// Launch a background snapshot transfer and step its outcome into the
    /// FSM, unless the transfer gets aborted first.
    fn send_snapshot(&self, dst: ServerId, request: InstallSnapshot) {
        let transfer_id = self.next_transfer_id.get();
        self.next_transfer_id.set(transfer_id + 1);
        let (abort, registration) = AbortHandle::new_pair();

        let this = self.rc();
        // The spawned body runs only after control returns to the scheduler,
        // so the table entry below is in place before the transfer can
        // complete.
        let task = tokio::task::spawn_local(async move {
            let send = Abortable::new(this.transport.send_snapshot(dst, request), registration);
            let outcome = match send.await {
                Err(Aborted) => {
                    // The destination left or we are shutting down; the
                    // reply, if any, must not reach the FSM.
                    this.aborted_transfers.borrow_mut().remove(&transfer_id);
                    return;
                }
                Ok(outcome) => outcome,
            };

            {
                let mut transfers = this.snapshot_transfers.borrow_mut();
                if transfers.get(&dst).map_or(false, |t| t.id == transfer_id) {
                    transfers.remove(&dst);
                }
            }

            let reply = match outcome {
                Ok(reply) => {
                    tracing::trace!(id = %this.id, to = %dst, "snapshot transferred");
                    reply
                }
                Err(err) => {
                    tracing::error!(id = %this.id, to = %dst, error = %err, "snapshot transfer failed");
                    SnapshotReply {
                        current_term: this.fsm(|f| f.current_term()),
                        success: false,
                    }
                }
            };
            this.with_fsm(|f| f.step(dst, Message::SnapshotReply(reply)));
        });

        let previous = self
            .snapshot_transfers
            .borrow_mut()
            .insert(dst, SnapshotTransfer { task, abort, id: transfer_id });
        assert!(previous.is_none(), "snapshot transfer to {} already in flight", dst);
    }
}
