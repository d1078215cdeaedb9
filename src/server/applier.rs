//! The applier activity: feeds committed entries and received snapshots to
//! the application state machine.

use std::rc::Rc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::watch;

use crate::entry::EntryPayload;
use crate::entry::LogEntry;
use crate::error::StateMachineError;
use crate::server::ApplyItem;
use crate::server::ServerInner;
use crate::snapshot::SnapshotDescriptor;
use crate::types::Index;
use crate::types::Term;

impl ServerInner {
    /// Body of the applier activity.
    ///
    /// Commit notification, command application, local snapshotting and
    /// remote snapshot loading all run on this single task, so a committed
    /// entry is never delivered to the application state machine before an
    /// earlier snapshot that subsumes it is loaded.
    pub(crate) async fn applier_main(
        self: Rc<Self>,
        mut apply_rx: mpsc::Receiver<ApplyItem>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::trace!(id = %self.id, "applier activity started");
        loop {
            let item = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                item = apply_rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let res = match item {
                ApplyItem::Entries(batch) => self.apply_entries(batch).await,
                ApplyItem::Snapshot(snapshot) => self.apply_remote_snapshot(snapshot).await,
            };
            if let Err(err) = res {
                tracing::error!(id = %self.id, error = %err, "applier activity stopping");
                return;
            }

            self.signal_applied();
        }
        tracing::trace!(id = %self.id, "applier activity stopped");
    }

    async fn apply_entries(&self, batch: Vec<Rc<LogEntry>>) -> Result<(), StateMachineError> {
        if batch.is_empty() {
            tracing::trace!(id = %self.id, "empty apply batch");
            return Ok(());
        }

        self.notify_waiters(&self.awaited_commits, &batch);

        let last_index = batch.last().expect("nonempty").index;
        let last_term = batch.last().expect("nonempty").term;
        assert_eq!(
            last_index,
            self.applied_index.get() + batch.len() as u64,
            "apply batch is not contiguous with the applied index"
        );

        let commands: Vec<Bytes> = batch
            .iter()
            .filter_map(|entry| match &entry.payload {
                EntryPayload::Command(command) => Some(command.clone()),
                _ => None,
            })
            .collect();

        if !commands.is_empty() {
            let count = commands.len() as u64;
            self.state_machine.apply(commands).await?;
            self.metrics.applied_entries.inc_by(count);
        }

        self.applied_index.set(last_index);
        self.notify_waiters(&self.awaited_applies, &batch);

        // The FSM may already hold a later snapshot (received from a leader)
        // that this activity has not observed yet; comparing against its
        // snapshot index avoids taking one that is superseded on arrival.
        let last_snapshot_index = self.fsm(|f| f.log_last_snapshot_index());
        let applied = self.applied_index.get();
        if applied >= last_snapshot_index
            && applied - last_snapshot_index >= self.config.snapshot_threshold
        {
            self.take_local_snapshot(last_term, applied).await?;
        }

        Ok(())
    }

    async fn take_local_snapshot(&self, term: Term, index: Index) -> Result<(), StateMachineError> {
        let config = self.fsm(|f| f.log_configuration_for(index));
        tracing::trace!(id = %self.id, term, index, "taking snapshot");

        let snapshot_id = self.state_machine.take_snapshot().await?;
        let snapshot = SnapshotDescriptor { id: snapshot_id, term, index, config };

        // The FSM may have accepted a later snapshot while take_snapshot was
        // in flight. It rejects ours then, and we discard the image; the
        // later snapshot arrives through the apply queue shortly.
        if !self.with_fsm(|f| f.apply_snapshot(snapshot, self.config.snapshot_trailing, true)) {
            tracing::trace!(id = %self.id, index, "local snapshot rejected by a later one");
            self.state_machine.drop_snapshot(snapshot_id);
        }
        self.metrics.snapshots_taken.inc();

        Ok(())
    }

    async fn apply_remote_snapshot(
        &self,
        snapshot: SnapshotDescriptor,
    ) -> Result<(), StateMachineError> {
        assert!(
            snapshot.index >= self.applied_index.get(),
            "remote snapshot behind the applied index"
        );
        tracing::trace!(id = %self.id, snapshot = %snapshot.id, index = snapshot.index, "loading snapshot");

        self.state_machine.load_snapshot(snapshot.id).await?;

        // Entries at or below the snapshot were leapt over; their waiters
        // can no longer learn an outcome.
        self.drop_waiters(Some(snapshot.index));
        self.applied_index.set(snapshot.index);
        self.metrics.sm_load_snapshot.inc();

        Ok(())
    }
}
