//! Per-replica counters and gauges.
//!
//! All metrics live in the `raft` namespace, carry a constant `id` label,
//! and are registered on the registry injected at server construction, so
//! several replicas can share one registry and a test can use its own.

use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::Opts;
use prometheus::Registry;

use crate::types::ServerId;

pub(crate) struct ServerMetrics {
    /// Messages received, by message type.
    pub(crate) messages_received: IntCounterVec,
    /// Messages sent, by message type.
    pub(crate) messages_sent: IntCounterVec,
    /// Entries added on this replica, by entry type.
    pub(crate) entries_added: IntCounterVec,
    pub(crate) waiters_awaken: IntCounter,
    pub(crate) waiters_dropped: IntCounter,
    /// FSM output polls.
    pub(crate) polls: IntCounter,
    pub(crate) store_term_and_vote: IntCounter,
    pub(crate) store_snapshot: IntCounter,
    /// Snapshots loaded into the application state machine.
    pub(crate) sm_load_snapshot: IntCounter,
    pub(crate) truncate_persisted_log: IntCounter,
    pub(crate) persisted_log_entries: IntCounter,
    pub(crate) queued_for_apply: IntCounter,
    pub(crate) applied_entries: IntCounter,
    pub(crate) snapshots_taken: IntCounter,
    /// Size of the in-memory part of the log, refreshed per output batch.
    pub(crate) in_memory_log_size: IntGauge,
}

impl ServerMetrics {
    pub(crate) fn new(id: ServerId, registry: &Registry) -> Result<Self, prometheus::Error> {
        let opts = |name: &str, help: &str| {
            Opts::new(name, help)
                .namespace("raft")
                .const_label("id", id.to_string())
        };

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let c = IntCounter::with_opts(opts(name, help))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let counter_vec =
            |name: &str, help: &str, label: &str| -> Result<IntCounterVec, prometheus::Error> {
                let c = IntCounterVec::new(opts(name, help), &[label])?;
                registry.register(Box::new(c.clone()))?;
                Ok(c)
            };

        let in_memory_log_size = IntGauge::with_opts(opts(
            "in_memory_log_size",
            "size of the in-memory part of the log",
        ))?;
        registry.register(Box::new(in_memory_log_size.clone()))?;

        Ok(Self {
            messages_received: counter_vec(
                "messages_received",
                "how many messages were received",
                "message_type",
            )?,
            messages_sent: counter_vec(
                "messages_sent",
                "how many messages were sent",
                "message_type",
            )?,
            entries_added: counter_vec(
                "entries_added",
                "how many entries were added on this replica",
                "log_entry_type",
            )?,
            waiters_awaken: counter("waiters_awaken", "how many waiters got a result back")?,
            waiters_dropped: counter("waiters_dropped", "how many waiters did not get a result back")?,
            polls: counter("polls", "how many times the protocol state machine was polled")?,
            store_term_and_vote: counter(
                "store_term_and_vote",
                "how many times term and vote were persisted",
            )?,
            store_snapshot: counter("store_snapshot", "how many snapshots were persisted")?,
            sm_load_snapshot: counter(
                "sm_load_snapshot",
                "how many times the application state machine was reloaded from a snapshot",
            )?,
            truncate_persisted_log: counter(
                "truncate_persisted_log",
                "how many times the log was truncated on storage",
            )?,
            persisted_log_entries: counter(
                "persisted_log_entries",
                "how many log entries were persisted",
            )?,
            queued_for_apply: counter(
                "queued_for_apply",
                "how many log entries were queued to be applied",
            )?,
            applied_entries: counter("applied_entries", "how many log entries were applied")?,
            snapshots_taken: counter(
                "snapshots_taken",
                "how many times the application state machine was snapshotted",
            )?,
            in_memory_log_size,
        })
    }
}
