//! # Partition Lease Cache
//!
//! Concurrency-safe registry of the partitions assigned to one consumer,
//! their lease and flow-control state, and the inbound rebalance event queue.
//!
//! ## Leases
//!
//! A partition is handed out by [`PartitionLeaseCache::select_partition`]
//! together with a lease timestamp. The lease ends when it is released, or
//! when it outlives the lease timeout, in which case the next selection
//! reclaims the partition. Lease timestamps on one partition strictly
//! increase, so a token from an earlier lease never matches a later one.
//! A lease whose commit is in flight is marked confirming and cannot expire
//! or be confirmed a second time.
//!
//! ## Revoked partitions
//!
//! With rollback enabled, a disconnect that hits a live lease marks the
//! partition revoked instead of removing it. A revoked partition is never
//! selected again; it is removed as soon as its lease ends, either by the
//! release that ends it or by [`PartitionLeaseCache::remove_revoked_partitions`]
//! once the lease has expired.
//!
//! ## Eligibility
//!
//! Releasing a partition schedules its next eligibility from the booked
//! [`ConsumeData`] and the active flow-control rules. Selection prefers the
//! partition that has been idle the longest among those both unleased and
//! past their wait deadline.
//!
//! ## Thread Safety
//!
//! - **Per-partition state**: `DashMap` shards; every mutation of one entry
//!   happens under that entry's shard lock, never under a global lock
//! - **Flow-control rules**: `parking_lot::RwLock`, read on every release
//! - **Event queue**: single-producer/single-consumer `tokio::sync::mpsc`

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ConsumerConfig;
use crate::error::{ErrorCode, LeasemqClientError};
use crate::flow_ctrl::FlowCtrlRuleHandler;
use crate::protocol::{
    CacheSnapshot, ConfirmContext, ConsumeData, ConsumerEvent, Node, Partition, INVALID_OFFSET,
};
use crate::Result;

#[derive(Debug, Clone, Copy)]
struct Lease {
    timestamp_ms: i64,
    acquired_at: Instant,
    /// A commit for this lease is in flight
    confirming: bool,
}

#[derive(Debug)]
struct PartitionEntry {
    partition: Partition,
    lease: Option<Lease>,
    last_lease_ts: i64,
    idle_since: Instant,
    next_eligible: Instant,
    consume_data: Option<ConsumeData>,
    last_offset: i64,
    zero_fetch_count: u32,
    last_consumed: bool,
    /// Taken away by the coordinator, kept only until the lease ends
    revoked: bool,
}

impl PartitionEntry {
    fn new(partition: Partition, now: Instant) -> Self {
        Self {
            partition,
            lease: None,
            last_lease_ts: 0,
            idle_since: now,
            next_eligible: now,
            consume_data: None,
            last_offset: INVALID_OFFSET,
            zero_fetch_count: 0,
            last_consumed: false,
            revoked: false,
        }
    }

    fn has_live_lease(&self, now: Instant, lease_timeout: Duration) -> bool {
        self.lease.is_some_and(|lease| {
            lease.confirming || now.duration_since(lease.acquired_at) < lease_timeout
        })
    }

    fn is_available(&self, now: Instant, lease_timeout: Duration) -> bool {
        !self.revoked && !self.has_live_lease(now, lease_timeout) && now >= self.next_eligible
    }
}

/// A granted lease on one partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLease {
    pub partition: Partition,
    pub confirm_context: ConfirmContext,
    /// Whether the previous lease on this partition ended consumed
    pub last_consumed: bool,
}

/// Offsets tracked for one registered partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumedOffsets {
    pub last_offset: i64,
    pub committed_offset: i64,
}

/// An event travelling through the rebalance queue with its completion waiter
#[derive(Debug)]
pub struct QueuedEvent {
    pub event: ConsumerEvent,
    waiter: Option<oneshot::Sender<ConsumerEvent>>,
}

/// Registry of assigned partitions, leases, offsets and rebalance events
#[derive(Debug)]
pub struct PartitionLeaseCache {
    partitions: DashMap<String, PartitionEntry>,
    /// Committed offsets outlive partition removal; presence means the key
    /// has been registered before
    committed: DashMap<String, i64>,
    flow_ctrl: RwLock<FlowCtrlRuleHandler>,
    lease_timeout: Duration,
    slow_consume_wait: Duration,

    event_tx: mpsc::UnboundedSender<QueuedEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<QueuedEvent>>>,
    pending_events: AtomicUsize,
    event_results: Mutex<VecDeque<ConsumerEvent>>,
}

impl PartitionLeaseCache {
    pub fn new(lease_timeout: Duration, slow_consume_wait: Duration) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            partitions: DashMap::new(),
            committed: DashMap::new(),
            flow_ctrl: RwLock::new(FlowCtrlRuleHandler::new()),
            lease_timeout,
            slow_consume_wait,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            pending_events: AtomicUsize::new(0),
            event_results: Mutex::new(VecDeque::new()),
        }
    }

    pub fn from_config(config: &ConsumerConfig) -> Self {
        Self::new(config.max_confirm_wait(), config.slow_consume_wait())
    }

    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Lease the longest-idle partition that is unleased and past its wait
    pub fn select_partition(&self) -> Result<PartitionLease> {
        let now = Instant::now();
        let mut candidates: Vec<(Instant, String)> = self
            .partitions
            .iter()
            .filter(|entry| entry.is_available(now, self.lease_timeout))
            .map(|entry| (entry.idle_since, entry.key().clone()))
            .collect();
        candidates.sort();

        for (_, key) in candidates {
            let Some(mut entry) = self.partitions.get_mut(&key) else {
                continue;
            };
            // another caller may have taken it since the scan
            let now = Instant::now();
            if !entry.is_available(now, self.lease_timeout) {
                continue;
            }
            if let Some(expired) = entry.lease {
                warn!(
                    partition_key = %key,
                    lease_time_ms = expired.timestamp_ms,
                    "Reclaiming expired partition lease"
                );
            }

            let timestamp_ms = wall_clock_ms().max(entry.last_lease_ts + 1);
            entry.lease = Some(Lease {
                timestamp_ms,
                acquired_at: now,
                confirming: false,
            });
            entry.last_lease_ts = timestamp_ms;

            debug!(partition_key = %key, lease_time_ms = timestamp_ms, "Leased partition");
            return Ok(PartitionLease {
                partition: entry.partition.clone(),
                confirm_context: ConfirmContext::new(key, timestamp_ms),
                last_consumed: entry.last_consumed,
            });
        }

        Err(self.unavailable_reason(Instant::now()))
    }

    /// End a lease; a successful release waits out the flow-control delay,
    /// an unsuccessful one makes the partition eligible immediately.
    ///
    /// Returns the partition when it was revoked while leased; it is no
    /// longer registered here and must be unregistered from its broker.
    pub fn release_partition(
        &self,
        success: bool,
        filtered: bool,
        confirm_context: &ConfirmContext,
        consumed: bool,
    ) -> Result<Option<Partition>> {
        let key = confirm_context.partition_key.as_str();
        let mut entry = self.partitions.get_mut(key).ok_or_else(|| {
            LeasemqClientError::confirm_timeout(format!("partition {} is no longer assigned", key))
        })?;

        match entry.lease {
            Some(lease) if lease.timestamp_ms == confirm_context.lease_time_ms => {}
            _ => {
                return Err(LeasemqClientError::confirm_timeout(format!(
                    "lease {} on partition {} is no longer held",
                    confirm_context.lease_time_ms, key
                )))
            }
        }

        let now = Instant::now();
        let wait_ms = if success {
            let data = entry.consume_data.clone().unwrap_or_else(|| {
                ConsumeData::success(wall_clock_ms(), false, 0, -1, false)
            });
            self.flow_ctrl.read().consume_wait(
                &data,
                filtered,
                entry.zero_fetch_count,
                self.slow_consume_wait.as_millis() as u64,
            )
        } else {
            0
        };

        entry.lease = None;
        entry.idle_since = now;
        entry.next_eligible = now + Duration::from_millis(wait_ms);
        entry.last_consumed = consumed;
        if consumed {
            self.committed.insert(key.to_string(), entry.last_offset);
        }

        debug!(
            partition_key = %key,
            success,
            consumed,
            wait_ms,
            "Released partition"
        );
        if !entry.revoked {
            return Ok(None);
        }

        drop(entry);
        let removed = self
            .partitions
            .remove_if(key, |_, entry| entry.revoked && entry.lease.is_none())
            .map(|(_, entry)| entry.partition);
        if removed.is_some() {
            info!(partition_key = %key, "Removed revoked partition after its lease ended");
        }
        Ok(removed)
    }

    /// Pin the lease behind `confirm_context` for the duration of a commit.
    ///
    /// Fails with `ConfirmTimeout` when the lease is gone or another confirm
    /// of the same lease is already in flight.
    pub fn begin_confirm(&self, confirm_context: &ConfirmContext) -> Result<Partition> {
        let key = confirm_context.partition_key.as_str();
        let now = Instant::now();
        let mut entry = self.partitions.get_mut(key).ok_or_else(|| {
            LeasemqClientError::confirm_timeout(format!("partition {} is no longer assigned", key))
        })?;

        let live = entry.has_live_lease(now, self.lease_timeout);
        match entry.lease.as_mut() {
            Some(lease) if live && lease.timestamp_ms == confirm_context.lease_time_ms => {
                if lease.confirming {
                    return Err(LeasemqClientError::confirm_timeout(format!(
                        "lease {} on partition {} is already being confirmed",
                        confirm_context.lease_time_ms, key
                    )));
                }
                lease.confirming = true;
            }
            _ => {
                return Err(LeasemqClientError::confirm_timeout(format!(
                    "lease {} on partition {} is no longer held",
                    confirm_context.lease_time_ms, key
                )))
            }
        }
        Ok(entry.partition.clone())
    }

    /// Record the last offset reported for a partition; negative offsets
    /// mean "unknown" and are ignored
    pub fn book_partition_info(&self, key: &str, offset: i64) {
        if offset < 0 {
            return;
        }
        if let Some(mut entry) = self.partitions.get_mut(key) {
            entry.last_offset = offset;
        }
    }

    /// Store the flow-control snapshot of the latest fetch
    pub fn book_consume_data(&self, key: &str, data: ConsumeData) {
        if let Some(mut entry) = self.partitions.get_mut(key) {
            let empty = data.err_code == ErrorCode::NotFound
                || (data.is_success() && data.msg_size == 0);
            if empty {
                entry.zero_fetch_count = entry.zero_fetch_count.saturating_add(1);
            } else if data.is_success() {
                entry.zero_fetch_count = 0;
            }
            entry.consume_data = Some(data);
        }
    }

    /// True only while the lease issued at `lease_time_ms` is live
    pub fn is_partition_in_use(&self, key: &str, lease_time_ms: i64) -> bool {
        let now = Instant::now();
        self.partitions.get(key).is_some_and(|entry| {
            entry.has_live_lease(now, self.lease_timeout)
                && entry
                    .lease
                    .is_some_and(|lease| lease.timestamp_ms == lease_time_ms)
        })
    }

    pub fn get_partition(&self, key: &str) -> Option<Partition> {
        self.partitions.get(key).map(|entry| entry.partition.clone())
    }

    /// Remove the partitions of a disconnect event, grouped by broker.
    ///
    /// With `rollback_if_confirm_timeout`, a partition holding a live lease is
    /// marked revoked and kept until that lease ends, so its pending confirm
    /// can still complete.
    pub fn remove_and_get_partitions(
        &self,
        partitions: &[Partition],
        rollback_if_confirm_timeout: bool,
    ) -> BTreeMap<Node, Vec<Partition>> {
        let now = Instant::now();
        let mut removed: BTreeMap<Node, Vec<Partition>> = BTreeMap::new();

        for partition in partitions {
            let key = partition.partition_key();
            let taken = self.partitions.remove_if(key, |_, entry| {
                !(rollback_if_confirm_timeout && entry.has_live_lease(now, self.lease_timeout))
            });
            match taken {
                Some((_, entry)) => removed
                    .entry(entry.partition.broker.clone())
                    .or_default()
                    .push(entry.partition),
                None => {
                    if let Some(mut entry) = self.partitions.get_mut(key) {
                        entry.revoked = true;
                        debug!(partition_key = %key, "Keeping revoked partition until its lease ends");
                    }
                }
            }
        }
        removed
    }

    /// Partitions of a connect event that are not registered yet.
    ///
    /// A revoked partition assigned back to this consumer is still registered
    /// with its broker, so it only loses its revoked mark.
    pub fn filter_partitions(&self, partitions: &[Partition]) -> Vec<Partition> {
        partitions
            .iter()
            .filter(|partition| match self.partitions.get_mut(partition.partition_key()) {
                Some(mut entry) => {
                    if entry.revoked {
                        entry.revoked = false;
                        debug!(partition_key = %partition.partition_key(), "Revoked partition assigned back");
                    }
                    false
                }
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Admit a partition unleased and immediately eligible
    pub fn add_new_partition(&self, partition: Partition) {
        let key = partition.partition_key().to_string();
        self.committed
            .entry(key.clone())
            .or_insert(INVALID_OFFSET);
        self.partitions
            .entry(key)
            .or_insert_with(|| PartitionEntry::new(partition, Instant::now()));
    }

    /// Drop partitions regardless of lease state
    pub fn remove_partitions(&self, keys: &[String]) -> Vec<Partition> {
        keys.iter()
            .filter_map(|key| self.partitions.remove(key))
            .map(|(_, entry)| entry.partition)
            .collect()
    }

    /// Remove revoked partitions whose lease has ended or expired
    pub fn remove_revoked_partitions(&self) -> Vec<Partition> {
        let now = Instant::now();
        let lease_timeout = self.lease_timeout;
        let keys: Vec<String> = self
            .partitions
            .iter()
            .filter(|entry| entry.revoked && !entry.has_live_lease(now, lease_timeout))
            .map(|entry| entry.key().clone())
            .collect();
        keys.iter()
            .filter_map(|key| {
                self.partitions.remove_if(key, |_, entry| {
                    entry.revoked && !entry.has_live_lease(now, lease_timeout)
                })
            })
            .map(|(_, entry)| entry.partition)
            .collect()
    }

    /// Drop every partition, grouped by broker
    pub fn remove_all_partitions(&self) -> BTreeMap<Node, Vec<Partition>> {
        let keys: Vec<String> = self
            .partitions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed: BTreeMap<Node, Vec<Partition>> = BTreeMap::new();
        for partition in self.remove_partitions(&keys) {
            removed
                .entry(partition.broker.clone())
                .or_default()
                .push(partition);
        }
        removed
    }

    /// Whether this process has never registered `key` before
    pub fn is_first_register(&self, key: &str) -> bool {
        !self.committed.contains_key(key)
    }

    /// Aggregate precheck used before selection.
    ///
    /// With nothing eligible, `AllPartitionsInUse` wins over
    /// `AllPartitionsWaiting` as soon as any partition is leased.
    pub fn cur_consume_status(&self) -> Result<()> {
        let now = Instant::now();
        if self.partitions.is_empty() {
            return Err(LeasemqClientError::NoPartitionAssigned);
        }
        if self
            .partitions
            .iter()
            .any(|entry| entry.is_available(now, self.lease_timeout))
        {
            return Ok(());
        }
        Err(self.unavailable_reason(now))
    }

    fn unavailable_reason(&self, now: Instant) -> LeasemqClientError {
        if self.partitions.is_empty() {
            return LeasemqClientError::NoPartitionAssigned;
        }
        let any_in_use = self
            .partitions
            .iter()
            .any(|entry| entry.has_live_lease(now, self.lease_timeout));
        if any_in_use {
            LeasemqClientError::AllPartitionsInUse
        } else {
            LeasemqClientError::AllPartitionsWaiting
        }
    }

    /// Apply a default flow-control rule set if its id changed
    pub fn update_def_flow_ctrl_info(&self, id: i64, rules: &str) -> Result<bool> {
        self.flow_ctrl.write().update_default(id, rules)
    }

    /// Apply a group flow-control rule set if its id changed
    pub fn update_group_flow_ctrl_info(
        &self,
        qry_priority_id: i32,
        id: i64,
        rules: &str,
    ) -> Result<bool> {
        self.flow_ctrl
            .write()
            .update_group(qry_priority_id, id, rules)
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let mut partition_keys: Vec<String> = self
            .partitions
            .iter()
            .filter(|entry| !entry.revoked)
            .map(|entry| entry.key().clone())
            .collect();
        partition_keys.sort();

        let flow_ctrl = self.flow_ctrl.read();
        CacheSnapshot {
            partition_keys,
            def_flow_ctrl_id: flow_ctrl.default_rule_id(),
            group_flow_ctrl_id: flow_ctrl.group_rule_id(),
            qry_priority_id: flow_ctrl.qry_priority_id(),
        }
    }

    /// Last booked and last committed offset per registered partition
    pub fn consumed_info(&self) -> HashMap<String, ConsumedOffsets> {
        self.partitions
            .iter()
            .map(|entry| {
                let committed_offset = self
                    .committed
                    .get(entry.key())
                    .map_or(INVALID_OFFSET, |offset| *offset);
                (
                    entry.key().clone(),
                    ConsumedOffsets {
                        last_offset: entry.last_offset,
                        committed_offset,
                    },
                )
            })
            .collect()
    }

    /// Queue a rebalance event; the receiver resolves once it is processed
    pub fn offer_event(&self, event: ConsumerEvent) -> oneshot::Receiver<ConsumerEvent> {
        let (tx, rx) = oneshot::channel();
        self.pending_events.fetch_add(1, Ordering::AcqRel);
        let queued = QueuedEvent {
            event,
            waiter: Some(tx),
        };
        if let Err(mpsc::error::SendError(rejected)) = self.event_tx.send(queued) {
            self.pending_events.fetch_sub(1, Ordering::AcqRel);
            warn!(
                rebalance_id = rejected.event.rebalance_id,
                "Rebalance event dropped, event loop is gone"
            );
        }
        rx
    }

    /// Hand the queue's receiving end to the single event loop
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<QueuedEvent>> {
        self.event_rx.lock().take()
    }

    /// Acknowledge that a queued event was dispatched to the loop
    pub fn clear_event(&self) {
        let _ = self
            .pending_events
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn has_pending_event(&self) -> bool {
        self.pending_events.load(Ordering::Acquire) > 0
    }

    /// Publish a processed event to its waiter and to the result queue
    pub fn offer_event_result(&self, mut queued: QueuedEvent) {
        info!(
            rebalance_id = queued.event.rebalance_id,
            event_type = ?queued.event.event_type,
            status = ?queued.event.status,
            "Rebalance event processed"
        );
        self.event_results.lock().push_back(queued.event.clone());
        if let Some(waiter) = queued.waiter.take() {
            // the waiter may have stopped listening
            let _ = waiter.send(queued.event);
        }
    }

    /// Drain processed events for reporting to the coordinator
    pub fn take_event_results(&self) -> Vec<ConsumerEvent> {
        self.event_results.lock().drain(..).collect()
    }
}

fn wall_clock_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
