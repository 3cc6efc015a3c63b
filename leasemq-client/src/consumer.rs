//! Consumer orchestrator
//!
//! Drives coordinator registration, the fetch/confirm cycle and the
//! rebalance event loop on top of the [`PartitionLeaseCache`].
//!
//! ## Lifecycle
//!
//! `Unregistered -> RegisteringWithMaster -> Registered -> Closing -> Closed`
//!
//! Building a consumer registers it with a coordinator; a group- or
//! content-forbidden answer aborts the build, any other failure moves on to
//! the next coordinator candidate. Once registered, a background task drains
//! rebalance events until [`Consumer::close`] is called. Every operation after
//! close fails with [`LeasemqClientError::Closed`].

use dashmap::DashSet;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{ConsumedOffsets, PartitionLeaseCache, PartitionLease, QueuedEvent};
use crate::config::{ConsumePosition, ConsumerConfig};
use crate::error::{ErrorCode, FetchDisposition, LeasemqClientError};
use crate::gateway::{
    with_timeout, CoordinatorSelector, HeartbeatDriver, IpSelector, NoopHeartbeat, RpcGateway,
};
use crate::message::{decode_messages, Message};
use crate::metrics::{ClientMetrics, Timer};
use crate::protocol::{
    BrokerHeartbeatResponse, BrokerId, BrokerRegisterRequest, BrokerUnregisterRequest,
    CloseMasterRequest, CommitRequest, ConfirmContext, ConsumeData, ConsumerEvent, EventStatus,
    EventType, FetchRequest, FetchResponse, MasterHeartbeatResponse, Node, Partition,
    PartitionKey, ReadStatus, RegisterMasterRequest, RegisterMasterResponse, INVALID_OFFSET,
};
use crate::subscription::{ClientIdGenerator, SubscriptionInfo};
use crate::Result;

/// Backoff after a forbidden fetch
const FORBIDDEN_WAIT_MS: u64 = 2_000;
/// Backoff after a moved fetch
const MOVED_WAIT_MS: u64 = 200;
/// Backoff for every other throttling or unknown code
const DEFAULT_ERROR_WAIT_MS: u64 = 300;

/// Consumer lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Unregistered,
    RegisteringWithMaster,
    Registered,
    Closing,
    Closed,
}

impl ConsumerState {
    /// Validate whether a state transition is allowed.
    pub fn can_transition_to(&self, target: &ConsumerState) -> bool {
        matches!(
            (self, target),
            (ConsumerState::Unregistered, ConsumerState::RegisteringWithMaster)
                | (ConsumerState::RegisteringWithMaster, ConsumerState::Registered)
                | (ConsumerState::Registered, ConsumerState::Closing)
                // a failed registration or an explicit close
                | (ConsumerState::RegisteringWithMaster, ConsumerState::Closed)
                | (ConsumerState::Closing, ConsumerState::Closed)
        )
    }
}

/// Where a batch came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub broker_host: String,
    pub partition_id: u32,
    pub partition_key: String,
    pub curr_offset: i64,
}

impl PeerInfo {
    fn new(partition: &Partition, curr_offset: i64) -> Self {
        Self {
            broker_host: partition.broker.host.clone(),
            partition_id: partition.partition_id,
            partition_key: partition.partition_key().to_string(),
            curr_offset,
        }
    }
}

/// Result of a fetch or a confirm
#[derive(Debug, Clone)]
pub struct ConsumerResult {
    pub topic: String,
    /// Token to pass to [`Consumer::confirm`]
    pub confirm_context: String,
    pub peer_info: PeerInfo,
    pub messages: Vec<Message>,
}

struct ConsumerInner {
    config: ConsumerConfig,
    subscription: SubscriptionInfo,
    cache: PartitionLeaseCache,
    gateway: Arc<dyn RpcGateway>,
    selector: Arc<dyn CoordinatorSelector>,
    heartbeat: Arc<dyn HeartbeatDriver>,
    metrics: Arc<ClientMetrics>,
    state: RwLock<ConsumerState>,
    master: RwLock<Option<String>>,
    last_master_hb_ms: AtomicI64,
    /// Brokers this session has already authenticated against
    known_brokers: DashSet<BrokerId>,
}

/// Pull consumer with explicit confirmation
pub struct Consumer {
    inner: Arc<ConsumerInner>,
    shutdown: watch::Sender<bool>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Consumer {
    pub fn builder() -> ConsumerBuilder {
        ConsumerBuilder::new()
    }

    pub fn client_id(&self) -> &str {
        &self.inner.subscription.client_id
    }

    pub fn state(&self) -> ConsumerState {
        *self.inner.state.read()
    }

    /// Coordinator the session is registered with
    pub fn master_address(&self) -> Option<String> {
        self.inner.master.read().clone()
    }

    /// Wall-clock millis of the last successful coordinator exchange
    pub fn last_master_heartbeat_ms(&self) -> i64 {
        self.inner.last_master_hb_ms.load(Ordering::Acquire)
    }

    pub fn subscription(&self) -> &SubscriptionInfo {
        &self.inner.subscription
    }

    /// The lease cache, for the heartbeat driver's update and reporting paths
    pub fn lease_cache(&self) -> &PartitionLeaseCache {
        &self.inner.cache
    }

    pub fn metrics(&self) -> Arc<ClientMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Last booked and committed offsets of every registered partition
    pub fn current_consumed_info(&self) -> HashMap<String, ConsumedOffsets> {
        self.inner.cache.consumed_info()
    }

    /// Lease a partition and fetch a batch from its broker.
    ///
    /// Waits at most `max_part_check_period` for a partition to become
    /// eligible. The returned `confirm_context` must be passed to
    /// [`Consumer::confirm`] before the lease times out.
    pub async fn get_message(&self) -> Result<ConsumerResult> {
        self.inner.ensure_serving()?;
        self.inner.unregister_revoked().await;
        self.inner.wait_for_partition().await?;
        let lease = self.inner.cache.select_partition()?;
        self.inner.fetch(lease).await
    }

    /// Commit the batch identified by `confirm_context` and end its lease
    pub async fn confirm(&self, confirm_context: &str, consumed: bool) -> Result<ConsumerResult> {
        self.inner.ensure_serving()?;
        self.inner.confirm(confirm_context, consumed).await
    }

    /// Absorb a coordinator heartbeat reply.
    ///
    /// A carried rebalance event is queued; the returned receiver resolves
    /// once the event loop has processed it. A "node missing" reply
    /// re-registers the session.
    pub async fn process_master_heartbeat(
        &self,
        response: MasterHeartbeatResponse,
    ) -> Result<Option<oneshot::Receiver<ConsumerEvent>>> {
        self.inner.ensure_serving()?;
        if !response.success {
            let err = LeasemqClientError::server(response.err_code, response.err_msg);
            if err.error_code() == Some(ErrorCode::HbNoNode) {
                warn!(error = %err, "Coordinator lost this consumer, registering again");
                self.reregister_with_master().await?;
                return Ok(None);
            }
            return Err(err);
        }

        let inner = &self.inner;
        if response.not_allocated {
            inner.subscription.set_not_allocated(true);
        }
        inner.absorb_flow_ctrl(
            response.def_flow_check_id,
            &response.def_flow_control_info,
            response.qry_priority_id,
            response.group_flow_check_id,
            &response.group_flow_control_info,
        );
        if let Some(tokens) = response.authorized_info {
            inner.subscription.session.update_tokens(tokens);
        }
        if response.require_auth {
            inner.subscription.session.request_master_auth();
        }
        inner.touch_master_heartbeat();

        Ok(response.event.map(|event| {
            debug!(
                rebalance_id = event.rebalance_id,
                event_type = ?event.event_type,
                "Queued rebalance event from heartbeat"
            );
            inner.cache.offer_event(event)
        }))
    }

    /// Absorb a broker heartbeat reply; failed partitions are evicted
    pub fn process_broker_heartbeat(
        &self,
        broker: &Node,
        response: BrokerHeartbeatResponse,
    ) -> Result<()> {
        self.inner.ensure_serving()?;
        if response.require_auth {
            self.inner.subscription.session.request_broker_auth();
        }
        if !response.failed_partition_keys.is_empty() {
            let removed = self
                .inner
                .cache
                .remove_partitions(&response.failed_partition_keys);
            self.inner.metrics.record_evictions(removed.len() as u64);
            warn!(
                broker = %broker.address(),
                evicted = removed.len(),
                "Broker reported failed partitions"
            );
        }
        if response.success {
            Ok(())
        } else {
            Err(LeasemqClientError::server(response.err_code, response.err_msg))
        }
    }

    /// Register with a coordinator again, e.g. after it lost this node
    pub async fn reregister_with_master(&self) -> Result<()> {
        self.inner.ensure_serving()?;
        let address = self.inner.register_with_master().await?;
        self.inner.heartbeat.register_master(&address);
        Ok(())
    }

    /// Stop the event loop, leave the coordinator and every broker.
    ///
    /// Coordinator and broker notifications are best-effort. Calling close
    /// again is a no-op.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.write();
            if matches!(*state, ConsumerState::Closing | ConsumerState::Closed) {
                return Ok(());
            }
            *state = ConsumerState::Closing;
        }
        info!(client_id = %self.client_id(), "Closing consumer");

        let _ = self.shutdown.send(true);
        let handle = self.event_loop.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Rebalance event loop ended abnormally");
            }
        }

        self.inner.close_with_master().await;

        let removed = self.inner.cache.remove_all_partitions();
        let inner = &self.inner;
        join_all(
            removed
                .into_values()
                .flatten()
                .map(|partition| inner.unregister_partition(partition)),
        )
        .await;

        self.inner.heartbeat.close();
        self.inner.gateway.close().await;
        self.inner.set_state(ConsumerState::Closed);
        info!(client_id = %self.client_id(), "Consumer closed");
        Ok(())
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        // stops the event loop if close was never called
        let _ = self.shutdown.send(true);
    }
}

impl ConsumerInner {
    fn set_state(&self, target: ConsumerState) {
        let mut state = self.state.write();
        if !state.can_transition_to(&target) {
            warn!(from = ?*state, to = ?target, "Unexpected consumer state transition");
        }
        debug!(from = ?*state, to = ?target, "Consumer state transition");
        *state = target;
    }

    fn ensure_serving(&self) -> Result<()> {
        match *self.state.read() {
            ConsumerState::Registered => Ok(()),
            _ => Err(LeasemqClientError::Closed),
        }
    }

    fn touch_master_heartbeat(&self) {
        self.last_master_hb_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Release);
    }

    /// Try coordinator candidates until one accepts, a forbidden answer
    /// arrives, or a full pass over the candidates fails
    async fn register_with_master(&self) -> Result<String> {
        self.selector.reset();
        loop {
            let node = self.selector.select(&self.config.masters)?;
            match self.register_once(&node.address).await {
                Ok(()) => {
                    info!(
                        master = %node.address,
                        client_id = %self.subscription.client_id,
                        "Registered with coordinator"
                    );
                    *self.master.write() = Some(node.address.clone());
                    return Ok(node.address);
                }
                Err(e)
                    if e
                        .error_code()
                        .is_some_and(ErrorCode::is_fatal_to_subscription) =>
                {
                    error!(master = %node.address, error = %e, "Registration forbidden");
                    return Err(e);
                }
                Err(e) => {
                    warn!(master = %node.address, error = %e, "Registration with coordinator failed");
                    if !node.has_next {
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn register_once(&self, address: &str) -> Result<()> {
        let request = RegisterMasterRequest {
            client_id: self.subscription.client_id.clone(),
            group: self.subscription.group.clone(),
            local_host: self.config.net.local_host.clone(),
            topics: self.subscription.topics.clone(),
            topic_filters: self.subscription.topic_filter_lists(),
            certificate: self.subscription.session.gen_master_certificate(true),
            snapshot: self.cache.snapshot(),
        };
        let response = with_timeout(
            self.config.net.read_timeout(),
            self.gateway.register_with_coordinator(address, request),
        )
        .await?;
        if !response.success {
            return Err(LeasemqClientError::server(
                response.err_code,
                response.err_msg,
            ));
        }
        self.absorb_register_response(response);
        Ok(())
    }

    fn absorb_register_response(&self, response: RegisterMasterResponse) {
        // only a set flag is absorbed
        if response.not_allocated {
            self.subscription.set_not_allocated(true);
        }
        self.absorb_flow_ctrl(
            response.def_flow_check_id,
            &response.def_flow_control_info,
            response.qry_priority_id,
            response.group_flow_check_id,
            &response.group_flow_control_info,
        );
        if let Some(tokens) = response.authorized_info {
            self.subscription.session.update_tokens(tokens);
        }
        self.touch_master_heartbeat();
    }

    /// Rule ids of zero mean "no update"
    fn absorb_flow_ctrl(
        &self,
        def_id: i64,
        def_rules: &str,
        qry_priority_id: i32,
        group_id: i64,
        group_rules: &str,
    ) {
        if def_id != 0 {
            if let Err(e) = self.cache.update_def_flow_ctrl_info(def_id, def_rules) {
                warn!(rule_id = def_id, error = %e, "Ignoring malformed default flow control rules");
            }
        }
        if group_id != 0 {
            if let Err(e) = self
                .cache
                .update_group_flow_ctrl_info(qry_priority_id, group_id, group_rules)
            {
                warn!(rule_id = group_id, error = %e, "Ignoring malformed group flow control rules");
            }
        }
    }

    /// Poll the aggregate status until a partition is eligible or the
    /// check period runs out
    async fn wait_for_partition(&self) -> Result<()> {
        let started = tokio::time::Instant::now();
        loop {
            match self.cache.cur_consume_status() {
                Ok(()) => return Ok(()),
                Err(e) if started.elapsed() >= self.config.max_part_check_period() => {
                    return Err(e)
                }
                Err(_) => {}
            }
            tokio::time::sleep(self.config.part_check_slice()).await;
            self.ensure_serving()?;
        }
    }

    async fn fetch(&self, lease: PartitionLease) -> Result<ConsumerResult> {
        let PartitionLease {
            partition,
            confirm_context,
            last_consumed,
        } = lease;
        let filtered = self.subscription.is_filtered(&partition.topic);
        let request = FetchRequest {
            partition: partition.clone(),
            group: self.subscription.group.clone(),
            client_id: self.subscription.client_id.clone(),
            last_consumed,
            tokens: self.subscription.session.tokens(),
            snapshot: self.cache.snapshot(),
        };

        let timer = Timer::start();
        let response = match with_timeout(
            self.config.net.read_timeout(),
            self.gateway.fetch(request),
        )
        .await
        {
            Ok(response) => response,
            Err(e) => {
                self.metrics.record_fetch_error();
                debug!(
                    partition_key = %confirm_context.partition_key,
                    error = %e,
                    "Fetch failed, releasing partition"
                );
                if let Err(release_err) = self
                    .release_lease(false, filtered, &confirm_context, false)
                    .await
                {
                    debug!(error = %release_err, "Lease already gone after failed fetch");
                }
                return Err(e);
            }
        };

        self.process_fetch_response(partition, confirm_context, filtered, response, timer)
            .await
    }

    /// End a lease and unregister the partition if the coordinator revoked it
    /// while it was leased
    async fn release_lease(
        &self,
        success: bool,
        filtered: bool,
        confirm_context: &ConfirmContext,
        consumed: bool,
    ) -> Result<()> {
        let revoked = self
            .cache
            .release_partition(success, filtered, confirm_context, consumed)?;
        if let Some(partition) = revoked {
            self.unregister_partition(partition).await;
        }
        Ok(())
    }

    /// Unregister revoked partitions whose lease expired unconfirmed
    async fn unregister_revoked(&self) {
        let revoked = self.cache.remove_revoked_partitions();
        if revoked.is_empty() {
            return;
        }
        info!(count = revoked.len(), "Removing revoked partitions with expired leases");
        join_all(
            revoked
                .into_iter()
                .map(|partition| self.unregister_partition(partition)),
        )
        .await;
    }

    async fn process_fetch_response(
        &self,
        partition: Partition,
        confirm_context: ConfirmContext,
        filtered: bool,
        response: FetchResponse,
        timer: Timer,
    ) -> Result<ConsumerResult> {
        let key = partition.partition_key().to_string();
        let code = if response.success {
            ErrorCode::Success
        } else {
            ErrorCode::from(response.err_code)
        };
        let now_ms = chrono::Utc::now().timestamp_millis();

        match code.fetch_disposition() {
            FetchDisposition::Success => {
                let batch = decode_messages(
                    &partition.topic,
                    response.messages,
                    self.subscription.filters(&partition.topic),
                );
                self.metrics.record_dropped(
                    batch.checksum_mismatches + batch.malformed,
                    batch.filtered_out,
                );
                self.metrics.record_fetch(
                    batch.messages.len() as u64,
                    batch.bytes,
                    timer.elapsed(),
                );

                let curr_offset = if response.curr_offset >= 0 {
                    response.curr_offset
                } else {
                    INVALID_OFFSET
                };
                self.cache.book_partition_info(&key, curr_offset);
                self.cache.book_consume_data(
                    &key,
                    ConsumeData::success(
                        now_ms,
                        response.esc_flow_ctrl,
                        batch.bytes,
                        response.curr_data_dlt.max(-1),
                        response.require_slow,
                    ),
                );
                debug!(
                    partition_key = %key,
                    messages = batch.messages.len(),
                    bytes = batch.bytes,
                    "Fetched batch"
                );

                Ok(ConsumerResult {
                    topic: partition.topic.clone(),
                    confirm_context: confirm_context.to_string(),
                    peer_info: PeerInfo::new(&partition, curr_offset),
                    messages: batch.messages,
                })
            }
            FetchDisposition::Evict => {
                self.metrics.record_fetch_error();
                let removed = self.cache.remove_partitions(&[key.clone()]);
                self.metrics.record_evictions(removed.len() as u64);
                warn!(
                    partition_key = %key,
                    code = response.err_code,
                    "Evicting partition after fetch error"
                );
                Err(LeasemqClientError::server(
                    response.err_code,
                    response.err_msg,
                ))
            }
            FetchDisposition::Backoff => {
                self.metrics.record_fetch_error();
                let wait_ms = self.error_wait_ms(code, response.min_limit_time_ms);
                self.cache.book_consume_data(
                    &key,
                    ConsumeData::throttled(now_ms, code, wait_ms, response.require_slow),
                );
                if let Err(e) = self
                    .release_lease(true, filtered, &confirm_context, false)
                    .await
                {
                    debug!(partition_key = %key, error = %e, "Lease already gone after throttled fetch");
                }
                debug!(
                    partition_key = %key,
                    code = response.err_code,
                    wait_ms,
                    "Fetch throttled"
                );
                Err(LeasemqClientError::server(
                    response.err_code,
                    response.err_msg,
                ))
            }
        }
    }

    fn error_wait_ms(&self, code: ErrorCode, server_wait_ms: i64) -> u64 {
        match code {
            ErrorCode::ConsumeSpeedLimit if server_wait_ms > 0 => server_wait_ms as u64,
            ErrorCode::ConsumeSpeedLimit | ErrorCode::NotFound => {
                self.config.msg_not_found_wait_ms
            }
            ErrorCode::Forbidden => FORBIDDEN_WAIT_MS,
            ErrorCode::Moved => MOVED_WAIT_MS,
            _ => DEFAULT_ERROR_WAIT_MS,
        }
    }

    async fn confirm(&self, token: &str, consumed: bool) -> Result<ConsumerResult> {
        let context = ConfirmContext::parse(token)?;
        let key = context.partition_key.as_str();
        let topic = PartitionKey::topic_of(key)?.to_string();

        // pins the lease until it is released below
        let partition = self
            .cache
            .begin_confirm(&context)
            .inspect_err(|_| self.metrics.record_confirm_timeout())?;
        let filtered = self.subscription.is_filtered(&topic);

        let request = CommitRequest {
            partition: partition.clone(),
            group: self.subscription.group.clone(),
            client_id: self.subscription.client_id.clone(),
            last_consumed: consumed,
            tokens: self.subscription.session.tokens(),
        };
        let outcome = with_timeout(
            self.config.net.confirm_timeout(),
            self.gateway.commit_offset(request),
        )
        .await
        .and_then(|response| {
            if response.success {
                Ok(response)
            } else {
                Err(LeasemqClientError::server(
                    response.err_code,
                    response.err_msg,
                ))
            }
        });

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                warn!(partition_key = %key, error = %e, "Commit failed, releasing partition");
                if let Err(release_err) =
                    self.release_lease(false, filtered, &context, false).await
                {
                    debug!(error = %release_err, "Lease already gone after failed commit");
                }
                return Err(e);
            }
        };

        self.cache.book_partition_info(key, response.curr_offset);
        self.release_lease(true, filtered, &context, consumed)
            .await?;
        self.metrics.record_confirm();
        debug!(partition_key = %key, consumed, offset = response.curr_offset, "Confirmed batch");

        Ok(ConsumerResult {
            topic,
            confirm_context: token.to_string(),
            peer_info: PeerInfo::new(&partition, response.curr_offset),
            messages: Vec::new(),
        })
    }

    async fn process_event(&self, event: &mut ConsumerEvent) {
        self.metrics.record_rebalance_event();
        match event.event_type {
            EventType::Disconnect | EventType::OnlyDisconnect => {
                self.disconnect_brokers(&event.partitions).await
            }
            EventType::Connect | EventType::OnlyConnect => {
                self.connect_brokers(&event.partitions).await
            }
        }
        event.status = EventStatus::Done;
    }

    async fn disconnect_brokers(&self, partitions: &[Partition]) {
        if partitions.is_empty() {
            return;
        }
        let removed = self
            .cache
            .remove_and_get_partitions(partitions, self.config.rollback_if_confirm_timeout);
        let count: usize = removed.values().map(Vec::len).sum();
        info!(
            requested = partitions.len(),
            removed = count,
            brokers = removed.len(),
            "Processed disconnect event"
        );
        join_all(
            removed
                .into_values()
                .flatten()
                .map(|partition| self.unregister_partition(partition)),
        )
        .await;
    }

    async fn connect_brokers(&self, partitions: &[Partition]) {
        let pending = self.cache.filter_partitions(partitions);
        let mut admitted = 0usize;
        for partition in pending {
            if let Err(e) = self.register_partition(&partition).await {
                // the rest of the batch waits for the next rebalance
                warn!(
                    partition_key = %partition.partition_key(),
                    broker = %partition.broker.address(),
                    error = %e,
                    "Broker registration failed, stopping connect batch"
                );
                self.metrics.record_broker_register_failure();
                break;
            }
            self.cache.add_new_partition(partition.clone());
            self.heartbeat.register_broker(&partition.broker);
            admitted += 1;
        }
        self.subscription.mark_first_registered();
        info!(
            requested = partitions.len(),
            admitted,
            "Processed connect event"
        );
    }

    fn read_status(&self, first_register: bool) -> ReadStatus {
        if !first_register {
            return ReadStatus::Normal;
        }
        match self.config.consume_position {
            ConsumePosition::FromFirstOffset => ReadStatus::Normal,
            ConsumePosition::FromLatestOffset => ReadStatus::FromMax,
            ConsumePosition::FromMaxOffsetAlways => ReadStatus::FromMaxAlways,
        }
    }

    async fn register_partition(&self, partition: &Partition) -> Result<()> {
        let first_register = self.cache.is_first_register(partition.partition_key());
        let first_contact = self.known_brokers.insert(partition.broker.id);
        let request = BrokerRegisterRequest {
            partition: partition.clone(),
            group: self.subscription.group.clone(),
            client_id: self.subscription.client_id.clone(),
            local_host: self.config.net.local_host.clone(),
            read_status: self.read_status(first_register),
            filter_items: self
                .subscription
                .filters(&partition.topic)
                .map(|filters| filters.iter().cloned().collect())
                .unwrap_or_default(),
            auth_token: self.subscription.session.gen_broker_auth(first_contact),
            tokens: self.subscription.session.tokens(),
        };

        let result = with_timeout(
            self.config.net.read_timeout(),
            self.gateway.register_with_broker(request),
        )
        .await
        .and_then(|response| response.into_result());

        if result.is_err() && first_contact {
            self.known_brokers.remove(&partition.broker.id);
        }
        result
    }

    async fn unregister_partition(&self, partition: Partition) {
        let key = partition.partition_key().to_string();
        let broker = partition.broker.address();
        let request = BrokerUnregisterRequest {
            partition,
            group: self.subscription.group.clone(),
            client_id: self.subscription.client_id.clone(),
            tokens: self.subscription.session.tokens(),
        };
        let result = with_timeout(
            self.config.net.read_timeout(),
            self.gateway.unregister_with_broker(request),
        )
        .await
        .and_then(|response| response.into_result());

        match result {
            Ok(()) => debug!(partition_key = %key, broker = %broker, "Unregistered partition"),
            Err(e) => warn!(
                partition_key = %key,
                broker = %broker,
                error = %e,
                "Failed to unregister partition"
            ),
        }
    }

    async fn close_with_master(&self) {
        let Some(address) = self.master.read().clone() else {
            return;
        };
        let request = CloseMasterRequest {
            client_id: self.subscription.client_id.clone(),
            group: self.subscription.group.clone(),
            certificate: self.subscription.session.gen_master_certificate(false),
        };
        let result = with_timeout(
            self.config.net.read_timeout(),
            self.gateway.close_with_coordinator(&address, request),
        )
        .await
        .and_then(|response| response.into_result());

        match result {
            Ok(()) => debug!(master = %address, "Left coordinator"),
            Err(e) => warn!(master = %address, error = %e, "Failed to notify coordinator of close"),
        }
    }
}

async fn run_event_loop(
    inner: Arc<ConsumerInner>,
    mut events: mpsc::UnboundedReceiver<QueuedEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(client_id = %inner.subscription.client_id, "Rebalance event loop started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            queued = events.recv() => {
                let Some(mut queued) = queued else {
                    break;
                };
                inner.cache.clear_event();
                inner.process_event(&mut queued.event).await;
                inner.cache.offer_event_result(queued);
            }
        }
    }
    info!(client_id = %inner.subscription.client_id, "Rebalance event loop stopped");
}

/// Builder for Consumer
pub struct ConsumerBuilder {
    config: ConsumerConfig,
    gateway: Option<Arc<dyn RpcGateway>>,
    selector: Option<Arc<dyn CoordinatorSelector>>,
    heartbeat: Option<Arc<dyn HeartbeatDriver>>,
    id_generator: Option<Arc<ClientIdGenerator>>,
}

impl ConsumerBuilder {
    /// Create a new consumer builder
    pub fn new() -> Self {
        Self {
            config: ConsumerConfig::default(),
            gateway: None,
            selector: None,
            heartbeat: None,
            id_generator: None,
        }
    }

    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the transport used for every coordinator and broker call
    pub fn gateway(mut self, gateway: Arc<dyn RpcGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Defaults to a round-robin [`IpSelector`]
    pub fn selector(mut self, selector: Arc<dyn CoordinatorSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn heartbeat(mut self, heartbeat: Arc<dyn HeartbeatDriver>) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    /// Share a client-id generator between consumers of one process
    pub fn id_generator(mut self, id_generator: Arc<ClientIdGenerator>) -> Self {
        self.id_generator = Some(id_generator);
        self
    }

    /// Register with a coordinator and start the rebalance event loop
    pub async fn build(self) -> Result<Consumer> {
        self.config.validate()?;
        let gateway = self
            .gateway
            .ok_or_else(|| LeasemqClientError::invalid_config("an RPC gateway is required"))?;
        let id_generator = self
            .id_generator
            .unwrap_or_else(|| Arc::new(ClientIdGenerator::new(self.config.net.local_host.clone())));
        let client_id = id_generator.next_id(&self.config.group);

        let inner = Arc::new(ConsumerInner {
            subscription: SubscriptionInfo::new(&self.config, client_id),
            cache: PartitionLeaseCache::from_config(&self.config),
            gateway,
            selector: self.selector.unwrap_or_else(|| Arc::new(IpSelector::new())),
            heartbeat: self.heartbeat.unwrap_or_else(|| Arc::new(NoopHeartbeat)),
            metrics: Arc::new(ClientMetrics::new()),
            state: RwLock::new(ConsumerState::Unregistered),
            master: RwLock::new(None),
            last_master_hb_ms: AtomicI64::new(0),
            known_brokers: DashSet::new(),
            config: self.config,
        });

        inner.set_state(ConsumerState::RegisteringWithMaster);
        let address = match inner.register_with_master().await {
            Ok(address) => address,
            Err(e) => {
                inner.set_state(ConsumerState::Closed);
                inner.gateway.close().await;
                return Err(e);
            }
        };
        inner.set_state(ConsumerState::Registered);
        inner.heartbeat.register_master(&address);

        let events = inner.cache.take_event_receiver().ok_or_else(|| {
            LeasemqClientError::invalid_config("rebalance event queue already taken")
        })?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_event_loop(Arc::clone(&inner), events, shutdown_rx));

        Ok(Consumer {
            inner,
            shutdown,
            event_loop: Mutex::new(Some(handle)),
        })
    }
}

impl Default for ConsumerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
