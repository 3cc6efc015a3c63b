//! Scripted in-process gateway shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use leasemq_client::message::checksum;
use leasemq_client::protocol::{
    BrokerRegisterRequest, BrokerUnregisterRequest, CloseMasterRequest, CommitRequest,
    CommitResponse, ConsumerEvent, EventType, FetchRequest, FetchResponse, Node, Partition,
    RegisterMasterRequest, RegisterMasterResponse, RpcResponse, TransferredMessage,
};
use leasemq_client::{
    Consumer, ConsumerConfig, ConsumerConfigBuilder, LeasemqClientError, Result, RpcGateway,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct MockState {
    /// Responses popped per coordinator registration; empty means success
    pub register_script: VecDeque<RegisterMasterResponse>,
    pub register_calls: Vec<String>,
    /// Responses popped per fetch of a partition key; empty means one message
    pub fetch_script: HashMap<String, VecDeque<FetchResponse>>,
    pub fetch_calls: Vec<FetchRequest>,
    pub fetch_offsets: HashMap<String, i64>,
    pub commits: Vec<CommitRequest>,
    /// Answer every commit with a failed response
    pub fail_commit: bool,
    pub broker_registers: Vec<BrokerRegisterRequest>,
    pub failing_partitions: HashSet<String>,
    pub unregisters: Vec<String>,
    pub close_master_calls: usize,
    pub fail_close_master: bool,
    pub closed: bool,
}

#[derive(Debug, Default)]
pub struct MockGateway {
    pub state: Mutex<MockState>,
    pub fetch_delay: Duration,
    pub commit_delay: Duration,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_fetch_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            fetch_delay: delay,
            ..Self::default()
        })
    }

    pub fn with_commit_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            commit_delay: delay,
            ..Self::default()
        })
    }

    pub fn script_register(&self, response: RegisterMasterResponse) {
        self.state.lock().register_script.push_back(response);
    }

    pub fn script_fetch(&self, partition_key: &str, response: FetchResponse) {
        self.state
            .lock()
            .fetch_script
            .entry(partition_key.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn fail_broker_register(&self, partition_key: &str) {
        self.state
            .lock()
            .failing_partitions
            .insert(partition_key.to_string());
    }

    pub fn commits_for(&self, partition_key: &str) -> usize {
        self.state
            .lock()
            .commits
            .iter()
            .filter(|commit| commit.partition.partition_key() == partition_key)
            .count()
    }
}

#[async_trait]
impl RpcGateway for MockGateway {
    async fn register_with_coordinator(
        &self,
        address: &str,
        _request: RegisterMasterRequest,
    ) -> Result<RegisterMasterResponse> {
        let mut state = self.state.lock();
        state.register_calls.push(address.to_string());
        Ok(state
            .register_script
            .pop_front()
            .unwrap_or_else(register_ok))
    }

    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        let key = request.partition.partition_key().to_string();
        let mut state = self.state.lock();
        state.fetch_calls.push(request);
        if let Some(response) = state
            .fetch_script
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return Ok(response);
        }

        let offset = state.fetch_offsets.entry(key.clone()).or_insert(0);
        *offset += 1;
        let payload = Bytes::from(format!("payload-{}-{}", key, offset));
        Ok(fetch_ok(vec![message(*offset, payload)], *offset))
    }

    async fn commit_offset(&self, request: CommitRequest) -> Result<CommitResponse> {
        if !self.commit_delay.is_zero() {
            tokio::time::sleep(self.commit_delay).await;
        }
        let mut state = self.state.lock();
        if state.fail_commit {
            return Ok(CommitResponse {
                success: false,
                err_code: 500,
                err_msg: "commit rejected".to_string(),
                curr_offset: -1,
            });
        }
        let curr_offset = state
            .fetch_offsets
            .get(request.partition.partition_key())
            .copied()
            .unwrap_or(0);
        state.commits.push(request);
        Ok(CommitResponse {
            success: true,
            err_code: 200,
            err_msg: String::new(),
            curr_offset,
        })
    }

    async fn register_with_broker(&self, request: BrokerRegisterRequest) -> Result<RpcResponse> {
        let mut state = self.state.lock();
        let failing = state
            .failing_partitions
            .contains(request.partition.partition_key());
        state.broker_registers.push(request);
        if failing {
            Ok(RpcResponse::failed(503, "broker unavailable"))
        } else {
            Ok(RpcResponse::ok())
        }
    }

    async fn unregister_with_broker(&self, request: BrokerUnregisterRequest) -> Result<RpcResponse> {
        self.state
            .lock()
            .unregisters
            .push(request.partition.partition_key().to_string());
        Ok(RpcResponse::ok())
    }

    async fn close_with_coordinator(
        &self,
        _address: &str,
        _request: CloseMasterRequest,
    ) -> Result<RpcResponse> {
        let mut state = self.state.lock();
        state.close_master_calls += 1;
        if state.fail_close_master {
            return Err(LeasemqClientError::connection("coordinator unreachable"));
        }
        Ok(RpcResponse::ok())
    }

    async fn close(&self) {
        self.state.lock().closed = true;
    }
}

pub fn register_ok() -> RegisterMasterResponse {
    RegisterMasterResponse {
        success: true,
        err_code: 200,
        ..Default::default()
    }
}

pub fn register_failed(code: i32) -> RegisterMasterResponse {
    RegisterMasterResponse {
        success: false,
        err_code: code,
        err_msg: format!("rejected with {}", code),
        ..Default::default()
    }
}

pub fn fetch_ok(messages: Vec<TransferredMessage>, curr_offset: i64) -> FetchResponse {
    FetchResponse {
        success: true,
        err_code: 200,
        messages,
        curr_offset,
        curr_data_dlt: -1,
        ..Default::default()
    }
}

pub fn fetch_failed(code: i32, min_limit_time_ms: i64) -> FetchResponse {
    FetchResponse {
        success: false,
        err_code: code,
        err_msg: format!("fetch failed with {}", code),
        min_limit_time_ms,
        curr_offset: -1,
        curr_data_dlt: -1,
        ..Default::default()
    }
}

pub fn message(id: i64, payload: Bytes) -> TransferredMessage {
    TransferredMessage {
        message_id: id,
        flag: 0,
        checksum: checksum(&payload),
        payload,
    }
}

pub fn partition(broker: u32, topic: &str, id: u32) -> Partition {
    Partition::new(Node::new(broker, format!("10.0.0.{}", broker), 8123), topic, id)
}

pub fn config() -> ConsumerConfigBuilder {
    ConsumerConfig::builder()
        .masters(vec!["m1:8715", "m2:8715"])
        .group("test-group")
        .topics(vec!["orders"])
        .max_part_check_period(Duration::ZERO)
        .part_check_slice(Duration::from_millis(10))
}

pub async fn consumer(gateway: &Arc<MockGateway>, config: ConsumerConfig) -> Consumer {
    Consumer::builder()
        .config(config)
        .gateway(gateway.clone())
        .build()
        .await
        .expect("consumer should register")
}

/// Push an event through the rebalance loop and wait until it is processed
pub async fn rebalance(
    consumer: &Consumer,
    event_type: EventType,
    partitions: Vec<Partition>,
) -> ConsumerEvent {
    consumer
        .lease_cache()
        .offer_event(ConsumerEvent::new(1, event_type, partitions))
        .await
        .expect("event loop should answer")
}
