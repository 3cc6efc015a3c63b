//! Protocol types shared by the lease cache, the consumer and the gateway
//!
//! Wire encoding is the gateway's business; these are the typed values that
//! cross that boundary.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{ErrorCode, LeasemqClientError};

pub type TopicName = String;
pub type PartitionId = u32;
pub type BrokerId = u32;

/// Offset value used when the server did not report one
pub const INVALID_OFFSET: i64 = -2;

/// A broker serving partitions
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Node {
    pub id: BrokerId,
    pub host: String,
    pub port: u16,
}

impl Node {
    pub fn new<S: Into<String>>(id: BrokerId, host: S, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.id, self.host, self.port)
    }
}

/// Structured partition key, `broker_id:topic:partition_id` on the wire
///
/// Parsing splits on the first and the last ':' so topics that contain ':'
/// still round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub broker_id: BrokerId,
    pub topic: TopicName,
    pub partition_id: PartitionId,
}

impl PartitionKey {
    /// Extract only the topic segment of a wire key
    pub fn topic_of(key: &str) -> Result<&str, LeasemqClientError> {
        let (_, rest) = key.split_once(':').ok_or_else(|| {
            LeasemqClientError::bad_request("unregular partition key value format")
        })?;
        let (topic, _) = rest.rsplit_once(':').ok_or_else(|| {
            LeasemqClientError::bad_request("unregular partition key topic format")
        })?;
        if topic.is_empty() {
            return Err(LeasemqClientError::bad_request(
                "partition key has an empty topic",
            ));
        }
        Ok(topic)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.broker_id, self.topic, self.partition_id)
    }
}

impl FromStr for PartitionKey {
    type Err = LeasemqClientError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let topic = PartitionKey::topic_of(key)?;
        let (broker, _) = key
            .split_once(':')
            .ok_or_else(|| LeasemqClientError::bad_request("missing broker segment"))?;
        let (_, partition) = key
            .rsplit_once(':')
            .ok_or_else(|| LeasemqClientError::bad_request("missing partition segment"))?;

        let broker_id = broker.parse().map_err(|_| {
            LeasemqClientError::bad_request(format!("invalid broker id '{}'", broker))
        })?;
        let partition_id = partition.parse().map_err(|_| {
            LeasemqClientError::bad_request(format!("invalid partition id '{}'", partition))
        })?;

        Ok(Self {
            broker_id,
            topic: topic.to_string(),
            partition_id,
        })
    }
}

/// An assigned partition together with the broker that serves it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    pub broker: Node,
    pub topic: TopicName,
    pub partition_id: PartitionId,
    key: String,
}

impl Partition {
    pub fn new<T: Into<TopicName>>(broker: Node, topic: T, partition_id: PartitionId) -> Self {
        let topic = topic.into();
        let key = PartitionKey {
            broker_id: broker.id,
            topic: topic.clone(),
            partition_id,
        }
        .to_string();
        Self {
            broker,
            topic,
            partition_id,
            key,
        }
    }

    /// Unique key per broker, topic and partition ordinal
    pub fn partition_key(&self) -> &str {
        &self.key
    }
}

/// Confirm token: `<partition_key>@<lease_time_ms>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmContext {
    pub partition_key: String,
    pub lease_time_ms: i64,
}

impl ConfirmContext {
    pub fn new<S: Into<String>>(partition_key: S, lease_time_ms: i64) -> Self {
        Self {
            partition_key: partition_key.into(),
            lease_time_ms,
        }
    }

    /// Decompose a token; anything malformed is a bad request
    pub fn parse(token: &str) -> Result<Self, LeasemqClientError> {
        let (key, time) = token.rsplit_once('@').ok_or_else(|| {
            LeasemqClientError::bad_request("illegal confirm_context: missing '@'")
        })?;
        if key.is_empty() {
            return Err(LeasemqClientError::bad_request(
                "illegal confirm_context: empty partition key",
            ));
        }
        let lease_time_ms = time.parse::<i64>().map_err(|_| {
            LeasemqClientError::bad_request(format!(
                "illegal confirm_context: invalid timestamp '{}'",
                time
            ))
        })?;
        Ok(Self::new(key, lease_time_ms))
    }
}

impl fmt::Display for ConfirmContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition_key, self.lease_time_ms)
    }
}

/// Flow-control snapshot booked after every fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeData {
    pub time_ms: i64,
    pub err_code: ErrorCode,
    pub esc_flow_ctrl: bool,
    pub msg_size: u64,
    /// Minimum wait before the partition may be fetched again
    pub dlt_limit_ms: u64,
    /// Backlog delta reported by the broker, negative when unknown
    pub cur_data_dlt: i64,
    pub require_slow: bool,
}

impl ConsumeData {
    pub fn success(
        time_ms: i64,
        esc_flow_ctrl: bool,
        msg_size: u64,
        cur_data_dlt: i64,
        require_slow: bool,
    ) -> Self {
        Self {
            time_ms,
            err_code: ErrorCode::Success,
            esc_flow_ctrl,
            msg_size,
            dlt_limit_ms: 0,
            cur_data_dlt,
            require_slow,
        }
    }

    pub fn throttled(time_ms: i64, err_code: ErrorCode, wait_ms: u64, require_slow: bool) -> Self {
        Self {
            time_ms,
            err_code,
            esc_flow_ctrl: false,
            msg_size: 0,
            dlt_limit_ms: wait_ms,
            cur_data_dlt: -1,
            require_slow,
        }
    }

    pub fn is_success(&self) -> bool {
        self.err_code == ErrorCode::Success
    }
}

/// Rebalance instruction kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Connect,
    Disconnect,
    OnlyConnect,
    OnlyDisconnect,
}

impl EventType {
    pub fn is_connect(self) -> bool {
        matches!(self, EventType::Connect | EventType::OnlyConnect)
    }
}

/// Completion state of a rebalance event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventStatus {
    #[default]
    Pending,
    Done,
}

/// A coordinator-issued partition set change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerEvent {
    /// Coordinator rebalance id, echoed back when the result is reported
    pub rebalance_id: i64,
    pub event_type: EventType,
    pub partitions: Vec<Partition>,
    pub status: EventStatus,
}

impl ConsumerEvent {
    pub fn new(rebalance_id: i64, event_type: EventType, partitions: Vec<Partition>) -> Self {
        Self {
            rebalance_id,
            event_type,
            partitions,
            status: EventStatus::Pending,
        }
    }
}

/// Initial read-position directive sent with a broker registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Normal = 0,
    FromMax = 1,
    FromMaxAlways = 2,
}

/// Rotating tokens issued by the coordinator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizedTokens {
    pub visit_token: i64,
    pub auth_authorized_token: String,
}

/// Authentication attached to coordinator requests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MasterCertificate {
    pub user_name: Option<String>,
    pub auth_token: Option<String>,
}

/// Read-only view of the cache included in coordinator and fetch requests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub partition_keys: Vec<String>,
    pub def_flow_ctrl_id: i64,
    pub group_flow_ctrl_id: i64,
    pub qry_priority_id: i32,
}

/// Message as transmitted by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferredMessage {
    pub message_id: i64,
    pub flag: i32,
    pub checksum: i32,
    pub payload: Bytes,
}

/// Uniform failure envelope for calls without a richer response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcResponse {
    pub success: bool,
    pub err_code: i32,
    pub err_msg: String,
}

impl RpcResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            err_code: ErrorCode::Success.code(),
            err_msg: String::new(),
        }
    }

    pub fn failed<S: Into<String>>(err_code: i32, err_msg: S) -> Self {
        Self {
            success: false,
            err_code,
            err_msg: err_msg.into(),
        }
    }

    /// Turn a failed envelope into an error
    pub fn into_result(self) -> Result<(), LeasemqClientError> {
        if self.success {
            Ok(())
        } else {
            Err(LeasemqClientError::server(self.err_code, self.err_msg))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMasterRequest {
    pub client_id: String,
    pub group: String,
    pub local_host: String,
    pub topics: Vec<TopicName>,
    pub topic_filters: HashMap<TopicName, Vec<String>>,
    pub certificate: MasterCertificate,
    pub snapshot: CacheSnapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterMasterResponse {
    pub success: bool,
    pub err_code: i32,
    pub err_msg: String,
    pub not_allocated: bool,
    pub def_flow_check_id: i64,
    pub def_flow_control_info: String,
    pub group_flow_check_id: i64,
    pub group_flow_control_info: String,
    pub qry_priority_id: i32,
    pub authorized_info: Option<AuthorizedTokens>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseMasterRequest {
    pub client_id: String,
    pub group: String,
    pub certificate: MasterCertificate,
}

/// Coordinator heartbeat reply, fed in by the heartbeat driver
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MasterHeartbeatResponse {
    pub success: bool,
    pub err_code: i32,
    pub err_msg: String,
    pub not_allocated: bool,
    pub def_flow_check_id: i64,
    pub def_flow_control_info: String,
    pub group_flow_check_id: i64,
    pub group_flow_control_info: String,
    pub qry_priority_id: i32,
    pub authorized_info: Option<AuthorizedTokens>,
    pub require_auth: bool,
    pub event: Option<ConsumerEvent>,
}

/// Broker heartbeat reply, fed in by the heartbeat driver
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerHeartbeatResponse {
    pub success: bool,
    pub err_code: i32,
    pub err_msg: String,
    pub require_auth: bool,
    /// Partition keys the broker no longer serves for this consumer
    pub failed_partition_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRegisterRequest {
    pub partition: Partition,
    pub group: String,
    pub client_id: String,
    pub local_host: String,
    pub read_status: ReadStatus,
    pub filter_items: Vec<String>,
    pub auth_token: Option<String>,
    pub tokens: AuthorizedTokens,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerUnregisterRequest {
    pub partition: Partition,
    pub group: String,
    pub client_id: String,
    pub tokens: AuthorizedTokens,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub partition: Partition,
    pub group: String,
    pub client_id: String,
    pub last_consumed: bool,
    pub tokens: AuthorizedTokens,
    pub snapshot: CacheSnapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchResponse {
    pub success: bool,
    pub err_code: i32,
    pub err_msg: String,
    pub esc_flow_ctrl: bool,
    pub messages: Vec<TransferredMessage>,
    pub curr_offset: i64,
    pub curr_data_dlt: i64,
    pub min_limit_time_ms: i64,
    pub require_slow: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    pub partition: Partition,
    pub group: String,
    pub client_id: String,
    pub last_consumed: bool,
    pub tokens: AuthorizedTokens,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitResponse {
    pub success: bool,
    pub err_code: i32,
    pub err_msg: String,
    pub curr_offset: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_key_format() {
        let partition = Partition::new(Node::new(7, "10.0.0.7", 8123), "orders", 3);
        assert_eq!(partition.partition_key(), "7:orders:3");
        assert_eq!(partition.broker.address(), "10.0.0.7:8123");

        let key: PartitionKey = partition.partition_key().parse().unwrap();
        assert_eq!(key.broker_id, 7);
        assert_eq!(key.topic, "orders");
        assert_eq!(key.partition_id, 3);
    }

    #[test]
    fn test_topic_with_delimiter() {
        let partition = Partition::new(Node::new(1, "h", 1), "ns:orders", 0);
        assert_eq!(PartitionKey::topic_of(partition.partition_key()).unwrap(), "ns:orders");
        let key: PartitionKey = partition.partition_key().parse().unwrap();
        assert_eq!(key.topic, "ns:orders");
    }

    #[test]
    fn test_malformed_partition_keys() {
        for key in ["", "no-delimiter", "1:", "1::2", "x:topic:1", "1:topic:y"] {
            assert!(
                key.parse::<PartitionKey>().is_err(),
                "expected '{}' to be rejected",
                key
            );
        }
        assert!(matches!(
            PartitionKey::topic_of("only:one"),
            Err(LeasemqClientError::BadRequest { .. })
        ));
    }

    #[test]
    fn test_confirm_context() {
        let ctx = ConfirmContext::new("1:topic:0", 1_700_000_000_123);
        let token = ctx.to_string();
        assert_eq!(token, "1:topic:0@1700000000123");
        assert_eq!(ConfirmContext::parse(&token).unwrap(), ctx);

        for bad in ["", "1:topic:0", "@123", "1:topic:0@", "1:topic:0@abc"] {
            assert!(matches!(
                ConfirmContext::parse(bad),
                Err(LeasemqClientError::BadRequest { .. })
            ));
        }
    }

    #[test]
    fn test_rpc_response_into_result() {
        assert!(RpcResponse::ok().into_result().is_ok());
        let err = RpcResponse::failed(450, "group forbidden")
            .into_result()
            .unwrap_err();
        assert_eq!(err.error_code(), Some(ErrorCode::ConsumeGroupForbidden));
    }
}
