//! Simple consumer example using an in-memory gateway
//!
//! A real deployment plugs its wire transport in behind `RpcGateway`; this
//! demo serves a few generated messages per partition from memory.

use async_trait::async_trait;
use bytes::Bytes;
use leasemq_client::message::checksum;
use leasemq_client::protocol::*;
use leasemq_client::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const MESSAGES_PER_PARTITION: i64 = 3;

#[derive(Default)]
struct InMemoryGateway {
    offsets: Mutex<HashMap<String, i64>>,
}

#[async_trait]
impl RpcGateway for InMemoryGateway {
    async fn register_with_coordinator(
        &self,
        _address: &str,
        _request: RegisterMasterRequest,
    ) -> Result<RegisterMasterResponse> {
        Ok(RegisterMasterResponse {
            success: true,
            err_code: 200,
            ..Default::default()
        })
    }

    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        let mut offsets = self.offsets.lock();
        let offset = offsets
            .entry(request.partition.partition_key().to_string())
            .or_insert(0);
        if *offset >= MESSAGES_PER_PARTITION {
            return Ok(FetchResponse {
                success: false,
                err_code: ErrorCode::NotFound.code(),
                err_msg: "no new messages".to_string(),
                curr_offset: *offset,
                ..Default::default()
            });
        }

        *offset += 1;
        let payload = Bytes::from(format!(
            "hello from {} #{}",
            request.partition.partition_key(),
            offset
        ));
        Ok(FetchResponse {
            success: true,
            err_code: 200,
            messages: vec![TransferredMessage {
                message_id: *offset,
                flag: 0,
                checksum: checksum(&payload),
                payload,
            }],
            curr_offset: *offset,
            curr_data_dlt: -1,
            ..Default::default()
        })
    }

    async fn commit_offset(&self, request: CommitRequest) -> Result<CommitResponse> {
        let curr_offset = self
            .offsets
            .lock()
            .get(request.partition.partition_key())
            .copied()
            .unwrap_or(INVALID_OFFSET);
        Ok(CommitResponse {
            success: true,
            err_code: 200,
            err_msg: String::new(),
            curr_offset,
        })
    }

    async fn register_with_broker(&self, _request: BrokerRegisterRequest) -> Result<RpcResponse> {
        Ok(RpcResponse::ok())
    }

    async fn unregister_with_broker(
        &self,
        _request: BrokerUnregisterRequest,
    ) -> Result<RpcResponse> {
        Ok(RpcResponse::ok())
    }

    async fn close_with_coordinator(
        &self,
        _address: &str,
        _request: CloseMasterRequest,
    ) -> Result<RpcResponse> {
        Ok(RpcResponse::ok())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("📖 LeaseMQ - Simple Consumer Example");
    println!("====================================");

    let config = ConsumerConfig::builder()
        .masters(vec!["127.0.0.1:8715"])
        .group("demo-group")
        .topics(vec!["demo-topic"])
        .max_part_check_period(Duration::from_millis(500))
        .msg_not_found_wait(Duration::from_millis(100))
        .build();

    let consumer = Consumer::builder()
        .config(config)
        .gateway(Arc::new(InMemoryGateway::default()))
        .build()
        .await?;
    println!("✅ Registered as {}", consumer.client_id());

    // Simulate the coordinator assigning two partitions
    let broker = Node::new(1, "127.0.0.1", 8123);
    let assignment = ConsumerEvent::new(
        1,
        EventType::Connect,
        vec![
            Partition::new(broker.clone(), "demo-topic", 0),
            Partition::new(broker, "demo-topic", 1),
        ],
    );
    if let Ok(event) = consumer.lease_cache().offer_event(assignment).await {
        println!("✅ Rebalance event {} processed", event.rebalance_id);
    }

    let mut message_count = 0;
    loop {
        match consumer.get_message().await {
            Ok(result) => {
                for message in &result.messages {
                    message_count += 1;
                    println!(
                        "   📨 {} offset={} value='{}'",
                        result.peer_info.partition_key,
                        result.peer_info.curr_offset,
                        String::from_utf8_lossy(&message.data)
                    );
                }
                consumer.confirm(&result.confirm_context, true).await?;
            }
            Err(e) if e.is_retryable() => {
                if message_count >= 2 * MESSAGES_PER_PARTITION {
                    break;
                }
            }
            Err(e) => {
                eprintln!("   ❌ {}", e);
                break;
            }
        }
    }

    println!("\n📊 Total messages consumed: {}", message_count);
    println!("📊 Offsets: {:?}", consumer.current_consumed_info());
    println!("📊 Metrics: {:?}", consumer.metrics().snapshot());

    consumer.close().await?;
    println!("✅ Consumer closed");
    Ok(())
}
