//! # LeaseMQ Client Library
//!
//! Client-side consumer engine for a topic/partition pub-sub broker with
//! coordinator-assigned partitions and explicit confirmation (at-least-once).
//!
//! ## Features
//!
//! - **Partition Leases**: exclusive, time-bounded claims on partitions with
//!   per-partition locking, so fetches on different partitions never contend
//! - **Rebalance Handling**: coordinator-issued connect/disconnect events are
//!   merged with in-flight fetch/confirm calls by a single event loop
//! - **Flow Control**: server error codes and pushed rule sets drive
//!   per-partition backoff
//! - **Integrity**: CRC32-checked message decode
//! - **Pluggable Transport**: wire encoding lives behind [`RpcGateway`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use leasemq_client::*;
//! use std::sync::Arc;
//!
//! async fn run(gateway: Arc<dyn RpcGateway>) -> Result<()> {
//!     let config = ConsumerConfig::builder()
//!         .masters(vec!["10.0.0.1:8715"])
//!         .group("my-group")
//!         .topics(vec!["my-topic"])
//!         .build();
//!
//!     let consumer = Consumer::builder()
//!         .config(config)
//!         .gateway(gateway)
//!         .build()
//!         .await?;
//!
//!     let result = consumer.get_message().await?;
//!     for message in &result.messages {
//!         println!("{} bytes from {}", message.data.len(), result.topic);
//!     }
//!     consumer.confirm(&result.confirm_context, true).await?;
//!
//!     consumer.close().await
//! }
//! ```

pub mod cache;
pub mod config;
pub mod consumer;
pub mod error;
pub mod flow_ctrl;
pub mod gateway;
pub mod message;
pub mod metrics;
pub mod protocol;
pub mod subscription;

pub use cache::{ConsumedOffsets, PartitionLease, PartitionLeaseCache};
pub use config::*;
pub use consumer::*;
pub use error::*;
pub use gateway::{CoordinatorSelector, HeartbeatDriver, IpSelector, RpcGateway, SelectedNode};
pub use message::Message;
pub use metrics::{ClientMetrics, MetricsSnapshot};
pub use subscription::ClientIdGenerator;

/// Client library result type
pub type Result<T> = std::result::Result<T, LeasemqClientError>;

/// Client library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
