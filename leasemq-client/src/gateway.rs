//! Seams to the collaborators this engine does not own
//!
//! - [`RpcGateway`]: typed request/response calls to coordinators and brokers
//! - [`CoordinatorSelector`]: picks a coordinator address from the candidates
//! - [`HeartbeatDriver`]: the external timer that keeps sessions alive
//!
//! A gateway returns `Err` only for transport failures. Protocol failures come
//! back as a response with `success == false` and an error code.

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::error::LeasemqClientError;
use crate::protocol::{
    BrokerRegisterRequest, BrokerUnregisterRequest, CloseMasterRequest, CommitRequest,
    CommitResponse, FetchRequest, FetchResponse, Node, RegisterMasterRequest,
    RegisterMasterResponse, RpcResponse,
};
use crate::Result;

/// Wire-level operations used by the consumer
#[async_trait]
pub trait RpcGateway: Send + Sync {
    async fn register_with_coordinator(
        &self,
        address: &str,
        request: RegisterMasterRequest,
    ) -> Result<RegisterMasterResponse>;

    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse>;

    async fn commit_offset(&self, request: CommitRequest) -> Result<CommitResponse>;

    async fn register_with_broker(&self, request: BrokerRegisterRequest) -> Result<RpcResponse>;

    async fn unregister_with_broker(&self, request: BrokerUnregisterRequest)
        -> Result<RpcResponse>;

    async fn close_with_coordinator(
        &self,
        address: &str,
        request: CloseMasterRequest,
    ) -> Result<RpcResponse>;

    /// Release transport resources
    async fn close(&self) {}
}

/// Address chosen by a [`CoordinatorSelector`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedNode {
    pub address: String,
    /// Whether another untried candidate remains in the current pass
    pub has_next: bool,
}

pub trait CoordinatorSelector: Send + Sync {
    fn select(&self, candidates: &[String]) -> Result<SelectedNode>;

    /// Start a new pass over the candidates
    fn reset(&self) {}
}

/// Round-robin selector
#[derive(Debug, Default)]
pub struct IpSelector {
    cursor: AtomicUsize,
    tried: AtomicUsize,
}

impl IpSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CoordinatorSelector for IpSelector {
    fn select(&self, candidates: &[String]) -> Result<SelectedNode> {
        if candidates.is_empty() {
            return Err(LeasemqClientError::NoCoordinatorAvailable {
                message: "empty coordinator candidate list".to_string(),
            });
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        let tried = self.tried.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(SelectedNode {
            address: candidates[index].clone(),
            has_next: tried < candidates.len(),
        })
    }

    fn reset(&self) {
        self.tried.store(0, Ordering::Relaxed);
    }
}

/// External heartbeat scheduler
///
/// The driver calls back into [`crate::Consumer::process_master_heartbeat`]
/// and [`crate::Consumer::process_broker_heartbeat`] on its own timer.
pub trait HeartbeatDriver: Send + Sync {
    /// Start heartbeating the coordinator at `address`
    fn register_master(&self, address: &str);

    /// Start heartbeating a broker that now serves this consumer
    fn register_broker(&self, broker: &Node);

    /// Stop all heartbeats
    fn close(&self);
}

/// Heartbeat driver that schedules nothing
#[derive(Debug, Default)]
pub struct NoopHeartbeat;

impl HeartbeatDriver for NoopHeartbeat {
    fn register_master(&self, address: &str) {
        debug!(master = %address, "No heartbeat driver configured for master");
    }

    fn register_broker(&self, broker: &Node) {
        debug!(broker = %broker.address(), "No heartbeat driver configured for broker");
    }

    fn close(&self) {}
}

/// Bound a gateway call; an elapsed timer becomes a recoverable timeout error
pub(crate) async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(LeasemqClientError::timeout(timeout.as_millis() as u64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_selector_round_robin() {
        let selector = IpSelector::new();
        let candidates = vec!["m1:8715".to_string(), "m2:8715".to_string()];

        let first = selector.select(&candidates).unwrap();
        assert_eq!(first.address, "m1:8715");
        assert!(first.has_next);

        let second = selector.select(&candidates).unwrap();
        assert_eq!(second.address, "m2:8715");
        assert!(!second.has_next);

        selector.reset();
        let third = selector.select(&candidates).unwrap();
        assert_eq!(third.address, "m1:8715");
        assert!(third.has_next);
    }

    #[test]
    fn test_ip_selector_empty() {
        assert!(matches!(
            IpSelector::new().select(&[]),
            Err(LeasemqClientError::NoCoordinatorAvailable { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout() {
        let result: Result<()> = with_timeout(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert!(matches!(
            result,
            Err(LeasemqClientError::Timeout { timeout_ms: 50 })
        ));

        let result = with_timeout(Duration::from_millis(50), async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
