//! Error types for the LeaseMQ client library

/// Main error type for LeaseMQ client operations
#[derive(Debug, thiserror::Error)]
pub enum LeasemqClientError {
    /// No partition is currently assigned to this consumer
    #[error("No partition assigned to this consumer")]
    NoPartitionAssigned,

    /// Every assigned partition is leased by another caller
    #[error("All partitions are in use")]
    AllPartitionsInUse,

    /// Every free partition is still inside its flow-control wait
    #[error("All partitions are waiting for their next fetch window")]
    AllPartitionsWaiting,

    /// Malformed client input (confirm context, partition key)
    #[error("Bad request: {message}")]
    BadRequest { message: String },

    /// The lease backing a confirm is gone (expired, released or removed)
    #[error("Confirm timeout: {message}")]
    ConfirmTimeout { message: String },

    /// Error code returned by a coordinator or broker
    #[error("Server error {code:?} ({raw}): {message}")]
    Server {
        code: ErrorCode,
        raw: i32,
        message: String,
    },

    /// Timeout errors
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Transport-level failures reported by the gateway
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// No coordinator address could be selected
    #[error("No coordinator available: {message}")]
    NoCoordinatorAvailable { message: String },

    /// Flow-control rule payload could not be parsed
    #[error("Flow control rule error: {0}")]
    FlowCtrlRule(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// The consumer has been closed
    #[error("Consumer is closed")]
    Closed,
}

impl LeasemqClientError {
    /// Create a new bad request error
    pub fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Create a new confirm timeout error
    pub fn confirm_timeout<S: Into<String>>(message: S) -> Self {
        Self::ConfirmTimeout {
            message: message.into(),
        }
    }

    /// Create a server error from a raw response code
    pub fn server<S: Into<String>>(raw: i32, message: S) -> Self {
        Self::Server {
            code: ErrorCode::from(raw),
            raw,
            message: message.into(),
        }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new invalid config error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// The protocol error code carried by this error, if any
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::NoPartitionAssigned => Some(ErrorCode::NoPartAssigned),
            Self::AllPartitionsInUse => Some(ErrorCode::AllPartInUse),
            Self::AllPartitionsWaiting => Some(ErrorCode::AllPartWaiting),
            Self::BadRequest { .. } => Some(ErrorCode::BadRequest),
            Self::ConfirmTimeout { .. } => Some(ErrorCode::ConfirmTimeout),
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Check if this error is retryable by calling the same operation again
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AllPartitionsInUse | Self::AllPartitionsWaiting => true,
            Self::Timeout { .. } | Self::Connection { .. } => true,
            Self::Server { code, .. } => code.is_throttling(),
            _ => false,
        }
    }

    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Outcome of a fetch response code for the partition it was served from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDisposition {
    /// Messages were served
    Success,
    /// Drop the partition; it only comes back through a rebalance
    Evict,
    /// Keep the partition but delay its next fetch
    Backoff,
}

/// Error code mapping for coordinator and broker responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success = 200,
    Moved = 301,
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    NoPartAssigned = 406,
    AllPartWaiting = 407,
    AllPartInUse = 408,
    HbNoNode = 411,
    DuplicatePartition = 412,
    CertificateFailure = 415,
    ServerOverflow = 419,
    ConsumeGroupForbidden = 450,
    ConsumeSpeedLimit = 452,
    ConsumeContentForbidden = 455,
    ServiceUnavailable = 503,
    ConfirmTimeout = 2004,
    /// Any code this client does not know about
    Unknown = -1,
}

impl ErrorCode {
    /// Numeric wire value
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Registration errors that abort the whole subscription
    pub fn is_fatal_to_subscription(self) -> bool {
        matches!(
            self,
            ErrorCode::ConsumeGroupForbidden | ErrorCode::ConsumeContentForbidden
        )
    }

    /// Fetch errors after which the partition must be dropped
    pub fn is_fatal_to_partition(self) -> bool {
        matches!(
            self,
            ErrorCode::HbNoNode | ErrorCode::CertificateFailure | ErrorCode::DuplicatePartition
        )
    }

    /// Fetch errors that only delay the partition
    pub fn is_throttling(self) -> bool {
        matches!(
            self,
            ErrorCode::ConsumeSpeedLimit
                | ErrorCode::NotFound
                | ErrorCode::Forbidden
                | ErrorCode::Moved
                | ErrorCode::ServiceUnavailable
        )
    }

    /// Classify a fetch response code
    pub fn fetch_disposition(self) -> FetchDisposition {
        if self == ErrorCode::Success {
            FetchDisposition::Success
        } else if self.is_fatal_to_partition() {
            FetchDisposition::Evict
        } else {
            // unknown codes are treated like throttling: the partition is kept
            FetchDisposition::Backoff
        }
    }
}

impl From<i32> for ErrorCode {
    fn from(code: i32) -> Self {
        match code {
            200 => ErrorCode::Success,
            301 => ErrorCode::Moved,
            400 => ErrorCode::BadRequest,
            401 => ErrorCode::Unauthorized,
            403 => ErrorCode::Forbidden,
            404 => ErrorCode::NotFound,
            406 => ErrorCode::NoPartAssigned,
            407 => ErrorCode::AllPartWaiting,
            408 => ErrorCode::AllPartInUse,
            411 => ErrorCode::HbNoNode,
            412 => ErrorCode::DuplicatePartition,
            415 => ErrorCode::CertificateFailure,
            419 => ErrorCode::ServerOverflow,
            450 => ErrorCode::ConsumeGroupForbidden,
            452 => ErrorCode::ConsumeSpeedLimit,
            455 => ErrorCode::ConsumeContentForbidden,
            503 => ErrorCode::ServiceUnavailable,
            2004 => ErrorCode::ConfirmTimeout,
            _ => ErrorCode::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_round_trip() {
        for code in [200, 301, 403, 404, 411, 412, 415, 450, 452, 455, 503, 2004] {
            assert_eq!(ErrorCode::from(code).code(), code);
        }
        assert_eq!(ErrorCode::from(999), ErrorCode::Unknown);
    }

    #[test]
    fn test_fetch_disposition() {
        assert_eq!(
            ErrorCode::Success.fetch_disposition(),
            FetchDisposition::Success
        );
        for code in [
            ErrorCode::HbNoNode,
            ErrorCode::CertificateFailure,
            ErrorCode::DuplicatePartition,
        ] {
            assert_eq!(code.fetch_disposition(), FetchDisposition::Evict);
        }
        for code in [
            ErrorCode::ConsumeSpeedLimit,
            ErrorCode::NotFound,
            ErrorCode::Forbidden,
            ErrorCode::Moved,
            ErrorCode::ServiceUnavailable,
            ErrorCode::Unknown,
        ] {
            assert_eq!(code.fetch_disposition(), FetchDisposition::Backoff);
        }
    }

    #[test]
    fn test_subscription_fatal_codes() {
        assert!(ErrorCode::ConsumeGroupForbidden.is_fatal_to_subscription());
        assert!(ErrorCode::ConsumeContentForbidden.is_fatal_to_subscription());
        assert!(!ErrorCode::Forbidden.is_fatal_to_subscription());
    }

    #[test]
    fn test_error_helpers() {
        let err = LeasemqClientError::server(452, "slow down");
        assert_eq!(err.error_code(), Some(ErrorCode::ConsumeSpeedLimit));
        assert!(err.is_retryable());

        let err = LeasemqClientError::bad_request("no '@'");
        assert_eq!(err.error_code(), Some(ErrorCode::BadRequest));
        assert!(!err.is_retryable());

        assert!(LeasemqClientError::timeout(500).is_timeout());
        assert!(LeasemqClientError::Closed.error_code().is_none());
    }
}
