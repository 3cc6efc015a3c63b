//! Configuration types for the LeaseMQ consumer

use crate::error::LeasemqClientError;
use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Confirm requests get this much less than the standard read timeout
pub const CONFIRM_TIMEOUT_OFFSET: Duration = Duration::from_millis(500);

/// Where a partition starts reading the first time this process registers it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumePosition {
    /// Resume from the group's stored offset (or the first offset)
    FromFirstOffset,
    /// Start at the latest offset when the group has no stored offset
    #[default]
    FromLatestOffset,
    /// Always start at the latest offset on first registration
    FromMaxOffsetAlways,
}

/// Credentials used for coordinator and broker authentication
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Enable authentication
    pub enable: bool,
    pub user_name: String,
    pub password: String,
}

/// Network configuration shared by every gateway call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Per-call read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Address this client reports to coordinators and brokers
    pub local_host: String,
    /// Authentication settings
    pub auth: AuthConfig,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 10_000,
            local_host: "127.0.0.1".to_string(),
            auth: AuthConfig::default(),
        }
    }
}

impl NetConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Timeout for confirm calls, kept below the read timeout
    pub fn confirm_timeout(&self) -> Duration {
        self.read_timeout()
            .saturating_sub(CONFIRM_TIMEOUT_OFFSET)
            .max(Duration::from_millis(1))
    }
}

/// Consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Coordinator (master) candidate addresses
    pub masters: Vec<String>,
    /// Consumer group
    pub group: String,
    /// Topics to subscribe to
    pub topics: Vec<String>,
    /// Filter keys per topic; a topic listed here is consumed filtered
    pub topic_filters: HashMap<String, Vec<String>>,
    /// Initial read position on first registration
    pub consume_position: ConsumePosition,
    /// Keep partitions with a live lease when a rebalance removes them
    pub rollback_if_confirm_timeout: bool,
    /// Lease timeout: an unconfirmed lease is reclaimed after this long
    pub max_confirm_wait_ms: u64,
    /// Backoff after a fetch found no messages
    pub msg_not_found_wait_ms: u64,
    /// Upper bound on how long a fetch waits for an eligible partition
    pub max_part_check_period_ms: u64,
    /// Polling interval while waiting for an eligible partition
    pub part_check_slice_ms: u64,
    /// Minimum wait applied when a broker asks for slow consumption
    pub slow_consume_wait_ms: u64,
    /// Network settings
    pub net: NetConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            masters: Vec::new(),
            group: String::new(),
            topics: Vec::new(),
            topic_filters: HashMap::new(),
            consume_position: ConsumePosition::default(),
            rollback_if_confirm_timeout: true,
            max_confirm_wait_ms: 60_000,
            msg_not_found_wait_ms: 400,
            max_part_check_period_ms: 60_000,
            part_check_slice_ms: 300,
            slow_consume_wait_ms: 500,
            net: NetConfig::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::new()
    }

    /// Load a configuration from `LEASEMQ_*` environment variables
    ///
    /// Nested fields use `__`, e.g. `LEASEMQ_NET__READ_TIMEOUT_MS=5000`.
    pub fn from_env() -> Result<Self, LeasemqClientError> {
        let settings = Config::builder()
            .add_source(
                Environment::with_prefix("LEASEMQ")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("masters")
                    .with_list_parse_key("topics")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| LeasemqClientError::invalid_config(e.to_string()))?;

        let config = settings
            .try_deserialize::<ConsumerConfig>()
            .map_err(|e| LeasemqClientError::invalid_config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn max_confirm_wait(&self) -> Duration {
        Duration::from_millis(self.max_confirm_wait_ms)
    }

    pub fn msg_not_found_wait(&self) -> Duration {
        Duration::from_millis(self.msg_not_found_wait_ms)
    }

    pub fn max_part_check_period(&self) -> Duration {
        Duration::from_millis(self.max_part_check_period_ms)
    }

    pub fn part_check_slice(&self) -> Duration {
        Duration::from_millis(self.part_check_slice_ms)
    }

    pub fn slow_consume_wait(&self) -> Duration {
        Duration::from_millis(self.slow_consume_wait_ms)
    }

    /// Validate configuration bounds before a consumer is built
    pub fn validate(&self) -> Result<(), LeasemqClientError> {
        if self.masters.is_empty() {
            return Err(LeasemqClientError::invalid_config(
                "at least one master address must be specified",
            ));
        }
        if self.group.trim().is_empty() {
            return Err(LeasemqClientError::invalid_config("group must be set"));
        }
        if self.topics.is_empty() {
            return Err(LeasemqClientError::invalid_config(
                "at least one topic must be specified",
            ));
        }
        if let Some(topic) = self
            .topic_filters
            .keys()
            .find(|topic| !self.topics.contains(topic))
        {
            return Err(LeasemqClientError::invalid_config(format!(
                "filters configured for unsubscribed topic '{}'",
                topic
            )));
        }
        if self.part_check_slice_ms == 0 {
            return Err(LeasemqClientError::invalid_config(
                "part_check_slice_ms must be > 0",
            ));
        }
        if self.net.read_timeout() <= CONFIRM_TIMEOUT_OFFSET {
            return Err(LeasemqClientError::invalid_config(format!(
                "read_timeout_ms must be > {}",
                CONFIRM_TIMEOUT_OFFSET.as_millis()
            )));
        }
        if self.net.auth.enable && self.net.auth.user_name.is_empty() {
            return Err(LeasemqClientError::invalid_config(
                "auth is enabled but user_name is empty",
            ));
        }
        Ok(())
    }
}

/// Builder for ConsumerConfig
#[derive(Debug, Default)]
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn masters<I, S>(mut self, masters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.masters = masters.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn group<S: Into<String>>(mut self, group: S) -> Self {
        self.config.group = group.into();
        self
    }

    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.topics = topics.into_iter().map(|s| s.into()).collect();
        self
    }

    /// Subscribe to `topic` with a set of filter keys
    pub fn topic_filters<T, I, S>(mut self, topic: T, filters: I) -> Self
    where
        T: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topic = topic.into();
        if !self.config.topics.contains(&topic) {
            self.config.topics.push(topic.clone());
        }
        self.config
            .topic_filters
            .insert(topic, filters.into_iter().map(|s| s.into()).collect());
        self
    }

    pub fn consume_position(mut self, position: ConsumePosition) -> Self {
        self.config.consume_position = position;
        self
    }

    pub fn rollback_if_confirm_timeout(mut self, rollback: bool) -> Self {
        self.config.rollback_if_confirm_timeout = rollback;
        self
    }

    pub fn max_confirm_wait(mut self, wait: Duration) -> Self {
        self.config.max_confirm_wait_ms = wait.as_millis() as u64;
        self
    }

    pub fn msg_not_found_wait(mut self, wait: Duration) -> Self {
        self.config.msg_not_found_wait_ms = wait.as_millis() as u64;
        self
    }

    pub fn max_part_check_period(mut self, period: Duration) -> Self {
        self.config.max_part_check_period_ms = period.as_millis() as u64;
        self
    }

    pub fn part_check_slice(mut self, slice: Duration) -> Self {
        self.config.part_check_slice_ms = slice.as_millis() as u64;
        self
    }

    pub fn slow_consume_wait(mut self, wait: Duration) -> Self {
        self.config.slow_consume_wait_ms = wait.as_millis() as u64;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.net.read_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn local_host<S: Into<String>>(mut self, host: S) -> Self {
        self.config.net.local_host = host.into();
        self
    }

    pub fn auth<U: Into<String>, P: Into<String>>(mut self, user_name: U, password: P) -> Self {
        self.config.net.auth = AuthConfig {
            enable: true,
            user_name: user_name.into(),
            password: password.into(),
        };
        self
    }

    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}
