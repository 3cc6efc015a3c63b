//! Subscription-wide consumer state
//!
//! [`SubscriptionInfo`] holds what every request needs to identify the
//! consumer; [`SessionAuth`] holds the rotating coordinator tokens and the
//! one-shot "send credentials next time" flags.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::config::{AuthConfig, ConsumerConfig};
use crate::protocol::{AuthorizedTokens, MasterCertificate, TopicName};

/// Generates process-unique client ids
///
/// Ids look like `<group>_<local_host>_<pid>_<millis>_<seq>_<version>`.
/// Share one generator per process to keep the sequence unique.
#[derive(Debug)]
pub struct ClientIdGenerator {
    local_host: String,
    seq: AtomicU64,
}

impl ClientIdGenerator {
    pub fn new<S: Into<String>>(local_host: S) -> Self {
        Self {
            local_host: local_host.into(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self, group: &str) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!(
            "{}_{}_{}_{}_{}_{}",
            group,
            self.local_host,
            std::process::id(),
            chrono::Utc::now().timestamp_millis(),
            seq,
            crate::VERSION
        )
    }
}

/// Rotating authentication state of one consumer session
#[derive(Debug)]
pub struct SessionAuth {
    auth: AuthConfig,
    tokens: RwLock<AuthorizedTokens>,
    next_auth_to_master: AtomicBool,
    next_auth_to_broker: AtomicBool,
}

impl SessionAuth {
    pub fn new(auth: AuthConfig) -> Self {
        Self {
            auth,
            tokens: RwLock::new(AuthorizedTokens::default()),
            next_auth_to_master: AtomicBool::new(false),
            next_auth_to_broker: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.auth.enable
    }

    pub fn tokens(&self) -> AuthorizedTokens {
        self.tokens.read().clone()
    }

    pub fn update_tokens(&self, tokens: AuthorizedTokens) {
        *self.tokens.write() = tokens;
    }

    /// Ask for credentials on the next coordinator request
    pub fn request_master_auth(&self) {
        self.next_auth_to_master.store(true, Ordering::Release);
    }

    /// Ask for a fresh token on the next broker request
    pub fn request_broker_auth(&self) {
        self.next_auth_to_broker.store(true, Ordering::Release);
    }

    fn basic_token(&self) -> String {
        let raw = format!("{}:{}", self.auth.user_name, self.auth.password);
        format!("Basic {}", STANDARD.encode(raw))
    }

    /// Broker token, produced when forced or when a refresh was requested.
    /// A pending refresh request is consumed exactly once.
    pub fn gen_broker_auth(&self, force: bool) -> Option<String> {
        if !self.auth.enable {
            return None;
        }
        let requested = self
            .next_auth_to_broker
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        (force || requested).then(|| self.basic_token())
    }

    /// Coordinator certificate; the token is attached when forced or requested
    pub fn gen_master_certificate(&self, force: bool) -> MasterCertificate {
        if !self.auth.enable {
            return MasterCertificate::default();
        }
        let requested = self
            .next_auth_to_master
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        MasterCertificate {
            user_name: Some(self.auth.user_name.clone()),
            auth_token: (force || requested).then(|| self.basic_token()),
        }
    }
}

/// Subscription descriptor shared by the consumer's tasks
#[derive(Debug)]
pub struct SubscriptionInfo {
    pub group: String,
    pub client_id: String,
    pub topics: Vec<TopicName>,
    topic_filters: HashMap<TopicName, BTreeSet<String>>,
    first_registered: AtomicBool,
    not_allocated: AtomicBool,
    pub session: SessionAuth,
}

impl SubscriptionInfo {
    pub fn new(config: &ConsumerConfig, client_id: String) -> Self {
        let topic_filters = config
            .topic_filters
            .iter()
            .filter(|(_, filters)| !filters.is_empty())
            .map(|(topic, filters)| (topic.clone(), filters.iter().cloned().collect()))
            .collect();
        Self {
            group: config.group.clone(),
            client_id,
            topics: config.topics.clone(),
            topic_filters,
            first_registered: AtomicBool::new(false),
            not_allocated: AtomicBool::new(false),
            session: SessionAuth::new(config.net.auth.clone()),
        }
    }

    pub fn is_filtered(&self, topic: &str) -> bool {
        self.topic_filters.contains_key(topic)
    }

    pub fn filters(&self, topic: &str) -> Option<&BTreeSet<String>> {
        self.topic_filters.get(topic)
    }

    /// Filter keys in the shape registration requests carry them
    pub fn topic_filter_lists(&self) -> HashMap<TopicName, Vec<String>> {
        self.topic_filters
            .iter()
            .map(|(topic, filters)| (topic.clone(), filters.iter().cloned().collect()))
            .collect()
    }

    pub fn is_first_registered(&self) -> bool {
        self.first_registered.load(Ordering::Acquire)
    }

    pub fn mark_first_registered(&self) {
        self.first_registered.store(true, Ordering::Release);
    }

    pub fn is_not_allocated(&self) -> bool {
        self.not_allocated.load(Ordering::Acquire)
    }

    pub fn set_not_allocated(&self, not_allocated: bool) {
        self.not_allocated.store(not_allocated, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(enable: bool) -> AuthConfig {
        AuthConfig {
            enable,
            user_name: "alice".to_string(),
            password: "secret".to_string(),
        }
    }

    #[test]
    fn test_client_id_format() {
        let generator = ClientIdGenerator::new("10.1.1.1");
        let first = generator.next_id("group-a");
        let second = generator.next_id("group-a");
        assert_ne!(first, second);

        let parts: Vec<&str> = first.split('_').collect();
        assert_eq!(parts.len(), 6);
        assert_eq!(parts[0], "group-a");
        assert_eq!(parts[1], "10.1.1.1");
        assert_eq!(parts[2], std::process::id().to_string());
        assert_eq!(parts[4], "1");
        assert_eq!(parts[5], crate::VERSION);
        assert!(second.split('_').nth(4) == Some("2"));
    }

    #[test]
    fn test_broker_auth_token() {
        let session = SessionAuth::new(auth(true));
        assert_eq!(
            session.gen_broker_auth(true).as_deref(),
            Some("Basic YWxpY2U6c2VjcmV0")
        );
        assert!(session.gen_broker_auth(false).is_none());

        session.request_broker_auth();
        assert!(session.gen_broker_auth(false).is_some());
        // consumed by the previous call
        assert!(session.gen_broker_auth(false).is_none());
    }

    #[test]
    fn test_auth_disabled() {
        let session = SessionAuth::new(auth(false));
        session.request_broker_auth();
        assert!(session.gen_broker_auth(true).is_none());
        assert_eq!(session.gen_master_certificate(true), MasterCertificate::default());
    }

    #[test]
    fn test_master_certificate() {
        let session = SessionAuth::new(auth(true));
        let cert = session.gen_master_certificate(false);
        assert_eq!(cert.user_name.as_deref(), Some("alice"));
        assert!(cert.auth_token.is_none());

        session.request_master_auth();
        assert!(session.gen_master_certificate(false).auth_token.is_some());
    }

    #[test]
    fn test_filters() {
        let config = ConsumerConfig::builder()
            .masters(vec!["m:1"])
            .group("g")
            .topics(vec!["plain"])
            .topic_filters("filtered", vec!["b", "a", "a"])
            .build();
        let sub = SubscriptionInfo::new(&config, "id".to_string());
        assert!(sub.is_filtered("filtered"));
        assert!(!sub.is_filtered("plain"));
        assert_eq!(sub.topic_filter_lists()["filtered"], vec!["a", "b"]);
        assert!(!sub.is_first_registered());
        sub.mark_first_registered();
        assert!(sub.is_first_registered());
    }
}
