use std::env;
use std::time::Duration;
use uuid::Uuid;

use crate::heartbeat::{DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_HEARTBEAT_THRESHOLD_MS};
use crate::Error;

const DEFAULT_KEY_PREFIX: &str = "chat";
const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 64;

/// Settings for one chat instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    /// Unique name of this instance in the cluster.
    pub instance_id: String,
    /// Prefix of every shared key and channel. Instances of one room must agree.
    pub key_prefix: String,
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which a peer is declared dead. Must exceed the interval.
    pub heartbeat_threshold: Duration,
    /// Outbound events buffered per client before new ones are dropped.
    pub client_queue_capacity: usize,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            heartbeat_threshold: Duration::from_millis(DEFAULT_HEARTBEAT_THRESHOLD_MS),
            client_queue_capacity: DEFAULT_CLIENT_QUEUE_CAPACITY,
        }
    }
}

impl InstanceConfig {
    /// Read `NAME`, `KEY_PREFIX`, `HEARTBEAT_INTERVAL_MS`,
    /// `HEARTBEAT_THRESHOLD_MS` and `CLIENT_QUEUE_CAPACITY`.
    ///
    /// Unset variables keep their defaults; a generated UUID stands in for `NAME`.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut config = Self::default();

        if let Some(name) = lookup("NAME").filter(|v| !v.trim().is_empty()) {
            config.instance_id = name;
        }
        if let Some(prefix) = lookup("KEY_PREFIX").filter(|v| !v.is_empty()) {
            config.key_prefix = prefix;
        }
        if let Some(ms) = parse_var(&lookup, "HEARTBEAT_INTERVAL_MS")? {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "HEARTBEAT_THRESHOLD_MS")? {
            config.heartbeat_threshold = Duration::from_millis(ms);
        }
        if let Some(capacity) = parse_var(&lookup, "CLIENT_QUEUE_CAPACITY")? {
            config.client_queue_capacity = capacity as usize;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, threshold: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.instance_id.trim().is_empty() {
            return Err(Error::Config("instance id must not be empty".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::Config("heartbeat interval must be positive".into()));
        }
        if self.heartbeat_threshold <= self.heartbeat_interval {
            return Err(Error::Config(format!(
                "heartbeat threshold ({:?}) must exceed the interval ({:?})",
                self.heartbeat_threshold, self.heartbeat_interval
            )));
        }
        if self.client_queue_capacity == 0 {
            return Err(Error::Config("client queue capacity must be positive".into()));
        }
        Ok(())
    }
}

fn parse_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>, Error> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{} must be a non-negative integer: {}", key, e))),
    }
}
