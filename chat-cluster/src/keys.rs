const DEFAULT_PREFIX: &str = "chat";

/// Names of every shared key and channel used by the cluster.
///
/// All instances of one chat room must agree on the prefix. Tests use a unique
/// prefix per case so they can share a store without interfering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    prefix: String,
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl Keyspace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Set of every username connected anywhere in the cluster.
    pub fn connected_users(&self) -> String {
        format!("{}:connected_users", self.prefix)
    }

    /// Set of usernames owned by one instance.
    pub fn users_on(&self, instance_id: &str) -> String {
        format!("{}:users_on_server:{}", self.prefix, instance_id)
    }

    /// Hash of instance id -> last heartbeat (epoch millis).
    pub fn heartbeats(&self) -> String {
        format!("{}:server_heartbeats", self.prefix)
    }

    pub fn messages_channel(&self) -> String {
        format!("{}:messages", self.prefix)
    }

    pub fn presence_channel(&self) -> String {
        format!("{}:presence", self.prefix)
    }
}
