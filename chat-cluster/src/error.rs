use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Instance is shut down")]
    Shutdown,
}

impl Error {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedMessage(msg.into())
    }

    /// True when the shared store could not be reached.
    ///
    /// These errors put the instance into degraded mode; they are retried on
    /// the next heartbeat tick instead of being surfaced to clients.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Redis(_) | Self::StoreUnavailable(_) | Self::Connection(_)
        )
    }
}
