//! Shared presence and message routing for a chat room spread over many
//! server instances.
//!
//! This crate provides:
//! - Cluster-wide unique usernames via an atomic check-and-add in Redis
//! - Heartbeat-based liveness, with every instance evicting the users of
//!   peers whose heartbeat went stale
//! - Broadcast and directed messages published on Redis Pub/Sub and filtered
//!   locally by each instance
//! - A per-instance dispatch loop that serializes all local state changes
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use chat_cluster::{ChatInstance, InstanceConfig, RedisStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = RedisStore::connect("redis://127.0.0.1:6379").await?;
//!     let instance = ChatInstance::start(Arc::new(store), InstanceConfig::from_env()?).await?;
//!
//!     let mut session = instance.connect()?;
//!     session.set_username("alice")?;
//!     session.send_message("hello", "main")?;
//!     while let Some(event) = session.recv().await {
//!         println!("{}", event.to_frame()?);
//!     }
//!
//!     // Graceful shutdown releases every local username
//!     instance.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Failure Detection
//!
//! - **Graceful shutdown**: usernames are released and peers refresh their
//!   rosters immediately
//! - **Crash/kill -9**: peers evict the instance's users once its heartbeat
//!   is older than the threshold (200ms by default)
//! - **Store outage**: the instance keeps serving local users, reports itself
//!   degraded and retries with exponential backoff

mod config;
mod error;
mod heartbeat;
mod instance;
mod keys;
mod memory_store;
pub mod metrics;
mod presence;
pub mod protocol;
mod redis_store;
mod registry;
mod router;
mod session;
mod store;

pub use config::InstanceConfig;
pub use error::Error;
pub use heartbeat::{
    current_timestamp_ms, Backoff, Eviction, HeartbeatMonitor, Liveness,
    DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_HEARTBEAT_THRESHOLD_MS,
};
pub use instance::{ChatInstance, ClientSession, InstanceStatus};
pub use keys::Keyspace;
pub use memory_store::MemoryStore;
pub use metrics::METRICS;
pub use presence::{PresenceStore, Registration};
pub use protocol::{ChatMessage, ClientEvent, OutgoingMessage, ServerEvent};
pub use redis_store::RedisStore;
pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry};
pub use router::{Inbound, Router};
pub use session::{Negotiation, SessionLifecycle};
pub use store::{BusMessage, BusStream, SharedStore};
