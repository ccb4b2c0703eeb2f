use std::sync::Arc;

use crate::metrics::METRICS;
use crate::protocol::{BroadcastPayload, ChatMessage, PresenceNotice, ServerEvent, Target};
use crate::registry::ConnectionRegistry;
use crate::store::BusMessage;
use crate::{Error, Keyspace, PresenceStore, SharedStore};

/// A decoded bus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Chat(ChatMessage),
    PresenceChanged(PresenceNotice),
}

/// Moves chat traffic between local connections and the shared bus.
///
/// Outbound messages are always published, never delivered directly. Every
/// instance (the sender's included) then picks them off the bus and delivers
/// to whichever of the involved users it holds locally, so no table of
/// "which instance owns whom" is needed for routing.
#[derive(Clone)]
pub struct Router {
    store: Arc<dyn SharedStore>,
    presence: PresenceStore,
    keys: Keyspace,
    instance_id: String,
}

impl Router {
    pub fn new(store: Arc<dyn SharedStore>, keys: Keyspace, instance_id: impl Into<String>) -> Self {
        Self {
            presence: PresenceStore::new(store.clone(), keys.clone()),
            store,
            keys,
            instance_id: instance_id.into(),
        }
    }

    /// Channels the instance's bus listener subscribes to.
    pub fn channels(&self) -> Vec<String> {
        vec![self.keys.messages_channel(), self.keys.presence_channel()]
    }

    /// Publish a chat message for every instance to deliver.
    ///
    /// If the bus is unreachable the message is delivered to local recipients
    /// directly, so users on this instance can keep talking, and the store
    /// error is returned for the caller to record.
    pub async fn route(&self, registry: &ConnectionRegistry, msg: &ChatMessage) -> Result<(), Error> {
        let payload = msg.to_bus()?;
        match self
            .store
            .publish(&self.keys.messages_channel(), &payload)
            .await
        {
            Ok(()) => {
                METRICS.inc_message_published();
                tracing::debug!(user = %msg.user, to = %msg.to_server, "Published chat message");
                Ok(())
            }
            Err(e) => {
                let delivered = self.deliver(registry, msg);
                tracing::warn!(
                    user = %msg.user,
                    delivered,
                    "Bus publish failed, delivered locally only: {}",
                    e
                );
                Err(e)
            }
        }
    }

    /// Deliver a chat message to the local connections it concerns.
    ///
    /// Broadcasts go to every local session. Directed messages go to the
    /// sender (as an echo) and to the recipient, each only if local, and
    /// once when both are the same user. Returns the number of deliveries.
    pub fn deliver(&self, registry: &ConnectionRegistry, msg: &ChatMessage) -> usize {
        match msg.target() {
            Target::Main => registry.broadcast(&ServerEvent::Main(BroadcastPayload::from(msg))),
            Target::User(recipient) => {
                let mut delivered = 0;
                if let Some(sender) = registry.get(&msg.user) {
                    if sender.send(ServerEvent::Private(msg.clone())) {
                        delivered += 1;
                    }
                }
                if recipient != msg.user {
                    if let Some(conn) = registry.get(recipient) {
                        if conn.send(ServerEvent::Private(msg.clone())) {
                            delivered += 1;
                        }
                    }
                }
                delivered
            }
        }
    }

    /// Tell every instance (this one included) that the roster changed.
    pub async fn announce_presence(&self) -> Result<(), Error> {
        let notice = PresenceNotice {
            instance_id: self.instance_id.clone(),
        };
        let payload = serde_json::to_string(&notice)?;
        self.store
            .publish(&self.keys.presence_channel(), &payload)
            .await
    }

    /// Push the current global roster to every local session.
    pub async fn refresh_roster(&self, registry: &ConnectionRegistry) -> Result<usize, Error> {
        let mut users: Vec<String> = self.presence.list_global().await?.into_iter().collect();
        users.sort();
        tracing::trace!(users = users.len(), "Pushing roster to local sessions");
        Ok(registry.broadcast(&ServerEvent::Users(users)))
    }

    /// Decode a payload received on one of [`channels`](Self::channels).
    pub fn decode(&self, msg: &BusMessage) -> Result<Inbound, Error> {
        if msg.channel == self.keys.messages_channel() {
            ChatMessage::from_bus(&msg.payload).map(Inbound::Chat)
        } else if msg.channel == self.keys.presence_channel() {
            serde_json::from_str(&msg.payload)
                .map(Inbound::PresenceChanged)
                .map_err(|e| Error::malformed(e.to_string()))
        } else {
            Err(Error::malformed(format!("unexpected channel {}", msg.channel)))
        }
    }
}
