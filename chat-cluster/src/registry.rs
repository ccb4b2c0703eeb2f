use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::metrics::METRICS;
use crate::protocol::ServerEvent;

/// Identity of one transport attachment, assigned before a username exists.
pub type ConnectionId = Uuid;

/// Outbound side of one client connection.
///
/// A bounded queue of server events drained by the transport task. Dropping
/// every handle closes the queue, which ends the transport's session.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<ServerEvent>,
}

impl ConnectionHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: Uuid::new_v4(),
            tx,
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue an event without waiting.
    ///
    /// A slow client whose queue is full loses the event rather than stalling
    /// the instance. Returns whether the event was queued.
    pub fn send(&self, event: ServerEvent) -> bool {
        let is_chat = event.is_chat();
        match self.tx.try_send(event) {
            Ok(()) => {
                if is_chat {
                    METRICS.inc_message_delivered();
                }
                true
            }
            Err(TrySendError::Full(_)) => {
                METRICS.inc_event_dropped();
                tracing::warn!(connection_id = %self.id, "Client queue full, dropping event");
                false
            }
            // Transport already gone; its Disconnect is on the way
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Username -> live local connection. Exclusive to one instance, so no locking.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<String, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, username: impl Into<String>, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.connections.insert(username.into(), handle)
    }

    pub fn remove(&mut self, username: &str) -> Option<ConnectionHandle> {
        self.connections.remove(username)
    }

    /// `None` for users connected to other instances.
    pub fn get(&self, username: &str) -> Option<&ConnectionHandle> {
        self.connections.get(username)
    }

    pub fn contains(&self, username: &str) -> bool {
        self.connections.contains_key(username)
    }

    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn drain(&mut self) -> Vec<(String, ConnectionHandle)> {
        self.connections.drain().collect()
    }

    /// Queue `event` on every local connection. Returns how many accepted it.
    pub fn broadcast(&self, event: &ServerEvent) -> usize {
        self.connections
            .values()
            .filter(|handle| handle.send(event.clone()))
            .count()
    }
}
