use std::collections::HashMap;

use crate::metrics::METRICS;
use crate::presence::Registration;
use crate::protocol::{validate_username, ServerEvent};
use crate::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry};
use crate::{Error, PresenceStore};

/// Result of a `setUsername` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    Accepted,
    /// Name taken somewhere in the cluster.
    Conflict,
    /// Name violates the username rules; the store was not consulted.
    Invalid(&'static str),
    /// The connection already has a live session.
    AlreadyLive,
    /// The connection was never opened or is already closed.
    UnknownConnection,
}

/// Connect / negotiate / disconnect for one instance.
///
/// A connection is *pending* from `open` until its username is accepted and
/// *live* from then until `close`. Only live connections are in presence and
/// in the [`ConnectionRegistry`]; a rejected name leaves the connection
/// pending so the client can try another.
pub struct SessionLifecycle {
    presence: PresenceStore,
    instance_id: String,
    pending: HashMap<ConnectionId, ConnectionHandle>,
    live: HashMap<ConnectionId, String>,
    registry: ConnectionRegistry,
    unreleased: Vec<String>,
}

impl SessionLifecycle {
    pub fn new(presence: PresenceStore, instance_id: impl Into<String>) -> Self {
        Self {
            presence,
            instance_id: instance_id.into(),
            pending: HashMap::new(),
            live: HashMap::new(),
            registry: ConnectionRegistry::new(),
            unreleased: Vec::new(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn username_of(&self, connection_id: ConnectionId) -> Option<&str> {
        self.live.get(&connection_id).map(String::as_str)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Attach a new connection and prompt it for a username.
    pub fn open(&mut self, handle: ConnectionHandle) {
        tracing::debug!(connection_id = %handle.id(), "Connection opened");
        handle.send(ServerEvent::RequestUsername);
        self.pending.insert(handle.id(), handle);
    }

    /// Try to bind `username` to a pending connection.
    ///
    /// The client always gets an `isValid` answer when the connection is
    /// pending. On acceptance it also gets `serverName`; announcing the new
    /// roster is left to the caller.
    pub async fn negotiate(
        &mut self,
        connection_id: ConnectionId,
        username: &str,
    ) -> Result<Negotiation, Error> {
        if self.live.contains_key(&connection_id) {
            tracing::warn!(%connection_id, %username, "Username change on a live session ignored");
            return Ok(Negotiation::AlreadyLive);
        }
        let Some(handle) = self.pending.get(&connection_id) else {
            return Ok(Negotiation::UnknownConnection);
        };

        if let Err(reason) = validate_username(username) {
            METRICS.inc_registration_rejected();
            handle.send(ServerEvent::IsValid(false));
            tracing::debug!(%connection_id, %username, reason, "Invalid username");
            return Ok(Negotiation::Invalid(reason));
        }

        let registration = match self.presence.try_register(username, &self.instance_id).await {
            Ok(registration) => registration,
            Err(e) => {
                METRICS.inc_registration_rejected();
                handle.send(ServerEvent::IsValid(false));
                return Err(e);
            }
        };

        match registration {
            Registration::Conflict => {
                METRICS.inc_registration_rejected();
                handle.send(ServerEvent::IsValid(false));
                Ok(Negotiation::Conflict)
            }
            Registration::Accepted => {
                let Some(handle) = self.pending.remove(&connection_id) else {
                    return Ok(Negotiation::UnknownConnection);
                };
                handle.send(ServerEvent::IsValid(true));
                handle.send(ServerEvent::ServerName(self.instance_id.clone()));
                self.registry.put(username, handle);
                self.live.insert(connection_id, username.to_string());

                METRICS.inc_registration_accepted();
                METRICS.set_live_sessions(self.live.len() as u64);
                tracing::info!(%username, instance_id = %self.instance_id, "User connected");
                Ok(Negotiation::Accepted)
            }
        }
    }

    /// Tear down a connection. Returns the username if the session was live.
    ///
    /// Local state is always removed. If releasing the name in the store
    /// fails, the name is kept for [`flush_releases`](Self::flush_releases)
    /// and the error is returned.
    pub async fn close(&mut self, connection_id: ConnectionId) -> Result<Option<String>, Error> {
        if self.pending.remove(&connection_id).is_some() {
            tracing::debug!(%connection_id, "Pending connection closed");
            return Ok(None);
        }
        let Some(username) = self.live.remove(&connection_id) else {
            return Ok(None);
        };
        self.registry.remove(&username);
        METRICS.set_live_sessions(self.live.len() as u64);

        match self.presence.unregister(&username, &self.instance_id).await {
            Ok(true) => {}
            // A peer evicted this instance; the name is no longer ours to release
            Ok(false) => tracing::debug!(%username, "Name already released by eviction"),
            Err(e) => {
                self.unreleased.push(username);
                return Err(e);
            }
        }
        tracing::info!(%username, instance_id = %self.instance_id, "User disconnected");
        Ok(Some(username))
    }

    /// Retry releasing names whose unregister failed earlier.
    ///
    /// Names this instance no longer owns are skipped, so a user who was
    /// evicted and reconnected elsewhere keeps the name. Returns `true` when
    /// something was released (the roster changed).
    pub async fn flush_releases(&mut self) -> Result<bool, Error> {
        if self.unreleased.is_empty() {
            return Ok(false);
        }
        let names = std::mem::take(&mut self.unreleased);
        let released = match self.presence.bulk_unregister(&names, &self.instance_id).await {
            Ok(released) => released,
            Err(e) => {
                self.unreleased = names;
                return Err(e);
            }
        };
        tracing::info!(
            released = released.len(),
            skipped = names.len() - released.len(),
            "Released usernames after store recovery"
        );
        Ok(!released.is_empty())
    }

    /// Drop live sessions locally, closing their connections.
    pub fn evict_local(&mut self, usernames: &[String]) -> Vec<String> {
        let mut dropped = Vec::new();
        for username in usernames {
            if self.registry.remove(username).is_some() {
                self.live.retain(|_, name| name != username);
                dropped.push(username.clone());
            }
        }
        if !dropped.is_empty() {
            METRICS.set_live_sessions(self.live.len() as u64);
            tracing::warn!(users = ?dropped, "Dropped local sessions");
        }
        dropped
    }

    /// Re-claim every live username after a peer evicted this instance.
    ///
    /// Pending releases are dropped: the eviction already freed those names
    /// and they may belong to someone else by now. Names another instance
    /// grabbed in the meantime lose their local session. Returns the dropped
    /// names.
    pub async fn reclaim(&mut self) -> Result<Vec<String>, Error> {
        if !self.unreleased.is_empty() {
            tracing::debug!(names = ?self.unreleased, "Evicted, dropping pending releases");
            self.unreleased.clear();
        }

        // try_register reports Conflict for names still in the global set;
        // only those we no longer own were taken by someone else
        let owned = self.presence.list_owned_by(&self.instance_id).await?;
        let mut lost = Vec::new();
        for username in self.registry.usernames() {
            let registration = self.presence.try_register(&username, &self.instance_id).await?;
            if !registration.is_accepted() && !owned.contains(&username) {
                lost.push(username);
            }
        }
        Ok(self.evict_local(&lost))
    }

    /// Release every name this instance owns in one atomic step and forget
    /// all connections.
    pub async fn shutdown(&mut self) -> Result<usize, Error> {
        self.pending.clear();
        self.live.clear();
        self.unreleased.clear();
        self.registry.drain();
        METRICS.set_live_sessions(0);

        let released = self.presence.drop_instance(&self.instance_id).await?;
        tracing::info!(
            instance_id = %self.instance_id,
            released = released.len(),
            "Released all local sessions"
        );
        Ok(released.len())
    }
}
