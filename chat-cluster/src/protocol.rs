//! Wire formats: events exchanged with clients and payloads carried on the bus.
//!
//! Client frames are JSON objects `{"event": <name>, "data": <payload>}`.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Target value that addresses every connected user.
pub const BROADCAST_TARGET: &str = "main";

/// Longest accepted username, in characters.
pub const MAX_USERNAME_LEN: usize = 64;

/// Where a chat message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    Main,
    User(&'a str),
}

/// A chat message in transit, as published on the bus and sent in `private` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub message: String,
    pub user: String,
    pub to_server: String,
}

impl ChatMessage {
    pub fn broadcast(user: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            user: user.into(),
            to_server: BROADCAST_TARGET.to_string(),
        }
    }

    pub fn direct(
        user: impl Into<String>,
        recipient: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            user: user.into(),
            to_server: recipient.into(),
        }
    }

    pub fn target(&self) -> Target<'_> {
        if self.to_server == BROADCAST_TARGET {
            Target::Main
        } else {
            Target::User(&self.to_server)
        }
    }

    /// Decode a bus payload, rejecting messages without sender or target.
    pub fn from_bus(payload: &str) -> Result<Self, Error> {
        let msg: Self =
            serde_json::from_str(payload).map_err(|e| Error::malformed(e.to_string()))?;
        if msg.user.is_empty() {
            return Err(Error::malformed("missing user"));
        }
        if msg.to_server.trim().is_empty() {
            return Err(Error::malformed("missing toServer"));
        }
        Ok(msg)
    }

    pub fn to_bus(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Payload of a `main` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastPayload {
    pub message: String,
    pub user: String,
}

impl From<&ChatMessage> for BroadcastPayload {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            message: msg.message.clone(),
            user: msg.user.clone(),
        }
    }
}

/// `sendMessage` payload exactly as the client sent it.
///
/// Fields are optional so that missing ones surface as
/// [`Error::MalformedMessage`] rather than a generic decode failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub message: Option<String>,
    pub user: Option<String>,
    pub to_server: Option<String>,
}

impl OutgoingMessage {
    pub fn new(message: impl Into<String>, to_server: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            user: None,
            to_server: Some(to_server.into()),
        }
    }

    /// Validate and attribute to `sender`. The client's own `user` field is
    /// not trusted; the live session's username always wins.
    pub fn into_chat(self, sender: &str) -> Result<ChatMessage, Error> {
        let message = self.message.ok_or_else(|| Error::malformed("missing message"))?;
        let to_server = self
            .to_server
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| Error::malformed("missing toServer"))?;

        if let Some(claimed) = self.user.as_deref() {
            if claimed != sender {
                tracing::debug!(%claimed, %sender, "Ignoring client-supplied sender");
            }
        }

        Ok(ChatMessage {
            message,
            user: sender.to_string(),
            to_server,
        })
    }
}

/// Events a client sends to its instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    SetUsername(String),
    SendMessage(OutgoingMessage),
}

impl ClientEvent {
    pub fn parse(frame: &str) -> Result<Self, Error> {
        serde_json::from_str(frame).map_err(|e| Error::malformed(e.to_string()))
    }
}

/// Events an instance pushes to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    RequestUsername,
    IsValid(bool),
    ServerName(String),
    Users(Vec<String>),
    Main(BroadcastPayload),
    Private(ChatMessage),
}

impl ServerEvent {
    pub fn to_frame(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    /// A chat message, as opposed to handshake and roster traffic.
    pub fn is_chat(&self) -> bool {
        matches!(self, Self::Main(_) | Self::Private(_))
    }
}

/// Published on the presence channel whenever an instance changes the roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceNotice {
    pub instance_id: String,
}

/// Why a proposed username is unusable regardless of who else is online.
pub fn validate_username(username: &str) -> Result<(), &'static str> {
    if username.trim().is_empty() {
        return Err("username is empty");
    }
    if username.chars().count() > MAX_USERNAME_LEN {
        return Err("username is too long");
    }
    if username == BROADCAST_TARGET {
        return Err("username is reserved");
    }
    Ok(())
}
