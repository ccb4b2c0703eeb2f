use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::{HashMap, HashSet};

use crate::Error;

/// A payload received from one of the shared pub/sub channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// Stream of bus messages for a subscription. Ends when the underlying
/// connection is lost; callers resubscribe.
pub type BusStream = BoxStream<'static, BusMessage>;

/// The shared key-value / set / pub-sub service all instances coordinate through.
///
/// Every component talks to this trait, never to a concrete client, so the
/// whole coordination layer runs unchanged against Redis or [`MemoryStore`].
///
/// [`MemoryStore`]: crate::MemoryStore
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Add `member` to the set at `unique_key` and, only if it was not already
    /// there, to the set at `owner_key` as well.
    ///
    /// Must be atomic: two concurrent callers with the same member produce
    /// exactly one `true`.
    async fn insert_unique(
        &self,
        unique_key: &str,
        owner_key: &str,
        member: &str,
    ) -> Result<bool, Error>;

    /// Remove each of `members` that is still in the set at `owner_key` from
    /// that set and from the set at `unique_key`. Members the owner no longer
    /// holds are left alone in both sets.
    ///
    /// Must be atomic per call. Returns the members actually removed.
    async fn release_owned(
        &self,
        owner_key: &str,
        unique_key: &str,
        members: &[String],
    ) -> Result<Vec<String>, Error>;

    /// Empty the set at `owner_key`, removing every one of its members from
    /// the set at `unique_key`, and delete it.
    ///
    /// Must be atomic: of two concurrent callers, the second finds nothing to
    /// remove. Returns the drained members.
    async fn drain_owned(&self, owner_key: &str, unique_key: &str) -> Result<Vec<String>, Error>;

    async fn set_members(&self, key: &str) -> Result<HashSet<String>, Error>;

    /// Returns `true` when the field did not exist before.
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<bool, Error>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, Error>;

    async fn hash_delete(&self, key: &str, field: &str) -> Result<(), Error>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), Error>;

    async fn subscribe(&self, channels: &[String]) -> Result<BusStream, Error>;
}
