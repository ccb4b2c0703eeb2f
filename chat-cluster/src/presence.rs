use std::collections::HashSet;
use std::sync::Arc;

use crate::{Error, Keyspace, SharedStore};

/// Outcome of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Accepted,
    /// The username is already connected somewhere in the cluster.
    Conflict,
}

impl Registration {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Cluster-wide presence: the global username set plus one owned set per instance.
///
/// Invariant: the union of all owned sets equals the global set, and a
/// username is in at most one owned set.
#[derive(Clone)]
pub struct PresenceStore {
    store: Arc<dyn SharedStore>,
    keys: Keyspace,
}

impl PresenceStore {
    pub fn new(store: Arc<dyn SharedStore>, keys: Keyspace) -> Self {
        Self { store, keys }
    }

    /// Claim `username` for `instance_id`.
    ///
    /// The presence check and both set insertions happen in one atomic store
    /// operation, so concurrent claims from any number of instances resolve
    /// to a single winner.
    pub async fn try_register(
        &self,
        username: &str,
        instance_id: &str,
    ) -> Result<Registration, Error> {
        let added = self
            .store
            .insert_unique(
                &self.keys.connected_users(),
                &self.keys.users_on(instance_id),
                username,
            )
            .await?;

        if added {
            tracing::debug!(%username, %instance_id, "Username registered");
            Ok(Registration::Accepted)
        } else {
            tracing::debug!(%username, %instance_id, "Username already taken");
            Ok(Registration::Conflict)
        }
    }

    /// Release `username` if `instance_id` still owns it. Removing an absent
    /// name is a no-op.
    pub async fn unregister(&self, username: &str, instance_id: &str) -> Result<bool, Error> {
        let released = self
            .bulk_unregister(&[username.to_string()], instance_id)
            .await?;
        Ok(!released.is_empty())
    }

    /// Release many usernames of one instance.
    ///
    /// Only names still in the instance's owned set are removed, both sets in
    /// one atomic step. A name a peer evicted and someone else claimed since
    /// stays with its new owner. Returns the names actually released.
    pub async fn bulk_unregister(
        &self,
        usernames: &[String],
        instance_id: &str,
    ) -> Result<Vec<String>, Error> {
        if usernames.is_empty() {
            return Ok(Vec::new());
        }
        self.store
            .release_owned(
                &self.keys.users_on(instance_id),
                &self.keys.connected_users(),
                usernames,
            )
            .await
    }

    pub async fn list_global(&self) -> Result<HashSet<String>, Error> {
        self.store.set_members(&self.keys.connected_users()).await
    }

    pub async fn list_owned_by(&self, instance_id: &str) -> Result<HashSet<String>, Error> {
        self.store.set_members(&self.keys.users_on(instance_id)).await
    }

    /// Remove every user `instance_id` owns from global presence and delete
    /// its owned set, atomically. Returns the removed names, sorted.
    ///
    /// Concurrent calls for the same instance are harmless: only the first
    /// finds anything to remove.
    pub async fn drop_instance(&self, instance_id: &str) -> Result<Vec<String>, Error> {
        let mut usernames = self
            .store
            .drain_owned(&self.keys.users_on(instance_id), &self.keys.connected_users())
            .await?;
        usernames.sort();
        Ok(usernames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    fn presence() -> PresenceStore {
        PresenceStore::new(Arc::new(MemoryStore::new()), Keyspace::new("test"))
    }

    #[tokio::test]
    async fn test_second_registration_conflicts() {
        let presence = presence();

        let first = presence.try_register("alice", "s1").await.unwrap();
        let second = presence.try_register("alice", "s2").await.unwrap();

        assert_eq!(first, Registration::Accepted);
        assert_eq!(second, Registration::Conflict);
        assert!(presence.list_owned_by("s2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let presence = presence();
        presence.try_register("alice", "s1").await.unwrap();
        presence.try_register("bob", "s1").await.unwrap();

        presence.unregister("alice", "s1").await.unwrap();
        let global_once = presence.list_global().await.unwrap();
        let owned_once = presence.list_owned_by("s1").await.unwrap();

        presence.unregister("alice", "s1").await.unwrap();
        assert_eq!(presence.list_global().await.unwrap(), global_once);
        assert_eq!(presence.list_owned_by("s1").await.unwrap(), owned_once);
        assert_eq!(global_once, HashSet::from(["bob".to_string()]));
    }

    #[tokio::test]
    async fn test_released_name_can_be_claimed_elsewhere() {
        let presence = presence();

        assert!(presence.try_register("alice", "s1").await.unwrap().is_accepted());
        presence.unregister("alice", "s1").await.unwrap();
        assert!(presence.try_register("alice", "s2").await.unwrap().is_accepted());

        assert_eq!(
            presence.list_owned_by("s2").await.unwrap(),
            HashSet::from(["alice".to_string()])
        );
    }

    #[tokio::test]
    async fn test_owned_sets_union_matches_global() {
        let presence = presence();
        for (user, instance) in [("a", "s1"), ("b", "s1"), ("c", "s2"), ("a", "s2")] {
            presence.try_register(user, instance).await.unwrap();
        }

        let mut union = presence.list_owned_by("s1").await.unwrap();
        union.extend(presence.list_owned_by("s2").await.unwrap());
        assert_eq!(union, presence.list_global().await.unwrap());
    }

    #[tokio::test]
    async fn test_bulk_unregister_clears_both_sets() {
        let presence = presence();
        presence.try_register("bob", "s1").await.unwrap();
        presence.try_register("carol", "s1").await.unwrap();
        presence.try_register("dave", "s2").await.unwrap();

        let owned: Vec<String> = presence.list_owned_by("s1").await.unwrap().into_iter().collect();
        presence.bulk_unregister(&owned, "s1").await.unwrap();

        assert_eq!(
            presence.list_global().await.unwrap(),
            HashSet::from(["dave".to_string()])
        );
        assert!(presence.list_owned_by("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unregister_leaves_names_owned_elsewhere() {
        let presence = presence();
        presence.try_register("alice", "s2").await.unwrap();

        assert!(!presence.unregister("alice", "s1").await.unwrap());
        assert_eq!(
            presence.list_global().await.unwrap(),
            HashSet::from(["alice".to_string()])
        );
        assert!(!presence.try_register("alice", "s3").await.unwrap().is_accepted());
    }

    #[tokio::test]
    async fn test_drop_instance_after_reconnect_keeps_new_owner() {
        let presence = presence();
        presence.try_register("bob", "s1").await.unwrap();

        assert_eq!(presence.drop_instance("s1").await.unwrap(), vec!["bob".to_string()]);
        assert!(presence.try_register("bob", "s4").await.unwrap().is_accepted());
        assert!(presence.drop_instance("s1").await.unwrap().is_empty());

        assert_eq!(
            presence.list_global().await.unwrap(),
            HashSet::from(["bob".to_string()])
        );
        assert_eq!(
            presence.try_register("bob", "s5").await.unwrap(),
            Registration::Conflict
        );
    }
}
