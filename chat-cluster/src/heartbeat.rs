use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::metrics::METRICS;
use crate::{Error, Keyspace, PresenceStore, SharedStore};

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 100;
pub const DEFAULT_HEARTBEAT_THRESHOLD_MS: u64 = 200;

/// An instance's liveness as judged by an observer from its heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Heartbeat no older than one period.
    Alive,
    /// Missed at least one beat but still within the threshold.
    Suspect,
    /// Older than the threshold; the instance gets evicted.
    Dead,
}

impl Liveness {
    pub fn classify(age: Duration, period: Duration, threshold: Duration) -> Self {
        if age <= period {
            Self::Alive
        } else if age <= threshold {
            Self::Suspect
        } else {
            Self::Dead
        }
    }
}

/// Users removed from presence because their instance stopped beating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub instance_id: String,
    pub usernames: Vec<String>,
}

/// Writes this instance's heartbeat and evicts instances whose heartbeat went stale.
///
/// Every instance runs its own monitor with no coordination between them.
/// Eviction drains the dead instance's owned set atomically, so observers
/// racing on the same instance cannot remove each other's later registrations.
pub struct HeartbeatMonitor {
    store: Arc<dyn SharedStore>,
    presence: PresenceStore,
    keys: Keyspace,
    instance_id: String,
    period: Duration,
    threshold: Duration,
    announced: AtomicBool,
}

impl HeartbeatMonitor {
    pub fn new(
        store: Arc<dyn SharedStore>,
        keys: Keyspace,
        instance_id: impl Into<String>,
        period: Duration,
        threshold: Duration,
    ) -> Self {
        Self {
            presence: PresenceStore::new(store.clone(), keys.clone()),
            store,
            keys,
            instance_id: instance_id.into(),
            period,
            threshold,
            announced: AtomicBool::new(false),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Write the current timestamp under this instance's id.
    ///
    /// Returns `true` when the record had to be recreated after a previous
    /// beat, which means a peer declared this instance dead and evicted it.
    pub async fn beat(&self) -> Result<bool, Error> {
        let created = self
            .store
            .hash_set(
                &self.keys.heartbeats(),
                &self.instance_id,
                &current_timestamp_ms().to_string(),
            )
            .await?;

        let was_announced = self.announced.swap(true, Ordering::Relaxed);
        let evicted = created && was_announced;
        if evicted {
            tracing::warn!(
                instance_id = %self.instance_id,
                "Heartbeat record was missing, this instance was evicted by a peer"
            );
        }
        Ok(evicted)
    }

    /// Ids of every other instance whose heartbeat is older than the threshold at `now_ms`.
    pub async fn scan(&self, now_ms: u64) -> Result<Vec<String>, Error> {
        let records = self.store.hash_get_all(&self.keys.heartbeats()).await?;
        let mut dead = Vec::new();

        for (instance_id, value) in records {
            if instance_id == self.instance_id {
                continue;
            }

            let liveness = match value.parse::<u64>() {
                Ok(last_seen) => {
                    let age = Duration::from_millis(now_ms.saturating_sub(last_seen));
                    Liveness::classify(age, self.period, self.threshold)
                }
                // Garbage can never become fresh again
                Err(_) => {
                    tracing::warn!(%instance_id, %value, "Unparseable heartbeat value");
                    Liveness::Dead
                }
            };

            match liveness {
                Liveness::Alive => {}
                Liveness::Suspect => {
                    tracing::trace!(%instance_id, "Instance missed a heartbeat");
                }
                Liveness::Dead => dead.push(instance_id),
            }
        }

        dead.sort();
        Ok(dead)
    }

    /// Remove a dead instance's users from presence and its owned set in one
    /// atomic step, then its heartbeat record.
    ///
    /// A second observer evicting the same instance finds an empty owned set,
    /// so a user who already reconnected elsewhere is never touched.
    pub async fn evict(&self, instance_id: &str) -> Result<Eviction, Error> {
        let usernames = self.presence.drop_instance(instance_id).await?;
        self.store
            .hash_delete(&self.keys.heartbeats(), instance_id)
            .await?;

        METRICS.inc_instances_evicted();
        METRICS.add_users_evicted(usernames.len() as u64);
        tracing::info!(
            observer = %self.instance_id,
            %instance_id,
            users = usernames.len(),
            "Evicted stale instance"
        );

        Ok(Eviction {
            instance_id: instance_id.to_string(),
            usernames,
        })
    }

    /// One liveness pass: scan the table and evict everything found dead.
    pub async fn scan_and_evict(&self) -> Result<Vec<Eviction>, Error> {
        let dead = self.scan(current_timestamp_ms()).await?;
        let mut evictions = Vec::with_capacity(dead.len());
        for instance_id in dead {
            evictions.push(self.evict(&instance_id).await?);
        }
        Ok(evictions)
    }

    /// Remove this instance's own heartbeat record (graceful shutdown).
    pub async fn withdraw(&self) -> Result<(), Error> {
        self.store
            .hash_delete(&self.keys.heartbeats(), &self.instance_id)
            .await
    }
}

/// Exponential backoff for consecutive heartbeat failures.
///
/// 100ms × 2^n with n capped at 6. Ticks arriving before the retry point are
/// skipped instead of slept through, so the dispatch loop keeps serving
/// clients while the store is down.
#[derive(Debug, Default)]
pub struct Backoff {
    consecutive_failures: u32,
    retry_at: Option<Instant>,
}

impl Backoff {
    pub fn ready(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |at| now >= at)
    }

    pub fn record_failure(&mut self, now: Instant) -> Duration {
        self.consecutive_failures += 1;
        let delay = Duration::from_millis(100 * 2u64.pow(self.consecutive_failures.min(6)));
        self.retry_at = Some(now + delay);
        delay
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.retry_at = None;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use std::collections::HashSet;

    const PERIOD: Duration = Duration::from_millis(100);
    const THRESHOLD: Duration = Duration::from_millis(200);

    fn monitor(store: &Arc<MemoryStore>, instance_id: &str) -> HeartbeatMonitor {
        HeartbeatMonitor::new(
            store.clone(),
            Keyspace::new("test"),
            instance_id,
            PERIOD,
            THRESHOLD,
        )
    }

    #[test]
    fn test_liveness_classification() {
        let ms = Duration::from_millis;
        assert_eq!(Liveness::classify(ms(0), PERIOD, THRESHOLD), Liveness::Alive);
        assert_eq!(Liveness::classify(ms(100), PERIOD, THRESHOLD), Liveness::Alive);
        assert_eq!(Liveness::classify(ms(150), PERIOD, THRESHOLD), Liveness::Suspect);
        assert_eq!(Liveness::classify(ms(200), PERIOD, THRESHOLD), Liveness::Suspect);
        assert_eq!(Liveness::classify(ms(201), PERIOD, THRESHOLD), Liveness::Dead);
    }

    #[test]
    fn test_backoff_grows_and_resets() {
        let now = Instant::now();
        let mut backoff = Backoff::default();
        assert!(backoff.ready(now));

        assert_eq!(backoff.record_failure(now), Duration::from_millis(200));
        assert!(!backoff.ready(now));
        assert_eq!(backoff.record_failure(now), Duration::from_millis(400));
        for _ in 0..10 {
            backoff.record_failure(now);
        }
        assert_eq!(backoff.record_failure(now), Duration::from_millis(6400));
        assert!(backoff.ready(now + Duration::from_secs(7)));

        backoff.record_success();
        assert_eq!(backoff.consecutive_failures(), 0);
        assert!(backoff.ready(now));
    }

    #[tokio::test]
    async fn test_scan_ignores_fresh_and_self() {
        let store = Arc::new(MemoryStore::new());
        let s1 = monitor(&store, "s1");
        let s2 = monitor(&store, "s2");

        s1.beat().await.unwrap();
        s2.beat().await.unwrap();

        let now = current_timestamp_ms();
        assert!(s1.scan(now).await.unwrap().is_empty());

        // s1's own record is ancient from its own point of view, still not evicted
        assert_eq!(s1.scan(now + 10_000).await.unwrap(), vec!["s2".to_string()]);
    }

    #[tokio::test]
    async fn test_stale_instance_users_are_evicted() {
        let store = Arc::new(MemoryStore::new());
        let keys = Keyspace::new("test");
        let presence = PresenceStore::new(store.clone(), keys.clone());
        let s2 = monitor(&store, "s2");

        presence.try_register("bob", "s1").await.unwrap();
        presence.try_register("carol", "s1").await.unwrap();
        presence.try_register("dave", "s2").await.unwrap();

        let stale = (current_timestamp_ms() - 5_000).to_string();
        store.hash_set(&keys.heartbeats(), "s1", &stale).await.unwrap();
        s2.beat().await.unwrap();

        let evictions = s2.scan_and_evict().await.unwrap();
        assert_eq!(
            evictions,
            vec![Eviction {
                instance_id: "s1".into(),
                usernames: vec!["bob".into(), "carol".into()],
            }]
        );

        assert_eq!(
            presence.list_global().await.unwrap(),
            HashSet::from(["dave".to_string()])
        );
        assert!(presence.list_owned_by("s1").await.unwrap().is_empty());
        let heartbeats = store.hash_get_all(&keys.heartbeats()).await.unwrap();
        assert!(!heartbeats.contains_key("s1"));
        assert!(heartbeats.contains_key("s2"));
    }

    #[tokio::test]
    async fn test_double_eviction_is_harmless() {
        let store = Arc::new(MemoryStore::new());
        let keys = Keyspace::new("test");
        let presence = PresenceStore::new(store.clone(), keys.clone());
        let s2 = monitor(&store, "s2");
        let s3 = monitor(&store, "s3");

        presence.try_register("bob", "s1").await.unwrap();
        presence.try_register("eve", "s3").await.unwrap();
        store.hash_set(&keys.heartbeats(), "s1", "0").await.unwrap();

        let (a, b) = tokio::join!(s2.evict("s1"), s3.evict("s1"));
        let mut evicted = a.unwrap().usernames;
        evicted.extend(b.unwrap().usernames);

        assert_eq!(evicted, vec!["bob".to_string()], "bob is evicted exactly once");
        assert_eq!(
            presence.list_global().await.unwrap(),
            HashSet::from(["eve".to_string()])
        );
    }

    #[tokio::test]
    async fn test_late_eviction_spares_user_who_reconnected() {
        let store = Arc::new(MemoryStore::new());
        let keys = Keyspace::new("test");
        let presence = PresenceStore::new(store.clone(), keys.clone());
        let s2 = monitor(&store, "s2");
        let s3 = monitor(&store, "s3");

        presence.try_register("bob", "s1").await.unwrap();
        store.hash_set(&keys.heartbeats(), "s1", "0").await.unwrap();

        // s2 evicts s1 and bob reconnects on s4 before s3 runs its own eviction
        assert_eq!(s2.evict("s1").await.unwrap().usernames, vec!["bob".to_string()]);
        assert!(presence.try_register("bob", "s4").await.unwrap().is_accepted());
        assert!(s3.evict("s1").await.unwrap().usernames.is_empty());

        assert_eq!(
            presence.list_global().await.unwrap(),
            HashSet::from(["bob".to_string()])
        );
        assert_eq!(
            presence.list_owned_by("s4").await.unwrap(),
            HashSet::from(["bob".to_string()])
        );
        assert!(
            !presence.try_register("bob", "s5").await.unwrap().is_accepted(),
            "A second live bob must be refused"
        );
    }

    #[tokio::test]
    async fn test_concurrent_evictions_and_reconnects_keep_presence_consistent() {
        let store = Arc::new(MemoryStore::new());
        let keys = Keyspace::new("test");
        let presence = PresenceStore::new(store.clone(), keys.clone());
        let users: Vec<String> = (0..20).map(|i| format!("user{}", i)).collect();

        for user in &users {
            presence.try_register(user, "s1").await.unwrap();
        }
        store.hash_set(&keys.heartbeats(), "s1", "0").await.unwrap();

        let mut tasks = Vec::new();
        for observer in ["s2", "s3", "s4"] {
            let observer = Arc::new(monitor(&store, observer));
            tasks.push(tokio::spawn(async move {
                for _ in 0..5 {
                    observer.evict("s1").await.unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        let reconnect = {
            let presence = presence.clone();
            let users = users.clone();
            tokio::spawn(async move {
                for user in &users {
                    // Retry until the eviction has freed the name
                    while !presence.try_register(user, "s9").await.unwrap().is_accepted() {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };
        for task in tasks {
            task.await.unwrap();
        }
        reconnect.await.unwrap();

        let expected: HashSet<String> = users.into_iter().collect();
        assert_eq!(presence.list_owned_by("s9").await.unwrap(), expected);
        assert_eq!(presence.list_global().await.unwrap(), expected);
        assert!(presence.list_owned_by("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_heartbeat_counts_as_dead() {
        let store = Arc::new(MemoryStore::new());
        let keys = Keyspace::new("test");
        let s1 = monitor(&store, "s1");

        store
            .hash_set(&keys.heartbeats(), "broken", "not-a-number")
            .await
            .unwrap();

        assert_eq!(
            s1.scan(current_timestamp_ms()).await.unwrap(),
            vec!["broken".to_string()]
        );
    }

    #[tokio::test]
    async fn test_beat_detects_eviction_by_peer() {
        let store = Arc::new(MemoryStore::new());
        let keys = Keyspace::new("test");
        let s1 = monitor(&store, "s1");

        assert!(!s1.beat().await.unwrap(), "First beat creates the record");
        assert!(!s1.beat().await.unwrap());

        store.hash_delete(&keys.heartbeats(), "s1").await.unwrap();
        assert!(s1.beat().await.unwrap(), "Recreated record means eviction");
    }

    #[tokio::test]
    async fn test_withdraw_removes_own_record() {
        let store = Arc::new(MemoryStore::new());
        let keys = Keyspace::new("test");
        let s1 = monitor(&store, "s1");

        s1.beat().await.unwrap();
        s1.withdraw().await.unwrap();

        assert!(store.hash_get_all(&keys.heartbeats()).await.unwrap().is_empty());
    }
}
