use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, Mutex};

use crate::store::{BusMessage, BusStream, SharedStore};
use crate::Error;

const BUS_CAPACITY: usize = 1024;

#[derive(Default)]
struct Tables {
    sets: HashMap<String, HashSet<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

impl Tables {
    fn remove_members(&mut self, key: &str, members: &[String]) {
        if let Some(set) = self.sets.get_mut(key) {
            for member in members {
                set.remove(member);
            }
        }
        self.drop_if_empty(key);
    }

    // Redis deletes a set when its last member goes
    fn drop_if_empty(&mut self, key: &str) {
        if self.sets.get(key).is_some_and(HashSet::is_empty) {
            self.sets.remove(key);
        }
    }
}

/// In-process [`SharedStore`].
///
/// Several `ChatInstance`s holding clones of one `Arc<MemoryStore>` behave like
/// instances sharing one Redis, which is how the cluster scenarios are tested.
/// [`set_available`](Self::set_available) simulates an outage.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    bus: broadcast::Sender<BusMessage>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            tables: Mutex::new(Tables::default()),
            bus,
            available: AtomicBool::new(true),
        }
    }

    /// Toggle simulated reachability. While unavailable every operation fails
    /// with [`Error::StoreUnavailable`]; existing subscriptions stay open.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), Error> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::StoreUnavailable("memory store marked unavailable".into()))
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn insert_unique(
        &self,
        unique_key: &str,
        owner_key: &str,
        member: &str,
    ) -> Result<bool, Error> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        let added = tables
            .sets
            .entry(unique_key.to_string())
            .or_default()
            .insert(member.to_string());
        if added {
            tables
                .sets
                .entry(owner_key.to_string())
                .or_default()
                .insert(member.to_string());
        }
        Ok(added)
    }

    async fn release_owned(
        &self,
        owner_key: &str,
        unique_key: &str,
        members: &[String],
    ) -> Result<Vec<String>, Error> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        let released: Vec<String> = match tables.sets.get_mut(owner_key) {
            Some(owned) => members
                .iter()
                .filter(|member| owned.remove(member.as_str()))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        tables.remove_members(unique_key, &released);
        tables.drop_if_empty(owner_key);
        Ok(released)
    }

    async fn drain_owned(&self, owner_key: &str, unique_key: &str) -> Result<Vec<String>, Error> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        let drained: Vec<String> = tables
            .sets
            .remove(owner_key)
            .map(|owned| owned.into_iter().collect())
            .unwrap_or_default();
        tables.remove_members(unique_key, &drained);
        Ok(drained)
    }

    async fn set_members(&self, key: &str) -> Result<HashSet<String>, Error> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        Ok(tables.sets.get(key).cloned().unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<bool, Error> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        let previous = tables
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(previous.is_none())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, Error> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        Ok(tables.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<(), Error> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        if let Some(hash) = tables.hashes.get_mut(key) {
            hash.remove(field);
            if hash.is_empty() {
                tables.hashes.remove(key);
            }
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), Error> {
        self.check_available()?;
        // No subscribers is not an error, same as PUBLISH returning 0
        let _ = self.bus.send(BusMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<BusStream, Error> {
        self.check_available()?;
        let rx = self.bus.subscribe();
        let channels: HashSet<String> = channels.iter().cloned().collect();

        let stream = futures_util::stream::unfold((rx, channels), |(mut rx, channels)| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) if channels.contains(&msg.channel) => {
                        return Some((msg, (rx, channels)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Memory bus subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream.boxed())
    }
}
