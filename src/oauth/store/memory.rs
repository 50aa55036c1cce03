//! Process-local credential store.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{KvStore, StorageError};

struct Slot {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory store; expired keys are evicted lazily on access and by [`MemoryStore::reap_expired`].
#[derive(Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every expired key; returns how many were removed
    pub fn reap_expired(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_expired());
        before.saturating_sub(self.slots.len())
    }

    /// Number of stored keys, including not-yet-reaped expired ones
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StorageError> {
        self.slots.insert(key.to_string(), Slot::new(value, ttl));
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool, StorageError> {
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(Slot::new(value, ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let expired = match self.slots.get(key) {
            Some(slot) if !slot.is_expired() => return Ok(Some(slot.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.slots.remove_if(key, |_, slot| slot.is_expired());
        }
        Ok(None)
    }

    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .slots
            .remove(key)
            .and_then(|(_, slot)| (!slot.is_expired()).then_some(slot.value)))
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self
            .slots
            .remove(key)
            .is_some_and(|(_, slot)| !slot.is_expired()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
