use moka::{sync::Cache, Expiry};
use std::{
    any::Any,
    sync::Arc,
    time::{Duration, Instant},
};

/// Lifetime applied to entries inserted without an explicit TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

const MAX_ENTRIES: u64 = 10_000;

/// Process-wide store memoising orchestrator reads and remote documents.
///
/// Values are type-erased so unrelated authorizers can share one
/// instance; consumers namespace their keys (`namespace/<name>`,
/// `imagelist/<url>`). An entry whose TTL has passed is never returned.
#[derive(Clone)]
pub struct ResourceCache {
    entries: Cache<String, Entry>,
}

#[derive(Clone)]
struct Entry {
    value: Arc<dyn Any + Send + Sync>,
    ttl: Duration,
}

struct PerEntryExpiry;

impl Expiry<String, Entry> for PerEntryExpiry {
    fn expire_after_create(&self, _key: &String, entry: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(entry.ttl)
    }
}

impl ResourceCache {
    pub fn new() -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(MAX_ENTRIES)
                .expire_after(PerEntryExpiry)
                .build(),
        }
    }

    /// Looks up a live entry, downcasting it to the consumer's type. A
    /// type mismatch is treated as a miss.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let entry = self.entries.get(key)?;
        entry.value.downcast().ok()
    }

    pub fn insert<T: Any + Send + Sync>(&self, key: impl Into<String>, value: Arc<T>, ttl: Duration) {
        self.entries.insert(key.into(), Entry { value, ttl });
    }

    pub fn insert_default<T: Any + Send + Sync>(&self, key: impl Into<String>, value: Arc<T>) {
        self.insert(key, value, DEFAULT_TTL);
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.invalidate(key);
    }
}

impl Default for ResourceCache {
    fn default() -> Self {
        Self::new()
    }
}
