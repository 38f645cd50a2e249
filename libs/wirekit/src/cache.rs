//! Shared async key/value cache with per-entry TTLs.
//!
//! One cache instance is shared by every service in an application. Keys are
//! namespaced with `boilerplate.CACHE_PREFIX`; `set` without an explicit TTL
//! falls back to `boilerplate.CACHE_TTL`. `CACHE_PROVIDER` selects the
//! backend behind the [`CacheStore`] seam; only the in-memory store ships
//! here, anything else warns and falls back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache as MokaCache;
use parking_lot::RwLock;
use serde_json::Value as JsonValue;

pub const DEFAULT_TTL_SECONDS: u64 = 86_400;

/// Backend behind the shared cache. External stores implement this.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<JsonValue>;
    async fn set(&self, key: String, value: JsonValue, ttl: Duration);
    async fn del(&self, key: &str);
}

#[derive(Clone)]
struct CacheEntry {
    value: JsonValue,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, CacheEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &CacheEntry,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// In-memory store with per-entry expiry.
struct MemoryStore {
    inner: MokaCache<String, CacheEntry>,
}

impl MemoryStore {
    fn new() -> Self {
        Self {
            inner: MokaCache::builder().expire_after(PerEntryTtl).build(),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<JsonValue> {
        self.inner.get(key).await.map(|entry| entry.value)
    }

    async fn set(&self, key: String, value: JsonValue, ttl: Duration) {
        self.inner.insert(key, CacheEntry { value, ttl }).await;
    }

    async fn del(&self, key: &str) {
        self.inner.invalidate(key).await;
    }
}

/// Selected cache backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheProvider {
    Memory,
}

impl CacheProvider {
    /// Resolve `CACHE_PROVIDER`. Unknown providers warn and fall back to
    /// memory.
    #[must_use]
    pub fn resolve(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "memory" => Self::Memory,
            other => {
                tracing::warn!(provider = %other, "unknown cache provider, falling back to memory");
                Self::Memory
            }
        }
    }
}

/// Process-wide async cache.
pub struct Cache {
    store: Box<dyn CacheStore>,
    prefix: RwLock<String>,
    default_ttl_seconds: AtomicU64,
}

impl Cache {
    #[must_use]
    pub fn new() -> Self {
        Self::with_provider(CacheProvider::Memory)
    }

    #[must_use]
    pub fn with_provider(provider: CacheProvider) -> Self {
        let store: Box<dyn CacheStore> = match provider {
            CacheProvider::Memory => Box::new(MemoryStore::new()),
        };
        Self {
            store,
            prefix: RwLock::new(String::new()),
            default_ttl_seconds: AtomicU64::new(DEFAULT_TTL_SECONDS),
        }
    }

    fn scoped(&self, key: &str) -> String {
        let prefix = self.prefix.read();
        if prefix.is_empty() {
            key.to_owned()
        } else {
            format!("{prefix}:{key}")
        }
    }

    pub async fn get(&self, key: &str) -> Option<JsonValue> {
        self.store.get(&self.scoped(key)).await
    }

    /// Store a value. `ttl_seconds` of `None` uses the configured default.
    pub async fn set(&self, key: &str, value: JsonValue, ttl_seconds: Option<u64>) {
        let ttl = Duration::from_secs(
            ttl_seconds.unwrap_or_else(|| self.default_ttl_seconds.load(Ordering::SeqCst)),
        );
        self.store.set(self.scoped(key), value, ttl).await;
    }

    pub async fn del(&self, key: &str) {
        self.store.del(&self.scoped(key)).await;
    }

    pub(crate) fn set_prefix(&self, prefix: &str) {
        *self.prefix.write() = prefix.to_owned();
    }

    pub(crate) fn set_default_ttl(&self, seconds: u64) {
        self.default_ttl_seconds.store(seconds, Ordering::SeqCst);
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}
