//! In-process soft-state cache for working contexts, thread lookups, and
//! handler-defined namespaces.
//!
//! Values are JSON blobs. Each entry carries its own TTL, chosen from the key's
//! namespace (`memoria:`, `thread:`, anything else). Nothing here is
//! authoritative: a disabled cache turns every operation into a miss or no-op.

use moka::sync::Cache;
use moka::Expiry;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

use crate::config::CacheConfig;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

pub fn memoria_key(session_id: &str) -> String {
    format!("memoria:{session_id}")
}

pub fn thread_key(thread_id: &str) -> String {
    format!("thread:{thread_id}")
}

/// `llm:<sha256(prompt, model, session)>`.
pub fn llm_key(prompt: &str, model: &str, session_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update([0u8]);
    hasher.update(model.as_bytes());
    hasher.update([0u8]);
    hasher.update(session_id.as_bytes());
    format!("llm:{:x}", hasher.finalize())
}

pub struct ContextCache {
    inner: Option<Cache<String, Entry>>,
    memoria_ttl: Duration,
    thread_ttl: Duration,
    default_ttl: Duration,
}

impl ContextCache {
    pub fn new(config: &CacheConfig) -> Self {
        let inner = config.enabled.then(|| {
            Cache::builder()
                .max_capacity(config.capacity)
                .expire_after(PerEntryTtl)
                .build()
        });
        Self {
            inner,
            memoria_ttl: Duration::from_secs(config.memoria_ttl_secs),
            thread_ttl: Duration::from_secs(config.thread_ttl_secs),
            default_ttl: Duration::from_secs(config.default_ttl_secs),
        }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self::new(&CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// TTL applied to `key` by [`set`](Self::set).
    pub fn ttl_for(&self, key: &str) -> Duration {
        match key.split_once(':').map(|(ns, _)| ns) {
            Some("memoria") => self.memoria_ttl,
            Some("thread") => self.thread_ttl,
            _ => self.default_ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.as_ref()?.get(key).map(|e| e.value)
    }

    pub fn set(&self, key: &str, value: Value) {
        let ttl = self.ttl_for(key);
        self.set_with_ttl(key, value, ttl);
    }

    pub fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) {
        if let Some(cache) = &self.inner {
            cache.insert(key.to_string(), Entry { value, ttl });
        }
    }

    pub fn delete(&self, key: &str) {
        if let Some(cache) = &self.inner {
            cache.invalidate(key);
        }
    }

    /// Live keys starting with `prefix`, sorted.
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        let Some(cache) = &self.inner else {
            return Vec::new();
        };
        let mut keys: Vec<String> = cache
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.as_ref().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Whether the cache is reachable. The in-process cache is reachable iff enabled.
    pub fn ping(&self) -> bool {
        self.is_enabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache() -> ContextCache {
        ContextCache::new(&CacheConfig::default())
    }

    #[test]
    fn set_get_delete() {
        let c = cache();
        c.set("memoria:S1", json!({"total": 3}));
        assert_eq!(c.get("memoria:S1"), Some(json!({"total": 3})));
        c.delete("memoria:S1");
        assert_eq!(c.get("memoria:S1"), None);
    }

    #[test]
    fn ttl_by_namespace() {
        let c = cache();
        assert_eq!(c.ttl_for(&memoria_key("S1")), Duration::from_secs(600));
        assert_eq!(c.ttl_for(&thread_key("T1")), Duration::from_secs(86_400));
        assert_eq!(c.ttl_for("llm:abc"), Duration::from_secs(600));
    }

    #[test]
    fn entries_expire() {
        let c = cache();
        c.set_with_ttl("llm:x", json!(1), Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(c.get("llm:x"), None);
    }

    #[test]
    fn keys_by_prefix() {
        let c = cache();
        c.set("memoria:b", json!(1));
        c.set("memoria:a", json!(2));
        c.set("thread:t", json!(3));
        c.inner.as_ref().unwrap().run_pending_tasks();
        assert_eq!(c.keys("memoria:"), vec!["memoria:a", "memoria:b"]);
    }

    #[test]
    fn disabled_cache_is_inert() {
        let c = ContextCache::disabled();
        c.set("memoria:S1", json!(1));
        assert_eq!(c.get("memoria:S1"), None);
        assert!(c.keys("").is_empty());
        assert!(!c.ping());
    }

    #[test]
    fn llm_key_is_stable_and_distinct() {
        let a = llm_key("hola", "gpt", "S1");
        assert_eq!(a, llm_key("hola", "gpt", "S1"));
        assert_ne!(a, llm_key("hola", "gpt", "S2"));
        assert!(a.starts_with("llm:"));
        assert_eq!(a.len(), 4 + 64);
    }
}
