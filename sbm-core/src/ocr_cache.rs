//! Content-addressed OCR-text cache with a TTL, so re-parsing the same PDF
//! or screenshot bytes doesn't re-invoke the OCR collaborator.

use std::collections::HashMap;

use tokio::sync::Mutex;

use sbm_common::time::TimestampMillis;
use sbm_common::{hex, sha256};

struct Entry {
    text: String,
    inserted_at: TimestampMillis,
}

pub struct OcrCache {
    ttl_ms: i64,
    entries: Mutex<HashMap<String, Entry>>,
}

impl OcrCache {
    /// `ttl_hours == 0` means entries never expire.
    pub fn new(ttl_hours: u64) -> Self {
        Self {
            ttl_ms: (ttl_hours as i64) * 60 * 60 * 1000,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn key_for(bytes: &[u8]) -> String {
        hex::encode(sha256::digest(bytes).as_ref())
    }

    fn is_expired(&self, entry: &Entry, now: TimestampMillis) -> bool {
        self.ttl_ms != 0 && now.as_i64() - entry.inserted_at.as_i64() > self.ttl_ms
    }

    /// Returns the cached text for `key`, if present and not yet expired.
    pub async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get(key) else {
            return None;
        };
        if self.is_expired(entry, TimestampMillis::now()) {
            entries.remove(key);
            return None;
        }
        Some(entry.text.clone())
    }

    pub async fn put(&self, key: String, text: String) {
        let mut entries = self.entries.lock().await;
        entries.insert(key, Entry { text, inserted_at: TimestampMillis::now() });
    }

    /// Drop every entry older than the TTL; call periodically. A no-op when
    /// the TTL is 0 (never expire).
    pub async fn evict_expired(&self) -> usize {
        if self.ttl_ms == 0 {
            return 0;
        }
        let mut entries = self.entries.lock().await;
        let now = TimestampMillis::now();
        let before = entries.len();
        entries.retain(|_, e| now.as_i64() - e.inserted_at.as_i64() <= self.ttl_ms);
        before - entries.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let cache = OcrCache::new(24);
        let key = OcrCache::key_for(b"hello world");
        cache.put(key.clone(), "extracted text".to_string()).await;
        assert_eq!(cache.get(&key).await.as_deref(), Some("extracted text"));
    }

    #[tokio::test]
    async fn miss_returns_none() {
        let cache = OcrCache::new(24);
        assert_eq!(cache.get("nonexistent").await, None);
    }

    #[tokio::test]
    async fn ttl_zero_never_expires() {
        let cache = OcrCache::new(0);
        let key = OcrCache::key_for(b"data");
        cache.put(key.clone(), "text".to_string()).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(cache.get(&key).await.as_deref(), Some("text"));
        assert_eq!(cache.evict_expired().await, 0);
    }
}
