//! Cache storage: the [`CacheBackend`] contract and the in-process
//! [`MemoryCache`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::Result;
use crate::types::BackendResult;

/// Longest lifetime a cache entry can have. Longer TTLs are capped.
pub const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// One cached dispatch result.
///
/// Expiry is carried with the entry and checked at read time. Stores with
/// native expiry may also drop the entry on their own once it lapses.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub results: Vec<BackendResult>,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl CacheEntry {
    /// `ttl` is capped at [`MAX_TTL`].
    pub fn new(results: Vec<BackendResult>, ttl: Duration) -> Self {
        let created_at = Instant::now();
        let expires_at = created_at
            .checked_add(ttl.min(MAX_TTL))
            .unwrap_or_else(|| created_at + MAX_TTL);
        Self {
            results,
            created_at,
            expires_at,
        }
    }

    /// Lifetime the entry was created with.
    pub fn ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(self.created_at)
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }
}

/// Key-value storage behind the cache gateway.
///
/// Implementations may be in-process or a shared external store. Only
/// per-key atomicity is assumed.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Store `entry` under `key`. `ttl` lets stores with native expiry
    /// drop the key on their own.
    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete every key matching a glob `pattern` (`*` and `?`).
    /// Returns the number of keys removed.
    async fn delete_pattern(&self, pattern: &str) -> Result<u64>;

    /// Approximate number of stored entries, if the store can tell.
    async fn len(&self) -> Result<u64>;
}

/// Bounded in-memory store using moka's LRU cache.
///
/// Each entry expires after its own TTL, so lapsed entries that are never
/// read again do not hold capacity.
pub struct MemoryCache {
    entries: moka::sync::Cache<String, CacheEntry>,
}

/// Per-entry expiry for [`MemoryCache`]. Overwriting a key restarts its
/// lifetime with the new entry's TTL.
struct EntryExpiry;

impl moka::Expiry<String, CacheEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &CacheEntry,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(entry.ttl())
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &CacheEntry,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl())
    }
}

impl MemoryCache {
    pub fn new(max_entries: u64) -> Self {
        Self {
            entries: moka::sync::Cache::builder()
                .max_capacity(max_entries)
                .expire_after(EntryExpiry)
                .build(),
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.entries.get(key))
    }

    /// Expiry follows the entry's own TTL; `ttl` is not consulted.
    async fn set(&self, key: &str, entry: CacheEntry, _ttl: Duration) -> Result<()> {
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.invalidate(key);
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        let matching: Vec<_> = self
            .entries
            .iter()
            .filter(|(key, _)| glob_match(pattern, key))
            .map(|(key, _)| key)
            .collect();
        for key in &matching {
            self.entries.invalidate(key.as_str());
        }
        Ok(matching.len() as u64)
    }

    async fn len(&self) -> Result<u64> {
        self.entries.run_pending_tasks();
        Ok(self.entries.entry_count())
    }
}

/// Glob match supporting `*` (any run) and `?` (any one character).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            // backtrack: let the last star swallow one more character
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_basics() {
        assert!(glob_match("*", ""));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("llm_response:*", "llm_response:abc"));
        assert!(!glob_match("llm_response:*", "other:abc"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match("*b*d", "abcbd"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
    }

    #[tokio::test]
    async fn delete_pattern_counts_removed_keys() {
        let cache = MemoryCache::new(100);
        let ttl = Duration::from_secs(60);
        for key in ["llm_response:a", "llm_response:b", "session:c"] {
            cache.set(key, CacheEntry::new(vec![], ttl), ttl).await.unwrap();
        }
        assert_eq!(cache.delete_pattern("llm_response:*").await.unwrap(), 2);
        assert!(cache.get("llm_response:a").await.unwrap().is_none());
        assert!(cache.get("session:c").await.unwrap().is_some());
        assert_eq!(cache.len().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_ttl_is_capped() {
        let entry = CacheEntry::new(vec![], Duration::from_secs(u64::MAX));
        assert_eq!(entry.ttl(), MAX_TTL);
        assert!(!entry.is_expired());
    }

    #[tokio::test]
    async fn memory_cache_drops_lapsed_entries_unread() {
        let cache = MemoryCache::new(100);
        let ttl = Duration::from_millis(50);
        cache
            .set("llm_response:short", CacheEntry::new(vec![], ttl), ttl)
            .await
            .unwrap();
        let long = Duration::from_secs(60);
        cache
            .set("llm_response:long", CacheEntry::new(vec![], long), long)
            .await
            .unwrap();
        assert_eq!(cache.len().await.unwrap(), 2);

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(cache.len().await.unwrap(), 1);
        assert!(cache.get("llm_response:long").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expiry_is_inclusive_of_ttl() {
        let entry = CacheEntry::new(vec![], Duration::from_secs(10));
        assert!(!entry.is_expired());
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!entry.is_expired());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(entry.is_expired());
    }
}
