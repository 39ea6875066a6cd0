use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::utc_now;

const CACHE_TTL_MS: i64 = 55 * 60 * 1000;
pub const REFRESH_BUFFER_MS: i64 = 5 * 60 * 1000;

#[derive(Clone, Debug)]
struct CachedToken {
    token: String,
    token_expiry: i64,
    cached_at: i64,
}

/// In-process access-token cache keyed by account email. Entries live at
/// most 55 minutes and are never served inside the 5-minute refresh buffer.
/// Refreshes for a given email are serialized through `writer_lock`.
pub struct TokenCache {
    entries: DashMap<String, CachedToken>,
    writers: DashMap<String, Arc<Mutex<()>>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            writers: DashMap::new(),
        }
    }

    /// A token usable for at least the refresh buffer, or None.
    pub fn get_fresh(&self, email: &str) -> Option<String> {
        let entry = self.entries.get(email)?;
        let now = utc_now!();
        if now - entry.cached_at >= CACHE_TTL_MS {
            drop(entry);
            self.entries.remove(email);
            return None;
        }
        if entry.token_expiry <= now + REFRESH_BUFFER_MS {
            return None;
        }
        Some(entry.token.clone())
    }

    pub fn put(&self, email: &str, token: String, token_expiry: i64) {
        self.entries.insert(
            email.to_string(),
            CachedToken {
                token,
                token_expiry,
                cached_at: utc_now!(),
            },
        );
    }

    pub fn invalidate(&self, email: &str) {
        self.entries.remove(email);
    }

    /// The per-email mutex serializing refresh attempts.
    pub fn writer_lock(&self, email: &str) -> Arc<Mutex<()>> {
        self.writers
            .entry(email.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_served() {
        let cache = TokenCache::new();
        cache.put("a@x.com", "tok".into(), utc_now!() + 60 * 60 * 1000);
        assert_eq!(cache.get_fresh("a@x.com").as_deref(), Some("tok"));
    }

    #[test]
    fn token_inside_refresh_buffer_is_not_served() {
        let cache = TokenCache::new();
        cache.put("b@x.com", "tok".into(), utc_now!() + 2 * 60 * 1000);
        assert_eq!(cache.get_fresh("b@x.com"), None);
    }

    #[test]
    fn invalidation_removes_entry() {
        let cache = TokenCache::new();
        cache.put("c@x.com", "tok".into(), utc_now!() + 60 * 60 * 1000);
        cache.invalidate("c@x.com");
        assert_eq!(cache.get_fresh("c@x.com"), None);
    }

    #[test]
    fn writer_lock_is_shared_per_email() {
        let cache = TokenCache::new();
        let a = cache.writer_lock("d@x.com");
        let b = cache.writer_lock("d@x.com");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
