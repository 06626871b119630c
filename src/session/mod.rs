//! Session key reuse table
//!
//! A successful Diffie-Hellman exchange leaves a shared secret that both
//! sides may reuse for later connections until it expires. The server names
//! each secret with a 32-bit token. The client offers that token in its next
//! handshake header to skip the exchange.
//!
//! Expiry is enforced twice: lookups ignore stale entries, and a background
//! task deletes them every ten minutes.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;
use tracing::debug;

/// Reserved token meaning "no token"
pub const TOKEN_NULL: u32 = 0;

/// Reserved token asking the server for a new one
pub const TOKEN_NEW: u32 = 0xFFFF_FFFF;

/// A current token this close to expiry is no longer offered
pub const TOKEN_EXPIRE_GRACE: Duration = Duration::from_secs(10);

/// Interval between expiry sweeps
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// A cached shared secret
#[derive(Debug, Clone)]
struct SessionKeyEntry {
    /// Hex-encoded DH shared secret
    key: String,
    expires_at: Instant,
}

impl SessionKeyEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug)]
struct CacheInner {
    entries: HashMap<u32, SessionKeyEntry>,
    /// Last token handed out by `generate_token`
    next_token: u32,
    /// Token to offer on the next client connection
    current_token: u32,
    key_lifetime: Duration,
}

/// Token → shared secret table shared by every tunnel cloned from one template
#[derive(Debug)]
pub struct TokenCache {
    inner: Mutex<CacheInner>,
    sweeper: Mutex<Option<AbortHandle>>,
}

impl TokenCache {
    /// Create a cache and start its background sweep
    ///
    /// Outside a tokio runtime the cache still works, relying on lazy
    /// expiry alone.
    pub fn new(key_lifetime: Duration) -> Arc<Self> {
        let cache = Arc::new(Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                next_token: rand::random(),
                current_token: TOKEN_NEW,
                key_lifetime,
            }),
            sweeper: Mutex::new(None),
        });

        Self::start_sweeper(&cache);
        cache
    }

    fn start_sweeper(cache: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime available, token cache sweep disabled");
            return;
        };

        let weak = Arc::downgrade(cache);
        let task = runtime.spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!("Purged {} expired session key(s)", purged);
                }
            }
        });

        *cache.sweeper.lock() = Some(task.abort_handle());
    }

    /// Lifetime stamped on newly stored keys
    pub fn key_lifetime(&self) -> Duration {
        self.inner.lock().key_lifetime
    }

    pub fn set_key_lifetime(&self, lifetime: Duration) {
        self.inner.lock().key_lifetime = lifetime;
    }

    /// Mint a token that is not reserved, not `avoid` and not in use
    pub fn generate_token(&self, avoid: u32) -> u32 {
        let mut inner = self.inner.lock();
        loop {
            inner.next_token = inner.next_token.wrapping_add(1);
            let candidate = inner.next_token;

            if candidate == TOKEN_NULL
                || candidate == TOKEN_NEW
                || candidate == avoid
                || inner.entries.contains_key(&candidate)
            {
                continue;
            }

            return candidate;
        }
    }

    /// Live shared secret for `token`
    pub fn key_for_token(&self, token: u32) -> Option<String> {
        if token == TOKEN_NULL || token == TOKEN_NEW {
            return None;
        }

        let inner = self.inner.lock();
        inner
            .entries
            .get(&token)
            .filter(|entry| entry.is_live(Instant::now()))
            .map(|entry| entry.key.clone())
    }

    /// Store `key` under `token`, expiring one key lifetime from now
    pub fn set_key_for_token(&self, token: u32, key: &str) {
        let mut inner = self.inner.lock();
        let expires_at = Instant::now() + inner.key_lifetime;
        inner.entries.insert(
            token,
            SessionKeyEntry {
                key: key.to_string(),
                expires_at,
            },
        );
    }

    /// Store `key` under `token` and offer `token` on the next connection
    pub fn set_current_token(&self, token: u32, key: &str) {
        self.set_key_for_token(token, key);
        self.inner.lock().current_token = token;
    }

    /// Token to send in the next client handshake
    ///
    /// Returns [`TOKEN_NEW`] once the current token's key is within
    /// [`TOKEN_EXPIRE_GRACE`] of expiring.
    pub fn current_token(&self) -> u32 {
        let inner = self.inner.lock();
        let token = inner.current_token;

        if token == TOKEN_NEW || token == TOKEN_NULL {
            return token;
        }

        match inner.entries.get(&token) {
            Some(entry) if Instant::now() + TOKEN_EXPIRE_GRACE < entry.expires_at => token,
            _ => TOKEN_NEW,
        }
    }

    /// Delete every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.is_live(now));
        before - inner.entries.len()
    }

    /// Number of stored entries, expired ones included until swept
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for TokenCache {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_lookup() {
        let cache = TokenCache::new(Duration::from_secs(3600));
        cache.set_key_for_token(7, "abcdef");

        assert_eq!(cache.key_for_token(7).as_deref(), Some("abcdef"));
        assert_eq!(cache.key_for_token(8), None);
        assert_eq!(cache.key_for_token(TOKEN_NEW), None);
    }

    #[tokio::test]
    async fn test_lazy_expiry_before_sweep() {
        let cache = TokenCache::new(Duration::from_secs(1));
        cache.set_key_for_token(42, "00ff");
        assert!(cache.key_for_token(42).is_some());

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(cache.key_for_token(42), None);
        // Still present until the sweep removes it
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_generate_token_skips_reserved_and_used() {
        let cache = TokenCache::new(Duration::from_secs(60));

        // Force the counter to wrap through both reserved values
        cache.inner.lock().next_token = TOKEN_NEW - 2;
        cache.set_key_for_token(TOKEN_NEW - 1, "used");

        let first = cache.generate_token(1);
        assert_eq!(first, 2);

        for _ in 0..1000 {
            let token = cache.generate_token(TOKEN_NULL);
            assert_ne!(token, TOKEN_NULL);
            assert_ne!(token, TOKEN_NEW);
            assert!(cache.key_for_token(token).is_none());
        }
    }

    #[test]
    fn test_current_token_grace_period() {
        let cache = TokenCache::new(Duration::from_secs(3600));
        assert_eq!(cache.current_token(), TOKEN_NEW);

        cache.set_current_token(99, "beef");
        assert_eq!(cache.current_token(), 99);

        // A key that expires inside the grace period is not offered
        cache.set_key_lifetime(Duration::from_secs(5));
        cache.set_current_token(100, "cafe");
        assert_eq!(cache.current_token(), TOKEN_NEW);
    }

    #[test]
    fn test_shared_between_threads() {
        let cache = TokenCache::new(Duration::from_secs(60));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| {
                            let token = cache.generate_token(TOKEN_NULL);
                            cache.set_key_for_token(token, "k");
                            token
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 400);
    }
}
