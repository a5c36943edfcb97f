use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::github::GithubClient;

/// Remaining requests below this mark a credential as throttled.
const LOW_WATER: u64 = 100;
/// Total back-off cap when every credential is low.
const MAX_WAIT: Duration = Duration::from_secs(3600);
/// Sleep slice so shutdown is never blocked for long.
const WAIT_SLICE: Duration = Duration::from_secs(60);

/// Ordered set of host credentials with rotation on throttling. The single
/// piece of shared mutable state across main-tier workers; every operation
/// takes the lock briefly and the lock is never held across an await.
pub struct TokenPool {
    inner: Mutex<PoolState>,
}

struct PoolState {
    tokens: Vec<String>,
    cursor: usize,
    throttled: HashSet<usize>,
}

impl TokenPool {
    pub fn new(tokens: Vec<String>) -> Self {
        Self {
            inner: Mutex::new(PoolState {
                tokens,
                cursor: 0,
                throttled: HashSet::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|s| s.tokens.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next non-throttled credential. When every credential is throttled the
    /// set is cleared (clearing is idempotent) and the cursor's credential is
    /// returned anyway: better a throttled call than none.
    pub fn acquire(&self) -> Option<String> {
        let Ok(mut s) = self.inner.lock() else {
            return None;
        };
        if s.tokens.is_empty() {
            return None;
        }
        let n = s.tokens.len();
        for _ in 0..n {
            if !s.throttled.contains(&s.cursor) {
                return Some(s.tokens[s.cursor].clone());
            }
            s.cursor = (s.cursor + 1) % n;
        }
        s.throttled.clear();
        Some(s.tokens[s.cursor].clone())
    }

    /// Mark the current credential throttled and advance the cursor.
    pub fn report_throttled(&self) {
        let Ok(mut s) = self.inner.lock() else {
            return;
        };
        if s.tokens.is_empty() {
            return;
        }
        let cursor = s.cursor;
        s.throttled.insert(cursor);
        s.cursor = (cursor + 1) % s.tokens.len();
    }

    /// Check the host's rate-limit endpoint with the current credential and
    /// rotate if it is low. When every credential is low, sleep in bounded
    /// slices until the reset epoch passes or the cap is hit.
    pub async fn preflight(&self, github: &GithubClient) {
        let Some(token) = self.acquire() else {
            return;
        };
        let limit = match github.rate_limit(&token).await {
            Ok(l) => l,
            Err(e) => {
                warn!("rate limit preflight failed: {e}");
                return;
            }
        };
        if limit.remaining >= LOW_WATER {
            return;
        }

        self.report_throttled();
        if let Some(next) = self.acquire() {
            if next != token {
                return;
            }
        }

        // Every credential is low. Wait for the reset epoch, sliced so an
        // interrupt is observed within a minute.
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let wait = limit.reset.saturating_sub(now).min(MAX_WAIT.as_secs());
        if wait == 0 {
            return;
        }
        info!(wait_s = wait, "all credentials near the rate limit, backing off");
        let mut waited = 0u64;
        while waited < wait {
            let slice = WAIT_SLICE.as_secs().min(wait - waited);
            tokio::time::sleep(Duration::from_secs(slice)).await;
            waited += slice;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_pool_yields_nothing() {
        let pool = TokenPool::new(Vec::new());
        assert_eq!(pool.acquire(), None);
        pool.report_throttled(); // no-op, must not panic
    }

    #[test]
    fn acquire_skips_throttled_credential() {
        let pool = TokenPool::new(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(pool.acquire().as_deref(), Some("a"));
        pool.report_throttled();
        assert_eq!(pool.acquire().as_deref(), Some("b"));
    }

    #[test]
    fn exhausted_pool_clears_and_recovers() {
        let pool = TokenPool::new(vec!["a".into(), "b".into()]);
        pool.report_throttled();
        pool.report_throttled();
        // All throttled: the set is cleared and the cursor's token returned.
        assert!(pool.acquire().is_some());
        // Clearing is idempotent; subsequent acquires keep working.
        assert!(pool.acquire().is_some());
    }

    proptest! {
        /// With k credentials and one throttled, the next acquire never
        /// hands back the throttled one.
        #[test]
        fn throttled_credential_is_not_reissued(k in 2usize..8) {
            let tokens: Vec<String> = (0..k).map(|i| format!("t{i}")).collect();
            let pool = TokenPool::new(tokens);
            let first = pool.acquire();
            pool.report_throttled();
            let second = pool.acquire();
            prop_assert!(second.is_some());
            prop_assert_ne!(first, second);
        }

        /// The throttled set never grows past the pool size and acquire
        /// always yields once clearing kicks in.
        #[test]
        fn pool_always_recovers(rotations in 1usize..40, k in 1usize..6) {
            let tokens: Vec<String> = (0..k).map(|i| format!("t{i}")).collect();
            let pool = TokenPool::new(tokens);
            for _ in 0..rotations {
                pool.report_throttled();
            }
            prop_assert!(pool.acquire().is_some());
        }
    }
}
