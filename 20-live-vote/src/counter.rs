//! Optimistic vote increments.
//!
//! A vote reads the counter, then asks the store to write `count + 1` only if the
//! counter still holds what was read. A concurrent writer that got there first
//! makes the swap fail, and the loop re-reads and tries again. The store's
//! compare-and-swap is the only synchronization point: two successful swaps can
//! never share a precondition, so no vote that reports success is lost.
//!
//! The loop is bounded by [`RetryPolicy::max_attempts`]. Exhausting it reports
//! [`VoteError::Contention`] and leaves the counter untouched by this caller.

use std::{sync::Arc, time::Duration};

use rand::Rng;
use tracing::{debug, warn};

use crate::{
    error::VoteError,
    keys::{Keyspace, OptionId, SessionId},
    store::KvStore,
};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Compare-and-swap attempts before giving up. Always at least 1.
    pub max_attempts: u32,
    /// Upper bound of the randomized pause after the first failed attempt. Doubles
    /// after each further failure. Zero retries immediately.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Pause before attempt `attempt + 1`, with full jitter.
    fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if self.backoff.is_zero() {
            return None;
        }
        let ceiling = self
            .backoff
            .saturating_mul(1 << (attempt - 1).min(10))
            .as_millis()
            .min(u128::from(u64::MAX)) as u64;
        let millis = rand::thread_rng().gen_range(0..=ceiling);
        Some(Duration::from_millis(millis))
    }
}

#[derive(Clone)]
pub struct VoteCounter {
    store: Arc<dyn KvStore>,
    keys: Keyspace,
    policy: RetryPolicy,
}

impl VoteCounter {
    pub fn new(store: Arc<dyn KvStore>, keys: Keyspace, policy: RetryPolicy) -> Self {
        Self {
            store,
            keys,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Adds one vote for `option` and returns the counter value this vote produced.
    pub async fn cast_vote(&self, session: &SessionId, option: OptionId) -> Result<u64, VoteError> {
        let option_key = self.keys.option_key(session, option);
        if self.store.get(&option_key).await?.is_none() {
            debug!(%session, %option, "vote for unknown option");
            return Err(VoteError::NotFound);
        }

        let counter_key = self.keys.result_key(session, option);
        for attempt in 1..=self.policy.max_attempts {
            let current = self.store.get(&counter_key).await?;
            let count = match current.as_deref() {
                Some(raw) => parse_count(&counter_key, raw)?,
                None => 0,
            };
            let next = count
                .checked_add(1)
                .ok_or_else(|| VoteError::DataIntegrity {
                    key: counter_key.clone(),
                    value: count.to_string(),
                })?;

            let swapped = self
                .store
                .compare_and_swap(&counter_key, current.as_deref(), &next.to_string())
                .await?;
            if swapped {
                debug!(%session, %option, attempt, count = next, "vote counted");
                return Ok(next);
            }

            debug!(%session, %option, attempt, "counter changed under us, retrying");
            if attempt < self.policy.max_attempts {
                if let Some(delay) = self.policy.delay_after(attempt) {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        warn!(
            %session,
            %option,
            attempts = self.policy.max_attempts,
            "vote abandoned after exhausting retries"
        );
        Err(VoteError::Contention {
            attempts: self.policy.max_attempts,
        })
    }
}

/// Parses a stored counter. Anything but a plain non-negative decimal is a
/// data-integrity failure, never coerced.
pub fn parse_count(key: &str, raw: &str) -> Result<u64, VoteError> {
    raw.parse().map_err(|_| VoteError::DataIntegrity {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn seeded(options: &[u32]) -> (MemoryStore, VoteCounter, SessionId) {
        let store = MemoryStore::new();
        let keys = Keyspace::default();
        let session = SessionId::parse("s1").expect("valid id");
        for &id in options {
            store
                .put(&keys.option_key(&session, OptionId(id)), "{}")
                .await
                .expect("seed option");
        }
        let counter = VoteCounter::new(Arc::new(store.clone()), keys, RetryPolicy::default());
        (store, counter, session)
    }

    #[tokio::test]
    async fn first_vote_on_absent_counter_yields_one() {
        let (store, counter, session) = seeded(&[1]).await;

        assert_eq!(counter.cast_vote(&session, OptionId(1)).await.expect("vote"), 1);
        assert_eq!(
            store.get("sessions/s1/results/1").await.expect("get"),
            Some("1".into())
        );
    }

    #[tokio::test]
    async fn vote_continues_from_initialized_counter() {
        let (store, counter, session) = seeded(&[1]).await;
        store.put("sessions/s1/results/1", "0").await.expect("init");

        assert_eq!(counter.cast_vote(&session, OptionId(1)).await.expect("vote"), 1);
        assert_eq!(counter.cast_vote(&session, OptionId(1)).await.expect("vote"), 2);
    }

    #[tokio::test]
    async fn unknown_option_is_not_found_and_writes_nothing() {
        let (store, counter, session) = seeded(&[1]).await;
        let before = store.revision();

        let result = counter.cast_vote(&session, OptionId(9)).await;
        assert!(matches!(result, Err(VoteError::NotFound)));
        assert_eq!(store.revision(), before);
    }

    #[tokio::test]
    async fn garbage_counter_is_a_data_integrity_error() {
        let (store, counter, session) = seeded(&[1]).await;
        store.put("sessions/s1/results/1", "many").await.expect("put");

        let result = counter.cast_vote(&session, OptionId(1)).await;
        assert!(matches!(result, Err(VoteError::DataIntegrity { .. })));
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn backoff_delay_stays_within_ceiling() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10));
        for attempt in 1..5 {
            let delay = policy.delay_after(attempt).expect("backoff enabled");
            assert!(delay <= Duration::from_millis(10 << (attempt - 1)));
        }
        assert_eq!(RetryPolicy::default().delay_after(1), None);
    }
}
