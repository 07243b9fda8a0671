//! Concurrency properties of the compare-and-swap vote loop.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use live_vote::{
    counter::{RetryPolicy, VoteCounter},
    error::VoteError,
    keys::{Keyspace, OptionId, SessionId},
    store::{KvStore, MemoryStore, StoreError, StoreStatus, Watch},
};

const COUNTER_KEY: &str = "sessions/poll/results/1";

async fn seed_session(store: &MemoryStore) -> Result<SessionId> {
    store.put("sessions/poll/info", "{}").await?;
    store.put("sessions/poll/options/1", "{}").await?;
    store.put("sessions/poll/options/2", "{}").await?;
    store.put(COUNTER_KEY, "0").await?;
    store.put("sessions/poll/results/2", "0").await?;
    Ok(SessionId::parse("poll")?)
}

/// Records the precondition of every compare-and-swap that succeeded.
#[derive(Clone, Default)]
struct RecordingStore {
    inner: MemoryStore,
    winners: Arc<Mutex<Vec<Option<String>>>>,
}

#[async_trait]
impl KvStore for RecordingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        self.inner.get_prefix(prefix).await
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.put(key, value).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError> {
        let swapped = self.inner.compare_and_swap(key, expected, new).await?;
        if swapped {
            self.winners
                .lock()
                .unwrap()
                .push(expected.map(str::to_string));
        }
        Ok(swapped)
    }

    async fn watch(&self, prefix: &str) -> Result<Watch, StoreError> {
        self.inner.watch(prefix).await
    }

    async fn status(&self) -> Result<StoreStatus, StoreError> {
        self.inner.status().await
    }
}

/// Simulates a rival writer that always bumps the counter between our read and
/// our compare-and-swap, so every swap fails.
#[derive(Clone, Default)]
struct ContendedStore {
    inner: MemoryStore,
    swap_attempts: Arc<AtomicU32>,
    rival_writes: Arc<AtomicU32>,
}

#[async_trait]
impl KvStore for ContendedStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        self.inner.get_prefix(prefix).await
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.put(key, value).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError> {
        self.swap_attempts.fetch_add(1, Ordering::SeqCst);

        let current: u64 = self
            .inner
            .get(key)
            .await?
            .map(|raw| raw.parse().expect("numeric counter"))
            .unwrap_or(0);
        self.inner.put(key, &(current + 1).to_string()).await?;
        self.rival_writes.fetch_add(1, Ordering::SeqCst);

        self.inner.compare_and_swap(key, expected, new).await
    }

    async fn watch(&self, prefix: &str) -> Result<Watch, StoreError> {
        self.inner.watch(prefix).await
    }

    async fn status(&self) -> Result<StoreStatus, StoreError> {
        self.inner.status().await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_votes_are_all_counted() -> Result<()> {
    const VOTERS: u32 = 50;

    let store = RecordingStore::default();
    let session = seed_session(&store.inner).await?;
    // Every failed swap means another voter succeeded, so VOTERS attempts always suffice.
    let counter = VoteCounter::new(
        Arc::new(store.clone()),
        Keyspace::default(),
        RetryPolicy::new(VOTERS, Duration::ZERO),
    );

    let votes = (0..VOTERS).map(|_| {
        let counter = counter.clone();
        let session = session.clone();
        tokio::spawn(async move { counter.cast_vote(&session, OptionId(1)).await })
    });

    let mut returned = Vec::new();
    for outcome in join_all(votes).await {
        returned.push(outcome??);
    }
    returned.sort_unstable();

    assert_eq!(returned, (1..=u64::from(VOTERS)).collect::<Vec<_>>());
    assert_eq!(store.get(COUNTER_KEY).await?, Some(VOTERS.to_string()));
    assert_eq!(store.get("sessions/poll/results/2").await?, Some("0".into()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_votes_on_an_absent_counter_are_all_counted() -> Result<()> {
    const VOTERS: u32 = 30;

    let store = RecordingStore::default();
    store.inner.put("sessions/poll/options/1", "{}").await?;
    let session = SessionId::parse("poll")?;
    let counter = VoteCounter::new(
        Arc::new(store.clone()),
        Keyspace::default(),
        RetryPolicy::new(VOTERS, Duration::ZERO),
    );

    let votes = (0..VOTERS).map(|_| {
        let counter = counter.clone();
        let session = session.clone();
        tokio::spawn(async move { counter.cast_vote(&session, OptionId(1)).await })
    });

    let mut returned = Vec::new();
    for outcome in join_all(votes).await {
        returned.push(outcome??);
    }
    returned.sort_unstable();

    assert_eq!(returned, (1..=u64::from(VOTERS)).collect::<Vec<_>>());
    assert_eq!(store.get(COUNTER_KEY).await?, Some(VOTERS.to_string()));

    // Only the first writer may create the key; everyone after it swaps a value.
    let winners = store.winners.lock().unwrap().clone();
    assert_eq!(winners.iter().filter(|expected| expected.is_none()).count(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn successful_swaps_never_share_a_precondition() -> Result<()> {
    let store = RecordingStore::default();
    let session = seed_session(&store.inner).await?;
    let counter = VoteCounter::new(
        Arc::new(store.clone()),
        Keyspace::default(),
        RetryPolicy::default(),
    );

    let votes = (0..40).map(|_| {
        let counter = counter.clone();
        let session = session.clone();
        tokio::spawn(async move { counter.cast_vote(&session, OptionId(1)).await })
    });
    let mut successes = 0u64;
    for outcome in join_all(votes).await {
        match outcome? {
            Ok(_) => successes += 1,
            Err(VoteError::Contention { attempts }) => assert_eq!(attempts, 5),
            Err(other) => return Err(other.into()),
        }
    }

    let winners = store.winners.lock().unwrap().clone();
    let distinct: HashSet<_> = winners.iter().cloned().collect();
    assert_eq!(distinct.len(), winners.len());
    assert_eq!(winners.len() as u64, successes);
    assert_eq!(store.get(COUNTER_KEY).await?, Some(successes.to_string()));
    Ok(())
}

#[tokio::test]
async fn vote_for_missing_option_touches_no_counter() -> Result<()> {
    let store = MemoryStore::new();
    let session = seed_session(&store).await?;
    let counter = VoteCounter::new(
        Arc::new(store.clone()),
        Keyspace::default(),
        RetryPolicy::default(),
    );
    let before = store.get_prefix("sessions/poll/results/").await?;
    let revision = store.revision();

    let result = counter.cast_vote(&session, OptionId(3)).await;
    assert!(matches!(result, Err(VoteError::NotFound)));

    let missing_session = SessionId::parse("elsewhere")?;
    let result = counter.cast_vote(&missing_session, OptionId(1)).await;
    assert!(matches!(result, Err(VoteError::NotFound)));

    assert_eq!(store.get_prefix("sessions/poll/results/").await?, before);
    assert_eq!(store.revision(), revision);
    assert_eq!(store.get("sessions/poll/results/3").await?, None);
    Ok(())
}

#[tokio::test]
async fn rival_writer_exhausts_the_retry_budget() -> Result<()> {
    let store = ContendedStore::default();
    let session = seed_session(&store.inner).await?;
    let counter = VoteCounter::new(
        Arc::new(store.clone()),
        Keyspace::default(),
        RetryPolicy::new(7, Duration::ZERO),
    );

    let result = counter.cast_vote(&session, OptionId(1)).await;

    assert!(matches!(result, Err(VoteError::Contention { attempts: 7 })));
    assert_eq!(store.swap_attempts.load(Ordering::SeqCst), 7);
    // Every increment on the counter belongs to the rival, none to the caller.
    let rival = store.rival_writes.load(Ordering::SeqCst);
    assert_eq!(store.get(COUNTER_KEY).await?, Some(rival.to_string()));
    Ok(())
}

#[tokio::test]
async fn backoff_still_honours_the_attempt_budget() -> Result<()> {
    let store = ContendedStore::default();
    let session = seed_session(&store.inner).await?;
    let counter = VoteCounter::new(
        Arc::new(store.clone()),
        Keyspace::default(),
        RetryPolicy::new(3, Duration::from_millis(2)),
    );

    let result = counter.cast_vote(&session, OptionId(1)).await;

    assert!(matches!(result, Err(VoteError::Contention { attempts: 3 })));
    assert_eq!(store.swap_attempts.load(Ordering::SeqCst), 3);
    Ok(())
}
