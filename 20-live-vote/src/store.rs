//! Key-value store client used by the vote counter and the result relay.
//!
//! [`KvStore`] is the narrow interface the rest of the crate consumes: point
//! reads, prefix scans, blind writes, single-key compare-and-swap, and a prefix
//! watch. Every operation goes straight to the backend; nothing here caches values.
//!
//! [`MemoryStore`] is the in-process backend. It is linearizable because every
//! operation runs under one mutex, and it stamps each write with a global revision
//! so watchers observe changes in commit order.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Transport-level failure talking to the backing store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A single committed write observed by a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub value: String,
    pub revision: u64,
}

/// Backend description reported by the health endpoint.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoreStatus {
    pub backend: &'static str,
    pub revision: u64,
    pub keys: usize,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns the value at `key`, or `None` if the key is absent.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Returns every `(key, value)` pair whose key starts with `prefix`, in key
    /// order, read at a single revision.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Writes `new` at `key` only if the stored value equals `expected`.
    ///
    /// `expected == None` means the key must be absent. A key holding `"0"` does
    /// not match `None`, and an absent key does not match `Some("0")`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError>;

    /// Registers interest in every write under `prefix`.
    async fn watch(&self, prefix: &str) -> Result<Watch, StoreError>;

    async fn status(&self) -> Result<StoreStatus, StoreError>;
}

/// Live watch registration.
///
/// Events arrive through [`Watch::next`]. The registration is released by
/// [`Watch::cancel`] or when the value is dropped, whichever happens first.
pub struct Watch {
    events: mpsc::UnboundedReceiver<WatchEvent>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Watch {
    pub fn new(
        events: mpsc::UnboundedReceiver<WatchEvent>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Waits for the next event. Returns `None` once the backend has dropped the
    /// registration.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }

    /// Returns an already-queued event without waiting.
    pub fn try_next(&mut self) -> Option<WatchEvent> {
        self.events.try_recv().ok()
    }

    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
        self.events.close();
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.release();
    }
}

type WatchId = u64;

struct Watcher {
    prefix: String,
    events: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, String>,
    revision: u64,
    watchers: HashMap<WatchId, Watcher>,
    next_watch_id: WatchId,
}

impl Inner {
    /// Applies a write and fans the event out to matching watchers while the lock
    /// is still held, so every watcher sees writes in revision order.
    fn commit(&mut self, key: &str, value: &str) {
        self.revision += 1;
        self.data.insert(key.to_string(), value.to_string());

        let event = WatchEvent {
            key: key.to_string(),
            value: value.to_string(),
            revision: self.revision,
        };
        self.watchers.retain(|id, watcher| {
            if !key.starts_with(&watcher.prefix) {
                return true;
            }
            let delivered = watcher.events.send(event.clone()).is_ok();
            if !delivered {
                debug!(watch = id, "dropping watcher with closed receiver");
            }
            delivered
        });
    }
}

/// In-process linearizable store.
///
/// Cloning is cheap and every clone shares the same data, which is how the
/// server hands one store to every request handler.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live watch registrations whose prefix is exactly `prefix`.
    pub fn active_watches(&self, prefix: &str) -> usize {
        self.lock()
            .watchers
            .values()
            .filter(|watcher| watcher.prefix == prefix)
            .count()
    }

    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock_inner(&self.inner)
    }
}

fn lock_inner(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    // A panic while holding the lock cannot leave the map half-written: every
    // mutation is a single insert.
    inner
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn unregister(inner: &Weak<Mutex<Inner>>, id: WatchId) {
    if let Some(inner) = inner.upgrade() {
        if lock_inner(&inner).watchers.remove(&id).is_some() {
            debug!(watch = id, "watch cancelled");
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().data.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let inner = self.lock();
        let pairs = inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Ok(pairs)
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock().commit(key, value);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        if inner.data.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        inner.commit(key, new);
        Ok(true)
    }

    async fn watch(&self, prefix: &str) -> Result<Watch, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.lock();
            let id = inner.next_watch_id;
            inner.next_watch_id += 1;
            inner.watchers.insert(
                id,
                Watcher {
                    prefix: prefix.to_string(),
                    events: tx,
                },
            );
            id
        };
        debug!(watch = id, prefix, "watch registered");

        let inner = Arc::downgrade(&self.inner);
        Ok(Watch::new(rx, move || unregister(&inner, id)))
    }

    async fn status(&self) -> Result<StoreStatus, StoreError> {
        let inner = self.lock();
        Ok(StoreStatus {
            backend: "memory",
            revision: inner.revision,
            keys: inner.data.len(),
        })
    }
}
