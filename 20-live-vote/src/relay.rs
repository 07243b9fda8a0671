//! Live results streaming.
//!
//! Each subscription is a producer task that owns a watch on the session's
//! results prefix and feeds snapshots into a bounded channel. The consumer side
//! is [`Subscription`], a [`Stream`] the HTTP layer turns into server-sent events.
//!
//! The producer never forwards individual watch events. Any event, or any burst
//! of them, triggers a full re-read of the counters, so a subscriber always sees
//! the latest totals even if it falls behind or events arrive out of order.
//!
//! # Lifecycle
//!
//! ```text
//! Initializing --(watch armed, first snapshot sent)--> Streaming
//! Initializing | Streaming --(disconnect, cancel, shutdown, error)--> Terminated
//! ```
//!
//! The watch is armed before the initial read so a vote landing between the two
//! still produces an event. The watch is owned by the producer future: returning,
//! failing, or being aborted all drop it, which releases the store registration.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::Stream;
use serde::Serialize;
use tokio::{
    select,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    aggregate::{aggregate, ResultsSnapshot},
    error::VoteError,
    keys::{Keyspace, SessionId},
    store::{KvStore, StoreError},
};

/// Snapshots buffered per subscriber before the producer waits for the consumer.
const FRAME_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Initializing,
    Streaming,
    Terminated,
}

/// One frame on a results stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StreamMessage {
    Snapshot(ResultsSnapshot),
    Error { error: String },
}

#[derive(Clone)]
pub struct ResultRelay {
    store: Arc<dyn KvStore>,
    keys: Keyspace,
    stopping: Arc<watch::Sender<bool>>,
}

impl ResultRelay {
    pub fn new(store: Arc<dyn KvStore>, keys: Keyspace) -> Self {
        let (stopping, _) = watch::channel(false);
        Self {
            store,
            keys,
            stopping: Arc::new(stopping),
        }
    }

    /// Ends every open subscription, as if each subscriber had disconnected.
    /// Subscriptions started afterwards end right after their first snapshot.
    pub fn shutdown(&self) {
        self.stopping.send_replace(true);
    }

    /// Starts a fresh subscription. Must be called inside a Tokio runtime.
    pub fn subscribe(&self, session: SessionId) -> Subscription {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
        let (state_tx, state_rx) = watch::channel(RelayState::Initializing);

        let producer = Producer {
            store: Arc::clone(&self.store),
            keys: self.keys.clone(),
            session,
            frames: frames_tx,
            state: state_tx,
            stopping: self.stopping.subscribe(),
        };
        let task = tokio::spawn(producer.run());

        Subscription {
            frames: frames_rx,
            state: state_rx,
            task,
        }
    }
}

/// Consumer half of a results stream.
///
/// Dropping it cancels the producer and, with it, the store watch.
pub struct Subscription {
    frames: mpsc::Receiver<StreamMessage>,
    state: watch::Receiver<RelayState>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<StreamMessage> {
        self.frames.recv().await
    }

    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    /// Stops the producer and waits until it has released its watch.
    pub async fn cancel(mut self) {
        self.frames.close();
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl Stream for Subscription {
    type Item = StreamMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().frames.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Producer {
    store: Arc<dyn KvStore>,
    keys: Keyspace,
    session: SessionId,
    frames: mpsc::Sender<StreamMessage>,
    state: watch::Sender<RelayState>,
    stopping: watch::Receiver<bool>,
}

impl Producer {
    async fn run(self) {
        info!(session = %self.session, "results subscriber connected");

        match self.stream().await {
            Ok(()) => info!(session = %self.session, "results subscriber disconnected"),
            Err(err) => {
                warn!(session = %self.session, error = %err, "results stream failed");
                let _ = self
                    .frames
                    .send(StreamMessage::Error {
                        error: err.to_string(),
                    })
                    .await;
            }
        }

        self.transition(RelayState::Terminated);
    }

    /// Runs until the subscriber goes away (`Ok`) or something breaks (`Err`).
    async fn stream(&self) -> Result<(), VoteError> {
        let mut stopping = self.stopping.clone();
        let prefix = self.keys.results_prefix(&self.session);
        let mut changes = self.store.watch(&prefix).await?;

        if !self.push_snapshot().await? {
            return Ok(());
        }
        self.transition(RelayState::Streaming);

        // Once every relay handle is gone no shutdown can be signalled any more;
        // the stream then runs until the subscriber leaves.
        let mut relay_gone = false;
        loop {
            let event = select! {
                _ = self.frames.closed() => return Ok(()),
                stopped = stopping.wait_for(|stopped| *stopped), if !relay_gone => {
                    if stopped.is_ok() {
                        return Ok(());
                    }
                    relay_gone = true;
                    continue;
                }
                event = changes.next() => event,
            };
            let Some(event) = event else {
                return Err(StoreError::Unavailable("watch closed by store".into()).into());
            };

            let mut coalesced = 0usize;
            while changes.try_next().is_some() {
                coalesced += 1;
            }
            debug!(
                session = %self.session,
                key = %event.key,
                revision = event.revision,
                coalesced,
                "results changed"
            );

            if !self.push_snapshot().await? {
                return Ok(());
            }
        }
    }

    /// Aggregates and sends one snapshot. `Ok(false)` means the subscriber is gone.
    async fn push_snapshot(&self) -> Result<bool, VoteError> {
        let snapshot = aggregate(self.store.as_ref(), &self.keys, &self.session).await?;
        Ok(self
            .frames
            .send(StreamMessage::Snapshot(snapshot))
            .await
            .is_ok())
    }

    fn transition(&self, next: RelayState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(session = %self.session, ?previous, ?next, "relay state changed");
        }
    }
}
