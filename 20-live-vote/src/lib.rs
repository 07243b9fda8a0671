//! Live voting against counters held in a linearizable key-value store.
//!
//! Clients vote over HTTP and observers follow the totals through a
//! server-sent events stream. All vote state lives in the store; the process
//! keeps nothing but shared handles to it.
//!
//! - [`store`] defines the [`store::KvStore`] interface and the in-process
//!   [`store::MemoryStore`] backend with compare-and-swap and prefix watches.
//! - [`counter`] increments one counter per vote with a bounded
//!   compare-and-swap retry loop.
//! - [`aggregate`] reads every counter of a session into a results snapshot.
//! - [`relay`] turns a prefix watch into a stream of fresh snapshots for one
//!   subscriber, releasing the watch when the subscriber goes away.
//! - [`session`] creates, reads, and lists session metadata.
//! - [`routes`] and [`server`] expose all of the above through axum.
//! - [`cli`], [`config`], and [`simulate`] back the `live-vote` binary.

pub mod aggregate;
pub mod cli;
pub mod config;
pub mod counter;
pub mod error;
pub mod keys;
pub mod relay;
pub mod routes;
pub mod server;
pub mod session;
pub mod simulate;
pub mod store;
