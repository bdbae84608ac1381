//! Last-write-wins replicated set backed by a durable pub/sub store.
//!
//! Every process keeps a fast in-memory view of the set for reads, while
//! writes are persisted to a shared store and broadcast to the other
//! replicas in the background.
//!
//! # Flow
//!
//! - `init` subscribes to the set's channel first, then loads the stored
//!   members. Because the subscription is acknowledged before the snapshot
//!   is read, no update published in between is missed, and `init` waits
//!   for the listener to apply those updates before returning.
//! - `set` updates the in-memory map immediately and queues the write. A
//!   single drain task applies it to the store with an atomic
//!   "only if newer" update, which also publishes it to the channel.
//! - `get`, `len` and `list` only look at the in-memory map.
//!
//! # Modules
//!
//! - [`qset`]: the [`QSet`] facade that ties everything together.
//! - [`members`]: the timestamped element map with LWW merge.
//! - [`queue`]: bounded write queue and its drain task.
//! - [`listener`]: subscription handshake and replication loop.
//! - [`bootstrap`]: startup ordering (subscribe, then snapshot).
//! - [`store`]: the store adapter traits plus an in-process store (with
//!   an optional journal), a TCP server exposing it, and a TCP client for it.
//! - [`lww`]: add/remove element set composed of two [`QSet`]s.
//! - [`cli`] and [`client`]: command line interface for the `qset` binary.

pub mod bootstrap;
pub mod cli;
pub mod client;
pub mod error;
pub mod listener;
pub mod lww;
pub mod members;
pub mod qset;
pub mod queue;
pub mod status;
pub mod store;
pub mod timestamp;
pub mod update;

pub use error::{QSetError, StoreError};
pub use lww::Lww;
pub use qset::{DEFAULT_QUEUE_CAPACITY, QSet};
pub use timestamp::Timestamp;
