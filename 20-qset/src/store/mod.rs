//! Durable store adapter.
//!
//! The set needs three things from its store, split over two connections
//! so a blocking subscription never starves reads and writes:
//!
//! - [`SetStore::conditional_set`]: atomic "store and publish only if
//!   newer" for one member.
//! - [`SetStore::read_all`]: the full `(member, timestamp)` snapshot, used
//!   once at bootstrap.
//! - [`FeedSource::subscribe`]: the live stream of published updates.
//!
//! [`memory`] is an in-process store, optionally persisted by a
//! [`journal`]. [`server`] exposes it over TCP and [`remote`] is the
//! matching client.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::timestamp::Timestamp;

pub mod journal;
pub mod memory;
pub mod protocol;
pub mod remote;
pub mod server;

pub use memory::{MemoryConnection, MemoryStore};
pub use remote::RemoteStore;
pub use server::StoreServer;

#[async_trait]
pub trait SetStore: Send + Sync {
    /// Stores `ts` for `member` under `set_key` and publishes
    /// `"<ts>:<member>"` on the `set_key` channel, but only when the member
    /// is absent or `ts` is strictly greater than the stored timestamp.
    ///
    /// Implementations must perform the compare, write and publish as one
    /// indivisible step at the store. Returns whether the write was applied.
    async fn conditional_set(
        &self,
        set_key: &str,
        ts: Timestamp,
        member: &str,
    ) -> Result<bool, StoreError>;

    /// Every member stored under `set_key` with its timestamp.
    async fn read_all(&self, set_key: &str) -> Result<Vec<(String, Timestamp)>, StoreError>;
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Sends the subscribe request. The acknowledgment arrives as the first
    /// [`FeedEvent::Subscribed`] on the returned feed.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Feed>, StoreError>;
}

/// Events delivered on a subscribed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// `count` is the number of channels this connection is subscribed to.
    Subscribed { channel: String, count: usize },
    /// A raw `"<ts>:<member>"` payload.
    Message { channel: String, payload: String },
    Unsubscribed { channel: String, count: usize },
}

#[async_trait]
pub trait Feed: Send {
    /// Waits for the next event. Once the connection is gone every call
    /// returns an error.
    async fn recv(&mut self) -> Result<FeedEvent, StoreError>;

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), StoreError>;
}
