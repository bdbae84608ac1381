//! Error types recorded by a [`QSet`](crate::QSet) and returned by stores.
//!
//! Both enums are `Clone` so the last observed error can be handed out as
//! a snapshot while the background tasks keep running.

use std::{io, sync::Arc};

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store connection closed")]
    Closed,
    #[error("store i/o error: {0}")]
    Io(Arc<io::Error>),
    #[error("store protocol error: {0}")]
    Protocol(String),
    #[error("connection is in subscriber mode")]
    SubscriberMode,
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Protocol(err.to_string())
    }
}

#[derive(Debug, Clone, Error)]
pub enum QSetError {
    /// A required collaborator was not configured before `init`.
    #[error("{0} must be set")]
    MissingConfig(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The store reported no remaining subscriptions for the set channel.
    #[error("subscription to {0} ended")]
    SubscriptionEnded(String),
    #[error("set used before init")]
    NotInitialized,
    #[error("write queue is closed")]
    QueueClosed,
}
