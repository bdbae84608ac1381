//! Startup ordering for a replica.
//!
//! The subscription must be acknowledged before the snapshot is read.
//! Reading first would leave a window where an update published after the
//! read but before the subscription is lost until that member is written
//! again. Merging is max-by-timestamp, so snapshot entries and live updates
//! can interleave in any order.

use std::sync::Arc;

use tracing::info;

use crate::error::QSetError;
use crate::listener::{Listener, ListenerHandle};
use crate::members::ElementMap;
use crate::status::Status;
use crate::store::{FeedSource, SetStore};

/// Subscribes, starts the listener, loads the snapshot into `members`,
/// then waits for the listener to catch up.
///
/// A failed subscription is returned before the snapshot is touched. A
/// failed snapshot read is recorded in `status`, and the running listener
/// is still returned.
pub async fn bootstrap(
    set_key: &str,
    store: &dyn SetStore,
    feed_source: &dyn FeedSource,
    members: &Arc<ElementMap>,
    status: &Arc<Status>,
) -> Result<ListenerHandle, QSetError> {
    let listener = Listener::subscribe(
        feed_source,
        set_key,
        Arc::clone(members),
        Arc::clone(status),
    )
    .await?;
    let handle = listener.spawn();

    match store.read_all(set_key).await {
        Ok(snapshot) => {
            let loaded = snapshot.len();
            for (member, ts) in snapshot {
                members.set(&member, ts);
            }
            info!(set_key, loaded, "snapshot loaded");
        }
        Err(err) => status.record(err),
    }
    handle.caught_up().await;

    Ok(handle)
}
