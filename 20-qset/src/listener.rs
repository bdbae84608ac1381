//! Replication listener: keeps the element map in step with the channel.
//!
//! ```text
//! Subscribing --ack(count > 0)--> Listening --quit--> Closed
//!                                     |
//!                                     +--error / ack(count == 0)--> Errored
//! ```
//!
//! There are no retries here. When the feed dies the error is recorded and
//! the loop ends; reconnecting means running bootstrap again.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::QSetError;
use crate::members::ElementMap;
use crate::status::Status;
use crate::store::{Feed, FeedEvent, FeedSource};
use crate::update::Update;

/// How a listener loop ended.
#[derive(Debug, Clone)]
pub enum ListenerExit {
    /// Stopped by `quit`.
    Closed,
    /// The feed failed or the store dropped the subscription.
    Errored(QSetError),
}

pub struct Listener {
    feed: Box<dyn Feed>,
    channel: String,
    members: Arc<ElementMap>,
    status: Arc<Status>,
}

impl Listener {
    /// Subscribes to `channel` and waits for the store's acknowledgment.
    ///
    /// Once this returns, every update published afterwards will be seen.
    pub async fn subscribe(
        source: &dyn FeedSource,
        channel: &str,
        members: Arc<ElementMap>,
        status: Arc<Status>,
    ) -> Result<Self, QSetError> {
        let feed = source.subscribe(channel).await?;
        let mut listener = Self {
            feed,
            channel: channel.to_string(),
            members,
            status,
        };

        loop {
            match listener.feed.recv().await? {
                FeedEvent::Subscribed { count, .. } if count > 0 => break,
                FeedEvent::Subscribed { .. } | FeedEvent::Unsubscribed { .. } => {
                    return Err(QSetError::SubscriptionEnded(listener.channel));
                }
                FeedEvent::Message { payload, .. } => listener.apply(&payload),
            }
        }

        debug!(channel, "subscription acknowledged");
        Ok(listener)
    }

    /// Merges one `"<ts>:<member>"` payload into the map.
    fn apply(&self, payload: &str) {
        match Update::decode(payload) {
            Some(update) => {
                let changed = self.members.set(&update.member, update.ts);
                trace!(member = %update.member, ts = %update.ts, changed, "replicated update");
            }
            None => warn!(channel = %self.channel, payload, "ignoring malformed update"),
        }
    }

    pub fn spawn(self) -> ListenerHandle {
        let (quit_tx, quit_rx) = oneshot::channel();
        let (catch_up_tx, catch_up_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(self.run(quit_rx, catch_up_rx));
        ListenerHandle {
            quit: quit_tx,
            catch_up: catch_up_tx,
            handle,
        }
    }

    async fn run(
        mut self,
        mut quit: oneshot::Receiver<()>,
        mut catch_up: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
    ) -> ListenerExit {
        // Branch order matters: a catch-up request is only answered once the
        // feed has nothing ready.
        let exit = loop {
            tokio::select! {
                biased;
                _ = &mut quit => {
                    if let Err(err) = self.feed.unsubscribe(&self.channel).await {
                        debug!(channel = %self.channel, error = %err, "unsubscribe failed");
                    }
                    break ListenerExit::Closed;
                }
                event = self.feed.recv() => match event {
                    Ok(FeedEvent::Message { payload, .. }) => self.apply(&payload),
                    Ok(FeedEvent::Unsubscribed { count: 0, .. }) => {
                        let err = QSetError::SubscriptionEnded(self.channel.clone());
                        self.status.record(err.clone());
                        break ListenerExit::Errored(err);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        let err = QSetError::from(err);
                        self.status.record(err.clone());
                        break ListenerExit::Errored(err);
                    }
                },
                Some(ack) = catch_up.recv() => {
                    let _ = ack.send(());
                }
            }
        };
        info!(channel = %self.channel, ?exit, "listener stopped");
        exit
    }
}

pub struct ListenerHandle {
    quit: oneshot::Sender<()>,
    catch_up: mpsc::UnboundedSender<oneshot::Sender<()>>,
    handle: JoinHandle<ListenerExit>,
}

impl ListenerHandle {
    /// Returns once every event already delivered to the feed has been
    /// merged. Also returns if the loop has stopped.
    pub async fn caught_up(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.catch_up.send(ack_tx).is_ok() {
            let _ = ack_rx.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Unsubscribes and waits for the loop to end. If it already ended on
    /// an error, that exit is returned instead.
    pub async fn quit(self) -> ListenerExit {
        let _ = self.quit.send(());
        match self.handle.await {
            Ok(exit) => exit,
            Err(err) => {
                warn!(error = ?err, "listener task panicked");
                ListenerExit::Closed
            }
        }
    }
}
