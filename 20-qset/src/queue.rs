//! Bounded write queue drained by a single task.
//!
//! `enqueue` waits while the queue is full, so a store that cannot keep up
//! slows callers down to its own pace instead of growing memory or dropping
//! writes. The drain task applies writes in enqueue order and keeps going
//! after store errors; those are only recorded.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::QSetError;
use crate::status::Status;
use crate::store::SetStore;
use crate::timestamp::Timestamp;

/// A write waiting to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub member: String,
    pub ts: Timestamp,
}

/// Producer side of the queue. Cheap to clone.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<PendingWrite>,
    outstanding: Arc<watch::Sender<usize>>,
}

impl WriteQueue {
    /// Appends a write, waiting for room if the queue is full.
    pub async fn enqueue(&self, write: PendingWrite) -> Result<(), QSetError> {
        let permit = self
            .tx
            .reserve()
            .await
            .map_err(|_| QSetError::QueueClosed)?;
        self.outstanding.send_modify(|n| *n += 1);
        permit.send(write);
        Ok(())
    }

    /// Writes enqueued but not yet attempted against the store.
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Resolves once every write enqueued so far has been attempted.
    pub async fn sync(&self) {
        let mut rx = self.outstanding.subscribe();
        // The sender lives in `self`, so this cannot fail.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Handle to the running drain task.
pub struct Drainer {
    quit: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Drainer {
    /// Stops the drain task without flushing. A store call in flight is
    /// allowed to finish, then writes still queued are discarded; call
    /// [`WriteQueue::sync`] first to keep them.
    pub async fn quit(self) {
        let _ = self.quit.send(());
        if let Err(err) = self.handle.await {
            warn!(error = ?err, "write drain task panicked");
        }
    }
}

/// Creates a queue of `capacity` entries and spawns its drain task.
pub fn spawn(
    capacity: usize,
    set_key: String,
    store: Arc<dyn SetStore>,
    status: Arc<Status>,
) -> (WriteQueue, Drainer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (outstanding, _) = watch::channel(0usize);
    let outstanding = Arc::new(outstanding);
    let (quit_tx, quit_rx) = oneshot::channel();

    let drain = Drain {
        rx,
        set_key,
        store,
        status,
        outstanding: Arc::clone(&outstanding),
    };
    let handle = tokio::spawn(drain.run(quit_rx));

    (
        WriteQueue { tx, outstanding },
        Drainer {
            quit: quit_tx,
            handle,
        },
    )
}

struct Drain {
    rx: mpsc::Receiver<PendingWrite>,
    set_key: String,
    store: Arc<dyn SetStore>,
    status: Arc<Status>,
    outstanding: Arc<watch::Sender<usize>>,
}

impl Drain {
    async fn run(mut self, mut quit: oneshot::Receiver<()>) {
        // Quit is only checked between writes; a started store call always
        // completes.
        loop {
            tokio::select! {
                biased;
                _ = &mut quit => break,
                write = self.rx.recv() => match write {
                    Some(write) => {
                        self.apply(write).await;
                        self.outstanding.send_modify(|n| *n -= 1);
                    }
                    None => break,
                },
            }
        }
        self.discard_remaining().await;
        info!(set_key = %self.set_key, "write drain stopped");
    }

    async fn apply(&self, write: PendingWrite) {
        match self
            .store
            .conditional_set(&self.set_key, write.ts, &write.member)
            .await
        {
            Ok(applied) => debug!(
                set_key = %self.set_key,
                member = %write.member,
                ts = %write.ts,
                applied,
                "write persisted"
            ),
            Err(err) => self.status.record(err),
        }
    }

    /// Releases `sync` waiters and blocked producers once the task is gone.
    ///
    /// Producers already holding a permit may still send after `close`, so
    /// this keeps receiving until the channel reports it is fully drained.
    async fn discard_remaining(&mut self) {
        self.rx.close();
        let mut dropped = 0usize;
        while self.rx.recv().await.is_some() {
            dropped += 1;
            self.outstanding.send_modify(|n| *n -= 1);
        }
        if dropped > 0 {
            warn!(set_key = %self.set_key, dropped, "pending writes discarded on quit");
        }
    }
}
