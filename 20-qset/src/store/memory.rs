//! In-process store: one sorted map per set key plus pub/sub channels.
//!
//! All state sits behind a single mutex, which is what makes
//! [`MemoryStore::conditional_set`] atomic: the compare, the journal append,
//! the write and the publish happen without releasing the lock. A store
//! opened with [`MemoryStore::open`] is durable; [`MemoryStore::new`] keeps
//! everything in memory. The TCP [`StoreServer`] serves one of these to
//! other processes.
//!
//! [`StoreServer`]: crate::store::StoreServer

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::trace;

use crate::error::StoreError;
use crate::store::journal::{Journal, JournalEntry};
use crate::store::{Feed, FeedEvent, FeedSource, SetStore};
use crate::timestamp::Timestamp;
use crate::update;

pub type SubscriberId = u64;

/// A message pushed to one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub channel: String,
    pub payload: String,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    hub: Arc<Mutex<Hub>>,
}

#[derive(Default)]
struct Hub {
    sets: HashMap<String, HashMap<String, Timestamp>>,
    channels: HashMap<String, Vec<Subscriber>>,
    next_subscriber: SubscriberId,
    journal: Option<Journal>,
}

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::UnboundedSender<Published>,
}

impl Hub {
    fn publish(&mut self, channel: &str, payload: &str) -> usize {
        let Some(subscribers) = self.channels.get_mut(channel) else {
            return 0;
        };
        // Receivers that went away are pruned on the next publish.
        subscribers.retain(|subscriber| {
            subscriber
                .tx
                .send(Published {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                })
                .is_ok()
        });
        subscribers.len()
    }
}

impl MemoryStore {
    /// A store that lives only as long as the process.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store persisted to the journal at `path`. Existing entries are
    /// loaded before this returns.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let (journal, entries) = Journal::open(path)?;
        let mut hub = Hub::default();
        for JournalEntry { key, member, ts } in entries {
            let current = hub.sets.entry(key).or_default().entry(member).or_insert(ts);
            *current = (*current).max(ts);
        }
        hub.journal = Some(journal);
        Ok(Self {
            hub: Arc::new(Mutex::new(hub)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a new connection. Connections can be closed independently to
    /// simulate a dropped link.
    pub fn connect(&self) -> MemoryConnection {
        let (closed, _) = watch::channel(false);
        MemoryConnection {
            store: self.clone(),
            closed: Arc::new(closed),
        }
    }

    /// Fails only when the journal append fails, and then nothing changes.
    pub fn conditional_set(&self, set_key: &str, ts: Timestamp, member: &str) -> io::Result<bool> {
        let mut hub = self.lock();
        let current = hub.sets.get(set_key).and_then(|set| set.get(member));
        if current.is_some_and(|current| ts <= *current) {
            return Ok(false);
        }
        if let Some(journal) = hub.journal.as_mut() {
            journal.append(&JournalEntry {
                key: set_key.to_string(),
                member: member.to_string(),
                ts,
            })?;
        }
        hub.sets
            .entry(set_key.to_string())
            .or_default()
            .insert(member.to_string(), ts);
        let receivers = hub.publish(set_key, &update::encode(ts, member));
        trace!(set_key, member, %ts, receivers, "conditional set applied");
        Ok(true)
    }

    /// Members ordered by timestamp, then by member.
    pub fn read_all(&self, set_key: &str) -> Vec<(String, Timestamp)> {
        let hub = self.lock();
        let mut members: Vec<(String, Timestamp)> = hub
            .sets
            .get(set_key)
            .map(|set| set.iter().map(|(m, ts)| (m.clone(), *ts)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        members
    }

    /// Publishes a raw payload. Returns how many subscribers received it.
    pub fn publish(&self, channel: &str, payload: &str) -> usize {
        self.lock().publish(channel, payload)
    }

    pub fn register(
        &self,
        channel: &str,
        tx: mpsc::UnboundedSender<Published>,
    ) -> SubscriberId {
        let mut hub = self.lock();
        let id = hub.next_subscriber;
        hub.next_subscriber += 1;
        hub.channels
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        id
    }

    pub fn unregister(&self, channel: &str, id: SubscriberId) {
        let mut hub = self.lock();
        if let Some(subscribers) = hub.channels.get_mut(channel) {
            subscribers.retain(|subscriber| subscriber.id != id);
            if subscribers.is_empty() {
                hub.channels.remove(channel);
            }
        }
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock().channels.get(channel).map_or(0, Vec::len)
    }
}

/// One client connection to a [`MemoryStore`].
pub struct MemoryConnection {
    store: MemoryStore,
    // Shared with feeds so they outlive the connection handle.
    closed: Arc<watch::Sender<bool>>,
}

impl MemoryConnection {
    /// Closes the connection. Pending and future calls fail with
    /// [`StoreError::Closed`], including feeds opened from it.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if *self.closed.borrow() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl SetStore for MemoryConnection {
    async fn conditional_set(
        &self,
        set_key: &str,
        ts: Timestamp,
        member: &str,
    ) -> Result<bool, StoreError> {
        self.ensure_open()?;
        Ok(self.store.conditional_set(set_key, ts, member)?)
    }

    async fn read_all(&self, set_key: &str) -> Result<Vec<(String, Timestamp)>, StoreError> {
        self.ensure_open()?;
        Ok(self.store.read_all(set_key))
    }
}

#[async_trait]
impl FeedSource for MemoryConnection {
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Feed>, StoreError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.store.register(channel, tx.clone());
        let mut channels = HashMap::new();
        channels.insert(channel.to_string(), id);

        let mut pending = VecDeque::new();
        pending.push_back(FeedEvent::Subscribed {
            channel: channel.to_string(),
            count: channels.len(),
        });

        Ok(Box::new(MemoryFeed {
            store: self.store.clone(),
            rx,
            closed: self.closed.subscribe(),
            _link: Arc::clone(&self.closed),
            channels,
            pending,
        }))
    }
}

struct MemoryFeed {
    store: MemoryStore,
    rx: mpsc::UnboundedReceiver<Published>,
    closed: watch::Receiver<bool>,
    _link: Arc<watch::Sender<bool>>,
    channels: HashMap<String, SubscriberId>,
    pending: VecDeque<FeedEvent>,
}

#[async_trait]
impl Feed for MemoryFeed {
    async fn recv(&mut self) -> Result<FeedEvent, StoreError> {
        if *self.closed.borrow() {
            return Err(StoreError::Closed);
        }
        if let Some(event) = self.pending.pop_front() {
            return Ok(event);
        }
        tokio::select! {
            published = self.rx.recv() => match published {
                Some(Published { channel, payload }) => Ok(FeedEvent::Message { channel, payload }),
                None => Err(StoreError::Closed),
            },
            _ = self.closed.wait_for(|closed| *closed) => Err(StoreError::Closed),
        }
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), StoreError> {
        if *self.closed.borrow() {
            return Err(StoreError::Closed);
        }
        if let Some(id) = self.channels.remove(channel) {
            self.store.unregister(channel, id);
        }
        self.pending.push_back(FeedEvent::Unsubscribed {
            channel: channel.to_string(),
            count: self.channels.len(),
        });
        Ok(())
    }
}

impl Drop for MemoryFeed {
    fn drop(&mut self) {
        for (channel, id) in self.channels.drain() {
            self.store.unregister(&channel, id);
        }
    }
}
