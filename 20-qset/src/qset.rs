//! The replicated set facade.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::bootstrap::bootstrap;
use crate::error::QSetError;
use crate::listener::ListenerHandle;
use crate::members::ElementMap;
use crate::queue::{self, Drainer, PendingWrite, WriteQueue};
use crate::status::Status;
use crate::store::{FeedSource, SetStore};
use crate::timestamp::Timestamp;

/// Queue size used when none (or zero) is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100_000;

type MarshalFn<T> = Arc<dyn Fn(&T) -> String + Send + Sync>;
type UnmarshalFn<T> = Arc<dyn Fn(&str) -> T + Send + Sync>;

/// A last-write-wins set mirrored through a shared store.
///
/// Reads (`get`, `len`, `list`) are served from memory. `set` updates
/// memory immediately and queues the durable write, which a background
/// task applies with an atomic "only if newer" update that also notifies
/// the other replicas.
///
/// Store failures never fail a call; they are reported by
/// [`last_state`](QSet::last_state). Two members are the same member when
/// their marshaled strings are equal.
///
/// ```no_run
/// # async fn demo() {
/// use std::sync::Arc;
/// use qset::{QSet, store::MemoryStore};
///
/// let store = MemoryStore::new();
/// let set = QSet::<String>::new()
///     .with_writer(Arc::new(store.connect()))
///     .with_subscriber(Arc::new(store.connect()))
///     .with_set_key("TESTKEY")
///     .with_identity_codec();
/// set.init().await.expect("configured");
/// set.set(&"Data".to_string(), chrono::Utc::now()).await;
/// set.sync().await;
/// set.quit().await;
/// # }
/// ```
pub struct QSet<T> {
    writer: Option<Arc<dyn SetStore>>,
    subscriber: Option<Arc<dyn FeedSource>>,
    set_key: String,
    marshal: Option<MarshalFn<T>>,
    unmarshal: Option<UnmarshalFn<T>>,
    queue_capacity: usize,

    members: Arc<ElementMap>,
    status: Arc<Status>,
    running: Mutex<Option<Running>>,
    // Serializes init and quit so a set is bootstrapped at most once.
    lifecycle: tokio::sync::Mutex<()>,
}

/// Background work owned by an initialized set.
struct Running {
    queue: WriteQueue,
    drainer: Drainer,
    listener: Option<ListenerHandle>,
}

impl<T> Default for QSet<T> {
    fn default() -> Self {
        Self {
            writer: None,
            subscriber: None,
            set_key: String::new(),
            marshal: None,
            unmarshal: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            members: Arc::new(ElementMap::new()),
            status: Arc::new(Status::new()),
            running: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }
}

impl<T> QSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection used for the snapshot read and for durable writes.
    pub fn with_writer(mut self, store: Arc<dyn SetStore>) -> Self {
        self.writer = Some(store);
        self
    }

    /// Connection dedicated to the subscription. It must not be the
    /// writer's connection.
    pub fn with_subscriber(mut self, source: Arc<dyn FeedSource>) -> Self {
        self.subscriber = Some(source);
        self
    }

    /// Store key of the set; also the name of its channel.
    pub fn with_set_key(mut self, set_key: impl Into<String>) -> Self {
        self.set_key = set_key.into();
        self
    }

    /// Must be deterministic and give distinct strings for distinct elements.
    pub fn with_marshal<F>(mut self, marshal: F) -> Self
    where
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        self.marshal = Some(Arc::new(marshal));
        self
    }

    pub fn with_unmarshal<F>(mut self, unmarshal: F) -> Self
    where
        F: Fn(&str) -> T + Send + Sync + 'static,
    {
        self.unmarshal = Some(Arc::new(unmarshal));
        self
    }

    /// Writes buffered before `set` starts waiting. Zero means the default.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn set_key(&self) -> &str {
        &self.set_key
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn collaborators(&self) -> Result<(&Arc<dyn SetStore>, &Arc<dyn FeedSource>), QSetError> {
        let writer = self
            .writer
            .as_ref()
            .ok_or(QSetError::MissingConfig("writer connection"))?;
        let subscriber = self
            .subscriber
            .as_ref()
            .ok_or(QSetError::MissingConfig("subscriber connection"))?;
        if self.marshal.is_none() {
            return Err(QSetError::MissingConfig("marshal"));
        }
        if self.unmarshal.is_none() {
            return Err(QSetError::MissingConfig("unmarshal"));
        }
        if self.set_key.is_empty() {
            return Err(QSetError::MissingConfig("set key"));
        }
        Ok((writer, subscriber))
    }

    /// Validates the configuration, subscribes, loads the stored members
    /// and starts the write drain.
    ///
    /// Only configuration errors fail this call, and then nothing is
    /// started. Store errors along the way are recorded in
    /// [`last_state`](QSet::last_state) and the set keeps working from
    /// memory. Calling `init` on a running set does nothing, also when the
    /// calls overlap.
    pub async fn init(&self) -> Result<(), QSetError> {
        let (writer, subscriber) = match self.collaborators() {
            Ok(collaborators) => collaborators,
            Err(err) => {
                self.status.record(err.clone());
                return Err(err);
            }
        };
        let _lifecycle = self.lifecycle.lock().await;
        if self.running().is_some() {
            warn!(set_key = %self.set_key, "init called on a running set");
            return Ok(());
        }

        self.members.init();
        let listener = match bootstrap(
            &self.set_key,
            &**writer,
            &**subscriber,
            &self.members,
            &self.status,
        )
        .await
        {
            Ok(handle) => Some(handle),
            Err(err) => {
                self.status.record(err);
                None
            }
        };

        let capacity = match self.queue_capacity {
            0 => DEFAULT_QUEUE_CAPACITY,
            n => n,
        };
        let (queue, drainer) = queue::spawn(
            capacity,
            self.set_key.clone(),
            Arc::clone(writer),
            Arc::clone(&self.status),
        );

        *self.running() = Some(Running {
            queue,
            drainer,
            listener,
        });
        info!(set_key = %self.set_key, members = self.members.len(), capacity, "qset ready");
        Ok(())
    }

    /// Adds `element` or moves its timestamp forward.
    ///
    /// `at` is truncated to the microsecond. The change is visible to
    /// `get` on this instance as soon as the call returns; persisting and
    /// broadcasting it happens in the background. Waits only when the write
    /// queue is full.
    pub async fn set(&self, element: &T, at: DateTime<Utc>) {
        let Some(marshal) = &self.marshal else {
            self.status.record(QSetError::MissingConfig("marshal"));
            return;
        };
        let member = marshal(element);
        let ts = Timestamp::from(at);
        self.members.set(&member, ts);

        let queue = self.running().as_ref().map(|running| running.queue.clone());
        let Some(queue) = queue else {
            self.status.record(QSetError::NotInitialized);
            return;
        };
        if let Err(err) = queue.enqueue(PendingWrite { member, ts }).await {
            self.status.record(err);
        }
    }

    /// Timestamp of `element`, if it is in the set.
    pub fn get(&self, element: &T) -> Option<DateTime<Utc>> {
        let marshal = self.marshal.as_ref()?;
        self.members.get(&marshal(element)).map(Timestamp::to_datetime)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// All elements, in marshaled-string order.
    pub fn list(&self) -> Vec<T> {
        let Some(unmarshal) = &self.unmarshal else {
            self.status.record(QSetError::MissingConfig("unmarshal"));
            return Vec::new();
        };
        self.members
            .keys()
            .iter()
            .map(|member| unmarshal(member))
            .collect()
    }

    /// Waits until every write queued so far has been attempted against
    /// the store. Check [`last_state`](QSet::last_state) afterwards to see
    /// whether any of them failed.
    pub async fn sync(&self) {
        let queue = self.running().as_ref().map(|running| running.queue.clone());
        if let Some(queue) = queue {
            queue.sync().await;
        }
    }

    /// Stops the write drain and unsubscribes. A write already sent to the
    /// store finishes first; writes still queued are dropped, so call
    /// [`sync`](QSet::sync) to keep them. The in-memory view stays readable.
    pub async fn quit(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let running = self.running().take();
        let Some(Running {
            drainer, listener, ..
        }) = running
        else {
            return;
        };
        drainer.quit().await;
        if let Some(listener) = listener {
            listener.quit().await;
        }
        info!(set_key = %self.set_key, "qset stopped");
    }

    /// Most recent error seen by initialization, the store or the listener.
    pub fn last_state(&self) -> Option<QSetError> {
        self.status.last()
    }
}

impl QSet<String> {
    /// Uses the strings themselves as their marshaled form.
    pub fn with_identity_codec(self) -> Self {
        self.with_marshal(|element: &String| element.clone())
            .with_unmarshal(|member: &str| member.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use tokio::sync::Semaphore;
    use tokio::time::{sleep, timeout};

    use crate::error::StoreError;
    use crate::store::{MemoryConnection, MemoryStore};

    /// Writer whose conditional sets wait for a permit.
    struct GatedWriter {
        gate: Semaphore,
        inner: MemoryConnection,
    }

    #[async_trait]
    impl SetStore for GatedWriter {
        async fn conditional_set(
            &self,
            set_key: &str,
            ts: Timestamp,
            member: &str,
        ) -> Result<bool, StoreError> {
            self.gate.acquire().await.expect("gate open").forget();
            self.inner.conditional_set(set_key, ts, member).await
        }

        async fn read_all(&self, set_key: &str) -> Result<Vec<(String, Timestamp)>, StoreError> {
            self.inner.read_all(set_key).await
        }
    }

    /// Writer that lands another replica's write right after taking the
    /// snapshot, so only the subscription can deliver it.
    struct SnapshotRacer {
        inner: MemoryConnection,
        store: MemoryStore,
    }

    #[async_trait]
    impl SetStore for SnapshotRacer {
        async fn conditional_set(
            &self,
            set_key: &str,
            ts: Timestamp,
            member: &str,
        ) -> Result<bool, StoreError> {
            self.inner.conditional_set(set_key, ts, member).await
        }

        async fn read_all(&self, set_key: &str) -> Result<Vec<(String, Timestamp)>, StoreError> {
            let snapshot = self.inner.read_all(set_key).await?;
            self.store.conditional_set(set_key, Timestamp::from_micros(7), "late")?;
            Ok(snapshot)
        }
    }

    fn string_set(store: &MemoryStore, key: &str) -> QSet<String> {
        QSet::new()
            .with_writer(Arc::new(store.connect()))
            .with_subscriber(Arc::new(store.connect()))
            .with_set_key(key)
            .with_identity_codec()
    }

    #[tokio::test]
    async fn init_reports_each_missing_collaborator() {
        let store = MemoryStore::new();

        let bare = QSet::<String>::new();
        assert!(matches!(
            bare.init().await,
            Err(QSetError::MissingConfig("writer connection"))
        ));
        assert!(bare.last_state().is_some());

        let cases: Vec<(QSet<String>, &str)> = vec![
            (
                QSet::new().with_writer(Arc::new(store.connect())),
                "subscriber connection",
            ),
            (
                QSet::new()
                    .with_writer(Arc::new(store.connect()))
                    .with_subscriber(Arc::new(store.connect())),
                "marshal",
            ),
            (
                QSet::new()
                    .with_writer(Arc::new(store.connect()))
                    .with_subscriber(Arc::new(store.connect()))
                    .with_marshal(|e: &String| e.clone()),
                "unmarshal",
            ),
            (
                QSet::new()
                    .with_writer(Arc::new(store.connect()))
                    .with_subscriber(Arc::new(store.connect()))
                    .with_identity_codec(),
                "set key",
            ),
        ];
        for (set, missing) in cases {
            match set.init().await {
                Err(QSetError::MissingConfig(name)) => assert_eq!(name, missing),
                other => panic!("expected missing {missing}, got {other:?}"),
            }
            // Nothing was started.
            assert!(set.running().is_none());
        }
    }

    #[tokio::test]
    async fn set_then_get_sees_the_write_immediately() {
        let store = MemoryStore::new();
        let set = string_set(&store, "TESTKEY");
        set.init().await.unwrap();

        let at = Utc.timestamp_opt(1_451_606_400, 0).unwrap();
        set.set(&"Data".to_string(), at).await;

        let ts = set.get(&"Data".to_string()).expect("member present");
        assert_eq!(ts.timestamp(), 1_451_606_400);
        set.quit().await;
    }

    #[tokio::test]
    async fn set_truncates_sub_microsecond_precision() {
        let store = MemoryStore::new();
        let set = string_set(&store, "TESTKEY");
        set.init().await.unwrap();

        let at = Utc.timestamp_opt(1_451_606_400, 987_654_321).unwrap();
        set.set(&"e".to_string(), at).await;

        let ts = set.get(&"e".to_string()).unwrap();
        assert_eq!(ts.timestamp_subsec_nanos(), 987_654_000);
        set.sync().await;
        assert_eq!(
            store.read_all("TESTKEY"),
            vec![("e".to_string(), Timestamp::from(at))]
        );
        set.quit().await;
    }

    #[tokio::test]
    async fn len_and_list_follow_distinct_members() {
        let store = MemoryStore::new();
        let set = string_set(&store, "TESTKEY");
        set.init().await.unwrap();
        assert_eq!(set.len(), 0);

        let t = Utc::now();
        set.set(&"data".to_string(), t).await;
        assert_eq!(set.len(), 1);

        let later = t + chrono::Duration::seconds(10);
        set.set(&"data".to_string(), later).await;
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(&"data".to_string()), Some(Timestamp::from(later).to_datetime()));

        set.set(&"new data".to_string(), later).await;
        assert_eq!(set.len(), 2);
        assert_eq!(set.list(), vec!["data".to_string(), "new data".to_string()]);

        set.sync().await;
        set.quit().await;
    }

    #[tokio::test]
    async fn older_local_write_does_not_regress() {
        let store = MemoryStore::new();
        let set = string_set(&store, "TESTKEY");
        set.init().await.unwrap();

        let t = Utc::now();
        let earlier = t - chrono::Duration::seconds(1);
        set.set(&"e".to_string(), t).await;
        set.set(&"e".to_string(), earlier).await;
        set.sync().await;

        assert_eq!(set.get(&"e".to_string()), Some(Timestamp::from(t).to_datetime()));
        assert_eq!(store.read_all("TESTKEY")[0].1, Timestamp::from(t));
        set.quit().await;
    }

    #[tokio::test]
    async fn set_before_init_is_local_only() {
        let store = MemoryStore::new();
        let set = string_set(&store, "TESTKEY");

        set.set(&"e".to_string(), Utc::now()).await;

        assert_eq!(set.len(), 1);
        assert!(matches!(set.last_state(), Some(QSetError::NotInitialized)));
        assert!(store.read_all("TESTKEY").is_empty());
    }

    #[tokio::test]
    async fn writer_outage_is_only_visible_in_last_state() {
        let store = MemoryStore::new();
        let writer = Arc::new(store.connect());
        let set = QSet::<String>::new()
            .with_writer(writer.clone())
            .with_subscriber(Arc::new(store.connect()))
            .with_set_key("TESTKEY")
            .with_identity_codec();
        set.init().await.unwrap();
        assert!(set.last_state().is_none());

        writer.close();
        set.set(&"e".to_string(), Utc::now()).await;
        set.sync().await;

        assert!(set.get(&"e".to_string()).is_some());
        assert!(matches!(set.last_state(), Some(QSetError::Store(_))));
        set.quit().await;
    }

    #[tokio::test]
    async fn replicas_converge_through_the_store() {
        let store = MemoryStore::new();
        let a = string_set(&store, "TESTKEY");
        let b = string_set(&store, "TESTKEY");
        a.init().await.unwrap();
        b.init().await.unwrap();

        let t = Utc::now();
        a.set(&"shared".to_string(), t).await;
        a.sync().await;

        let expected = Timestamp::from(t).to_datetime();
        timeout(Duration::from_secs(1), async {
            while b.get(&"shared".to_string()) != Some(expected) {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("replica b converges");

        a.quit().await;
        b.quit().await;
    }

    #[tokio::test]
    async fn quit_is_idempotent_and_keeps_the_view() {
        let store = MemoryStore::new();
        let set = string_set(&store, "TESTKEY");
        set.init().await.unwrap();
        set.set(&"e".to_string(), Utc::now()).await;
        set.sync().await;

        set.quit().await;
        set.quit().await;

        assert_eq!(set.len(), 1);
        assert_eq!(store.subscriber_count("TESTKEY"), 0);
    }

    #[tokio::test]
    async fn full_queue_makes_set_wait() {
        let store = MemoryStore::new();
        let writer = Arc::new(GatedWriter {
            gate: Semaphore::new(0),
            inner: store.connect(),
        });
        let set = QSet::<String>::new()
            .with_writer(writer.clone())
            .with_subscriber(Arc::new(store.connect()))
            .with_set_key("TESTKEY")
            .with_identity_codec()
            .with_queue_capacity(1);
        set.init().await.unwrap();

        let t = Utc::now();
        // The drain holds the first write at the gate, the second fills the slot.
        set.set(&"a".to_string(), t).await;
        sleep(Duration::from_millis(20)).await;
        set.set(&"b".to_string(), t).await;
        assert!(
            timeout(Duration::from_millis(100), set.set(&"c".to_string(), t))
                .await
                .is_err(),
            "set should wait for queue space"
        );
        // The write that timed out still updated memory.
        assert_eq!(set.len(), 3);

        writer.gate.add_permits(8);
        set.set(&"c".to_string(), t).await;
        set.sync().await;
        assert_eq!(store.read_all("TESTKEY").len(), 3);
        assert!(set.last_state().is_none());
        set.quit().await;
    }

    #[tokio::test]
    async fn init_returns_with_updates_published_during_the_snapshot() {
        let store = MemoryStore::new();
        let set = QSet::<String>::new()
            .with_writer(Arc::new(SnapshotRacer {
                inner: store.connect(),
                store: store.clone(),
            }))
            .with_subscriber(Arc::new(store.connect()))
            .with_set_key("TESTKEY")
            .with_identity_codec();
        set.init().await.unwrap();

        assert_eq!(
            set.get(&"late".to_string()),
            Some(Timestamp::from_micros(7).to_datetime())
        );
        set.quit().await;
    }

    #[tokio::test]
    async fn overlapping_inits_bootstrap_once() {
        let store = MemoryStore::new();
        let set = string_set(&store, "TESTKEY");

        let (first, second) = tokio::join!(set.init(), set.init());
        first.unwrap();
        second.unwrap();

        assert_eq!(store.subscriber_count("TESTKEY"), 1);
        set.quit().await;
        assert_eq!(store.subscriber_count("TESTKEY"), 0);
    }
}
