//! In-memory queue technology.
//!
//! Topics are append-only logs shared by every consumer created on the same storage;
//! each consumer keeps its own read position per topic. Useful for tests, demos and
//! single-process deployments.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::Notify;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, trace};

use crate::partition::PartitionSet;
use crate::queue::{QueueAdmin, QueueConsumer, StartOffsetProvider};

const DEFAULT_MAX_POLL_RECORDS: usize = 100;

/// Shared topic logs
pub struct InMemoryStorage<M> {
    topics: RwLock<HashMap<String, Vec<M>>>,
    appended: Notify,
}

impl<M: Clone> InMemoryStorage<M> {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            appended: Notify::new(),
        }
    }

    /// Append a message to a topic, creating the topic if needed
    pub fn append(&self, topic: &str, msg: M) {
        self.append_all(topic, vec![msg]);
    }

    pub fn append_all(&self, topic: &str, msgs: Vec<M>) {
        self.topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .extend(msgs);
        self.appended.notify_waiters();
    }

    /// Number of messages ever appended to a topic
    pub fn len(&self, topic: &str) -> usize {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, Vec::len)
    }

    pub fn contains_topic(&self, topic: &str) -> bool {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(topic)
    }

    /// Drop a topic and its data; returns whether it existed
    pub fn delete_topic(&self, topic: &str) -> bool {
        let existed = self
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic)
            .is_some();
        self.appended.notify_waiters();
        existed
    }

    /// Messages of `topic` from `offset`, at most `limit` of them
    fn read(&self, topic: &str, offset: usize, limit: usize) -> Vec<M> {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map(|log| log.iter().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default()
    }
}

impl<M: Clone> Default for InMemoryStorage<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer reading the logs of its subscribed partitions' topics
pub struct InMemoryConsumer<M> {
    name: String,
    storage: Arc<InMemoryStorage<M>>,
    max_poll_records: usize,
    partitions: Mutex<PartitionSet>,
    positions: Mutex<HashMap<String, usize>>,
    start_offsets: Mutex<Option<StartOffsetProvider>>,
    subscribed: AtomicBool,
    stopped: AtomicBool,
    stop_notify: Notify,
    subscribe_count: AtomicUsize,
    unsubscribe_count: AtomicUsize,
    poll_count: AtomicUsize,
}

impl<M: Clone + Send + Sync> InMemoryConsumer<M> {
    pub fn new(storage: Arc<InMemoryStorage<M>>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage,
            max_poll_records: DEFAULT_MAX_POLL_RECORDS,
            partitions: Mutex::new(PartitionSet::new()),
            positions: Mutex::new(HashMap::new()),
            start_offsets: Mutex::new(None),
            subscribed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
            subscribe_count: AtomicUsize::new(0),
            unsubscribe_count: AtomicUsize::new(0),
            poll_count: AtomicUsize::new(0),
        }
    }

    /// Limit the batch size returned by one poll (builder pattern)
    pub fn with_max_poll_records(mut self, max_poll_records: usize) -> Self {
        self.max_poll_records = max_poll_records.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current subscription
    pub fn partitions(&self) -> PartitionSet {
        self.partitions.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribe_count.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribe_count.load(Ordering::SeqCst)
    }

    pub fn poll_count(&self) -> usize {
        self.poll_count.load(Ordering::SeqCst)
    }

    /// Read position of a topic
    pub fn position(&self, topic: &str) -> usize {
        self.positions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    fn fetch(&self) -> Vec<M> {
        let topics: Vec<String> = self
            .partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|partition| partition.full_topic_name())
            .collect();

        let mut positions = self.positions.lock().unwrap_or_else(PoisonError::into_inner);
        let mut batch = Vec::new();
        for topic in topics {
            let remaining = self.max_poll_records - batch.len();
            if remaining == 0 {
                break;
            }
            let position = positions.entry(topic.clone()).or_insert(0);
            let msgs = self.storage.read(&topic, *position, remaining);
            *position += msgs.len();
            batch.extend(msgs);
        }
        batch
    }
}

#[async_trait]
impl<M: Clone + Send + Sync + 'static> QueueConsumer<M> for InMemoryConsumer<M> {
    fn subscribe(&self, partitions: &PartitionSet) {
        debug!("[{}] Subscribing to {} partitions", self.name, partitions.len());
        let provider = self
            .start_offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        {
            let mut positions = self.positions.lock().unwrap_or_else(PoisonError::into_inner);
            for partition in partitions {
                let topic = partition.full_topic_name();
                if positions.contains_key(&topic) {
                    continue;
                }
                let start = provider
                    .as_ref()
                    .and_then(|provider| provider(&topic))
                    .unwrap_or(0);
                positions.insert(topic, start as usize);
            }
        }
        *self.partitions.lock().unwrap_or_else(PoisonError::into_inner) = partitions.clone();
        self.subscribed.store(true, Ordering::SeqCst);
        self.subscribe_count.fetch_add(1, Ordering::SeqCst);
    }

    fn unsubscribe(&self) {
        debug!("[{}] Unsubscribing", self.name);
        self.partitions.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.subscribed.store(false, Ordering::SeqCst);
        self.unsubscribe_count.fetch_add(1, Ordering::SeqCst);
    }

    async fn poll(&self, poll_timeout: Duration) -> Result<Vec<M>> {
        self.poll_count.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + poll_timeout;
        loop {
            // Registered before checking so an append racing the fetch still wakes us
            let appended = self.storage.appended.notified();
            let stopped = self.stop_notify.notified();
            if self.is_stopped() {
                return Ok(Vec::new());
            }
            if self.is_subscribed() {
                let batch = self.fetch();
                if !batch.is_empty() {
                    trace!("[{}] Polled {} messages", self.name, batch.len());
                    return Ok(batch);
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            let _ = timeout(remaining, async {
                tokio::select! {
                    _ = appended => {}
                    _ = stopped => {}
                }
            })
            .await;
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn set_start_offset_provider(&self, provider: StartOffsetProvider) {
        *self.start_offsets.lock().unwrap_or_else(PoisonError::into_inner) = Some(provider);
    }
}

/// Admin deleting topics from an in-memory storage
pub struct InMemoryAdmin<M> {
    storage: Arc<InMemoryStorage<M>>,
    deleted: Mutex<Vec<String>>,
}

impl<M: Clone> InMemoryAdmin<M> {
    pub fn new(storage: Arc<InMemoryStorage<M>>) -> Self {
        Self {
            storage,
            deleted: Mutex::new(Vec::new()),
        }
    }

    /// Topics deleted so far, in deletion order
    pub fn deleted_topics(&self) -> Vec<String> {
        self.deleted.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl<M: Clone + Send + Sync + 'static> QueueAdmin for InMemoryAdmin<M> {
    async fn delete_topic(&self, topic: &str) -> Result<()> {
        if !self.storage.delete_topic(topic) {
            debug!("Topic {} did not exist", topic);
        }
        self.deleted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(topic.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::partitions_of;

    fn create_storage() -> Arc<InMemoryStorage<String>> {
        let storage = Arc::new(InMemoryStorage::new());
        storage.append_all("t.0", vec!["a".to_string(), "b".to_string()]);
        storage.append_all("t.1", vec!["c".to_string()]);
        storage
    }

    #[tokio::test]
    async fn test_poll_reads_subscribed_topics_only() {
        let storage = create_storage();
        let consumer = InMemoryConsumer::new(storage, "c");
        consumer.subscribe(&partitions_of("t", [1]));

        let batch = consumer.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch, vec!["c".to_string()]);

        let batch = consumer.poll(Duration::from_millis(10)).await.unwrap();
        assert!(batch.is_empty(), "Position advanced past consumed messages");
        assert_eq!(consumer.position("t.1"), 1);
        assert_eq!(consumer.poll_count(), 2);
    }

    #[tokio::test]
    async fn test_poll_without_subscription_is_empty() {
        let consumer = InMemoryConsumer::new(create_storage(), "c");
        let batch = consumer.poll(Duration::from_millis(10)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_max_poll_records() {
        let consumer = InMemoryConsumer::new(create_storage(), "c").with_max_poll_records(1);
        consumer.subscribe(&partitions_of("t", [0]));

        assert_eq!(consumer.poll(Duration::from_millis(10)).await.unwrap(), vec!["a".to_string()]);
        assert_eq!(consumer.poll(Duration::from_millis(10)).await.unwrap(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_poll_wakes_on_append() {
        let storage = Arc::new(InMemoryStorage::new());
        let consumer = Arc::new(InMemoryConsumer::new(storage.clone(), "c"));
        consumer.subscribe(&partitions_of("t", [0]));

        let poller = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.poll(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        storage.append("t.0", "late".to_string());

        let batch = timeout(Duration::from_secs(2), poller).await.unwrap().unwrap().unwrap();
        assert_eq!(batch, vec!["late".to_string()]);
    }

    #[tokio::test]
    async fn test_stop_interrupts_poll() {
        let consumer = Arc::new(InMemoryConsumer::<String>::new(Arc::new(InMemoryStorage::new()), "c"));
        consumer.subscribe(&partitions_of("t", [0]));

        let poller = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.poll(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        consumer.stop();

        let batch = timeout(Duration::from_secs(2), poller).await.unwrap().unwrap().unwrap();
        assert!(batch.is_empty());
        assert!(consumer.is_stopped());
    }

    #[tokio::test]
    async fn test_start_offset_provider() {
        let consumer = InMemoryConsumer::new(create_storage(), "c");
        consumer.set_start_offset_provider(Arc::new(|topic: &str| (topic == "t.0").then_some(1)));
        consumer.subscribe(&partitions_of("t", [0, 1]));

        let mut batch = consumer.poll(Duration::from_millis(10)).await.unwrap();
        batch.sort();
        assert_eq!(batch, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_unsubscribe_clears_partitions() {
        let consumer = InMemoryConsumer::new(create_storage(), "c");
        consumer.subscribe(&partitions_of("t", [0]));
        consumer.unsubscribe();

        assert!(!consumer.is_subscribed());
        assert!(consumer.partitions().is_empty());
        assert_eq!(consumer.subscribe_count(), 1);
        assert_eq!(consumer.unsubscribe_count(), 1);
    }

    #[tokio::test]
    async fn test_admin_deletes_topic() {
        let storage = create_storage();
        let admin = InMemoryAdmin::new(storage.clone());

        admin.delete_topic("t.0").await.unwrap();
        admin.delete_topic("missing").await.unwrap();

        assert!(!storage.contains_topic("t.0"));
        assert!(storage.contains_topic("t.1"));
        assert_eq!(admin.deleted_topics(), vec!["t.0".to_string(), "missing".to_string()]);
    }
}
