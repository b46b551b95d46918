use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::ConsumerError;
use crate::managed_consumer::ManagedConsumer;
use crate::manager::ConsumerContext;
use crate::partition::{PartitionKey, PartitionSet};
use crate::queue::{OnStopCallback, StartOffsetProvider};
use crate::utils::partitions_to_string;

/// How a manager lays consumers out over its assigned partitions
pub enum AssignmentStrategy<M: Send + 'static> {
    /// One consumer subscribed to the full partition set
    Shared(SharedConsumer<M>),
    /// One independently started and stopped consumer per partition
    PerPartition(ConsumerPerPartition<M>),
}

pub struct SharedConsumer<M: Send + 'static> {
    ctx: Arc<ConsumerContext<M>>,
    consumer: Mutex<Option<Arc<ManagedConsumer<M>>>>,
}

pub struct ConsumerPerPartition<M: Send + 'static> {
    ctx: Arc<ConsumerContext<M>>,
    consumers: RwLock<HashMap<PartitionKey, Arc<ManagedConsumer<M>>>>,
}

impl<M: Send + 'static> AssignmentStrategy<M> {
    pub fn new(ctx: Arc<ConsumerContext<M>>, consumer_per_partition: bool) -> Self {
        if consumer_per_partition {
            Self::PerPartition(ConsumerPerPartition {
                ctx,
                consumers: RwLock::new(HashMap::new()),
            })
        } else {
            Self::Shared(SharedConsumer {
                ctx,
                consumer: Mutex::new(None),
            })
        }
    }

    pub fn is_per_partition(&self) -> bool {
        matches!(self, Self::PerPartition(_))
    }

    /// Replace the full partition set
    pub async fn update_partitions(&self, partitions: &PartitionSet) {
        match self {
            Self::Shared(shared) => shared.update_partitions(partitions).await,
            Self::PerPartition(per_partition) => per_partition.update_partitions(partitions).await,
        }
    }

    pub async fn add_partitions(
        &self,
        partitions: &PartitionSet,
        on_stop: Option<OnStopCallback>,
        start_offset_provider: Option<StartOffsetProvider>,
    ) -> Result<(), ConsumerError> {
        match self {
            Self::Shared(shared) => Err(ConsumerError::Unsupported {
                queue: shared.ctx.queue_key().clone(),
                operation: "add partitions",
            }),
            Self::PerPartition(per_partition) => {
                per_partition
                    .add_partitions(partitions, on_stop, start_offset_provider)
                    .await;
                Ok(())
            }
        }
    }

    pub async fn remove_partitions(&self, partitions: &PartitionSet) -> Result<(), ConsumerError> {
        match self {
            Self::Shared(shared) => Err(ConsumerError::Unsupported {
                queue: shared.ctx.queue_key().clone(),
                operation: "remove partitions",
            }),
            Self::PerPartition(per_partition) => {
                per_partition.remove_partitions(partitions).await;
                Ok(())
            }
        }
    }

    /// Snapshot of every consumer currently held
    pub fn consumers(&self) -> Vec<Arc<ManagedConsumer<M>>> {
        match self {
            Self::Shared(shared) => shared
                .consumer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned()
                .collect(),
            Self::PerPartition(per_partition) => per_partition
                .consumers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .cloned()
                .collect(),
        }
    }

    /// Partitions that own a dedicated consumer; always empty for the shared layout
    pub fn active_partitions(&self) -> PartitionSet {
        match self {
            Self::Shared(_) => PartitionSet::new(),
            Self::PerPartition(per_partition) => per_partition
                .consumers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .keys()
                .cloned()
                .collect(),
        }
    }

    /// Initiate stop on every consumer first, then await them all
    pub async fn stop_and_await(&self) {
        let consumers = self.consumers();
        consumers.iter().for_each(|consumer| consumer.initiate_stop());
        let timeout_secs = self.ctx().await_timeout_secs();
        for consumer in consumers {
            consumer.await_completion(timeout_secs).await;
        }
    }

    fn ctx(&self) -> &Arc<ConsumerContext<M>> {
        match self {
            Self::Shared(shared) => &shared.ctx,
            Self::PerPartition(per_partition) => &per_partition.ctx,
        }
    }
}

impl<M: Send + 'static> SharedConsumer<M> {
    async fn update_partitions(&self, partitions: &PartitionSet) {
        let key = self.ctx.queue_key();
        if partitions.is_empty() {
            let existing = self.consumer.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(consumer) = existing {
                info!("[{}] No partitions assigned, stopping shared consumer", key);
                consumer.initiate_stop();
                consumer.await_completion(self.ctx.await_timeout_secs()).await;
            }
            return;
        }

        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(|| self.ctx.create_consumer(key.to_string(), None, None))
            .clone();

        info!("[{}] Subscribing shared consumer to partitions: {}", key, partitions_to_string(partitions));
        if let Err(e) = consumer.subscribe(partitions).await {
            error!("[{}] Failed to subscribe shared consumer: {}", key, e);
            return;
        }
        if !consumer.is_running() {
            self.ctx.launch(&consumer);
        }
    }
}

impl<M: Send + 'static> ConsumerPerPartition<M> {
    async fn update_partitions(&self, partitions: &PartitionSet) {
        let (removed, added) = {
            let consumers = self.consumers.read().unwrap_or_else(PoisonError::into_inner);
            let removed: PartitionSet = consumers
                .keys()
                .filter(|partition| !partitions.contains(*partition))
                .cloned()
                .collect();
            let added: PartitionSet = partitions
                .iter()
                .filter(|partition| !consumers.contains_key(*partition))
                .cloned()
                .collect();
            (removed, added)
        };
        debug!(
            "[{}] Calculated partition diff: removed {}, added {}",
            self.ctx.queue_key(),
            partitions_to_string(&removed),
            partitions_to_string(&added)
        );

        self.remove_partitions(&removed).await;
        self.add_partitions(&added, None, None).await;
    }

    async fn add_partitions(
        &self,
        partitions: &PartitionSet,
        on_stop: Option<OnStopCallback>,
        start_offset_provider: Option<StartOffsetProvider>,
    ) {
        let queue_key = self.ctx.queue_key();
        for partition in partitions {
            if self
                .consumers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(partition)
            {
                warn!("[{}] Consumer for {} already exists, ignoring add", queue_key, partition);
                continue;
            }

            let consumer_key = queue_key.consumer_key(partition);
            info!("[{}] Adding consumer for {}", consumer_key, partition);
            let consumer = self
                .ctx
                .create_consumer(consumer_key.clone(), Some(partition.clone()), on_stop.clone());

            if let Some(provider) = &start_offset_provider {
                if let Err(e) = consumer.set_start_offset_provider(provider.clone()).await {
                    error!("[{}] Failed to set start offset provider: {}", consumer_key, e);
                    continue;
                }
            }
            let single = PartitionSet::from([partition.clone()]);
            if let Err(e) = consumer.subscribe(&single).await {
                error!("[{}] Failed to subscribe to {}: {}", consumer_key, partition, e);
                continue;
            }

            self.consumers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(partition.clone(), consumer.clone());
            self.ctx.launch(&consumer);
        }
    }

    async fn remove_partitions(&self, partitions: &PartitionSet) {
        let removed: Vec<Arc<ManagedConsumer<M>>> = {
            let mut consumers = self.consumers.write().unwrap_or_else(PoisonError::into_inner);
            partitions
                .iter()
                .filter_map(|partition| consumers.remove(partition))
                .collect()
        };
        if removed.is_empty() {
            return;
        }

        for consumer in &removed {
            info!("[{}] Removing consumer", consumer.key());
            consumer.initiate_stop();
        }
        let timeout_secs = self.ctx.await_timeout_secs();
        for consumer in &removed {
            consumer.await_completion(timeout_secs).await;
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for the strategy module.
    //!
    //! ## Test Coverage Summary:
    //!
    //! ### Shared layout:
    //! - One consumer subscribed to the whole set, re-subscribed on change
    //! - Empty set stops and drops the consumer; next non-empty set recreates it
    //! - Incremental operations are rejected
    //!
    //! ### Per-partition layout:
    //! - Diff stops exactly the removed and starts exactly the added partitions
    //! - Untouched partitions keep the same consumer instance
    //! - Start offset providers and on_stop callbacks are wired per consumer
    //! - Duplicate adds never create a second consumer
    //! - Any held/wanted pair converges to the wanted set, reusing kept consumers

    use super::*;
    use crate::config::ConsumerConfig;
    use crate::manager::tests::{create_test_context, TestHarness};
    use crate::partition::partitions_of;
    use crate::queue::QueueConsumer;
    use proptest::prelude::*;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::{sleep, Duration};

    // ========================================================================
    // SHARED LAYOUT TESTS
    // ========================================================================

    #[tokio::test]
    async fn test_shared_subscribes_full_set() {
        let harness = TestHarness::new();
        let strategy = AssignmentStrategy::new(create_test_context(&harness, ConsumerConfig::new(false, 20)), false);

        strategy.update_partitions(&partitions_of("t", [1, 2, 3])).await;

        let created = harness.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].partitions(), partitions_of("t", [1, 2, 3]));
        assert!(strategy.consumers()[0].is_running());

        strategy.update_partitions(&partitions_of("t", [4, 5])).await;
        assert_eq!(harness.created().len(), 1, "Shared consumer is re-subscribed, not recreated");
        assert_eq!(created[0].partitions(), partitions_of("t", [4, 5]));
        assert_eq!(created[0].subscribe_count(), 2);

        strategy.stop_and_await().await;
    }

    #[tokio::test]
    async fn test_shared_empty_set_stops_consumer() {
        let harness = TestHarness::new();
        let strategy = AssignmentStrategy::new(create_test_context(&harness, ConsumerConfig::new(false, 20)), false);

        strategy.update_partitions(&PartitionSet::new()).await;
        assert!(harness.created().is_empty(), "Empty set never creates a consumer");

        strategy.update_partitions(&partitions_of("t", [1])).await;
        let first = strategy.consumers()[0].clone();

        strategy.update_partitions(&PartitionSet::new()).await;
        assert!(strategy.consumers().is_empty());
        assert!(!first.is_running());
        assert!(harness.created()[0].is_stopped());
        assert_eq!(harness.created()[0].unsubscribe_count(), 1);

        strategy.update_partitions(&partitions_of("t", [1, 2])).await;
        let second = strategy.consumers()[0].clone();
        assert_ne!(first.id(), second.id());
        assert_eq!(harness.created().len(), 2);

        strategy.stop_and_await().await;
    }

    #[tokio::test]
    async fn test_shared_rejects_incremental_operations() {
        let harness = TestHarness::new();
        let strategy = AssignmentStrategy::new(create_test_context(&harness, ConsumerConfig::default()), false);

        let added = strategy.add_partitions(&partitions_of("t", [1]), None, None).await;
        let removed = strategy.remove_partitions(&partitions_of("t", [1])).await;

        assert!(matches!(added, Err(ConsumerError::Unsupported { .. })));
        assert!(matches!(removed, Err(ConsumerError::Unsupported { .. })));
        assert!(!strategy.is_per_partition());
    }

    // ========================================================================
    // PER-PARTITION LAYOUT TESTS
    // ========================================================================

    #[tokio::test]
    async fn test_per_partition_diff() {
        let harness = TestHarness::new();
        let strategy = AssignmentStrategy::new(create_test_context(&harness, ConsumerConfig::new(true, 20)), true);

        strategy.update_partitions(&partitions_of("t", [0, 1, 2])).await;
        let before: HashMap<PartitionKey, uuid::Uuid> = strategy
            .consumers()
            .iter()
            .map(|consumer| (consumer.partition().cloned().unwrap(), consumer.id()))
            .collect();
        let removed_consumer = strategy
            .consumers()
            .into_iter()
            .find(|consumer| consumer.partition() == Some(&PartitionKey::new("t", 0)))
            .unwrap();

        strategy.update_partitions(&partitions_of("t", [1, 2, 3])).await;

        assert_eq!(strategy.active_partitions(), partitions_of("t", [1, 2, 3]));
        assert!(!removed_consumer.is_running(), "Removed consumer is awaited");
        for consumer in strategy.consumers() {
            let partition = consumer.partition().cloned().unwrap();
            match before.get(&partition) {
                Some(id) => assert_eq!(*id, consumer.id(), "{} must not be recreated", partition),
                None => assert_eq!(partition, PartitionKey::new("t", 3)),
            }
            assert!(consumer.is_running());
        }
        assert_eq!(harness.created().len(), 4);

        strategy.stop_and_await().await;
    }

    #[tokio::test]
    async fn test_per_partition_consumers_subscribe_single_partition() {
        let harness = TestHarness::new();
        let strategy = AssignmentStrategy::new(create_test_context(&harness, ConsumerConfig::new(true, 20)), true);

        strategy.update_partitions(&partitions_of("t", [5, 6])).await;

        let mut subscriptions: Vec<PartitionSet> =
            harness.created().iter().map(|consumer| consumer.partitions()).collect();
        subscriptions.sort();
        assert_eq!(subscriptions, vec![partitions_of("t", [5]), partitions_of("t", [6])]);
        let mut keys: Vec<String> = strategy.consumers().iter().map(|c| c.key().to_string()).collect();
        keys.sort();
        assert_eq!(keys, vec!["test-queue-5", "test-queue-6"]);

        strategy.stop_and_await().await;
    }

    #[tokio::test]
    async fn test_per_partition_add_is_not_duplicated() {
        let harness = TestHarness::new();
        let strategy = AssignmentStrategy::new(create_test_context(&harness, ConsumerConfig::new(true, 20)), true);

        strategy.add_partitions(&partitions_of("t", [1]), None, None).await.unwrap();
        strategy.add_partitions(&partitions_of("t", [1, 2]), None, None).await.unwrap();

        assert_eq!(harness.created().len(), 2);
        assert_eq!(strategy.active_partitions(), partitions_of("t", [1, 2]));

        strategy.remove_partitions(&partitions_of("t", [1, 9])).await.unwrap();
        assert_eq!(strategy.active_partitions(), partitions_of("t", [2]));

        strategy.stop_and_await().await;
    }

    #[tokio::test]
    async fn test_per_partition_on_stop_and_offsets() {
        let harness = TestHarness::new();
        harness.storage.append_all("t.1", vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        let strategy = AssignmentStrategy::new(create_test_context(&harness, ConsumerConfig::new(true, 20)), true);

        let stopped = Arc::new(AtomicU32::new(0));
        let stopped_clone = stopped.clone();
        let on_stop: OnStopCallback = Arc::new(move |_partition: &PartitionKey, clean: bool| {
            if clean {
                stopped_clone.fetch_add(1, Ordering::SeqCst);
            }
        });
        let offsets: StartOffsetProvider = Arc::new(|topic: &str| if topic == "t.1" { Some(2) } else { None });

        strategy
            .add_partitions(&partitions_of("t", [1]), Some(on_stop), Some(offsets))
            .await
            .unwrap();

        let mut waited = 0;
        while harness.processed().is_empty() && waited < 100 {
            sleep(Duration::from_millis(20)).await;
            waited += 1;
        }
        assert_eq!(harness.processed(), vec!["c".to_string()], "Reading starts at the provided offset");

        strategy.remove_partitions(&partitions_of("t", [1])).await.unwrap();
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_per_partition_diff_converges(
            held in prop::collection::btree_set(0u32..10, 0..6),
            wanted in prop::collection::btree_set(0u32..10, 0..6),
        ) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(assert_diff_converges(held, wanted));
        }
    }

    async fn assert_diff_converges(held: BTreeSet<u32>, wanted: BTreeSet<u32>) {
        let harness = TestHarness::new();
        let strategy = AssignmentStrategy::new(create_test_context(&harness, ConsumerConfig::new(true, 20)), true);
        let held = partitions_of("t", held);
        let wanted = partitions_of("t", wanted);

        strategy.update_partitions(&held).await;
        let before: HashMap<PartitionKey, Arc<ManagedConsumer<String>>> = strategy
            .consumers()
            .into_iter()
            .map(|consumer| (consumer.partition().cloned().unwrap(), consumer))
            .collect();

        strategy.update_partitions(&wanted).await;

        assert_eq!(strategy.active_partitions(), wanted);
        for consumer in strategy.consumers() {
            let partition = consumer.partition().cloned().unwrap();
            if let Some(previous) = before.get(&partition) {
                assert_eq!(previous.id(), consumer.id(), "{} must keep its consumer", partition);
            }
            assert!(consumer.is_running());
        }
        for (partition, consumer) in &before {
            if !wanted.contains(partition) {
                assert!(!consumer.is_running(), "{} must be stopped", partition);
            }
        }
        assert_eq!(harness.created().len(), held.union(&wanted).count());

        strategy.stop_and_await().await;
    }
}
