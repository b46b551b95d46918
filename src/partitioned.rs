use std::sync::Arc;

use crate::config::ConsumerConfig;
use crate::managed_consumer::ManagedConsumer;
use crate::manager::ConsumerManager;
use crate::partition::{PartitionSet, QueueKey};
use crate::queue::{OnStopCallback, StartOffsetProvider};
use crate::task::Task;

/// Consumer manager fixed to one consumer per partition, driven by incremental
/// add / remove / delete operations instead of full-set replacement.
///
/// Built with [`ConsumerManagerBuilder::build_partitioned`](crate::manager::ConsumerManagerBuilder::build_partitioned).
pub struct PartitionedConsumerManager<M: Send + 'static> {
    manager: ConsumerManager<M>,
}

impl<M: Send + 'static> Clone for PartitionedConsumerManager<M> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
        }
    }
}

impl<M: Send + 'static> PartitionedConsumerManager<M> {
    pub(crate) fn from_manager(manager: ConsumerManager<M>) -> Self {
        Self { manager }
    }

    /// Queue a config replacement; the per-partition layout is kept regardless of the flag passed in
    pub fn update_config(&self, mut config: ConsumerConfig) {
        config.consumer_per_partition = true;
        self.manager.update_config(config);
    }

    /// Start a dedicated consumer for each partition not already held.
    ///
    /// `on_stop` fires per partition once that partition's run loop exits.
    pub fn add_partitions(
        &self,
        partitions: PartitionSet,
        on_stop: Option<OnStopCallback>,
        start_offset_provider: Option<StartOffsetProvider>,
    ) {
        self.manager.add_task(Task::AddPartitions {
            partitions,
            on_stop,
            start_offset_provider,
        });
    }

    pub fn remove_partitions(&self, partitions: PartitionSet) {
        self.manager.add_task(Task::RemovePartitions(partitions));
    }

    /// Remove the partitions, then delete each backing topic. A failed deletion does not
    /// prevent the others.
    pub fn delete(&self, partitions: PartitionSet) {
        self.manager.add_task(Task::DeletePartitions(partitions));
    }

    pub fn stop(&self) {
        self.manager.stop();
    }

    pub async fn await_stop(&self) {
        self.manager.await_stop().await;
    }

    pub fn active_partitions(&self) -> PartitionSet {
        self.manager.active_partitions()
    }

    pub fn consumers(&self) -> Vec<Arc<ManagedConsumer<M>>> {
        self.manager.consumers()
    }

    pub fn config(&self) -> Option<Arc<ConsumerConfig>> {
        self.manager.config()
    }

    pub fn queue_key(&self) -> &QueueKey {
        self.manager.queue_key()
    }

    pub fn is_stopped(&self) -> bool {
        self.manager.is_stopped()
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for the partitioned module.
    //!
    //! ## Test Coverage Summary:
    //!
    //! ### Building:
    //! - Queue admin is mandatory
    //! - Per-partition layout is forced, also on later config updates
    //!
    //! ### Incremental operations:
    //! - add {p0,p1} then remove {p0} leaves only p1 running
    //! - Any add/remove sequence leaves exactly one consumer per net partition
    //!
    //! ### Delete:
    //! - Topics are deleted after their consumers stopped
    //! - A failing topic deletion does not stop the others

    use super::*;
    use crate::error::ConsumerError;
    use crate::manager::tests::{wait_until, TestHarness, TEST_QUEUE};
    use crate::memory::InMemoryAdmin;
    use crate::partition::{partitions_of, PartitionKey};
    use crate::queue::{MockQueueAdmin, QueueAdmin};
    use anyhow::anyhow;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    // ========================================================================
    // TEST HELPERS
    // ========================================================================

    fn create_manager(harness: &TestHarness, admin: Arc<dyn QueueAdmin>) -> PartitionedConsumerManager<String> {
        harness
            .builder(Some(ConsumerConfig::new(true, 20)))
            .queue_admin(admin)
            .build_partitioned()
            .unwrap()
    }

    fn running(manager: &PartitionedConsumerManager<String>) -> Vec<Arc<ManagedConsumer<String>>> {
        manager
            .consumers()
            .into_iter()
            .filter(|consumer| consumer.is_running())
            .collect()
    }

    // ========================================================================
    // BUILDING TESTS
    // ========================================================================

    #[tokio::test]
    async fn test_build_requires_admin() {
        let harness = TestHarness::new();
        let error = harness.builder(None).build_partitioned().err().unwrap();
        assert!(error.to_string().contains("No queue admin provided"));
        assert!(matches!(
            error.downcast_ref::<ConsumerError>(),
            Some(ConsumerError::AdminMissing(queue_key)) if queue_key.as_str() == TEST_QUEUE
        ));
    }

    #[tokio::test]
    async fn test_per_partition_layout_forced() {
        let harness = TestHarness::new();
        let admin = Arc::new(InMemoryAdmin::new(harness.storage.clone()));
        let manager = harness
            .builder(Some(ConsumerConfig::new(false, 20)))
            .queue_admin(admin)
            .build_partitioned()
            .unwrap();
        assert!(manager.config().unwrap().consumer_per_partition);

        manager.update_config(ConsumerConfig::new(false, 35));
        assert!(wait_until(|| manager.config().unwrap().poll_interval_ms == 35, 2000).await);
        assert!(manager.config().unwrap().consumer_per_partition);
    }

    #[tokio::test]
    async fn test_defaults_config_when_missing() {
        let harness = TestHarness::new();
        let admin = Arc::new(InMemoryAdmin::new(harness.storage.clone()));
        let manager = harness.builder(None).queue_admin(admin).build_partitioned().unwrap();

        let config = manager.config().unwrap();
        assert!(config.consumer_per_partition);
        assert_eq!(config.poll_interval_ms, ConsumerConfig::default().poll_interval_ms);
        assert_eq!(manager.queue_key().as_str(), "test-queue");
    }

    // ========================================================================
    // INCREMENTAL OPERATION TESTS
    // ========================================================================

    #[tokio::test]
    async fn test_add_then_remove_scenario() {
        let harness = TestHarness::new();
        let manager = create_manager(&harness, Arc::new(InMemoryAdmin::new(harness.storage.clone())));

        manager.add_partitions(partitions_of("t", [0, 1]), None, None);
        assert!(wait_until(|| running(&manager).len() == 2, 2000).await);

        let p0 = manager
            .consumers()
            .into_iter()
            .find(|consumer| consumer.partition() == Some(&PartitionKey::new("t", 0)))
            .unwrap();

        manager.remove_partitions(partitions_of("t", [0]));
        assert!(wait_until(|| manager.active_partitions() == partitions_of("t", [1]), 2000).await);

        assert!(p0.await_completion(5).await);
        assert!(!p0.is_running());
        let still_running = running(&manager);
        assert_eq!(still_running.len(), 1);
        assert_eq!(still_running[0].partition(), Some(&PartitionKey::new("t", 1)));

        manager.stop();
        manager.await_stop().await;
        assert!(running(&manager).is_empty());
    }

    #[tokio::test]
    async fn test_on_stop_fires_per_partition() {
        let harness = TestHarness::new();
        let manager = create_manager(&harness, Arc::new(InMemoryAdmin::new(harness.storage.clone())));
        let stopped = Arc::new(Mutex::new(Vec::new()));
        let stopped_clone = stopped.clone();
        let on_stop: OnStopCallback = Arc::new(move |partition: &PartitionKey, clean: bool| {
            stopped_clone.lock().unwrap().push((partition.clone(), clean));
        });

        manager.add_partitions(partitions_of("t", [0, 1]), Some(on_stop), None);
        assert!(wait_until(|| running(&manager).len() == 2, 2000).await);
        manager.remove_partitions(partitions_of("t", [1]));

        assert!(wait_until(|| stopped.lock().unwrap().len() == 1, 2000).await);
        assert_eq!(*stopped.lock().unwrap(), vec![(PartitionKey::new("t", 1), true)]);

        manager.stop();
        manager.await_stop().await;
        assert_eq!(stopped.lock().unwrap().len(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn prop_no_duplicate_consumers(ops in prop::collection::vec((any::<bool>(), 0u32..6), 1..16)) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let harness = TestHarness::new();
                let manager = create_manager(&harness, Arc::new(InMemoryAdmin::new(harness.storage.clone())));

                let mut expected = PartitionSet::new();
                for (add, number) in &ops {
                    let partition = partitions_of("t", [*number]);
                    if *add {
                        expected.insert(PartitionKey::new("t", *number));
                        manager.add_partitions(partition, None, None);
                    } else {
                        expected.remove(&PartitionKey::new("t", *number));
                        manager.remove_partitions(partition);
                    }
                }

                let converged = wait_until(
                    || {
                        let live = running(&manager);
                        manager.active_partitions() == expected && live.len() == expected.len()
                    },
                    5000,
                )
                .await;
                assert!(converged, "expected {:?}, got {:?}", expected, manager.active_partitions());

                let mut keys: Vec<String> = manager.consumers().iter().map(|c| c.key().to_string()).collect();
                let total = keys.len();
                keys.sort();
                keys.dedup();
                assert_eq!(keys.len(), total, "Consumer keys must be unique");

                manager.stop();
                manager.await_stop().await;
            });
        }
    }

    // ========================================================================
    // DELETE TESTS
    // ========================================================================

    #[tokio::test]
    async fn test_delete_removes_consumers_and_topics() {
        let harness = TestHarness::new();
        harness.storage.append("t.0", "a".to_string());
        harness.storage.append("t.1", "b".to_string());
        let admin = Arc::new(InMemoryAdmin::new(harness.storage.clone()));
        let manager = create_manager(&harness, admin.clone());

        manager.add_partitions(partitions_of("t", [0, 1]), None, None);
        assert!(wait_until(|| harness.processed().len() == 2, 2000).await);

        manager.delete(partitions_of("t", [0]));
        assert!(wait_until(|| admin.deleted_topics() == vec!["t.0".to_string()], 2000).await);

        assert_eq!(manager.active_partitions(), partitions_of("t", [1]));
        assert!(!harness.storage.contains_topic("t.0"));
        assert!(harness.storage.contains_topic("t.1"));

        manager.stop();
        manager.await_stop().await;
    }

    #[tokio::test]
    async fn test_delete_failure_is_isolated() {
        let harness = TestHarness::new();
        let attempted = Arc::new(Mutex::new(Vec::new()));
        let deleted = Arc::new(AtomicU32::new(0));

        let mut admin = MockQueueAdmin::new();
        let attempted_clone = attempted.clone();
        admin
            .expect_delete_topic()
            .withf(|topic: &str| topic == "t.1")
            .times(1)
            .returning(move |topic: &str| {
                attempted_clone.lock().unwrap().push(topic.to_string());
                Err(anyhow!("topic is locked"))
            });
        let attempted_clone = attempted.clone();
        let deleted_clone = deleted.clone();
        admin
            .expect_delete_topic()
            .withf(|topic: &str| topic == "t.0" || topic == "t.2")
            .times(2)
            .returning(move |topic: &str| {
                attempted_clone.lock().unwrap().push(topic.to_string());
                deleted_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        let manager = create_manager(&harness, Arc::new(admin));
        manager.add_partitions(partitions_of("t", [0, 1, 2, 3]), None, None);
        assert!(wait_until(|| running(&manager).len() == 4, 2000).await);

        manager.delete(partitions_of("t", [0, 1, 2]));
        assert!(wait_until(|| attempted.lock().unwrap().len() == 3, 2000).await);

        assert_eq!(*attempted.lock().unwrap(), vec!["t.0", "t.1", "t.2"]);
        assert_eq!(deleted.load(Ordering::SeqCst), 2);
        assert_eq!(manager.active_partitions(), partitions_of("t", [3]));

        manager.stop();
        manager.await_stop().await;
    }
}
