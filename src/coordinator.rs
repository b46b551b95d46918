use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::partition::{PartitionKey, PartitionSet};
use crate::partitioned::PartitionedConsumerManager;
use crate::queue::OnStopCallback;
use crate::utils::partitions_to_string;

/// Starts event consumption for a partition only after its state stream finished loading.
///
/// A partition's state load is complete when its state consumer's run loop exits cleanly,
/// which the state processor triggers by stopping the consumer once it caught up. A loop
/// ending on a failure leaves the partition in progress.
pub struct StreamOrderingCoordinator<S: Send + 'static, E: Send + 'static> {
    state: PartitionedConsumerManager<S>,
    events: PartitionedConsumerManager<E>,
    event_topic: Option<String>,
    held: Arc<HeldPartitions>,
}

struct HeldPartitions {
    partitions: RwLock<Option<PartitionSet>>,
    /// Partitions still loading state, stamped with the update that added them
    in_progress: Mutex<HashMap<PartitionKey, u64>>,
    epoch: AtomicU64,
}

impl HeldPartitions {
    /// Clear the in-progress mark if it still belongs to `epoch`
    fn finish_loading(&self, partition: &PartitionKey, epoch: u64) -> bool {
        let mut in_progress = self.in_progress.lock().unwrap_or_else(PoisonError::into_inner);
        match in_progress.get(partition) {
            Some(current) if *current == epoch => {
                in_progress.remove(partition);
                true
            }
            _ => false,
        }
    }
}

impl<S: Send + 'static, E: Send + 'static> StreamOrderingCoordinator<S, E> {
    pub fn new(state: PartitionedConsumerManager<S>, events: PartitionedConsumerManager<E>) -> Self {
        Self {
            state,
            events,
            event_topic: None,
            held: Arc::new(HeldPartitions {
                partitions: RwLock::new(None),
                in_progress: Mutex::new(HashMap::new()),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Hand partitions to the event stream on another topic, keeping the partition number
    pub fn with_event_topic(mut self, topic: impl Into<String>) -> Self {
        self.event_topic = Some(topic.into());
        self
    }

    /// Replace the held partition set.
    ///
    /// Removed partitions leave both streams at once. Added partitions load state first;
    /// each one reaches the event stream from its own state completion callback.
    pub fn update(&self, partitions: PartitionSet) {
        let (added, removed, epoch) = {
            let mut held = self.held.partitions.write().unwrap_or_else(PoisonError::into_inner);
            let current = held.take().unwrap_or_default();
            let removed: PartitionSet = current.difference(&partitions).cloned().collect();
            let added: PartitionSet = partitions.difference(&current).cloned().collect();
            *held = Some(partitions);

            let epoch = self.held.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            let mut in_progress = self.held.in_progress.lock().unwrap_or_else(PoisonError::into_inner);
            for partition in &removed {
                in_progress.remove(partition);
            }
            for partition in &added {
                in_progress.insert(partition.clone(), epoch);
            }
            (added, removed, epoch)
        };

        if !removed.is_empty() {
            info!(
                "[{}] Removing partitions from state and event streams: {}",
                self.state.queue_key(),
                partitions_to_string(&removed)
            );
            self.events.remove_partitions(self.event_partitions(&removed));
            self.state.remove_partitions(removed);
        }
        if !added.is_empty() {
            info!("[{}] 🔄 Loading state for partitions: {}", self.state.queue_key(), partitions_to_string(&added));
            self.state.add_partitions(added, Some(self.on_state_loaded(epoch)), None);
        }
    }

    /// Drop partitions from the held set and delete them, topics included, on both streams
    pub fn delete(&self, partitions: PartitionSet) {
        {
            let mut held = self.held.partitions.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(held) = held.as_mut() {
                held.retain(|partition| !partitions.contains(partition));
            }
            let mut in_progress = self.held.in_progress.lock().unwrap_or_else(PoisonError::into_inner);
            in_progress.retain(|partition, _| !partitions.contains(partition));
        }
        info!("[{}] Deleting partitions: {}", self.state.queue_key(), partitions_to_string(&partitions));
        self.events.delete(self.event_partitions(&partitions));
        self.state.delete(partitions);
    }

    /// Currently held partitions, `None` before the first update
    pub fn partitions(&self) -> Option<PartitionSet> {
        self.held.partitions.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Partitions whose state is still loading, `None` before the first update
    pub fn partitions_in_progress(&self) -> Option<PartitionSet> {
        let held = self.held.partitions.read().unwrap_or_else(PoisonError::into_inner);
        if held.is_none() {
            return None;
        }
        let in_progress = self.held.in_progress.lock().unwrap_or_else(PoisonError::into_inner);
        Some(in_progress.keys().cloned().collect())
    }

    pub fn state_manager(&self) -> &PartitionedConsumerManager<S> {
        &self.state
    }

    pub fn event_manager(&self) -> &PartitionedConsumerManager<E> {
        &self.events
    }

    /// Stop both streams. The event stream goes first so late state callbacks are ignored.
    pub fn stop(&self) {
        self.events.stop();
        self.state.stop();
    }

    pub async fn await_stop(&self) {
        self.state.await_stop().await;
        self.events.await_stop().await;
    }

    fn event_partitions(&self, partitions: &PartitionSet) -> PartitionSet {
        partitions
            .iter()
            .map(|partition| event_partition(self.event_topic.as_deref(), partition))
            .collect()
    }

    fn on_state_loaded(&self, epoch: u64) -> OnStopCallback {
        let held = self.held.clone();
        let events = self.events.clone();
        let event_topic = self.event_topic.clone();
        Arc::new(move |partition: &PartitionKey, clean: bool| {
            if !clean {
                warn!(
                    "[{}] State load for {} failed, holding back its event consumer",
                    events.queue_key(),
                    partition
                );
                return;
            }
            let partitions = held.partitions.read().unwrap_or_else(PoisonError::into_inner);
            if !held.finish_loading(partition, epoch) {
                debug!("[{}] Ignoring stale state completion for {}", events.queue_key(), partition);
                return;
            }
            let still_held = partitions.as_ref().is_some_and(|set| set.contains(partition));
            if still_held {
                let target = event_partition(event_topic.as_deref(), partition);
                info!("[{}] ✅ State loaded for {}, starting event consumer for {}", events.queue_key(), partition, target);
                events.add_partitions(PartitionSet::from([target]), None, None);
            } else {
                debug!("[{}] {} was removed before its state finished loading", events.queue_key(), partition);
            }
        })
    }
}

fn event_partition(event_topic: Option<&str>, partition: &PartitionKey) -> PartitionKey {
    match event_topic {
        Some(topic) => partition.with_topic(topic),
        None => partition.clone(),
    }
}
