use anyhow::Result;
use partition_consumers::config::Settings;
use partition_consumers::memory::{InMemoryAdmin, InMemoryConsumer, InMemoryStorage};
use partition_consumers::partition::partitions_of;
use partition_consumers::utils;
use partition_consumers::{
    ConsumerConfig, ConsumerManager, PartitionKey, PartitionedConsumerManager, QueueConsumer, QueueKey,
    StreamOrderingCoordinator,
};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

const CONFIG_PATH: &str = "config.yaml";
const STATE_QUEUE: &str = "cf_state";
const EVENT_QUEUE: &str = "cf_events";
const LOADED_MARKER: &str = "loaded";
const PARTITIONS: u32 = 4;

fn load_settings() -> Result<Settings> {
    if Path::new(CONFIG_PATH).exists() {
        Settings::load(CONFIG_PATH)
    } else {
        Ok(Settings::default())
    }
}

fn queue_config(settings: &Settings, name: &str) -> ConsumerConfig {
    settings.get_queue_config(name).cloned().unwrap_or_default()
}

/// Partitioned stream over the shared in-memory storage
fn create_stream<F, Fut>(
    settings: &Settings,
    name: &'static str,
    storage: &Arc<InMemoryStorage<String>>,
    processor: F,
) -> Result<PartitionedConsumerManager<String>>
where
    F: Fn(Vec<String>, Arc<dyn QueueConsumer<String>>, QueueKey, Arc<ConsumerConfig>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let factory_storage = storage.clone();
    ConsumerManager::builder()
        .queue_key(QueueKey::new(name))
        .config(queue_config(settings, name))
        .settings(settings)
        .consumer_factory(move |config: &ConsumerConfig, partition: Option<&PartitionKey>| {
            let key = match partition {
                Some(partition) => QueueKey::new(name).consumer_key(partition),
                None => name.to_string(),
            };
            let max_poll_records = config
                .property("max_poll_records")
                .and_then(|value| value.as_u64())
                .unwrap_or(100) as usize;
            let consumer = InMemoryConsumer::new(factory_storage.clone(), key).with_max_poll_records(max_poll_records);
            Ok(Arc::new(consumer) as Arc<dyn QueueConsumer<String>>)
        })
        .msg_pack_processor(processor)
        .uncaught_error_handler(|key: &str, error: &anyhow::Error| {
            warn!("[{}] Consumer terminated: {:#}", key, error);
        })
        .queue_admin(Arc::new(InMemoryAdmin::new(storage.clone())))
        .build_partitioned()
}

fn seed_storage(storage: &InMemoryStorage<String>) {
    for partition in 0..PARTITIONS {
        let states = (0..3).map(|n| format!("state-{}-{}", partition, n)).chain([LOADED_MARKER.to_string()]);
        storage.append_all(&format!("{}.{}", STATE_QUEUE, partition), states.collect());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = load_settings()?;
    utils::init_logging(&settings.logging)?;

    info!("🚀 Starting {}", settings.service.name);

    let storage = Arc::new(InMemoryStorage::new());
    seed_storage(&storage);

    let state = create_stream(&settings, STATE_QUEUE, &storage, |msgs, consumer, queue_key, _config| async move {
        for msg in msgs {
            if msg == LOADED_MARKER {
                info!("[{}] State caught up", queue_key);
                consumer.stop();
            } else {
                info!("[{}] Restored {}", queue_key, msg);
            }
        }
        consumer.commit().await
    })?;
    let events = create_stream(&settings, EVENT_QUEUE, &storage, |msgs, consumer, queue_key, _config| async move {
        for msg in msgs {
            info!("[{}] 📨 Processing event: {}", queue_key, msg);
        }
        consumer.commit().await
    })?;

    let coordinator = StreamOrderingCoordinator::new(state, events).with_event_topic(EVENT_QUEUE);
    coordinator.update(partitions_of(STATE_QUEUE, 0..PARTITIONS));

    // Background producer feeding the event topics until shutdown
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    let producer_storage = storage.clone();
    let producer = tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(1));
        let mut sequence = 0u64;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let partition = (sequence % PARTITIONS as u64) as u32;
                    producer_storage.append(&format!("{}.{}", EVENT_QUEUE, partition), format!("event-{}", sequence));
                    sequence += 1;
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    });

    utils::setup_signal_handlers().await?;

    if shutdown_tx.send(()).is_err() {
        debug!("Event producer already finished");
    }
    if let Err(e) = producer.await {
        error!("❌ Event producer task failed: {}", e);
    }
    coordinator.stop();
    coordinator.await_stop().await;
    info!("✅ All consumers stopped");

    Ok(())
}
