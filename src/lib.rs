pub mod config;
pub mod coordinator;
pub mod error;
pub mod managed_consumer;
pub mod manager;
pub mod memory;
pub mod partition;
pub mod partitioned;
pub mod queue;
pub mod strategy;
pub mod task;
pub mod utils;

pub use config::{ConsumerConfig, Settings};
pub use coordinator::StreamOrderingCoordinator;
pub use error::ConsumerError;
pub use managed_consumer::ManagedConsumer;
pub use manager::{ConsumerManager, ConsumerManagerBuilder, Executors};
pub use partition::{PartitionKey, PartitionSet, QueueKey};
pub use partitioned::PartitionedConsumerManager;
pub use queue::{QueueAdmin, QueueConsumer};

#[cfg(test)]
#[ctor::ctor]
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
