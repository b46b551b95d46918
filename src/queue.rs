use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConsumerConfig;
use crate::partition::{PartitionKey, PartitionSet, QueueKey};

/// Resolves the offset a freshly subscribed consumer should start reading a topic from.
/// `None` keeps the technology's default starting point.
pub type StartOffsetProvider = Arc<dyn Fn(&str) -> Option<u64> + Send + Sync>;

/// Invoked with the partition once its consumer's run loop has exited.
/// The flag is `false` when the loop ended on an uncaught failure rather than a stop.
pub type OnStopCallback = Arc<dyn Fn(&PartitionKey, bool) + Send + Sync>;

/// Receives failures that escaped a consumer loop entirely, keyed by consumer key
pub type UncaughtErrorHandler = Arc<dyn Fn(&str, &anyhow::Error) + Send + Sync>;

/// Creates the underlying consumer; the partition is `None` for the shared consumer
pub type ConsumerFactory<M> =
    Arc<dyn Fn(&ConsumerConfig, Option<&PartitionKey>) -> Result<Arc<dyn QueueConsumer<M>>> + Send + Sync>;

/// Type alias for batch processing functions
pub type MsgPackProcessor<M> = Arc<
    dyn Fn(Vec<M>, Arc<dyn QueueConsumer<M>>, QueueKey, Arc<ConsumerConfig>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

/// Client handle of the queue technology
#[async_trait]
pub trait QueueConsumer<M: Send>: Send + Sync {
    /// Replace the consumer's subscription; takes effect on the next poll
    fn subscribe(&self, partitions: &PartitionSet);

    fn unsubscribe(&self);

    /// Fetch the next batch, waiting at most `timeout` for data
    async fn poll(&self, timeout: Duration) -> Result<Vec<M>>;

    /// Acknowledge everything returned by previous polls
    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    /// Ask the consumer to stop; must not block
    fn stop(&self);

    fn is_stopped(&self) -> bool;

    /// Resume from a custom position instead of the technology's default
    fn set_start_offset_provider(&self, _provider: StartOffsetProvider) {}
}

/// Administrative side of the queue technology
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueAdmin: Send + Sync {
    /// Delete a topic together with its data
    async fn delete_topic(&self, topic: &str) -> Result<()>;
}
