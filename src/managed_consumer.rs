use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, OnceCell};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::error::ConsumerError;
use crate::partition::{PartitionKey, PartitionSet};
use crate::queue::{OnStopCallback, QueueConsumer, StartOffsetProvider};

type ConsumerSupplier<M> = Box<dyn Fn() -> Result<Arc<dyn QueueConsumer<M>>> + Send + Sync>;

/// Owns the lifecycle of exactly one underlying consumer.
///
/// The consumer itself is created on first use. A managed consumer is launched at
/// most once and is never reused for another partition.
pub struct ManagedConsumer<M: Send + 'static> {
    id: Uuid,
    key: String,
    partition: Option<PartitionKey>,
    supplier: ConsumerSupplier<M>,
    consumer: OnceCell<Arc<dyn QueueConsumer<M>>>,
    on_stop: Option<OnStopCallback>,
    stop_requested: AtomicBool,
    launched: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    finished_tx: watch::Sender<bool>,
}

impl<M: Send + 'static> ManagedConsumer<M> {
    pub fn new<F>(key: impl Into<String>, partition: Option<PartitionKey>, supplier: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn QueueConsumer<M>>> + Send + Sync + 'static,
    {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (finished_tx, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            key: key.into(),
            partition,
            supplier: Box::new(supplier),
            consumer: OnceCell::new(),
            on_stop: None,
            stop_requested: AtomicBool::new(false),
            launched: AtomicBool::new(false),
            shutdown_tx,
            finished_tx,
        }
    }

    /// Attach a callback fired once the run loop has exited (builder pattern)
    pub fn with_on_stop(mut self, on_stop: Option<OnStopCallback>) -> Self {
        self.on_stop = on_stop;
        self
    }

    /// Unique id of this instance
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Partition this consumer is dedicated to, `None` for a shared consumer
    pub fn partition(&self) -> Option<&PartitionKey> {
        self.partition.as_ref()
    }

    /// Get the underlying consumer, creating it on the first call
    pub async fn get_consumer(&self) -> Result<Arc<dyn QueueConsumer<M>>, ConsumerError> {
        let consumer = self
            .consumer
            .get_or_try_init(|| async {
                debug!("[{}] Creating consumer", self.key);
                (self.supplier)().map_err(|e| {
                    error!("[{}] Consumer factory failed: {:#}", self.key, e);
                    ConsumerError::Creation {
                        key: self.key.clone(),
                        reason: format!("{:#}", e),
                    }
                })
            })
            .await?;
        Ok(consumer.clone())
    }

    /// Underlying consumer if it has been created already
    pub(crate) fn created_consumer(&self) -> Option<Arc<dyn QueueConsumer<M>>> {
        self.consumer.get().cloned()
    }

    pub async fn subscribe(&self, partitions: &PartitionSet) -> Result<(), ConsumerError> {
        trace!("[{}] Subscribing to partitions: {:?}", self.key, partitions);
        self.get_consumer().await?.subscribe(partitions);
        Ok(())
    }

    pub async fn set_start_offset_provider(&self, provider: StartOffsetProvider) -> Result<(), ConsumerError> {
        self.get_consumer().await?.set_start_offset_provider(provider);
        Ok(())
    }

    /// Signal the consumer to stop. Non-blocking and idempotent.
    pub fn initiate_stop(&self) {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            trace!("[{}] Stop already initiated", self.key);
            return;
        }
        debug!("[{}] Initiating stop", self.key);
        if let Some(consumer) = self.consumer.get() {
            consumer.stop();
        }
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Wait for the run loop to exit. A `timeout_secs` of zero waits forever.
    ///
    /// Returns `false` when the timeout elapsed first; the loop is left running.
    pub async fn await_completion(&self, timeout_secs: u64) -> bool {
        if !self.is_running() {
            return true;
        }
        trace!("[{}] Awaiting finish", self.key);
        let mut finished_rx = self.finished_tx.subscribe();
        let finished = if timeout_secs == 0 {
            finished_rx.wait_for(|finished| *finished).await.is_ok()
        } else {
            let limit = Duration::from_secs(timeout_secs);
            timeout(limit, finished_rx.wait_for(|finished| *finished)).await.is_ok()
        };
        if finished {
            trace!("[{}] Awaited finish", self.key);
        } else {
            warn!("[{}] Consumer did not stop within {} seconds", self.key, timeout_secs);
        }
        finished
    }

    /// True while a run loop has been launched and not yet observed to finish
    pub fn is_running(&self) -> bool {
        self.launched.load(Ordering::SeqCst) && !*self.finished_tx.borrow()
    }

    /// Claim the single launch of this consumer; false if it was launched before
    pub(crate) fn mark_launched(&self) -> bool {
        !self.launched.swap(true, Ordering::SeqCst)
    }

    /// Receiver woken by `initiate_stop`, for interruptible waits inside the run loop
    pub(crate) fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Record that the run loop exited: fire `on_stop`, then release waiters.
    /// `clean` is false when the loop ended on an uncaught failure.
    pub(crate) fn complete(&self, clean: bool) {
        if let (Some(on_stop), Some(partition)) = (&self.on_stop, &self.partition) {
            on_stop(partition, clean);
        }
        self.finished_tx.send_replace(true);
        debug!("[{}] Consumer finished", self.key);
    }
}
