use anyhow::{anyhow, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, trace, warn};

use crate::config::{ConsumerConfig, Settings};
use crate::error::ConsumerError;
use crate::managed_consumer::ManagedConsumer;
use crate::partition::{PartitionKey, PartitionSet, QueueKey};
use crate::partitioned::PartitionedConsumerManager;
use crate::queue::{
    ConsumerFactory, MsgPackProcessor, OnStopCallback, QueueAdmin, QueueConsumer, StartOffsetProvider,
    UncaughtErrorHandler,
};
use crate::strategy::AssignmentStrategy;
use crate::task::Task;
use crate::utils::partitions_to_string;

const DEFAULT_TASK_RETRY_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_AWAIT_TIMEOUT_SECS: u64 = 30;

/// Runtimes the manager spreads its work over
#[derive(Debug, Clone)]
pub struct Executors {
    /// Runs one long-lived poll loop per launched consumer
    pub consumers: Handle,
    /// Runs short task-processing passes
    pub tasks: Handle,
    /// Runs delayed re-submissions after lock contention
    pub scheduler: Handle,
}

impl Executors {
    /// Use the ambient tokio runtime for everything
    pub fn current() -> Result<Self, ConsumerError> {
        Ok(Self::from_handle(Handle::try_current()?))
    }

    pub fn from_handle(handle: Handle) -> Self {
        Self {
            consumers: handle.clone(),
            tasks: handle.clone(),
            scheduler: handle,
        }
    }
}

/// State shared between a manager, its strategy and every consumer loop it launched
pub struct ConsumerContext<M: Send + 'static> {
    queue_key: QueueKey,
    config: RwLock<Option<Arc<ConsumerConfig>>>,
    factory: ConsumerFactory<M>,
    processor: MsgPackProcessor<M>,
    stopped: AtomicBool,
    executors: Executors,
    error_handler: Option<UncaughtErrorHandler>,
    await_timeout_secs: u64,
}

impl<M: Send + 'static> ConsumerContext<M> {
    pub fn queue_key(&self) -> &QueueKey {
        &self.queue_key
    }

    /// Config currently installed, read by consumer loops on every iteration
    pub fn config(&self) -> Option<Arc<ConsumerConfig>> {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_config(&self, config: Arc<ConsumerConfig>) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Some(config);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn await_timeout_secs(&self) -> u64 {
        self.await_timeout_secs
    }

    /// Create a managed consumer whose underlying consumer comes from the factory on first use
    pub(crate) fn create_consumer(
        &self,
        key: String,
        partition: Option<PartitionKey>,
        on_stop: Option<OnStopCallback>,
    ) -> Arc<ManagedConsumer<M>> {
        let factory = self.factory.clone();
        let config = self.config().unwrap_or_default();
        let target = partition.clone();
        Arc::new(
            ManagedConsumer::new(key, partition, move || factory(&*config, target.as_ref())).with_on_stop(on_stop),
        )
    }

    /// Start the consumer's run loop on the consumer runtime. Launching twice is a no-op.
    pub(crate) fn launch(self: &Arc<Self>, consumer: &Arc<ManagedConsumer<M>>) {
        if !consumer.mark_launched() {
            debug!("[{}] Consumer already launched", consumer.key());
            return;
        }
        info!("[{}] 🚀 Launching consumer", consumer.key());

        let shutdown_rx = consumer.shutdown_receiver();
        let loop_handle = {
            let ctx = self.clone();
            let consumer = consumer.clone();
            self.executors
                .consumers
                .spawn(async move { ctx.consumer_loop(&consumer, shutdown_rx).await })
        };

        let ctx = self.clone();
        let consumer = consumer.clone();
        self.executors.consumers.spawn(async move {
            let failure = match loop_handle.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(e) => Some(anyhow!("consumer loop terminated abnormally: {}", e)),
            };
            let clean = failure.is_none();
            if let Some(e) = failure {
                ctx.handle_uncaught(&consumer, e);
            }
            consumer.complete(clean);
        });
    }

    fn handle_uncaught(&self, consumer: &ManagedConsumer<M>, error: anyhow::Error) {
        error!("[{}] ❌ Failure in consumer loop: {:#}", consumer.key(), error);
        if let Some(handler) = &self.error_handler {
            handler(consumer.key(), &error);
        }
        if let Some(underlying) = consumer.created_consumer() {
            underlying.unsubscribe();
        }
    }

    async fn consumer_loop(
        &self,
        managed: &ManagedConsumer<M>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let consumer = managed.get_consumer().await?;
        while !self.is_stopped() && !managed.is_stop_requested() && !consumer.is_stopped() {
            let config = self
                .config()
                .ok_or_else(|| ConsumerError::NotInitialized(self.queue_key.clone()))?;

            if let Err(e) = self.poll_and_process(&consumer, &config).await {
                if self.is_stopped() || managed.is_stop_requested() || consumer.is_stopped() {
                    continue;
                }
                warn!("[{}] ⚠️ Failed to process messages from queue: {:#}", managed.key(), e);
                tokio::select! {
                    _ = sleep(config.poll_interval()) => {}
                    _ = shutdown_rx.recv() => {}
                }
            }
        }
        consumer.unsubscribe();
        info!("[{}] Consumer stopped", managed.key());
        Ok(())
    }

    async fn poll_and_process(
        &self,
        consumer: &Arc<dyn QueueConsumer<M>>,
        config: &Arc<ConsumerConfig>,
    ) -> Result<()> {
        let msgs = consumer.poll(config.poll_interval()).await?;
        if msgs.is_empty() {
            return Ok(());
        }
        trace!("[{}] Processing pack of {} messages", self.queue_key, msgs.len());
        (self.processor)(msgs, consumer.clone(), self.queue_key.clone(), config.clone()).await
    }
}

/// Keeps a set of consumers aligned with the assigned partitions and config.
///
/// Every change is queued as a [`Task`] and applied by a single processing pass at a
/// time; callers never block.
pub struct ConsumerManager<M: Send + 'static> {
    inner: Arc<ManagerInner<M>>,
}

impl<M: Send + 'static> Clone for ConsumerManager<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct ManagerInner<M: Send + 'static> {
    ctx: Arc<ConsumerContext<M>>,
    tasks_tx: mpsc::UnboundedSender<Task>,
    /// Holding this lock is the right to drain the task queue
    tasks_rx: Mutex<mpsc::UnboundedReceiver<Task>>,
    strategy: RwLock<Option<Arc<AssignmentStrategy<M>>>>,
    partitions: RwLock<Option<PartitionSet>>,
    admin: Option<Arc<dyn QueueAdmin>>,
    retry_delay: Duration,
}

impl<M: Send + 'static> ConsumerManager<M> {
    pub fn builder() -> ConsumerManagerBuilder<M> {
        ConsumerManagerBuilder::default()
    }

    /// Queue a config replacement
    pub fn update_config(&self, config: ConsumerConfig) {
        self.add_task(Task::UpdateConfig(config));
    }

    /// Queue a full partition set replacement
    pub fn update_partitions(&self, partitions: PartitionSet) {
        self.add_task(Task::UpdatePartitions(partitions));
    }

    pub(crate) fn add_task(&self, task: Task) {
        self.inner.add_task(task);
    }

    /// Mark the manager stopped and signal every consumer; does not wait
    pub fn stop(&self) {
        let queue_key = self.queue_key();
        if self.inner.ctx.stopped.swap(true, Ordering::SeqCst) {
            debug!("[{}] Already stopped", queue_key);
        }
        info!("[{}] 🛑 Stopping consumers", queue_key);
        for consumer in self.consumers() {
            consumer.initiate_stop();
        }
    }

    /// Wait for every consumer loop, bounded by the configured per-consumer timeout
    pub async fn await_stop(&self) {
        self.await_stop_timeout(self.inner.ctx.await_timeout_secs).await;
    }

    pub async fn await_stop_timeout(&self, timeout_secs: u64) {
        let consumers = self.consumers();
        debug!("[{}] Awaiting {} consumers", self.queue_key(), consumers.len());
        for consumer in consumers {
            consumer.await_completion(timeout_secs).await;
        }
        info!("[{}] ✅ Consumers stopped", self.queue_key());
    }

    pub fn queue_key(&self) -> &QueueKey {
        self.inner.ctx.queue_key()
    }

    pub fn config(&self) -> Option<Arc<ConsumerConfig>> {
        self.inner.ctx.config()
    }

    /// Last full partition set applied
    pub fn partitions(&self) -> Option<PartitionSet> {
        self.inner.partitions()
    }

    /// Partitions owning a dedicated consumer
    pub fn active_partitions(&self) -> PartitionSet {
        self.inner
            .current_strategy()
            .map(|strategy| strategy.active_partitions())
            .unwrap_or_default()
    }

    pub fn consumers(&self) -> Vec<Arc<ManagedConsumer<M>>> {
        self.inner
            .current_strategy()
            .map(|strategy| strategy.consumers())
            .unwrap_or_default()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.ctx.is_stopped()
    }
}

impl<M: Send + 'static> ManagerInner<M> {
    fn add_task(self: &Arc<Self>, task: Task) {
        let queue_key = self.ctx.queue_key();
        if self.ctx.is_stopped() {
            debug!("[{}] Manager is stopped, ignoring task: {:?}", queue_key, task);
            return;
        }
        info!("[{}] Adding task: {:?}", queue_key, task);
        if self.tasks_tx.send(task).is_err() {
            error!("[{}] Task queue is closed", queue_key);
            return;
        }
        self.try_process_tasks();
    }

    fn try_process_tasks(self: &Arc<Self>) {
        let inner = self.clone();
        self.ctx.executors.tasks.spawn(async move {
            inner.process_tasks().await;
        });
    }

    fn schedule_retry(self: &Arc<Self>) {
        let inner = self.clone();
        let delay = self.retry_delay;
        self.ctx.executors.scheduler.spawn(async move {
            sleep(delay).await;
            inner.try_process_tasks();
        });
    }

    async fn process_tasks(self: Arc<Self>) {
        let queue_key = self.ctx.queue_key();
        let mut tasks = match self.tasks_rx.try_lock() {
            Ok(tasks) => tasks,
            Err(_) => {
                debug!("[{}] Failed to acquire lock, retrying in {:?}", queue_key, self.retry_delay);
                self.schedule_retry();
                return;
            }
        };

        let mut pending_config = None;
        let mut pending_partitions = None;
        while let Ok(task) = tasks.try_recv() {
            let name = task.name();
            let result = match task {
                Task::UpdateConfig(config) => {
                    if pending_config.is_some() {
                        trace!("[{}] Coalescing config update", queue_key);
                    }
                    pending_config = Some(config);
                    continue;
                }
                Task::UpdatePartitions(partitions) => {
                    if pending_partitions.is_some() {
                        trace!("[{}] Coalescing partitions update", queue_key);
                    }
                    pending_partitions = Some(partitions);
                    continue;
                }
                Task::AddPartitions {
                    partitions,
                    on_stop,
                    start_offset_provider,
                } => self.add_partitions(partitions, on_stop, start_offset_provider).await,
                Task::RemovePartitions(partitions) => self.remove_partitions(partitions).await,
                Task::DeletePartitions(partitions) => self.delete_partitions(partitions).await,
            };
            if let Err(e) = result {
                error!("[{}] Failed to process {} task: {}", queue_key, name, e);
            }
        }

        if let Some(config) = pending_config {
            if self.ctx.config().as_deref() == Some(&config) {
                debug!("[{}] Config unchanged, skipping update", queue_key);
            } else {
                // The pending partition set below supersedes the stored one
                self.apply_config(config, pending_partitions.is_none()).await;
            }
        }
        if let Some(partitions) = pending_partitions {
            if let Err(e) = self.apply_partitions(partitions).await {
                error!("[{}] Failed to apply partitions: {}", queue_key, e);
            }
        }
    }

    async fn add_partitions(
        &self,
        partitions: PartitionSet,
        on_stop: Option<OnStopCallback>,
        start_offset_provider: Option<StartOffsetProvider>,
    ) -> Result<(), ConsumerError> {
        info!("[{}] Added partitions: {}", self.ctx.queue_key(), partitions_to_string(&partitions));
        self.strategy()?
            .add_partitions(&partitions, on_stop, start_offset_provider)
            .await
    }

    async fn remove_partitions(&self, partitions: PartitionSet) -> Result<(), ConsumerError> {
        info!("[{}] Removed partitions: {}", self.ctx.queue_key(), partitions_to_string(&partitions));
        self.strategy()?.remove_partitions(&partitions).await
    }

    async fn delete_partitions(&self, partitions: PartitionSet) -> Result<(), ConsumerError> {
        info!(
            "[{}] Removing partitions and deleting topics: {}",
            self.ctx.queue_key(),
            partitions_to_string(&partitions)
        );
        self.strategy()?.remove_partitions(&partitions).await?;
        self.delete_topics(&partitions).await
    }

    async fn delete_topics(&self, partitions: &PartitionSet) -> Result<(), ConsumerError> {
        let queue_key = self.ctx.queue_key();
        let admin = self
            .admin
            .as_ref()
            .ok_or_else(|| ConsumerError::AdminMissing(queue_key.clone()))?;
        for partition in partitions {
            let topic = partition.full_topic_name();
            match admin.delete_topic(&topic).await {
                Ok(()) => info!("[{}] 🗑️ Deleted topic {}", queue_key, topic),
                Err(e) => error!("[{}] Failed to delete topic {}: {:#}", queue_key, topic, e),
            }
        }
        Ok(())
    }

    /// Apply a changed config. `reapply` re-subscribes the stored partition set once a
    /// new strategy is installed.
    async fn apply_config(&self, config: ConsumerConfig, reapply: bool) {
        let queue_key = self.ctx.queue_key();
        let new_config = Arc::new(config);
        match self.ctx.config() {
            None => {
                self.init_config(new_config);
                if reapply {
                    self.reapply_partitions().await;
                }
            }
            Some(old_config) if old_config.is_structural_change(&new_config) => {
                info!(
                    "[{}] consumer_per_partition changed {} -> {}, recreating consumers",
                    queue_key, old_config.consumer_per_partition, new_config.consumer_per_partition
                );
                let previous = self.strategy.write().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(previous) = previous {
                    previous.stop_and_await().await;
                }
                self.init_config(new_config);
                if reapply {
                    self.reapply_partitions().await;
                }
            }
            Some(_) => {
                self.ctx.set_config(new_config);
                trace!("[{}] Silently applied new config, consumer layout unchanged", queue_key);
            }
        }
    }

    /// Install a config together with the strategy it selects
    fn init_config(&self, config: Arc<ConsumerConfig>) {
        info!("[{}] Initializing with config: {:?}", self.ctx.queue_key(), config);
        let strategy = AssignmentStrategy::new(self.ctx.clone(), config.consumer_per_partition);
        self.ctx.set_config(config);
        *self.strategy.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(strategy));
    }

    async fn reapply_partitions(&self) {
        if let Some(partitions) = self.partitions() {
            if let Err(e) = self.apply_partitions(partitions).await {
                error!("[{}] Failed to re-apply partitions: {}", self.ctx.queue_key(), e);
            }
        }
    }

    async fn apply_partitions(&self, partitions: PartitionSet) -> Result<(), ConsumerError> {
        info!(
            "[{}] Subscribing to partitions: {}",
            self.ctx.queue_key(),
            partitions_to_string(&partitions)
        );
        *self.partitions.write().unwrap_or_else(PoisonError::into_inner) = Some(partitions.clone());
        self.strategy()?.update_partitions(&partitions).await;
        Ok(())
    }

    fn partitions(&self) -> Option<PartitionSet> {
        self.partitions.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn current_strategy(&self) -> Option<Arc<AssignmentStrategy<M>>> {
        self.strategy.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn strategy(&self) -> Result<Arc<AssignmentStrategy<M>>, ConsumerError> {
        self.current_strategy()
            .ok_or_else(|| ConsumerError::NotInitialized(self.ctx.queue_key().clone()))
    }
}

/// Builder for [`ConsumerManager`] and [`PartitionedConsumerManager`]
pub struct ConsumerManagerBuilder<M: Send + 'static> {
    queue_key: Option<QueueKey>,
    config: Option<ConsumerConfig>,
    factory: Option<ConsumerFactory<M>>,
    processor: Option<MsgPackProcessor<M>>,
    executors: Option<Executors>,
    error_handler: Option<UncaughtErrorHandler>,
    admin: Option<Arc<dyn QueueAdmin>>,
    retry_delay: Duration,
    await_timeout_secs: u64,
}

impl<M: Send + 'static> Default for ConsumerManagerBuilder<M> {
    fn default() -> Self {
        Self {
            queue_key: None,
            config: None,
            factory: None,
            processor: None,
            executors: None,
            error_handler: None,
            admin: None,
            retry_delay: DEFAULT_TASK_RETRY_DELAY,
            await_timeout_secs: DEFAULT_AWAIT_TIMEOUT_SECS,
        }
    }
}

impl<M: Send + 'static> ConsumerManagerBuilder<M> {
    pub fn queue_key(mut self, queue_key: QueueKey) -> Self {
        self.queue_key = Some(queue_key);
        self
    }

    /// Initial config, installed synchronously by `build`
    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn consumer_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&ConsumerConfig, Option<&PartitionKey>) -> Result<Arc<dyn QueueConsumer<M>>> + Send + Sync + 'static,
    {
        let factory: ConsumerFactory<M> = Arc::new(factory);
        self.factory = Some(factory);
        self
    }

    /// Set the batch processor invoked with every non-empty poll result
    pub fn msg_pack_processor<F, Fut>(mut self, processor: F) -> Self
    where
        F: Fn(Vec<M>, Arc<dyn QueueConsumer<M>>, QueueKey, Arc<ConsumerConfig>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let boxed: MsgPackProcessor<M> = Arc::new(
            move |msgs: Vec<M>,
                  consumer: Arc<dyn QueueConsumer<M>>,
                  queue_key: QueueKey,
                  config: Arc<ConsumerConfig>|
                  -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
                Box::pin(processor(msgs, consumer, queue_key, config))
            },
        );
        self.processor = Some(boxed);
        self
    }

    pub fn executors(mut self, executors: Executors) -> Self {
        self.executors = Some(executors);
        self
    }

    pub fn uncaught_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &anyhow::Error) + Send + Sync + 'static,
    {
        let handler: UncaughtErrorHandler = Arc::new(handler);
        self.error_handler = Some(handler);
        self
    }

    pub fn queue_admin(mut self, admin: Arc<dyn QueueAdmin>) -> Self {
        self.admin = Some(admin);
        self
    }

    /// Apply the task and shutdown sections of the settings file
    pub fn settings(mut self, settings: &Settings) -> Self {
        self.retry_delay = settings.tasks.retry_delay();
        self.await_timeout_secs = settings.shutdown.timeout_secs;
        self
    }

    pub fn task_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn await_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.await_timeout_secs = timeout_secs;
        self
    }

    pub fn build(self) -> Result<ConsumerManager<M>> {
        let queue_key = self
            .queue_key
            .ok_or_else(|| anyhow!("No queue key provided. Use .queue_key(key) before calling .build()"))?;
        let factory = self
            .factory
            .ok_or_else(|| anyhow!("[{}] No consumer factory provided", queue_key))?;
        let processor = self
            .processor
            .ok_or_else(|| anyhow!("[{}] No msg pack processor provided", queue_key))?;
        if let Some(config) = &self.config {
            config.validate()?;
        }
        let executors = match self.executors {
            Some(executors) => executors,
            None => Executors::current()?,
        };

        let ctx = Arc::new(ConsumerContext {
            queue_key,
            config: RwLock::new(None),
            factory,
            processor,
            stopped: AtomicBool::new(false),
            executors,
            error_handler: self.error_handler,
            await_timeout_secs: self.await_timeout_secs,
        });
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            ctx,
            tasks_tx,
            tasks_rx: Mutex::new(tasks_rx),
            strategy: RwLock::new(None),
            partitions: RwLock::new(None),
            admin: self.admin,
            retry_delay: self.retry_delay,
        });
        if let Some(config) = self.config {
            inner.init_config(Arc::new(config));
        }

        Ok(ConsumerManager { inner })
    }

    /// Build a manager fixed to one consumer per partition. A queue admin is required.
    pub fn build_partitioned(mut self) -> Result<PartitionedConsumerManager<M>> {
        let queue_key = self
            .queue_key
            .clone()
            .ok_or_else(|| anyhow!("No queue key provided. Use .queue_key(key) before calling .build_partitioned()"))?;
        if self.admin.is_none() {
            return Err(ConsumerError::AdminMissing(queue_key).into());
        }
        let mut config = self.config.take().unwrap_or_default();
        config.consumer_per_partition = true;
        self.config = Some(config);
        Ok(PartitionedConsumerManager::from_manager(self.build()?))
    }
}
