use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::time::Duration;

/// Consumer configuration installed on a manager.
///
/// Only `consumer_per_partition` changes how consumers are laid out; every other field
/// is picked up by running consumers on their next poll.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ConsumerConfig {
    /// One consumer per partition instead of one shared consumer
    #[serde(default)]
    pub consumer_per_partition: bool,
    /// Poll timeout, also used as the back-off after a failed poll or pack
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Technology specific settings, handed to the consumer factory untouched
    #[serde(flatten)]
    pub properties: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default = "ServiceConfig::default")]
    pub service: ServiceConfig,
    #[serde(default)]
    pub queues: HashMap<String, ConsumerConfig>,
    #[serde(default = "TaskConfig::default")]
    pub tasks: TaskConfig,
    #[serde(default = "ShutdownConfig::default")]
    pub shutdown: ShutdownConfig,
    #[serde(default = "LoggingConfig::default")]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TaskConfig {
    /// Delay before retrying task processing when another pass holds the lock
    pub retry_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ShutdownConfig {
    /// Upper bound for awaiting a single consumer's run loop
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub output: String,
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl ConsumerConfig {
    pub fn new(consumer_per_partition: bool, poll_interval_ms: u64) -> Self {
        Self {
            consumer_per_partition,
            poll_interval_ms,
            properties: BTreeMap::new(),
        }
    }

    /// Set a technology specific property (builder pattern)
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<serde_yaml::Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn property(&self, name: &str) -> Option<&serde_yaml::Value> {
        self.properties.get(name)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Whether moving from `self` to `other` requires draining and rebuilding consumers
    pub fn is_structural_change(&self, other: &ConsumerConfig) -> bool {
        self.consumer_per_partition != other.consumer_per_partition
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("poll_interval_ms must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self::new(false, default_poll_interval_ms())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "partition-consumers".to_string(),
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self { retry_delay_ms: 1000 }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: "stdout".to_string(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            queues: HashMap::new(),
            tasks: TaskConfig::default(),
            shutdown: ShutdownConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl TaskConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Settings {
    /// Load settings from a YAML file
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let settings = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        Ok(settings)
    }

    /// Parse and validate settings from YAML text
    pub fn parse(content: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tasks.retry_delay_ms == 0 {
            return Err(anyhow::anyhow!("tasks.retry_delay_ms must be greater than zero"));
        }
        for (name, queue) in &self.queues {
            queue
                .validate()
                .with_context(|| format!("Invalid consumer config for queue '{}'", name))?;
        }
        Ok(())
    }

    /// Get the consumer config of a named queue
    pub fn get_queue_config(&self, name: &str) -> Option<&ConsumerConfig> {
        self.queues.get(name)
    }

    /// Get all configured queue names, sorted
    pub fn get_all_queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.keys().cloned().collect();
        names.sort();
        names
    }
}
