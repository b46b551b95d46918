use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Ordered set of partitions, the unit every assignment change is expressed in
pub type PartitionSet = BTreeSet<PartitionKey>;

/// Identifies a topic partition.
///
/// A key without a partition number stands for the whole topic (non-partitioned mode).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    topic: String,
    partition: Option<u32>,
}

impl PartitionKey {
    /// Create a key for one partition of a topic
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition: Some(partition),
        }
    }

    /// Create a key covering the whole (non-partitioned) topic
    pub fn whole_topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> Option<u32> {
        self.partition
    }

    /// Name of the physical topic backing this partition, e.g. `tb_state.3`
    pub fn full_topic_name(&self) -> String {
        match self.partition {
            Some(partition) => format!("{}.{}", self.topic, partition),
            None => self.topic.clone(),
        }
    }

    /// Same partition number on another topic
    pub fn with_topic(&self, topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partition: self.partition,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.partition {
            Some(partition) => write!(f, "{}[{}]", self.topic, partition),
            None => write!(f, "{}", self.topic),
        }
    }
}

/// Name of the logical queue a manager serves; used as the log prefix and as the
/// base of every consumer key the manager hands out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueKey(String);

impl QueueKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumer key for a dedicated per-partition consumer: `queue-partitionNumber`
    pub fn consumer_key(&self, partition: &PartitionKey) -> String {
        match partition.partition() {
            Some(number) => format!("{}-{}", self.0, number),
            None => format!("{}-{}", self.0, partition.topic()),
        }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueueKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Build a set of partitions `topic[n]` for every `n` given
pub fn partitions_of(topic: &str, numbers: impl IntoIterator<Item = u32>) -> PartitionSet {
    numbers
        .into_iter()
        .map(|number| PartitionKey::new(topic, number))
        .collect()
}
