use std::fmt;

use crate::config::ConsumerConfig;
use crate::partition::PartitionSet;
use crate::queue::{OnStopCallback, StartOffsetProvider};
use crate::utils::partitions_to_string;

/// Unit of work queued on a consumer manager.
///
/// `UpdateConfig` and `UpdatePartitions` coalesce while a queue drain is in progress;
/// the incremental variants are applied in submission order.
pub enum Task {
    /// Install a new consumer config
    UpdateConfig(ConsumerConfig),
    /// Replace the full assigned partition set
    UpdatePartitions(PartitionSet),
    /// Start dedicated consumers for the given partitions
    AddPartitions {
        partitions: PartitionSet,
        on_stop: Option<OnStopCallback>,
        start_offset_provider: Option<StartOffsetProvider>,
    },
    /// Stop and drop the consumers of the given partitions
    RemovePartitions(PartitionSet),
    /// Remove the given partitions, then delete their topics
    DeletePartitions(PartitionSet),
}

impl Task {
    /// Whether the task is deferred to the end of a drain, last one winning
    pub fn is_coalesced(&self) -> bool {
        matches!(self, Task::UpdateConfig(_) | Task::UpdatePartitions(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Task::UpdateConfig(_) => "UpdateConfig",
            Task::UpdatePartitions(_) => "UpdatePartitions",
            Task::AddPartitions { .. } => "AddPartitions",
            Task::RemovePartitions(_) => "RemovePartitions",
            Task::DeletePartitions(_) => "DeletePartitions",
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::UpdateConfig(config) => write!(f, "UpdateConfig({:?})", config),
            Task::UpdatePartitions(partitions)
            | Task::RemovePartitions(partitions)
            | Task::DeletePartitions(partitions) => {
                write!(f, "{}([{}])", self.name(), partitions_to_string(partitions))
            }
            Task::AddPartitions {
                partitions,
                on_stop,
                start_offset_provider,
            } => write!(
                f,
                "AddPartitions([{}], on_stop: {}, start_offset_provider: {})",
                partitions_to_string(partitions),
                on_stop.is_some(),
                start_offset_provider.is_some()
            ),
        }
    }
}
