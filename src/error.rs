use thiserror::Error;

use crate::partition::QueueKey;

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("[{key}] Failed to create consumer: {reason}")]
    Creation { key: String, reason: String },
    #[error("[{0}] No consumer config applied yet")]
    NotInitialized(QueueKey),
    #[error("[{queue}] {operation} is not supported with a single shared consumer")]
    Unsupported {
        queue: QueueKey,
        operation: &'static str,
    },
    #[error("[{0}] No queue admin provided. Use .queue_admin(admin) to manage topics")]
    AdminMissing(QueueKey),
    #[error("No tokio runtime available: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),
}
