use anyhow::{anyhow, Result};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::partition::PartitionSet;

/// Install the global tracing subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(false);

    let installed = match config.output.as_str() {
        "stderr" => builder.with_writer(std::io::stderr).try_init(),
        _ => builder.try_init(),
    };
    installed.map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}

/// Wait for SIGTERM / SIGINT (Ctrl+C on windows)
pub async fn setup_signal_handlers() -> Result<()> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("📡 Received SIGTERM - initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                info!("📡 Received SIGINT (Ctrl+C) - initiating graceful shutdown");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await?;
        info!("📡 Received Ctrl+C - initiating graceful shutdown");
    }

    Ok(())
}

/// Render a partition set for logs: `t[0], t[1]`
pub fn partitions_to_string(partitions: &PartitionSet) -> String {
    partitions
        .iter()
        .map(|partition| partition.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
