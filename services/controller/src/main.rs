//! fleetq Fleet Controller
//!
//! Standalone controller daemon: loads configuration from the environment,
//! connects the Slurm backend over a subprocess channel, and runs the
//! dead-worker sweep until interrupted. Scale requests arrive through the
//! library API; this binary keeps an already-scaled fleet converged.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleetq_controller::config::{create_logs_folder, Config};
use fleetq_controller::{
    CommandMembership, FleetReconciler, NoopHooks, ProfileRegistry, SlurmQueue, SubprocessChannel,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleetq fleet controller");

    // Load configuration
    let mut config = Config::from_env()?;
    if config.membership_command.is_empty() {
        anyhow::bail!(
            "FLEETQ_MEMBERSHIP_CMD is required: without a membership probe \
             every worker would look dead and be relaunched"
        );
    }
    if config.logs_dir.is_none() {
        let folder = create_logs_folder(Path::new("logs"), &config.cluster_name)
            .context("creating worker log folder")?;
        config.logs_dir = Some(folder);
    }
    info!(
        cluster_name = %config.cluster_name,
        scheduler_addr = %config.scheduler_addr,
        sweep_interval_secs = config.sweep_interval_secs,
        "Configuration loaded"
    );

    let config = Arc::new(config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let channel = Arc::new(SubprocessChannel::new());
    let queue = Arc::new(SlurmQueue::new(channel.clone()));
    let membership = Arc::new(CommandMembership::new(
        channel.clone(),
        config.membership_command.clone(),
    ));

    let reconciler = Arc::new(FleetReconciler::new(
        Arc::clone(&config),
        queue,
        channel,
        membership,
        Arc::new(NoopHooks),
        ProfileRegistry::default(),
    ));

    // Start the sweep loop
    let sweep_handle = tokio::spawn({
        let reconciler = Arc::clone(&reconciler);
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reconciler.run(shutdown_rx).await;
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = sweep_handle => {
            info!("Sweep loop exited");
        }
    }

    // Stop the sweep, then tear the fleet down
    let _ = shutdown_tx.send(true);
    reconciler.shutdown().await;

    info!("Fleet controller shutdown complete");
    Ok(())
}
