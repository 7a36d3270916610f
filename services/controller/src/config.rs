//! Configuration for the fleet controller.

use std::path::{Path, PathBuf};

use anyhow::Result;

/// Fleet controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cluster name; worker names are derived from it.
    pub cluster_name: String,

    /// Address of the compute scheduler that launched workers dial back to.
    pub scheduler_addr: String,

    /// Batch queue partition to submit allocations to.
    pub partition: Option<String>,

    /// Accounting string attached to allocations.
    pub account: Option<String>,

    /// Walltime requested per allocation.
    pub walltime: Option<String>,

    /// Nodes requested per batch allocation.
    pub request_nodes: u32,

    /// Dead-worker sweep interval in seconds.
    pub sweep_interval_secs: u64,

    /// Command a worker process runs inside its container.
    pub worker_command: Vec<String>,

    /// Extra flags appended to every worker command line.
    pub worker_extra_args: Vec<String>,

    /// Whether launched workers run under a nanny process.
    pub nanny: bool,

    /// Seconds a worker waits for its scheduler before exiting.
    pub death_timeout_secs: Option<u64>,

    /// Worker-local directory for file spilling.
    pub local_directory: Option<String>,

    /// Probe command printing one connected worker name per line; feeds
    /// dead-worker detection. Required by the standalone binary.
    pub membership_command: Vec<String>,

    /// Directory for per-worker log files. None disables log redirection.
    pub logs_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let cluster_name =
            std::env::var("FLEETQ_CLUSTER_NAME").unwrap_or_else(|_| "fleetq".to_string());

        let scheduler_addr = std::env::var("FLEETQ_SCHEDULER_ADDR")
            .unwrap_or_else(|_| "tcp://127.0.0.1:8786".to_string());

        let partition = std::env::var("FLEETQ_PARTITION").ok();
        let account = std::env::var("FLEETQ_ACCOUNT").ok();
        let walltime = std::env::var("FLEETQ_WALLTIME").ok();

        let request_nodes = std::env::var("FLEETQ_REQUEST_NODES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        let sweep_interval_secs = std::env::var("FLEETQ_SWEEP_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        let worker_command = std::env::var("FLEETQ_WORKER_COMMAND")
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_else(|_| {
                vec![
                    "python3".to_string(),
                    "-m".to_string(),
                    "distributed.cli.dask_worker".to_string(),
                ]
            });

        let worker_extra_args = std::env::var("FLEETQ_WORKER_EXTRA_ARGS")
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let nanny = std::env::var("FLEETQ_NANNY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(true);

        let death_timeout_secs = std::env::var("FLEETQ_DEATH_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok());

        let local_directory = std::env::var("FLEETQ_LOCAL_DIRECTORY").ok();

        let membership_command = std::env::var("FLEETQ_MEMBERSHIP_CMD")
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let logs_dir = std::env::var("FLEETQ_LOGS_DIR").ok().map(PathBuf::from);

        let log_level = std::env::var("FLEETQ_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            cluster_name,
            scheduler_addr,
            partition,
            account,
            walltime,
            request_nodes,
            sweep_interval_secs,
            worker_command,
            worker_extra_args,
            nanny,
            death_timeout_secs,
            local_directory,
            membership_command,
            logs_dir,
            log_level,
        })
    }
}

/// Create a timestamped log folder for this cluster run.
///
/// Returns the created path, e.g. `logs/fleetq_20260806_121500_logs`.
pub fn create_logs_folder(base: &Path, cluster_name: &str) -> std::io::Result<PathBuf> {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let folder = base.join(format!("{cluster_name}_{stamp}_logs"));
    std::fs::create_dir_all(&folder)?;
    Ok(folder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logs_folder_naming() {
        let tmp = std::env::temp_dir().join("fleetq-config-test");
        let folder = create_logs_folder(&tmp, "demo").unwrap();
        let name = folder.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("demo_"));
        assert!(name.ends_with("_logs"));
        assert!(folder.is_dir());
        std::fs::remove_dir_all(&tmp).ok();
    }
}
