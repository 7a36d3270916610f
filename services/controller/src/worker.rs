//! Worker unit: one elastic worker's lifecycle.
//!
//! A worker acquires capacity, launches its remote process, runs, and
//! releases its claim on close. The acquire span (searching the ledger,
//! submitting a batch allocation, binding a node, recording the claim)
//! happens entirely under the cluster lock, so two concurrently starting
//! workers can neither double-submit for the same gap nor double-claim a
//! freshly granted node. The lock is dropped before the remote launch
//! command runs; its latency only overlaps other workers, it never blocks
//! the ledger.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelError, RemoteChannel};
use crate::config::Config;
use crate::hooks::LifecycleHooks;
use crate::profile::{ContainerProfile, ContainerRuntime};
use crate::queue::{AllocationRequest, BatchQueue, QueueError};
use crate::state::{LaunchedWorker, SharedState};

/// Delay before an unexpectedly closed worker requests a reconciliation
/// pass to replace it.
pub const RELAUNCH_DELAY: Duration = Duration::from_secs(5);

/// Cap on ledger-validate and assignment-conflict retries. Each iteration
/// purges one stale job id, so the ledger bounds the loop structurally;
/// the cap guards against a queue that keeps presenting new garbage.
const MAX_SEARCH_ATTEMPTS: u32 = 32;

/// Errors from the worker lifecycle.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Two live batch jobs claim the same physical node. Fatal
    /// configuration error, never retried.
    #[error("node {node} is held by live job {held} while job {job_id} was granted it")]
    NodeOwnershipConflict {
        node: String,
        held: String,
        job_id: String,
    },

    /// A fresh allocation was granted but none of its nodes fits this
    /// worker's requirements.
    #[error("allocation {job_id} has no node with {cpus} free cpus and {memory_gib} GiB")]
    GrantTooSmall {
        job_id: String,
        cpus: u32,
        memory_gib: u64,
    },

    /// The search/validate loop hit its retry cap.
    #[error("gave up after {0} attempts against an inconsistent queue")]
    RetriesExhausted(u32),

    /// A supervisor lifecycle hook failed.
    #[error("lifecycle hook failed: {0}")]
    Hook(#[source] anyhow::Error),
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Looking for spare capacity in the ledger.
    Searching,
    /// No capacity anywhere; a new batch allocation has been requested.
    JobRequested,
    /// Bound to a (node, job) pair, claim not yet recorded.
    NodeBound,
    /// Claim recorded, remote launch in flight.
    Launching,
    /// Launched; liveness is observed externally.
    Running,
    /// Releasing the claim.
    Closing,
    /// Done.
    Closed,
    /// Start failed.
    Failed,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Searching => "searching",
            Self::JobRequested => "job_requested",
            Self::NodeBound => "node_bound",
            Self::Launching => "launching",
            Self::Running => "running",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

/// Everything a worker borrows from its owning reconciler.
#[derive(Clone)]
pub struct WorkerContext {
    pub shared: SharedState,
    pub queue: Arc<dyn BatchQueue>,
    pub channel: Arc<dyn RemoteChannel>,
    pub hooks: Arc<dyn LifecycleHooks>,
    pub relaunch_tx: mpsc::UnboundedSender<()>,
    pub config: Arc<Config>,
}

/// One elastic worker.
pub struct WorkerUnit {
    name: String,
    tag: String,
    cpus: u32,
    memory_gib: u64,
    state: WorkerState,
    node: Option<String>,
    job_id: Option<String>,
    launch_command: Vec<String>,
    log_file: Option<PathBuf>,
    ctx: WorkerContext,
}

impl WorkerUnit {
    pub fn new(
        name: &str,
        profile: &ContainerProfile,
        runtime: ContainerRuntime,
        ctx: WorkerContext,
    ) -> Self {
        let config = &ctx.config;

        let mut launch_command = profile.launch_prefix(runtime);
        launch_command.extend(config.worker_command.iter().cloned());
        launch_command.push(config.scheduler_addr.clone());
        launch_command.push("--name".to_string());
        launch_command.push(name.to_string());
        launch_command.push("--nthreads".to_string());
        launch_command.push(profile.cpus.to_string());
        launch_command.push("--memory-limit".to_string());
        launch_command.push(format!("{}GB", profile.memory_gib));
        let nanny_flag = if config.nanny { "--nanny" } else { "--no-nanny" };
        launch_command.push(nanny_flag.to_string());
        if let Some(timeout) = config.death_timeout_secs {
            launch_command.push("--death-timeout".to_string());
            launch_command.push(timeout.to_string());
        }
        if let Some(dir) = &config.local_directory {
            launch_command.push("--local-directory".to_string());
            launch_command.push(dir.clone());
        }
        launch_command.push("--resources".to_string());
        launch_command.push(format!("'{}'=1", profile.tag));
        launch_command.extend(config.worker_extra_args.iter().cloned());

        let log_file = config
            .logs_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}-{}.log", name, profile.tag)));

        Self {
            name: name.to_string(),
            tag: profile.tag.clone(),
            cpus: profile.cpus,
            memory_gib: profile.memory_gib,
            state: WorkerState::Searching,
            node: None,
            job_id: None,
            launch_command,
            log_file,
            ctx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// The node this worker is bound to, once bound.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    /// Acquire capacity and launch the remote process.
    pub async fn start(&mut self) -> Result<(), WorkerError> {
        debug!(worker = %self.name, tag = %self.tag, "Starting worker");
        match self.acquire_and_launch().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state = WorkerState::Failed;
                Err(e)
            }
        }
    }

    async fn acquire_and_launch(&mut self) -> Result<(), WorkerError> {
        self.state = WorkerState::Searching;

        let mut guard = self.ctx.shared.lock().await;

        // Search the ledger, lazily re-validating recorded job ids.
        let mut attempts = 0u32;
        while self.job_id.is_none() {
            let Some(node) = guard.ledger.get_available_node(self.cpus, self.memory_gib) else {
                break;
            };
            let Some(recorded) = guard.ledger.get_node_jobid(&node) else {
                break;
            };
            if self.ctx.queue.is_listed(&recorded).await? {
                self.node = Some(node);
                self.job_id = Some(recorded);
            } else {
                debug!(job_id = %recorded, "Recorded job no longer listed, purging its nodes");
                guard.ledger.remove_jobid_nodes(&recorded);
                attempts += 1;
                if attempts >= MAX_SEARCH_ATTEMPTS {
                    return Err(WorkerError::RetriesExhausted(attempts));
                }
            }
        }

        // Nothing spare anywhere: request a new allocation.
        if self.job_id.is_none() {
            self.state = WorkerState::JobRequested;
            let job_name = format!("{}-job", self.name);
            let request = AllocationRequest {
                name: job_name.clone(),
                nodes: self.ctx.config.request_nodes,
                partition: self.ctx.config.partition.clone(),
                account: self.ctx.config.account.clone(),
                walltime: self.ctx.config.walltime.clone(),
                exclusive: true,
                ..Default::default()
            };
            self.ctx.queue.submit_allocation(&request).await?;

            let job_id = self.ctx.queue.job_id_for_name(&job_name).await?;
            // Recorded now so a failed start can still cancel the grant.
            self.job_id = Some(job_id.clone());
            let nodelist = self.ctx.queue.nodelist_for_name(&job_name).await?;
            let nodes =
                fleetq_hostlist::expand(&nodelist).map_err(|e| QueueError::MalformedOutput {
                    what: "nodelist",
                    output: e.to_string(),
                })?;
            let cpu_counts = self.ctx.queue.node_cpu_counts(&job_id).await?;
            let memories = self.ctx.queue.node_free_memory_gib(&job_id).await?;

            for (index, node) in nodes.iter().enumerate() {
                let total_cpus = node_value(&cpu_counts, index, "cpu count")?;
                let total_memory = node_value(&memories, index, "free memory")?;

                let mut conflicts = 0u32;
                while !guard
                    .ledger
                    .assign_resources(node, total_cpus, total_memory, &job_id)
                {
                    // Another job holds this node name. If the queue no
                    // longer lists it, the binding is stale; otherwise two
                    // live jobs claim one node and that is fatal.
                    let Some(held) = guard.ledger.get_node_jobid(node) else {
                        break;
                    };
                    if self.ctx.queue.is_listed(&held).await? {
                        return Err(WorkerError::NodeOwnershipConflict {
                            node: node.clone(),
                            held,
                            job_id,
                        });
                    }
                    warn!(node = %node, job_id = %held, "Purging stale node owner");
                    guard.ledger.remove_jobid_nodes(&held);
                    conflicts += 1;
                    if conflicts >= MAX_SEARCH_ATTEMPTS {
                        return Err(WorkerError::RetriesExhausted(conflicts));
                    }
                }
            }

            self.node = guard.ledger.get_available_node(self.cpus, self.memory_gib);
            if self.node.is_none() {
                return Err(WorkerError::GrantTooSmall {
                    job_id,
                    cpus: self.cpus,
                    memory_gib: self.memory_gib,
                });
            }
        }

        self.state = WorkerState::NodeBound;
        let (node, job_id) = match (&self.node, &self.job_id) {
            (Some(node), Some(job_id)) => (node.clone(), job_id.clone()),
            _ => unreachable!("worker reached node_bound without a binding"),
        };
        let command = self.remote_launch_command(&node);

        // Bookkeeping happens before the guard drops: the claim and registry
        // entry are visible to every other worker the moment the lock is
        // free, while the slow remote launch runs outside it.
        self.state = WorkerState::Launching;
        guard
            .ledger
            .utilize_resources(&node, self.cpus, self.memory_gib, &job_id, &self.name);
        guard.launched.push(LaunchedWorker {
            name: self.name.clone(),
            tag: self.tag.clone(),
        });
        drop(guard);

        if let Err(e) = self.ctx.channel.execute(&command).await {
            error!(worker = %self.name, node = %node, error = %e, "Remote launch failed");
            return Err(e.into());
        }

        self.ctx
            .hooks
            .started(&self.name)
            .await
            .map_err(WorkerError::Hook)?;

        self.state = WorkerState::Running;
        info!(worker = %self.name, node = %node, job_id = %job_id, "Worker running");
        Ok(())
    }

    /// Release this worker's claim and, if it was the job's last occupant,
    /// cancel the job. Decides expected vs unexpected departure via the
    /// removal-ticket ledger.
    pub async fn close(&mut self) -> Result<(), WorkerError> {
        debug!(worker = %self.name, job_id = ?self.job_id, "Stopping worker");
        self.state = WorkerState::Closing;

        let mut guard = self.ctx.shared.lock().await;

        if let (Some(node), Some(job_id)) = (&self.node, &self.job_id) {
            guard
                .ledger
                .release_resources(node, self.cpus, self.memory_gib, job_id, &self.name);
        }

        if let Some(job_id) = self.job_id.clone() {
            if !guard.ledger.has_active_nodes(&job_id) {
                guard.ledger.remove_jobid_nodes(&job_id);
                // Best-effort: the job may already be gone from the queue.
                if let Err(e) = self.ctx.queue.cancel(&job_id).await {
                    debug!(job_id = %job_id, error = %e, "Cancel failed, job presumed gone");
                }
            }
        }

        let expected = guard.take_removal_ticket(&self.name);
        let exited = guard.exited;
        drop(guard);

        if !expected && !exited {
            // Unexpected departure: ask for a reconciliation pass shortly,
            // so a replacement is launched.
            let relaunch_tx = self.ctx.relaunch_tx.clone();
            let name = self.name.clone();
            tokio::spawn(async move {
                tokio::time::sleep(RELAUNCH_DELAY).await;
                if relaunch_tx.send(()).is_err() {
                    debug!(worker = %name, "Reconciler gone, skipping relaunch request");
                }
            });
        }

        self.ctx
            .hooks
            .closed(&self.name)
            .await
            .map_err(WorkerError::Hook)?;

        self.state = WorkerState::Closed;
        info!(worker = %self.name, expected, "Worker closed");
        Ok(())
    }

    fn remote_launch_command(&self, node: &str) -> Vec<String> {
        let mut inner = self.launch_command.clone();
        if let Some(log_file) = &self.log_file {
            inner.push(format!(">{}", log_file.display()));
            inner.push("2>&1".to_string());
            inner.push("&".to_string());
        }
        vec![
            "ssh".to_string(),
            node.to_string(),
            format!("\"{}\"", inner.join(" ")),
        ]
    }
}

fn node_value<T: Copy>(values: &[T], index: usize, what: &'static str) -> Result<T, WorkerError> {
    values
        .get(index)
        .copied()
        .ok_or(WorkerError::Queue(QueueError::MalformedOutput {
            what,
            output: format!("missing entry for node {index}"),
        }))
}
