//! Fleet reconciler: converges the worker fleet to its desired size.
//!
//! The reconciler owns the canonical launched-worker registry and compares
//! it against the set of workers actually connected to the compute
//! scheduler. Workers present in the registry but absent from the
//! connected set are dead (crashed, preempted, or revoked out-of-band);
//! their entries are removed and their tags re-queued for relaunch
//! alongside any explicitly requested scale-out. A pass with a zero
//! increment is a pure cleanup sweep and runs on a fixed period until the
//! cluster is marked exited.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::channel::RemoteChannel;
use crate::config::Config;
use crate::hooks::{LifecycleHooks, MembershipView};
use crate::ledger::NodeSnapshot;
use crate::profile::{ContainerProfile, ContainerRuntime, ProfileError, ProfileRegistry};
use crate::queue::BatchQueue;
use crate::state::{ClusterState, LaunchedWorker, SharedState};
use crate::worker::{WorkerContext, WorkerUnit};

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileStats {
    /// Dead workers removed from the registry this pass.
    pub workers_lost: usize,

    /// Workers spawned this pass (replacements plus new scale-out).
    pub workers_started: usize,
}

struct WorkerHandle {
    close_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

/// The cluster-level control loop.
pub struct FleetReconciler {
    config: Arc<Config>,
    shared: SharedState,
    queue: Arc<dyn BatchQueue>,
    channel: Arc<dyn RemoteChannel>,
    membership: Arc<dyn MembershipView>,
    hooks: Arc<dyn LifecycleHooks>,
    handles: Mutex<HashMap<String, WorkerHandle>>,
    relaunch_tx: mpsc::UnboundedSender<()>,
    relaunch_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
}

impl FleetReconciler {
    pub fn new(
        config: Arc<Config>,
        queue: Arc<dyn BatchQueue>,
        channel: Arc<dyn RemoteChannel>,
        membership: Arc<dyn MembershipView>,
        hooks: Arc<dyn LifecycleHooks>,
        profiles: ProfileRegistry,
    ) -> Self {
        let (relaunch_tx, relaunch_rx) = mpsc::unbounded_channel();
        Self {
            config,
            shared: Arc::new(Mutex::new(ClusterState::new(profiles))),
            queue,
            channel,
            membership,
            hooks,
            handles: Mutex::new(HashMap::new()),
            relaunch_tx,
            relaunch_rx: Mutex::new(Some(relaunch_rx)),
        }
    }

    /// Register a container profile; a tag must be registered before it can
    /// be scaled.
    pub async fn add_container_profile(&self, profile: ContainerProfile) {
        let mut guard = self.shared.lock().await;
        info!(tag = %profile.tag, cpus = profile.cpus, memory_gib = profile.memory_gib,
              "Registering container profile");
        guard.profiles.register(profile);
    }

    /// Read-only occupancy snapshot of the hardware ledger.
    pub async fn occupancy(&self) -> Vec<NodeSnapshot> {
        self.shared.lock().await.ledger.snapshot()
    }

    /// The launched-worker registry, in launch order.
    pub async fn launched_workers(&self) -> Vec<LaunchedWorker> {
        self.shared.lock().await.launched.clone()
    }

    /// Run one reconciliation pass: sweep dead workers and launch `count`
    /// new workers of `tag` plus one replacement per dead worker.
    ///
    /// With `tag = None` and `count = 0` this is a pure cleanup pass and is
    /// idempotent. Once the cluster is exited it does nothing.
    pub async fn reconcile(
        &self,
        tag: Option<&str>,
        count: usize,
    ) -> Result<ReconcileStats, ProfileError> {
        let connected = self.membership.connected_workers().await;
        let mut stats = ReconcileStats::default();

        let (dead, to_spawn, runtime) = {
            let mut guard = self.shared.lock().await;
            if guard.exited {
                debug!("Cluster exited, skipping reconciliation");
                return Ok(stats);
            }

            let mut tags: Vec<String> = Vec::new();
            if let Some(tag) = tag {
                if !guard.profiles.contains(tag) {
                    return Err(ProfileError::UnknownTag(tag.to_string()));
                }
                tags.extend(std::iter::repeat(tag.to_lowercase()).take(count));
            }

            let dead: Vec<LaunchedWorker> = guard
                .launched
                .iter()
                .filter(|w| !connected.contains(&w.name))
                .cloned()
                .collect();
            for worker in &dead {
                warn!(worker = %worker.name, tag = %worker.tag,
                      "Worker no longer connected, queuing relaunch");
                // Ticket first: the close this triggers is intentional and
                // must not schedule a second pass of its own.
                guard.file_removal_ticket(&worker.name);
                guard.forget_worker(&worker.name);
                tags.push(worker.tag.clone());
                stats.workers_lost += 1;
            }

            let mut to_spawn = Vec::new();
            for tag in tags {
                let profile = guard.profiles.get(&tag)?.clone();
                let name = next_worker_name(&mut guard, &self.config.cluster_name, &tag);
                guard.specs.insert(name.clone(), tag.clone());
                to_spawn.push((name, profile));
            }
            (dead, to_spawn, guard.profiles.runtime())
        };

        // Dead workers' tasks release their stale claims through the normal
        // close path, outside the lock.
        for worker in &dead {
            self.close_handle(&worker.name).await;
        }

        for (name, profile) in to_spawn {
            self.spawn_worker(name, profile, runtime).await;
            stats.workers_started += 1;
        }

        if stats.workers_lost > 0 || stats.workers_started > 0 {
            info!(
                workers_lost = stats.workers_lost,
                workers_started = stats.workers_started,
                "Reconciliation pass complete"
            );
        }
        Ok(stats)
    }

    /// Retire up to `count` workers of `tag`, most recently launched first.
    /// Their departures are expected and do not trigger relaunches.
    pub async fn remove_workers(&self, tag: &str, count: usize) -> usize {
        let victims: Vec<String> = {
            let mut guard = self.shared.lock().await;
            let victims: Vec<String> = guard
                .launched
                .iter()
                .rev()
                .filter(|w| w.tag == tag.to_lowercase())
                .take(count)
                .map(|w| w.name.clone())
                .collect();
            for name in &victims {
                guard.file_removal_ticket(name);
                guard.forget_worker(name);
            }
            victims
        };

        for name in &victims {
            info!(worker = %name, "Retiring worker");
            self.close_handle(name).await;
        }
        victims.len()
    }

    /// Mark the cluster exited and close every worker. Reconciliation is a
    /// permanent no-op afterwards; this is the final teardown step.
    pub async fn shutdown(&self) {
        info!("Shutting down fleet");
        {
            let mut guard = self.shared.lock().await;
            guard.exited = true;
            let names: Vec<String> = guard.launched.iter().map(|w| w.name.clone()).collect();
            for name in names {
                guard.file_removal_ticket(&name);
                guard.forget_worker(&name);
            }
        }

        let handles: Vec<(String, WorkerHandle)> =
            self.handles.lock().await.drain().collect();
        for (name, handle) in handles {
            let _ = handle.close_tx.send(());
            if let Err(e) = handle.join.await {
                warn!(worker = %name, error = %e, "Worker task ended abnormally");
            }
        }
        info!("Fleet shutdown complete");
    }

    /// Whether the cluster has been marked exited.
    pub async fn is_exited(&self) -> bool {
        self.shared.lock().await.exited
    }

    /// Run the periodic dead-worker sweep until shutdown is signaled.
    ///
    /// Unexpected worker closes feed the same loop through the relaunch
    /// channel, so replacements appear ahead of the next scheduled sweep.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let Some(mut relaunch_rx) = self.relaunch_rx.lock().await.take() else {
            warn!("Sweep loop already running");
            return;
        };

        info!(
            sweep_interval_secs = self.config.sweep_interval_secs,
            "Starting dead-worker sweep"
        );

        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.sweep_interval_secs));
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.reconcile(None, 0).await {
                        error!(error = %e, "Sweep pass failed");
                    }
                }
                Some(()) = relaunch_rx.recv() => {
                    debug!("Relaunch requested by a closed worker");
                    if let Err(e) = self.reconcile(None, 0).await {
                        error!(error = %e, "Relaunch pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Fleet reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn spawn_worker(&self, name: String, profile: ContainerProfile, runtime: ContainerRuntime) {
        let ctx = WorkerContext {
            shared: Arc::clone(&self.shared),
            queue: Arc::clone(&self.queue),
            channel: Arc::clone(&self.channel),
            hooks: Arc::clone(&self.hooks),
            relaunch_tx: self.relaunch_tx.clone(),
            config: Arc::clone(&self.config),
        };
        let mut worker = WorkerUnit::new(&name, &profile, runtime, ctx);

        let (close_tx, close_rx) = oneshot::channel();
        let worker_name = name.clone();
        let join = tokio::spawn(async move {
            match worker.start().await {
                Ok(()) => {
                    // Park until the reconciler asks for a close.
                    let _ = close_rx.await;
                    if let Err(e) = worker.close().await {
                        warn!(worker = %worker_name, error = %e, "Worker close failed");
                    }
                }
                Err(e) => {
                    error!(
                        worker = %worker_name,
                        state = worker.state().as_str(),
                        error = %e,
                        "Worker failed to start"
                    );
                    // Release whatever was claimed; an unexpected close
                    // schedules the relaunch pass.
                    if let Err(e) = worker.close().await {
                        warn!(worker = %worker_name, error = %e, "Worker cleanup failed");
                    }
                }
            }
        });

        self.handles
            .lock()
            .await
            .insert(name, WorkerHandle { close_tx, join });
    }

    async fn close_handle(&self, name: &str) {
        if let Some(handle) = self.handles.lock().await.remove(name) {
            let _ = handle.close_tx.send(());
        }
    }
}

fn next_worker_name(state: &mut ClusterState, cluster_name: &str, tag: &str) -> String {
    loop {
        state.next_index += 1;
        let name = format!("{cluster_name}-{}-{tag}", state.next_index);
        if !state.specs.contains_key(&name) {
            return name;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_worker_name_skips_collisions() {
        let mut state = ClusterState::new(ProfileRegistry::default());
        state.specs.insert("c-1-gcam".to_string(), "gcam".to_string());
        let name = next_worker_name(&mut state, "c", "gcam");
        assert_eq!(name, "c-2-gcam");
    }
}
