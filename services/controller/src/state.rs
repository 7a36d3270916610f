//! Shared cluster state.
//!
//! One `ClusterState` exists per cluster, wrapped in a single
//! `tokio::sync::Mutex`, the cluster's advisory lock. Everything that two
//! concurrently progressing workers could race on lives inside it: the
//! hardware ledger, the launched-worker registry, desired-state specs,
//! removal tickets, the profile registry, and the terminal exited flag.
//! Holding the guard is the only way to touch any of it, so a task failure
//! cannot leak the lock or a half-applied decision.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::ledger::HardwareLedger;
use crate::profile::ProfileRegistry;

/// One entry in the launched-worker registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedWorker {
    pub name: String,
    pub tag: String,
}

/// State guarded by the cluster lock.
pub struct ClusterState {
    /// The resource-allocation table.
    pub ledger: HardwareLedger,

    /// Every worker launched and still believed alive, in launch order.
    /// The reconciler diffs this against the connected set.
    pub launched: Vec<LaunchedWorker>,

    /// Desired-state entries: worker name -> tag.
    pub specs: HashMap<String, String>,

    /// Workers whose upcoming close is intentional. A close that finds its
    /// ticket here is expected; one that does not triggers a relaunch pass.
    pub removal_tickets: HashSet<String>,

    /// Registered container profiles.
    pub profiles: ProfileRegistry,

    /// Monotonic counter feeding worker names.
    pub next_index: u64,

    /// One-way flag set before final teardown; reconciliation is a no-op
    /// afterwards.
    pub exited: bool,
}

impl ClusterState {
    pub fn new(profiles: ProfileRegistry) -> Self {
        Self {
            ledger: HardwareLedger::new(),
            launched: Vec::new(),
            specs: HashMap::new(),
            removal_tickets: HashSet::new(),
            profiles,
            next_index: 0,
            exited: false,
        }
    }

    /// Record that `worker`'s next close is intentional.
    pub fn file_removal_ticket(&mut self, worker: &str) {
        self.removal_tickets.insert(worker.to_string());
    }

    /// Consume `worker`'s removal ticket if one was filed.
    pub fn take_removal_ticket(&mut self, worker: &str) -> bool {
        self.removal_tickets.remove(worker)
    }

    /// Drop a worker from the registry and desired state.
    pub fn forget_worker(&mut self, worker: &str) {
        self.launched.retain(|w| w.name != worker);
        self.specs.remove(worker);
    }
}

/// The cluster state behind its advisory lock.
pub type SharedState = Arc<Mutex<ClusterState>>;
