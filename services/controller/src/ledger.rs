//! Hardware ledger: the cluster's resource-allocation table.
//!
//! One instance per cluster, owned by the shared cluster state and mutated
//! only while the cluster lock is held. Tracks, per physical node: total
//! capacity, the portion currently claimed by workers, the owning batch-job
//! id, and which workers hold claims.
//!
//! # Invariants
//!
//! - A node's claimed CPU/memory never exceeds its totals.
//! - Every node in the table has an owning batch job; nodes leave the table
//!   when their job is removed.
//! - Ownership is verified lazily: a recorded job id may be stale until a
//!   caller re-validates it against the queue and purges it.
//!
//! All operations are synchronous in-memory mutations; none perform I/O.
//! Claiming beyond capacity is a caller bug and panics.

use std::collections::BTreeSet;
use std::collections::HashMap;

use serde::Serialize;

#[derive(Debug, Clone)]
struct NodeEntry {
    job_id: String,
    total_cpus: u32,
    total_memory_gib: u64,
    used_cpus: u32,
    used_memory_gib: u64,
    workers: BTreeSet<String>,
}

impl NodeEntry {
    fn free_cpus(&self) -> u32 {
        self.total_cpus - self.used_cpus
    }

    fn free_memory_gib(&self) -> u64 {
        self.total_memory_gib - self.used_memory_gib
    }
}

/// Read-only occupancy view of one node, for observability.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub node: String,
    pub job_id: String,
    pub total_cpus: u32,
    pub used_cpus: u32,
    pub total_memory_gib: u64,
    pub used_memory_gib: u64,
    pub workers: Vec<String>,
}

/// The resource-allocation table.
#[derive(Debug, Default)]
pub struct HardwareLedger {
    /// Node names in insertion order; search is first-fit over this.
    order: Vec<String>,
    entries: HashMap<String, NodeEntry>,
    headroom_cpus: u32,
    headroom_memory_gib: u64,
}

impl HardwareLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep this much CPU/memory free on every node when searching.
    pub fn set_headroom(&mut self, cpus: u32, memory_gib: u64) {
        self.headroom_cpus = cpus;
        self.headroom_memory_gib = memory_gib;
    }

    /// First node (in insertion order) with an owning job and enough free
    /// capacity for the request, or `None`.
    pub fn get_available_node(&self, cpus: u32, memory_gib: u64) -> Option<String> {
        self.order
            .iter()
            .find(|node| {
                let entry = &self.entries[*node];
                entry.free_cpus() >= cpus + self.headroom_cpus
                    && entry.free_memory_gib() >= memory_gib + self.headroom_memory_gib
            })
            .cloned()
    }

    /// The batch job currently owning a node.
    pub fn get_node_jobid(&self, node: &str) -> Option<String> {
        self.entries.get(node).map(|e| e.job_id.clone())
    }

    /// Bind a node to a job with the given total capacity.
    ///
    /// Returns `false` without mutating if the node is already owned by a
    /// *different* job; the caller resolves that conflict by re-validating
    /// the recorded job id. Re-assigning under the same job is a no-op.
    pub fn assign_resources(
        &mut self,
        node: &str,
        cpus: u32,
        memory_gib: u64,
        job_id: &str,
    ) -> bool {
        match self.entries.get(node) {
            Some(entry) => entry.job_id == job_id,
            None => {
                self.entries.insert(
                    node.to_string(),
                    NodeEntry {
                        job_id: job_id.to_string(),
                        total_cpus: cpus,
                        total_memory_gib: memory_gib,
                        used_cpus: 0,
                        used_memory_gib: 0,
                        workers: BTreeSet::new(),
                    },
                );
                self.order.push(node.to_string());
                true
            }
        }
    }

    /// Record a worker's claim against a node.
    ///
    /// Panics if the node is unknown, owned by a different job, or the claim
    /// would exceed capacity: those are caller bugs, not environment
    /// conditions.
    pub fn utilize_resources(
        &mut self,
        node: &str,
        cpus: u32,
        memory_gib: u64,
        job_id: &str,
        worker: &str,
    ) {
        let entry = self
            .entries
            .get_mut(node)
            .unwrap_or_else(|| panic!("utilize_resources: unknown node {node}"));
        assert_eq!(
            entry.job_id, job_id,
            "utilize_resources: node {node} owned by job {}, not {job_id}",
            entry.job_id
        );
        assert!(
            entry.free_cpus() >= cpus && entry.free_memory_gib() >= memory_gib,
            "utilize_resources: claim {cpus}c/{memory_gib}g exceeds free \
             {}c/{}g on {node}",
            entry.free_cpus(),
            entry.free_memory_gib()
        );
        entry.used_cpus += cpus;
        entry.used_memory_gib += memory_gib;
        entry.workers.insert(worker.to_string());
    }

    /// Release a worker's claim. Tolerant of claims already gone (the job's
    /// nodes may have been purged out from under the worker).
    pub fn release_resources(
        &mut self,
        node: &str,
        cpus: u32,
        memory_gib: u64,
        job_id: &str,
        worker: &str,
    ) {
        let Some(entry) = self.entries.get_mut(node) else {
            return;
        };
        if entry.job_id != job_id {
            return;
        }
        entry.used_cpus = entry.used_cpus.saturating_sub(cpus);
        entry.used_memory_gib = entry.used_memory_gib.saturating_sub(memory_gib);
        entry.workers.remove(worker);
    }

    /// Whether any node is owned by this job.
    pub fn is_assigned(&self, job_id: &str) -> bool {
        self.entries.values().any(|e| e.job_id == job_id)
    }

    /// Whether any node owned by this job has a nonzero utilization.
    pub fn has_active_nodes(&self, job_id: &str) -> bool {
        self.entries
            .values()
            .any(|e| e.job_id == job_id && (e.used_cpus > 0 || e.used_memory_gib > 0))
    }

    /// Detach every node owned by this job, clearing their allocation.
    /// Used once a job is confirmed gone from the queue.
    pub fn remove_jobid_nodes(&mut self, job_id: &str) {
        self.entries.retain(|_, e| e.job_id != job_id);
        let entries = &self.entries;
        self.order.retain(|node| entries.contains_key(node));
    }

    /// Occupancy snapshot in insertion order.
    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        self.order
            .iter()
            .map(|node| {
                let entry = &self.entries[node];
                NodeSnapshot {
                    node: node.clone(),
                    job_id: entry.job_id.clone(),
                    total_cpus: entry.total_cpus,
                    used_cpus: entry.used_cpus,
                    total_memory_gib: entry.total_memory_gib,
                    used_memory_gib: entry.used_memory_gib,
                    workers: entry.workers.iter().cloned().collect(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with(node: &str, cpus: u32, memory: u64, job: &str) -> HardwareLedger {
        let mut ledger = HardwareLedger::new();
        assert!(ledger.assign_resources(node, cpus, memory, job));
        ledger
    }

    #[test]
    fn test_assign_conflict_leaves_first_owner() {
        let mut ledger = ledger_with("n1", 4, 8, "job1");
        assert!(!ledger.assign_resources("n1", 4, 8, "job2"));
        assert_eq!(ledger.get_node_jobid("n1"), Some("job1".to_string()));
    }

    #[test]
    fn test_assign_same_job_idempotent() {
        let mut ledger = ledger_with("n1", 4, 8, "job1");
        ledger.utilize_resources("n1", 2, 4, "job1", "w1");
        assert!(ledger.assign_resources("n1", 4, 8, "job1"));
        let snap = &ledger.snapshot()[0];
        assert_eq!(snap.used_cpus, 2);
    }

    #[test]
    fn test_first_fit_insertion_order() {
        let mut ledger = HardwareLedger::new();
        ledger.assign_resources("n1", 2, 4, "job1");
        ledger.assign_resources("n2", 16, 64, "job1");
        assert_eq!(ledger.get_available_node(4, 8), Some("n2".to_string()));
        assert_eq!(ledger.get_available_node(1, 1), Some("n1".to_string()));
        assert_eq!(ledger.get_available_node(32, 8), None);
    }

    #[test]
    fn test_headroom_shrinks_availability() {
        let mut ledger = ledger_with("n1", 8, 16, "job1");
        assert_eq!(ledger.get_available_node(8, 16), Some("n1".to_string()));
        ledger.set_headroom(1, 2);
        assert_eq!(ledger.get_available_node(8, 16), None);
        assert_eq!(ledger.get_available_node(7, 14), Some("n1".to_string()));
    }

    #[test]
    fn test_active_nodes_lifecycle() {
        let mut ledger = ledger_with("n1", 8, 16, "job1");
        assert!(!ledger.has_active_nodes("job1"));
        ledger.utilize_resources("n1", 4, 8, "job1", "w1");
        assert!(ledger.has_active_nodes("job1"));
        ledger.release_resources("n1", 4, 8, "job1", "w1");
        assert!(!ledger.has_active_nodes("job1"));
        assert!(ledger.is_assigned("job1"));
    }

    #[test]
    fn test_release_utilize_round_trip() {
        let mut ledger = ledger_with("n1", 8, 16, "job1");
        ledger.utilize_resources("n1", 4, 8, "job1", "w1");
        let before = ledger.snapshot();
        ledger.release_resources("n1", 4, 8, "job1", "w1");
        ledger.utilize_resources("n1", 4, 8, "job1", "w1");
        let after = ledger.snapshot();
        assert_eq!(before[0].used_cpus, after[0].used_cpus);
        assert_eq!(before[0].used_memory_gib, after[0].used_memory_gib);
    }

    #[test]
    fn test_release_with_wrong_job_is_noop() {
        let mut ledger = ledger_with("n1", 8, 16, "job1");
        ledger.utilize_resources("n1", 4, 8, "job1", "w1");
        ledger.release_resources("n1", 4, 8, "job2", "w1");
        assert!(ledger.has_active_nodes("job1"));
    }

    #[test]
    fn test_remove_jobid_nodes() {
        let mut ledger = HardwareLedger::new();
        ledger.assign_resources("n1", 8, 16, "job1");
        ledger.assign_resources("n2", 8, 16, "job2");
        ledger.remove_jobid_nodes("job1");
        assert!(!ledger.is_assigned("job1"));
        assert!(ledger.is_assigned("job2"));
        assert_eq!(ledger.get_node_jobid("n1"), None);
        assert_eq!(ledger.snapshot().len(), 1);
    }

    #[test]
    #[should_panic(expected = "exceeds free")]
    fn test_overcommit_panics() {
        let mut ledger = ledger_with("n1", 4, 8, "job1");
        ledger.utilize_resources("n1", 8, 8, "job1", "w1");
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut ledger = ledger_with("n1", 8, 16, "job1");
        ledger.utilize_resources("n1", 4, 8, "job1", "w1");
        let value = serde_json::to_value(ledger.snapshot()).unwrap();
        assert_eq!(value[0]["node"], "n1");
        assert_eq!(value[0]["job_id"], "job1");
        assert_eq!(value[0]["used_cpus"], 4);
        assert_eq!(value[0]["workers"][0], "w1");
    }

    #[test]
    fn test_worker_attribution_in_snapshot() {
        let mut ledger = ledger_with("n1", 8, 16, "job1");
        ledger.utilize_resources("n1", 2, 4, "job1", "w1");
        ledger.utilize_resources("n1", 2, 4, "job1", "w2");
        assert_eq!(ledger.snapshot()[0].workers, vec!["w1", "w2"]);
        ledger.release_resources("n1", 2, 4, "job1", "w1");
        assert_eq!(ledger.snapshot()[0].workers, vec!["w2"]);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Random claim/release sequences respecting preconditions never
            /// drive a node over its capacity.
            #[test]
            fn never_overcommits(ops in proptest::collection::vec((1u32..4, 1u64..4, any::<bool>()), 0..64)) {
                let mut ledger = HardwareLedger::new();
                ledger.assign_resources("n1", 64, 64, "job1");
                let mut held: Vec<(u32, u64, String)> = Vec::new();

                for (i, (cpus, memory, release)) in ops.into_iter().enumerate() {
                    if release && !held.is_empty() {
                        let (c, m, w) = held.pop().unwrap();
                        ledger.release_resources("n1", c, m, "job1", &w);
                    } else if ledger.get_available_node(cpus, memory).is_some() {
                        let worker = format!("w{i}");
                        ledger.utilize_resources("n1", cpus, memory, "job1", &worker);
                        held.push((cpus, memory, worker));
                    }
                    let snap = &ledger.snapshot()[0];
                    prop_assert!(snap.used_cpus <= snap.total_cpus);
                    prop_assert!(snap.used_memory_gib <= snap.total_memory_gib);
                }
            }
        }
    }
}
