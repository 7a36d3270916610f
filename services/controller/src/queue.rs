//! Batch queue interface.
//!
//! The queueing backend is a capability injected into worker units and the
//! reconciler rather than a base class to inherit from: one implementation
//! per queueing system, all consuming the same submit/query/cancel
//! primitives. `SlurmQueue` (see `slurm.rs`) is the production backend; a
//! scriptable mock is provided for testing and development.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::channel::ChannelError;

/// Errors from batch queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The underlying execution channel failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The queue produced output this backend cannot interpret.
    #[error("malformed {what} output: {output:?}")]
    MalformedOutput { what: &'static str, output: String },

    /// A job expected to be queryable was not found.
    #[error("job not found: {0}")]
    NotFound(String),
}

/// One allocation request against the batch queue.
#[derive(Debug, Clone, Default)]
pub struct AllocationRequest {
    /// Job name; the grant is queried back by this name.
    pub name: String,

    /// Number of nodes requested.
    pub nodes: u32,

    pub partition: Option<String>,
    pub account: Option<String>,
    pub walltime: Option<String>,
    pub memory: Option<String>,
    pub gpus: Option<String>,
    pub chdir: Option<String>,
    pub clusters: Option<String>,

    /// Request whole nodes.
    pub exclusive: bool,

    /// Extra scheduler flags appended verbatim.
    pub extras: Vec<String>,
}

/// Batch queue operations consumed by worker units and the reconciler.
#[async_trait]
pub trait BatchQueue: Send + Sync {
    /// Submit a new allocation. The grant becomes queryable by job name.
    async fn submit_allocation(&self, request: &AllocationRequest) -> Result<(), QueueError>;

    /// Query the job id granted for a job name.
    async fn job_id_for_name(&self, name: &str) -> Result<String, QueueError>;

    /// Query the compact nodelist granted for a job name.
    async fn nodelist_for_name(&self, name: &str) -> Result<String, QueueError>;

    /// Whether the queue still lists this job id.
    async fn is_listed(&self, job_id: &str) -> Result<bool, QueueError>;

    /// Cancel a job by id.
    async fn cancel(&self, job_id: &str) -> Result<(), QueueError>;

    /// Per-node CPU counts inside an allocation, in nodelist order.
    async fn node_cpu_counts(&self, job_id: &str) -> Result<Vec<u32>, QueueError>;

    /// Per-node free memory in GiB inside an allocation, in nodelist order.
    async fn node_free_memory_gib(&self, job_id: &str) -> Result<Vec<u64>, QueueError>;
}

/// One scripted grant the mock queue will hand out on submission.
#[derive(Debug, Clone)]
pub struct MockGrant {
    pub nodelist: String,
    pub cpus_per_node: u32,
    pub memory_gib_per_node: u64,
}

#[derive(Default)]
struct MockQueueState {
    /// Grants handed out in order of submission.
    pending_grants: Vec<MockGrant>,
    /// Job name -> (job id, grant).
    jobs: HashMap<String, (String, MockGrant)>,
    /// Job ids the queue currently lists.
    listed: HashMap<String, MockGrant>,
    cancelled: Vec<String>,
    submissions: Vec<AllocationRequest>,
    next_id: u64,
}

/// Mock batch queue for testing and development.
///
/// Script grants with [`MockQueue::push_grant`] before driving workers;
/// each submission consumes one grant. Jobs can be delisted out-of-band to
/// simulate external cancellation or preemption.
#[derive(Default)]
pub struct MockQueue {
    state: Mutex<MockQueueState>,
}

impl MockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue up a grant for the next submission.
    pub fn push_grant(&self, grant: MockGrant) {
        self.state.lock().unwrap().pending_grants.push(grant);
    }

    /// Drop a job id from the listing, as if cancelled externally.
    pub fn delist(&self, job_id: &str) {
        self.state.lock().unwrap().listed.remove(job_id);
    }

    /// All submissions observed so far.
    pub fn submissions(&self) -> Vec<AllocationRequest> {
        self.state.lock().unwrap().submissions.clone()
    }

    /// All job ids cancelled so far.
    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }
}

#[async_trait]
impl BatchQueue for MockQueue {
    async fn submit_allocation(&self, request: &AllocationRequest) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        state.submissions.push(request.clone());
        if state.pending_grants.is_empty() {
            return Err(QueueError::NotFound(format!(
                "no grant scripted for {}",
                request.name
            )));
        }
        let grant = state.pending_grants.remove(0);
        state.next_id += 1;
        let job_id = format!("{}", 1000 + state.next_id);
        state
            .jobs
            .insert(request.name.clone(), (job_id.clone(), grant.clone()));
        state.listed.insert(job_id, grant);
        Ok(())
    }

    async fn job_id_for_name(&self, name: &str) -> Result<String, QueueError> {
        let state = self.state.lock().unwrap();
        state
            .jobs
            .get(name)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| QueueError::NotFound(name.to_string()))
    }

    async fn nodelist_for_name(&self, name: &str) -> Result<String, QueueError> {
        let state = self.state.lock().unwrap();
        state
            .jobs
            .get(name)
            .map(|(_, grant)| grant.nodelist.clone())
            .ok_or_else(|| QueueError::NotFound(name.to_string()))
    }

    async fn is_listed(&self, job_id: &str) -> Result<bool, QueueError> {
        Ok(self.state.lock().unwrap().listed.contains_key(job_id))
    }

    async fn cancel(&self, job_id: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        if state.listed.remove(job_id).is_none() {
            state.cancelled.push(job_id.to_string());
            return Err(QueueError::NotFound(job_id.to_string()));
        }
        state.cancelled.push(job_id.to_string());
        Ok(())
    }

    async fn node_cpu_counts(&self, job_id: &str) -> Result<Vec<u32>, QueueError> {
        let state = self.state.lock().unwrap();
        let grant = state
            .listed
            .get(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;
        let nodes = fleetq_hostlist::expand(&grant.nodelist).map_err(|e| {
            QueueError::MalformedOutput {
                what: "nodelist",
                output: e.to_string(),
            }
        })?;
        Ok(vec![grant.cpus_per_node; nodes.len()])
    }

    async fn node_free_memory_gib(&self, job_id: &str) -> Result<Vec<u64>, QueueError> {
        let state = self.state.lock().unwrap();
        let grant = state
            .listed
            .get(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;
        let nodes = fleetq_hostlist::expand(&grant.nodelist).map_err(|e| {
            QueueError::MalformedOutput {
                what: "nodelist",
                output: e.to_string(),
            }
        })?;
        Ok(vec![grant.memory_gib_per_node; nodes.len()])
    }
}
