//! Slurm backend: command builders and the `BatchQueue` implementation.
//!
//! The builders are pure functions producing argument vectors; shell
//! operators inside them (`|`, `tail`) are resolved by the execution
//! channel. `SlurmQueue` composes the builders over a `RemoteChannel`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::channel::{ChannelError, RemoteChannel};
use crate::queue::{AllocationRequest, BatchQueue, QueueError};

/// Build the `salloc` submission command for an allocation request.
///
/// `--no-shell` keeps the allocation alive without an interactive step and
/// is always the last flag.
pub fn salloc_command(request: &AllocationRequest) -> Vec<String> {
    let mut command = vec!["salloc".to_string()];
    if let Some(account) = &request.account {
        command.push("-A".to_string());
        command.push(account.clone());
    }
    if let Some(chdir) = &request.chdir {
        command.push("-D".to_string());
        command.push(chdir.clone());
    }
    if let Some(clusters) = &request.clusters {
        command.push("-M".to_string());
        command.push(clusters.clone());
    }
    if request.exclusive {
        command.push("--exclusive".to_string());
    }
    if let Some(gpus) = &request.gpus {
        command.push("-G".to_string());
        command.push(gpus.clone());
    }
    if !request.name.is_empty() {
        command.push("-J".to_string());
        command.push(request.name.clone());
    }
    if let Some(memory) = &request.memory {
        command.push("--mem".to_string());
        command.push(memory.clone());
    }
    if request.nodes > 0 {
        command.push("-N".to_string());
        command.push(request.nodes.to_string());
    }
    if let Some(partition) = &request.partition {
        command.push("-p".to_string());
        command.push(partition.clone());
    }
    if let Some(walltime) = &request.walltime {
        command.push("-t".to_string());
        command.push(walltime.clone());
    }
    command.extend(request.extras.iter().cloned());
    command.push("--no-shell".to_string());
    command
}

/// Query the job id granted under a job name.
pub fn jobid_command(name: &str) -> Vec<String> {
    split(&format!("squeue --name={name} -o %i | tail -n 1"))
}

/// Query the compact nodelist granted under a job name.
pub fn nodelist_command(name: &str) -> Vec<String> {
    split(&format!("squeue --name={name} -o %N | tail -n 1"))
}

/// Query whether a job id is still listed by the queue.
pub fn jobcheck_command(job_id: &str) -> Vec<String> {
    split(&format!("squeue -j {job_id} -o %i | tail -n 1"))
}

/// Cancel a job by id.
pub fn cancel_command(job_id: &str) -> Vec<String> {
    vec!["scancel".to_string(), job_id.to_string()]
}

/// Per-node CPU count probe, run inside an allocation.
pub fn core_command() -> Vec<String> {
    vec!["nproc".to_string(), "--all".to_string()]
}

/// Per-node free memory probe in GiB, run inside an allocation.
pub fn memory_command() -> Vec<String> {
    // Tokens may contain quoted whitespace, so no naive split here.
    [
        "free", "-g", "|", "grep", "'Mem'", "|", "sed", r"'s/[\t ][\t ]*/ /g'", "|", "cut",
        "-d", "' '", "-f", "7",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Prefix that runs a command on every node of an existing allocation.
pub fn srun_prefix(job_id: &str) -> Vec<String> {
    vec!["srun".to_string(), format!("--jobid={job_id}")]
}

/// Extract the first run of decimal digits, the scheduler-assigned job id.
pub fn parse_job_id(output: &str) -> Option<String> {
    let start = output.find(|c: char| c.is_ascii_digit())?;
    let id: String = output[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    Some(id)
}

fn split(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_string).collect()
}

/// Slurm implementation of the batch queue contract.
pub struct SlurmQueue {
    channel: Arc<dyn RemoteChannel>,
}

impl SlurmQueue {
    pub fn new(channel: Arc<dyn RemoteChannel>) -> Self {
        Self { channel }
    }

    async fn probe_lines(&self, job_id: &str, probe: Vec<String>) -> Result<Vec<String>, QueueError> {
        let mut command = srun_prefix(job_id);
        command.extend(probe);
        let out = self.channel.execute(&command).await?;
        Ok(out.lines().map(|l| l.trim().to_string()).collect())
    }
}

#[async_trait]
impl BatchQueue for SlurmQueue {
    async fn submit_allocation(&self, request: &AllocationRequest) -> Result<(), QueueError> {
        let out = self.channel.execute(&salloc_command(request)).await?;
        debug!(name = %request.name, output = %out, "Allocation submitted");
        Ok(())
    }

    async fn job_id_for_name(&self, name: &str) -> Result<String, QueueError> {
        let out = self.channel.execute(&jobid_command(name)).await?;
        parse_job_id(&out).ok_or_else(|| QueueError::NotFound(name.to_string()))
    }

    async fn nodelist_for_name(&self, name: &str) -> Result<String, QueueError> {
        let out = self.channel.execute(&nodelist_command(name)).await?;
        if out.is_empty() || out == "NODELIST" {
            return Err(QueueError::NotFound(name.to_string()));
        }
        Ok(out)
    }

    async fn is_listed(&self, job_id: &str) -> Result<bool, QueueError> {
        match self.channel.execute(&jobcheck_command(job_id)).await {
            Ok(out) => Ok(parse_job_id(&out).as_deref() == Some(job_id)),
            // squeue exits non-zero for ids it no longer knows
            Err(ChannelError::NonZeroExit { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn cancel(&self, job_id: &str) -> Result<(), QueueError> {
        self.channel.execute(&cancel_command(job_id)).await?;
        Ok(())
    }

    async fn node_cpu_counts(&self, job_id: &str) -> Result<Vec<u32>, QueueError> {
        let lines = self.probe_lines(job_id, core_command()).await?;
        lines
            .iter()
            .filter(|l| !l.is_empty())
            .map(|l| {
                l.parse().map_err(|_| QueueError::MalformedOutput {
                    what: "cpu count",
                    output: l.clone(),
                })
            })
            .collect()
    }

    async fn node_free_memory_gib(&self, job_id: &str) -> Result<Vec<u64>, QueueError> {
        let lines = self.probe_lines(job_id, memory_command()).await?;
        lines
            .iter()
            .filter(|l| !l.is_empty())
            .map(|l| {
                l.parse().map_err(|_| QueueError::MalformedOutput {
                    what: "free memory",
                    output: l.clone(),
                })
            })
            .collect()
    }
}
