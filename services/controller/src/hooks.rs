//! External collaborator seams.
//!
//! The compute scheduler session and the process supervisor live outside
//! this crate; workers and the reconciler talk to them through these
//! traits. `LifecycleHooks` receives start/close notifications at the
//! natural points of the worker state machine; hook errors propagate to
//! the owning reconciler. `MembershipView` reports which workers are
//! currently connected to the compute scheduler and feeds dead-worker
//! detection.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use crate::channel::RemoteChannel;

/// Process-supervisor lifecycle hooks.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    /// A worker finished its launch sequence.
    async fn started(&self, _worker: &str) -> Result<()> {
        Ok(())
    }

    /// A worker released its claim and closed.
    async fn closed(&self, _worker: &str) -> Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing.
pub struct NoopHooks;

#[async_trait]
impl LifecycleHooks for NoopHooks {}

/// View of the workers currently connected to the compute scheduler.
#[async_trait]
pub trait MembershipView: Send + Sync {
    async fn connected_workers(&self) -> HashSet<String>;
}

/// Membership view backed by an explicit set, for tests and development.
#[derive(Default)]
pub struct StaticMembership {
    connected: Mutex<HashSet<String>>,
}

impl StaticMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, worker: &str) {
        self.connected.lock().unwrap().insert(worker.to_string());
    }

    pub fn disconnect(&self, worker: &str) {
        self.connected.lock().unwrap().remove(worker);
    }
}

#[async_trait]
impl MembershipView for StaticMembership {
    async fn connected_workers(&self) -> HashSet<String> {
        self.connected.lock().unwrap().clone()
    }
}

/// Membership view that runs an operator-configured probe command through
/// the execution channel and reads one connected worker name per line.
///
/// A probe failure returns the last successful observation: a stale view
/// only delays relaunches, an empty one would relaunch the whole fleet.
pub struct CommandMembership {
    channel: Arc<dyn RemoteChannel>,
    command: Vec<String>,
    last_seen: Mutex<HashSet<String>>,
}

impl CommandMembership {
    pub fn new(channel: Arc<dyn RemoteChannel>, command: Vec<String>) -> Self {
        Self {
            channel,
            command,
            last_seen: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl MembershipView for CommandMembership {
    async fn connected_workers(&self) -> HashSet<String> {
        match self.channel.execute(&self.command).await {
            Ok(out) => {
                let connected: HashSet<String> = out
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect();
                *self.last_seen.lock().unwrap() = connected.clone();
                connected
            }
            Err(e) => {
                warn!(error = %e, "Membership probe failed, using last observation");
                self.last_seen.lock().unwrap().clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockChannel;

    #[tokio::test]
    async fn test_static_membership() {
        let membership = StaticMembership::new();
        membership.connect("w1");
        membership.connect("w2");
        membership.disconnect("w1");
        let connected = membership.connected_workers().await;
        assert!(connected.contains("w2"));
        assert!(!connected.contains("w1"));
    }

    #[tokio::test]
    async fn test_command_membership_parses_lines() {
        let channel = Arc::new(MockChannel::new());
        channel.respond("list-workers", "w1\n w2 \n\n");
        let membership =
            CommandMembership::new(channel, vec!["list-workers".to_string()]);
        let connected = membership.connected_workers().await;
        assert_eq!(connected.len(), 2);
        assert!(connected.contains("w1") && connected.contains("w2"));
    }

    #[tokio::test]
    async fn test_command_membership_keeps_last_on_failure() {
        let channel = Arc::new(MockChannel::new());
        channel.respond("list-workers", "w1");
        let membership = CommandMembership::new(
            Arc::clone(&channel) as Arc<dyn RemoteChannel>,
            vec!["list-workers".to_string()],
        );
        assert_eq!(membership.connected_workers().await.len(), 1);

        channel.clear_rules();
        channel.fail("list-workers", 1);
        let connected = membership.connected_workers().await;
        assert!(connected.contains("w1"));
    }

    #[tokio::test]
    async fn test_command_membership_empty_without_history() {
        let channel = Arc::new(MockChannel::new());
        channel.fail("list-workers", 1);
        let membership = CommandMembership::new(channel, vec!["list-workers".to_string()]);
        assert!(membership.connected_workers().await.is_empty());
    }
}
