//! Remote execution channel interface and implementations.
//!
//! Every interaction with the outside world (queue submissions, queries,
//! cancellations, remote worker launches) goes through a single
//! `RemoteChannel` that accepts a command line and returns its stdout.
//! Command elements may contain shell operators (`|`, `>`, `&`), so the
//! subprocess implementation hands the joined line to a shell.
//!
//! A mock implementation is provided for testing and development.

use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Errors from remote command execution.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel itself is down (process spawn failed, connection lost).
    #[error("channel transport failure: {0}")]
    Transport(String),

    /// The command ran and exited non-zero.
    #[error("command exited with status {status}: {stderr}")]
    NonZeroExit { status: i32, stderr: String },
}

/// Remote execution channel.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Execute a command line and return its trimmed stdout.
    async fn execute(&self, command: &[String]) -> Result<String, ChannelError>;
}

/// Channel that executes command lines through a local shell.
///
/// This is the production path when the controller runs on a login node of
/// the batch cluster: queue commands run directly, and worker launches are
/// `ssh`-prefixed command lines built by the worker unit.
pub struct SubprocessChannel {
    shell: String,
}

impl SubprocessChannel {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl Default for SubprocessChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteChannel for SubprocessChannel {
    async fn execute(&self, command: &[String]) -> Result<String, ChannelError> {
        let line = command.join(" ");
        debug!(command = %line, "Executing command");

        let output = tokio::process::Command::new(&self.shell)
            .arg("-c")
            .arg(&line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        if !output.status.success() {
            return Err(ChannelError::NonZeroExit {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

enum MockRule {
    Respond { contains: String, output: String },
    Fail { contains: String, status: i32 },
}

/// Mock channel for testing and development.
///
/// Responses are scripted by substring match against the joined command
/// line; unmatched commands succeed with empty output. Every executed
/// command line is recorded.
#[derive(Default)]
pub struct MockChannel {
    rules: Mutex<Vec<MockRule>>,
    calls: Mutex<Vec<String>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script an output for command lines containing `contains`.
    pub fn respond(&self, contains: &str, output: &str) {
        self.rules.lock().unwrap().push(MockRule::Respond {
            contains: contains.to_string(),
            output: output.to_string(),
        });
    }

    /// Script a non-zero exit for command lines containing `contains`.
    pub fn fail(&self, contains: &str, status: i32) {
        self.rules.lock().unwrap().push(MockRule::Fail {
            contains: contains.to_string(),
            status,
        });
    }

    /// Drop all scripted rules, keeping the call log.
    pub fn clear_rules(&self) {
        self.rules.lock().unwrap().clear();
    }

    /// All command lines executed so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteChannel for MockChannel {
    async fn execute(&self, command: &[String]) -> Result<String, ChannelError> {
        let line = command.join(" ");
        self.calls.lock().unwrap().push(line.clone());

        let rules = self.rules.lock().unwrap();
        for rule in rules.iter() {
            match rule {
                MockRule::Respond { contains, output } if line.contains(contains.as_str()) => {
                    return Ok(output.clone());
                }
                MockRule::Fail { contains, status } if line.contains(contains.as_str()) => {
                    return Err(ChannelError::NonZeroExit {
                        status: *status,
                        stderr: format!("mock failure for {contains}"),
                    });
                }
                _ => {}
            }
        }

        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subprocess_channel_captures_stdout() {
        let channel = SubprocessChannel::new();
        let out = channel
            .execute(&["echo".to_string(), "hello".to_string()])
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_subprocess_channel_nonzero_exit() {
        let channel = SubprocessChannel::new();
        let err = channel
            .execute(&["exit".to_string(), "3".to_string()])
            .await
            .unwrap_err();
        match err {
            ChannelError::NonZeroExit { status, .. } => assert_eq!(status, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_mock_channel_scripting() {
        let channel = MockChannel::new();
        channel.respond("squeue", "12345");
        channel.fail("scancel", 1);

        let out = channel
            .execute(&["squeue".to_string(), "-j".to_string(), "12345".to_string()])
            .await
            .unwrap();
        assert_eq!(out, "12345");

        assert!(channel
            .execute(&["scancel".to_string(), "12345".to_string()])
            .await
            .is_err());

        assert_eq!(channel.calls().len(), 2);
    }
}
