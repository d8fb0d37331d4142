use crate::hosts::Host;
use async_trait::async_trait;
use reclaim_core::{HostReport, WipeMode};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

const MAX_CONNECT_TIMEOUT_SECS: u64 = 10;

/// What the agent on the remote host is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteRequest {
    Inventory,
    Cleanup { mode: WipeMode, dry_run: bool },
}

impl RemoteRequest {
    /// Arguments for the remote `reclaim` binary. A live cleanup carries the
    /// confirmation already given locally.
    pub fn agent_args(&self) -> Vec<String> {
        match self {
            RemoteRequest::Inventory => vec!["agent".into(), "inventory".into()],
            RemoteRequest::Cleanup { mode, dry_run } => {
                let mut args = vec![
                    "agent".to_string(),
                    "cleanup".to_string(),
                    "--mode".to_string(),
                    mode.as_str().to_string(),
                ];
                args.push(if *dry_run { "--dry-run" } else { "--yes" }.to_string());
                args
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to start ssh: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("{0}")]
    Exited(String),
    #[error("failed to parse JSON output: {0}")]
    InvalidOutput(#[from] serde_json::Error),
    #[error("timeout after {}s", .0.as_secs_f64())]
    Timeout(Duration),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, host: &Host, request: RemoteRequest) -> Result<HostReport, TransportError>;
}

/// Runs the agent over non-interactive, key-only ssh.
#[derive(Debug, Clone)]
pub struct SshTransport {
    pub key: PathBuf,
    pub remote_binary: String,
    pub connect_timeout_secs: u64,
}

impl SshTransport {
    /// `timeout` is the per-host budget; `None` means unbounded.
    pub fn new(key: impl Into<PathBuf>, remote_binary: impl Into<String>, timeout: Option<Duration>) -> Self {
        let connect_timeout_secs = timeout
            .map(|t| t.as_secs().clamp(1, MAX_CONNECT_TIMEOUT_SECS))
            .unwrap_or(MAX_CONNECT_TIMEOUT_SECS);
        Self {
            key: key.into(),
            remote_binary: remote_binary.into(),
            connect_timeout_secs,
        }
    }

    pub fn command_args(&self, host: &Host, request: RemoteRequest) -> Vec<String> {
        let mut args = vec!["-i".to_string(), self.key.display().to_string()];
        for option in [
            "IdentitiesOnly=yes".to_string(),
            "IdentityAgent=none".to_string(),
            "PreferredAuthentications=publickey".to_string(),
            "BatchMode=yes".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ] {
            args.push("-o".to_string());
            args.push(option);
        }
        args.push(host.destination());
        args.push(self.remote_binary.clone());
        args.extend(request.agent_args());
        args
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn execute(&self, host: &Host, request: RemoteRequest) -> Result<HostReport, TransportError> {
        let args = self.command_args(host, request);
        debug!(host = %host.name, ?args, "ssh");
        let output = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        interpret_output(
            output.status.code(),
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        )
    }
}

/// The agent exits non-zero on its own fatal errors but still prints its
/// JSON report, so a parseable stdout wins over the exit status.
pub fn interpret_output(status: Option<i32>, stdout: &str, stderr: &str) -> Result<HostReport, TransportError> {
    let stdout = stdout.trim();
    if status != Some(0) {
        if let Ok(report) = serde_json::from_str::<HostReport>(stdout) {
            return Ok(report);
        }
        let stderr = stderr.trim();
        let message = if !stderr.is_empty() {
            stderr.to_string()
        } else {
            match status {
                Some(code) => format!("ssh exited {}", code),
                None => "ssh terminated by signal".to_string(),
            }
        };
        return Err(TransportError::Exited(message));
    }
    Ok(serde_json::from_str(stdout)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> Host {
        Host::new("node1", "10.0.0.11", "ansible")
    }

    #[test]
    fn builds_batch_ssh_command() {
        let ssh = SshTransport::new("/keys/id_ed25519", "/usr/local/bin/reclaim", Some(Duration::from_secs(60)));
        let args = ssh.command_args(
            &host(),
            RemoteRequest::Cleanup {
                mode: WipeMode::Fast,
                dry_run: true,
            },
        );
        assert_eq!(&args[..2], ["-i", "/keys/id_ed25519"]);
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        let tail: Vec<&str> = args[args.len() - 7..].iter().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec![
                "ansible@10.0.0.11",
                "/usr/local/bin/reclaim",
                "agent",
                "cleanup",
                "--mode",
                "fast",
                "--dry-run"
            ]
        );
    }

    #[test]
    fn connect_timeout_follows_host_budget() {
        assert_eq!(SshTransport::new("k", "reclaim", Some(Duration::from_secs(3))).connect_timeout_secs, 3);
        assert_eq!(SshTransport::new("k", "reclaim", None).connect_timeout_secs, 10);
        assert_eq!(
            RemoteRequest::Inventory.agent_args(),
            vec!["agent".to_string(), "inventory".to_string()]
        );
        let live = RemoteRequest::Cleanup {
            mode: WipeMode::Full,
            dry_run: false,
        };
        assert_eq!(live.agent_args()[2..], ["--mode", "full", "--yes"]);
    }

    #[test]
    fn failed_agent_report_is_kept() {
        let stdout = r#"{"ok": false, "error": "sudo -n failed", "actions": []}"#;
        let report = interpret_output(Some(1), stdout, "").unwrap();
        assert!(!report.ok);
        assert_eq!(report.error.as_deref(), Some("sudo -n failed"));
    }

    #[test]
    fn connection_failure_uses_stderr() {
        let err = interpret_output(Some(255), "", "ssh: connect to host 10.0.0.11 port 22: No route to host\n")
            .unwrap_err();
        assert_eq!(err.to_string(), "ssh: connect to host 10.0.0.11 port 22: No route to host");

        let err = interpret_output(Some(255), "", "").unwrap_err();
        assert_eq!(err.to_string(), "ssh exited 255");
    }

    #[test]
    fn garbage_output_is_a_parse_error() {
        let err = interpret_output(Some(0), "bash: reclaim: command not found", "").unwrap_err();
        assert!(matches!(err, TransportError::InvalidOutput(_)));
        assert!(err.to_string().starts_with("failed to parse JSON output"));
    }

    #[test]
    fn timeout_message_uses_seconds() {
        assert_eq!(TransportError::Timeout(Duration::from_secs(30)).to_string(), "timeout after 30s");
        assert_eq!(
            TransportError::Timeout(Duration::from_millis(100)).to_string(),
            "timeout after 0.1s"
        );
    }
}
