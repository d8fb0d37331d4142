use reclaim_core::{HostReport, WipeMode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub mod hosts;
pub mod transport;

pub use hosts::{load_hosts, parse_hosts, select_hosts, DispatchError, Host};
pub use transport::{interpret_output, RemoteRequest, SshTransport, Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Hosts worked on at the same time; at least one.
    pub parallel: usize,
    /// Per-host budget. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl DispatchConfig {
    /// A zero-second timeout means no timeout.
    pub fn new(parallel: usize, timeout_secs: u64) -> Self {
        Self {
            parallel: parallel.max(1),
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        }
    }
}

/// One entry of the aggregate report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostResult {
    pub host: Host,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<WipeMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<HostReport>,
}

impl HostResult {
    fn new(host: Host, request: RemoteRequest, outcome: Result<HostReport, TransportError>) -> Self {
        let (dry_run, mode) = match request {
            RemoteRequest::Inventory => (None, None),
            RemoteRequest::Cleanup { mode, dry_run } => (Some(dry_run), Some(mode)),
        };
        let (data, error) = match outcome {
            Ok(report) => (Some(report), None),
            Err(err) => (None, Some(err.to_string())),
        };
        Self {
            host,
            dry_run,
            mode,
            error,
            data,
        }
    }

    /// Unreachable, timed out, or the agent itself reported `ok: false`.
    pub fn failed(&self) -> bool {
        self.error.is_some() || !self.data.as_ref().map(|d| d.ok).unwrap_or(false)
    }

    /// Only transport-level failures; the host answered nothing usable.
    pub fn unreachable(&self) -> bool {
        self.error.is_some()
    }
}

/// Runs `request` on every host with at most `config.parallel` in flight.
/// Every host gets exactly one result; results come back sorted by name.
pub async fn dispatch(
    hosts: Vec<Host>,
    request: RemoteRequest,
    transport: Arc<dyn Transport>,
    config: DispatchConfig,
) -> Vec<HostResult> {
    let permits = Arc::new(Semaphore::new(config.parallel.max(1)));
    let mut pending: HashMap<String, Host> = HashMap::new();
    let mut tasks = JoinSet::new();

    for host in hosts {
        if pending.contains_key(&host.name) {
            warn!(host = %host.name, "duplicate host skipped");
            continue;
        }
        pending.insert(host.name.clone(), host.clone());
        let permits = Arc::clone(&permits);
        let transport = Arc::clone(&transport);
        tasks.spawn(async move {
            let outcome = match permits.acquire_owned().await {
                Ok(_permit) => run_one(transport.as_ref(), &host, request, config.timeout).await,
                Err(_) => Err(TransportError::Exited("worker pool closed".to_string())),
            };
            HostResult::new(host, request, outcome)
        });
    }

    let mut results = Vec::with_capacity(pending.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => {
                if result.failed() {
                    warn!(host = %result.host.name, error = ?result.error, "host failed");
                } else {
                    info!(host = %result.host.name, "host finished");
                }
                pending.remove(&result.host.name);
                results.push(result);
            }
            Err(err) => error!(error = %err, "host worker panicked"),
        }
    }
    // Hosts whose worker died still get a row.
    for (_, host) in pending {
        let outcome = Err(TransportError::Exited("host worker failed".to_string()));
        results.push(HostResult::new(host, request, outcome));
    }

    results.sort_by(|a, b| a.host.name.cmp(&b.host.name));
    results
}

async fn run_one(
    transport: &dyn Transport,
    host: &Host,
    request: RemoteRequest,
    timeout: Option<Duration>,
) -> Result<HostReport, TransportError> {
    info!(host = %host.name, ip = %host.ip, "dispatching");
    match timeout {
        Some(limit) => tokio::time::timeout(limit, transport.execute(host, request))
            .await
            .unwrap_or(Err(TransportError::Timeout(limit))),
        None => transport.execute(host, request).await,
    }
}
