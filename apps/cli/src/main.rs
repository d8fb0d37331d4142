use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use reclaim_core::{HostReport, WipeMode};
use reclaim_dispatch::{dispatch, load_hosts, select_hosts, DispatchConfig, RemoteRequest, SshTransport};
use reclaim_host_linux::LinuxHost;
use reclaim_report::AggregateReport;
use reclaim_safety::{can_run_cleanup, SafetyContext, SafetyDecision};
use reclaim_workflow_engine::{run_cleanup, run_inventory, CleanupParams};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

mod logging;

const EXIT_USAGE: u8 = 1;
const EXIT_HOST_FAILURES: u8 = 2;

#[derive(Parser)]
#[command(
    name = "reclaim",
    about = "Wipe non-OS disks across cluster nodes, leaving the disks that back the OS alone"
)]
struct Cli {
    #[arg(long, global = true, env = "RECLAIM_LOG", default_value = "info")]
    log_level: String,
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs on the node itself and prints one JSON report to stdout.
    #[command(subcommand)]
    Agent(AgentCommand),
    /// Collect the non-OS disk inventory of every node.
    Inventory(InventoryArgs),
    /// Wipe every non-OS physical disk on every node.
    Cleanup(CleanupArgs),
}

#[derive(Subcommand)]
enum AgentCommand {
    Inventory,
    Cleanup(AgentCleanupArgs),
}

#[derive(Args)]
struct AgentCleanupArgs {
    #[arg(long, default_value = "full")]
    mode: WipeMode,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    yes: bool,
}

#[derive(Args)]
struct FleetArgs {
    /// Kubespray/Ansible hosts.yml.
    #[arg(long)]
    hosts_file: PathBuf,
    #[arg(long, env = "RECLAIM_SSH_KEY")]
    ssh_key: PathBuf,
    /// Comma separated host names from the hosts file.
    #[arg(long)]
    limit: Option<String>,
    /// Path of the reclaim binary on the nodes.
    #[arg(long, env = "RECLAIM_REMOTE_BINARY", default_value = "reclaim")]
    remote_binary: String,
}

#[derive(Args)]
struct InventoryArgs {
    #[command(flatten)]
    fleet: FleetArgs,
    /// Per-host timeout in seconds.
    #[arg(long, env = "RECLAIM_TIMEOUT", default_value_t = 30)]
    timeout: u64,
    #[arg(long, env = "RECLAIM_PARALLEL", default_value_t = 12)]
    parallel: usize,
    #[arg(long, default_value = ".artifacts/non_os_disks_report.json")]
    output_json: PathBuf,
    #[arg(long, default_value = ".artifacts/non_os_disks_report.md")]
    output_md: PathBuf,
}

#[derive(Args)]
struct CleanupArgs {
    #[command(flatten)]
    fleet: FleetArgs,
    /// Show what would run; touch nothing.
    #[arg(long)]
    dry_run: bool,
    /// Required without --dry-run. Wiping cannot be undone.
    #[arg(long)]
    yes: bool,
    /// fast: signatures and disk edges; full: discard or zero the whole
    /// disk; overwrite: zero every byte.
    #[arg(long, default_value = "full")]
    mode: WipeMode,
    /// Per-host timeout in seconds; 0 waits forever.
    #[arg(long, env = "RECLAIM_TIMEOUT", default_value_t = 60)]
    timeout: u64,
    #[arg(long, env = "RECLAIM_PARALLEL", default_value_t = 8)]
    parallel: usize,
    #[arg(long, default_value = ".artifacts/disk_cleanup_report.json")]
    output_json: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = logging::init_logging(&cli.log_level, cli.log_json) {
        eprintln!("error: {err:#}");
        return ExitCode::from(EXIT_USAGE);
    }
    match run(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_USAGE)
        }
    }
}

async fn run(command: Command) -> Result<ExitCode> {
    match command {
        Command::Agent(AgentCommand::Inventory) => {
            let report = run_inventory(&LinuxHost::new());
            print_agent_report(&report)
        }
        Command::Agent(AgentCommand::Cleanup(args)) => {
            confirm(args.dry_run, args.yes)?;
            let params = CleanupParams {
                mode: args.mode,
                dry_run: args.dry_run,
                ..CleanupParams::default()
            };
            let report = run_cleanup(&LinuxHost::new(), &params);
            print_agent_report(&report)
        }
        Command::Inventory(args) => inventory(args).await,
        Command::Cleanup(args) => cleanup(args).await,
    }
}

fn print_agent_report(report: &HostReport) -> Result<ExitCode> {
    println!("{}", serde_json::to_string(report)?);
    Ok(if report.ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_USAGE)
    })
}

fn confirm(dry_run: bool, yes: bool) -> Result<()> {
    match can_run_cleanup(&SafetyContext {
        dry_run,
        confirmed: yes,
    }) {
        SafetyDecision::Allow => Ok(()),
        SafetyDecision::Deny(reason) => Err(anyhow!(reason)),
    }
}

async fn inventory(args: InventoryArgs) -> Result<ExitCode> {
    let config = DispatchConfig::new(args.parallel, args.timeout);
    let report = fan_out(&args.fleet, RemoteRequest::Inventory, config).await?;
    report.write_json(&args.output_json)?;
    report.write_markdown(&args.output_md)?;
    info!(json = %args.output_json.display(), markdown = %args.output_md.display(), "reports written");

    let status = exit_status(&report);
    if status != 0 {
        eprintln!(
            "[WARN] {}/{} hosts failed or were unreachable. See {}",
            report.failures(),
            report.results.len(),
            args.output_md.display()
        );
    }
    Ok(ExitCode::from(status))
}

async fn cleanup(args: CleanupArgs) -> Result<ExitCode> {
    confirm(args.dry_run, args.yes)?;
    let request = RemoteRequest::Cleanup {
        mode: args.mode,
        dry_run: args.dry_run,
    };
    let config = DispatchConfig::new(args.parallel, args.timeout);
    let report = fan_out(&args.fleet, request, config).await?;
    report.write_json(&args.output_json)?;
    info!(json = %args.output_json.display(), "report written");

    let status = exit_status(&report);
    if status != 0 {
        eprintln!(
            "[ERROR] cleanup had failures on {}/{} hosts. See {}",
            report.failures(),
            report.results.len(),
            args.output_json.display()
        );
    }
    Ok(ExitCode::from(status))
}

/// Any failed or unreachable host fails the whole run.
fn exit_status(report: &AggregateReport) -> u8 {
    if report.failures() > 0 {
        EXIT_HOST_FAILURES
    } else {
        0
    }
}

async fn fan_out(fleet: &FleetArgs, request: RemoteRequest, config: DispatchConfig) -> Result<AggregateReport> {
    require_file(&fleet.hosts_file, "hosts file")?;
    require_file(&fleet.ssh_key, "ssh key")?;

    let hosts = select_hosts(load_hosts(&fleet.hosts_file)?, fleet.limit.as_deref())?;
    if hosts.is_empty() {
        warn!(hosts_file = %fleet.hosts_file.display(), "no hosts selected");
    }
    info!(hosts = hosts.len(), parallel = config.parallel, ?request, "starting");

    let transport = Arc::new(SshTransport::new(&fleet.ssh_key, &fleet.remote_binary, config.timeout));
    let results = dispatch(hosts, request, transport, config).await;
    Ok(AggregateReport::new(results))
}

fn require_file(path: &Path, what: &str) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(anyhow!("{} not found: {}", what, path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reclaim_dispatch::{Host, HostResult};

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn cleanup_defaults_match_fleet_tooling() {
        let cli = Cli::try_parse_from([
            "reclaim",
            "cleanup",
            "--hosts-file",
            "hosts.yml",
            "--ssh-key",
            "id_ed25519",
            "--dry-run",
        ])
        .unwrap();
        let Command::Cleanup(args) = cli.command else {
            panic!("expected cleanup");
        };
        assert_eq!(args.mode, WipeMode::Full);
        assert!(args.dry_run);
        assert!(!args.yes);
    }

    #[test]
    fn agent_cleanup_parses_mode() {
        let cli = Cli::try_parse_from(["reclaim", "agent", "cleanup", "--mode", "FAST", "--dry-run"]).unwrap();
        let Command::Agent(AgentCommand::Cleanup(args)) = cli.command else {
            panic!("expected agent cleanup");
        };
        assert_eq!(args.mode, WipeMode::Fast);
        assert!(Cli::try_parse_from(["reclaim", "agent", "cleanup", "--mode", "quick"]).is_err());
    }

    #[test]
    fn live_cleanup_needs_confirmation() {
        assert!(confirm(false, false).is_err());
        assert!(confirm(false, true).is_ok());
        assert!(confirm(true, false).is_ok());
    }

    fn result(name: &str, error: Option<&str>) -> HostResult {
        HostResult {
            host: Host::new(name, "10.0.0.1", "ansible"),
            dry_run: Some(true),
            mode: Some(WipeMode::Fast),
            error: error.map(str::to_string),
            data: error.is_none().then(|| HostReport {
                ok: true,
                ..HostReport::default()
            }),
        }
    }

    #[test]
    fn one_timed_out_host_fails_the_run() {
        let report = AggregateReport::new(vec![
            result("node-a", None),
            result("node-b", Some("timeout after 0.1s")),
            result("node-c", None),
        ]);
        assert_eq!(report.failures(), 1);
        assert_eq!(exit_status(&report), EXIT_HOST_FAILURES);

        let healthy = AggregateReport::new(vec![result("node-a", None), result("node-c", None)]);
        assert_eq!(exit_status(&healthy), 0);
        assert_eq!(exit_status(&AggregateReport::new(Vec::new())), 0);
    }

    #[test]
    fn missing_inputs_are_usage_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = require_file(&dir.path().join("hosts.yml"), "hosts file").unwrap_err();
        assert!(err.to_string().starts_with("hosts file not found"));
    }
}
