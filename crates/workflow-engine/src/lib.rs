use reclaim_core::{
    ActionLog, ActionRecord, DeviceNode, DiskSummary, HostReport, Outcome, TopologyGraph, WipeMode,
};
use reclaim_host_linux::HostSystem;
use reclaim_safety::{
    can_wipe_disk, classify, is_protected_mountpoint, unresolved_warning, ClassificationError,
    DiskClassification, SafetyDecision,
};
use serde_json::json;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{info, warn};

pub mod steps;

pub use steps::{StepRunner, ToolCache};

const MIB: u64 = 1024 * 1024;
const EDGE_WIPE_MIB: u64 = 16;
const LVM_TOOLS: [&str; 5] = ["pvs", "vgs", "vgchange", "vgremove", "pvremove"];

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("failed to read block device inventory: {0:#}")]
    Inventory(anyhow::Error),
    #[error(transparent)]
    Classification(#[from] ClassificationError),
    #[error("sudo -n failed; ensure the SSH user has passwordless sudo")]
    SudoUnavailable,
}

/// What the cleanup stops, unmounts and deletes besides the target disks.
/// The default targets a Rook/Ceph storage node under Kubernetes.
#[derive(Debug, Clone)]
pub struct CleanupPolicy {
    pub services: Vec<String>,
    pub daemon_units: Vec<String>,
    pub daemon_processes: Vec<String>,
    pub mount_patterns: Vec<String>,
    pub state_dirs: Vec<String>,
    pub unit_dir: String,
    pub unit_file_globs: Vec<String>,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            services: strings(&["kubelet", "containerd", "docker"]),
            daemon_units: strings(&["ceph*", "rook*"]),
            daemon_processes: strings(&[
                "ceph-mon", "ceph-osd", "ceph-mgr", "ceph-mds", "radosgw", "ceph",
            ]),
            mount_patterns: strings(&["ceph", "rook"]),
            state_dirs: strings(&["/var/lib/rook", "/var/lib/ceph", "/etc/ceph", "/var/log/ceph"]),
            unit_dir: "/etc/systemd/system".to_string(),
            unit_file_globs: strings(&["ceph*.service", "rook*.service"]),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CleanupParams {
    pub mode: WipeMode,
    pub dry_run: bool,
    pub policy: CleanupPolicy,
}

/// Classification only: which disks back the OS and which are free.
pub fn run_inventory(host: &dyn HostSystem) -> HostReport {
    let graph = match load_graph(host) {
        Ok(graph) => graph,
        Err(err) => return HostReport::failure(err.to_string(), Vec::new()),
    };
    let classification = match classify(&graph, host) {
        Ok(classification) => classification,
        Err(err) => {
            warn!(error = %err, "inventory aborted");
            return HostReport {
                warnings: unresolved_warning(err.bindings()).into_iter().collect(),
                mount_sources: err.bindings().to_vec(),
                ..HostReport::failure(err.to_string(), Vec::new())
            };
        }
    };
    HostReport {
        ok: true,
        hostname: Some(host.hostname()),
        warnings: classification.unresolved_warning().into_iter().collect(),
        os_disks: summaries(&graph, classification.os_disks.iter()),
        target_disks: summaries(&graph, classification.target_disks.iter()),
        mount_sources: classification.bindings,
        ..HostReport::default()
    }
}

/// Classifies the host's disks and wipes every non-OS physical disk.
/// Fatal preconditions yield `ok: false` with whatever was recorded so far.
pub fn run_cleanup(host: &dyn HostSystem, params: &CleanupParams) -> HostReport {
    let mut log = ActionLog::new();
    let graph = match load_graph(host) {
        Ok(graph) => graph,
        Err(err) => return cleanup_failure(err, log, params),
    };
    let classification = match classify(&graph, host) {
        Ok(classification) => classification,
        Err(err) => {
            log.push(detected_record(&BTreeSet::new(), &[]));
            return classification_failure(err, log, params);
        }
    };
    log.push(detected_record(
        &classification.os_disks,
        &classification.target_disks,
    ));
    info!(
        os_disks = ?classification.os_disks,
        target_disks = ?classification.target_disks,
        mode = %params.mode,
        dry_run = params.dry_run,
        "disk classification complete"
    );

    let mut report = HostReport {
        ok: true,
        hostname: Some(host.hostname()),
        mode: Some(params.mode),
        dry_run: params.dry_run,
        os_disks: summaries(&graph, classification.os_disks.iter()),
        target_disks: summaries(&graph, classification.target_disks.iter()),
        mount_sources: classification.bindings.clone(),
        ..HostReport::default()
    };

    let mut runner = StepRunner::new(host, params.dry_run, log);
    if let Some(warning) = classification.unresolved_warning() {
        runner.warn(warning);
    }

    if classification.target_disks.is_empty() {
        info!("no target disks; nothing to wipe");
        let (log, warnings) = runner.into_parts();
        report.skipped = true;
        report.actions = log.into_records();
        report.warnings = warnings;
        return report;
    }

    if let Err(err) = require_sudo(&mut runner) {
        let (log, _) = runner.into_parts();
        return cleanup_failure(err, log, params);
    }

    stop_services(&mut runner, &params.policy);
    stop_storage_daemons(&mut runner, &params.policy);
    umount_storage_mounts(&mut runner, &params.policy);

    for disk in &classification.target_disks {
        wipe_disk(&mut runner, &graph, &classification, disk, params.mode);
    }

    remove_state_dirs(&mut runner, &params.policy);
    remove_unit_files(&mut runner, &params.policy);

    let (log, warnings) = runner.into_parts();
    report.actions = log.into_records();
    report.warnings = warnings;
    report
}

fn load_graph(host: &dyn HostSystem) -> Result<TopologyGraph, CleanupError> {
    let document = host.block_devices().map_err(CleanupError::Inventory)?;
    Ok(TopologyGraph::from_lsblk(&document))
}

fn cleanup_failure(err: CleanupError, log: ActionLog, params: &CleanupParams) -> HostReport {
    warn!(error = %err, "cleanup aborted before any wipe");
    HostReport {
        mode: Some(params.mode),
        dry_run: params.dry_run,
        ..HostReport::failure(err.to_string(), log.into_records())
    }
}

/// Keeps what each protected mountpoint resolved to, so an empty OS disk
/// set can be diagnosed from the report alone.
fn classification_failure(err: ClassificationError, log: ActionLog, params: &CleanupParams) -> HostReport {
    let warnings = unresolved_warning(err.bindings()).into_iter().collect();
    let mount_sources = err.bindings().to_vec();
    HostReport {
        warnings,
        mount_sources,
        ..cleanup_failure(err.into(), log, params)
    }
}

fn detected_record(os_disks: &BTreeSet<String>, target_disks: &[String]) -> ActionRecord {
    ActionRecord::new("detected", None, Outcome::Info).with_details(json!({
        "os_disks": os_disks,
        "target_disks": target_disks,
    }))
}

fn summaries<'s>(graph: &TopologyGraph, names: impl Iterator<Item = &'s String>) -> Vec<DiskSummary> {
    names
        .map(|name| match graph.node(name) {
            Some(node) => DiskSummary::from_node(node),
            None => DiskSummary {
                name: name.clone(),
                path: None,
                size_bytes: None,
                model: None,
                serial: None,
                vendor: None,
                rota: None,
                tran: None,
                wwn: None,
            },
        })
        .collect()
}

fn require_sudo(runner: &mut StepRunner<'_>) -> Result<(), CleanupError> {
    if runner.dry_run_only("sudo_check", None) {
        return Ok(());
    }
    let output = runner.host().run("sudo", &["-n", "true"]).ok();
    let rc = output.as_ref().and_then(|out| out.status);
    if rc != Some(0) {
        return Err(CleanupError::SudoUnavailable);
    }
    runner.note("sudo_check", None, None);
    Ok(())
}

fn stop_services(runner: &mut StepRunner<'_>, policy: &CleanupPolicy) {
    for service in &policy.services {
        runner.attempt("service_stop", Some(service.as_str()), "systemctl", &["stop", service.as_str()]);
    }
}

fn stop_storage_daemons(runner: &mut StepRunner<'_>, policy: &CleanupPolicy) {
    // systemctl expands unit globs itself, no shell involved.
    for unit in &policy.daemon_units {
        runner.attempt("daemon_stop", Some(unit.as_str()), "systemctl", &["stop", unit.as_str()]);
    }
    for process in &policy.daemon_processes {
        runner.attempt("process_kill", Some(process.as_str()), "pkill", &["-9", process.as_str()]);
    }
}

fn umount_storage_mounts(runner: &mut StepRunner<'_>, policy: &CleanupPolicy) {
    let mountpoints: BTreeSet<String> = runner
        .host()
        .mounts()
        .into_iter()
        .filter(|entry| {
            policy.mount_patterns.iter().any(|pattern| {
                entry.source.contains(pattern.as_str())
                    || entry.mount_point.contains(pattern.as_str())
                    || entry.fs_type.contains(pattern.as_str())
            })
        })
        .map(|entry| entry.mount_point)
        .collect();
    if mountpoints.is_empty() {
        return;
    }
    runner.note(
        "storage_mounts_detected",
        None,
        Some(json!({ "mountpoints": mountpoints })),
    );
    umount_paths(runner, mountpoints.iter().map(|mp| mp.as_str()));
}

fn umount_paths<'m>(runner: &mut StepRunner<'_>, mountpoints: impl Iterator<Item = &'m str>) {
    for mountpoint in mountpoints {
        if mountpoint.is_empty() || is_protected_mountpoint(mountpoint) {
            continue;
        }
        runner.attempt("umount", Some(mountpoint), "umount", &["-lf", mountpoint]);
    }
}

fn wipe_disk(
    runner: &mut StepRunner<'_>,
    graph: &TopologyGraph,
    classification: &DiskClassification,
    disk: &str,
    mode: WipeMode,
) {
    let Some(node) = graph.node(disk) else {
        runner.skip("target_disk", Some(disk), "not_in_inventory");
        return;
    };
    let path = node.device_path();
    let disk_path = path.as_str();
    runner.note(
        "target_disk",
        Some(disk),
        serde_json::to_value(DiskSummary::from_node(node)).ok(),
    );
    if let SafetyDecision::Deny(reason) = can_wipe_disk(classification, disk) {
        warn!(disk, %reason, "safety guard refused disk");
        runner.skip("target_disk_denied", Some(disk), &reason);
        return;
    }
    info!(disk, path = %disk_path, %mode, "wiping disk");

    let nodes = graph.descendants(disk);

    let mounts: BTreeSet<&str> = nodes
        .iter()
        .flat_map(|n| n.mountpoints.iter().map(|m| m.as_str()))
        .collect();
    umount_paths(runner, mounts.into_iter());

    lvm_cleanup(runner, disk_path);
    remove_mappings(runner, &nodes);

    // Innermost layers first so stacked signatures go before the ones below.
    for dev_path in nodes.iter().rev().filter_map(|n| n.path.as_deref()) {
        runner.attempt("wipefs", Some(dev_path), "wipefs", &["-a", dev_path]);
    }

    zap_partition_table(runner, disk_path);

    match mode {
        WipeMode::Fast => wipe_edges(runner, node, disk_path),
        WipeMode::Full => wipe_full(runner, disk_path),
        WipeMode::Overwrite => wipe_overwrite(runner, disk_path),
    }

    runner.attempt("partprobe", Some(disk_path), "partprobe", &[disk_path]);
    runner.attempt("udevadm_settle", Some(disk_path), "udevadm", &["settle"]);
}

fn lvm_cleanup(runner: &mut StepRunner<'_>, disk_path: &str) {
    let mut available = true;
    for tool in LVM_TOOLS {
        available &= runner.require_tool(tool);
    }
    if !available {
        runner.skip("lvm_cleanup", Some(disk_path), "lvm_tools_missing");
        return;
    }
    if runner.dry_run_only("lvm_cleanup", Some(disk_path)) {
        return;
    }

    runner.attempt("vgchange_deactivate", None, "vgchange", &["-an"]);

    let listing = runner.sudo("pvs", &["--noheadings", "-o", "pv_name,vg_name"]);
    let Some(listing) = listing.filter(|out| out.success()) else {
        runner.skip("lvm_cleanup", Some(disk_path), "pvs_failed");
        return;
    };
    let (vgs, pvs) = lvm_members_on_disk(&listing.stdout, disk_path);
    runner.note(
        "lvm_found",
        Some(disk_path),
        Some(json!({ "vgs": vgs, "pvs": pvs })),
    );
    for vg in &vgs {
        runner.attempt("vgremove", Some(vg.as_str()), "vgremove", &["-f", vg.as_str()]);
    }
    for pv in &pvs {
        runner.attempt("pvremove", Some(pv.as_str()), "pvremove", &["-ff", "-y", pv.as_str()]);
    }
}

/// Volume groups and physical volumes living on `disk_path` or one of its
/// partitions, from `pvs --noheadings -o pv_name,vg_name` output.
pub fn lvm_members_on_disk(listing: &str, disk_path: &str) -> (Vec<String>, Vec<String>) {
    let mut vgs = BTreeSet::new();
    let mut pvs = BTreeSet::new();
    for line in listing.lines() {
        let mut parts = line.split_whitespace();
        let Some(pv) = parts.next() else {
            continue;
        };
        if !is_on_disk(pv, disk_path) {
            continue;
        }
        pvs.insert(pv.to_string());
        if let Some(vg) = parts.next() {
            vgs.insert(vg.to_string());
        }
    }
    (vgs.into_iter().collect(), pvs.into_iter().collect())
}

/// `/dev/sdb` owns `/dev/sdb` and `/dev/sdb1`, not `/dev/sdba`;
/// `/dev/nvme0n1` owns `/dev/nvme0n1p2`, not `/dev/nvme0n10`.
fn is_on_disk(device: &str, disk_path: &str) -> bool {
    let Some(rest) = device.strip_prefix(disk_path) else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    let digits = if disk_path.ends_with(|c: char| c.is_ascii_digit()) {
        match rest.strip_prefix('p') {
            Some(digits) => digits,
            None => return false,
        }
    } else {
        rest
    };
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

fn remove_mappings(runner: &mut StepRunner<'_>, nodes: &[&DeviceNode]) {
    for node in nodes.iter().filter(|n| n.device_type.is_mapped()) {
        let Some(kname) = node.kernel_name.as_deref() else {
            continue;
        };
        runner.attempt("dmsetup_remove", Some(kname), "dmsetup", &["remove", "--force", kname]);
    }
}

fn zap_partition_table(runner: &mut StepRunner<'_>, disk_path: &str) {
    if !runner.require_tool("sgdisk") {
        runner.skip("sgdisk_zap", Some(disk_path), "sgdisk_missing");
        return;
    }
    runner.attempt(
        "sgdisk_zap",
        Some(disk_path),
        "sgdisk",
        &["--zap-all", "--clear", disk_path],
    );
}

fn wipe_edges(runner: &mut StepRunner<'_>, node: &DeviceNode, disk_path: &str) {
    let of = format!("of={}", disk_path);
    let count = format!("count={}", EDGE_WIPE_MIB);
    runner.attempt(
        "dd_start",
        Some(disk_path),
        "dd",
        &["if=/dev/zero", of.as_str(), "bs=1M", count.as_str(), "conv=fsync"],
    );

    let size_bytes = if runner.dry_run() {
        node.size_bytes
    } else {
        device_size(runner, disk_path).or(node.size_bytes)
    };
    let Some(size_bytes) = size_bytes else {
        runner.skip("dd_end", Some(disk_path), "size_unknown");
        return;
    };
    if size_bytes <= 2 * EDGE_WIPE_MIB * MIB {
        runner.skip("dd_end", Some(disk_path), "disk_too_small");
        return;
    }
    let seek_mib = size_bytes / MIB - EDGE_WIPE_MIB;
    let seek = format!("seek={}", seek_mib);
    runner.attempt_with_details(
        "dd_end",
        Some(disk_path),
        Some(json!({ "seek_mib": seek_mib })),
        "dd",
        &["if=/dev/zero", of.as_str(), "bs=1M", count.as_str(), seek.as_str(), "conv=fsync"],
    );
}

fn device_size(runner: &StepRunner<'_>, disk_path: &str) -> Option<u64> {
    runner
        .sudo("blockdev", &["--getsize64", disk_path])
        .filter(|out| out.success())
        .and_then(|out| out.stdout.trim().parse().ok())
}

fn wipe_full(runner: &mut StepRunner<'_>, disk_path: &str) {
    if runner.require_tool("blkdiscard") {
        let output = runner.attempt("blkdiscard_full", Some(disk_path), "blkdiscard", &["-f", disk_path]);
        if runner.dry_run() || output.map(|out| out.success()).unwrap_or(false) {
            return;
        }
    } else {
        runner.skip("blkdiscard_full", Some(disk_path), "blkdiscard_missing");
    }
    zero_fill(runner, "dd_full", disk_path);
}

fn wipe_overwrite(runner: &mut StepRunner<'_>, disk_path: &str) {
    zero_fill(runner, "dd_overwrite", disk_path);
}

/// Writes zeros over the whole device. Slow on large rotational disks.
fn zero_fill(runner: &mut StepRunner<'_>, action: &str, disk_path: &str) {
    if !runner.dry_run() {
        runner.note(&format!("{}_start", action), Some(disk_path), None);
    }
    let of = format!("of={}", disk_path);
    runner.attempt(
        action,
        Some(disk_path),
        "dd",
        &["if=/dev/zero", of.as_str(), "bs=64M", "status=none", "conv=fsync"],
    );
}

fn remove_state_dirs(runner: &mut StepRunner<'_>, policy: &CleanupPolicy) {
    for dir in &policy.state_dirs {
        runner.attempt("rm_rf", Some(dir.as_str()), "rm", &["-rf", dir.as_str()]);
    }
}

fn remove_unit_files(runner: &mut StepRunner<'_>, policy: &CleanupPolicy) {
    for glob in &policy.unit_file_globs {
        runner.attempt(
            "unit_files_remove",
            Some(glob.as_str()),
            "find",
            &[policy.unit_dir.as_str(), "-maxdepth", "1", "-name", glob.as_str(), "-delete"],
        );
    }
    runner.attempt("daemon_reload", None, "systemctl", &["daemon-reload"]);
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}
