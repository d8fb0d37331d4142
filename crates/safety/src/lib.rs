use reclaim_core::{MountSourceResolver, TopologyGraph, Warning};
pub use reclaim_core::{BindingState, MountBinding};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use thiserror::Error;
use tracing::{debug, warn};

/// Mountpoints whose backing disks are never wiped and which are never
/// unmounted, whatever the classification says.
pub const PROTECTED_MOUNTPOINTS: [&str; 4] = ["/", "/boot", "/boot/efi", "/var"];

const PHYSICAL_DISK_PREFIXES: [&str; 7] = ["sd", "vd", "xvd", "nvme", "mmcblk", "hd", "dasd"];

pub fn is_protected_mountpoint(path: &str) -> bool {
    PROTECTED_MOUNTPOINTS.contains(&path)
}

pub fn is_physical_disk_name(name: &str) -> bool {
    PHYSICAL_DISK_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClassificationError {
    #[error("OS disk detection returned empty set; refusing to continue")]
    NoOsDisks { bindings: Vec<MountBinding> },
}

impl ClassificationError {
    /// What was seen at each protected mountpoint before giving up.
    pub fn bindings(&self) -> &[MountBinding] {
        match self {
            Self::NoOsDisks { bindings } => bindings,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskClassification {
    pub os_disks: BTreeSet<String>,
    pub target_disks: Vec<String>,
    pub bindings: Vec<MountBinding>,
}

impl DiskClassification {
    pub fn is_os_disk(&self, name: &str) -> bool {
        self.os_disks.contains(name)
    }

    /// Mountpoint to mount source, for every protected mountpoint whose
    /// source could not be matched to an inventory node.
    pub fn unresolved(&self) -> BTreeMap<String, String> {
        unresolved_sources(&self.bindings)
    }

    pub fn unresolved_warning(&self) -> Option<Warning> {
        unresolved_warning(&self.bindings)
    }
}

/// `unresolved_mount_sources` warning for any binding that matched no
/// inventory node.
pub fn unresolved_warning(bindings: &[MountBinding]) -> Option<Warning> {
    let unresolved = unresolved_sources(bindings);
    if unresolved.is_empty() {
        return None;
    }
    Some(Warning::new("unresolved_mount_sources", json!(unresolved)))
}

/// `findmnt` reports btrfs subvolumes and bind mounts as `/dev/sda2[/@]`.
fn strip_fsroot(source: &str) -> &str {
    match source.find('[') {
        Some(idx) if idx > 0 && source.ends_with(']') => &source[..idx],
        _ => source,
    }
}

/// Maps a mount source to an inventory node name: exact path first, then
/// the base name of a `/dev/...` path. A trailing `[fsroot]` is ignored.
pub fn resolve_device_name(graph: &TopologyGraph, source: &str) -> Option<String> {
    let source = strip_fsroot(source.trim());
    if source.is_empty() {
        return None;
    }
    if let Some(name) = graph.name_for_path(source) {
        return Some(name.to_string());
    }
    if source.starts_with("/dev/") {
        let base = source.rsplit('/').next().unwrap_or("");
        if graph.node(base).is_some() {
            return Some(base.to_string());
        }
    }
    None
}

/// Every `disk` node reachable upward from `name` through any parent chain.
pub fn disks_for_device(graph: &TopologyGraph, name: &str) -> BTreeSet<String> {
    let mut disks = BTreeSet::new();
    let mut seen = HashSet::new();
    let mut queue = vec![name.to_string()];
    while let Some(current) = queue.pop() {
        if !seen.insert(current.clone()) {
            continue;
        }
        let Some(node) = graph.node(&current) else {
            continue;
        };
        if node.is_disk() {
            disks.insert(current);
            continue;
        }
        queue.extend(graph.parents(&current).map(|parent| parent.to_string()));
    }
    disks
}

pub fn bind_mountpoints<R: MountSourceResolver + ?Sized>(
    graph: &TopologyGraph,
    resolver: &R,
) -> Vec<MountBinding> {
    PROTECTED_MOUNTPOINTS
        .iter()
        .map(|mountpoint| {
            let source = resolver.mount_source(mountpoint);
            let mut binding = MountBinding {
                mountpoint: mountpoint.to_string(),
                source: None,
                state: BindingState::NotMounted,
                device: None,
                disks: Vec::new(),
            };
            if let Some(source) = source {
                match resolve_device_name(graph, &source) {
                    Some(device) => {
                        binding.disks = disks_for_device(graph, &device).into_iter().collect();
                        binding.device = Some(device);
                        binding.state = BindingState::Resolved;
                    }
                    None => {
                        warn!(mountpoint, source = %source, "mount source not found in block inventory");
                        binding.state = BindingState::Unresolved;
                    }
                }
                binding.source = Some(source);
            }
            binding
        })
        .collect()
}

/// Physical disks that are not OS disks, sorted by name.
pub fn select_targets(graph: &TopologyGraph, os_disks: &BTreeSet<String>) -> Vec<String> {
    graph
        .disks()
        .filter(|node| is_physical_disk_name(&node.name))
        .filter(|node| !os_disks.contains(&node.name))
        .map(|node| node.name.clone())
        .collect()
}

pub fn classify<R: MountSourceResolver + ?Sized>(
    graph: &TopologyGraph,
    resolver: &R,
) -> Result<DiskClassification, ClassificationError> {
    let bindings = bind_mountpoints(graph, resolver);
    let os_disks: BTreeSet<String> = bindings
        .iter()
        .filter(|binding| binding.state == BindingState::Resolved)
        .flat_map(|binding| binding.disks.iter().cloned())
        .collect();
    if os_disks.is_empty() {
        return Err(ClassificationError::NoOsDisks { bindings });
    }
    let target_disks = select_targets(graph, &os_disks);
    debug!(?os_disks, ?target_disks, "classified disks");
    Ok(DiskClassification {
        os_disks,
        target_disks,
        bindings,
    })
}

fn unresolved_sources(bindings: &[MountBinding]) -> BTreeMap<String, String> {
    bindings
        .iter()
        .filter(|binding| binding.state == BindingState::Unresolved)
        .filter_map(|binding| {
            binding
                .source
                .clone()
                .map(|source| (binding.mountpoint.clone(), source))
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct SafetyContext {
    pub dry_run: bool,
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyDecision {
    Allow,
    Deny(String),
}

pub fn can_run_cleanup(ctx: &SafetyContext) -> SafetyDecision {
    if ctx.dry_run || ctx.confirmed {
        return SafetyDecision::Allow;
    }
    SafetyDecision::Deny(
        "Refusing to wipe disks without explicit confirmation. Re-run with --yes (THIS IS DESTRUCTIVE AND CANNOT BE UNDONE)."
            .to_string(),
    )
}

pub fn can_wipe_disk(classification: &DiskClassification, disk: &str) -> SafetyDecision {
    if classification.is_os_disk(disk) {
        return SafetyDecision::Deny(format!("Denied: {} backs an OS mountpoint", disk));
    }
    if !is_physical_disk_name(disk) {
        return SafetyDecision::Deny(format!("Denied: {} is not a physical disk name", disk));
    }
    if !classification.target_disks.iter().any(|target| target == disk) {
        return SafetyDecision::Deny(format!("Denied: {} was not selected as a target", disk));
    }
    SafetyDecision::Allow
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn mounts(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(mp, src)| (mp.to_string(), src.to_string()))
            .collect()
    }

    fn simple_inventory() -> Value {
        json!({"blockdevices": [
            {"name": "sda", "path": "/dev/sda", "type": "disk", "children": [
                {"name": "sda1", "path": "/dev/sda1", "type": "part", "mountpoints": ["/boot/efi"]},
                {"name": "sda2", "path": "/dev/sda2", "type": "part", "mountpoints": ["/"]}
            ]},
            {"name": "sdb", "path": "/dev/sdb", "type": "disk"},
            {"name": "nvme0n1", "path": "/dev/nvme0n1", "type": "disk"},
            {"name": "loop0", "path": "/dev/loop0", "type": "loop"},
            {"name": "sr0", "path": "/dev/sr0", "type": "rom"},
            {"name": "zram0", "path": "/dev/zram0", "type": "disk"}
        ]})
    }

    #[test]
    fn classifies_os_and_target_disks() {
        let graph = TopologyGraph::from_lsblk(&simple_inventory());
        let resolver = mounts(&[("/", "/dev/sda2"), ("/boot/efi", "/dev/sda1")]);
        let result = classify(&graph, &resolver).unwrap();
        assert_eq!(result.os_disks.iter().collect::<Vec<_>>(), vec!["sda"]);
        assert_eq!(result.target_disks, vec!["nvme0n1", "sdb"]);
        assert!(result.unresolved_warning().is_none());
        assert_eq!(result.bindings[1].state, BindingState::NotMounted);
        assert_eq!(result.bindings[0].disks, vec!["sda"]);
    }

    #[test]
    fn logical_volume_over_two_disks_protects_both() {
        let lv = json!({"name": "vg0-root", "kname": "dm-0", "path": "/dev/mapper/vg0-root", "type": "lvm"});
        let doc = json!({"blockdevices": [
            {"name": "sda", "path": "/dev/sda", "type": "disk", "children": [
                {"name": "sda1", "path": "/dev/sda1", "type": "part", "children": [lv.clone()]}]},
            {"name": "sdb", "path": "/dev/sdb", "type": "disk", "children": [
                {"name": "sdb1", "path": "/dev/sdb1", "type": "part", "children": [lv]}]},
            {"name": "sdc", "path": "/dev/sdc", "type": "disk"}
        ]});
        let graph = TopologyGraph::from_lsblk(&doc);
        let result = classify(&graph, &mounts(&[("/", "/dev/mapper/vg0-root")])).unwrap();
        assert_eq!(result.os_disks.iter().collect::<Vec<_>>(), vec!["sda", "sdb"]);
        assert_eq!(result.target_disks, vec!["sdc"]);
    }

    #[test]
    fn falls_back_to_base_name_for_dev_paths() {
        let doc = json!({"blockdevices": [
            {"name": "vda", "type": "disk", "children": [{"name": "vda1", "type": "part"}]},
            {"name": "vdb", "type": "disk"}
        ]});
        let graph = TopologyGraph::from_lsblk(&doc);
        assert_eq!(resolve_device_name(&graph, "/dev/vda1").as_deref(), Some("vda1"));
        assert_eq!(resolve_device_name(&graph, "vda1"), None);
        assert_eq!(resolve_device_name(&graph, ""), None);
    }

    #[test]
    fn unresolved_sources_warn_but_do_not_fail() {
        let graph = TopologyGraph::from_lsblk(&simple_inventory());
        let resolver = mounts(&[("/", "/dev/sda2"), ("/var", "server:/export/var")]);
        let result = classify(&graph, &resolver).unwrap();
        let warning = result.unresolved_warning().unwrap();
        assert_eq!(warning.warning, "unresolved_mount_sources");
        assert_eq!(warning.details, json!({"/var": "server:/export/var"}));
    }

    #[test]
    fn empty_os_disk_set_is_fatal() {
        let graph = TopologyGraph::from_lsblk(&simple_inventory());
        let err = classify(&graph, &mounts(&[("/", "overlay")])).unwrap_err();
        let root = &err.bindings()[0];
        assert_eq!(root.mountpoint, "/");
        assert_eq!(root.source.as_deref(), Some("overlay"));
        assert_eq!(root.state, BindingState::Unresolved);
        let warning = unresolved_warning(err.bindings()).unwrap();
        assert_eq!(warning.details, json!({"/": "overlay"}));

        let err = classify(&graph, &mounts(&[])).unwrap_err();
        assert!(err.bindings().iter().all(|b| b.state == BindingState::NotMounted));
        assert!(unresolved_warning(err.bindings()).is_none());
    }

    #[test]
    fn btrfs_subvolume_sources_resolve_to_their_partition() {
        let doc = json!({"blockdevices": [
            {"name": "sda", "path": "/dev/sda", "type": "disk", "children": [
                {"name": "sda1", "path": "/dev/sda1", "type": "part"},
                {"name": "sda2", "path": "/dev/sda2", "type": "part"}]},
            {"name": "sdb", "path": "/dev/sdb", "type": "disk", "children": [
                {"name": "sdb1", "path": "/dev/sdb1", "type": "part"}]},
            {"name": "sdc", "path": "/dev/sdc", "type": "disk"}
        ]});
        let graph = TopologyGraph::from_lsblk(&doc);
        let resolver = mounts(&[
            ("/", "/dev/sda2[/@]"),
            ("/var", "/dev/sda2[/@var]"),
            ("/boot", "/dev/sdb1"),
        ]);
        let result = classify(&graph, &resolver).unwrap();
        assert_eq!(result.os_disks.iter().collect::<Vec<_>>(), vec!["sda", "sdb"]);
        assert_eq!(result.target_disks, vec!["sdc"]);
        assert!(result.unresolved_warning().is_none());
        assert_eq!(result.bindings[0].device.as_deref(), Some("sda2"));
        assert_eq!(result.bindings[0].source.as_deref(), Some("/dev/sda2[/@]"));
        assert!(matches!(can_wipe_disk(&result, "sda"), SafetyDecision::Deny(_)));

        assert_eq!(resolve_device_name(&graph, "/dev/sdb1[/]").as_deref(), Some("sdb1"));
        assert_eq!(resolve_device_name(&graph, "[/@]"), None);
    }

    #[test]
    fn cyclic_parent_links_terminate() {
        let doc = json!({"blockdevices": [
            {"name": "a", "type": "part", "children": [{"name": "b", "type": "part", "children": [
                {"name": "a", "type": "part"}]}]}
        ]});
        let graph = TopologyGraph::from_lsblk(&doc);
        assert!(disks_for_device(&graph, "a").is_empty());
    }

    #[test]
    fn targets_never_overlap_os_disks() {
        let graph = TopologyGraph::from_lsblk(&simple_inventory());
        let result = classify(&graph, &mounts(&[("/", "/dev/sda2")])).unwrap();
        for target in &result.target_disks {
            assert!(!result.os_disks.contains(target));
            assert!(is_physical_disk_name(target));
        }
        assert!(!result.target_disks.contains(&"zram0".to_string()));
    }

    #[test]
    fn guard_denies_os_and_unselected_disks() {
        let graph = TopologyGraph::from_lsblk(&simple_inventory());
        let result = classify(&graph, &mounts(&[("/", "/dev/sda2")])).unwrap();
        assert!(matches!(can_wipe_disk(&result, "sda"), SafetyDecision::Deny(_)));
        assert!(matches!(can_wipe_disk(&result, "loop0"), SafetyDecision::Deny(_)));
        assert!(matches!(can_wipe_disk(&result, "sdz"), SafetyDecision::Deny(_)));
        assert_eq!(can_wipe_disk(&result, "sdb"), SafetyDecision::Allow);
    }

    #[test]
    fn denies_destructive_run_without_confirmation() {
        let ctx = SafetyContext {
            dry_run: false,
            confirmed: false,
        };
        assert!(matches!(can_run_cleanup(&ctx), SafetyDecision::Deny(_)));
    }

    #[test]
    fn allows_dry_run_or_confirmed() {
        let dry = SafetyContext {
            dry_run: true,
            confirmed: false,
        };
        let confirmed = SafetyContext {
            dry_run: false,
            confirmed: true,
        };
        assert_eq!(can_run_cleanup(&dry), SafetyDecision::Allow);
        assert_eq!(can_run_cleanup(&confirmed), SafetyDecision::Allow);
    }
}
