use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;

pub mod action;
pub mod graph;

pub use action::{ActionLog, ActionRecord, Outcome};
pub use graph::{DeviceNode, DeviceType, TopologyGraph};

pub const REPORT_SCHEMA_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WipeMode {
    /// Zero the first and last 16 MiB only.
    Fast,
    /// Discard the whole device, falling back to a full zero-fill.
    #[default]
    Full,
    /// Always zero-fill the whole device.
    Overwrite,
}

impl WipeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WipeMode::Fast => "fast",
            WipeMode::Full => "full",
            WipeMode::Overwrite => "overwrite",
        }
    }
}

impl fmt::Display for WipeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WipeMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(WipeMode::Fast),
            "full" => Ok(WipeMode::Full),
            "overwrite" => Ok(WipeMode::Overwrite),
            other => Err(format!("invalid wipe mode: {}", other)),
        }
    }
}

/// Maps a mountpoint to the device currently mounted there.
pub trait MountSourceResolver {
    /// `None` when nothing is mounted at `mountpoint`.
    fn mount_source(&self, mountpoint: &str) -> Option<String>;
}

impl MountSourceResolver for BTreeMap<String, String> {
    fn mount_source(&self, mountpoint: &str) -> Option<String> {
        self.get(mountpoint).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingState {
    NotMounted,
    Resolved,
    Unresolved,
}

/// How one protected mountpoint was traced back to physical disks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountBinding {
    pub mountpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub state: BindingState,
    /// Inventory node the source mapped to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DiskSummary {
    pub name: String,
    pub path: Option<String>,
    pub size_bytes: Option<u64>,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub vendor: Option<String>,
    pub rota: Option<bool>,
    pub tran: Option<String>,
    pub wwn: Option<String>,
}

impl DiskSummary {
    pub fn from_node(node: &DeviceNode) -> Self {
        Self {
            name: node.name.clone(),
            path: node.path.clone(),
            size_bytes: node.size_bytes,
            model: node.model.clone(),
            serial: node.serial.clone(),
            vendor: node.vendor.clone(),
            rota: node.rotational,
            tran: node.transport.clone(),
            wwn: node.wwn.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Warning {
    pub warning: String,
    #[serde(default)]
    pub details: Value,
}

impl Warning {
    pub fn new(warning: impl Into<String>, details: Value) -> Self {
        Self {
            warning: warning.into(),
            details,
        }
    }
}

/// Payload produced by the on-host routine and carried back to the
/// dispatcher.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct HostReport {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<WipeMode>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub actions: Vec<ActionRecord>,
    #[serde(default)]
    pub warnings: Vec<Warning>,
    #[serde(default)]
    pub os_disks: Vec<DiskSummary>,
    #[serde(default)]
    pub target_disks: Vec<DiskSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount_sources: Vec<MountBinding>,
}

impl HostReport {
    pub fn failure(error: impl Into<String>, actions: Vec<ActionRecord>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            actions,
            ..Self::default()
        }
    }

    pub fn target_names(&self) -> Vec<&str> {
        self.target_disks.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn os_disk_names(&self) -> Vec<&str> {
        self.os_disks.iter().map(|d| d.name.as_str()).collect()
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

pub fn now_utc_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
