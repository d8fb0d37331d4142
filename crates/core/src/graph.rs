use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeviceType {
    Disk,
    Part,
    Lvm,
    Crypt,
    Rom,
    Loop,
    Other(String),
}

impl DeviceType {
    pub fn as_str(&self) -> &str {
        match self {
            DeviceType::Disk => "disk",
            DeviceType::Part => "part",
            DeviceType::Lvm => "lvm",
            DeviceType::Crypt => "crypt",
            DeviceType::Rom => "rom",
            DeviceType::Loop => "loop",
            DeviceType::Other(value) => value,
        }
    }

    /// Device-mapper backed node types that need `dmsetup remove` before the
    /// underlying disk can be released.
    pub fn is_mapped(&self) -> bool {
        matches!(self, DeviceType::Lvm | DeviceType::Crypt)
    }
}

impl From<String> for DeviceType {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "disk" => DeviceType::Disk,
            "part" => DeviceType::Part,
            "lvm" => DeviceType::Lvm,
            "crypt" => DeviceType::Crypt,
            "rom" => DeviceType::Rom,
            "loop" => DeviceType::Loop,
            _ => DeviceType::Other(value),
        }
    }
}

impl From<DeviceType> for String {
    fn from(value: DeviceType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the block-device inventory. `children` holds the names of the
/// nodes stacked directly on top of this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceNode {
    pub name: String,
    pub kernel_name: Option<String>,
    pub path: Option<String>,
    pub device_type: DeviceType,
    pub size_bytes: Option<u64>,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub vendor: Option<String>,
    pub rotational: Option<bool>,
    pub transport: Option<String>,
    pub wwn: Option<String>,
    pub fs_type: Option<String>,
    pub mountpoints: Vec<String>,
    pub uuid: Option<String>,
    pub children: Vec<String>,
}

impl DeviceNode {
    /// Decodes one `lsblk -J` entry. Entries without a name cannot be
    /// referenced and yield `None`.
    pub fn from_lsblk(value: &Value) -> Option<Self> {
        let name = string_field(value, "name")?;
        let children = value
            .get("children")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|child| string_field(child, "name"))
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            name,
            kernel_name: string_field(value, "kname"),
            path: string_field(value, "path"),
            device_type: DeviceType::from(string_field(value, "type").unwrap_or_default()),
            size_bytes: u64_field(value, "size"),
            model: string_field(value, "model"),
            serial: string_field(value, "serial"),
            vendor: string_field(value, "vendor"),
            rotational: bool_field(value, "rota"),
            transport: string_field(value, "tran"),
            wwn: string_field(value, "wwn"),
            fs_type: string_field(value, "fstype"),
            mountpoints: mountpoints_field(value),
            uuid: string_field(value, "uuid"),
            children,
        })
    }

    pub fn is_disk(&self) -> bool {
        self.device_type == DeviceType::Disk
    }

    /// Device path from the inventory, or the conventional `/dev/<name>`.
    pub fn device_path(&self) -> String {
        self.path
            .clone()
            .unwrap_or_else(|| format!("/dev/{}", self.name))
    }

    fn merge(&mut self, other: DeviceNode) {
        for child in other.children {
            if !self.children.contains(&child) {
                self.children.push(child);
            }
        }
        for mount in other.mountpoints {
            if !self.mountpoints.contains(&mount) {
                self.mountpoints.push(mount);
            }
        }
        self.kernel_name = self.kernel_name.take().or(other.kernel_name);
        self.path = self.path.take().or(other.path);
        self.size_bytes = self.size_bytes.or(other.size_bytes);
        self.model = self.model.take().or(other.model);
        self.serial = self.serial.take().or(other.serial);
        self.vendor = self.vendor.take().or(other.vendor);
        self.rotational = self.rotational.or(other.rotational);
        self.transport = self.transport.take().or(other.transport);
        self.wwn = self.wwn.take().or(other.wwn);
        self.fs_type = self.fs_type.take().or(other.fs_type);
        self.uuid = self.uuid.take().or(other.uuid);
    }
}

/// Block-device topology. Parentage is many-to-many: `lsblk` repeats a
/// logical volume under every physical volume it spans.
#[derive(Debug, Clone, Default)]
pub struct TopologyGraph {
    nodes: BTreeMap<String, DeviceNode>,
    by_path: HashMap<String, String>,
    parents: HashMap<String, BTreeSet<String>>,
}

impl TopologyGraph {
    /// Builds the graph from a `{"blockdevices": [...]}` document. Never
    /// fails; anything unreadable is dropped or left empty.
    pub fn from_lsblk(document: &Value) -> Self {
        let mut graph = Self::default();
        if let Some(devices) = document.get("blockdevices").and_then(|v| v.as_array()) {
            for device in devices {
                graph.walk(device, None);
            }
        }
        graph
    }

    fn walk(&mut self, value: &Value, parent: Option<&str>) {
        let node = DeviceNode::from_lsblk(value);
        let name = node.as_ref().map(|node| node.name.clone());
        if let Some(node) = node {
            if let Some(path) = &node.path {
                self.by_path.insert(path.clone(), node.name.clone());
            }
            if let Some(parent) = parent {
                self.parents
                    .entry(node.name.clone())
                    .or_default()
                    .insert(parent.to_string());
            }
            match self.nodes.get_mut(&node.name) {
                Some(existing) => existing.merge(node),
                None => {
                    self.nodes.insert(node.name.clone(), node);
                }
            }
        }
        if let Some(children) = value.get("children").and_then(|v| v.as_array()) {
            for child in children {
                self.walk(child, name.as_deref());
            }
        }
    }

    pub fn node(&self, name: &str) -> Option<&DeviceNode> {
        self.nodes.get(name)
    }

    pub fn name_for_path(&self, path: &str) -> Option<&str> {
        self.by_path.get(path).map(|name| name.as_str())
    }

    pub fn parents(&self, name: &str) -> impl Iterator<Item = &str> {
        self.parents
            .get(name)
            .into_iter()
            .flat_map(|set| set.iter().map(|parent| parent.as_str()))
    }

    pub fn disks(&self) -> impl Iterator<Item = &DeviceNode> {
        self.nodes.values().filter(|node| node.is_disk())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The node itself followed by every node reachable through children,
    /// depth-first in inventory order. Each node appears once.
    pub fn descendants(&self, root: &str) -> Vec<&DeviceNode> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let Some(node) = self.nodes.get(current) else {
                continue;
            };
            out.push(node);
            for child in node.children.iter().rev() {
                stack.push(child.as_str());
            }
        }
        out
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(text) => {
            let text = text.trim();
            if text.is_empty() {
                None
            } else {
                Some(text.to_string())
            }
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn u64_field(value: &Value, key: &str) -> Option<u64> {
    match value.get(key)? {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn bool_field(value: &Value, key: &str) -> Option<bool> {
    match value.get(key)? {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => number.as_u64().map(|n| n != 0),
        Value::String(text) => match text.trim() {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn mountpoints_field(value: &Value) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    if let Some(items) = value.get("mountpoints").and_then(|v| v.as_array()) {
        for item in items {
            if let Some(mount) = item.as_str().filter(|m| !m.is_empty()) {
                if !out.iter().any(|existing| existing == mount) {
                    out.push(mount.to_string());
                }
            }
        }
    } else if let Some(mount) = string_field(value, "mountpoint") {
        out.push(mount);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lvm_across_two_disks() -> Value {
        let lv = json!({
            "name": "vg0-root", "kname": "dm-0", "path": "/dev/mapper/vg0-root",
            "type": "lvm", "size": 100, "mountpoints": ["/"]
        });
        json!({"blockdevices": [
            {"name": "sda", "path": "/dev/sda", "type": "disk", "size": "500107862016",
             "rota": "1", "model": "  ST500  ",
             "children": [{"name": "sda1", "path": "/dev/sda1", "type": "part", "children": [lv.clone()]}]},
            {"name": "sdb", "path": "/dev/sdb", "type": "disk", "size": 500107862016u64, "rota": false,
             "children": [{"name": "sdb1", "path": "/dev/sdb1", "type": "part", "children": [lv]}]}
        ]})
    }

    #[test]
    fn merges_parents_on_reentry() {
        let graph = TopologyGraph::from_lsblk(&lvm_across_two_disks());
        let parents: Vec<&str> = graph.parents("vg0-root").collect();
        assert_eq!(parents, vec!["sda1", "sdb1"]);
        assert_eq!(graph.len(), 5);
        assert_eq!(graph.name_for_path("/dev/mapper/vg0-root"), Some("vg0-root"));
    }

    #[test]
    fn decodes_lenient_fields() {
        let graph = TopologyGraph::from_lsblk(&lvm_across_two_disks());
        let sda = graph.node("sda").unwrap();
        assert_eq!(sda.size_bytes, Some(500107862016));
        assert_eq!(sda.rotational, Some(true));
        assert_eq!(sda.model.as_deref(), Some("ST500"));
        assert_eq!(graph.node("sdb").unwrap().rotational, Some(false));
        assert_eq!(graph.node("vg0-root").unwrap().device_type, DeviceType::Lvm);
    }

    #[test]
    fn drops_unnamed_nodes_and_tolerates_garbage() {
        let doc = json!({"blockdevices": [
            {"path": "/dev/ghost", "type": "disk", "children": [{"name": "orphan", "type": "part"}]},
            {"name": "vda", "type": "disk", "size": "not-a-number", "mountpoints": [null, ""]},
            "garbage"
        ]});
        let graph = TopologyGraph::from_lsblk(&doc);
        assert!(graph.node("orphan").is_some());
        assert_eq!(graph.parents("orphan").count(), 0);
        let vda = graph.node("vda").unwrap();
        assert_eq!(vda.size_bytes, None);
        assert!(vda.mountpoints.is_empty());
        assert_eq!(vda.device_path(), "/dev/vda");
        assert!(TopologyGraph::from_lsblk(&json!({})).is_empty());
    }

    #[test]
    fn accepts_legacy_single_mountpoint() {
        let doc = json!({"blockdevices": [{"name": "sda", "type": "disk", "mountpoint": "/boot"}]});
        let graph = TopologyGraph::from_lsblk(&doc);
        assert_eq!(graph.node("sda").unwrap().mountpoints, vec!["/boot".to_string()]);
    }

    #[test]
    fn descendants_visit_each_node_once() {
        let graph = TopologyGraph::from_lsblk(&lvm_across_two_disks());
        let names: Vec<&str> = graph
            .descendants("sda")
            .iter()
            .map(|node| node.name.as_str())
            .collect();
        assert_eq!(names, vec!["sda", "sda1", "vg0-root"]);
        assert!(graph.descendants("missing").is_empty());
    }
}
