use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use thiserror::Error;

const DEFAULT_USER: &str = "ansible";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub ip: String,
    pub user: String,
}

impl Host {
    pub fn new(name: impl Into<String>, ip: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            user: user.into(),
        }
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.ip)
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to read hosts file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse hosts file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("--limit references unknown hosts: {}", .0.join(", "))]
    UnknownHosts(Vec<String>),
}

/// Reads a Kubespray/Ansible `hosts.yml`.
pub fn load_hosts(path: &Path) -> Result<Vec<Host>, DispatchError> {
    let data = fs::read_to_string(path).map_err(|source| DispatchError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_hosts(&data)
}

/// Hosts under `all.hosts`, in file order. Entries without `ansible_host`
/// are ignored.
pub fn parse_hosts(data: &str) -> Result<Vec<Host>, DispatchError> {
    let document: Value = serde_yaml::from_str(data)?;
    let Some(entries) = document
        .get("all")
        .and_then(|all| all.get("hosts"))
        .and_then(Value::as_mapping)
    else {
        return Ok(Vec::new());
    };

    let mut hosts = Vec::new();
    for (name, meta) in entries {
        let Some(name) = scalar(name) else {
            continue;
        };
        if !meta.is_mapping() {
            continue;
        }
        let Some(ip) = meta.get("ansible_host").and_then(scalar) else {
            continue;
        };
        let user = meta
            .get("ansible_user")
            .and_then(scalar)
            .unwrap_or_else(|| DEFAULT_USER.to_string());
        hosts.push(Host { name, ip, user });
    }
    Ok(hosts)
}

/// Applies a comma separated `--limit`, keeping the requested order and
/// dropping repeats. No limit selects every host.
pub fn select_hosts(all: Vec<Host>, limit: Option<&str>) -> Result<Vec<Host>, DispatchError> {
    let Some(limit) = limit.filter(|l| !l.trim().is_empty()) else {
        return Ok(all);
    };

    let mut seen = HashSet::new();
    let requested: Vec<&str> = limit
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty() && seen.insert(*name))
        .collect();

    let mut by_name: HashMap<String, Host> =
        all.into_iter().map(|host| (host.name.clone(), host)).collect();
    let mut selected = Vec::with_capacity(requested.len());
    let mut missing = Vec::new();
    for name in requested {
        match by_name.remove(name) {
            Some(host) => selected.push(host),
            None => missing.push(name.to_string()),
        }
    }
    if !missing.is_empty() {
        return Err(DispatchError::UnknownHosts(missing));
    }
    Ok(selected)
}

fn scalar(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
