use anyhow::{Context, Result};
use reclaim_core::{now_utc_rfc3339, DiskSummary, REPORT_SCHEMA_VERSION};
use reclaim_dispatch::HostResult;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Everything one fan-out run produced, one entry per host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateReport {
    pub run_id: String,
    pub schema_version: String,
    pub generated_at_utc: String,
    pub results: Vec<HostResult>,
}

impl AggregateReport {
    pub fn new(results: Vec<HostResult>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            generated_at_utc: now_utc_rfc3339(),
            results,
        }
    }

    pub fn failures(&self) -> usize {
        self.results.iter().filter(|r| r.failed()).count()
    }

    pub fn unreachable(&self) -> usize {
        self.results.iter().filter(|r| r.unreachable()).count()
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let mut data = serde_json::to_string_pretty(self)?;
        data.push('\n');
        write_creating_parents(path, &data)
    }

    pub fn write_markdown(&self, path: &Path) -> Result<()> {
        write_creating_parents(path, &self.render_markdown())
    }

    /// Human readable inventory: per-host status, OS disks and a table of
    /// the disks that would be wiped.
    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Non-OS Disks Report\n");
        let _ = writeln!(out, "- Generated at (UTC): `{}`", self.generated_at_utc);
        let _ = writeln!(out, "- Run: `{}`\n", self.run_id);

        for result in &self.results {
            let _ = writeln!(out, "## {} ({})", result.host.name, result.host.ip);
            if let Some(error) = &result.error {
                let _ = writeln!(out, "- Status: `unreachable` ({})\n", error);
                continue;
            }
            let Some(data) = &result.data else {
                let _ = writeln!(out, "- Status: `unknown`\n");
                continue;
            };
            let hostname = data.hostname.as_deref().unwrap_or("");
            if data.ok {
                let _ = writeln!(out, "- Status: `ok` (hostname `{}`)", hostname);
            } else {
                let _ = writeln!(
                    out,
                    "- Status: `failed` ({})",
                    data.error.as_deref().unwrap_or("no error reported")
                );
            }
            let _ = writeln!(out, "- OS disks: `{}`", names_or(&data.os_disks, "unknown"));
            let _ = writeln!(out, "- Non-OS disks: `{}`\n", names_or(&data.target_disks, "none"));

            if data.target_disks.is_empty() {
                continue;
            }
            out.push_str("| name | path | size(bytes) | model | serial | vendor | rota | tran | wwn |\n");
            out.push_str("|---|---:|---:|---|---|---|---:|---|---|\n");
            for disk in &data.target_disks {
                let _ = writeln!(
                    out,
                    "| {} | {} | {} | {} | {} | {} | {} | {} | {} |",
                    cell(Some(&disk.name)),
                    cell(disk.path.as_deref()),
                    disk.size_bytes.map(|s| s.to_string()).unwrap_or_default(),
                    cell(disk.model.as_deref()),
                    cell(disk.serial.as_deref()),
                    cell(disk.vendor.as_deref()),
                    disk.rota.map(|r| u8::from(r).to_string()).unwrap_or_default(),
                    cell(disk.tran.as_deref()),
                    cell(disk.wwn.as_deref()),
                );
            }
            out.push('\n');
        }

        let trimmed = out.trim_end().len();
        out.truncate(trimmed);
        out.push('\n');
        out
    }
}

fn names_or(disks: &[DiskSummary], empty: &str) -> String {
    if disks.is_empty() {
        return empty.to_string();
    }
    disks
        .iter()
        .map(|d| d.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn cell(value: Option<&str>) -> String {
    value.unwrap_or("").replace('|', "\\|")
}

fn write_creating_parents(path: &Path, data: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create report directory {}", parent.display()))?;
    }
    fs::write(path, data).with_context(|| format!("write report {}", path.display()))
}
