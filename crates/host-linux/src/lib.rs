use anyhow::{anyhow, Context, Result};
use reclaim_core::MountSourceResolver;
use serde_json::Value;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

pub const LSBLK_COLUMNS: &str =
    "NAME,KNAME,PATH,TYPE,SIZE,MODEL,SERIAL,VENDOR,ROTA,TRAN,WWN,FSTYPE,MOUNTPOINTS,UUID";

/// `sudo` resets PATH to its secure_path, so admin tools are looked up
/// there as well.
const SBIN_DIRS: [&str; 4] = ["/usr/local/sbin", "/usr/sbin", "/sbin", "/usr/bin"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub mount_point: String,
    pub fs_type: String,
}

/// Everything the on-host routine needs from the machine it runs on.
pub trait HostSystem: MountSourceResolver {
    /// Raw `lsblk -J` document.
    fn block_devices(&self) -> Result<Value>;
    fn mounts(&self) -> Vec<MountEntry>;
    fn hostname(&self) -> String;
    fn tool_available(&self, tool: &str) -> bool;
    /// Runs a program to completion. Fails only when it cannot be spawned.
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

#[derive(Debug, Clone, Default)]
pub struct LinuxHost;

impl LinuxHost {
    pub fn new() -> Self {
        Self
    }
}

/// `--nofsroot` keeps btrfs subvolumes and bind mounts from printing
/// `/dev/sda2[/@]` instead of the device.
pub fn findmnt_source_args(mountpoint: &str) -> [&str; 3] {
    ["-nvro", "SOURCE", mountpoint]
}

impl MountSourceResolver for LinuxHost {
    fn mount_source(&self, mountpoint: &str) -> Option<String> {
        let output = self.run("findmnt", &findmnt_source_args(mountpoint)).ok()?;
        if !output.success() {
            return None;
        }
        let source = output.stdout.trim();
        if source.is_empty() {
            None
        } else {
            Some(source.to_string())
        }
    }
}

impl HostSystem for LinuxHost {
    fn block_devices(&self) -> Result<Value> {
        let output = self.run("lsblk", &["-J", "-b", "-o", LSBLK_COLUMNS])?;
        if !output.success() {
            return Err(anyhow!(
                "lsblk failed: {}",
                output.stderr.trim()
            ));
        }
        serde_json::from_str(&output.stdout).context("parse lsblk json")
    }

    fn mounts(&self) -> Vec<MountEntry> {
        let data = fs::read_to_string("/proc/self/mounts").unwrap_or_default();
        parse_mounts(&data)
    }

    fn hostname(&self) -> String {
        read_string("/proc/sys/kernel/hostname")
            .or_else(|| {
                self.run("hostname", &[])
                    .ok()
                    .filter(|out| out.success())
                    .map(|out| out.stdout.trim().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn tool_available(&self, tool: &str) -> bool {
        let mut dirs: Vec<PathBuf> = env::var_os("PATH")
            .map(|path| env::split_paths(&path).collect())
            .unwrap_or_default();
        dirs.extend(SBIN_DIRS.iter().map(PathBuf::from));
        dirs.iter().any(|dir| is_executable(&dir.join(tool)))
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        debug!(program, ?args, "exec");
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("run {}", program))?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Parses `/proc/self/mounts` content.
pub fn parse_mounts(data: &str) -> Vec<MountEntry> {
    let mut mounts = Vec::new();
    for line in data.lines() {
        let mut parts = line.split_whitespace();
        let source = match parts.next() {
            Some(value) => unescape_mount(value),
            None => continue,
        };
        let mount_point = match parts.next() {
            Some(value) => unescape_mount(value),
            None => continue,
        };
        let fs_type = match parts.next() {
            Some(value) => value.to_string(),
            None => continue,
        };
        mounts.push(MountEntry {
            source,
            mount_point,
            fs_type,
        });
    }
    mounts
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn read_string(path: impl AsRef<Path>) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unescape_mount(value: &str) -> String {
    let mut output = String::new();
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            let mut octal = String::new();
            for _ in 0..3 {
                if let Some(next) = chars.peek() {
                    if next.is_ascii_digit() {
                        octal.push(*next);
                        chars.next();
                    } else {
                        break;
                    }
                }
            }
            if octal.len() == 3 {
                if let Ok(byte) = u8::from_str_radix(&octal, 8) {
                    output.push(byte as char);
                    continue;
                }
            }
            output.push('\\');
            output.push_str(&octal);
        } else {
            output.push(ch);
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proc_mounts() {
        let data = "/dev/sda2 / ext4 rw,relatime 0 0\n\
                    10.0.0.5:6789:/ /mnt/ceph\\040fs ceph rw 0 0\n\
                    broken\n";
        let mounts = parse_mounts(data);
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].source, "/dev/sda2");
        assert_eq!(mounts[1].mount_point, "/mnt/ceph fs");
        assert_eq!(mounts[1].fs_type, "ceph");
    }

    #[test]
    fn keeps_invalid_escapes_verbatim() {
        assert_eq!(unescape_mount("/a\\9b"), "/a\\9b");
        assert_eq!(unescape_mount("/plain"), "/plain");
    }

    #[test]
    fn findmnt_asks_for_the_bare_device() {
        let args = findmnt_source_args("/var");
        assert_eq!(args, ["-nvro", "SOURCE", "/var"]);
    }

    #[test]
    fn command_output_success_requires_zero() {
        let out = CommandOutput {
            status: Some(1),
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(!out.success());
    }
}
