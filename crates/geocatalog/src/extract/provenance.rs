//! Who scanned a file, from which machine, and where the file lives.

use crate::record::{Provenance, StorageLocation};

/// Scanning user and host, detected once per scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub user: String,
    pub machine: String,
    pub os: String,
    /// Kernel release where the platform exposes one.
    pub os_version: Option<String>,
    /// Mount points of the scanning host, used to place files on a volume.
    pub mount_points: Vec<String>,
}

impl HostInfo {
    pub fn detect() -> Self {
        Self {
            user: env_first(&["USER", "USERNAME", "LOGNAME"]).unwrap_or_else(|| "unknown".into()),
            machine: env_first(&["HOSTNAME", "COMPUTERNAME"])
                .or_else(read_etc_hostname)
                .unwrap_or_else(|| "unknown".into()),
            os: std::env::consts::OS.to_string(),
            os_version: read_trimmed("/proc/sys/kernel/osrelease"),
            mount_points: std::fs::read_to_string("/proc/self/mounts")
                .map(|table| parse_mount_table(&table))
                .unwrap_or_default(),
        }
    }

    pub fn provenance_for(&self, file_path: &str) -> Provenance {
        let (storage, network_server) = classify_storage(file_path);
        Provenance {
            user: self.user.clone(),
            machine: self.machine.clone(),
            os: self.os.clone(),
            os_version: self.os_version.clone(),
            storage,
            network_server,
            drive_or_mount: drive_or_mount(file_path, &self.mount_points),
        }
    }
}

fn env_first(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|n| std::env::var(n).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

fn read_etc_hostname() -> Option<String> {
    read_trimmed("/etc/hostname")
}

fn read_trimmed(path: &str) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Second field of each `/proc/self/mounts` line, with the kernel's octal
/// escapes (`\040` for a space) decoded.
fn parse_mount_table(table: &str) -> Vec<String> {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_mount)
        .collect()
}

fn unescape_mount(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let octal = bytes
            .get(i + 1..i + 4)
            .filter(|_| bytes[i] == b'\\')
            .and_then(|d| std::str::from_utf8(d).ok())
            .and_then(|d| u8::from_str_radix(d, 8).ok());
        match octal {
            Some(byte) => {
                out.push(byte);
                i += 4;
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Drive letter (`C:`) or UNC share root for Windows-style paths, otherwise
/// the longest known mount point containing the file.
pub fn drive_or_mount(file_path: &str, mount_points: &[String]) -> Option<String> {
    let bytes = file_path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Some(file_path[..2].to_ascii_uppercase());
    }
    if let Some(rest) = file_path
        .strip_prefix(r"\\")
        .or_else(|| file_path.strip_prefix("//"))
    {
        let mut parts = rest.split(['\\', '/']).filter(|p| !p.is_empty());
        return match (parts.next(), parts.next()) {
            (Some(server), Some(share)) => Some(format!(r"\\{}\{}", server, share)),
            _ => None,
        };
    }
    mount_points
        .iter()
        .filter(|m| is_under(file_path, m))
        .max_by_key(|m| m.len())
        .cloned()
}

fn is_under(file_path: &str, mount: &str) -> bool {
    if mount == "/" {
        return file_path.starts_with('/');
    }
    match file_path.strip_prefix(mount.trim_end_matches('/')) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// UNC paths (`\\server\share`, `//server/share`) are network storage.
pub fn classify_storage(file_path: &str) -> (StorageLocation, Option<String>) {
    let rest = file_path
        .strip_prefix(r"\\")
        .or_else(|| file_path.strip_prefix("//"));
    match rest {
        Some(rest) => {
            let server = rest
                .split(['\\', '/'])
                .next()
                .filter(|s| !s.is_empty() && *s != "?" && *s != ".")
                .map(str::to_string);
            (StorageLocation::Network, server)
        }
        None => (StorageLocation::Local, None),
    }
}
