//! Disk space checks before a sweep.

use std::path::{Path, PathBuf};

use sysinfo::Disks;
use tracing::{debug, warn};

/// Result of a disk space check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskSpaceStatus {
    Ok { available_bytes: u64 },
    InsufficientSpace {
        available_bytes: u64,
        required_bytes: u64,
    },
    /// The disk holding the path could not be found.
    Unknown,
}

impl DiskSpaceStatus {
    pub fn is_insufficient(&self) -> bool {
        matches!(self, DiskSpaceStatus::InsufficientSpace { .. })
    }
}

/// Source of free-space figures.
pub trait DiskSpaceProbe: Send + Sync {
    /// Bytes available on the disk holding `path`, if known.
    fn available_bytes(&self, path: &Path) -> Option<u64>;
}

/// Reads mount points through `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDiskProbe;

impl DiskSpaceProbe for SystemDiskProbe {
    fn available_bytes(&self, path: &Path) -> Option<u64> {
        let path = resolve(path);
        let disks = Disks::new_with_refreshed_list();

        // Longest mount point containing the path wins.
        let mut best_match: Option<(&sysinfo::Disk, usize)> = None;
        for disk in disks.list() {
            let mount_point = disk.mount_point();
            if path.starts_with(mount_point) {
                let mount_len = mount_point.as_os_str().len();
                if best_match.is_none_or(|(_, len)| mount_len > len) {
                    best_match = Some((disk, mount_len));
                }
            }
        }

        best_match.map(|(disk, _)| disk.available_space())
    }
}

/// Absolute form of `path`, using its nearest existing ancestor when the path
/// itself does not exist yet.
fn resolve(path: &Path) -> PathBuf {
    let mut current = path;
    loop {
        if let Ok(canonical) = std::fs::canonicalize(current) {
            return match path.strip_prefix(current) {
                Ok(rest) => canonical.join(rest),
                Err(_) => canonical,
            };
        }
        match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => current = parent,
            _ => return path.to_path_buf(),
        }
    }
}

/// Compare free space on the disk holding `path` with `required_bytes`.
pub fn check_disk_space(
    probe: &dyn DiskSpaceProbe,
    path: &Path,
    required_bytes: u64,
) -> DiskSpaceStatus {
    match probe.available_bytes(path) {
        Some(available_bytes) if available_bytes >= required_bytes => {
            debug!(
                "Disk space OK: {} bytes available, {} bytes required",
                available_bytes, required_bytes
            );
            DiskSpaceStatus::Ok { available_bytes }
        }
        Some(available_bytes) => {
            warn!(
                "Insufficient disk space: {} bytes available, {} bytes required",
                available_bytes, required_bytes
            );
            DiskSpaceStatus::InsufficientSpace {
                available_bytes,
                required_bytes,
            }
        }
        None => {
            warn!("Could not determine disk space for path: {}", path.display());
            DiskSpaceStatus::Unknown
        }
    }
}
