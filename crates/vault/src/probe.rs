use std::path::{Path, PathBuf};
use anyhow::{anyhow, Result};
use log::debug;
use serde::Serialize;
use sysinfo::Disks;

/// Free/total space of the volume holding the library
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    pub free_bytes: u64,
    pub total_bytes: u64,
    pub percent_free: f64,
    pub percent_used: f64,
}

impl StorageStatus {
    pub fn new(free_bytes: u64, total_bytes: u64) -> Self {
        let percent_free = if total_bytes == 0 {
            0.0
        } else {
            (free_bytes as f64 / total_bytes as f64 * 1000.0).round() / 10.0
        };
        StorageStatus {
            free_bytes,
            total_bytes,
            percent_free,
            percent_used: ((100.0 - percent_free) * 10.0).round() / 10.0,
        }
    }
}

/// Reports how much space is left where the library lives
pub trait StorageProbe: Send + Sync {
    fn status(&self) -> Result<StorageStatus>;
}

/// Probe backed by the OS disk list
#[derive(Debug, Clone)]
pub struct DiskProbe {
    root: PathBuf,
}

impl DiskProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DiskProbe { root: root.into() }
    }
}

impl StorageProbe for DiskProbe {
    fn status(&self) -> Result<StorageStatus> {
        let root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
        let disks = Disks::new_with_refreshed_list();
        let mounts: Vec<(PathBuf, u64, u64)> = disks
            .list()
            .iter()
            .map(|d| (d.mount_point().to_path_buf(), d.available_space(), d.total_space()))
            .collect();

        let (mount, free, total) = best_mount(&root, &mounts)
            .ok_or_else(|| anyhow!("No mounted volume contains {}", root.display()))?;
        debug!("Library {} is on {} ({} free of {})", root.display(), mount.display(), free, total);
        Ok(StorageStatus::new(free, total))
    }
}

/// Longest mount point that is a prefix of `path`
fn best_mount<'a>(path: &Path, mounts: &'a [(PathBuf, u64, u64)]) -> Option<(&'a Path, u64, u64)> {
    mounts
        .iter()
        .filter(|(mount, _, _)| path.starts_with(mount))
        .max_by_key(|(mount, _, _)| mount.components().count())
        .map(|(mount, free, total)| (mount.as_path(), *free, *total))
}
