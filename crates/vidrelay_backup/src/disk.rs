use std::path::{Path, PathBuf};

use sysinfo::Disks;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiskError {
    #[error("no mounted volume contains {0}")]
    VolumeNotFound(PathBuf),
}

pub trait DiskProbe: Send + Sync {
    /// Free bytes on the volume holding `path`, or `None` if no mounted
    /// volume contains it.
    fn available_bytes(&self, path: &Path) -> Option<u64>;
}

/// Reads free space from the mounted disks list.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysinfoDiskProbe;

impl DiskProbe for SysinfoDiskProbe {
    fn available_bytes(&self, path: &Path) -> Option<u64> {
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();
        let mut best_match: Option<(usize, u64)> = None;

        for disk in &disks {
            let mount_point = disk.mount_point();
            if !path.starts_with(mount_point) {
                continue;
            }

            // the deepest mount point wins
            let mount_depth = mount_point.components().count();
            match best_match {
                Some((depth, _)) if depth >= mount_depth => {}
                _ => best_match = Some((mount_depth, disk.available_space())),
            }
        }

        best_match.map(|(_, available)| available)
    }
}

/// A single free-space reading taken for one admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub required: u64,
    pub available: u64,
}

impl Admission {
    pub fn is_sufficient(&self) -> bool {
        self.available >= self.required
    }
}

/// Probes the volume once and pairs the reading with the requirement.
pub fn check_admission(
    probe: &dyn DiskProbe,
    required_bytes: u64,
    volume_path: &Path,
) -> Result<Admission, DiskError> {
    let available = probe
        .available_bytes(volume_path)
        .ok_or_else(|| DiskError::VolumeNotFound(volume_path.to_path_buf()))?;
    Ok(Admission {
        required: required_bytes,
        available,
    })
}

pub fn has_sufficient_space(
    probe: &dyn DiskProbe,
    required_bytes: u64,
    volume_path: &Path,
) -> Result<bool, DiskError> {
    check_admission(probe, required_bytes, volume_path).map(|admission| admission.is_sufficient())
}
