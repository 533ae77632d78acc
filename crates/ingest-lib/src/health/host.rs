//! Host resource sampling for the memory and disk probes

use crate::error::{IngestError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use sysinfo::{DiskExt, System, SystemExt};

/// Point-in-time memory and disk usage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub memory_used_percent: f64,
    /// `None` when no mounted disk holds the configured path
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub disk: Option<DiskUsage>,
}

/// Usage of the disk holding the data directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub mount: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_percent: f64,
}

/// Source of host resource samples
#[async_trait]
pub trait HostMetricsSource: Send + Sync {
    async fn sample(&self) -> Result<HostMetrics>;
}

/// `sysinfo`-backed host sampler
pub struct SysinfoHost {
    disk_path: PathBuf,
    system: Arc<Mutex<System>>,
}

impl SysinfoHost {
    /// Sample memory plus the disk holding `disk_path`
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            disk_path: disk_path.into(),
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    fn sample_blocking(system: &Mutex<System>, disk_path: &Path) -> Result<HostMetrics> {
        let mut sys = system
            .lock()
            .map_err(|_| IngestError::probe_unavailable("host", "system handle poisoned"))?;

        sys.refresh_memory();
        sys.refresh_disks_list();
        sys.refresh_disks();

        let memory_total_bytes = sys.total_memory();
        let memory_used_bytes = sys.used_memory();

        let mounts: Vec<(PathBuf, u64, u64)> = sys
            .disks()
            .iter()
            .map(|d| (d.mount_point().to_path_buf(), d.total_space(), d.available_space()))
            .collect();
        let disk = select_disk(&mounts, disk_path).map(|(mount, total, available)| DiskUsage {
            mount: mount.display().to_string(),
            total_bytes: total,
            available_bytes: available,
            used_percent: used_percent(total.saturating_sub(available), total),
        });

        Ok(HostMetrics {
            memory_total_bytes,
            memory_used_bytes,
            memory_used_percent: used_percent(memory_used_bytes, memory_total_bytes),
            disk,
        })
    }
}

#[async_trait]
impl HostMetricsSource for SysinfoHost {
    async fn sample(&self) -> Result<HostMetrics> {
        let system = self.system.clone();
        let disk_path = self.disk_path.clone();

        tokio::task::spawn_blocking(move || Self::sample_blocking(&system, &disk_path))
            .await
            .map_err(|e| IngestError::probe_unavailable("host", e.to_string()))?
    }
}

fn used_percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    used as f64 / total as f64 * 100.0
}

/// The mount with the longest mount point that is a prefix of `path`
fn select_disk(mounts: &[(PathBuf, u64, u64)], path: &Path) -> Option<(PathBuf, u64, u64)> {
    mounts
        .iter()
        .filter(|(mount, _, _)| path.starts_with(mount))
        .max_by_key(|(mount, _, _)| mount.as_os_str().len())
        .cloned()
}
