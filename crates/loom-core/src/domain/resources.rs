//! Resource requests and capacity descriptors.

use serde::{Deserialize, Serialize};

pub const GIB: u64 = 1024 * 1024 * 1024;

/// CPU/RAM/disk amounts plus named volumes.
///
/// The same shape describes a task's request and an adapter's capacity. For a
/// request, `volumes` are volumes the task needs; for a capacity, volumes the
/// adapter can provide. Volumes are matched, never consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub cpu_cores: u32,
    pub ram_bytes: u64,
    pub disk_bytes: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
}

impl Resources {
    pub fn new(cpu_cores: u32, ram_bytes: u64, disk_bytes: u64) -> Self {
        Self {
            cpu_cores,
            ram_bytes,
            disk_bytes,
            volumes: Vec::new(),
        }
    }

    pub fn with_volume(mut self, volume: impl Into<String>) -> Self {
        self.volumes.push(volume.into());
        self
    }

    /// Does this request fit inside `available`?
    pub fn fits_within(&self, available: &Resources) -> bool {
        self.cpu_cores <= available.cpu_cores
            && self.ram_bytes <= available.ram_bytes
            && self.disk_bytes <= available.disk_bytes
            && self.volumes.iter().all(|v| available.volumes.contains(v))
    }

    /// Subtract the countable amounts of `request`. Volumes are kept.
    pub fn saturating_sub(&self, request: &Resources) -> Resources {
        Resources {
            cpu_cores: self.cpu_cores.saturating_sub(request.cpu_cores),
            ram_bytes: self.ram_bytes.saturating_sub(request.ram_bytes),
            disk_bytes: self.disk_bytes.saturating_sub(request.disk_bytes),
            volumes: self.volumes.clone(),
        }
    }

    /// Add back the countable amounts of `request`, never exceeding `limit`.
    pub fn restore(&self, request: &Resources, limit: &Resources) -> Resources {
        Resources {
            cpu_cores: (self.cpu_cores + request.cpu_cores).min(limit.cpu_cores),
            ram_bytes: (self.ram_bytes + request.ram_bytes).min(limit.ram_bytes),
            disk_bytes: (self.disk_bytes + request.disk_bytes).min(limit.disk_bytes),
            volumes: self.volumes.clone(),
        }
    }
}
