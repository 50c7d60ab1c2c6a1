//! Capacity ledger: total and free resources per adapter.

use serde::Serialize;

use crate::domain::Resources;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterCapacity {
    pub adapter: String,
    pub total: Resources,
    pub free: Resources,
}

/// Owned by one scheduler instance; indexes follow adapter registration order.
#[derive(Debug, Clone, Default)]
pub struct CapacityLedger {
    entries: Vec<AdapterCapacity>,
}

fn leftover(free: u64, request: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    free.saturating_sub(request) as f64 / total as f64
}

impl CapacityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: impl Into<String>, total: Resources) -> usize {
        self.entries.push(AdapterCapacity {
            adapter: adapter.into(),
            free: total.clone(),
            total,
        });
        self.entries.len() - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn free(&self, index: usize) -> Option<&Resources> {
        self.entries.get(index).map(|e| &e.free)
    }

    /// Whether some adapter could ever run `request`.
    pub fn fits_any_total(&self, request: &Resources) -> bool {
        self.entries.iter().any(|e| request.fits_within(&e.total))
    }

    /// The adapter whose free capacity fits `request` with the smallest
    /// normalised leftover. Ties go to the earliest registered adapter.
    pub fn best_fit(&self, request: &Resources) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (index, entry) in self.entries.iter().enumerate() {
            if !request.fits_within(&entry.free) {
                continue;
            }
            let score = leftover(
                entry.free.cpu_cores as u64,
                request.cpu_cores as u64,
                entry.total.cpu_cores as u64,
            ) + leftover(entry.free.ram_bytes, request.ram_bytes, entry.total.ram_bytes)
                + leftover(entry.free.disk_bytes, request.disk_bytes, entry.total.disk_bytes);
            if best.is_none_or(|(_, s)| score < s) {
                best = Some((index, score));
            }
        }
        best.map(|(index, _)| index)
    }

    pub fn reserve(&mut self, index: usize, request: &Resources) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.free = entry.free.saturating_sub(request);
        }
    }

    pub fn release(&mut self, index: usize, request: &Resources) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.free = entry.free.restore(request, &entry.total);
        }
    }

    pub fn snapshot(&self) -> Vec<AdapterCapacity> {
        self.entries.clone()
    }
}
