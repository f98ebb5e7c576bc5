use crate::data_store::DataStore;
use crate::requests::AuthenticatedDataRequest;
use std::time::Duration;

pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(10 * 24 * 60 * 60);
pub const DEFAULT_MAX_MAP_SIZE: usize = 10_000;

/// Bounds applied to a store loaded from disk.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    /// Entries created longer ago than this are dropped.
    pub max_age: Duration,
    /// Only the most recently created entries up to this count survive.
    pub max_map_size: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_MAX_AGE,
            max_map_size: DEFAULT_MAX_MAP_SIZE,
        }
    }
}

impl RetentionPolicy {
    pub fn is_too_old(&self, request: &AuthenticatedDataRequest, now: u64) -> bool {
        let max_age_ms = self.max_age.as_millis().min(u64::MAX as u128) as u64;
        now.saturating_sub(request.created()) >= max_age_ms
    }

    /// Determine whether an entry should be dropped on load.
    pub fn should_prune(&self, request: &AuthenticatedDataRequest, now: u64) -> bool {
        self.is_too_old(request, now) || request.is_expired(now)
    }

    /// Drop aged and expired entries, then cap the store to the
    /// `max_map_size` newest entries.
    pub fn prune(&self, store: DataStore, now: u64) -> (DataStore, PruneReport) {
        let mut report = PruneReport::default();
        let mut survivors = Vec::with_capacity(store.len());
        for (hash, request) in store.into_entries() {
            if self.is_too_old(&request, now) {
                report.pruned_aged += 1;
            } else if request.is_expired(now) {
                report.pruned_expired += 1;
            } else {
                survivors.push((hash, request));
            }
        }

        if survivors.len() > self.max_map_size {
            survivors.sort_by(|a, b| b.1.created().cmp(&a.1.created()));
            report.pruned_over_capacity = (survivors.len() - self.max_map_size) as u64;
            survivors.truncate(self.max_map_size);
        }
        report.retained_entries = survivors.len() as u64;

        (DataStore::from_entries(survivors), report)
    }
}

/// Outcome of a retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub pruned_aged: u64,
    pub pruned_expired: u64,
    pub pruned_over_capacity: u64,
    pub retained_entries: u64,
}

impl PruneReport {
    pub fn pruned_entries(&self) -> u64 {
        self.pruned_aged + self.pruned_expired + self.pruned_over_capacity
    }
}
