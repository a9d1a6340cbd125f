//! Metrics tracking for the worker registry

use serde::Serialize;

/// Registry counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryMetrics {
    /// Live workers at snapshot time
    pub active_workers: usize,
    /// Lookups served by an existing worker
    pub cache_hits: u64,
    /// Lookups that started a spawn
    pub cache_misses: u64,
    /// Lookups that joined a spawn already in flight
    pub coalesced: u64,
    /// Workers loaded successfully
    pub spawns: u64,
    pub spawn_failures: u64,
    /// Workers removed for being dead, idle, stuck or over capacity
    pub evictions: u64,
}

impl RegistryMetrics {
    /// Get hit rate
    pub fn hit_rate(&self) -> f64 {
        let hits = self.cache_hits as f64;
        let total = hits + self.cache_misses as f64 + self.coalesced as f64;
        if total > 0.0 {
            hits / total
        } else {
            0.0
        }
    }

    pub(crate) fn increment_hits(&mut self) {
        self.cache_hits += 1;
    }

    pub(crate) fn increment_misses(&mut self) {
        self.cache_misses += 1;
    }

    pub(crate) fn increment_coalesced(&mut self) {
        self.coalesced += 1;
    }

    pub(crate) fn record_spawn(&mut self, success: bool) {
        if success {
            self.spawns += 1;
        } else {
            self.spawn_failures += 1;
        }
    }

    pub(crate) fn increment_evictions(&mut self) {
        self.evictions += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let mut m = RegistryMetrics::default();
        assert_eq!(m.hit_rate(), 0.0);
        m.increment_misses();
        m.increment_hits();
        m.increment_hits();
        m.increment_coalesced();
        assert_eq!(m.hit_rate(), 0.5);
    }
}
