//! The snapshot freshness protocol: a store tracks an opaque generation tag
//! of its underlying log, and `snapshot()` only rebuilds when the tag has
//! moved since the cached one.

use cortexd_types::Snapshot;

/// An opaque tag identifying a particular state of an event log. Backends
/// are free to choose any monotonic representation (event count, a content
/// hash of the tail record, …) — callers only ever compare tags for
/// equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation(pub u64);

/// Caches the most recently built snapshot alongside the generation it was
/// built from.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    cached: Option<(Generation, Snapshot)>,
}

impl SnapshotCache {
    /// Starts with nothing cached — the first `get` always misses.
    pub fn new() -> Self {
        Self { cached: None }
    }

    /// Returns the cached snapshot if it was built from exactly this
    /// generation; `None` signals the caller must rebuild.
    pub fn get(&self, generation: Generation) -> Option<&Snapshot> {
        self.cached
            .as_ref()
            .filter(|(g, _)| *g == generation)
            .map(|(_, snapshot)| snapshot)
    }

    /// Replaces the cached snapshot and the generation it was built from.
    pub fn store(&mut self, generation: Generation, snapshot: Snapshot) {
        self.cached = Some((generation, snapshot));
    }

    /// Drops the cached snapshot, forcing the next `get` to miss.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortexd_types::Snapshot;

    #[test]
    fn rebuilds_only_on_generation_change() {
        let mut cache = SnapshotCache::new();
        assert!(cache.get(Generation(1)).is_none());
        cache.store(Generation(1), Snapshot::empty("s"));
        assert!(cache.get(Generation(1)).is_some());
        assert!(cache.get(Generation(2)).is_none());
    }
}
