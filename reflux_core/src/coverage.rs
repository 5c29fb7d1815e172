use std::collections::HashMap;
use std::collections::hash_map::Entry;

/// Opaque identifier of an execution-trace edge, as reported by instrumentation.
pub type EdgeId = u64;

/// Tracks every edge observed across all executions and how often it was hit.
///
/// Hit counts only grow; an edge, once known, is never forgotten. Edge ids are
/// treated as black-box keys, so any hashing scheme used by the instrumentation
/// collaborator works as long as it is stable for the life of the process.
#[derive(Debug, Clone, Default)]
pub struct CoverageMap {
    edge_hits: HashMap<EdgeId, u64>,
    total_known_edges: u64,
}

impl CoverageMap {
    /// Creates an empty map.
    ///
    /// # Arguments
    /// * `total_known_edges`: Size of the edge universe of the target, if the
    ///   instrumentation knows it. `0` is valid and means "unknown"; in that case
    ///   `coverage_ratio` always reports `0.0`.
    pub fn new(total_known_edges: u64) -> Self {
        Self {
            edge_hits: HashMap::new(),
            total_known_edges,
        }
    }

    /// Records one execution's edges. Returns `true` iff at least one edge was
    /// previously unseen.
    pub fn record(&mut self, edges: &[EdgeId]) -> bool {
        !self.record_new(edges).is_empty()
    }

    /// Records one execution's edges and returns the ones seen for the first time,
    /// in first-occurrence order and without duplicates.
    pub fn record_new(&mut self, edges: &[EdgeId]) -> Vec<EdgeId> {
        let mut fresh = Vec::new();
        for &edge in edges {
            match self.edge_hits.entry(edge) {
                Entry::Occupied(mut hits) => {
                    let count = hits.get_mut();
                    *count = count.saturating_add(1);
                }
                Entry::Vacant(slot) => {
                    slot.insert(1);
                    fresh.push(edge);
                }
            }
        }
        fresh
    }

    /// Fraction of the declared edge universe observed so far, in `[0, 1]`.
    pub fn coverage_ratio(&self) -> f64 {
        if self.total_known_edges == 0 {
            return 0.0;
        }
        (self.edge_hits.len() as f64 / self.total_known_edges as f64).min(1.0)
    }

    pub fn known_edges(&self) -> usize {
        self.edge_hits.len()
    }

    pub fn total_known_edges(&self) -> u64 {
        self.total_known_edges
    }

    pub fn hit_count(&self, edge: EdgeId) -> u64 {
        self.edge_hits.get(&edge).copied().unwrap_or(0)
    }

    pub fn is_known(&self, edge: EdgeId) -> bool {
        self.edge_hits.contains_key(&edge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_reports_new_edges_only_once() {
        let mut map = CoverageMap::new(10);
        assert!(map.record(&[1, 2, 3]));
        assert!(!map.record(&[1, 2]));
        assert!(map.record(&[2, 4]));
        assert_eq!(map.known_edges(), 4);
        assert_eq!(map.hit_count(2), 3);
        assert_eq!(map.hit_count(4), 1);
        assert_eq!(map.hit_count(99), 0);
    }

    #[test]
    fn record_new_deduplicates_within_one_trace() {
        let mut map = CoverageMap::new(0);
        let fresh = map.record_new(&[7, 7, 3, 7]);
        assert_eq!(fresh, vec![7, 3]);
        assert_eq!(map.hit_count(7), 3);
    }

    #[test]
    fn empty_trace_is_not_new_coverage() {
        let mut map = CoverageMap::new(4);
        assert!(!map.record(&[]));
        assert_eq!(map.coverage_ratio(), 0.0);
    }

    #[test]
    fn coverage_ratio_with_unknown_universe_is_zero() {
        let mut map = CoverageMap::new(0);
        map.record(&[1, 2, 3]);
        assert_eq!(map.coverage_ratio(), 0.0);
    }

    #[test]
    fn coverage_ratio_tracks_known_edges_and_caps_at_one() {
        let mut map = CoverageMap::new(4);
        map.record(&[1]);
        assert!((map.coverage_ratio() - 0.25).abs() < f64::EPSILON);
        map.record(&[2, 3]);
        assert!((map.coverage_ratio() - 0.75).abs() < f64::EPSILON);
        map.record(&[4, 5, 6]);
        assert_eq!(map.coverage_ratio(), 1.0);
    }
}
