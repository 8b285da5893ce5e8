//! Runtime-scoped router statistics.
//!
//! Each [`Runtime`](crate::runtime::Runtime) owns one [`RouterStatistics`] and
//! hands it to every HTTP connector it builds. Matched requests are counted
//! by route pattern, unmatched ones by raw path.

use dashmap::DashMap;
use serde::Serialize;

/// Distinct unmatched paths tracked before further ones are folded together.
const MAX_UNMATCHED_PATHS: usize = 1000;
const OTHER_PATHS: &str = "<other>";

#[derive(Debug, Default)]
pub struct RouterStatistics {
    matched: DashMap<String, u64>,
    unmatched: DashMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathCount {
    pub path: String,
    pub count: u64,
}

/// Point-in-time copy, sorted by descending count then path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterStatisticsSnapshot {
    pub matched: Vec<PathCount>,
    pub unmatched: Vec<PathCount>,
}

impl RouterStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_matched(&self, pattern: &str) {
        *self.matched.entry(pattern.to_string()).or_insert(0) += 1;
    }

    pub fn add_unmatched(&self, path: &str) {
        let key = if self.unmatched.len() >= MAX_UNMATCHED_PATHS && !self.unmatched.contains_key(path)
        {
            OTHER_PATHS
        } else {
            path
        };
        *self.unmatched.entry(key.to_string()).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> RouterStatisticsSnapshot {
        RouterStatisticsSnapshot {
            matched: sorted(&self.matched),
            unmatched: sorted(&self.unmatched),
        }
    }
}

fn sorted(map: &DashMap<String, u64>) -> Vec<PathCount> {
    let mut out: Vec<PathCount> = map
        .iter()
        .map(|e| PathCount {
            path: e.key().clone(),
            count: *e.value(),
        })
        .collect();
    out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.path.cmp(&b.path)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_are_sorted() {
        let stats = RouterStatistics::new();
        stats.add_matched("/_bulk");
        stats.add_matched("/:index/_search");
        stats.add_matched("/:index/_search");
        stats.add_unmatched("/nope");

        let snap = stats.snapshot();
        assert_eq!(snap.matched[0].path, "/:index/_search");
        assert_eq!(snap.matched[0].count, 2);
        assert_eq!(snap.matched[1].path, "/_bulk");
        assert_eq!(snap.unmatched, vec![PathCount { path: "/nope".into(), count: 1 }]);
    }

    #[test]
    fn unmatched_paths_are_bounded() {
        let stats = RouterStatistics::new();
        for i in 0..MAX_UNMATCHED_PATHS + 5 {
            stats.add_unmatched(&format!("/p{i}"));
        }
        let snap = stats.snapshot();
        assert_eq!(snap.unmatched.len(), MAX_UNMATCHED_PATHS + 1);
        assert_eq!(snap.unmatched[0].path, OTHER_PATHS);
        assert_eq!(snap.unmatched[0].count, 5);
    }
}
