// wastewatch-detect/src/ring.rs
// Bounded detection history + cumulative counters, mutated together
// under the session lock.

use std::collections::VecDeque;

use serde::Serialize;

use crate::{Detection, WasteCategory};

/// Most recent detections kept for overlay and stats queries.
pub const RING_CAPACITY: usize = 10;

/// Fixed-capacity FIFO of the newest detections.  Insertion order is
/// detection order; the oldest entry is evicted once full.
#[derive(Debug, Default)]
pub struct DetectionRing {
    buf: VecDeque<Detection>,
}

impl DetectionRing {
    pub fn new() -> Self {
        Self {
            buf: VecDeque::with_capacity(RING_CAPACITY),
        }
    }

    pub fn push(&mut self, detection: Detection) {
        if self.buf.len() == RING_CAPACITY {
            self.buf.pop_front();
        }
        self.buf.push_back(detection);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Detection> {
        self.buf.iter()
    }

    pub fn to_vec(&self) -> Vec<Detection> {
        self.buf.iter().cloned().collect()
    }
}

/// Cumulative counters for one detection session.  Monotonically
/// non-decreasing until the session restarts.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct Stats {
    pub total: u64,
    pub organic: u64,
    pub inorganic: u64,
}

impl Stats {
    pub fn record(&mut self, category: WasteCategory) {
        self.total += 1;
        match category {
            WasteCategory::Organic => self.organic += 1,
            WasteCategory::Inorganic => self.inorganic += 1,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Coherent view of a session for callers: counters plus ring contents
/// taken under one lock.  `active: false` snapshots are well-formed
/// and empty: the absence of a detector is a normal state, not an
/// error.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub active: bool,
    pub total: u64,
    pub organic: u64,
    pub inorganic: u64,
    pub recent: Vec<Detection>,
}

impl StatsSnapshot {
    pub fn inactive() -> Self {
        Self {
            active: false,
            total: 0,
            organic: 0,
            inorganic: 0,
            recent: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(n: i32) -> Detection {
        Detection {
            timestamp: n as u64,
            category: WasteCategory::Inorganic,
            original_label: "plastic",
            confidence: 0.9,
            bbox: [n, n, n + 10, n + 10],
        }
    }

    #[test]
    fn ring_never_exceeds_capacity() {
        let mut ring = DetectionRing::new();
        for n in 0..100 {
            ring.push(det(n));
            assert!(ring.len() <= RING_CAPACITY);
        }
        assert_eq!(ring.len(), RING_CAPACITY);
    }

    #[test]
    fn ring_evicts_oldest_first() {
        let mut ring = DetectionRing::new();
        for n in 0..(RING_CAPACITY as i32 + 3) {
            ring.push(det(n));
        }
        let kept: Vec<u64> = ring.iter().map(|d| d.timestamp).collect();
        let expected: Vec<u64> = (3..RING_CAPACITY as u64 + 3).collect();
        assert_eq!(kept, expected);
    }

    #[test]
    fn stats_total_equals_category_sum() {
        let mut stats = Stats::default();
        for n in 0..37 {
            let category = if n % 3 == 0 {
                WasteCategory::Organic
            } else {
                WasteCategory::Inorganic
            };
            stats.record(category);
            assert_eq!(stats.total, stats.organic + stats.inorganic);
        }
        stats.reset();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.organic + stats.inorganic, 0);
    }
}
