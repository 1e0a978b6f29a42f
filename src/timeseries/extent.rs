//! Extents: time ranges covered by a cached series
//!
//! An extent is a closed-open interval `[start, end)` of epoch-second
//! timestamps aligned to a query step. An [`ExtentList`] is the set of
//! ranges a cached object actually covers: always sorted, disjoint, with
//! adjacent extents coalesced. All arithmetic here is pure so the cache
//! engines can be tested without a cache.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A closed-open interval of epoch timestamps
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Extent {
    pub start: i64,
    pub end: i64,
    /// Last time this range was served, for in-object LRU eviction.
    /// Not part of the extent's identity.
    #[serde(default)]
    pub last_used: i64,
}

impl PartialEq for Extent {
    fn eq(&self, other: &Self) -> bool {
        self.start == other.start && self.end == other.end
    }
}

impl Eq for Extent {}

impl PartialOrd for Extent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Extent {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.start, self.end).cmp(&(other.start, other.end))
    }
}

impl Extent {
    pub fn new(start: i64, end: i64) -> Self {
        Extent {
            start,
            end,
            last_used: 0,
        }
    }

    /// An extent is empty when it covers no timestamps
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, t: i64) -> bool {
        t >= self.start && t < self.end
    }

    pub fn overlaps(&self, other: &Extent) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Intersection of two extents, or None when they do not overlap
    pub fn intersection(&self, other: &Extent) -> Option<Extent> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if end > start {
            Some(Extent {
                start,
                end,
                last_used: self.last_used.max(other.last_used),
            })
        } else {
            None
        }
    }

    /// Snap the extent outward to the step grid: start floors, end ceils
    pub fn normalize(&self, step: i64) -> Extent {
        Extent {
            start: self.start.div_euclid(step) * step,
            end: (self.end + step - 1).div_euclid(step) * step,
            last_used: self.last_used,
        }
    }

    /// Number of step-aligned samples the extent can hold
    pub fn cardinality(&self, step: i64) -> i64 {
        if self.is_empty() || step <= 0 {
            0
        } else {
            (self.end - self.start) / step
        }
    }
}

impl std::fmt::Display for Extent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}-{}]", self.start, self.end)
    }
}

/// Sorted, disjoint, coalesced list of extents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentList(pub Vec<Extent>);

impl ExtentList {
    pub fn new() -> Self {
        ExtentList(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Extent> {
        self.0.iter()
    }

    /// Earliest covered timestamp
    pub fn start(&self) -> Option<i64> {
        self.0.first().map(|e| e.start)
    }

    /// Exclusive end of the newest covered range
    pub fn end(&self) -> Option<i64> {
        self.0.last().map(|e| e.end)
    }

    /// Add an extent and restore the sorted/disjoint/coalesced invariant
    pub fn add(&mut self, extent: Extent) {
        if extent.is_empty() {
            return;
        }
        self.0.push(extent);
        self.compress();
    }

    /// Union another list into this one
    pub fn merge(&mut self, other: &ExtentList) {
        self.0.extend(other.0.iter().copied());
        self.compress();
    }

    /// Sort and coalesce overlapping or adjacent extents.
    ///
    /// Two extents are adjacent when one ends exactly where the next
    /// starts; the invariant requires those to collapse into one.
    pub fn compress(&mut self) {
        self.0.retain(|e| !e.is_empty());
        if self.0.len() < 2 {
            return;
        }
        self.0.sort();
        let mut compressed: Vec<Extent> = Vec::with_capacity(self.0.len());
        for extent in self.0.drain(..) {
            match compressed.last_mut() {
                Some(last) if extent.start <= last.end => {
                    last.end = last.end.max(extent.end);
                    last.last_used = last.last_used.max(extent.last_used);
                }
                _ => compressed.push(extent),
            }
        }
        self.0 = compressed;
    }

    /// The portions of `range` this list does not cover, in order.
    ///
    /// This is the delta computation: the result is what must be fetched
    /// from the origin to satisfy `range`.
    pub fn subtract(&self, range: &Extent) -> ExtentList {
        let mut gaps = Vec::new();
        if range.is_empty() {
            return ExtentList(gaps);
        }
        let mut cursor = range.start;
        for extent in &self.0 {
            if extent.end <= cursor {
                continue;
            }
            if extent.start >= range.end {
                break;
            }
            if extent.start > cursor {
                gaps.push(Extent::new(cursor, extent.start.min(range.end)));
            }
            cursor = cursor.max(extent.end);
            if cursor >= range.end {
                break;
            }
        }
        if cursor < range.end {
            gaps.push(Extent::new(cursor, range.end));
        }
        ExtentList(gaps)
    }

    /// Intersect the list with `range`
    pub fn crop(&self, range: &Extent) -> ExtentList {
        ExtentList(
            self.0
                .iter()
                .filter_map(|e| e.intersection(range))
                .collect(),
        )
    }

    /// True when `range` is fully covered (no gaps)
    pub fn encompasses(&self, range: &Extent) -> bool {
        self.subtract(range).is_empty()
    }

    /// True when the list covers any part of `range`
    pub fn overlaps(&self, range: &Extent) -> bool {
        self.0.iter().any(|e| e.overlaps(range))
    }

    /// Total step-aligned sample capacity across all extents
    pub fn cardinality(&self, step: i64) -> i64 {
        self.0.iter().map(|e| e.cardinality(step)).sum()
    }

    /// Mark every extent overlapping `range` as served now
    pub fn touch(&mut self, range: &Extent, now: i64) {
        for extent in &mut self.0 {
            if extent.overlaps(range) {
                extent.last_used = now;
            }
        }
    }

    /// Comma-separated `[start-end]` rendering for the results header
    pub fn to_header_value(&self) -> String {
        self.0
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromIterator<Extent> for ExtentList {
    fn from_iter<T: IntoIterator<Item = Extent>>(iter: T) -> Self {
        let mut list = ExtentList(iter.into_iter().collect());
        list.compress();
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(pairs: &[(i64, i64)]) -> ExtentList {
        pairs.iter().map(|&(s, e)| Extent::new(s, e)).collect()
    }

    #[test]
    fn test_normalize_to_grid() {
        let e = Extent::new(1003, 1997).normalize(10);
        assert_eq!(e, Extent::new(1000, 2000));
        // already aligned is unchanged
        assert_eq!(Extent::new(1000, 2000).normalize(10), Extent::new(1000, 2000));
    }

    #[test]
    fn test_compress_coalesces_adjacent_and_overlapping() {
        let l = list(&[(1800, 2000), (1000, 1200), (1200, 1500), (1400, 1600)]);
        assert_eq!(l, list(&[(1000, 1600), (1800, 2000)]));
    }

    #[test]
    fn test_subtract_full_coverage_yields_no_gaps() {
        let l = list(&[(1000, 2000)]);
        assert!(l.subtract(&Extent::new(1200, 1800)).is_empty());
    }

    #[test]
    fn test_subtract_right_edge_delta() {
        let l = list(&[(1000, 2000)]);
        let gaps = l.subtract(&Extent::new(1500, 2500));
        assert_eq!(gaps, list(&[(2000, 2500)]));
    }

    #[test]
    fn test_subtract_interior_gap() {
        let l = list(&[(1000, 1200), (1800, 2000)]);
        let gaps = l.subtract(&Extent::new(1000, 2000));
        assert_eq!(gaps, list(&[(1200, 1800)]));
    }

    #[test]
    fn test_subtract_no_overlap_returns_whole_range() {
        let l = list(&[(5000, 6000)]);
        let gaps = l.subtract(&Extent::new(1000, 2000));
        assert_eq!(gaps, list(&[(1000, 2000)]));
    }

    #[test]
    fn test_subtract_both_edges() {
        let l = list(&[(1200, 1800)]);
        let gaps = l.subtract(&Extent::new(1000, 2000));
        assert_eq!(gaps, list(&[(1000, 1200), (1800, 2000)]));
    }

    #[test]
    fn test_crop() {
        let l = list(&[(1000, 1500), (1800, 2200)]);
        let cropped = l.crop(&Extent::new(1200, 2000));
        assert_eq!(cropped, list(&[(1200, 1500), (1800, 2000)]));
    }

    #[test]
    fn test_encompasses_and_overlaps() {
        let l = list(&[(1000, 2000)]);
        assert!(l.encompasses(&Extent::new(1000, 2000)));
        assert!(l.encompasses(&Extent::new(1100, 1900)));
        assert!(!l.encompasses(&Extent::new(900, 1100)));
        assert!(l.overlaps(&Extent::new(900, 1100)));
        assert!(!l.overlaps(&Extent::new(2000, 3000)));
    }

    #[test]
    fn test_cardinality() {
        let l = list(&[(1000, 1200), (1800, 2000)]);
        assert_eq!(l.cardinality(10), 40);
        assert_eq!(l.cardinality(100), 4);
    }

    #[test]
    fn test_adjacent_extents_collapse() {
        let l = list(&[(1000, 1500), (1500, 2000)]);
        assert_eq!(l.len(), 1);
        assert_eq!(l, list(&[(1000, 2000)]));
    }
}
