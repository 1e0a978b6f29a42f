//! In-memory model of a time-series query result
//!
//! A [`Timeseries`] is a set of named series, each holding step-aligned
//! samples, plus the [`ExtentList`] describing which time ranges the data
//! actually covers. Merge, crop and sort are the primitives the delta
//! cache composes: merge unions fresh origin data into a cached object,
//! crop carves out the client's requested window.

pub mod extent;

pub use extent::{Extent, ExtentList};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub timestamp: i64,
    pub value: f64,
}

/// One named series: a label set and its samples in timestamp order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    /// Label set identifying the series. BTreeMap keeps key order stable
    /// so serialization round-trips byte-identically.
    pub metric: BTreeMap<String, String>,
    pub points: Vec<DataPoint>,
}

impl Series {
    /// Stable identity for matching series across fragments
    pub fn key(&self) -> String {
        let mut key = String::new();
        for (name, value) in &self.metric {
            key.push_str(name);
            key.push('=');
            key.push_str(value);
            key.push(';');
        }
        key
    }
}

/// A complete query result with coverage bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeseries {
    pub step: i64,
    pub series: Vec<Series>,
    pub extents: ExtentList,
}

impl Timeseries {
    pub fn new(step: i64) -> Self {
        Timeseries {
            step,
            series: Vec::new(),
            extents: ExtentList::new(),
        }
    }

    /// Total number of samples across all series
    pub fn sample_count(&self) -> usize {
        self.series.iter().map(|s| s.points.len()).sum()
    }

    /// Merge another timeseries into this one.
    ///
    /// Samples are unioned by timestamp within each series; on a timestamp
    /// collision the incoming sample wins. The incoming extents are merged
    /// and coalesced into this object's extent list.
    pub fn merge(&mut self, other: Timeseries) {
        for incoming in other.series {
            match self.series.iter_mut().find(|s| s.key() == incoming.key()) {
                Some(existing) => {
                    existing.points.extend(incoming.points);
                }
                None => self.series.push(incoming),
            }
        }
        self.extents.merge(&other.extents);
        self.sort();
    }

    /// Restore strictly-increasing timestamp order in every series,
    /// keeping the newest sample on a timestamp collision.
    pub fn sort(&mut self) {
        for series in &mut self.series {
            // stable sort keeps later-merged (newer) samples after earlier
            // ones, so the dedup below retains the newest
            series.points.sort_by_key(|p| p.timestamp);
            let mut deduped: Vec<DataPoint> = Vec::with_capacity(series.points.len());
            for point in series.points.drain(..) {
                match deduped.last_mut() {
                    Some(last) if last.timestamp == point.timestamp => *last = point,
                    _ => deduped.push(point),
                }
            }
            series.points = deduped;
        }
        self.series.sort_by_key(|s| s.key());
    }

    /// Drop all samples outside `range` and intersect the extent list.
    /// Series left without samples are removed.
    pub fn crop(&mut self, range: &Extent) {
        for series in &mut self.series {
            series.points.retain(|p| range.contains(p.timestamp));
        }
        self.series.retain(|s| !s.points.is_empty());
        self.extents = self.extents.crop(range);
    }

    /// Verify the model invariants after a merge: extents sorted, disjoint
    /// and coalesced; timestamps strictly increasing and step-aligned;
    /// every sample covered by an extent.
    pub fn validate(&self) -> Result<(), String> {
        for window in self.extents.0.windows(2) {
            if window[0].end >= window[1].start {
                return Err(format!(
                    "extents not disjoint: {} then {}",
                    window[0], window[1]
                ));
            }
        }
        for series in &self.series {
            let mut prev: Option<i64> = None;
            for point in &series.points {
                if self.step > 0 && point.timestamp % self.step != 0 {
                    return Err(format!(
                        "timestamp {} not aligned to step {}",
                        point.timestamp, self.step
                    ));
                }
                if let Some(p) = prev {
                    if point.timestamp <= p {
                        return Err(format!(
                            "timestamps not strictly increasing at {}",
                            point.timestamp
                        ));
                    }
                }
                if !self.extents.0.iter().any(|e| e.contains(point.timestamp)) {
                    return Err(format!("sample at {} outside all extents", point.timestamp));
                }
                prev = Some(point.timestamp);
            }
        }
        Ok(())
    }
}
