//! Online ground-truth object-size statistics.
//!
//! During training, every ground-truth box is bucketed by its
//! original-image-space area into one of five size ranges and counted
//! against its class. The aggregate is a `[num_classes × 5]` count matrix
//! that grows monotonically for the lifetime of one pipeline instance; it
//! is never reset.
//!
//! A snapshot of the matrix can be serialized to JSON at any point. Each
//! class row is normalized by `sum(row) + 1` (the +1 avoids division by
//! zero and slightly biases unseen classes toward uniform) and written
//! together with the raw total, giving downstream analysis both the size
//! distribution and how much evidence backs it.

use crate::error::{PipelineError, Result};
use ndarray::Array2;
use serde::Serialize;
use std::path::Path;

/// Number of size buckets. The bucket edges are part of the exported
/// artifact schema and are not configurable.
pub const NUM_SIZE_BUCKETS: usize = 5;

/// Default number of object classes (COCO).
pub const DEFAULT_NUM_CLASSES: usize = 80;

/// Upper edges of the first four size buckets: 32², 64², 128², 256².
/// The fifth bucket is unbounded above. Buckets are open below and closed
/// above: an area of exactly 1024 falls in bucket 0.
const BUCKET_EDGES: [f32; 4] = [1024.0, 4096.0, 16384.0, 65536.0];

/// Serialized form of a statistics snapshot.
///
/// One row per class: the five normalized bucket shares followed by the
/// smoothed row total, i.e. `[n0, n1, n2, n3, n4, total]`.
#[derive(Debug, Clone, Serialize)]
pub struct SizeStatsSnapshot {
    /// Normalized rows concatenated with their raw (smoothed) totals.
    pub scale_total: Vec<Vec<f64>>,
}

/// Per-class × per-size-bucket count matrix over a stream of training
/// batches.
///
/// Owned by the pipeline and updated once per training step; the pipeline
/// takes `&mut self` on every entry point, so updates are single-writer by
/// construction.
///
/// # Examples
///
/// ```
/// use detpipe::SizeStatsAggregator;
///
/// let mut stats = SizeStatsAggregator::new(80);
/// stats.update(&[400.0, 5000.0], &[3, 3])?;
/// let snapshot = stats.snapshot();
/// // class 3 saw one small and one medium object, total 2 + 1 smoothing
/// assert_eq!(snapshot.scale_total[3][5], 3.0);
/// # Ok::<(), detpipe::PipelineError>(())
/// ```
#[derive(Debug, Clone)]
pub struct SizeStatsAggregator {
    counts: Array2<u64>,
}

impl SizeStatsAggregator {
    /// All-zero matrix for `num_classes` classes.
    #[must_use = "returns a new aggregator"]
    pub fn new(num_classes: usize) -> Self {
        Self {
            counts: Array2::zeros((num_classes, NUM_SIZE_BUCKETS)),
        }
    }

    /// Number of classes tracked.
    #[inline]
    #[must_use = "returns the number of classes"]
    pub fn num_classes(&self) -> usize {
        self.counts.nrows()
    }

    /// The raw count matrix.
    #[inline]
    #[must_use = "returns a reference to the count matrix"]
    pub fn counts(&self) -> &Array2<u64> {
        &self.counts
    }

    /// Bucket index for an area, or `None` for non-positive areas.
    #[inline]
    fn bucket(area: f32) -> Option<usize> {
        if area <= 0.0 {
            return None;
        }
        Some(
            BUCKET_EDGES
                .iter()
                .position(|&edge| area <= edge)
                .unwrap_or(NUM_SIZE_BUCKETS - 1),
        )
    }

    /// Record a batch of `(area, label)` observations.
    ///
    /// Exactly one cell is incremented per pair with a positive area;
    /// non-positive areas are silently skipped (no bucket matches them).
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] if the slices differ in length or
    /// a label is outside `[0, num_classes)`. Nothing is recorded in that
    /// case.
    pub fn update(&mut self, areas: &[f32], labels: &[usize]) -> Result<()> {
        if areas.len() != labels.len() {
            return Err(PipelineError::config(format!(
                "size statistics update with {} areas but {} labels",
                areas.len(),
                labels.len()
            )));
        }
        if let Some(&bad) = labels.iter().find(|&&l| l >= self.num_classes()) {
            return Err(PipelineError::config(format!(
                "label {bad} out of range for {} classes",
                self.num_classes()
            )));
        }
        for (&area, &label) in areas.iter().zip(labels) {
            if let Some(bucket) = Self::bucket(area) {
                self.counts[[label, bucket]] += 1;
            }
        }
        Ok(())
    }

    /// Normalized view of the current matrix.
    ///
    /// Pure read; the matrix is not reset. For a class with zero
    /// observations the normalized row is all zeros and the total is
    /// exactly 1.
    #[must_use = "returns the snapshot, leaving the matrix unchanged"]
    pub fn snapshot(&self) -> SizeStatsSnapshot {
        let scale_total = self
            .counts
            .rows()
            .into_iter()
            .map(|row| {
                let total = row.sum() as f64 + 1.0;
                let mut entry: Vec<f64> =
                    row.iter().map(|&c| c as f64 / total).collect();
                entry.push(total);
                entry
            })
            .collect();
        SizeStatsSnapshot { scale_total }
    }

    /// Serialize the current snapshot and write it to `path`.
    ///
    /// Overwrites the destination unconditionally; there is no atomic
    /// rename or backup, and the write is not synchronized against
    /// concurrent updates. Callers needing durability or a
    /// consistent-point-in-time view must wrap this themselves.
    ///
    /// # Errors
    ///
    /// Propagates serialization and filesystem errors; nothing is retried.
    pub fn export_snapshot(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

impl Default for SizeStatsAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_NUM_CLASSES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    // Boundaries are open below, closed above.
    #[case(1.0, 0)]
    #[case(1024.0, 0)]
    #[case(1025.0, 1)]
    #[case(4096.0, 1)]
    #[case(4097.0, 2)]
    #[case(16384.0, 2)]
    #[case(65536.0, 3)]
    #[case(65537.0, 4)]
    #[case(1.0e9, 4)]
    fn bucket_boundaries(#[case] area: f32, #[case] expected: usize) {
        assert_eq!(SizeStatsAggregator::bucket(area), Some(expected));
    }

    #[rstest]
    #[case(0.0)]
    #[case(-4.0)]
    fn non_positive_areas_have_no_bucket(#[case] area: f32) {
        assert_eq!(SizeStatsAggregator::bucket(area), None);
    }

    #[test]
    fn one_increment_per_positive_area() {
        let mut stats = SizeStatsAggregator::new(10);
        stats
            .update(&[400.0, 0.0, 2000.0, -1.0, 70000.0], &[1, 1, 2, 2, 3])
            .unwrap();
        // Three boxes with positive area, three increments in total.
        assert_eq!(stats.counts().sum(), 3);
        assert_eq!(stats.counts()[[1, 0]], 1);
        assert_eq!(stats.counts()[[2, 1]], 1);
        assert_eq!(stats.counts()[[3, 4]], 1);
    }

    #[test]
    fn mismatched_lengths_record_nothing() {
        let mut stats = SizeStatsAggregator::new(4);
        let err = stats.update(&[100.0, 200.0], &[0]).unwrap_err();
        assert!(err.is_config_error());
        assert_eq!(stats.counts().sum(), 0);
    }

    #[test]
    fn out_of_range_label_records_nothing() {
        let mut stats = SizeStatsAggregator::new(4);
        let err = stats.update(&[100.0, 200.0], &[0, 4]).unwrap_err();
        assert!(err.is_config_error());
        assert_eq!(stats.counts().sum(), 0);
    }

    #[test]
    fn unseen_class_row_is_zeros_with_total_one() {
        let stats = SizeStatsAggregator::new(3);
        let snap = stats.snapshot();
        for row in &snap.scale_total {
            assert_eq!(row, &vec![0.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
        }
    }

    #[test]
    fn normalized_row_sums_to_count_over_smoothed_total() {
        let mut stats = SizeStatsAggregator::new(5);
        stats.update(&[400.0, 400.0, 2000.0], &[2, 2, 2]).unwrap();
        let row = &stats.snapshot().scale_total[2];
        // total = 3 + 1, normalized columns sum to 3/4
        assert_eq!(row[5], 4.0);
        let norm_sum: f64 = row[..NUM_SIZE_BUCKETS].iter().sum();
        assert!((norm_sum - 0.75).abs() < 1e-12);
    }

    #[test]
    fn single_small_object_row() {
        // One 20x20 original-space box for class 3: bucket 0, total 1+1.
        let mut stats = SizeStatsAggregator::new(80);
        stats.update(&[400.0], &[3]).unwrap();
        let row = &stats.snapshot().scale_total[3];
        assert_eq!(row, &vec![0.5, 0.0, 0.0, 0.0, 0.0, 2.0]);
    }

    #[test]
    fn consecutive_exports_are_byte_identical() {
        let mut stats = SizeStatsAggregator::new(6);
        stats.update(&[500.0, 9000.0], &[0, 5]).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.json");
        let second = dir.path().join("second.json");
        stats.export_snapshot(&first).unwrap();
        stats.export_snapshot(&second).unwrap();

        let a = std::fs::read(&first).unwrap();
        let b = std::fs::read(&second).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn exported_json_schema() {
        let mut stats = SizeStatsAggregator::new(2);
        stats.update(&[400.0], &[0]).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        stats.export_snapshot(&path).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let rows = parsed["scale_total"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].as_array().unwrap().len(), NUM_SIZE_BUCKETS + 1);
        assert_eq!(rows[0][0].as_f64().unwrap(), 0.5);
        assert_eq!(rows[0][5].as_f64().unwrap(), 2.0);
    }
}
