//! Core data types flowing between pipeline stages.
//!
//! These types define the shape contracts of the pipeline: what a batch of
//! images looks like, what the stages exchange (feature pyramids, proposals,
//! detections), and how per-stage training losses are merged. The numeric
//! content of proposals and losses is owned by the stage implementations;
//! nothing here interprets it.

use crate::error::{PipelineError, Result};
use ndarray::{Array3, Array4};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Axis-aligned bounding box in `[tl_x, tl_y, br_x, br_y]` format.
///
/// Coordinates are in the resized (network input) image space unless a
/// stage has rescaled them back to the original image space.
///
/// # Examples
///
/// ```
/// use detpipe::BoundingBox;
///
/// let bbox = BoundingBox::new(10.0, 20.0, 110.0, 70.0);
/// assert_eq!(bbox.width(), 100.0);
/// assert_eq!(bbox.height(), 50.0);
/// assert_eq!(bbox.area(), 5000.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left x-coordinate (top-left corner).
    pub l: f32,
    /// Top y-coordinate (top-left corner).
    pub t: f32,
    /// Right x-coordinate (bottom-right corner).
    pub r: f32,
    /// Bottom y-coordinate (bottom-right corner).
    pub b: f32,
}

impl BoundingBox {
    /// Create a box from top-left and bottom-right corners.
    #[inline]
    #[must_use = "returns a new bounding box"]
    pub const fn new(l: f32, t: f32, r: f32, b: f32) -> Self {
        Self { l, t, r, b }
    }

    /// Box width (`r - l`).
    #[inline]
    #[must_use = "returns the box width"]
    pub fn width(&self) -> f32 {
        self.r - self.l
    }

    /// Box height (`b - t`).
    #[inline]
    #[must_use = "returns the box height"]
    pub fn height(&self) -> f32 {
        self.b - self.t
    }

    /// Box area (`width * height`).
    #[inline]
    #[must_use = "returns the box area"]
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Box scaled by independent x/y factors, anchored at the origin.
    ///
    /// Dividing by the resize scale factor maps a box back into the
    /// original image's coordinate space.
    #[inline]
    #[must_use = "returns the scaled box, leaving self unchanged"]
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self {
            l: self.l * sx,
            t: self.t * sy,
            r: self.r * sx,
            b: self.b * sy,
        }
    }

    /// Fraction of this box's area covered by `other`. Zero for disjoint
    /// or degenerate boxes.
    #[must_use = "returns the covered fraction"]
    pub fn covered_fraction(&self, other: &Self) -> f32 {
        let il = self.l.max(other.l);
        let it = self.t.max(other.t);
        let ir = self.r.min(other.r);
        let ib = self.b.min(other.b);
        if ir <= il || ib <= it || self.area() <= 0.0 {
            return 0.0;
        }
        (ir - il) * (ib - it) / self.area()
    }

    /// Intersection-over-union with another box. Zero for disjoint or
    /// degenerate boxes.
    #[must_use = "returns the IoU value"]
    pub fn iou(&self, other: &Self) -> f32 {
        let il = self.l.max(other.l);
        let it = self.t.max(other.t);
        let ir = self.r.min(other.r);
        let ib = self.b.min(other.b);
        if ir <= il || ib <= it {
            return 0.0;
        }
        let inter = (ir - il) * (ib - it);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// A batch of normalized images in N×C×H×W layout.
///
/// All images in a batch share spatial dimensions after padding; the batch
/// tensor enforces that by construction. Pixel normalization happens
/// upstream of the pipeline.
#[derive(Debug, Clone)]
pub struct ImageBatch(Array4<f32>);

impl ImageBatch {
    /// Wrap an N×C×H×W tensor.
    #[inline]
    #[must_use = "returns a new image batch"]
    pub fn new(tensor: Array4<f32>) -> Self {
        Self(tensor)
    }

    /// Number of images in the batch.
    #[inline]
    #[must_use = "returns the batch size"]
    pub fn len(&self) -> usize {
        self.0.shape()[0]
    }

    /// True if the batch holds no images.
    #[inline]
    #[must_use = "returns whether the batch is empty"]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Padded spatial dimensions as `(height, width)`.
    #[inline]
    #[must_use = "returns the spatial dimensions"]
    pub fn spatial_shape(&self) -> (usize, usize) {
        let s = self.0.shape();
        (s[2], s[3])
    }

    /// The underlying tensor.
    #[inline]
    #[must_use = "returns a reference to the underlying tensor"]
    pub fn tensor(&self) -> &Array4<f32> {
        &self.0
    }
}

/// Per-image metadata record, immutable once constructed.
///
/// Shapes are `(height, width)`. `scale_factor` is the per-axis resize
/// factor applied when mapping the original image into network input
/// space; dividing resized coordinates by it recovers original-space
/// coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMeta {
    /// Original image shape before any resizing.
    pub ori_shape: (usize, usize),
    /// Shape after resizing, before padding.
    pub img_shape: (usize, usize),
    /// Shape after padding to the batch's common dimensions.
    pub pad_shape: (usize, usize),
    /// Per-axis resize factor `[x, y]`.
    pub scale_factor: [f32; 2],
    /// Whether the image was horizontally flipped.
    pub flip: bool,
    /// Source filename, when known.
    pub filename: Option<String>,
    /// Spatial shape injected by the graph-export path, computed from the
    /// image tensor itself rather than from upstream metadata. `None` on
    /// every other path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_shape: Option<(usize, usize)>,
}

impl ImageMeta {
    /// Metadata for an image used at its native size (scale factor 1).
    #[must_use = "returns a new image meta record"]
    pub fn unscaled(height: usize, width: usize) -> Self {
        Self {
            ori_shape: (height, width),
            img_shape: (height, width),
            pad_shape: (height, width),
            scale_factor: [1.0, 1.0],
            flip: false,
            filename: None,
            graph_shape: None,
        }
    }
}

/// Multi-level feature representation produced by the feature extractor.
///
/// One tensor per pyramid level, finest resolution first. Produced fresh on
/// every call and consumed by the proposal and refinement stages; never
/// retained across calls.
#[derive(Debug, Clone)]
pub struct FeatureMap {
    /// Per-level N×C×H×W feature tensors.
    pub levels: Vec<Array4<f32>>,
}

impl FeatureMap {
    /// Number of pyramid levels.
    #[inline]
    #[must_use = "returns the number of pyramid levels"]
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }
}

/// A region proposal: candidate box plus objectness score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Proposal {
    /// Candidate box.
    pub bbox: BoundingBox,
    /// Objectness score in `[0, 1]`.
    pub score: f32,
}

/// Proposals for a batch, outer index = image index.
pub type ProposalList = Vec<Vec<Proposal>>;

/// A final detection: box, confidence, and class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    /// Detected box.
    pub bbox: BoundingBox,
    /// Confidence score in `[0, 1]`.
    pub score: f32,
    /// Class index in `[0, num_classes)`.
    pub class_id: usize,
}

/// Detections for a batch, outer index = image index.
pub type Detections = Vec<Vec<Detection>>;

/// Ground-truth annotations for one image.
///
/// `boxes` and `labels` are index-aligned and must have equal length.
/// Supplied by the caller and never mutated by the pipeline.
#[derive(Debug, Clone, Default)]
pub struct GroundTruth {
    /// Annotated boxes in resized-image space.
    pub boxes: Vec<BoundingBox>,
    /// Class label per box.
    pub labels: Vec<usize>,
    /// Regions excluded from loss computation.
    pub ignore_boxes: Vec<BoundingBox>,
    /// Instance segmentation masks, `[num_boxes, height, width]`, when the
    /// refinement stage supports a segmentation task.
    pub masks: Option<Array3<u8>>,
}

impl GroundTruth {
    /// Annotations with boxes and labels only.
    #[must_use = "returns a new ground-truth record"]
    pub fn new(boxes: Vec<BoundingBox>, labels: Vec<usize>) -> Self {
        Self {
            boxes,
            labels,
            ignore_boxes: Vec::new(),
            masks: None,
        }
    }
}

/// Mapping from loss-component name to scalar value.
///
/// Each training-mode stage returns its own map; the orchestrator merges
/// them by key union. Keys must be disjoint across stages: a collision
/// means two stages claim the same loss component, which is reported as a
/// configuration error rather than silently overwritten.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossMap(HashMap<String, f32>);

impl LossMap {
    /// Empty loss map.
    #[inline]
    #[must_use = "returns a new empty loss map"]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a loss component, replacing any previous value for the key.
    ///
    /// Within a single stage, re-inserting a key is the stage's own
    /// business; only cross-stage merges enforce disjointness.
    #[inline]
    pub fn insert(&mut self, key: impl Into<String>, value: f32) {
        self.0.insert(key.into(), value);
    }

    /// Value for a loss component, if present.
    #[inline]
    #[must_use = "returns the loss value if present"]
    pub fn get(&self, key: &str) -> Option<f32> {
        self.0.get(key).copied()
    }

    /// Number of loss components.
    #[inline]
    #[must_use = "returns the number of loss components"]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no components have been recorded.
    #[inline]
    #[must_use = "returns whether the map is empty"]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(name, value)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Merge another stage's losses into this map by key union.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] if any key already exists; the map
    /// is left unmodified in that case.
    pub fn merge(&mut self, other: LossMap) -> Result<()> {
        if let Some(dup) = other.0.keys().find(|k| self.0.contains_key(*k)) {
            return Err(PipelineError::config(format!(
                "loss key '{dup}' produced by more than one stage"
            )));
        }
        self.0.extend(other.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_geometry() {
        let b = BoundingBox::new(0.0, 0.0, 40.0, 40.0);
        assert_eq!(b.area(), 1600.0);
        let half = b.scaled(0.5, 0.5);
        assert_eq!(half.area(), 400.0);
    }

    #[test]
    fn bbox_iou_disjoint_is_zero() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn loss_map_merge_disjoint_keys() {
        let mut a = LossMap::new();
        a.insert("rpn.cls", 0.5);
        let mut b = LossMap::new();
        b.insert("rcnn.cls", 0.25);
        b.insert("rcnn.bbox", 0.1);
        a.merge(b).unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(a.get("rcnn.bbox"), Some(0.1));
    }

    #[test]
    fn loss_map_merge_collision_is_config_error() {
        let mut a = LossMap::new();
        a.insert("rcnn.cls", 0.5);
        let mut b = LossMap::new();
        b.insert("rcnn.cls", 0.7);
        let err = a.merge(b).unwrap_err();
        assert!(err.is_config_error());
        // The map must be untouched on failure.
        assert_eq!(a.get("rcnn.cls"), Some(0.5));
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn image_batch_shape_accessors() {
        let batch = ImageBatch::new(Array4::zeros((2, 3, 64, 80)));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.spatial_shape(), (64, 80));
        assert!(!batch.is_empty());
    }
}
