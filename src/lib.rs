//! # detpipe - Two-Stage Object Detection Pipeline Orchestration
//!
//! Coordinates a two-stage detection pipeline (feature extractor, region
//! proposal stage, region refinement stage) across training, single-pass
//! inference, augmented multi-view inference, and graph export, plus an
//! online per-class object-size statistics aggregator serialized to JSON.
//!
//! The stages are pluggable collaborators behind traits
//! ([`ProposalStage`], [`RefinementStage`]), selected at construction from
//! tagged spec enums. The crate ships weight-free reference variants so
//! the orchestration runs end to end without model weights; the numeric
//! internals of learned stages are deliberately outside this crate's
//! scope.
//!
//! ## Quick Start
//!
//! ```
//! use detpipe::{
//!     BoundingBox, GroundTruth, ImageBatch, ImageMeta, PipelineConfigBuilder,
//!     TwoStagePipeline,
//! };
//! use ndarray::Array4;
//!
//! # fn main() -> detpipe::Result<()> {
//! let config = PipelineConfigBuilder::two_stage().num_classes(20).build()?;
//! let mut pipeline = TwoStagePipeline::new(config)?;
//!
//! let images = ImageBatch::new(Array4::from_elem((1, 3, 64, 64), 0.5));
//! let metas = vec![ImageMeta::unscaled(64, 64)];
//!
//! // Training: merged loss map from both stages.
//! let ground_truth = vec![GroundTruth::new(
//!     vec![BoundingBox::new(8.0, 8.0, 40.0, 40.0)],
//!     vec![3],
//! )];
//! let losses = pipeline.train_step(&images, &metas, &ground_truth, None)?;
//! assert!(losses.get("rpn.cls").is_some());
//! assert!(losses.get("rcnn.cls").is_some());
//!
//! // Inference: final detections per image.
//! let detections = pipeline.infer(&images, &metas, None, false)?;
//! assert_eq!(detections.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All public APIs return [`Result<T>`] wrapping [`PipelineError`];
//! contract violations (missing proposal source, loss-key collisions) are
//! configuration errors, missing stage capabilities are probed before
//! dispatch, and snapshot-export I/O failures propagate unretried. See
//! [`error`] for the full taxonomy.
//!
//! ## Size Statistics
//!
//! During training every ground-truth box is counted into a per-class ×
//! per-size-bucket matrix (original-image-space areas). The snapshot can
//! be exported explicitly via
//! [`TwoStagePipeline::export_size_stats`], or implicitly on every
//! inference call by configuring
//! [`stats_export_path`](PipelineConfigBuilder::stats_export_path); see
//! [`stats`] for the artifact schema.

pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod stats;

pub use config::{
    BackboneSpec, NeckSpec, PipelineConfig, PipelineConfigBuilder, ProposalSpec,
    ProposalTestCfg, ProposalTrainCfg, RefineTestCfg, RefineTrainCfg, RefinementSpec,
    TestConfig, TrainConfig,
};
pub use error::{PipelineError, Result};
pub use models::{Backbone, FeatureExtractor, Neck, ProposalStage, RefinementStage};
pub use pipeline::{
    BoundingBox, Detection, Detections, FeatureMap, GroundTruth, ImageBatch, ImageMeta,
    LossMap, Proposal, ProposalList, TwoStagePipeline,
};
pub use stats::{SizeStatsAggregator, SizeStatsSnapshot, DEFAULT_NUM_CLASSES, NUM_SIZE_BUCKETS};
