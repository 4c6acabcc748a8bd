//! Pipeline configuration.
//!
//! The pipeline is assembled at construction time from a
//! [`PipelineConfig`]: a tagged spec per stage (backbone, optional neck,
//! optional proposal stage, optional refinement stage) plus the train/test
//! configuration slices that get threaded into the stages that consume
//! them. Stage variants form a small closed set resolved from the spec
//! enums; there is no open-ended registry.
//!
//! Use [`PipelineConfigBuilder`] for step-by-step construction with
//! validation at `build()`:
//!
//! ```
//! use detpipe::{PipelineConfigBuilder, ProposalSpec, RefinementSpec};
//!
//! let config = PipelineConfigBuilder::new()
//!     .proposal(ProposalSpec::default())
//!     .refinement(RefinementSpec::default())
//!     .build()?;
//! # Ok::<(), detpipe::PipelineError>(())
//! ```

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Backbone selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BackboneSpec {
    /// Strided average-pooling pyramid: downsamples the input at strides
    /// 4, 8, 16, ... producing `num_levels` feature levels. A weight-free
    /// reference backbone; `pretrained` is recorded for variants that load
    /// weights but is ignored here.
    StridedPyramid {
        /// Number of pyramid levels to emit.
        num_levels: usize,
        /// Deprecated weight path forwarded from the pipeline config.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pretrained: Option<PathBuf>,
    },
}

impl Default for BackboneSpec {
    fn default() -> Self {
        Self::StridedPyramid {
            num_levels: 4,
            pretrained: None,
        }
    }
}

/// Neck selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NeckSpec {
    /// Collapses every level to `out_channels` channels by channel-group
    /// averaging, mimicking the shape contract of a feature pyramid
    /// network without learned weights.
    ChannelProject {
        /// Channel count of every output level.
        out_channels: usize,
    },
}

impl Default for NeckSpec {
    fn default() -> Self {
        Self::ChannelProject { out_channels: 1 }
    }
}

/// Proposal-stage selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProposalSpec {
    /// Class-agnostic anchor grid scored by feature activation.
    AnchorGrid {
        /// Grid stride in input pixels.
        stride: usize,
        /// Anchor side lengths in input pixels.
        scales: Vec<f32>,
    },
}

impl Default for ProposalSpec {
    fn default() -> Self {
        Self::AnchorGrid {
            stride: 16,
            scales: vec![32.0, 64.0, 128.0],
        }
    }
}

/// Refinement-stage selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RefinementSpec {
    /// Region head that re-scores proposals by pooled feature activation.
    ActivationRoi {
        /// Whether the head produces bounding-box detections. Without it
        /// the inference paths are unavailable.
        with_bbox: bool,
        /// Whether the head consumes instance masks during training.
        with_mask: bool,
        /// Whether the head can run under graph export.
        graph_export: bool,
    },
}

impl Default for RefinementSpec {
    fn default() -> Self {
        Self::ActivationRoi {
            with_bbox: true,
            with_mask: false,
            graph_export: true,
        }
    }
}

/// Proposal-generation parameters (test-time and `rpn_proposal` override).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProposalTestCfg {
    /// Maximum proposals kept per image.
    pub max_per_image: usize,
    /// Minimum objectness score.
    pub score_thr: f32,
}

impl Default for ProposalTestCfg {
    fn default() -> Self {
        Self {
            max_per_image: 1000,
            score_thr: 0.0,
        }
    }
}

/// Proposal-stage training parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProposalTrainCfg {
    /// IoU above which an anchor counts as covering a ground-truth box.
    pub pos_iou_thr: f32,
}

impl Default for ProposalTrainCfg {
    fn default() -> Self {
        Self { pos_iou_thr: 0.5 }
    }
}

/// Refinement-stage training parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RefineTrainCfg {
    /// IoU above which a proposal is assigned to a ground-truth box.
    pub pos_iou_thr: f32,
}

impl Default for RefineTrainCfg {
    fn default() -> Self {
        Self { pos_iou_thr: 0.5 }
    }
}

/// Refinement-stage test-time parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RefineTestCfg {
    /// Minimum detection confidence.
    pub score_thr: f32,
    /// Maximum detections kept per image.
    pub max_per_image: usize,
}

impl Default for RefineTestCfg {
    fn default() -> Self {
        Self {
            score_thr: 0.05,
            max_per_image: 100,
        }
    }
}

/// Training configuration, sliced per stage at construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Proposal-stage training slice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpn: Option<ProposalTrainCfg>,
    /// Training-time override for proposal generation; falls back to the
    /// test config's proposal slice when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpn_proposal: Option<ProposalTestCfg>,
    /// Refinement-stage training slice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rcnn: Option<RefineTrainCfg>,
}

/// Test configuration, sliced per stage at construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestConfig {
    /// Proposal-generation slice; mandatory when a proposal stage is
    /// configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpn: Option<ProposalTestCfg>,
    /// Refinement slice; mandatory when a refinement stage is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rcnn: Option<RefineTestCfg>,
}

/// Complete pipeline configuration.
///
/// Prefer [`PipelineConfigBuilder`], which validates cross-field
/// requirements at `build()`. A `PipelineConfig` assembled by hand is
/// validated again by [`TwoStagePipeline::new`](crate::TwoStagePipeline::new).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Backbone spec (always required).
    pub backbone: BackboneSpec,
    /// Optional neck spec; when present, the neck's output replaces the
    /// backbone's raw output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neck: Option<NeckSpec>,
    /// Optional proposal-stage spec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal: Option<ProposalSpec>,
    /// Optional refinement-stage spec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refinement: Option<RefinementSpec>,
    /// Training configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_cfg: Option<TrainConfig>,
    /// Test configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_cfg: Option<TestConfig>,
    /// Number of object classes tracked by the size statistics.
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Destination for the statistics snapshot written on every
    /// inference-mode call. `None` disables the implicit export; the
    /// explicit [`export_size_stats`](crate::TwoStagePipeline::export_size_stats)
    /// action is always available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats_export_path: Option<PathBuf>,
    /// Deprecated: weight path forwarded into the backbone spec with a
    /// warning. Use the backbone spec's own field instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pretrained: Option<PathBuf>,
}

#[inline]
fn default_num_classes() -> usize {
    crate::stats::DEFAULT_NUM_CLASSES
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            backbone: BackboneSpec::default(),
            neck: None,
            proposal: None,
            refinement: None,
            train_cfg: None,
            test_cfg: None,
            num_classes: default_num_classes(),
            stats_export_path: None,
            pretrained: None,
        }
    }
}

impl PipelineConfig {
    /// Validate cross-field requirements.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] when a configured stage is missing
    /// its mandatory test-config slice or `num_classes` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(PipelineError::config("num_classes must be at least 1"));
        }
        if self.proposal.is_some()
            && self.test_cfg.as_ref().and_then(|t| t.rpn).is_none()
        {
            return Err(PipelineError::config(
                "proposal stage configured without a proposal test config slice",
            ));
        }
        if self.refinement.is_some()
            && self.test_cfg.as_ref().and_then(|t| t.rcnn).is_none()
        {
            return Err(PipelineError::config(
                "refinement stage configured without a refinement test config slice",
            ));
        }
        Ok(())
    }
}

/// Builder for [`PipelineConfig`].
///
/// `new()` starts from the default backbone with no stages configured;
/// [`two_stage()`](Self::two_stage) starts from a full two-stage setup with
/// default train/test slices.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Start from the default (backbone-only) configuration.
    #[inline]
    #[must_use = "returns a new builder"]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a complete two-stage setup: default backbone, proposal
    /// and refinement stages, and default train/test slices.
    #[must_use = "returns a new builder"]
    pub fn two_stage() -> Self {
        Self {
            config: PipelineConfig {
                proposal: Some(ProposalSpec::default()),
                refinement: Some(RefinementSpec::default()),
                train_cfg: Some(TrainConfig {
                    rpn: Some(ProposalTrainCfg::default()),
                    rpn_proposal: None,
                    rcnn: Some(RefineTrainCfg::default()),
                }),
                test_cfg: Some(TestConfig {
                    rpn: Some(ProposalTestCfg::default()),
                    rcnn: Some(RefineTestCfg::default()),
                }),
                ..PipelineConfig::default()
            },
        }
    }

    /// Set the backbone spec.
    #[must_use = "builder pattern returns updated Self that should be used"]
    pub fn backbone(mut self, spec: BackboneSpec) -> Self {
        self.config.backbone = spec;
        self
    }

    /// Set the neck spec.
    #[must_use = "builder pattern returns updated Self that should be used"]
    pub fn neck(mut self, spec: NeckSpec) -> Self {
        self.config.neck = Some(spec);
        self
    }

    /// Set the proposal-stage spec. The test config must then carry a
    /// proposal slice; `build()` rejects the configuration otherwise.
    #[must_use = "builder pattern returns updated Self that should be used"]
    pub fn proposal(mut self, spec: ProposalSpec) -> Self {
        self.config.proposal = Some(spec);
        self
    }

    /// Set the refinement-stage spec.
    #[must_use = "builder pattern returns updated Self that should be used"]
    pub fn refinement(mut self, spec: RefinementSpec) -> Self {
        self.config.refinement = Some(spec);
        self
    }

    /// Set the training configuration.
    #[must_use = "builder pattern returns updated Self that should be used"]
    pub fn train_cfg(mut self, cfg: TrainConfig) -> Self {
        self.config.train_cfg = Some(cfg);
        self
    }

    /// Set the test configuration.
    #[must_use = "builder pattern returns updated Self that should be used"]
    pub fn test_cfg(mut self, cfg: TestConfig) -> Self {
        self.config.test_cfg = Some(cfg);
        self
    }

    /// Set the number of object classes tracked by the size statistics.
    #[must_use = "builder pattern returns updated Self that should be used"]
    pub fn num_classes(mut self, num_classes: usize) -> Self {
        self.config.num_classes = num_classes;
        self
    }

    /// Enable the implicit statistics export on every inference call.
    #[must_use = "builder pattern returns updated Self that should be used"]
    pub fn stats_export_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.stats_export_path = Some(path.into());
        self
    }

    /// Deprecated weight path, forwarded into the backbone spec at
    /// pipeline construction with a warning.
    #[must_use = "builder pattern returns updated Self that should be used"]
    pub fn pretrained(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pretrained = Some(path.into());
        self
    }

    /// Validate and produce the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] on cross-field violations; see
    /// [`PipelineConfig::validate`].
    pub fn build(self) -> Result<PipelineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
