//! Pipeline orchestration: data contracts plus the two-stage state
//! machine.
//!
//! ## Execution modes
//!
//! One [`TwoStagePipeline`] instance moves between four modes, all driven
//! by the caller:
//!
//! - **Training** ([`TwoStagePipeline::train_step`]): features → size
//!   statistics update → proposal losses (or external proposals) →
//!   refinement losses, merged by key union.
//! - **Inference** ([`TwoStagePipeline::infer`] /
//!   [`TwoStagePipeline::infer_async`]): optional statistics export, then
//!   features → proposals → detections.
//! - **Augmented inference** ([`TwoStagePipeline::infer_augmented`]):
//!   the same flow over multiple geometric views, with the proposal stage
//!   merging across views.
//! - **Graph export** ([`TwoStagePipeline::export_graph`]): a tracing
//!   variant that derives the spatial shape from the tensor itself; meant
//!   to run from a construction- or checkpoint-fresh instance, not
//!   interleaved with the other modes.
//!
//! No mode transition mutates construction-time configuration.
//!
//! ## Module organization
//!
//! - `data_structures`: shape contracts exchanged between stages.
//! - `orchestrator`: the [`TwoStagePipeline`] itself.

pub(crate) mod data_structures;
pub(crate) mod orchestrator;

pub use data_structures::{
    BoundingBox, Detection, Detections, FeatureMap, GroundTruth, ImageBatch, ImageMeta,
    LossMap, Proposal, ProposalList,
};
pub use orchestrator::TwoStagePipeline;
