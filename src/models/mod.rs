//! Pipeline stage interfaces and their built-in variants.
//!
//! Stages are polymorphic collaborators selected at construction time from
//! the tagged spec enums in [`crate::config`]; the pipeline only ever
//! talks to them through the traits defined here. The built-in variants
//! are weight-free reference implementations; learned stages plug in by
//! implementing the same traits.
//!
//! - `extractor`: [`Backbone`] / [`Neck`] traits and the
//!   [`FeatureExtractor`] wrapper that composes them.
//! - `proposal`: the class-agnostic [`ProposalStage`] trait and the
//!   anchor-grid reference proposer.
//! - `refinement`: the [`RefinementStage`] trait with its capability
//!   probes and the activation-scored reference head.

pub(crate) mod extractor;
pub(crate) mod proposal;
pub(crate) mod refinement;

pub use extractor::{Backbone, FeatureExtractor, Neck};
pub use proposal::{AnchorGridProposer, ProposalStage};
pub use refinement::{ActivationRoiHead, RefinementStage};
