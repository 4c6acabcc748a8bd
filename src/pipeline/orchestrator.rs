//! The two-stage pipeline orchestrator.

use crate::config::{PipelineConfig, ProposalTestCfg};
use crate::error::{PipelineError, Result};
use crate::models::extractor::{build_backbone, build_neck, FeatureExtractor};
use crate::models::proposal::build_proposal;
use crate::models::refinement::build_refinement;
use crate::models::{ProposalStage, RefinementStage};
use crate::pipeline::{
    BoundingBox, Detections, FeatureMap, GroundTruth, ImageBatch, ImageMeta, LossMap,
    Proposal, ProposalList,
};
use crate::stats::SizeStatsAggregator;
use std::path::{Path, PathBuf};

/// Composes a feature extractor, an optional proposal stage, and an
/// optional refinement stage into the four pipeline execution modes.
///
/// Every entry point takes `&mut self`: the instance owns the
/// ground-truth size statistics, and exclusive access makes histogram
/// updates single-writer by construction. Run concurrent calls on
/// separate instances.
///
/// # Examples
///
/// ```
/// use detpipe::{PipelineConfigBuilder, TwoStagePipeline, ImageBatch, ImageMeta};
/// use ndarray::Array4;
///
/// let config = PipelineConfigBuilder::two_stage().build()?;
/// let mut pipeline = TwoStagePipeline::new(config)?;
///
/// let images = ImageBatch::new(Array4::from_elem((1, 3, 64, 64), 0.5));
/// let metas = vec![ImageMeta::unscaled(64, 64)];
/// let detections = pipeline.infer(&images, &metas, None, false)?;
/// assert_eq!(detections.len(), 1);
/// # Ok::<(), detpipe::PipelineError>(())
/// ```
pub struct TwoStagePipeline {
    extractor: FeatureExtractor,
    proposal_stage: Option<Box<dyn ProposalStage>>,
    refinement_stage: Option<Box<dyn RefinementStage>>,
    /// Training-time proposal-generation override, resolved at
    /// construction: `train_cfg.rpn_proposal` when present, else the test
    /// config's proposal slice.
    train_proposal_cfg: Option<ProposalTestCfg>,
    stats: SizeStatsAggregator,
    stats_export_path: Option<PathBuf>,
}

impl TwoStagePipeline {
    /// Build the pipeline from its configuration.
    ///
    /// A deprecated `pretrained` path is forwarded into the backbone spec
    /// with a warning rather than failing.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] when a configured stage is
    /// missing its mandatory test-config slice (see
    /// [`PipelineConfig::validate`]).
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;

        let mut backbone_spec = config.backbone.clone();
        if let Some(path) = &config.pretrained {
            log::warn!(
                "`pretrained` on the pipeline config is deprecated; set it on the \
                 backbone spec instead (forwarding {})",
                path.display()
            );
            let crate::config::BackboneSpec::StridedPyramid { pretrained, .. } =
                &mut backbone_spec;
            *pretrained = Some(path.clone());
        }

        let extractor = FeatureExtractor::new(
            build_backbone(&backbone_spec),
            config.neck.as_ref().map(build_neck),
        );

        let train_cfg = config.train_cfg.clone().unwrap_or_default();

        let proposal_stage = config
            .proposal
            .as_ref()
            .map(|spec| {
                // validate() guarantees the slice is present.
                let test_slice = config
                    .test_cfg
                    .as_ref()
                    .and_then(|t| t.rpn)
                    .ok_or_else(|| {
                        PipelineError::config(
                            "proposal stage configured without a proposal test config slice",
                        )
                    })?;
                Ok::<_, PipelineError>(build_proposal(spec, train_cfg.rpn, test_slice))
            })
            .transpose()?;

        let refinement_stage = config
            .refinement
            .as_ref()
            .map(|spec| {
                let test_slice = config
                    .test_cfg
                    .as_ref()
                    .and_then(|t| t.rcnn)
                    .ok_or_else(|| {
                        PipelineError::config(
                            "refinement stage configured without a refinement test config slice",
                        )
                    })?;
                Ok::<_, PipelineError>(build_refinement(
                    spec,
                    config.num_classes,
                    train_cfg.rcnn,
                    test_slice,
                ))
            })
            .transpose()?;

        let train_proposal_cfg = train_cfg
            .rpn_proposal
            .or_else(|| config.test_cfg.as_ref().and_then(|t| t.rpn));

        Ok(Self {
            extractor,
            proposal_stage,
            refinement_stage,
            train_proposal_cfg,
            stats: SizeStatsAggregator::new(config.num_classes),
            stats_export_path: config.stats_export_path,
        })
    }

    /// True iff a proposal stage was constructed.
    #[inline]
    #[must_use = "returns whether a proposal stage is configured"]
    pub fn has_proposal_stage(&self) -> bool {
        self.proposal_stage.is_some()
    }

    /// True iff a refinement stage was constructed.
    #[inline]
    #[must_use = "returns whether a refinement stage is configured"]
    pub fn has_refinement_stage(&self) -> bool {
        self.refinement_stage.is_some()
    }

    /// The accumulated ground-truth size statistics.
    #[inline]
    #[must_use = "returns a reference to the size statistics"]
    pub fn size_stats(&self) -> &SizeStatsAggregator {
        &self.stats
    }

    /// Explicitly export the current statistics snapshot.
    ///
    /// Same serializer as the implicit per-inference export, so the two
    /// produce byte-identical artifacts for an unchanged matrix.
    ///
    /// # Errors
    ///
    /// Propagates serialization and filesystem errors.
    pub fn export_size_stats(&self, path: &Path) -> Result<()> {
        self.stats.export_snapshot(path)
    }

    /// Run the feature extractor: backbone, then the neck when configured.
    pub fn extract_feat(&self, images: &ImageBatch) -> Result<FeatureMap> {
        self.extractor.forward(images)
    }

    /// One training step over a batch.
    ///
    /// Ground-truth object sizes are recorded into the statistics matrix
    /// (in original-image space, recovered via the horizontal scale
    /// factor) before any stage computes losses. Stage losses are merged
    /// by key union; a key collision is a configuration error.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] when no refinement stage is
    /// configured, or when neither a proposal stage nor
    /// `external_proposals` provides a proposal source. Both checks run
    /// before any state is mutated, so a failed call leaves the
    /// statistics matrix untouched.
    pub fn train_step(
        &mut self,
        images: &ImageBatch,
        metas: &[ImageMeta],
        ground_truth: &[GroundTruth],
        external_proposals: Option<&ProposalList>,
    ) -> Result<LossMap> {
        // Contract checks first: a rejected call must not mutate the
        // statistics matrix.
        if self.refinement_stage.is_none() {
            return Err(PipelineError::config(
                "training requires a refinement stage",
            ));
        }
        if self.proposal_stage.is_none() && external_proposals.is_none() {
            return Err(PipelineError::config(
                "no proposal source: configure a proposal stage or supply external proposals",
            ));
        }

        let features = self.extract_feat(images)?;

        // Record ground-truth sizes before stage losses, so the statistics
        // reflect pre-resize object sizes regardless of training outcome.
        for (meta, gt) in metas.iter().zip(ground_truth) {
            if gt.boxes.is_empty() {
                continue;
            }
            let sx = meta.scale_factor[0];
            let areas: Vec<f32> = gt
                .boxes
                .iter()
                .map(|b| (b.width() / sx) * (b.height() / sx))
                .collect();
            self.stats.update(&areas, &gt.labels)?;
        }

        let mut losses = LossMap::new();

        let proposal_list: ProposalList = match &self.proposal_stage {
            Some(stage) => {
                let proposal_cfg = self.train_proposal_cfg.unwrap_or_default();
                let gt_boxes: Vec<Vec<BoundingBox>> =
                    ground_truth.iter().map(|gt| gt.boxes.clone()).collect();
                let ignore_boxes: Vec<Vec<BoundingBox>> = ground_truth
                    .iter()
                    .map(|gt| gt.ignore_boxes.clone())
                    .collect();
                let (stage_losses, proposals) = stage.train_step(
                    &features,
                    metas,
                    &gt_boxes,
                    &ignore_boxes,
                    &proposal_cfg,
                )?;
                losses.merge(stage_losses)?;
                proposals
            }
            // Checked above: external proposals must exist on this branch.
            None => external_proposals.cloned().unwrap_or_default(),
        };

        let stage_losses = match &self.refinement_stage {
            Some(stage) => stage.train_step(&features, metas, &proposal_list, ground_truth)?,
            None => unreachable!("refinement stage checked at entry"),
        };
        losses.merge(stage_losses)?;

        log::trace!(
            "train step over {} images produced {} loss components",
            images.len(),
            losses.len()
        );
        Ok(losses)
    }

    /// Single-pass inference without augmentation.
    ///
    /// Exports the statistics snapshot first when an export path is
    /// configured, then runs features → proposals → refinement. The
    /// refinement result is returned unmodified.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Capability`] when no refinement stage with
    /// bounding-box support is configured, and [`PipelineError::Config`]
    /// when no proposal source is available.
    pub fn infer(
        &mut self,
        images: &ImageBatch,
        metas: &[ImageMeta],
        external_proposals: Option<&ProposalList>,
        rescale: bool,
    ) -> Result<Detections> {
        let refinement = self.require_bbox_refinement()?;
        if self.proposal_stage.is_none() && external_proposals.is_none() {
            return Err(PipelineError::config(
                "no proposal source: configure a proposal stage or supply external proposals",
            ));
        }
        self.maybe_export_stats()?;

        let features = self.extract_feat(images)?;
        let proposal_list = match (&self.proposal_stage, external_proposals) {
            (_, Some(proposals)) => proposals.clone(),
            (Some(stage), None) => stage.infer(&features, metas)?,
            (None, None) => unreachable!("checked above"),
        };
        refinement.infer(&features, &proposal_list, metas, rescale)
    }

    /// Awaitable variant of [`infer`](Self::infer).
    ///
    /// Suspension points occur at exactly the two stage calls; the
    /// statistics export happens before either, so cancelling the future
    /// cannot observe partial state.
    pub async fn infer_async(
        &mut self,
        images: &ImageBatch,
        metas: &[ImageMeta],
        external_proposals: Option<&ProposalList>,
        rescale: bool,
    ) -> Result<Detections> {
        let refinement = self.require_bbox_refinement()?;
        if self.proposal_stage.is_none() && external_proposals.is_none() {
            return Err(PipelineError::config(
                "no proposal source: configure a proposal stage or supply external proposals",
            ));
        }
        self.maybe_export_stats()?;

        let features = self.extract_feat(images)?;
        let proposal_list = match (&self.proposal_stage, external_proposals) {
            (_, Some(proposals)) => proposals.clone(),
            (Some(stage), None) => stage.infer_async(&features, metas).await?,
            (None, None) => unreachable!("checked above"),
        };
        refinement
            .infer_async(&features, &proposal_list, metas, rescale)
            .await
    }

    /// Inference over multiple geometric views of the same image set.
    ///
    /// The proposal stage owns the cross-view merge; the refinement stage
    /// consumes the merged proposals together with every view's features.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] without a proposal stage and
    /// [`PipelineError::Capability`] without bounding-box refinement.
    pub fn infer_augmented(
        &mut self,
        batches: &[ImageBatch],
        metas_per_view: &[Vec<ImageMeta>],
        rescale: bool,
    ) -> Result<Detections> {
        let refinement = self.require_bbox_refinement()?;
        let Some(proposal_stage) = &self.proposal_stage else {
            return Err(PipelineError::config(
                "augmented inference requires a proposal stage",
            ));
        };
        self.maybe_export_stats()?;

        let features_per_view: Vec<FeatureMap> = batches
            .iter()
            .map(|batch| self.extract_feat(batch))
            .collect::<Result<_>>()?;
        let proposal_list =
            proposal_stage.infer_augmented(&features_per_view, metas_per_view)?;
        refinement.infer_augmented(&features_per_view, &proposal_list, metas_per_view, rescale)
    }

    /// Graph/tracing export path.
    ///
    /// The spatial shape is computed from the image tensor itself (not
    /// from upstream metadata) and injected into the metas for
    /// shape-dependent stages.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] without a proposal stage, and
    /// [`PipelineError::Capability`] naming the refinement variant when it
    /// does not support graph export.
    pub fn export_graph(
        &mut self,
        images: &ImageBatch,
        metas: &[ImageMeta],
    ) -> Result<Detections> {
        let Some(proposal_stage) = &self.proposal_stage else {
            return Err(PipelineError::config(
                "graph export requires a proposal stage",
            ));
        };
        let Some(refinement) = &self.refinement_stage else {
            return Err(PipelineError::config(
                "graph export requires a refinement stage",
            ));
        };
        if !refinement.supports_graph_export() {
            return Err(PipelineError::capability(refinement.name(), "graph export"));
        }

        let graph_shape = images.spatial_shape();
        let export_metas: Vec<ImageMeta> = metas
            .iter()
            .map(|meta| ImageMeta {
                graph_shape: Some(graph_shape),
                ..meta.clone()
            })
            .collect();

        let features = self.extract_feat(images)?;
        let proposal_list = proposal_stage.export_graph(&features, &export_metas)?;
        refinement.export_graph(&features, &proposal_list, &export_metas)
    }

    /// Forward pass used for complexity measurement: runs every configured
    /// stage against a fixed dummy proposal set and returns the proposal
    /// outputs (when a proposal stage exists) alongside the refinement
    /// outputs.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] without a refinement stage.
    pub fn forward_dummy(
        &mut self,
        images: &ImageBatch,
        metas: &[ImageMeta],
    ) -> Result<(Option<ProposalList>, Detections)> {
        let Some(refinement) = &self.refinement_stage else {
            return Err(PipelineError::config(
                "dummy forward requires a refinement stage",
            ));
        };
        let features = self.extract_feat(images)?;
        let proposal_outputs = self
            .proposal_stage
            .as_ref()
            .map(|stage| stage.infer(&features, metas))
            .transpose()?;

        let (h, w) = images.spatial_shape();
        let dummy: ProposalList = metas
            .iter()
            .map(|_| dummy_proposals(h as f32, w as f32))
            .collect();
        let detections = refinement.infer(&features, &dummy, metas, false)?;
        Ok((proposal_outputs, detections))
    }

    fn require_bbox_refinement(&self) -> Result<&dyn RefinementStage> {
        match &self.refinement_stage {
            Some(stage) if stage.supports_bbox() => Ok(stage.as_ref()),
            Some(stage) => Err(PipelineError::capability(
                stage.name(),
                "bounding-box output",
            )),
            None => Err(PipelineError::config(
                "inference requires a refinement stage",
            )),
        }
    }

    fn maybe_export_stats(&self) -> Result<()> {
        if let Some(path) = &self.stats_export_path {
            self.stats.export_snapshot(path)?;
            log::trace!("exported size statistics to {}", path.display());
        }
        Ok(())
    }
}

/// Fixed centered boxes covering three scales, used by the dummy forward.
fn dummy_proposals(h: f32, w: f32) -> Vec<Proposal> {
    [0.25f32, 0.5, 0.75]
        .iter()
        .map(|&frac| {
            let bw = w * frac / 2.0;
            let bh = h * frac / 2.0;
            Proposal {
                bbox: BoundingBox::new(
                    w / 2.0 - bw,
                    h / 2.0 - bh,
                    w / 2.0 + bw,
                    h / 2.0 + bh,
                ),
                score: 1.0,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfigBuilder;
    use ndarray::Array4;

    fn batch(n: usize) -> ImageBatch {
        ImageBatch::new(Array4::from_elem((n, 3, 64, 64), 0.5))
    }

    #[test]
    fn capability_booleans_follow_configuration() {
        let backbone_only =
            TwoStagePipeline::new(PipelineConfigBuilder::new().build().unwrap()).unwrap();
        assert!(!backbone_only.has_proposal_stage());
        assert!(!backbone_only.has_refinement_stage());

        let full =
            TwoStagePipeline::new(PipelineConfigBuilder::two_stage().build().unwrap())
                .unwrap();
        assert!(full.has_proposal_stage());
        assert!(full.has_refinement_stage());
    }

    #[test]
    fn extract_feat_applies_neck() {
        let config = PipelineConfigBuilder::new()
            .neck(crate::config::NeckSpec::ChannelProject { out_channels: 2 })
            .build()
            .unwrap();
        let pipeline = TwoStagePipeline::new(config).unwrap();
        let features = pipeline.extract_feat(&batch(1)).unwrap();
        for level in &features.levels {
            assert_eq!(level.dim().1, 2);
        }
    }

    #[test]
    fn dummy_forward_exercises_both_stages() {
        let mut pipeline =
            TwoStagePipeline::new(PipelineConfigBuilder::two_stage().build().unwrap())
                .unwrap();
        let metas = vec![ImageMeta::unscaled(64, 64)];
        let (proposal_outputs, detections) =
            pipeline.forward_dummy(&batch(1), &metas).unwrap();
        assert!(proposal_outputs.is_some());
        assert_eq!(detections.len(), 1);
        assert!(!detections[0].is_empty());
    }
}
