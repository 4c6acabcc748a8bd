//! Region-proposal stage interface and the anchor-grid reference variant.

use crate::config::{ProposalSpec, ProposalTestCfg, ProposalTrainCfg};
use crate::error::Result;
use crate::pipeline::{BoundingBox, FeatureMap, ImageMeta, LossMap, Proposal, ProposalList};
use async_trait::async_trait;

/// Generates class-agnostic region proposals from image features.
///
/// The stage is class-agnostic by design: ground-truth labels never reach
/// it, which the trait encodes by omitting them from `train_step` entirely.
#[async_trait]
pub trait ProposalStage: Send + Sync {
    /// Name of the concrete variant, used in diagnostics.
    fn name(&self) -> &'static str;

    /// Training forward pass: proposal losses plus the proposals handed to
    /// the refinement stage. `proposal_cfg` is the resolved generation
    /// config (training override when present, test default otherwise).
    fn train_step(
        &self,
        features: &FeatureMap,
        metas: &[ImageMeta],
        gt_boxes: &[Vec<BoundingBox>],
        ignore_boxes: &[Vec<BoundingBox>],
        proposal_cfg: &ProposalTestCfg,
    ) -> Result<(LossMap, ProposalList)>;

    /// Single-pass inference.
    fn infer(&self, features: &FeatureMap, metas: &[ImageMeta]) -> Result<ProposalList>;

    /// Awaitable single-pass inference; one request in flight per call.
    async fn infer_async(
        &self,
        features: &FeatureMap,
        metas: &[ImageMeta],
    ) -> Result<ProposalList>;

    /// Multi-view inference. The stage owns the cross-view merge and
    /// returns one proposal list per underlying image, in original-image
    /// coordinate space.
    fn infer_augmented(
        &self,
        features_per_view: &[FeatureMap],
        metas_per_view: &[Vec<ImageMeta>],
    ) -> Result<ProposalList>;

    /// Graph-export-compatible inference: shape-dependent logic must use
    /// the shape injected into the metas by the export path.
    fn export_graph(&self, features: &FeatureMap, metas: &[ImageMeta]) -> Result<ProposalList>;
}

/// Resolve a proposal spec into a concrete stage.
pub(crate) fn build_proposal(
    spec: &ProposalSpec,
    train_cfg: Option<ProposalTrainCfg>,
    test_cfg: ProposalTestCfg,
) -> Box<dyn ProposalStage> {
    match spec {
        ProposalSpec::AnchorGrid { stride, scales } => Box::new(AnchorGridProposer::new(
            *stride,
            scales.clone(),
            train_cfg,
            test_cfg,
        )),
    }
}

/// Weight-free reference proposer: anchors on a regular stride grid,
/// scored by mean feature activation under the box.
///
/// Useful for exercising and benchmarking the orchestration without model
/// weights; a learned proposal network implements the same trait.
pub struct AnchorGridProposer {
    stride: usize,
    scales: Vec<f32>,
    train_cfg: ProposalTrainCfg,
    test_cfg: ProposalTestCfg,
}

/// IoU above which two merged cross-view proposals count as duplicates.
const AUG_MERGE_IOU: f32 = 0.7;

/// Fraction of an anchor's area covered by an ignore region above which
/// the anchor is dropped during training.
const IGNORE_COVERAGE: f32 = 0.5;

impl AnchorGridProposer {
    pub(crate) fn new(
        stride: usize,
        scales: Vec<f32>,
        train_cfg: Option<ProposalTrainCfg>,
        test_cfg: ProposalTestCfg,
    ) -> Self {
        Self {
            stride: stride.max(1),
            scales,
            train_cfg: train_cfg.unwrap_or_default(),
            test_cfg,
        }
    }

    /// Mean activation of the finest feature level under `bbox`.
    fn objectness(features: &FeatureMap, image_idx: usize, bbox: &BoundingBox) -> f32 {
        let Some(level) = features.levels.first() else {
            return 0.0;
        };
        let (_, c, h, w) = level.dim();
        // The finest level sits at stride 4 relative to the input.
        let x0 = ((bbox.l / 4.0) as usize).min(w.saturating_sub(1));
        let y0 = ((bbox.t / 4.0) as usize).min(h.saturating_sub(1));
        let x1 = ((bbox.r / 4.0).ceil() as usize).clamp(x0 + 1, w);
        let y1 = ((bbox.b / 4.0).ceil() as usize).clamp(y0 + 1, h);
        let mut sum = 0.0;
        for ci in 0..c {
            for y in y0..y1 {
                for x in x0..x1 {
                    sum += level[[image_idx, ci, y, x]];
                }
            }
        }
        let count = (c * (y1 - y0) * (x1 - x0)) as f32;
        // Squash to [0, 1) so scores compose with downstream thresholds.
        let mean = sum / count;
        mean.abs() / (1.0 + mean.abs())
    }

    /// Anchor boxes for one image, scored, filtered, and truncated.
    fn propose_image(
        &self,
        features: &FeatureMap,
        image_idx: usize,
        shape: (usize, usize),
        cfg: &ProposalTestCfg,
    ) -> Vec<Proposal> {
        let (h, w) = (shape.0 as f32, shape.1 as f32);
        let mut proposals = Vec::new();
        let mut cy = (self.stride / 2) as f32;
        while cy < h {
            let mut cx = (self.stride / 2) as f32;
            while cx < w {
                for &scale in &self.scales {
                    let half = scale / 2.0;
                    let bbox = BoundingBox::new(
                        (cx - half).max(0.0),
                        (cy - half).max(0.0),
                        (cx + half).min(w),
                        (cy + half).min(h),
                    );
                    if bbox.area() <= 0.0 {
                        continue;
                    }
                    let score = Self::objectness(features, image_idx, &bbox);
                    if score >= cfg.score_thr {
                        proposals.push(Proposal { bbox, score });
                    }
                }
                cx += self.stride as f32;
            }
            cy += self.stride as f32;
        }
        proposals.sort_by(|a, b| b.score.total_cmp(&a.score));
        proposals.truncate(cfg.max_per_image);
        proposals
    }

    fn propose_batch(
        &self,
        features: &FeatureMap,
        metas: &[ImageMeta],
        cfg: &ProposalTestCfg,
        use_graph_shape: bool,
    ) -> ProposalList {
        metas
            .iter()
            .enumerate()
            .map(|(i, meta)| {
                let shape = if use_graph_shape {
                    meta.graph_shape.unwrap_or(meta.img_shape)
                } else {
                    meta.img_shape
                };
                self.propose_image(features, i, shape, cfg)
            })
            .collect()
    }

    /// Map a view-space box back to original-image space: undo the resize
    /// scale, then undo a horizontal flip.
    fn to_original_space(bbox: &BoundingBox, meta: &ImageMeta) -> BoundingBox {
        let unscaled = bbox.scaled(1.0 / meta.scale_factor[0], 1.0 / meta.scale_factor[1]);
        if meta.flip {
            let ori_w = meta.ori_shape.1 as f32;
            BoundingBox::new(ori_w - unscaled.r, unscaled.t, ori_w - unscaled.l, unscaled.b)
        } else {
            unscaled
        }
    }
}

#[async_trait]
impl ProposalStage for AnchorGridProposer {
    fn name(&self) -> &'static str {
        "AnchorGridProposer"
    }

    fn train_step(
        &self,
        features: &FeatureMap,
        metas: &[ImageMeta],
        gt_boxes: &[Vec<BoundingBox>],
        ignore_boxes: &[Vec<BoundingBox>],
        proposal_cfg: &ProposalTestCfg,
    ) -> Result<(LossMap, ProposalList)> {
        let mut proposal_list = self.propose_batch(features, metas, proposal_cfg, false);

        // Anchors dominated by an ignore region contribute neither to the
        // losses nor to the proposals handed downstream.
        for (proposals, ignores) in proposal_list.iter_mut().zip(ignore_boxes) {
            if !ignores.is_empty() {
                proposals.retain(|p| {
                    ignores
                        .iter()
                        .all(|ig| p.bbox.covered_fraction(ig) <= IGNORE_COVERAGE)
                });
            }
        }

        // Objectness loss: how badly the grid covers the ground truth.
        let mut num_gt = 0usize;
        let mut uncovered = 0usize;
        let mut iou_deficit = 0.0f32;
        for (proposals, gts) in proposal_list.iter().zip(gt_boxes) {
            for gt in gts {
                num_gt += 1;
                let best = proposals
                    .iter()
                    .map(|p| p.bbox.iou(gt))
                    .fold(0.0f32, f32::max);
                if best < self.train_cfg.pos_iou_thr {
                    uncovered += 1;
                }
                iou_deficit += 1.0 - best;
            }
        }

        let mut losses = LossMap::new();
        if num_gt > 0 {
            losses.insert("rpn.cls", uncovered as f32 / num_gt as f32);
            losses.insert("rpn.bbox", iou_deficit / num_gt as f32);
        } else {
            losses.insert("rpn.cls", 0.0);
            losses.insert("rpn.bbox", 0.0);
        }
        log::trace!(
            "proposal stage: {num_gt} gt boxes, {uncovered} uncovered at IoU {}",
            self.train_cfg.pos_iou_thr
        );
        Ok((losses, proposal_list))
    }

    fn infer(&self, features: &FeatureMap, metas: &[ImageMeta]) -> Result<ProposalList> {
        Ok(self.propose_batch(features, metas, &self.test_cfg, false))
    }

    async fn infer_async(
        &self,
        features: &FeatureMap,
        metas: &[ImageMeta],
    ) -> Result<ProposalList> {
        self.infer(features, metas)
    }

    fn infer_augmented(
        &self,
        features_per_view: &[FeatureMap],
        metas_per_view: &[Vec<ImageMeta>],
    ) -> Result<ProposalList> {
        let num_images = metas_per_view.first().map_or(0, Vec::len);
        let mut merged: ProposalList = vec![Vec::new(); num_images];

        for (features, metas) in features_per_view.iter().zip(metas_per_view) {
            let per_view = self.propose_batch(features, metas, &self.test_cfg, false);
            for (image_idx, (proposals, meta)) in per_view.into_iter().zip(metas).enumerate() {
                merged[image_idx].extend(proposals.into_iter().map(|p| Proposal {
                    bbox: Self::to_original_space(&p.bbox, meta),
                    score: p.score,
                }));
            }
        }

        // Cross-view duplicate suppression, keeping the higher score.
        for proposals in &mut merged {
            proposals.sort_by(|a, b| b.score.total_cmp(&a.score));
            let mut kept: Vec<Proposal> = Vec::new();
            for p in proposals.drain(..) {
                if kept.iter().all(|k| k.bbox.iou(&p.bbox) <= AUG_MERGE_IOU) {
                    kept.push(p);
                }
            }
            kept.truncate(self.test_cfg.max_per_image);
            *proposals = kept;
        }
        Ok(merged)
    }

    fn export_graph(&self, features: &FeatureMap, metas: &[ImageMeta]) -> Result<ProposalList> {
        Ok(self.propose_batch(features, metas, &self.test_cfg, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn uniform_features(n: usize, h: usize, w: usize) -> FeatureMap {
        FeatureMap {
            levels: vec![Array4::from_elem((n, 1, h / 4, w / 4), 1.0)],
        }
    }

    fn proposer() -> AnchorGridProposer {
        AnchorGridProposer::new(16, vec![32.0], None, ProposalTestCfg::default())
    }

    #[test]
    fn proposals_respect_per_image_cap() {
        let proposer = AnchorGridProposer::new(
            8,
            vec![16.0, 32.0],
            None,
            ProposalTestCfg {
                max_per_image: 10,
                score_thr: 0.0,
            },
        );
        let metas = vec![ImageMeta::unscaled(64, 64)];
        let out = proposer
            .infer(&uniform_features(1, 64, 64), &metas)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 10);
    }

    #[test]
    fn proposals_stay_inside_image() {
        let metas = vec![ImageMeta::unscaled(64, 64)];
        let out = proposer()
            .infer(&uniform_features(1, 64, 64), &metas)
            .unwrap();
        for p in &out[0] {
            assert!(p.bbox.l >= 0.0 && p.bbox.t >= 0.0);
            assert!(p.bbox.r <= 64.0 && p.bbox.b <= 64.0);
        }
    }

    #[test]
    fn train_step_covers_aligned_gt() {
        let metas = vec![ImageMeta::unscaled(64, 64)];
        // A gt box matching an anchor footprint should be covered.
        let gt = vec![vec![BoundingBox::new(8.0, 8.0, 40.0, 40.0)]];
        let (losses, proposals) = proposer()
            .train_step(
                &uniform_features(1, 64, 64),
                &metas,
                &gt,
                &[Vec::new()],
                &ProposalTestCfg::default(),
            )
            .unwrap();
        assert_eq!(losses.get("rpn.cls"), Some(0.0));
        assert!(losses.get("rpn.bbox").unwrap() < 1.0);
        assert!(!proposals[0].is_empty());
    }

    #[test]
    fn ignore_regions_suppress_overlapping_anchors() {
        let metas = vec![ImageMeta::unscaled(64, 64)];
        // Ignore the whole image: every anchor overlaps heavily.
        let ignore = vec![vec![BoundingBox::new(0.0, 0.0, 64.0, 64.0)]];
        let (_, proposals) = proposer()
            .train_step(
                &uniform_features(1, 64, 64),
                &metas,
                &[Vec::new()],
                &ignore,
                &ProposalTestCfg::default(),
            )
            .unwrap();
        assert!(proposals[0].len() < proposer().infer(
            &uniform_features(1, 64, 64),
            &metas
        ).unwrap()[0].len());
    }

    #[test]
    fn augmented_merge_dedupes_identical_views() {
        let features = vec![uniform_features(1, 64, 64), uniform_features(1, 64, 64)];
        let metas = vec![
            vec![ImageMeta::unscaled(64, 64)],
            vec![ImageMeta::unscaled(64, 64)],
        ];
        let merged = proposer().infer_augmented(&features, &metas).unwrap();
        let single = proposer()
            .infer(&uniform_features(1, 64, 64), &metas[0])
            .unwrap();
        // Two identical views collapse to the single-view proposal count.
        assert_eq!(merged[0].len(), single[0].len());
    }

    #[test]
    fn flipped_view_maps_back_to_original_space() {
        let meta = ImageMeta {
            flip: true,
            ..ImageMeta::unscaled(64, 64)
        };
        let bbox = BoundingBox::new(0.0, 0.0, 16.0, 16.0);
        let mapped = AnchorGridProposer::to_original_space(&bbox, &meta);
        assert_eq!(mapped, BoundingBox::new(48.0, 0.0, 64.0, 16.0));
    }

    #[test]
    fn export_graph_uses_injected_shape() {
        let proposer = proposer();
        let features = uniform_features(1, 64, 64);
        let mut meta = ImageMeta::unscaled(64, 64);
        meta.graph_shape = Some((32, 32));
        let out = proposer.export_graph(&features, &[meta]).unwrap();
        for p in &out[0] {
            assert!(p.bbox.r <= 32.0 && p.bbox.b <= 32.0);
        }
    }
}
