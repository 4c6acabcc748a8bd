//! Region-refinement stage interface and the activation-scored reference
//! variant.

use crate::config::{RefineTestCfg, RefineTrainCfg, RefinementSpec};
use crate::error::{PipelineError, Result};
use crate::pipeline::{
    BoundingBox, Detection, Detections, FeatureMap, GroundTruth, ImageMeta, LossMap,
    ProposalList,
};
use async_trait::async_trait;

/// Classifies and regresses proposals into final detections.
///
/// Capabilities vary by variant and are probed without invocation:
/// [`supports_bbox`](Self::supports_bbox) gates every inference path and
/// [`supports_graph_export`](Self::supports_graph_export) gates
/// [`export_graph`](Self::export_graph).
#[async_trait]
pub trait RefinementStage: Send + Sync {
    /// Name of the concrete variant, used in diagnostics.
    fn name(&self) -> &'static str;

    /// Whether the variant produces bounding-box detections.
    fn supports_bbox(&self) -> bool;

    /// Whether the variant can run under graph export.
    fn supports_graph_export(&self) -> bool;

    /// Training forward pass over proposals and full ground truth
    /// (labels, ignore regions, and masks when present).
    fn train_step(
        &self,
        features: &FeatureMap,
        metas: &[ImageMeta],
        proposals: &ProposalList,
        ground_truth: &[GroundTruth],
    ) -> Result<LossMap>;

    /// Single-pass inference. With `rescale`, boxes are mapped back into
    /// original-image space.
    fn infer(
        &self,
        features: &FeatureMap,
        proposals: &ProposalList,
        metas: &[ImageMeta],
        rescale: bool,
    ) -> Result<Detections>;

    /// Awaitable single-pass inference; one request in flight per call.
    async fn infer_async(
        &self,
        features: &FeatureMap,
        proposals: &ProposalList,
        metas: &[ImageMeta],
        rescale: bool,
    ) -> Result<Detections>;

    /// Multi-view inference over proposals already merged into
    /// original-image space. Scores are averaged across views; with
    /// `rescale` the result stays in original-image space, otherwise it is
    /// mapped into the first view's space.
    fn infer_augmented(
        &self,
        features_per_view: &[FeatureMap],
        proposals: &ProposalList,
        metas_per_view: &[Vec<ImageMeta>],
        rescale: bool,
    ) -> Result<Detections>;

    /// Graph-export-compatible inference. Callers must probe
    /// [`supports_graph_export`](Self::supports_graph_export) first.
    fn export_graph(
        &self,
        features: &FeatureMap,
        proposals: &ProposalList,
        metas: &[ImageMeta],
    ) -> Result<Detections>;
}

/// Resolve a refinement spec into a concrete stage.
pub(crate) fn build_refinement(
    spec: &RefinementSpec,
    num_classes: usize,
    train_cfg: Option<RefineTrainCfg>,
    test_cfg: RefineTestCfg,
) -> Box<dyn RefinementStage> {
    match spec {
        RefinementSpec::ActivationRoi {
            with_bbox,
            with_mask,
            graph_export,
        } => Box::new(ActivationRoiHead {
            num_classes: num_classes.max(1),
            with_bbox: *with_bbox,
            with_mask: *with_mask,
            graph_export: *graph_export,
            train_cfg: train_cfg.unwrap_or_default(),
            test_cfg,
        }),
    }
}

/// Weight-free reference head: re-scores proposals by pooled feature
/// activation and assigns classes from per-channel response groups.
///
/// Like the proposer, this exists so the orchestration runs end to end
/// without model weights; a learned region head implements the same trait.
pub struct ActivationRoiHead {
    num_classes: usize,
    with_bbox: bool,
    with_mask: bool,
    graph_export: bool,
    train_cfg: RefineTrainCfg,
    test_cfg: RefineTestCfg,
}

/// Fraction of a proposal's area covered by an ignore region above which
/// it is excluded from training assignment.
const IGNORE_COVERAGE: f32 = 0.5;

impl ActivationRoiHead {
    /// Per-channel mean activation of the finest feature level under
    /// `bbox`, in feature-grid coordinates derived from the stride-4 level.
    fn pooled_channels(
        features: &FeatureMap,
        image_idx: usize,
        bbox: &BoundingBox,
    ) -> Vec<f32> {
        let Some(level) = features.levels.first() else {
            return Vec::new();
        };
        let (_, c, h, w) = level.dim();
        let x0 = ((bbox.l / 4.0) as usize).min(w.saturating_sub(1));
        let y0 = ((bbox.t / 4.0) as usize).min(h.saturating_sub(1));
        let x1 = ((bbox.r / 4.0).ceil() as usize).clamp(x0 + 1, w);
        let y1 = ((bbox.b / 4.0).ceil() as usize).clamp(y0 + 1, h);
        let cells = ((y1 - y0) * (x1 - x0)) as f32;
        (0..c)
            .map(|ci| {
                let mut sum = 0.0;
                for y in y0..y1 {
                    for x in x0..x1 {
                        sum += level[[image_idx, ci, y, x]];
                    }
                }
                sum / cells
            })
            .collect()
    }

    /// Class decision for one proposal: argmax over channel groups taken
    /// modulo `num_classes`, with the winning response squashed to [0, 1).
    fn classify(&self, channels: &[f32]) -> (usize, f32) {
        if channels.is_empty() {
            return (0, 0.0);
        }
        let mut best = (0usize, f32::MIN);
        for class_id in 0..self.num_classes.min(channels.len().max(1)) {
            let members: Vec<f32> = channels
                .iter()
                .copied()
                .skip(class_id)
                .step_by(self.num_classes)
                .collect();
            if members.is_empty() {
                continue;
            }
            let response = members.iter().sum::<f32>() / members.len() as f32;
            if response > best.1 {
                best = (class_id, response);
            }
        }
        let (class_id, response) = best;
        (class_id, response.abs() / (1.0 + response.abs()))
    }

    fn detect_image(
        &self,
        features: &FeatureMap,
        image_idx: usize,
        proposals: &[crate::pipeline::Proposal],
        meta: &ImageMeta,
        rescale: bool,
    ) -> Vec<Detection> {
        let mut detections: Vec<Detection> = proposals
            .iter()
            .filter_map(|p| {
                let channels = Self::pooled_channels(features, image_idx, &p.bbox);
                let (class_id, class_score) = self.classify(&channels);
                let score = p.score * class_score;
                if score < self.test_cfg.score_thr {
                    return None;
                }
                let bbox = if rescale {
                    p.bbox
                        .scaled(1.0 / meta.scale_factor[0], 1.0 / meta.scale_factor[1])
                } else {
                    p.bbox
                };
                Some(Detection {
                    bbox,
                    score,
                    class_id,
                })
            })
            .collect();
        detections.sort_by(|a, b| b.score.total_cmp(&a.score));
        detections.truncate(self.test_cfg.max_per_image);
        detections
    }

    fn require_bbox(&self) -> Result<()> {
        if self.with_bbox {
            Ok(())
        } else {
            Err(PipelineError::capability(
                self.name(),
                "bounding-box output",
            ))
        }
    }
}

#[async_trait]
impl RefinementStage for ActivationRoiHead {
    fn name(&self) -> &'static str {
        "ActivationRoiHead"
    }

    fn supports_bbox(&self) -> bool {
        self.with_bbox
    }

    fn supports_graph_export(&self) -> bool {
        self.graph_export
    }

    fn train_step(
        &self,
        _features: &FeatureMap,
        _metas: &[ImageMeta],
        proposals: &ProposalList,
        ground_truth: &[GroundTruth],
    ) -> Result<LossMap> {
        let mut num_gt = 0usize;
        let mut cls_deficit = 0.0f32;
        let mut bbox_deficit = 0.0f32;
        let mut mask_gt = 0usize;
        let mut mask_deficit = 0.0f32;

        for (image_proposals, gt) in proposals.iter().zip(ground_truth) {
            let candidates: Vec<&crate::pipeline::Proposal> = image_proposals
                .iter()
                .filter(|p| {
                    gt.ignore_boxes
                        .iter()
                        .all(|ig| p.bbox.covered_fraction(ig) <= IGNORE_COVERAGE)
                })
                .collect();

            for (gt_idx, gt_box) in gt.boxes.iter().enumerate() {
                num_gt += 1;
                let matched = candidates
                    .iter()
                    .map(|p| (p, p.bbox.iou(gt_box)))
                    .max_by(|a, b| a.1.total_cmp(&b.1));
                match matched {
                    Some((p, iou)) if iou >= self.train_cfg.pos_iou_thr => {
                        cls_deficit += 1.0 - iou;
                        // Center offset normalized by the gt box diagonal.
                        let dx = (p.bbox.l + p.bbox.r - gt_box.l - gt_box.r) / 2.0;
                        let dy = (p.bbox.t + p.bbox.b - gt_box.t - gt_box.b) / 2.0;
                        let diag =
                            (gt_box.width().powi(2) + gt_box.height().powi(2)).sqrt();
                        if diag > 0.0 {
                            bbox_deficit += (dx * dx + dy * dy).sqrt() / diag;
                        }
                        if self.with_mask {
                            if let Some(masks) = &gt.masks {
                                mask_gt += 1;
                                mask_deficit += 1.0
                                    - mask_overlap(masks, gt_idx, &p.bbox);
                            }
                        }
                    }
                    _ => {
                        // Unmatched ground truth: full loss contribution.
                        cls_deficit += 1.0;
                        bbox_deficit += 1.0;
                        if self.with_mask && gt.masks.is_some() {
                            mask_gt += 1;
                            mask_deficit += 1.0;
                        }
                    }
                }
            }
        }

        let mut losses = LossMap::new();
        let denom = num_gt.max(1) as f32;
        losses.insert("rcnn.cls", cls_deficit / denom);
        losses.insert("rcnn.bbox", bbox_deficit / denom);
        if self.with_mask && mask_gt > 0 {
            losses.insert("rcnn.mask", mask_deficit / mask_gt as f32);
        }
        Ok(losses)
    }

    fn infer(
        &self,
        features: &FeatureMap,
        proposals: &ProposalList,
        metas: &[ImageMeta],
        rescale: bool,
    ) -> Result<Detections> {
        self.require_bbox()?;
        Ok(metas
            .iter()
            .enumerate()
            .map(|(i, meta)| {
                self.detect_image(features, i, &proposals[i], meta, rescale)
            })
            .collect())
    }

    async fn infer_async(
        &self,
        features: &FeatureMap,
        proposals: &ProposalList,
        metas: &[ImageMeta],
        rescale: bool,
    ) -> Result<Detections> {
        self.infer(features, proposals, metas, rescale)
    }

    fn infer_augmented(
        &self,
        features_per_view: &[FeatureMap],
        proposals: &ProposalList,
        metas_per_view: &[Vec<ImageMeta>],
        rescale: bool,
    ) -> Result<Detections> {
        self.require_bbox()?;
        let num_images = metas_per_view.first().map_or(0, Vec::len);
        let mut detections = Vec::with_capacity(num_images);

        for image_idx in 0..num_images {
            let mut image_dets: Vec<Detection> = Vec::new();
            for p in &proposals[image_idx] {
                // Proposals arrive in original-image space; score the box
                // in each view's own space and average.
                let mut score_sum = 0.0f32;
                let mut class_votes = vec![0.0f32; self.num_classes];
                for (features, metas) in features_per_view.iter().zip(metas_per_view) {
                    let meta = &metas[image_idx];
                    let view_box =
                        p.bbox.scaled(meta.scale_factor[0], meta.scale_factor[1]);
                    let channels =
                        Self::pooled_channels(features, image_idx, &view_box);
                    let (class_id, class_score) = self.classify(&channels);
                    class_votes[class_id] += class_score;
                    score_sum += p.score * class_score;
                }
                let num_views = features_per_view.len().max(1) as f32;
                let score = score_sum / num_views;
                if score < self.test_cfg.score_thr {
                    continue;
                }
                let class_id = class_votes
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map_or(0, |(i, _)| i);
                let first_meta = &metas_per_view[0][image_idx];
                let bbox = if rescale {
                    p.bbox
                } else {
                    p.bbox
                        .scaled(first_meta.scale_factor[0], first_meta.scale_factor[1])
                };
                image_dets.push(Detection {
                    bbox,
                    score,
                    class_id,
                });
            }
            image_dets.sort_by(|a, b| b.score.total_cmp(&a.score));
            image_dets.truncate(self.test_cfg.max_per_image);
            detections.push(image_dets);
        }
        Ok(detections)
    }

    fn export_graph(
        &self,
        features: &FeatureMap,
        proposals: &ProposalList,
        metas: &[ImageMeta],
    ) -> Result<Detections> {
        if !self.graph_export {
            return Err(PipelineError::capability(self.name(), "graph export"));
        }
        self.require_bbox()?;
        // Export runs in the injected graph shape's space, never rescaled.
        Ok(metas
            .iter()
            .enumerate()
            .map(|(i, meta)| {
                self.detect_image(features, i, &proposals[i], meta, false)
            })
            .collect())
    }
}

/// Fraction of an instance mask's pixels that fall inside `bbox`.
fn mask_overlap(masks: &ndarray::Array3<u8>, instance: usize, bbox: &BoundingBox) -> f32 {
    let (num_inst, h, w) = masks.dim();
    if instance >= num_inst {
        return 0.0;
    }
    let mut total = 0usize;
    let mut inside = 0usize;
    for y in 0..h {
        for x in 0..w {
            if masks[[instance, y, x]] != 0 {
                total += 1;
                let (xf, yf) = (x as f32 + 0.5, y as f32 + 0.5);
                if xf >= bbox.l && xf < bbox.r && yf >= bbox.t && yf < bbox.b {
                    inside += 1;
                }
            }
        }
    }
    if total == 0 {
        0.0
    } else {
        inside as f32 / total as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Proposal;
    use ndarray::{Array3, Array4};

    fn uniform_features(n: usize, c: usize, h: usize, w: usize) -> FeatureMap {
        FeatureMap {
            levels: vec![Array4::from_elem((n, c, h / 4, w / 4), 1.0)],
        }
    }

    fn head(with_bbox: bool, with_mask: bool, graph_export: bool) -> Box<dyn RefinementStage> {
        build_refinement(
            &RefinementSpec::ActivationRoi {
                with_bbox,
                with_mask,
                graph_export,
            },
            4,
            None,
            RefineTestCfg::default(),
        )
    }

    fn one_proposal(bbox: BoundingBox) -> ProposalList {
        vec![vec![Proposal { bbox, score: 0.9 }]]
    }

    #[test]
    fn infer_produces_detections_above_threshold() {
        let head = head(true, false, true);
        let metas = vec![ImageMeta::unscaled(64, 64)];
        let out = head
            .infer(
                &uniform_features(1, 4, 64, 64),
                &one_proposal(BoundingBox::new(8.0, 8.0, 40.0, 40.0)),
                &metas,
                false,
            )
            .unwrap();
        assert_eq!(out[0].len(), 1);
        assert!(out[0][0].score > RefineTestCfg::default().score_thr);
        assert!(out[0][0].class_id < 4);
    }

    #[test]
    fn infer_without_bbox_support_is_capability_error() {
        let head = head(false, false, true);
        let metas = vec![ImageMeta::unscaled(64, 64)];
        let err = head
            .infer(
                &uniform_features(1, 4, 64, 64),
                &one_proposal(BoundingBox::new(0.0, 0.0, 16.0, 16.0)),
                &metas,
                false,
            )
            .unwrap_err();
        assert!(err.is_capability_error());
        assert!(!head.supports_bbox());
    }

    #[test]
    fn rescale_maps_back_to_original_space() {
        let head = head(true, false, true);
        let meta = ImageMeta {
            ori_shape: (32, 32),
            img_shape: (64, 64),
            pad_shape: (64, 64),
            scale_factor: [2.0, 2.0],
            flip: false,
            filename: None,
            graph_shape: None,
        };
        let out = head
            .infer(
                &uniform_features(1, 1, 64, 64),
                &one_proposal(BoundingBox::new(0.0, 0.0, 40.0, 40.0)),
                &[meta],
                true,
            )
            .unwrap();
        assert_eq!(out[0][0].bbox, BoundingBox::new(0.0, 0.0, 20.0, 20.0));
    }

    #[test]
    fn train_step_namespaces_losses() {
        let head = head(true, false, true);
        let metas = vec![ImageMeta::unscaled(64, 64)];
        let gt = vec![GroundTruth::new(
            vec![BoundingBox::new(8.0, 8.0, 40.0, 40.0)],
            vec![1],
        )];
        let losses = head
            .train_step(
                &uniform_features(1, 4, 64, 64),
                &metas,
                &one_proposal(BoundingBox::new(8.0, 8.0, 40.0, 40.0)),
                &gt,
            )
            .unwrap();
        assert!(losses.get("rcnn.cls").is_some());
        assert!(losses.get("rcnn.bbox").is_some());
        assert!(losses.get("rcnn.mask").is_none());
        // Perfectly matched proposal: zero deficits.
        assert_eq!(losses.get("rcnn.cls"), Some(0.0));
        assert_eq!(losses.get("rcnn.bbox"), Some(0.0));
    }

    #[test]
    fn mask_loss_reported_when_configured_and_present() {
        let head = head(true, true, true);
        let metas = vec![ImageMeta::unscaled(64, 64)];
        let mut masks = Array3::<u8>::zeros((1, 64, 64));
        // One instance fully inside the matched proposal.
        for y in 10..30 {
            for x in 10..30 {
                masks[[0, y, x]] = 1;
            }
        }
        let gt = vec![GroundTruth {
            boxes: vec![BoundingBox::new(8.0, 8.0, 40.0, 40.0)],
            labels: vec![2],
            ignore_boxes: Vec::new(),
            masks: Some(masks),
        }];
        let losses = head
            .train_step(
                &uniform_features(1, 1, 64, 64),
                &metas,
                &one_proposal(BoundingBox::new(8.0, 8.0, 40.0, 40.0)),
                &gt,
            )
            .unwrap();
        assert_eq!(losses.get("rcnn.mask"), Some(0.0));
    }

    #[test]
    fn unmatched_gt_contributes_full_loss() {
        let head = head(true, false, true);
        let metas = vec![ImageMeta::unscaled(64, 64)];
        let gt = vec![GroundTruth::new(
            vec![BoundingBox::new(48.0, 48.0, 64.0, 64.0)],
            vec![0],
        )];
        let losses = head
            .train_step(
                &uniform_features(1, 1, 64, 64),
                &metas,
                &one_proposal(BoundingBox::new(0.0, 0.0, 8.0, 8.0)),
                &gt,
            )
            .unwrap();
        assert_eq!(losses.get("rcnn.cls"), Some(1.0));
        assert_eq!(losses.get("rcnn.bbox"), Some(1.0));
    }

    #[test]
    fn export_graph_respects_capability_flag() {
        let head = head(true, false, false);
        assert!(!head.supports_graph_export());
        let metas = vec![ImageMeta::unscaled(64, 64)];
        let err = head
            .export_graph(
                &uniform_features(1, 1, 64, 64),
                &one_proposal(BoundingBox::new(0.0, 0.0, 16.0, 16.0)),
                &metas,
            )
            .unwrap_err();
        assert!(err.is_capability_error());
    }

    #[test]
    fn augmented_scores_average_across_views() {
        let head = head(true, false, true);
        let features = vec![
            uniform_features(1, 1, 64, 64),
            uniform_features(1, 1, 64, 64),
        ];
        let metas = vec![
            vec![ImageMeta::unscaled(64, 64)],
            vec![ImageMeta::unscaled(64, 64)],
        ];
        let proposals = one_proposal(BoundingBox::new(8.0, 8.0, 40.0, 40.0));
        let aug = head
            .infer_augmented(&features, &proposals, &metas, true)
            .unwrap();
        let single = head
            .infer(&features[0], &proposals, &metas[0], true)
            .unwrap();
        // Identical views: averaging changes nothing.
        assert_eq!(aug[0].len(), 1);
        assert!((aug[0][0].score - single[0][0].score).abs() < 1e-6);
    }
}
