//! Feature extraction: backbone plus optional neck.

use crate::config::{BackboneSpec, NeckSpec};
use crate::error::Result;
use crate::pipeline::{FeatureMap, ImageBatch};
use ndarray::Array4;

/// Transforms an image batch into a raw multi-level feature representation.
pub trait Backbone: Send + Sync {
    /// Forward pass over the batch.
    fn forward(&self, images: &ImageBatch) -> Result<FeatureMap>;
}

/// Transforms the backbone's output into the final feature representation.
///
/// When a neck is configured its output replaces the backbone's raw output
/// entirely; stages never see backbone features directly.
pub trait Neck: Send + Sync {
    /// Forward pass over the backbone output.
    fn forward(&self, features: FeatureMap) -> Result<FeatureMap>;
}

/// Resolve a backbone spec into a concrete backbone.
pub(crate) fn build_backbone(spec: &BackboneSpec) -> Box<dyn Backbone> {
    match spec {
        BackboneSpec::StridedPyramid {
            num_levels,
            pretrained,
        } => {
            if let Some(path) = pretrained {
                log::debug!(
                    "StridedPyramid backbone is weight-free; ignoring pretrained path {}",
                    path.display()
                );
            }
            Box::new(StridedPyramidBackbone {
                num_levels: (*num_levels).max(1),
            })
        }
    }
}

/// Resolve a neck spec into a concrete neck.
pub(crate) fn build_neck(spec: &NeckSpec) -> Box<dyn Neck> {
    match spec {
        NeckSpec::ChannelProject { out_channels } => Box::new(ChannelProjectNeck {
            out_channels: (*out_channels).max(1),
        }),
    }
}

/// Weight-free pyramid backbone: average-pools the input at strides
/// 4, 8, 16, ... to produce one feature level per octave.
struct StridedPyramidBackbone {
    num_levels: usize,
}

impl Backbone for StridedPyramidBackbone {
    fn forward(&self, images: &ImageBatch) -> Result<FeatureMap> {
        let levels = (0..self.num_levels)
            .map(|i| avg_pool2d(images.tensor(), 4 << i))
            .collect();
        Ok(FeatureMap { levels })
    }
}

/// Weight-free neck: collapses each level to a fixed channel count by
/// averaging channel groups, keeping spatial dimensions untouched.
struct ChannelProjectNeck {
    out_channels: usize,
}

impl Neck for ChannelProjectNeck {
    fn forward(&self, features: FeatureMap) -> Result<FeatureMap> {
        let levels = features
            .levels
            .into_iter()
            .map(|level| project_channels(&level, self.out_channels))
            .collect();
        Ok(FeatureMap { levels })
    }
}

/// Average pooling with a square `k`×`k` window and stride `k`. Windows are
/// clipped at the border; each output keeps at least one cell per axis.
fn avg_pool2d(x: &Array4<f32>, k: usize) -> Array4<f32> {
    let (n, c, h, w) = x.dim();
    let oh = (h / k).max(1);
    let ow = (w / k).max(1);
    Array4::from_shape_fn((n, c, oh, ow), |(ni, ci, yi, xi)| {
        let y0 = yi * k;
        let x0 = xi * k;
        let y1 = (y0 + k).min(h);
        let x1 = (x0 + k).min(w);
        let mut sum = 0.0;
        for y in y0..y1 {
            for xx in x0..x1 {
                sum += x[[ni, ci, y, xx]];
            }
        }
        sum / ((y1 - y0) * (x1 - x0)) as f32
    })
}

/// Averages input channels congruent modulo `out_channels` into one output
/// channel each. With fewer input channels than outputs, trailing outputs
/// replicate the mean over all input channels.
fn project_channels(x: &Array4<f32>, out_channels: usize) -> Array4<f32> {
    let (n, c, h, w) = x.dim();
    Array4::from_shape_fn((n, out_channels, h, w), |(ni, oc, yi, xi)| {
        let members: Vec<usize> = if c >= out_channels {
            (oc..c).step_by(out_channels).collect()
        } else {
            (0..c).collect()
        };
        let sum: f32 = members.iter().map(|&ci| x[[ni, ci, yi, xi]]).sum();
        sum / members.len() as f32
    })
}

/// Backbone plus optional neck, owned by the pipeline.
pub struct FeatureExtractor {
    backbone: Box<dyn Backbone>,
    neck: Option<Box<dyn Neck>>,
}

impl FeatureExtractor {
    pub(crate) fn new(backbone: Box<dyn Backbone>, neck: Option<Box<dyn Neck>>) -> Self {
        Self { backbone, neck }
    }

    /// True if a neck is configured.
    #[inline]
    #[must_use = "returns whether a neck is configured"]
    pub fn has_neck(&self) -> bool {
        self.neck.is_some()
    }

    /// Run the backbone and, when configured, the neck.
    pub fn forward(&self, images: &ImageBatch) -> Result<FeatureMap> {
        let raw = self.backbone.forward(images)?;
        match &self.neck {
            Some(neck) => neck.forward(raw),
            None => Ok(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn batch(n: usize, c: usize, h: usize, w: usize) -> ImageBatch {
        ImageBatch::new(Array4::from_elem((n, c, h, w), 1.0))
    }

    #[test]
    fn pyramid_levels_halve_per_octave() {
        let backbone = build_backbone(&BackboneSpec::StridedPyramid {
            num_levels: 3,
            pretrained: None,
        });
        let features = backbone.forward(&batch(2, 3, 64, 128)).unwrap();
        assert_eq!(features.num_levels(), 3);
        assert_eq!(features.levels[0].dim(), (2, 3, 16, 32));
        assert_eq!(features.levels[1].dim(), (2, 3, 8, 16));
        assert_eq!(features.levels[2].dim(), (2, 3, 4, 8));
    }

    #[test]
    fn pooling_preserves_constant_input() {
        let backbone = build_backbone(&BackboneSpec::default());
        let features = backbone.forward(&batch(1, 1, 32, 32)).unwrap();
        for level in &features.levels {
            for &v in level.iter() {
                assert!((v - 1.0).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn pretrained_path_is_accepted_and_ignored() {
        let backbone = build_backbone(&BackboneSpec::StridedPyramid {
            num_levels: 1,
            pretrained: Some(PathBuf::from("weights.safetensors")),
        });
        assert!(backbone.forward(&batch(1, 3, 16, 16)).is_ok());
    }

    #[test]
    fn neck_output_replaces_backbone_output() {
        let extractor = FeatureExtractor::new(
            build_backbone(&BackboneSpec::default()),
            Some(build_neck(&NeckSpec::ChannelProject { out_channels: 2 })),
        );
        let features = extractor.forward(&batch(1, 6, 32, 32)).unwrap();
        for level in &features.levels {
            assert_eq!(level.dim().1, 2);
        }
    }

    #[test]
    fn channel_projection_with_fewer_inputs_than_outputs() {
        let projected = project_channels(&Array4::from_elem((1, 2, 4, 4), 3.0), 4);
        assert_eq!(projected.dim(), (1, 4, 4, 4));
        for &v in projected.iter() {
            assert!((v - 3.0).abs() < 1e-6);
        }
    }
}
