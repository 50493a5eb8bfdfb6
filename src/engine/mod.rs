pub mod command;
pub mod memo;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::RigidParams;
use crate::error::PipelineResult;
use crate::transform::chain::TransformChain;
use crate::transform::{Stage, Transform};

/// Resampling kernel used when applying transforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Interpolation {
    Linear,
    NearestNeighbor,
}

/// Anatomical axis a mirror operation flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// left-right
    #[default]
    X,
    Y,
    Z,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        };
        write!(f, "{}", name)
    }
}

/// One rigid registration: `moving` onto `fixed`.
#[derive(Debug, Clone)]
pub struct RigidRequest<'a> {
    pub moving: &'a Path,
    pub fixed: &'a Path,
    pub moving_space: &'a str,
    pub fixed_space: &'a str,
    pub stage: Stage,
    pub params: &'a RigidParams,
    pub transform_out: &'a Path,
    /// Resampled moving image, when the caller wants the engine's own.
    pub warped_out: Option<&'a Path>,
    /// Symmetrization iteration, for error context.
    pub iteration: Option<usize>,
}

/// Schedule of a deformable registration, in the syntax of the engine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeformableParams {
    pub metric: String,
    pub gradient_step: f64,
    pub convergence: String,
    pub shrink_factors: String,
    pub smoothing_sigmas: String,
}

impl Default for DeformableParams {
    fn default() -> Self {
        Self {
            metric: "MI".to_string(),
            gradient_step: 0.1,
            convergence: "[30x20x10,1e-6,10]".to_string(),
            shrink_factors: "8x4x2".to_string(),
            smoothing_sigmas: "3x2x1vox".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeformableRequest<'a> {
    pub moving: &'a Path,
    pub fixed: &'a Path,
    pub moving_space: &'a str,
    pub fixed_space: &'a str,
    pub params: &'a DeformableParams,
    /// Prefix the engine derives its output names from.
    pub out_prefix: &'a Path,
}

/// Boundary to the external registration and image-arithmetic engines.
///
/// Every call blocks until the engine is done. Implementations must be
/// shareable across the threads of independent sessions.
pub trait ImageEngine: Sync {
    /// Estimates a rigid transform. Non-convergence or a degenerate result
    /// is a `Registration` error.
    fn register_rigid(&self, request: &RigidRequest<'_>) -> PipelineResult<Transform>;

    /// Estimates rigid + deformable transforms; returned in engine order
    /// (warp field first, then the linear part).
    fn register_deformable(&self, request: &DeformableRequest<'_>) -> PipelineResult<TransformChain>;

    /// Rewrites a rigid transform into the format transform stacks accept.
    /// The default keeps the transform as it is.
    fn export_for_stack(
        &self,
        transform: &Transform,
        _moving: &Path,
        _fixed: &Path,
        _output: &Path,
    ) -> PipelineResult<Transform> {
        Ok(transform.clone())
    }

    fn apply(
        &self,
        image: &Path,
        chain: &TransformChain,
        reference: &Path,
        interpolation: Interpolation,
        output: &Path,
    ) -> PipelineResult<PathBuf>;

    /// Equal-weight average of two or more images.
    fn average(&self, images: &[&Path], output: &Path) -> PipelineResult<PathBuf>;

    /// Flips an image along `axis`, keeping the source header geometry.
    fn mirror(&self, image: &Path, axis: Axis, output: &Path) -> PipelineResult<PathBuf>;

    /// Whether `apply` accepts more than one transform per call.
    fn supports_stacks(&self) -> bool {
        true
    }

    fn is_dry_run(&self) -> bool {
        false
    }
}
