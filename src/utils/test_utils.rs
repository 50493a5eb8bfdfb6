use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::engine::{Axis, DeformableRequest, ImageEngine, Interpolation, RigidRequest};
use crate::error::{PipelineError, PipelineResult};
use crate::io::matrix::write_matrix;
use crate::transform::chain::TransformChain;
use crate::transform::{Stage, Transform, TransformFormat};

/// Fresh, empty scratch directory under the system temp dir.
pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("symtemplate-{}-{}", name, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Creates an empty file, parents included.
pub fn touch(path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, "").unwrap();
}

/// One call received by `ScriptedEngine`.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Register {
        stage: Stage,
        moving_space: String,
        fixed_space: String,
        iteration: Option<usize>,
    },
    Deformable {
        moving_space: String,
        fixed_space: String,
    },
    Export {
        output: PathBuf,
    },
    Apply {
        image: PathBuf,
        transforms: usize,
        interpolation: Interpolation,
        output: PathBuf,
    },
    Average {
        inputs: usize,
        output: PathBuf,
    },
    Mirror {
        image: PathBuf,
        output: PathBuf,
    },
}

/// Engine double returning pre-programmed rigid transforms.
///
/// Symmetrization registrations pop Euler angles from per-stage queues
/// (identity once a queue is empty). Session hops come from a table keyed
/// by (moving, fixed) space; a missing entry is a registration failure.
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    anat: Mutex<VecDeque<[f64; 3]>>,
    flip: Mutex<VecDeque<[f64; 3]>>,
    hops: HashMap<(String, String), Transform>,
    fail_at: Option<(Stage, usize)>,
    fail_apply: HashSet<String>,
    no_stacks: bool,
    touch_outputs: bool,
    calls: Mutex<Vec<EngineCall>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Angles (degrees) of the anat and flip registrations, one per
    /// iteration.
    pub fn with_angles(self, anat: Vec<[f64; 3]>, flip: Vec<[f64; 3]>) -> Self {
        *self.anat.lock().unwrap() = anat.into();
        *self.flip.lock().unwrap() = flip.into();
        self
    }

    pub fn with_hop(mut self, hop: Transform) -> Self {
        self.hops
            .insert((hop.moving().to_string(), hop.fixed().to_string()), hop);
        self
    }

    pub fn failing_registration_at(mut self, stage: Stage, iteration: usize) -> Self {
        self.fail_at = Some((stage, iteration));
        self
    }

    /// Applying a transform to an image whose file name contains
    /// `needle` fails.
    pub fn failing_apply_on(mut self, needle: &str) -> Self {
        self.fail_apply.insert(needle.to_string());
        self
    }

    pub fn without_stacks(mut self) -> Self {
        self.no_stacks = true;
        self
    }

    /// Write empty files for every output, so existence checks and
    /// cleanup see them.
    pub fn touching_outputs(mut self) -> Self {
        self.touch_outputs = true;
        self
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&EngineCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| predicate(c)).count()
    }

    pub fn registrations(&self, stage: Stage) -> usize {
        self.count(|c| matches!(c, EngineCall::Register { stage: s, .. } if *s == stage))
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn output(&self, path: &Path) -> PathBuf {
        if self.touch_outputs {
            touch(path);
        }
        path.to_path_buf()
    }
}

impl ImageEngine for ScriptedEngine {
    fn register_rigid(&self, request: &RigidRequest<'_>) -> PipelineResult<Transform> {
        self.record(EngineCall::Register {
            stage: request.stage,
            moving_space: request.moving_space.to_string(),
            fixed_space: request.fixed_space.to_string(),
            iteration: request.iteration,
        });

        let failure = |message: &str| PipelineError::Registration {
            moving: request.moving.to_path_buf(),
            fixed: request.fixed.to_path_buf(),
            iteration: request.iteration,
            message: message.to_string(),
        };

        if let (Some((stage, at)), Some(iteration)) = (self.fail_at, request.iteration) {
            if stage == request.stage && at == iteration {
                return Err(failure("scripted failure"));
            }
        }

        let transform = match request.stage {
            Stage::AnatToSym | Stage::FlipToSym => {
                let queue = if request.stage == Stage::AnatToSym {
                    &self.anat
                } else {
                    &self.flip
                };
                let angles = queue.lock().unwrap().pop_front().unwrap_or([0.0; 3]);
                Transform::from_euler_deg(
                    angles,
                    [0.0; 3],
                    request.moving_space,
                    request.fixed_space,
                    request.stage,
                )
            }
            Stage::SessionHop => self
                .hops
                .get(&(request.moving_space.to_string(), request.fixed_space.to_string()))
                .cloned()
                .ok_or_else(|| failure("no scripted hop"))?,
        };

        if self.touch_outputs {
            if let Some(matrix) = transform.matrix() {
                write_matrix(request.transform_out, matrix)?;
            }
        }
        if let Some(warped) = request.warped_out {
            self.output(warped);
        }
        Ok(transform.with_file(request.transform_out.to_path_buf(), TransformFormat::Fsl))
    }

    fn register_deformable(&self, request: &DeformableRequest<'_>) -> PipelineResult<TransformChain> {
        self.record(EngineCall::Deformable {
            moving_space: request.moving_space.to_string(),
            fixed_space: request.fixed_space.to_string(),
        });
        let affine = self
            .hops
            .get(&(request.moving_space.to_string(), request.fixed_space.to_string()))
            .cloned()
            .ok_or_else(|| PipelineError::Registration {
                moving: request.moving.to_path_buf(),
                fixed: request.fixed.to_path_buf(),
                iteration: None,
                message: "no scripted hop".to_string(),
            })?;
        let prefix = request.out_prefix.display().to_string();
        let warp = Transform::deformable(
            self.output(Path::new(&format!("{}1Warp.nii.gz", prefix))),
            Some(self.output(Path::new(&format!("{}1InverseWarp.nii.gz", prefix)))),
            request.moving_space,
            request.fixed_space,
            Stage::SessionHop,
        );
        let affine = affine.with_file(
            self.output(Path::new(&format!("{}0GenericAffine.mat", prefix))),
            TransformFormat::Itk,
        );
        Ok(TransformChain::from_engine_order(vec![warp, affine]))
    }

    fn export_for_stack(
        &self,
        transform: &Transform,
        _moving: &Path,
        _fixed: &Path,
        output: &Path,
    ) -> PipelineResult<Transform> {
        self.record(EngineCall::Export {
            output: output.to_path_buf(),
        });
        Ok(transform
            .clone()
            .with_file(self.output(output), TransformFormat::Itk))
    }

    fn apply(
        &self,
        image: &Path,
        chain: &TransformChain,
        _reference: &Path,
        interpolation: Interpolation,
        output: &Path,
    ) -> PipelineResult<PathBuf> {
        self.record(EngineCall::Apply {
            image: image.to_path_buf(),
            transforms: chain.len(),
            interpolation,
            output: output.to_path_buf(),
        });
        let name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.fail_apply.iter().any(|needle| name.contains(needle.as_str())) {
            return Err(PipelineError::Engine {
                command: "apply".to_string(),
                message: format!("scripted failure on {}", name),
            });
        }
        if self.no_stacks && chain.len() > 1 {
            return Err(PipelineError::Engine {
                command: "apply".to_string(),
                message: "stacks not supported".to_string(),
            });
        }
        Ok(self.output(output))
    }

    fn average(&self, images: &[&Path], output: &Path) -> PipelineResult<PathBuf> {
        self.record(EngineCall::Average {
            inputs: images.len(),
            output: output.to_path_buf(),
        });
        Ok(self.output(output))
    }

    fn mirror(&self, image: &Path, _axis: Axis, output: &Path) -> PipelineResult<PathBuf> {
        self.record(EngineCall::Mirror {
            image: image.to_path_buf(),
            output: output.to_path_buf(),
        });
        Ok(self.output(output))
    }

    fn supports_stacks(&self) -> bool {
        !self.no_stacks
    }
}
