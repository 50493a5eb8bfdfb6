use log::{debug, info};
use nalgebra::Matrix4;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::memo::PathLocks;
use super::{Axis, DeformableRequest, ImageEngine, Interpolation, RigidRequest};
use crate::config::{EngineConfig, RigidParams};
use crate::error::{PipelineError, PipelineResult};
use crate::io::matrix::{read_itk_affine, read_matrix, write_matrix};
use crate::transform::chain::TransformChain;
use crate::transform::{Stage, Transform, TransformFormat};

/// Drives FSL, ANTs and c3d command-line tools.
///
/// With `dry_run` every call is logged and skipped; registrations then
/// return identity transforms so callers can run to completion without
/// touching the filesystem. Two commands writing the same output path
/// never run at the same time.
#[derive(Debug)]
pub struct CommandEngine {
    commands: EngineConfig,
    dry_run: bool,
    threads: usize,
    locks: PathLocks,
}

impl CommandEngine {
    pub fn new(commands: EngineConfig, dry_run: bool, threads: usize) -> Self {
        Self {
            commands,
            dry_run,
            threads,
            locks: PathLocks::new(),
        }
    }

    fn run(&self, program: &str, args: &[String], output: Option<&Path>) -> PipelineResult<()> {
        let rendered = format!("{} {}", program, args.join(" "));
        info!("Running: {}", rendered);
        if self.dry_run {
            return Ok(());
        }

        let execute = || -> PipelineResult<()> {
            if let Some(parent) = output.and_then(Path::parent) {
                fs::create_dir_all(parent)?;
            }
            let threads = self.threads.to_string();
            let result = Command::new(program)
                .args(args)
                .env("OMP_NUM_THREADS", &threads)
                .env("ITK_GLOBAL_DEFAULT_NUMBER_OF_THREADS", &threads)
                .output()
                .map_err(|e| PipelineError::Engine {
                    command: rendered.clone(),
                    message: format!("could not start: {}", e),
                })?;

            if !result.status.success() {
                let stderr = String::from_utf8_lossy(&result.stderr).trim().to_string();
                let message = if stderr.is_empty() {
                    format!("exited with {}", result.status)
                } else {
                    stderr
                };
                return Err(PipelineError::Engine {
                    command: rendered.clone(),
                    message,
                });
            }
            debug!("{} finished", program);
            Ok(())
        };

        match output {
            Some(path) => self.locks.with_lock(path, execute),
            None => execute(),
        }
    }

    fn search_args(params: &RigidParams) -> Vec<String> {
        let mut args = vec!["-dof".to_string(), params.dof.to_string()];
        for (flag, range) in [
            ("-searchrx", params.search_x),
            ("-searchry", params.search_y),
            ("-searchrz", params.search_z),
        ] {
            args.push(flag.to_string());
            args.push(range.min.to_string());
            args.push(range.max.to_string());
        }
        args
    }

    /// flirt -applyxfm for a single FSL matrix. Inverse-applied matrices
    /// are written out inverted next to the output first.
    fn apply_fsl(
        &self,
        image: &Path,
        transform: &Transform,
        reference: &Path,
        interpolation: Interpolation,
        output: &Path,
    ) -> PipelineResult<PathBuf> {
        let file = require_file(transform)?;
        let matrix_file = if transform.invert() {
            let inverted = output.with_extension("inverse.mat");
            let matrix = transform
                .effective_matrix()
                .ok_or_else(|| PipelineError::NotRigid {
                    moving: transform.moving().to_string(),
                    fixed: transform.fixed().to_string(),
                })?;
            if !self.dry_run {
                write_matrix(&inverted, &matrix)?;
            }
            inverted
        } else {
            file.to_path_buf()
        };

        let interp = match interpolation {
            Interpolation::Linear => "trilinear",
            Interpolation::NearestNeighbor => "nearestneighbour",
        };
        let args = vec![
            "-in".to_string(),
            path_arg(image),
            "-ref".to_string(),
            path_arg(reference),
            "-applyxfm".to_string(),
            "-init".to_string(),
            path_arg(&matrix_file),
            "-interp".to_string(),
            interp.to_string(),
            "-out".to_string(),
            path_arg(output),
        ];
        self.run(&self.commands.flirt, &args, Some(output))?;
        Ok(output.to_path_buf())
    }

    /// antsApplyTransforms arguments; `-t` follows the chain's engine order.
    fn apply_stack_args(
        &self,
        image: &Path,
        chain: &TransformChain,
        reference: &Path,
        interpolation: Interpolation,
        output: &Path,
    ) -> PipelineResult<Vec<String>> {
        let interp = match interpolation {
            Interpolation::Linear => "Linear",
            Interpolation::NearestNeighbor => "NearestNeighbor",
        };
        let mut args = vec![
            "-d".to_string(),
            "3".to_string(),
            "-i".to_string(),
            path_arg(image),
            "-r".to_string(),
            path_arg(reference),
            "-o".to_string(),
            path_arg(output),
            "--interpolation".to_string(),
            interp.to_string(),
        ];
        for transform in chain.transforms() {
            if transform.format() == TransformFormat::Fsl {
                return Err(PipelineError::Engine {
                    command: self.commands.apply_transforms.clone(),
                    message: format!("{} is an FSL matrix; convert it before stacking", transform),
                });
            }
            let arg = transform.engine_arg().ok_or_else(|| PipelineError::Engine {
                command: self.commands.apply_transforms.clone(),
                message: format!("{} has no backing file", transform),
            })?;
            args.push("-t".to_string());
            args.push(arg);
        }
        Ok(args)
    }

    fn apply_stack(
        &self,
        image: &Path,
        chain: &TransformChain,
        reference: &Path,
        interpolation: Interpolation,
        output: &Path,
    ) -> PipelineResult<PathBuf> {
        let args = self.apply_stack_args(image, chain, reference, interpolation, output)?;
        self.run(&self.commands.apply_transforms, &args, Some(output))?;
        Ok(output.to_path_buf())
    }

    /// Reads a linear ANTs transform through its text conversion.
    fn load_ants_linear(&self, binary: &Path) -> PipelineResult<Matrix4<f64>> {
        let text = binary.with_extension("txt");
        let args = vec!["3".to_string(), path_arg(binary), path_arg(&text)];
        self.run(&self.commands.convert_transform, &args, Some(&text))?;
        if self.dry_run {
            return Ok(Matrix4::identity());
        }
        read_itk_affine(&text)
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

fn require_file(transform: &Transform) -> PipelineResult<&Path> {
    transform.file().ok_or_else(|| PipelineError::Engine {
        command: "apply".to_string(),
        message: format!("{} has no backing file", transform),
    })
}

/// Rejects matrices an engine may report after a failed optimisation.
pub fn check_rigid_matrix(matrix: &Matrix4<f64>) -> Result<(), String> {
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err("matrix contains non-finite values".to_string());
    }
    let det = matrix.fixed_view::<3, 3>(0, 0).determinant();
    if det <= 1e-6 {
        return Err(format!("degenerate linear part (determinant {:.3e})", det));
    }
    Ok(())
}

impl ImageEngine for CommandEngine {
    fn register_rigid(&self, request: &RigidRequest<'_>) -> PipelineResult<Transform> {
        let mut args = vec![
            "-in".to_string(),
            path_arg(request.moving),
            "-ref".to_string(),
            path_arg(request.fixed),
        ];
        if let Some(warped) = request.warped_out {
            args.push("-o".to_string());
            args.push(path_arg(warped));
        }
        args.push("-omat".to_string());
        args.push(path_arg(request.transform_out));
        args.extend(Self::search_args(request.params));

        let to_registration_error = |message: String| PipelineError::Registration {
            moving: request.moving.to_path_buf(),
            fixed: request.fixed.to_path_buf(),
            iteration: request.iteration,
            message,
        };

        self.run(&self.commands.flirt, &args, Some(request.transform_out))
            .map_err(|e| to_registration_error(e.to_string()))?;

        let matrix = if self.dry_run {
            Matrix4::identity()
        } else {
            read_matrix(request.transform_out)
                .map_err(|e| to_registration_error(e.to_string()))?
        };
        check_rigid_matrix(&matrix).map_err(to_registration_error)?;

        Ok(Transform::rigid(
            matrix,
            request.moving_space,
            request.fixed_space,
            request.stage,
        )
        .with_file(request.transform_out.to_path_buf(), TransformFormat::Fsl))
    }

    fn register_deformable(&self, request: &DeformableRequest<'_>) -> PipelineResult<TransformChain> {
        let prefix = path_arg(request.out_prefix);
        let fixed = path_arg(request.fixed);
        let moving = path_arg(request.moving);
        let p = request.params;
        let metric = format!("{}[{},{},1,32,Regular,0.25]", p.metric, fixed, moving);
        let args = vec![
            "--verbose".to_string(),
            "1".to_string(),
            "--dimensionality".to_string(),
            "3".to_string(),
            "--float".to_string(),
            "0".to_string(),
            "--collapse-output-transforms".to_string(),
            "1".to_string(),
            "--output".to_string(),
            prefix.clone(),
            "--interpolation".to_string(),
            "Linear".to_string(),
            "--winsorize-image-intensities".to_string(),
            "[0.005,0.995]".to_string(),
            "--initial-moving-transform".to_string(),
            format!("[{},{},1]", fixed, moving),
            "--transform".to_string(),
            format!("Rigid[{}]", p.gradient_step),
            "--metric".to_string(),
            metric.clone(),
            "--convergence".to_string(),
            "[1000x500x250x100,1e-6,10]".to_string(),
            "--shrink-factors".to_string(),
            "12x8x4x2".to_string(),
            "--smoothing-sigmas".to_string(),
            "4x3x2x1vox".to_string(),
            "--transform".to_string(),
            format!("SyN[{},3,0]", p.gradient_step),
            "--metric".to_string(),
            metric,
            "--convergence".to_string(),
            p.convergence.clone(),
            "--shrink-factors".to_string(),
            p.shrink_factors.clone(),
            "--smoothing-sigmas".to_string(),
            p.smoothing_sigmas.clone(),
        ];

        let affine_path = PathBuf::from(format!("{}0GenericAffine.mat", prefix));
        let warp_path = PathBuf::from(format!("{}1Warp.nii.gz", prefix));
        let inverse_warp_path = PathBuf::from(format!("{}1InverseWarp.nii.gz", prefix));

        let to_registration_error = |e: PipelineError| PipelineError::Registration {
            moving: request.moving.to_path_buf(),
            fixed: request.fixed.to_path_buf(),
            iteration: None,
            message: e.to_string(),
        };

        self.run(&self.commands.registration, &args, Some(&affine_path))
            .map_err(to_registration_error)?;
        let matrix = self
            .load_ants_linear(&affine_path)
            .map_err(to_registration_error)?;

        let affine = Transform::rigid(
            matrix,
            request.moving_space,
            request.fixed_space,
            Stage::SessionHop,
        )
        .with_file(affine_path, TransformFormat::Itk);
        let warp = Transform::deformable(
            warp_path,
            Some(inverse_warp_path),
            request.moving_space,
            request.fixed_space,
            Stage::SessionHop,
        );

        Ok(TransformChain::from_engine_order(vec![warp, affine]))
    }

    fn export_for_stack(
        &self,
        transform: &Transform,
        moving: &Path,
        fixed: &Path,
        output: &Path,
    ) -> PipelineResult<Transform> {
        if transform.format() != TransformFormat::Fsl {
            return Ok(transform.clone());
        }
        let source = require_file(transform)?;
        let args = vec![
            "-ref".to_string(),
            path_arg(fixed),
            "-src".to_string(),
            path_arg(moving),
            path_arg(source),
            "-fsl2ras".to_string(),
            "-oitk".to_string(),
            path_arg(output),
        ];
        self.run(&self.commands.affine_tool, &args, Some(output))?;

        let matrix = if self.dry_run {
            Matrix4::identity()
        } else {
            read_itk_affine(output)?
        };
        let exported = Transform::rigid(matrix, transform.moving(), transform.fixed(), transform.stage())
            .with_file(output.to_path_buf(), TransformFormat::Itk);
        if transform.invert() {
            exported.inverse()
        } else {
            Ok(exported)
        }
    }

    fn apply(
        &self,
        image: &Path,
        chain: &TransformChain,
        reference: &Path,
        interpolation: Interpolation,
        output: &Path,
    ) -> PipelineResult<PathBuf> {
        match chain.transforms() {
            [single] if single.format() == TransformFormat::Fsl => {
                self.apply_fsl(image, single, reference, interpolation, output)
            }
            _ => self.apply_stack(image, chain, reference, interpolation, output),
        }
    }

    fn average(&self, images: &[&Path], output: &Path) -> PipelineResult<PathBuf> {
        if images.len() < 2 {
            return Err(PipelineError::Engine {
                command: self.commands.average.clone(),
                message: format!("averaging needs at least two images, got {}", images.len()),
            });
        }
        let mut args = vec!["3".to_string(), path_arg(output), "0".to_string()];
        args.extend(images.iter().map(|p| path_arg(p)));
        self.run(&self.commands.average, &args, Some(output))?;
        Ok(output.to_path_buf())
    }

    fn mirror(&self, image: &Path, axis: Axis, output: &Path) -> PipelineResult<PathBuf> {
        let dims: Vec<String> = [Axis::X, Axis::Y, Axis::Z]
            .iter()
            .map(|a| {
                if *a == axis {
                    format!("-{}", a)
                } else {
                    a.to_string()
                }
            })
            .collect();
        let mut args = vec![path_arg(image)];
        args.extend(dims);
        args.push(path_arg(output));
        self.run(&self.commands.swapdim, &args, Some(output))?;

        let header_args = vec![
            path_arg(image),
            path_arg(output),
            path_arg(output),
            "1".to_string(),
            "1".to_string(),
            "1".to_string(),
        ];
        self.run(&self.commands.copy_header, &header_args, Some(output))?;
        Ok(output.to_path_buf())
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}
