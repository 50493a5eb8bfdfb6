pub mod longitudinal;
pub mod propagate;
pub mod report;
pub mod symmetrize;

use log::{error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{ContrastSpec, PipelineConfig};
use crate::engine::memo::{Cached, OutputCache};
use crate::engine::ImageEngine;
use crate::error::PipelineResult;
use crate::io::layout::{symmetric_name, DatasetLayout};
use crate::io::matrix::read_matrix;
use crate::io::sessions::check_session_inputs;
use crate::transform::decompose::{decompose, symmetry_score};
use crate::transform::{Stage, Transform, TransformFormat};
use crate::utils::remove_temporaries;

use propagate::{ContrastOutcome, ContrastReport, PropagationDriver, PropagationJob};
use report::SessionReport;
use symmetrize::{Convergence, SymmetrizationLoop, SymmetrizationPaths, SymmetrizedTemplate};

/// Reloads the result of an earlier run from its two transform files. The
/// score is recomputed from the stored matrices.
fn load_template(
    session: &str,
    paths: &SymmetrizationPaths,
    target: &Path,
    max_angle: f64,
) -> PipelineResult<SymmetrizedTemplate> {
    let load = |path: &Path, moving: &str, stage: Stage| -> PipelineResult<Transform> {
        let matrix = read_matrix(path)?;
        Ok(Transform::rigid(matrix, moving, &format!("{}-symmetric", session), stage)
            .with_file(path.to_path_buf(), TransformFormat::Fsl))
    };
    let anat_to_sym = load(&paths.anat_transform, session, Stage::AnatToSym)?;
    let flip_to_sym = load(
        &paths.flip_transform,
        &format!("{}-flipped", session),
        Stage::FlipToSym,
    )?;
    let score = symmetry_score(&decompose(&anat_to_sym)?, &decompose(&flip_to_sym)?);
    let convergence = if score < max_angle {
        Convergence::Converged
    } else {
        Convergence::NotReached
    };
    info!(
        "[{}] reusing existing symmetric template {} (score {:.4})",
        session,
        target.display(),
        score
    );

    Ok(SymmetrizedTemplate {
        session: session.to_string(),
        target: target.to_path_buf(),
        anat_to_sym,
        flip_to_sym,
        iterations: 0,
        score,
        max_angle,
        convergence,
        cached: true,
    })
}

/// Runs the loop, copies the final estimate to its stable name and drops
/// the intermediates.
fn compute_template<E: ImageEngine + ?Sized>(
    engine: &E,
    config: &PipelineConfig,
    session: &str,
    paths: &SymmetrizationPaths,
    stable: &Path,
) -> PipelineResult<SymmetrizedTemplate> {
    let mut template =
        SymmetrizationLoop::new(engine, session, paths, &config.symmetrization).run()?;

    if !engine.is_dry_run() {
        if let Some(parent) = stable.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&template.target, stable)?;
        info!("[{}] symmetric template written to {}", session, stable.display());
    }
    template.target = stable.to_path_buf();

    if !config.keep_tmp && !engine.is_dry_run() {
        let temporaries = paths.temporaries(template.iterations);
        let refs: Vec<&Path> = temporaries.iter().map(PathBuf::as_path).collect();
        remove_temporaries(&refs);
    }
    Ok(template)
}

/// Propagation jobs for the symmetrization of extra contrasts: each
/// output sits next to its source under the symmetric name.
fn symmetric_jobs(
    layout: &DatasetLayout,
    session: &str,
    default_subdir: &str,
    contrasts: &[ContrastSpec],
) -> Vec<PropagationJob> {
    contrasts
        .iter()
        .map(|spec| {
            let subdir = spec.path.as_deref().unwrap_or(default_subdir);
            let source = layout.contrast_image(session, subdir, &spec.name);
            let output = sibling(&source, None);
            PropagationJob {
                contrast: spec.name.clone(),
                kind: spec.kind,
                source,
                output,
            }
        })
        .collect()
}

fn sibling(path: &Path, tag: Option<&str>) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(symmetric_name(&name, tag))
}

/// Symmetrizes one session and its extra contrasts.
///
/// Never fails as a whole: missing inputs give a `Skipped` report and
/// engine failures a `Failed` one, so callers can go on with the other
/// sessions.
pub fn symmetrize_session<E: ImageEngine + ?Sized>(
    engine: &E,
    cache: &OutputCache,
    config: &PipelineConfig,
    session: &str,
) -> SessionReport {
    info!("=== Symmetrizing session {} ===", session);
    let layout = config.layout();
    let source = layout.template_image(
        session,
        &config.template_path,
        &config.template_type,
        &config.template_modality,
    );
    let paths = SymmetrizationPaths::new(&layout, session, &config.template_modality, source);
    let stable = layout.sym_template(
        session,
        &config.template_path,
        &config.template_type,
        &config.template_modality,
    );
    let params = &config.symmetrization;

    let mut required = vec![(config.template_modality.clone(), paths.source.clone())];
    if !params.compute_registration {
        required.push(("anat2sym transform".to_string(), paths.anat_transform.clone()));
        required.push(("flip2sym transform".to_string(), paths.flip_transform.clone()));
    }
    let missing = check_session_inputs(session, &required);
    if !missing.is_empty() {
        warn!("[{}] skipped: {} missing input(s)", session, missing.len());
        return SessionReport::skipped(session, &missing);
    }

    let result = if params.compute_registration {
        cache
            .get_or_compute(
                &[
                    stable.as_path(),
                    paths.anat_transform.as_path(),
                    paths.flip_transform.as_path(),
                ],
                || load_template(session, &paths, &stable, params.max_angle),
                || compute_template(engine, config, session, &paths, &stable),
            )
            .map(Cached::into_inner)
    } else {
        load_template(session, &paths, &stable, params.max_angle)
    };

    let template = match result {
        Ok(template) => template,
        Err(e) => {
            error!("[{}] symmetrization failed: {}", session, e);
            return SessionReport::failed(session, &e);
        }
    };

    let (jobs, clashing): (Vec<_>, Vec<_>) =
        symmetric_jobs(&layout, session, &config.template_path, &params.contrasts)
            .into_iter()
            .partition(|job| job.output != stable);
    let driver = PropagationDriver::new(engine, cache, config.keep_tmp);
    let mut contrasts = driver.propagate_symmetric(&template, params.axis, &jobs, |job| {
        [
            sibling(&job.source, Some("flipped")),
            sibling(&job.source, Some("warped")),
            sibling(&job.source, Some("flipped_warped")),
        ]
    });
    contrasts.extend(clashing.into_iter().map(|job| {
        error!(
            "[{}] contrast {} would overwrite the symmetric template {}",
            session,
            job.contrast,
            stable.display()
        );
        ContrastReport {
            contrast: job.contrast,
            kind: job.kind,
            outcome: ContrastOutcome::Failed {
                error: format!("output {} is the symmetric template", job.output.display()),
            },
        }
    }));

    SessionReport::from_template(&template, contrasts)
}
