use log::{info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::ContrastKind;
use crate::engine::memo::OutputCache;
use crate::engine::{Axis, ImageEngine, Interpolation};
use crate::error::PipelineResult;
use crate::io::sessions::require_input;
use crate::processing::symmetrize::SymmetrizedTemplate;
use crate::transform::chain::TransformChain;
use crate::utils::remove_temporaries;

/// One auxiliary image to bring into another space.
#[derive(Debug, Clone)]
pub struct PropagationJob {
    pub contrast: String,
    pub kind: ContrastKind,
    pub source: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ContrastOutcome {
    Written { output: PathBuf },
    /// Output existed from an earlier run.
    Cached { output: PathBuf },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ContrastReport {
    pub contrast: String,
    pub kind: ContrastKind,
    pub outcome: ContrastOutcome,
}

impl ContrastReport {
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, ContrastOutcome::Failed { .. })
    }
}

/// Applies finished transforms to the auxiliary contrasts of a session.
///
/// Labels are resampled nearest-neighbour, intensities linearly. A
/// contrast that fails is reported and skipped; the others still run.
pub struct PropagationDriver<'a, E: ImageEngine + ?Sized> {
    engine: &'a E,
    cache: &'a OutputCache,
    keep_tmp: bool,
}

impl<'a, E: ImageEngine + ?Sized> PropagationDriver<'a, E> {
    pub fn new(engine: &'a E, cache: &'a OutputCache, keep_tmp: bool) -> Self {
        Self {
            engine,
            cache,
            keep_tmp,
        }
    }

    fn cleanup(&self, paths: &[PathBuf]) {
        if self.keep_tmp || self.engine.is_dry_run() {
            return;
        }
        let refs: Vec<&Path> = paths.iter().map(PathBuf::as_path).collect();
        remove_temporaries(&refs);
    }

    /// Applies `chain` in one call, or one transform at a time when the
    /// engine cannot take stacks. Every step resamples onto `reference`.
    pub fn apply_chain(
        &self,
        image: &Path,
        chain: &TransformChain,
        reference: &Path,
        interpolation: Interpolation,
        output: &Path,
    ) -> PipelineResult<PathBuf> {
        if self.engine.supports_stacks() || chain.len() <= 1 {
            return self
                .engine
                .apply(image, chain, reference, interpolation, output);
        }

        let name = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let steps: Vec<_> = chain.application_order().collect();
        let mut intermediates = Vec::new();
        let result = steps
            .iter()
            .enumerate()
            .try_fold(image.to_path_buf(), |current, (i, transform)| -> PipelineResult<PathBuf> {
                let last = i + 1 == steps.len();
                let step_out = if last {
                    output.to_path_buf()
                } else {
                    output.with_file_name(format!("step{}_{}", i + 1, name))
                };
                let single = TransformChain::from_engine_order(vec![(*transform).clone()]);
                let written = self
                    .engine
                    .apply(&current, &single, reference, interpolation, &step_out)?;
                if !last {
                    intermediates.push(written.clone());
                }
                Ok(written)
            });
        // earlier steps are dropped on failure too
        self.cleanup(&intermediates);
        result
    }

    fn run_job(
        &self,
        session: &str,
        job: &PropagationJob,
        compute: impl FnOnce() -> PipelineResult<PathBuf>,
    ) -> ContrastReport {
        let result = require_input(session, &job.contrast, &job.source).and_then(|_| {
            self.cache
                .get_or_compute(&[job.output.as_path()], || Ok(job.output.clone()), compute)
        });
        let outcome = match result {
            Ok(cached) if cached.is_hit() => ContrastOutcome::Cached {
                output: cached.into_inner(),
            },
            Ok(cached) => ContrastOutcome::Written {
                output: cached.into_inner(),
            },
            Err(e) => {
                warn!("[{}] skipping contrast {}: {}", session, job.contrast, e);
                ContrastOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };
        ContrastReport {
            contrast: job.contrast.clone(),
            kind: job.kind,
            outcome,
        }
    }

    /// Brings every job's source into the space of `reference` through
    /// `chain`.
    pub fn propagate_chain(
        &self,
        session: &str,
        chain: &TransformChain,
        reference: &Path,
        jobs: &[PropagationJob],
    ) -> Vec<ContrastReport> {
        jobs.iter()
            .map(|job| {
                info!(
                    "[{}] propagating {} through {} transform(s)",
                    session,
                    job.contrast,
                    chain.len()
                );
                self.run_job(session, job, || {
                    self.apply_chain(
                        &job.source,
                        chain,
                        reference,
                        job.kind.interpolation(),
                        &job.output,
                    )
                })
            })
            .collect()
    }

    /// Symmetrizes contrasts with the transforms of a finished template:
    /// the contrast and its mirror are moved with their transform and
    /// averaged. `temporaries(job)` names the flipped, warped and
    /// flipped-warped intermediates.
    pub fn propagate_symmetric(
        &self,
        template: &SymmetrizedTemplate,
        axis: Axis,
        jobs: &[PropagationJob],
        temporaries: impl Fn(&PropagationJob) -> [PathBuf; 3],
    ) -> Vec<ContrastReport> {
        let anat = TransformChain::from_engine_order(vec![template.anat_to_sym.clone()]);
        let flip = TransformChain::from_engine_order(vec![template.flip_to_sym.clone()]);
        let session = template.session.as_str();

        jobs.iter()
            .map(|job| {
                info!("[{}] propagating symmetrization to {}", session, job.contrast);
                let [flipped, warped, flipped_warped] = temporaries(job);
                let interpolation = job.kind.interpolation();
                let report = self.run_job(session, job, || {
                    let warped =
                        self.engine
                            .apply(&job.source, &anat, &job.source, interpolation, &warped)?;
                    let flipped = self.engine.mirror(&job.source, axis, &flipped)?;
                    let flipped_warped = self.engine.apply(
                        &flipped,
                        &flip,
                        &job.source,
                        interpolation,
                        &flipped_warped,
                    )?;
                    self.engine.average(&[&warped, &flipped_warped], &job.output)
                });
                self.cleanup(&[flipped, warped, flipped_warped]);
                report
            })
            .collect()
    }
}
