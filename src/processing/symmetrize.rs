use log::{debug, info, warn};
use serde::Serialize;
use std::iter::FusedIterator;
use std::path::{Path, PathBuf};

use crate::config::SymmetrizationConfig;
use crate::engine::{ImageEngine, Interpolation, RigidRequest};
use crate::error::{PipelineError, PipelineResult};
use crate::io::layout::DatasetLayout;
use crate::transform::chain::TransformChain;
use crate::transform::decompose::{decompose, symmetry_score, Decomposition};
use crate::transform::{Stage, Transform};

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Convergence {
    /// Score fell below `max_angle`.
    Converged,
    /// Iteration cap hit first; the last estimate is still returned.
    NotReached,
}

/// Work files of one session's symmetrization.
#[derive(Debug, Clone)]
pub struct SymmetrizationPaths {
    pub source: PathBuf,
    pub flipped: PathBuf,
    pub initial_mean: PathBuf,
    pub warped: PathBuf,
    pub flipped_warped: PathBuf,
    pub anat_transform: PathBuf,
    pub flip_transform: PathBuf,
    layout: DatasetLayout,
    session: String,
    modality: String,
}

impl SymmetrizationPaths {
    pub fn new(layout: &DatasetLayout, session: &str, modality: &str, source: PathBuf) -> Self {
        let work = |tag: &str| layout.sym_work_image(session, modality, Some(tag));
        Self {
            source,
            flipped: work("flipped"),
            initial_mean: work("sym-tmp_mean"),
            warped: work("warped"),
            flipped_warped: work("flipped_warped"),
            anat_transform: layout.sym_transform(session, Stage::AnatToSym),
            flip_transform: layout.sym_transform(session, Stage::FlipToSym),
            layout: layout.clone(),
            session: session.to_string(),
            modality: modality.to_string(),
        }
    }

    /// Running estimate produced by iteration `n`.
    pub fn iteration_target(&self, n: usize) -> PathBuf {
        self.layout
            .sym_work_image(&self.session, &self.modality, Some(&format!("ite{}", n)))
    }

    /// Intermediate images of a run of `iterations` iterations, final
    /// target included.
    pub fn temporaries(&self, iterations: usize) -> Vec<PathBuf> {
        let mut paths = vec![
            self.flipped.clone(),
            self.initial_mean.clone(),
            self.warped.clone(),
            self.flipped_warped.clone(),
        ];
        paths.extend((1..=iterations).map(|n| self.iteration_target(n)));
        paths
    }
}

/// Record of one iteration.
#[derive(Debug, Clone)]
pub struct SymmetrizationState {
    pub iteration: usize,
    pub previous_target: PathBuf,
    pub target: PathBuf,
    pub anat_to_target: Transform,
    pub flip_to_target: Transform,
    pub anat: Decomposition,
    pub flip: Decomposition,
    pub score: f64,
    /// Set on the last state only.
    pub stop: Option<Convergence>,
}

/// Converged (or capped) symmetric template of one session.
#[derive(Debug, Clone)]
pub struct SymmetrizedTemplate {
    pub session: String,
    pub target: PathBuf,
    pub anat_to_sym: Transform,
    pub flip_to_sym: Transform,
    pub iterations: usize,
    pub score: f64,
    pub max_angle: f64,
    pub convergence: Convergence,
    /// Loaded from an earlier run instead of iterated.
    pub cached: bool,
}

impl SymmetrizedTemplate {
    pub fn require_converged(&self) -> PipelineResult<()> {
        match self.convergence {
            Convergence::Converged => Ok(()),
            Convergence::NotReached => Err(PipelineError::ConvergenceNotReached {
                session: self.session.clone(),
                iterations: self.iterations,
                score: self.score,
                max_angle: self.max_angle,
            }),
        }
    }
}

/// Bilateral symmetrization of one image: register the image and its
/// mirror onto their running average until the two rotations cancel.
pub struct SymmetrizationLoop<'a, E: ImageEngine + ?Sized> {
    engine: &'a E,
    session: &'a str,
    paths: &'a SymmetrizationPaths,
    params: &'a SymmetrizationConfig,
}

impl<'a, E: ImageEngine + ?Sized> SymmetrizationLoop<'a, E> {
    pub fn new(
        engine: &'a E,
        session: &'a str,
        paths: &'a SymmetrizationPaths,
        params: &'a SymmetrizationConfig,
    ) -> Self {
        Self {
            engine,
            session,
            paths,
            params,
        }
    }

    /// Mirrors and averages the source, then returns the lazy sequence of
    /// iterations. The sequence ends after the first state carrying a
    /// stop reason, or after the first error.
    pub fn states(&self) -> PipelineResult<SymmetrizationStates<'_, 'a, E>> {
        let paths = self.paths;
        info!(
            "[{}] symmetrizing {} (max_angle {}°, max_iter {})",
            self.session,
            paths.source.display(),
            self.params.max_angle,
            self.params.max_iter
        );
        self.engine
            .mirror(&paths.source, self.params.axis, &paths.flipped)?;
        let target = self
            .engine
            .average(&[&paths.source, &paths.flipped], &paths.initial_mean)?;

        Ok(SymmetrizationStates {
            run: self,
            target,
            iteration: 0,
            done: false,
        })
    }

    /// Runs the loop to its end and keeps the last state.
    pub fn run(&self) -> PipelineResult<SymmetrizedTemplate> {
        let mut last = None;
        for state in self.states()? {
            last = Some(state?);
        }
        let last = last.ok_or_else(|| PipelineError::ConvergenceNotReached {
            session: self.session.to_string(),
            iterations: 0,
            score: f64::INFINITY,
            max_angle: self.params.max_angle,
        })?;

        Ok(SymmetrizedTemplate {
            session: self.session.to_string(),
            target: last.target,
            anat_to_sym: last.anat_to_target,
            flip_to_sym: last.flip_to_target,
            iterations: last.iteration,
            score: last.score,
            max_angle: self.params.max_angle,
            convergence: last.stop.unwrap_or(Convergence::NotReached),
            cached: false,
        })
    }

    fn register(
        &self,
        moving: &Path,
        moving_space: &str,
        fixed: &Path,
        stage: Stage,
        transform_out: &Path,
        iteration: usize,
    ) -> PipelineResult<Transform> {
        let fixed_space = format!("{}-symmetric", self.session);
        self.engine.register_rigid(&RigidRequest {
            moving,
            fixed,
            moving_space,
            fixed_space: &fixed_space,
            stage,
            params: &self.params.rigid,
            transform_out,
            warped_out: None,
            iteration: Some(iteration),
        })
    }

    fn step(&self, iteration: usize, previous: &Path) -> PipelineResult<SymmetrizationState> {
        let paths = self.paths;
        let flipped_space = format!("{}-flipped", self.session);

        let anat_to_target = self.register(
            &paths.source,
            self.session,
            previous,
            Stage::AnatToSym,
            &paths.anat_transform,
            iteration,
        )?;
        let flip_to_target = self.register(
            &paths.flipped,
            &flipped_space,
            previous,
            Stage::FlipToSym,
            &paths.flip_transform,
            iteration,
        )?;

        let anat = decompose(&anat_to_target)?;
        let flip = decompose(&flip_to_target)?;
        let score = symmetry_score(&anat, &flip);
        info!("[{}] iteration {}", self.session, iteration);
        info!("[{}]   anat2sym {}", self.session, anat);
        info!("[{}]   flip2sym {}", self.session, flip);
        info!("[{}]   score {:.4}", self.session, score);

        let warped = self.engine.apply(
            &paths.source,
            &TransformChain::from_engine_order(vec![anat_to_target.clone()]),
            previous,
            Interpolation::Linear,
            &paths.warped,
        )?;
        let flipped_warped = self.engine.apply(
            &paths.flipped,
            &TransformChain::from_engine_order(vec![flip_to_target.clone()]),
            previous,
            Interpolation::Linear,
            &paths.flipped_warped,
        )?;
        let target = self
            .engine
            .average(&[&warped, &flipped_warped], &paths.iteration_target(iteration))?;

        let stop = if score < self.params.max_angle {
            info!(
                "[{}] converged at iteration {} (score {:.4} < {})",
                self.session, iteration, score, self.params.max_angle
            );
            Some(Convergence::Converged)
        } else if iteration >= self.params.max_iter {
            warn!(
                "[{}] stopped at max_iter {} without convergence (score {:.4} >= {})",
                self.session, iteration, score, self.params.max_angle
            );
            Some(Convergence::NotReached)
        } else {
            None
        };

        Ok(SymmetrizationState {
            iteration,
            previous_target: previous.to_path_buf(),
            target,
            anat_to_target,
            flip_to_target,
            anat,
            flip,
            score,
            stop,
        })
    }
}

/// Iterator over the states of one `SymmetrizationLoop`. Not restartable.
pub struct SymmetrizationStates<'l, 'a, E: ImageEngine + ?Sized> {
    run: &'l SymmetrizationLoop<'a, E>,
    target: PathBuf,
    iteration: usize,
    done: bool,
}

impl<E: ImageEngine + ?Sized> Iterator for SymmetrizationStates<'_, '_, E> {
    type Item = PipelineResult<SymmetrizationState>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        self.iteration += 1;
        let result = self.run.step(self.iteration, &self.target);
        match &result {
            Ok(state) if state.stop.is_none() => {
                debug!(
                    "[{}] next target {}",
                    self.run.session,
                    state.target.display()
                );
                self.target = state.target.clone();
            }
            _ => self.done = true,
        }
        Some(result)
    }
}

impl<E: ImageEngine + ?Sized> FusedIterator for SymmetrizationStates<'_, '_, E> {}
