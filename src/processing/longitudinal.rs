use log::{error, info};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

use super::propagate::{ContrastOutcome, ContrastReport, PropagationDriver, PropagationJob};
use super::report::{ChainReport, HopReport, HopStatus, RunReport, TransformSummary};
use crate::config::{ContrastSpec, PipelineConfig};
use crate::engine::memo::{Cached, OutputCache};
use crate::engine::{DeformableParams, DeformableRequest, ImageEngine, RigidRequest};
use crate::error::PipelineResult;
use crate::io::layout::{in_space, DatasetLayout};
use crate::io::matrix::read_itk_affine;
use crate::io::sessions::require_input;
use crate::transform::chain::{compose_hop_stacks, SessionChain, TransformChain};
use crate::transform::{Stage, Transform, TransformFormat};

/// Brings a timeline of sessions into the space of its first session.
///
/// Consecutive sessions are registered pairwise (later session moving),
/// the hops are composed into one chain per session, and the configured
/// contrasts are resampled along those chains. Contrasts of the reference
/// session can be pushed the other way with the inverted chains.
pub struct LongitudinalRun<'a, E: ImageEngine + ?Sized> {
    engine: &'a E,
    cache: &'a OutputCache,
    config: &'a PipelineConfig,
    layout: DatasetLayout,
}

impl<'a, E: ImageEngine + ?Sized> LongitudinalRun<'a, E> {
    pub fn new(engine: &'a E, cache: &'a OutputCache, config: &'a PipelineConfig) -> Self {
        Self {
            engine,
            cache,
            config,
            layout: config.layout(),
        }
    }

    fn hop_image(&self, session: &str) -> PathBuf {
        hop_image_path(self.config, session)
    }

    /// Registers `from` onto `to`, or reloads the result of an earlier run.
    pub fn register_hop(&self, from: &str, to: &str) -> PipelineResult<Cached<TransformChain>> {
        match &self.config.longitudinal.deformable {
            Some(params) => self.register_deformable_hop(from, to, params),
            None => self.register_rigid_hop(from, to),
        }
    }

    fn hop_inputs(&self, from: &str, to: &str) -> PipelineResult<(PathBuf, PathBuf)> {
        let modality = &self.config.longitudinal.modality;
        let moving = require_input(from, modality, &self.hop_image(from))?;
        let fixed = require_input(to, modality, &self.hop_image(to))?;
        Ok((moving, fixed))
    }

    fn register_rigid_hop(&self, from: &str, to: &str) -> PipelineResult<Cached<TransformChain>> {
        let matrix_path = self.layout.hop_matrix(from, to);
        let stack_path = self.layout.hop_engine_transform(from, to);

        self.cache.get_or_compute(
            &[stack_path.as_path(), matrix_path.as_path()],
            || {
                let matrix = read_itk_affine(&stack_path)?;
                let hop = Transform::rigid(matrix, from, to, Stage::SessionHop)
                    .with_file(stack_path.clone(), TransformFormat::Itk);
                Ok(TransformChain::from_engine_order(vec![hop]))
            },
            || {
                let (moving, fixed) = self.hop_inputs(from, to)?;
                let warped = self.layout.hop_warped(from, to);
                let hop = self.engine.register_rigid(&RigidRequest {
                    moving: &moving,
                    fixed: &fixed,
                    moving_space: from,
                    fixed_space: to,
                    stage: Stage::SessionHop,
                    params: &self.config.longitudinal.hop,
                    transform_out: &matrix_path,
                    warped_out: Some(&warped),
                    iteration: None,
                })?;
                let exported = self
                    .engine
                    .export_for_stack(&hop, &moving, &fixed, &stack_path)?;
                Ok(TransformChain::from_engine_order(vec![exported]))
            },
        )
    }

    fn register_deformable_hop(
        &self,
        from: &str,
        to: &str,
        params: &DeformableParams,
    ) -> PipelineResult<Cached<TransformChain>> {
        let prefix = self.layout.hop_deformable_prefix(from, to);
        let named = |suffix: &str| PathBuf::from(format!("{}{}", prefix.display(), suffix));
        let warp = named("1Warp.nii.gz");
        let inverse_warp = named("1InverseWarp.nii.gz");
        let affine = named("0GenericAffine.mat");
        let affine_text = named("0GenericAffine.txt");

        self.cache.get_or_compute(
            &[
                warp.as_path(),
                inverse_warp.as_path(),
                affine.as_path(),
                affine_text.as_path(),
            ],
            || {
                let matrix = read_itk_affine(&affine_text)?;
                let linear = Transform::rigid(matrix, from, to, Stage::SessionHop)
                    .with_file(affine.clone(), TransformFormat::Itk);
                let field = Transform::deformable(
                    warp.clone(),
                    Some(inverse_warp.clone()),
                    from,
                    to,
                    Stage::SessionHop,
                );
                Ok(TransformChain::from_engine_order(vec![field, linear]))
            },
            || {
                let (moving, fixed) = self.hop_inputs(from, to)?;
                self.engine.register_deformable(&DeformableRequest {
                    moving: &moving,
                    fixed: &fixed,
                    moving_space: from,
                    fixed_space: to,
                    params,
                    out_prefix: &prefix,
                })
            },
        )
    }

    /// Registers every consecutive pair, in session order. A failed hop
    /// is reported and left empty; composition decides what it breaks.
    pub fn register_hops(&self) -> (Vec<HopReport>, Vec<Option<TransformChain>>) {
        let sessions = &self.config.sessions;
        let mut reports = Vec::with_capacity(sessions.len().saturating_sub(1));
        let mut stacks = Vec::with_capacity(sessions.len().saturating_sub(1));

        for pair in sessions.windows(2) {
            let (to, from) = (&pair[0], &pair[1]);
            info!("=== Hop {} -> {} ===", from, to);
            match self.register_hop(from, to) {
                Ok(cached) => {
                    let status = if cached.is_hit() {
                        HopStatus::Cached
                    } else {
                        HopStatus::Computed
                    };
                    let stack = cached.into_inner();
                    reports.push(HopReport {
                        from: from.clone(),
                        to: to.clone(),
                        status,
                        transforms: stack.transforms().iter().map(TransformSummary::from).collect(),
                        error: None,
                    });
                    stacks.push(Some(stack));
                }
                Err(e) => {
                    error!("hop {} -> {} failed: {}", from, to, e);
                    reports.push(HopReport {
                        from: from.clone(),
                        to: to.clone(),
                        status: HopStatus::Failed,
                        transforms: Vec::new(),
                        error: Some(e.to_string()),
                    });
                    stacks.push(None);
                }
            }
        }
        (reports, stacks)
    }

    fn jobs(
        &self,
        specs: &[ContrastSpec],
        build: impl Fn(&str, &str) -> (PathBuf, PathBuf),
    ) -> Vec<PropagationJob> {
        let default_subdir = &self.config.longitudinal.template_path;
        specs
            .iter()
            .map(|spec| {
                let subdir = spec.path.as_deref().unwrap_or(default_subdir);
                let (source, output) = build(subdir, &spec.name);
                PropagationJob {
                    contrast: spec.name.clone(),
                    kind: spec.kind,
                    source,
                    output,
                }
            })
            .collect()
    }

    /// Propagates one session's contrasts into the reference session and,
    /// with the inverted chain, the reference contrasts into the session.
    pub fn propagate(&self, session_chain: &SessionChain) -> ChainReport {
        let session = session_chain.session.as_str();
        let long = &self.config.longitudinal;

        let chain = match &session_chain.chain {
            Ok(chain) => chain,
            Err(e) => {
                error!("[{}] {}", session, e);
                return ChainReport {
                    session: session.to_string(),
                    complete: false,
                    transforms: Vec::new(),
                    error: Some(e.to_string()),
                    contrasts: Vec::new(),
                    from_reference: Vec::new(),
                };
            }
        };

        let Some(reference_session) = self.config.sessions.first() else {
            return ChainReport {
                session: session.to_string(),
                complete: true,
                transforms: chain.engine_args(),
                error: None,
                contrasts: Vec::new(),
                from_reference: Vec::new(),
            };
        };
        let driver = PropagationDriver::new(self.engine, self.cache, self.config.keep_tmp);

        let to_reference = self.jobs(&long.contrasts, |subdir, name| {
            let source = self.layout.contrast_image(session, subdir, name);
            let output = in_space(&source, &long.output_space);
            (source, output)
        });
        let contrasts = driver.propagate_chain(
            session,
            chain,
            &self.hop_image(reference_session),
            &to_reference,
        );

        let from_reference_jobs = self.jobs(&long.from_reference, |subdir, name| {
            (
                self.layout.contrast_image(reference_session, subdir, name),
                self.layout.contrast_image(session, subdir, name),
            )
        });
        let from_reference = match chain.inverse() {
            Ok(inverse) => driver.propagate_chain(
                session,
                &inverse,
                &self.hop_image(session),
                &from_reference_jobs,
            ),
            Err(e) => {
                error!("[{}] cannot invert chain: {}", session, e);
                from_reference_jobs
                    .iter()
                    .map(|job| ContrastReport {
                        contrast: job.contrast.clone(),
                        kind: job.kind,
                        outcome: ContrastOutcome::Failed {
                            error: e.to_string(),
                        },
                    })
                    .collect()
            }
        };

        ChainReport {
            session: session.to_string(),
            complete: true,
            transforms: chain.engine_args(),
            error: None,
            contrasts,
            from_reference,
        }
    }

    /// Hops, composition and propagation. With `parallel_sessions` the
    /// per-session propagation runs on the current rayon pool.
    pub fn run(&self) -> RunReport {
        let mut report = RunReport::new("longitudinal", self.engine.is_dry_run());
        let (hops, stacks) = self.register_hops();
        report.hops = hops;

        let chains = compose_hop_stacks(&self.config.sessions, &stacks);
        report.chains = if self.config.parallel_sessions {
            chains.par_iter().map(|c| self.propagate(c)).collect()
        } else {
            chains.iter().map(|c| self.propagate(c)).collect()
        };
        report
    }
}

/// Image the hops of `session` are registered on.
pub fn hop_image_path(config: &PipelineConfig, session: &str) -> PathBuf {
    let long = &config.longitudinal;
    config
        .layout()
        .template_image(session, &long.template_path, &long.template_type, &long.modality)
}

/// Sessions whose hop image does not exist.
pub fn missing_hop_images(config: &PipelineConfig) -> Vec<(String, PathBuf)> {
    config
        .sessions
        .iter()
        .map(|s| (s.clone(), hop_image_path(config, s)))
        .filter(|(_, p)| !Path::exists(p))
        .collect()
}
