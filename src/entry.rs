use anyhow::{anyhow, Context, Result};
use crossbeam::thread;
use log::{info, warn};
use nalgebra::Matrix4;
use std::path::Path;

use crate::config::PipelineConfig;
use crate::engine::command::CommandEngine;
use crate::engine::memo::OutputCache;
use crate::engine::ImageEngine;
use crate::io::matrix::read_matrix;
use crate::io::write_report;
use crate::processing::longitudinal::{missing_hop_images, LongitudinalRun};
use crate::processing::report::{RunReport, SessionReport};
use crate::processing::symmetrize_session;
use crate::transform::decompose::{decompose, Decomposition};
use crate::transform::{Stage, Transform};

fn command_engine(config: &PipelineConfig) -> CommandEngine {
    CommandEngine::new(config.engine.clone(), config.dry_run, config.threads)
}

fn finish(config: &PipelineConfig, report: RunReport) -> Result<RunReport> {
    report.log_summary();
    let path = config.layout().report(&report.run);
    if config.dry_run {
        info!("dry run: report not written ({})", path.display());
    } else {
        write_report(&report, &path)
            .with_context(|| format!("writing report {}", path.display()))?;
        info!("report written to {}", path.display());
    }
    Ok(report)
}

/// Symmetrizes every configured session with the external engines.
pub fn run_symmetrization(config: &PipelineConfig) -> Result<RunReport> {
    config.validate().context("invalid configuration")?;
    let engine = command_engine(config);
    let cache = OutputCache::new(config.force);
    let report = symmetrize_with(&engine, &cache, config)?;
    finish(config, report)
}

/// Registers the session timeline and propagates along its chains.
pub fn run_longitudinal(config: &PipelineConfig) -> Result<RunReport> {
    config
        .validate_longitudinal()
        .context("invalid configuration")?;
    let engine = command_engine(config);
    let cache = OutputCache::new(config.force);
    let report = longitudinal_with(&engine, &cache, config)?;
    finish(config, report)
}

/// Symmetrization over any engine. Sessions are independent: a failing
/// one is reported and the others still run, in parallel when
/// `parallel_sessions` is set.
pub fn symmetrize_with<E: ImageEngine + ?Sized>(
    engine: &E,
    cache: &OutputCache,
    config: &PipelineConfig,
) -> Result<RunReport> {
    let mut report = RunReport::new("symmetrize", engine.is_dry_run());

    report.sessions = if config.parallel_sessions {
        thread::scope(|s| -> Result<Vec<SessionReport>> {
            let handles: Vec<_> = config
                .sessions
                .iter()
                .map(|session| s.spawn(move |_| symmetrize_session(engine, cache, config, session)))
                .collect();
            handles
                .into_iter()
                .zip(&config.sessions)
                .map(|(handle, session)| {
                    handle
                        .join()
                        .map_err(|e| anyhow!("session {} thread panicked: {:?}", session, e))
                })
                .collect()
        })
        .map_err(|panic_payload| anyhow!("Parallel session threads panicked: {:?}", panic_payload))??
    } else {
        config
            .sessions
            .iter()
            .map(|session| symmetrize_session(engine, cache, config, session))
            .collect()
    };

    Ok(report)
}

/// Longitudinal run over any engine, on a rayon pool of `threads`
/// workers.
pub fn longitudinal_with<E: ImageEngine + ?Sized>(
    engine: &E,
    cache: &OutputCache,
    config: &PipelineConfig,
) -> Result<RunReport> {
    for (session, path) in missing_hop_images(config) {
        warn!("[{}] no hop image at {}", session, path.display());
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.threads)
        .build()
        .context("building thread pool")?;
    Ok(pool.install(|| LongitudinalRun::new(engine, cache, config).run()))
}

/// Reads a flirt matrix and returns it with its decomposition.
pub fn decompose_matrix_file(path: &Path) -> Result<(Matrix4<f64>, Decomposition)> {
    let matrix = read_matrix(path).with_context(|| format!("reading {}", path.display()))?;
    let name = path.display().to_string();
    let transform = Transform::rigid(matrix, &name, &name, Stage::SessionHop);
    let decomposition = decompose(&transform)?;
    Ok((matrix, decomposition))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::report::SessionStatus;
    use crate::utils::test_utils::{scratch_dir, touch, ScriptedEngine};

    fn config(root: &Path, sessions: &[&str], parallel: bool) -> PipelineConfig {
        let list: Vec<String> = sessions.iter().map(|s| format!("{:?}", s)).collect();
        let text = format!(
            "bids_root = {:?}\ntemplate_name = \"Test\"\nsessions = [{}]\nparallel_sessions = {}\n",
            root.display().to_string(),
            list.join(", "),
            parallel
        );
        PipelineConfig::from_toml_str(&text).unwrap()
    }

    fn touch_sources(config: &PipelineConfig, sessions: &[&str]) {
        for s in sessions {
            touch(&config.layout().template_image(
                s,
                &config.template_path,
                &config.template_type,
                &config.template_modality,
            ));
        }
    }

    #[test]
    fn test_failing_session_does_not_stop_others() {
        for parallel in [false, true] {
            let root = scratch_dir(&format!("entry_isolation_{}", parallel));
            let config = config(&root, &["ses-1", "ses-2", "ses-3"], parallel);
            touch_sources(&config, &["ses-1", "ses-3"]);
            let engine = ScriptedEngine::new().touching_outputs();

            let report = symmetrize_with(&engine, &OutputCache::new(false), &config).unwrap();
            let statuses: Vec<_> = report.sessions.iter().map(|s| s.status).collect();
            assert_eq!(
                statuses,
                vec![SessionStatus::Converged, SessionStatus::Skipped, SessionStatus::Converged]
            );
            assert_eq!(report.sessions[1].session, "ses-2");
        }
    }

    #[test]
    fn test_longitudinal_needs_two_sessions() {
        let root = scratch_dir("entry_long_single");
        let config = config(&root, &["ses-0"], false);
        assert!(run_longitudinal(&config).is_err());
    }

    #[test]
    fn test_decompose_matrix_file() {
        let dir = scratch_dir("entry_decompose");
        let path = dir.join("m.mat");
        let t = Transform::from_euler_deg([0.0, 0.0, 30.0], [1.0, 2.0, 3.0], "a", "b", Stage::SessionHop);
        crate::io::matrix::write_matrix(&path, t.matrix().unwrap()).unwrap();

        let (_, d) = decompose_matrix_file(&path).unwrap();
        approx::assert_relative_eq!(d.angles_deg[2], 30.0, epsilon = 1e-6);
        approx::assert_relative_eq!(d.translation[1], 2.0, epsilon = 1e-9);
        assert!(decompose_matrix_file(&dir.join("absent.mat")).is_err());
    }
}
