use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by the symmetrization loop, the chain composer and the
/// external engine adapters.
///
/// Every variant carries enough context (session, modality, iteration or
/// path) to be reported on its own; per-session errors are collected by
/// the entry points instead of aborting independent sessions.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("missing {label} for session {session}: {path:?}")]
    MissingInput {
        session: String,
        label: String,
        path: PathBuf,
    },

    #[error("registration of {moving:?} to {fixed:?} failed{at}: {message}", at = fmt_iteration(.iteration))]
    Registration {
        moving: PathBuf,
        fixed: PathBuf,
        iteration: Option<usize>,
        message: String,
    },

    #[error(
        "session {session} did not converge after {iterations} iteration(s): score {score:.4} >= {max_angle}"
    )]
    ConvergenceNotReached {
        session: String,
        iterations: usize,
        score: f64,
        max_angle: f64,
    },

    #[error("chain for session {session} is broken: no transform for hop {from} -> {to}")]
    ChainBroken {
        session: String,
        from: String,
        to: String,
    },

    #[error("deformable transform {moving} -> {fixed} has no explicit inverse field")]
    InverseDeformable { moving: String, fixed: String },

    #[error("transform {moving} -> {fixed} is not rigid and cannot be decomposed")]
    NotRigid { moving: String, fixed: String },

    #[error("external command `{command}` failed: {message}")]
    Engine { command: String, message: String },

    #[error("malformed transform matrix {path:?}: {message}")]
    Matrix { path: PathBuf, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

fn fmt_iteration(iteration: &Option<usize>) -> String {
    match iteration {
        Some(n) => format!(" at iteration {}", n),
        None => String::new(),
    }
}

impl PipelineError {
    /// Whether the error only concerns inputs of a single session. These
    /// are reported and skipped rather than treated as hard failures.
    pub fn is_missing_input(&self) -> bool {
        matches!(self, PipelineError::MissingInput { .. })
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
