use log::{info, warn};
use serde::Serialize;
use std::path::PathBuf;

use super::propagate::ContrastReport;
use super::symmetrize::{Convergence, SymmetrizedTemplate};
use crate::error::PipelineError;
use crate::transform::decompose::{decompose, Decomposition};
use crate::transform::Transform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Converged,
    /// Iteration cap reached; the template exists but is not trusted.
    NotConverged,
    /// Reloaded from an earlier run; the stored transforms still score
    /// below `max_angle`.
    Cached,
    /// Reloaded from an earlier run that did not converge.
    CachedNotConverged,
    /// Required inputs missing.
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransformSummary {
    pub path: Option<PathBuf>,
    pub inverse: bool,
    pub decomposition: Option<Decomposition>,
}

impl From<&Transform> for TransformSummary {
    fn from(transform: &Transform) -> Self {
        Self {
            path: transform.file().map(PathBuf::from),
            inverse: transform.invert(),
            decomposition: decompose(transform).ok(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session: String,
    pub status: SessionStatus,
    pub iterations: Option<usize>,
    pub score: Option<f64>,
    pub target: Option<PathBuf>,
    pub anat_to_sym: Option<TransformSummary>,
    pub flip_to_sym: Option<TransformSummary>,
    pub errors: Vec<String>,
    pub contrasts: Vec<ContrastReport>,
}

impl SessionReport {
    fn empty(session: &str, status: SessionStatus, errors: Vec<String>) -> Self {
        Self {
            session: session.to_string(),
            status,
            iterations: None,
            score: None,
            target: None,
            anat_to_sym: None,
            flip_to_sym: None,
            errors,
            contrasts: Vec::new(),
        }
    }

    pub fn skipped(session: &str, missing: &[PipelineError]) -> Self {
        Self::empty(
            session,
            SessionStatus::Skipped,
            missing.iter().map(ToString::to_string).collect(),
        )
    }

    pub fn failed(session: &str, error: &PipelineError) -> Self {
        Self::empty(session, SessionStatus::Failed, vec![error.to_string()])
    }

    pub fn from_template(template: &SymmetrizedTemplate, contrasts: Vec<ContrastReport>) -> Self {
        let status = match (template.cached, template.convergence) {
            (true, Convergence::Converged) => SessionStatus::Cached,
            (true, Convergence::NotReached) => SessionStatus::CachedNotConverged,
            (false, Convergence::Converged) => SessionStatus::Converged,
            (false, Convergence::NotReached) => SessionStatus::NotConverged,
        };
        let errors = template
            .require_converged()
            .err()
            .map(|e| vec![e.to_string()])
            .unwrap_or_default();
        Self {
            session: template.session.clone(),
            status,
            iterations: Some(template.iterations),
            score: Some(template.score),
            target: Some(template.target.clone()),
            anat_to_sym: Some(TransformSummary::from(&template.anat_to_sym)),
            flip_to_sym: Some(TransformSummary::from(&template.flip_to_sym)),
            errors,
            contrasts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HopStatus {
    Computed,
    Cached,
    Failed,
}

/// Pairwise registration of `from` (moving) onto `to` (fixed).
#[derive(Debug, Clone, Serialize)]
pub struct HopReport {
    pub from: String,
    pub to: String,
    pub status: HopStatus,
    pub transforms: Vec<TransformSummary>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainReport {
    pub session: String,
    pub complete: bool,
    /// Engine arguments, in engine order.
    pub transforms: Vec<String>,
    pub error: Option<String>,
    pub contrasts: Vec<ContrastReport>,
    pub from_reference: Vec<ContrastReport>,
}

/// Everything one run did, written as JSON next to the transforms.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub run: String,
    pub dry_run: bool,
    pub sessions: Vec<SessionReport>,
    pub hops: Vec<HopReport>,
    pub chains: Vec<ChainReport>,
}

impl RunReport {
    pub fn new(run: &str, dry_run: bool) -> Self {
        Self {
            run: run.to_string(),
            dry_run,
            ..Self::default()
        }
    }

    pub fn count(&self, status: SessionStatus) -> usize {
        self.sessions.iter().filter(|s| s.status == status).count()
    }

    /// True when any session, hop, chain or contrast failed or was skipped.
    pub fn has_failures(&self) -> bool {
        self.sessions
            .iter()
            .any(|s| matches!(s.status, SessionStatus::Failed | SessionStatus::Skipped))
            || self.hops.iter().any(|h| h.status == HopStatus::Failed)
            || self.chains.iter().any(|c| !c.complete)
            || self
                .sessions
                .iter()
                .flat_map(|s| s.contrasts.iter())
                .chain(self.chains.iter().flat_map(|c| c.contrasts.iter()))
                .chain(self.chains.iter().flat_map(|c| c.from_reference.iter()))
                .any(ContrastReport::is_failed)
    }

    pub fn log_summary(&self) {
        info!("=== {} summary ===", self.run);
        for s in &self.sessions {
            let score = s.score.map(|v| format!("{:.4}", v)).unwrap_or_else(|| "-".into());
            let iterations = s.iterations.map(|v| v.to_string()).unwrap_or_else(|| "-".into());
            info!(
                "{:<12} {:<14} iterations {:<3} score {}",
                s.session,
                format!("{:?}", s.status),
                iterations,
                score
            );
            for e in &s.errors {
                warn!("{:<12}   {}", s.session, e);
            }
        }
        for h in &self.hops {
            info!("hop {} -> {}: {:?}", h.from, h.to, h.status);
        }
        for c in &self.chains {
            match &c.error {
                None => info!("chain {}: {} transform(s)", c.session, c.transforms.len()),
                Some(e) => warn!("chain {}: {}", c.session, e),
            }
        }
    }
}
