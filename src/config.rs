use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::engine::{Axis, DeformableParams, Interpolation};
use crate::io::layout::DatasetLayout;
use crate::io::sessions::read_sessions;

/// Everything a run needs, loaded once and handed to each component.
///
/// Nothing is read from the process environment or the working directory
/// afterwards; thread counts reach the external engines through the child
/// process environment only.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub bids_root: PathBuf,
    pub template_name: String,
    #[serde(default)]
    pub sessions: Vec<String>,
    #[serde(default)]
    pub sessions_csv: Option<PathBuf>,
    #[serde(default = "default_template_type")]
    pub template_type: String,
    #[serde(default = "default_modality")]
    pub template_modality: String,
    #[serde(default = "default_template_path")]
    pub template_path: String,

    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub keep_tmp: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub parallel_sessions: bool,
    #[serde(default = "default_threads")]
    pub threads: usize,

    #[serde(default)]
    pub symmetrization: SymmetrizationConfig,
    #[serde(default)]
    pub longitudinal: LongitudinalConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct SearchRange {
    pub min: f64,
    pub max: f64,
}

impl SearchRange {
    pub fn symmetric(deg: f64) -> Self {
        Self { min: -deg, max: deg }
    }
}

/// Parameters of a rigid registration call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RigidParams {
    #[serde(default = "default_dof")]
    pub dof: u32,
    pub search_x: SearchRange,
    pub search_y: SearchRange,
    pub search_z: SearchRange,
}

impl RigidParams {
    pub fn with_search(x: f64, y: f64, z: f64) -> Self {
        Self {
            dof: default_dof(),
            search_x: SearchRange::symmetric(x),
            search_y: SearchRange::symmetric(y),
            search_z: SearchRange::symmetric(z),
        }
    }
}

/// Kind of data a contrast carries; decides the resampling kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContrastKind {
    /// Masks and segmentations: nearest neighbour only.
    Label,
    /// Continuous intensities and probability maps.
    Intensity,
}

impl ContrastKind {
    pub fn interpolation(self) -> Interpolation {
        match self {
            ContrastKind::Label => Interpolation::NearestNeighbor,
            ContrastKind::Intensity => Interpolation::Linear,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContrastSpec {
    pub name: String,
    #[serde(default = "default_contrast_kind")]
    pub kind: ContrastKind,
    /// Subfolder under the session's template directory; defaults to the
    /// run's template path.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SymmetrizationConfig {
    #[serde(default = "default_max_angle")]
    pub max_angle: f64,
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    #[serde(default)]
    pub axis: Axis,
    #[serde(default = "default_sym_rigid")]
    pub rigid: RigidParams,
    /// Skip the registration loop and only propagate existing transforms.
    #[serde(default = "default_true")]
    pub compute_registration: bool,
    #[serde(default)]
    pub contrasts: Vec<ContrastSpec>,
}

impl Default for SymmetrizationConfig {
    fn default() -> Self {
        Self {
            max_angle: default_max_angle(),
            max_iter: default_max_iter(),
            axis: Axis::default(),
            rigid: default_sym_rigid(),
            compute_registration: true,
            contrasts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LongitudinalConfig {
    /// Modality the pairwise hops are registered on.
    #[serde(default = "default_hop_modality")]
    pub modality: String,
    #[serde(default = "default_long_template_type")]
    pub template_type: String,
    #[serde(default = "default_long_template_path")]
    pub template_path: String,
    #[serde(default = "default_hop_rigid")]
    pub hop: RigidParams,
    /// When set, hops are registered rigid + deformable instead of rigid.
    #[serde(default)]
    pub deformable: Option<DeformableParams>,
    /// Contrasts of each later session brought into the reference session.
    #[serde(default)]
    pub contrasts: Vec<ContrastSpec>,
    /// Contrasts of the reference session pushed into every later session.
    #[serde(default)]
    pub from_reference: Vec<ContrastSpec>,
    #[serde(default = "default_output_space")]
    pub output_space: String,
}

impl Default for LongitudinalConfig {
    fn default() -> Self {
        Self {
            modality: default_hop_modality(),
            template_type: default_long_template_type(),
            template_path: default_long_template_path(),
            hop: default_hop_rigid(),
            deformable: None,
            contrasts: Vec::new(),
            from_reference: Vec::new(),
            output_space: default_output_space(),
        }
    }
}

/// Executable names of the external engines.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub flirt: String,
    pub swapdim: String,
    pub copy_header: String,
    pub average: String,
    pub apply_transforms: String,
    pub registration: String,
    pub affine_tool: String,
    pub convert_transform: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flirt: "flirt".to_string(),
            swapdim: "fslswapdim".to_string(),
            copy_header: "CopyImageHeaderInformation".to_string(),
            average: "AverageImages".to_string(),
            apply_transforms: "antsApplyTransforms".to_string(),
            registration: "antsRegistration".to_string(),
            affine_tool: "c3d_affine_tool".to_string(),
            convert_transform: "ConvertTransformFile".to_string(),
        }
    }
}

fn default_template_type() -> String {
    "desc-average_padded_debiased_cropped_norm".to_string()
}
fn default_modality() -> String {
    "T1w".to_string()
}
fn default_template_path() -> String {
    "final".to_string()
}
fn default_threads() -> usize {
    1
}
fn default_dof() -> u32 {
    6
}
fn default_max_angle() -> f64 {
    1.0
}
fn default_max_iter() -> usize {
    10
}
fn default_true() -> bool {
    true
}
fn default_sym_rigid() -> RigidParams {
    RigidParams::with_search(5.0, 5.0, 5.0)
}
fn default_hop_rigid() -> RigidParams {
    RigidParams::with_search(30.0, 5.0, 5.0)
}
fn default_hop_modality() -> String {
    "T2w".to_string()
}
fn default_long_template_type() -> String {
    "desc-symmetric-sharpen".to_string()
}
fn default_long_template_path() -> String {
    "norm".to_string()
}
fn default_output_space() -> String {
    "CACP".to_string()
}
fn default_contrast_kind() -> ContrastKind {
    ContrastKind::Intensity
}

impl PipelineConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Parses a TOML document and resolves the session list.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let mut config: PipelineConfig = toml::from_str(text)?;
        config.resolve_sessions()?;
        Ok(config)
    }

    fn resolve_sessions(&mut self) -> Result<()> {
        if let Some(csv_path) = &self.sessions_csv {
            if !self.sessions.is_empty() {
                bail!("give either `sessions` or `sessions_csv`, not both");
            }
            let csv_path = if csv_path.is_relative() {
                self.bids_root.join(csv_path)
            } else {
                csv_path.clone()
            };
            self.sessions = read_sessions(&csv_path)
                .with_context(|| format!("reading session list {}", csv_path.display()))?;
        }
        Ok(())
    }

    pub fn layout(&self) -> DatasetLayout {
        DatasetLayout::new(&self.bids_root, &self.template_name)
    }

    /// Checks invariants that must hold before any external call.
    pub fn validate(&self) -> Result<()> {
        if self.sessions.is_empty() {
            return Err(anyhow!("no sessions configured"));
        }
        if !(self.symmetrization.max_angle > 0.0) {
            bail!(
                "max_angle must be positive, got {}",
                self.symmetrization.max_angle
            );
        }
        if self.symmetrization.max_iter == 0 {
            bail!("max_iter must be at least 1");
        }
        if self.threads == 0 {
            bail!("threads must be at least 1");
        }
        let mut seen = std::collections::HashSet::new();
        for session in &self.sessions {
            if !seen.insert(session) {
                bail!("session {} listed twice", session);
            }
        }
        Ok(())
    }

    pub fn validate_longitudinal(&self) -> Result<()> {
        self.validate()?;
        if self.sessions.len() < 2 {
            bail!(
                "longitudinal registration needs at least two sessions, got {}",
                self.sessions.len()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        bids_root = "/data/bids"
        template_name = "BaBa21"
        sessions = ["ses-0", "ses-1"]
    "#;

    #[test]
    fn test_defaults_follow_rigid_six_dof() {
        let config = PipelineConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.symmetrization.max_iter, 10);
        assert_eq!(config.symmetrization.max_angle, 1.0);
        assert_eq!(config.symmetrization.rigid.dof, 6);
        assert_eq!(config.symmetrization.rigid.search_x, SearchRange::symmetric(5.0));
        assert_eq!(config.longitudinal.hop.search_x, SearchRange::symmetric(30.0));
        assert_eq!(config.longitudinal.hop.search_y, SearchRange::symmetric(5.0));
        assert_eq!(config.engine.flirt, "flirt");
        assert!(!config.dry_run);
        assert!(config.symmetrization.compute_registration);
        config.validate_longitudinal().unwrap();
    }

    #[test]
    fn test_contrast_kinds_pick_interpolation() {
        let text = format!(
            "{}\n{}",
            MINIMAL,
            r#"
            [symmetrization]
            max_iter = 3
            contrasts = [
                { name = "label-WM_probseg" },
                { name = "desc-brain_mask", kind = "label", path = "masks" },
            ]
            "#
        );
        let config = PipelineConfig::from_toml_str(&text).unwrap();
        let contrasts = &config.symmetrization.contrasts;
        assert_eq!(contrasts[0].kind.interpolation(), Interpolation::Linear);
        assert_eq!(contrasts[1].kind.interpolation(), Interpolation::NearestNeighbor);
        assert_eq!(contrasts[1].path.as_deref(), Some("masks"));
        assert_eq!(config.symmetrization.max_iter, 3);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = PipelineConfig::from_toml_str(MINIMAL).unwrap();
        config.symmetrization.max_iter = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::from_toml_str(MINIMAL).unwrap();
        config.symmetrization.max_angle = 0.0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::from_toml_str(MINIMAL).unwrap();
        config.sessions = vec!["ses-0".to_string()];
        assert!(config.validate().is_ok());
        assert!(config.validate_longitudinal().is_err());

        config.sessions = vec!["ses-0".to_string(), "ses-0".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let text = format!("{}\nmax_iterations = 4\n", MINIMAL);
        assert!(PipelineConfig::from_toml_str(&text).is_err());
    }
}
