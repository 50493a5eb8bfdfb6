use std::path::{Path, PathBuf};

use crate::transform::Stage;

const NIFTI_EXT: &str = ".nii.gz";

/// Deterministic paths of the BIDS-derivative tree the pipeline reads and
/// writes. Every output path is a pure function of its identifiers, which
/// is what makes path-keyed memoization sound.
#[derive(Debug, Clone)]
pub struct DatasetLayout {
    root: PathBuf,
    subject: String,
}

impl DatasetLayout {
    pub fn new<P: AsRef<Path>>(root: P, template_name: &str) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            subject: format!("sub-{}", template_name),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// `sub-<name>_<ses>_<token>.nii.gz`
    pub fn image_name(&self, session: &str, token: &str) -> String {
        format!("{}_{}_{}{}", self.subject, session, token, NIFTI_EXT)
    }

    pub fn template_dir(&self, session: &str, subdir: &str) -> PathBuf {
        self.root
            .join("derivatives")
            .join("template")
            .join(&self.subject)
            .join(session)
            .join(subdir)
    }

    pub fn template_image(
        &self,
        session: &str,
        subdir: &str,
        template_type: &str,
        modality: &str,
    ) -> PathBuf {
        let token = format!("{}_{}", template_type, modality);
        self.template_dir(session, subdir)
            .join(self.image_name(session, &token))
    }

    pub fn contrast_image(&self, session: &str, subdir: &str, contrast: &str) -> PathBuf {
        self.template_dir(session, subdir)
            .join(self.image_name(session, contrast))
    }

    fn transforms_root(&self) -> PathBuf {
        self.root
            .join("derivatives")
            .join("transforms")
            .join(&self.subject)
    }

    /// Work directory of the symmetrization of one session.
    pub fn transforms_dir(&self, session: &str) -> PathBuf {
        self.transforms_root().join(session)
    }

    pub fn sym_transform(&self, session: &str, stage: Stage) -> PathBuf {
        self.transforms_dir(session)
            .join(format!("{}_flirt_{}.mat", session, stage))
    }

    /// Flipped, warped, per-iteration and final images of the
    /// symmetrization loop, all kept in the session's work directory.
    pub fn sym_work_image(&self, session: &str, modality: &str, tag: Option<&str>) -> PathBuf {
        self.transforms_dir(session)
            .join(symmetric_name(&self.image_name(session, modality), tag))
    }

    /// Stable name of the converged symmetric template: the source
    /// template name with `symmetric` before the modality, so the
    /// template type stays in the name.
    pub fn sym_template(
        &self,
        session: &str,
        subdir: &str,
        template_type: &str,
        modality: &str,
    ) -> PathBuf {
        let token = format!("{}_{}", template_type, modality);
        self.template_dir(session, subdir)
            .join(symmetric_name(&self.image_name(session, &token), None))
    }

    pub fn long_dir(&self) -> PathBuf {
        self.transforms_root().join("long")
    }

    fn hop_prefix(&self, from: &str, to: &str) -> String {
        format!("{}_to_{}_flirt", from, to)
    }

    pub fn hop_matrix(&self, from: &str, to: &str) -> PathBuf {
        self.long_dir().join(format!("{}.mat", self.hop_prefix(from, to)))
    }

    /// Hop transform converted for the chain engine.
    pub fn hop_engine_transform(&self, from: &str, to: &str) -> PathBuf {
        self.long_dir()
            .join(format!("{}_ants_rig.txt", self.hop_prefix(from, to)))
    }

    /// Output prefix of a rigid + deformable hop registration.
    pub fn hop_deformable_prefix(&self, from: &str, to: &str) -> PathBuf {
        self.long_dir().join(format!("{}_to_{}_ants_", from, to))
    }

    pub fn hop_warped(&self, from: &str, to: &str) -> PathBuf {
        self.long_dir()
            .join(format!("{}_warped{}", self.hop_prefix(from, to), NIFTI_EXT))
    }

    pub fn report(&self, run: &str) -> PathBuf {
        self.transforms_root().join(format!("{}_report.json", run))
    }
}

/// Inserts `symmetric` (and an optional tag) before the final modality
/// token of a `.nii.gz` file name:
/// `sub-A_ses-1_T1w.nii.gz` + `flipped` -> `sub-A_ses-1_symmetric_flipped_T1w.nii.gz`.
/// Other names are returned unchanged.
pub fn symmetric_name(filename: &str, tag: Option<&str>) -> String {
    let Some(stem) = filename.strip_suffix(NIFTI_EXT) else {
        return filename.to_string();
    };
    let mut parts: Vec<&str> = stem.split('_').collect();
    let last = parts.len() - 1;
    parts.insert(last, "symmetric");
    if let Some(tag) = tag {
        let last = parts.len() - 1;
        parts.insert(last, tag);
    }
    format!("{}{}", parts.join("_"), NIFTI_EXT)
}

/// Inserts `space-<space>` after the subject and session tokens:
/// `sub-A_ses-1_desc-x_T2w.nii.gz` -> `sub-A_ses-1_space-CACP_desc-x_T2w.nii.gz`.
pub fn space_name(filename: &str, space: &str) -> String {
    let Some(stem) = filename.strip_suffix(NIFTI_EXT) else {
        return filename.to_string();
    };
    let mut parts: Vec<&str> = stem.split('_').collect();
    let at = parts.len().min(2);
    let tag = format!("space-{}", space);
    parts.insert(at, &tag);
    format!("{}{}", parts.join("_"), NIFTI_EXT)
}

/// Same directory, file name rewritten with `space_name`.
pub fn in_space(path: &Path, space: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(space_name(&name, space))
}
