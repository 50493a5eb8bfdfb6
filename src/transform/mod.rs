pub mod chain;
pub mod decompose;

use nalgebra::{Matrix3, Matrix4, Point3, Rotation3, Vector3};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, PipelineResult};

/// Which step of the pipeline estimated a transform. Used for naming
/// files and for log output only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Stage {
    /// subject -> running symmetric estimate
    AnatToSym,
    /// mirrored subject -> running symmetric estimate
    FlipToSym,
    /// session k -> session k-1
    SessionHop,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Stage::AnatToSym => "anat2sym",
            Stage::FlipToSym => "flip2sym",
            Stage::SessionHop => "hop",
        };
        write!(f, "{}", tag)
    }
}

/// On-disk encoding of a transform, as understood by the external engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransformFormat {
    /// 4x4 text matrix in FSL scaled-voxel coordinates (flirt `-omat`).
    Fsl,
    /// ITK text/binary transform (antsApplyTransforms `-t`).
    Itk,
    /// Dense displacement field image.
    WarpField,
    /// Not backed by a file.
    InMemory,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransformKind {
    Rigid {
        matrix: Matrix4<f64>,
    },
    /// Opaque displacement field. The forward field lives in
    /// `Transform::file`; an inverse field is only known when the
    /// registration engine wrote one.
    Deformable {
        inverse_field: Option<PathBuf>,
    },
}

/// Spatial mapping from a moving image's space to a fixed image's space.
///
/// Fields are private: a transform never changes after it has been
/// estimated or loaded. Derived views (inverse, engine arguments,
/// decomposition) always produce new values.
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    kind: TransformKind,
    invert: bool,
    moving: String,
    fixed: String,
    stage: Stage,
    file: Option<PathBuf>,
    format: TransformFormat,
}

impl Transform {
    pub fn rigid(matrix: Matrix4<f64>, moving: &str, fixed: &str, stage: Stage) -> Self {
        Self {
            kind: TransformKind::Rigid { matrix },
            invert: false,
            moving: moving.to_string(),
            fixed: fixed.to_string(),
            stage,
            file: None,
            format: TransformFormat::InMemory,
        }
    }

    pub fn identity(moving: &str, fixed: &str, stage: Stage) -> Self {
        Self::rigid(Matrix4::identity(), moving, fixed, stage)
    }

    pub fn translation(offset: [f64; 3], moving: &str, fixed: &str, stage: Stage) -> Self {
        let matrix = Matrix4::new_translation(&Vector3::from(offset));
        Self::rigid(matrix, moving, fixed, stage)
    }

    /// Builds a rigid transform from x-y-z Euler angles in degrees
    /// (R = Rz * Ry * Rx) and a translation.
    pub fn from_euler_deg(
        angles_deg: [f64; 3],
        translation: [f64; 3],
        moving: &str,
        fixed: &str,
        stage: Stage,
    ) -> Self {
        let rotation = Rotation3::from_euler_angles(
            angles_deg[0].to_radians(),
            angles_deg[1].to_radians(),
            angles_deg[2].to_radians(),
        );
        let mut matrix = rotation.to_homogeneous();
        matrix[(0, 3)] = translation[0];
        matrix[(1, 3)] = translation[1];
        matrix[(2, 3)] = translation[2];
        Self::rigid(matrix, moving, fixed, stage)
    }

    pub fn deformable(
        field: PathBuf,
        inverse_field: Option<PathBuf>,
        moving: &str,
        fixed: &str,
        stage: Stage,
    ) -> Self {
        Self {
            kind: TransformKind::Deformable { inverse_field },
            invert: false,
            moving: moving.to_string(),
            fixed: fixed.to_string(),
            stage,
            file: Some(field),
            format: TransformFormat::WarpField,
        }
    }

    /// Attaches the file the engine wrote this transform to.
    pub fn with_file(mut self, path: PathBuf, format: TransformFormat) -> Self {
        self.file = Some(path);
        self.format = format;
        self
    }

    pub fn kind(&self) -> &TransformKind {
        &self.kind
    }

    pub fn is_rigid(&self) -> bool {
        matches!(self.kind, TransformKind::Rigid { .. })
    }

    pub fn invert(&self) -> bool {
        self.invert
    }

    pub fn moving(&self) -> &str {
        &self.moving
    }

    pub fn fixed(&self) -> &str {
        &self.fixed
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn format(&self) -> TransformFormat {
        self.format
    }

    /// The stored matrix, before the direction flag is taken into account.
    pub fn matrix(&self) -> Option<&Matrix4<f64>> {
        match &self.kind {
            TransformKind::Rigid { matrix } => Some(matrix),
            TransformKind::Deformable { .. } => None,
        }
    }

    /// The matrix actually applied, i.e. the inverse of the stored one
    /// when the transform is inverse-applied.
    pub fn effective_matrix(&self) -> Option<Matrix4<f64>> {
        self.matrix().map(|m| {
            if self.invert {
                rigid_inverse(m)
            } else {
                *m
            }
        })
    }

    /// Returns the transform mapping `fixed` back to `moving`.
    ///
    /// Rigid transforms are flagged inverse-applied, keeping the stored
    /// matrix and file. Deformable transforms switch to their explicit
    /// inverse field, or fail when the engine did not provide one.
    pub fn inverse(&self) -> PipelineResult<Transform> {
        match &self.kind {
            TransformKind::Rigid { .. } => Ok(Transform {
                kind: self.kind.clone(),
                invert: !self.invert,
                moving: self.fixed.clone(),
                fixed: self.moving.clone(),
                stage: self.stage,
                file: self.file.clone(),
                format: self.format,
            }),
            TransformKind::Deformable { inverse_field } => {
                let inverse_field =
                    inverse_field
                        .clone()
                        .ok_or_else(|| PipelineError::InverseDeformable {
                            moving: self.moving.clone(),
                            fixed: self.fixed.clone(),
                        })?;
                Ok(Transform {
                    kind: TransformKind::Deformable {
                        inverse_field: self.file.clone(),
                    },
                    invert: false,
                    moving: self.fixed.clone(),
                    fixed: self.moving.clone(),
                    stage: self.stage,
                    file: Some(inverse_field),
                    format: self.format,
                })
            }
        }
    }

    /// Maps a point with the effective matrix.
    pub fn apply_point(&self, point: &Point3<f64>) -> PipelineResult<Point3<f64>> {
        let matrix = self.effective_matrix().ok_or_else(|| PipelineError::NotRigid {
            moving: self.moving.clone(),
            fixed: self.fixed.clone(),
        })?;
        Ok(matrix.transform_point(point))
    }

    /// Argument in the `-t` syntax of antsApplyTransforms: `path` or
    /// `[path,1]` for inverse-applied matrices.
    pub fn engine_arg(&self) -> Option<String> {
        let path = self.file.as_ref()?;
        if self.invert {
            Some(format!("[{},1]", path.display()))
        } else {
            Some(path.display().to_string())
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_rigid() { "rigid" } else { "deformable" };
        write!(f, "{} {} {} -> {}", kind, self.stage, self.moving, self.fixed)?;
        if self.invert {
            write!(f, " (inverse)")?;
        }
        Ok(())
    }
}

/// Inverse of a rotation + translation matrix without a general inversion:
/// [R t]^-1 = [R^T  -R^T t].
pub fn rigid_inverse(matrix: &Matrix4<f64>) -> Matrix4<f64> {
    let rotation: Matrix3<f64> = matrix.fixed_view::<3, 3>(0, 0).into_owned();
    let translation: Vector3<f64> = matrix.fixed_view::<3, 1>(0, 3).into_owned();
    let rt = rotation.transpose();
    let t = -(rt * translation);
    let mut inverse = rt.to_homogeneous();
    inverse[(0, 3)] = t.x;
    inverse[(1, 3)] = t.y;
    inverse[(2, 3)] = t.z;
    inverse
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rigid_inverse_round_trip_point() {
        let t = Transform::from_euler_deg([10.0, -20.0, 35.0], [1.0, 2.0, 3.0], "a", "b", Stage::SessionHop);
        let p = Point3::new(4.0, -1.0, 2.5);

        let q = t.apply_point(&p).unwrap();
        let back = t.inverse().unwrap().apply_point(&q).unwrap();

        assert_relative_eq!(back.x, p.x, epsilon = 1e-9);
        assert_relative_eq!(back.y, p.y, epsilon = 1e-9);
        assert_relative_eq!(back.z, p.z, epsilon = 1e-9);
    }

    #[test]
    fn test_inverse_swaps_provenance_and_keeps_file() {
        let t = Transform::translation([1.0, 0.0, 0.0], "ses-1", "ses-0", Stage::SessionHop)
            .with_file(PathBuf::from("hop.txt"), TransformFormat::Itk);
        let inv = t.inverse().unwrap();

        assert!(inv.invert());
        assert_eq!(inv.moving(), "ses-0");
        assert_eq!(inv.fixed(), "ses-1");
        assert_eq!(inv.file(), Some(Path::new("hop.txt")));
        assert_eq!(inv.engine_arg().unwrap(), "[hop.txt,1]");
        assert_eq!(t.engine_arg().unwrap(), "hop.txt");

        // inverting twice restores the original direction
        assert_eq!(inv.inverse().unwrap(), t);
    }

    #[test]
    fn test_deformable_inverse_requires_explicit_field() {
        let no_inverse = Transform::deformable(
            PathBuf::from("1Warp.nii.gz"),
            None,
            "ses-1",
            "ses-0",
            Stage::SessionHop,
        );
        assert!(matches!(
            no_inverse.inverse(),
            Err(PipelineError::InverseDeformable { .. })
        ));

        let with_inverse = Transform::deformable(
            PathBuf::from("1Warp.nii.gz"),
            Some(PathBuf::from("1InverseWarp.nii.gz")),
            "ses-1",
            "ses-0",
            Stage::SessionHop,
        );
        let inv = with_inverse.inverse().unwrap();
        assert_eq!(inv.file(), Some(Path::new("1InverseWarp.nii.gz")));
        assert!(!inv.invert());
        assert_eq!(inv.engine_arg().unwrap(), "1InverseWarp.nii.gz");
    }

    #[test]
    fn test_deformable_has_no_point_mapping() {
        let t = Transform::deformable(PathBuf::from("w.nii.gz"), None, "a", "b", Stage::SessionHop);
        assert!(matches!(
            t.apply_point(&Point3::origin()),
            Err(PipelineError::NotRigid { .. })
        ));
    }
}
