use nalgebra::{Matrix3, Rotation3, Vector3};
use serde::Serialize;
use std::fmt;

use super::Transform;
use crate::error::{PipelineError, PipelineResult};

/// Read-only translation + Euler-angle view of a rigid transform.
///
/// Angles are in degrees, extrinsic x-y-z order (R = Rz * Ry * Rx). The
/// view is never turned back into a transform; the matrix stays the source
/// of truth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Decomposition {
    pub translation: [f64; 3],
    pub angles_deg: [f64; 3],
}

impl Decomposition {
    pub fn angles(&self) -> Vector3<f64> {
        Vector3::from(self.angles_deg)
    }

    pub fn translation(&self) -> Vector3<f64> {
        Vector3::from(self.translation)
    }
}

impl fmt::Display for Decomposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [tx, ty, tz] = self.translation;
        let [rx, ry, rz] = self.angles_deg;
        write!(
            f,
            "translation (x, y, z): {:.6}, {:.6}, {:.6} | rotation (rx, ry, rz): {:.3}°, {:.3}°, {:.3}°",
            tx, ty, tz, rx, ry, rz
        )
    }
}

/// Splits the effective matrix of a rigid transform into translation and
/// Euler angles. The 3x3 block is projected onto the closest rotation
/// first, so small numerical drift in stored matrices is tolerated.
pub fn decompose(transform: &Transform) -> PipelineResult<Decomposition> {
    let matrix = transform
        .effective_matrix()
        .ok_or_else(|| PipelineError::NotRigid {
            moving: transform.moving().to_string(),
            fixed: transform.fixed().to_string(),
        })?;

    let linear: Matrix3<f64> = matrix.fixed_view::<3, 3>(0, 0).into_owned();
    let rotation = Rotation3::from_matrix(&linear);
    let (rx, ry, rz) = rotation.euler_angles();

    Ok(Decomposition {
        translation: [matrix[(0, 3)], matrix[(1, 3)], matrix[(2, 3)]],
        angles_deg: [rx.to_degrees(), ry.to_degrees(), rz.to_degrees()],
    })
}

/// Residual left-right asymmetry between the two registrations of one
/// iteration: the component-wise sum of both angle triples, then the sum
/// of absolute values. Mirror-symmetric volumes give rotations that cancel.
pub fn symmetry_score(anat: &Decomposition, flip: &Decomposition) -> f64 {
    (anat.angles() + flip.angles()).abs().sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::Stage;
    use approx::assert_relative_eq;
    use nalgebra::Matrix4;
    use rand::Rng;

    #[test]
    fn test_decompose_identity() {
        let d = decompose(&Transform::identity("a", "b", Stage::AnatToSym)).unwrap();
        assert_eq!(d.translation, [0.0, 0.0, 0.0]);
        for angle in d.angles_deg {
            assert_relative_eq!(angle, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_decompose_recovers_random_angles() {
        let mut rng = rand::rng();
        for _ in 0..50 {
            let angles = [
                rng.random_range(-170.0..170.0),
                rng.random_range(-80.0..80.0),
                rng.random_range(-170.0..170.0),
            ];
            let translation = [
                rng.random_range(-10.0..10.0),
                rng.random_range(-10.0..10.0),
                rng.random_range(-10.0..10.0),
            ];
            let t = Transform::from_euler_deg(angles, translation, "a", "b", Stage::AnatToSym);
            let d = decompose(&t).unwrap();
            for i in 0..3 {
                assert_relative_eq!(d.angles_deg[i], angles[i], epsilon = 1e-6);
                assert_relative_eq!(d.translation[i], translation[i], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_decompose_single_axis_rotation() {
        let t = Transform::from_euler_deg([0.0, 0.0, 90.0], [0.0; 3], "a", "b", Stage::FlipToSym);
        let d = decompose(&t).unwrap();
        assert_relative_eq!(d.angles_deg[2], 90.0, epsilon = 1e-9);
        // R_z(90) sends x onto y
        let m = t.effective_matrix().unwrap();
        assert_relative_eq!(m[(1, 0)], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_decompose_inverse_applied_negates_single_angle() {
        let t = Transform::from_euler_deg([0.0, 3.0, 0.0], [0.0; 3], "a", "b", Stage::AnatToSym);
        let d = decompose(&t.inverse().unwrap()).unwrap();
        assert_relative_eq!(d.angles_deg[1], -3.0, epsilon = 1e-9);
    }

    #[test]
    fn test_decompose_tolerates_slightly_non_orthogonal_matrix() {
        let mut m = Matrix4::identity();
        m[(0, 1)] = 1e-7;
        m[(0, 3)] = 2.0;
        let t = Transform::rigid(m, "a", "b", Stage::AnatToSym);
        let d = decompose(&t).unwrap();
        assert_relative_eq!(d.translation[0], 2.0);
        for angle in d.angles_deg {
            assert!(angle.abs() < 1e-3);
        }
    }

    #[test]
    fn test_symmetry_score_uses_vector_sum() {
        let anat = Decomposition {
            translation: [0.0; 3],
            angles_deg: [2.0, -1.0, 0.5],
        };
        let flip = Decomposition {
            translation: [0.0; 3],
            angles_deg: [-2.0, 1.5, 0.5],
        };
        // |0| + |0.5| + |1.0|, not the sum of both magnitudes
        assert_relative_eq!(symmetry_score(&anat, &flip), 1.5);
    }
}
