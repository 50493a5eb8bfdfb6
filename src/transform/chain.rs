use log::{debug, warn};
use nalgebra::{Matrix4, Point3};

use super::Transform;
use crate::error::{PipelineError, PipelineResult};

/// Ordered stack of transforms in engine order: the last element is
/// applied first, the way antsApplyTransforms consumes repeated `-t`.
///
/// `apply_point` follows the resampling convention of those engines: it
/// maps a point of the reference (fixed) space to the space of the image
/// being resampled.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransformChain {
    transforms: Vec<Transform>,
}

impl TransformChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_engine_order(transforms: Vec<Transform>) -> Self {
        Self { transforms }
    }

    /// Chain of the next session: `hop` goes to the front, so it is the
    /// last transform to be applied.
    pub fn with_hop(&self, hop: Transform) -> Self {
        let mut transforms = Vec::with_capacity(self.transforms.len() + 1);
        transforms.push(hop);
        transforms.extend(self.transforms.iter().cloned());
        Self { transforms }
    }

    /// Like `with_hop`, for a hop the engine estimated as several
    /// transforms (deformable registration: warp field, then affine).
    pub fn with_hop_stack(&self, hop: &TransformChain) -> Self {
        let mut transforms = Vec::with_capacity(self.transforms.len() + hop.len());
        transforms.extend(hop.transforms.iter().cloned());
        transforms.extend(self.transforms.iter().cloned());
        Self { transforms }
    }

    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// Transforms in the order they act on a point.
    pub fn application_order(&self) -> impl Iterator<Item = &Transform> {
        self.transforms.iter().rev()
    }

    pub fn apply_point(&self, point: &Point3<f64>) -> PipelineResult<Point3<f64>> {
        self.application_order()
            .try_fold(*point, |p, t| t.apply_point(&p))
    }

    pub fn is_rigid(&self) -> bool {
        self.transforms.iter().all(Transform::is_rigid)
    }

    /// Single matrix equivalent to the whole chain, when every element is
    /// rigid.
    pub fn composed_matrix(&self) -> Option<Matrix4<f64>> {
        self.transforms
            .iter()
            .try_fold(Matrix4::identity(), |acc, t| {
                t.effective_matrix().map(|m| acc * m)
            })
    }

    /// Chain mapping the other way round: order reversed, each element
    /// inverted. Rigid elements are only flagged; deformable elements need
    /// an explicit inverse field or the whole chain is rejected.
    pub fn inverse(&self) -> PipelineResult<Self> {
        let transforms = self
            .transforms
            .iter()
            .rev()
            .map(Transform::inverse)
            .collect::<PipelineResult<Vec<_>>>()?;
        Ok(Self { transforms })
    }

    /// `-t` arguments for the engine, in engine order.
    pub fn engine_args(&self) -> Vec<String> {
        self.transforms
            .iter()
            .filter_map(Transform::engine_arg)
            .collect()
    }
}

/// Chain result for one non-reference session.
#[derive(Debug)]
pub struct SessionChain {
    pub session: String,
    pub chain: PipelineResult<TransformChain>,
}

impl SessionChain {
    pub fn is_complete(&self) -> bool {
        self.chain.is_ok()
    }
}

/// Builds, for every session after the reference `sessions[0]`, the chain
/// mapping it into the reference space.
///
/// `hops[k - 1]` is the pairwise transform of `sessions[k]` (moving) onto
/// `sessions[k - 1]` (fixed). A missing hop breaks the chain of its session
/// and of every later one; those sessions get `ChainBroken` naming the
/// first missing hop instead of a shortened chain.
pub fn compose_chains(sessions: &[String], hops: &[Option<Transform>]) -> Vec<SessionChain> {
    let stacks: Vec<Option<TransformChain>> = hops
        .iter()
        .map(|hop| {
            hop.as_ref()
                .map(|t| TransformChain::from_engine_order(vec![t.clone()]))
        })
        .collect();
    compose_hop_stacks(sessions, &stacks)
}

/// `compose_chains` for hops that are themselves transform stacks.
pub fn compose_hop_stacks(
    sessions: &[String],
    hops: &[Option<TransformChain>],
) -> Vec<SessionChain> {
    if hops.len() + 1 != sessions.len() {
        warn!(
            "compose_chains: {} sessions but {} hops, extra entries ignored",
            sessions.len(),
            hops.len()
        );
    }

    let mut chains = Vec::with_capacity(sessions.len().saturating_sub(1));
    let mut running = TransformChain::new();
    let mut broken: Option<(String, String)> = None;

    for k in 1..sessions.len() {
        let session = &sessions[k];
        let previous = &sessions[k - 1];

        if broken.is_none() {
            match hops.get(k - 1).and_then(Option::as_ref).filter(|h| !h.is_empty()) {
                Some(hop) => {
                    for t in hop.transforms() {
                        if t.moving() != session || t.fixed() != previous {
                            warn!(
                                "hop {} -> {} registered as {} -> {}",
                                session,
                                previous,
                                t.moving(),
                                t.fixed()
                            );
                        }
                    }
                    running = running.with_hop_stack(hop);
                }
                None => {
                    warn!("missing transform {} -> {}, chain truncated", session, previous);
                    broken = Some((session.clone(), previous.clone()));
                }
            }
        }

        let chain = match &broken {
            Some((from, to)) => Err(PipelineError::ChainBroken {
                session: session.clone(),
                from: from.clone(),
                to: to.clone(),
            }),
            None => {
                debug!("chain for {}: {} transform(s)", session, running.len());
                Ok(running.clone())
            }
        };

        chains.push(SessionChain {
            session: session.clone(),
            chain,
        });
    }

    chains
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::Stage;
    use approx::assert_relative_eq;
    use std::path::PathBuf;

    fn sessions(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("ses-{}", i)).collect()
    }

    fn hop(k: usize, offset: [f64; 3]) -> Transform {
        Transform::translation(
            offset,
            &format!("ses-{}", k),
            &format!("ses-{}", k - 1),
            Stage::SessionHop,
        )
    }

    #[test]
    fn test_chain_order_and_point_mapping() {
        let t01 = hop(1, [1.0, 0.0, 0.0]);
        let t12 = hop(2, [0.0, 1.0, 0.0]);
        let chains = compose_chains(&sessions(3), &[Some(t01.clone()), Some(t12.clone())]);

        assert_eq!(chains.len(), 2);
        let c1 = chains[0].chain.as_ref().unwrap();
        let c2 = chains[1].chain.as_ref().unwrap();
        assert_eq!(c1.transforms(), &[t01.clone()]);
        assert_eq!(c2.transforms(), &[t12, t01]);

        let p = c2.apply_point(&Point3::origin()).unwrap();
        assert_relative_eq!(p.x, 1.0);
        assert_relative_eq!(p.y, 1.0);
        assert_relative_eq!(p.z, 0.0);
    }

    #[test]
    fn test_chain_k_extends_chain_k_minus_one() {
        let hops: Vec<_> = (1..5).map(|k| Some(hop(k, [k as f64, 0.0, 0.0]))).collect();
        let chains = compose_chains(&sessions(5), &hops);
        for w in chains.windows(2) {
            let prev = w[0].chain.as_ref().unwrap();
            let next = w[1].chain.as_ref().unwrap();
            assert_eq!(&next.transforms()[1..], prev.transforms());
        }
    }

    #[test]
    fn test_application_order_for_non_commuting_hops() {
        // rotation about z by 90 degrees, then translation along x
        let rot = Transform::from_euler_deg([0.0, 0.0, 90.0], [0.0; 3], "ses-1", "ses-0", Stage::SessionHop);
        let shift = hop(2, [1.0, 0.0, 0.0]);
        let chains = compose_chains(&sessions(3), &[Some(rot), Some(shift)]);
        let chain = chains[1].chain.as_ref().unwrap();

        // rot acts first on the origin (no-op), then the shift
        let p = chain.apply_point(&Point3::origin()).unwrap();
        assert_relative_eq!(p.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(p.y, 0.0, epsilon = 1e-12);

        // composed matrix agrees with step-by-step application
        let q = Point3::new(0.5, -2.0, 3.0);
        let stepwise = chain.apply_point(&q).unwrap();
        let composed = chain.composed_matrix().unwrap().transform_point(&q);
        assert_relative_eq!(stepwise, composed, epsilon = 1e-12);
    }

    #[test]
    fn test_missing_hop_breaks_later_sessions() {
        let t01 = hop(1, [1.0, 0.0, 0.0]);
        let chains = compose_chains(&sessions(4), &[Some(t01), None, Some(hop(3, [0.0, 0.0, 1.0]))]);

        assert!(chains[0].is_complete());
        for later in &chains[1..] {
            match &later.chain {
                Err(PipelineError::ChainBroken { from, to, .. }) => {
                    assert_eq!(from, "ses-2");
                    assert_eq!(to, "ses-1");
                }
                other => panic!("expected ChainBroken, got {:?}", other),
            }
        }
        assert_eq!(chains[2].session, "ses-3");
    }

    #[test]
    fn test_inverse_chain_maps_back() {
        let hops = vec![
            Some(Transform::from_euler_deg([5.0, 0.0, 10.0], [1.0, 0.0, 0.0], "ses-1", "ses-0", Stage::SessionHop)),
            Some(Transform::from_euler_deg([0.0, -3.0, 0.0], [0.0, 2.0, 0.0], "ses-2", "ses-1", Stage::SessionHop)),
        ];
        let chains = compose_chains(&sessions(3), &hops);
        let chain = chains[1].chain.as_ref().unwrap();
        let inverse = chain.inverse().unwrap();

        assert!(inverse.transforms().iter().all(Transform::invert));
        assert_eq!(inverse.transforms()[0].moving(), "ses-0");
        assert_eq!(inverse.transforms()[0].fixed(), "ses-1");
        assert_eq!(inverse.transforms()[1].fixed(), "ses-2");

        let p = Point3::new(1.0, 2.0, 3.0);
        let back = inverse.apply_point(&chain.apply_point(&p).unwrap()).unwrap();
        assert_relative_eq!(back, p, epsilon = 1e-9);
    }

    #[test]
    fn test_inverse_chain_rejects_implicit_deformable_inverse() {
        let warp = Transform::deformable(PathBuf::from("w.nii.gz"), None, "ses-2", "ses-1", Stage::SessionHop);
        let chain = TransformChain::new()
            .with_hop(hop(1, [1.0, 0.0, 0.0]))
            .with_hop(warp);
        assert!(!chain.is_rigid());
        assert!(chain.composed_matrix().is_none());
        assert!(matches!(
            chain.inverse(),
            Err(PipelineError::InverseDeformable { .. })
        ));
    }

    #[test]
    fn test_deformable_hop_stack_keeps_engine_order() {
        let warp = Transform::deformable(
            PathBuf::from("ses-2_1Warp.nii.gz"),
            Some(PathBuf::from("ses-2_1InverseWarp.nii.gz")),
            "ses-2",
            "ses-1",
            Stage::SessionHop,
        );
        let affine = hop(2, [0.0, 1.0, 0.0]);
        let stack = TransformChain::from_engine_order(vec![warp.clone(), affine.clone()]);
        let t01 = hop(1, [1.0, 0.0, 0.0]);

        let chains = compose_hop_stacks(
            &sessions(3),
            &[Some(TransformChain::from_engine_order(vec![t01.clone()])), Some(stack)],
        );
        let chain = chains[1].chain.as_ref().unwrap();
        assert_eq!(chain.transforms(), &[warp, affine, t01]);

        // warp inverse is explicit, so the whole chain inverts
        let inverse = chain.inverse().unwrap();
        assert_eq!(inverse.len(), 3);
        assert_eq!(
            inverse.transforms()[2].file(),
            Some(std::path::Path::new("ses-2_1InverseWarp.nii.gz"))
        );
    }

    #[test]
    fn test_empty_hop_stack_counts_as_missing() {
        let chains = compose_hop_stacks(&sessions(2), &[Some(TransformChain::new())]);
        assert!(matches!(chains[0].chain, Err(PipelineError::ChainBroken { .. })));
    }

    #[test]
    fn test_single_session_has_no_chains() {
        assert!(compose_chains(&sessions(1), &[]).is_empty());
    }
}
