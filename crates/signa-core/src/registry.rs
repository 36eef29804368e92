//! Named operator registry.
//!
//! Model artifacts reference their distance head and training loss by a
//! stable string name. Loading an artifact resolves those names here;
//! an unknown name makes the artifact unloadable.

use crate::siamese::ModelError;
use crate::types::{floored_euclidean, DISTANCE_EPSILON};
use std::collections::BTreeMap;

pub const EUCLIDEAN_DISTANCE: &str = "euclidean_distance";
pub const CONTRASTIVE_LOSS: &str = "contrastive_loss";

/// Distance between two embeddings, with its gradient.
#[derive(Debug, Clone, Copy)]
pub struct DistanceOp {
    pub name: &'static str,
    pub forward: fn(&[f32], &[f32]) -> f32,
    /// Gradient w.r.t. the first argument, given the forward value.
    /// Distances are symmetric, so the second argument's gradient is
    /// `grad_first(b, a, d)`.
    pub grad_first: fn(&[f32], &[f32], f32) -> Vec<f32>,
}

/// Per-pair loss on a distance, with its derivative.
#[derive(Debug, Clone, Copy)]
pub struct LossOp {
    pub name: &'static str,
    /// `(distance, target, margin) -> loss`
    pub forward: fn(f32, f32, f32) -> f32,
    /// `(distance, target, margin) -> d loss / d distance`
    pub derivative: fn(f32, f32, f32) -> f32,
}

fn euclidean_grad(a: &[f32], b: &[f32], distance: f32) -> Vec<f32> {
    let sum: f32 = a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum();
    if sum <= DISTANCE_EPSILON {
        return vec![0.0; a.len()];
    }
    a.iter().zip(b).map(|(x, y)| (x - y) / distance).collect()
}

/// `(1 - y) * d^2 + y * max(m - d, 0)^2`
fn contrastive(distance: f32, target: f32, margin: f32) -> f32 {
    let hinge = (margin - distance).max(0.0);
    (1.0 - target) * distance * distance + target * hinge * hinge
}

fn contrastive_derivative(distance: f32, target: f32, margin: f32) -> f32 {
    let hinge = (margin - distance).max(0.0);
    (1.0 - target) * 2.0 * distance - target * 2.0 * hinge
}

pub fn euclidean_distance_op() -> DistanceOp {
    DistanceOp {
        name: EUCLIDEAN_DISTANCE,
        forward: floored_euclidean,
        grad_first: euclidean_grad,
    }
}

pub fn contrastive_loss_op() -> LossOp {
    LossOp {
        name: CONTRASTIVE_LOSS,
        forward: contrastive,
        derivative: contrastive_derivative,
    }
}

/// Name → operator lookup consulted when building or loading a model.
#[derive(Debug, Clone)]
pub struct OperatorRegistry {
    distances: BTreeMap<&'static str, DistanceOp>,
    losses: BTreeMap<&'static str, LossOp>,
}

impl Default for OperatorRegistry {
    /// Registry with the built-in Euclidean distance and contrastive loss.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register_distance(euclidean_distance_op());
        registry.register_loss(contrastive_loss_op());
        registry
    }
}

impl OperatorRegistry {
    pub fn empty() -> Self {
        Self {
            distances: BTreeMap::new(),
            losses: BTreeMap::new(),
        }
    }

    pub fn register_distance(&mut self, op: DistanceOp) {
        self.distances.insert(op.name, op);
    }

    pub fn register_loss(&mut self, op: LossOp) {
        self.losses.insert(op.name, op);
    }

    pub fn resolve_distance(&self, name: &str) -> Result<DistanceOp, ModelError> {
        self.distances
            .get(name)
            .copied()
            .ok_or_else(|| ModelError::UnregisteredOperator {
                kind: "distance",
                name: name.to_string(),
            })
    }

    pub fn resolve_loss(&self, name: &str) -> Result<LossOp, ModelError> {
        self.losses
            .get(name)
            .copied()
            .ok_or_else(|| ModelError::UnregisteredOperator {
                kind: "loss",
                name: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_resolves_builtins() {
        let registry = OperatorRegistry::default();
        assert_eq!(registry.resolve_distance(EUCLIDEAN_DISTANCE).unwrap().name, EUCLIDEAN_DISTANCE);
        assert_eq!(registry.resolve_loss(CONTRASTIVE_LOSS).unwrap().name, CONTRASTIVE_LOSS);
    }

    #[test]
    fn test_empty_registry_fails_by_name() {
        let registry = OperatorRegistry::empty();
        match registry.resolve_distance(EUCLIDEAN_DISTANCE) {
            Err(ModelError::UnregisteredOperator { kind, name }) => {
                assert_eq!(kind, "distance");
                assert_eq!(name, EUCLIDEAN_DISTANCE);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(registry.resolve_loss(CONTRASTIVE_LOSS).is_err());
    }

    #[test]
    fn test_contrastive_same_pair_penalizes_distance() {
        let loss = contrastive_loss_op();
        assert!(((loss.forward)(0.5, 0.0, 1.0) - 0.25).abs() < 1e-6);
        assert!(((loss.derivative)(0.5, 0.0, 1.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_contrastive_different_pair_hinges_at_margin() {
        let loss = contrastive_loss_op();
        assert!(((loss.forward)(0.25, 1.0, 1.0) - 0.5625).abs() < 1e-6);
        assert!(((loss.derivative)(0.25, 1.0, 1.0) + 1.5).abs() < 1e-6);
        // Past the margin: no penalty, no gradient
        assert_eq!((loss.forward)(1.4, 1.0, 1.0), 0.0);
        assert_eq!((loss.derivative)(1.4, 1.0, 1.0), 0.0);
    }

    #[test]
    fn test_euclidean_gradient_direction() {
        let op = euclidean_distance_op();
        let a = [3.0f32, 0.0];
        let b = [0.0f32, 4.0];
        let d = (op.forward)(&a, &b);
        let g = (op.grad_first)(&a, &b, d);
        assert!((g[0] - 0.6).abs() < 1e-6);
        assert!((g[1] + 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_gradient_zero_at_floor() {
        let op = euclidean_distance_op();
        let a = [1.0f32, 2.0];
        let d = (op.forward)(&a, &a);
        assert_eq!((op.grad_first)(&a, &a, d), vec![0.0, 0.0]);
    }
}
