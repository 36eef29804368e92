//! Siamese composition: one embedding network invoked twice, then a distance head.
//!
//! Both towers are the same [`EmbeddingNetwork`] value. There is no second
//! parameter set to drift, and training accumulates the gradients of both
//! invocations into the one set.

use crate::artifact::ModelMetadata;
use crate::network::{EmbeddingNetwork, NetworkConfig, NetworkGradients};
use crate::registry::{contrastive_loss_op, euclidean_distance_op, DistanceOp, LossOp};
use crate::types::{Embedding, NormalizedImage, PairLabel};
use ndarray::Array1;
use rand::rngs::StdRng;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0} (train one with `signa train`)")]
    NotFound(String),
    #[error("cannot access model file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed model artifact {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot serialize model artifact: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("unsupported artifact format version {found} (this build reads {expected})")]
    UnsupportedFormat { found: u32, expected: u32 },
    #[error("weight digest mismatch: artifact records {expected}, weights hash to {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("weight shape mismatch: {0}")]
    WeightShape(String),
    #[error("{kind} operator {name:?} is not registered")]
    UnregisteredOperator { kind: &'static str, name: String },
    #[error("invalid network configuration: {0}")]
    InvalidConfig(String),
    #[error("input shape {actual:?} does not match model input {expected:?}")]
    ShapeMismatch { expected: [usize; 3], actual: [usize; 3] },
}

/// Twin-tower similarity model producing a scalar dissimilarity per image pair.
#[derive(Debug, Clone)]
pub struct SiameseModel {
    pub(crate) network: EmbeddingNetwork,
    pub(crate) distance: DistanceOp,
    pub(crate) loss: LossOp,
    pub(crate) metadata: ModelMetadata,
}

impl SiameseModel {
    /// Fresh model with the built-in Euclidean head and contrastive loss.
    pub fn new(input_height: usize, input_width: usize, config: NetworkConfig, seed: u64) -> Result<Self, ModelError> {
        let network = EmbeddingNetwork::new(input_height, input_width, config, seed)?;
        Ok(Self::from_parts(network, euclidean_distance_op(), contrastive_loss_op()))
    }

    pub fn from_parts(network: EmbeddingNetwork, distance: DistanceOp, loss: LossOp) -> Self {
        Self {
            network,
            distance,
            loss,
            metadata: ModelMetadata::fresh(),
        }
    }

    pub fn network(&self) -> &EmbeddingNetwork {
        &self.network
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn distance_op(&self) -> &DistanceOp {
        &self.distance
    }

    pub fn loss_op(&self) -> &LossOp {
        &self.loss
    }

    /// Input shape as (height, width, channels).
    pub fn input_shape(&self) -> [usize; 3] {
        let (h, w) = self.network.input_shape();
        [h, w, 1]
    }

    pub fn embed(&self, image: &NormalizedImage) -> Result<Embedding, ModelError> {
        let values = self.network.embed(image)?;
        Ok(Embedding {
            values: values.to_vec(),
        })
    }

    /// Distance between two already-computed embeddings.
    pub fn distance_between(&self, a: &Embedding, b: &Embedding) -> f32 {
        (self.distance.forward)(&a.values, &b.values)
    }

    /// Scalar dissimilarity of two images (smaller = more alike).
    pub fn compare(&self, a: &NormalizedImage, b: &NormalizedImage) -> Result<f32, ModelError> {
        let ea = self.embed(a)?;
        let eb = self.embed(b)?;
        Ok(self.distance_between(&ea, &eb))
    }

    /// Per-pair loss for a distance under the model's loss operator.
    pub fn pair_loss(&self, distance: f32, label: PairLabel, margin: f32) -> f32 {
        (self.loss.forward)(distance, label.loss_target(), margin)
    }

    /// Forward and backward one labeled pair through both towers.
    ///
    /// Gradients from each tower are added into the same `grads`, which is
    /// what keeps the towers tied. Returns `(distance, loss)`.
    pub(crate) fn accumulate_pair(
        &self,
        a: &NormalizedImage,
        b: &NormalizedImage,
        label: PairLabel,
        margin: f32,
        mut dropout_rng: Option<&mut StdRng>,
        grads: &mut NetworkGradients,
    ) -> Result<(f32, f32), ModelError> {
        let (ea, trace_a) = self.network.forward_train(a, dropout_rng.as_deref_mut())?;
        let (eb, trace_b) = self.network.forward_train(b, dropout_rng.as_deref_mut())?;
        let (va, vb) = (ea.to_vec(), eb.to_vec());

        let distance = (self.distance.forward)(&va, &vb);
        let target = label.loss_target();
        let loss = (self.loss.forward)(distance, target, margin);
        let dloss = (self.loss.derivative)(distance, target, margin);

        if dloss != 0.0 {
            let grad_a = Array1::from((self.distance.grad_first)(&va, &vb, distance)) * dloss;
            let grad_b = Array1::from((self.distance.grad_first)(&vb, &va, distance)) * dloss;
            self.network.backward(&trace_a, grad_a.view(), grads);
            self.network.backward(&trace_b, grad_b.view(), grads);
        }

        Ok((distance, loss))
    }
}
