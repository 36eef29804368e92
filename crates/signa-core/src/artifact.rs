//! Model artifact persistence.
//!
//! A model is stored as one JSON document: the network configuration, the
//! names of its distance and loss operators, every weight, and a SHA-256
//! digest over the weights. Loading resolves the operator names through an
//! [`OperatorRegistry`] and refuses the artifact if either is unknown.

use crate::network::{EmbeddingNetwork, LayerWeights, NetworkConfig};
use crate::registry::OperatorRegistry;
use crate::siamese::{ModelError, SiameseModel};
use crate::train::TrainingSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{BufWriter, Write};
use std::path::Path;
use uuid::Uuid;

pub const FORMAT_VERSION: u32 = 1;

/// Identity and provenance of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub training: Option<TrainingSummary>,
}

impl ModelMetadata {
    pub fn fresh() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            training: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OperatorNames {
    distance: String,
    loss: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ModelArtifact {
    format_version: u32,
    metadata: ModelMetadata,
    input_shape: [usize; 3],
    network: NetworkConfig,
    operators: OperatorNames,
    weights_sha256: String,
    layers: Vec<LayerWeights>,
}

#[derive(Deserialize)]
struct ArtifactHeader {
    format_version: u32,
}

/// SHA-256 over every layer's shape, weights and biases (little-endian).
pub fn weights_digest(layers: &[LayerWeights]) -> String {
    let mut hasher = Sha256::new();
    for layer in layers {
        for dim in layer.shape {
            hasher.update((dim as u64).to_le_bytes());
        }
        for v in layer.weight.iter().chain(layer.bias.iter()) {
            hasher.update(v.to_le_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

impl SiameseModel {
    /// Attach the summary of the run that produced these weights.
    pub fn set_training_summary(&mut self, summary: TrainingSummary) {
        self.metadata.training = Some(summary);
    }

    /// Write the artifact to `path` (via a sibling temp file and rename).
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let io_err = |source| ModelError::Io {
            path: path.display().to_string(),
            source,
        };

        let layers = self.network.export_weights();
        let artifact = ModelArtifact {
            format_version: FORMAT_VERSION,
            metadata: self.metadata.clone(),
            input_shape: self.input_shape(),
            network: self.network.config().clone(),
            operators: OperatorNames {
                distance: self.distance.name.to_string(),
                loss: self.loss.name.to_string(),
            },
            weights_sha256: weights_digest(&layers),
            layers,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let file = std::fs::File::create(&tmp).map_err(io_err)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, &artifact).map_err(ModelError::Serialize)?;
            writer.flush().map_err(io_err)?;
        }
        std::fs::rename(&tmp, path).map_err(io_err)?;

        tracing::info!(
            path = %path.display(),
            id = %self.metadata.id,
            parameters = self.network.parameter_count(),
            "saved signature model"
        );
        Ok(())
    }

    /// Load an artifact, resolving its operators through `registry`.
    pub fn load(path: &Path, registry: &OperatorRegistry) -> Result<Self, ModelError> {
        let shown = path.display().to_string();
        if !path.exists() {
            return Err(ModelError::NotFound(shown));
        }
        let text = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: shown.clone(),
            source,
        })?;
        let malformed = |source| ModelError::Malformed {
            path: shown.clone(),
            source,
        };

        let header: ArtifactHeader = serde_json::from_str(&text).map_err(malformed)?;
        if header.format_version != FORMAT_VERSION {
            return Err(ModelError::UnsupportedFormat {
                found: header.format_version,
                expected: FORMAT_VERSION,
            });
        }
        let artifact: ModelArtifact = serde_json::from_str(&text).map_err(malformed)?;

        let distance = registry.resolve_distance(&artifact.operators.distance)?;
        let loss = registry.resolve_loss(&artifact.operators.loss)?;

        let actual = weights_digest(&artifact.layers);
        if actual != artifact.weights_sha256 {
            return Err(ModelError::DigestMismatch {
                expected: artifact.weights_sha256,
                actual,
            });
        }

        let [height, width, channels] = artifact.input_shape;
        if channels != 1 {
            return Err(ModelError::WeightShape(format!(
                "expected a single input channel, artifact declares {channels}"
            )));
        }
        let network = EmbeddingNetwork::from_weights(height, width, artifact.network, artifact.layers)?;

        let mut model = SiameseModel::from_parts(network, distance, loss);
        model.metadata = artifact.metadata;

        tracing::info!(
            path = %shown,
            id = %model.metadata.id,
            distance = distance.name,
            loss = loss.name,
            embedding_dim = model.network.embedding_dim(),
            "loaded signature model"
        );
        Ok(model)
    }
}
