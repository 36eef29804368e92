//! Verification service: the model and threshold loaded once, then read-only.

use crate::config::Config;
use crate::dataset::DatasetError;
use crate::gallery::Gallery;
use image::DynamicImage;
use serde::Serialize;
use signa_core::calibrate::CalibrationError;
use signa_core::enrollment::{self, confidence, IdentityScore, SampleDistance};
use signa_core::preprocess::{decode_image, load_image, normalize, PreprocessError};
use signa_core::{
    DecisionThreshold, EnrollmentMatch, ModelError, NormalizeOptions, NormalizedImage, OperatorRegistry, SiameseModel,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Historical default for scanned documents. Never applied implicitly.
pub const SCAN_LEGACY_THRESHOLD: f32 = 0.5;
/// Historical default for phone photos. Never applied implicitly.
pub const PHONE_CALIBRATED_THRESHOLD: f32 = 0.10;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("image error: {0}")]
    Preprocess(#[from] PreprocessError),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("threshold error: {0}")]
    Calibration(#[from] CalibrationError),
    #[error("dataset error: {0}")]
    Dataset(#[from] DatasetError),
    #[error("no enrolled signatures{}", restriction_suffix(.restricted_to))]
    NoEnrollmentData { restricted_to: Option<String> },
    #[error(
        "no decision threshold: {path} does not exist and no fallback is configured \
         (run `signa calibrate` or set SIGNA_FALLBACK_THRESHOLD)"
    )]
    ThresholdUnavailable { path: String },
}

fn restriction_suffix(restricted_to: &Option<String>) -> String {
    match restricted_to {
        Some(key) => format!(" for identity {key:?}"),
        None => String::new(),
    }
}

/// Where the active decision threshold came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThresholdSource {
    Calibrated { path: PathBuf },
    Fallback,
}

/// Outcome of a one-to-one comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Verification {
    pub is_match: bool,
    pub distance: f32,
    pub threshold_used: f32,
    pub confidence: f32,
}

impl Verification {
    pub fn from_distance(distance: f32, threshold: DecisionThreshold) -> Self {
        Self {
            is_match: threshold.accepts(distance),
            distance,
            threshold_used: threshold.value(),
            confidence: confidence(distance, threshold),
        }
    }
}

/// Resolve the decision threshold: calibrated file first, then the
/// configured fallback.
pub fn resolve_threshold(config: &Config) -> Result<(DecisionThreshold, ThresholdSource), ServiceError> {
    if let Some(t) = DecisionThreshold::load(&config.threshold_path)? {
        tracing::info!(path = %config.threshold_path.display(), threshold = t.value(), "calibrated threshold loaded");
        return Ok((
            t,
            ThresholdSource::Calibrated {
                path: config.threshold_path.clone(),
            },
        ));
    }
    match config.fallback_threshold {
        Some(value) => {
            let t = DecisionThreshold::new(value)?;
            tracing::warn!(
                path = %config.threshold_path.display(),
                threshold = t.value(),
                "no calibrated threshold file; using configured fallback"
            );
            Ok((t, ThresholdSource::Fallback))
        }
        None => Err(ServiceError::ThresholdUnavailable {
            path: config.threshold_path.display().to_string(),
        }),
    }
}

/// Shared, immutable verification state. Cloning shares the model.
#[derive(Debug, Clone)]
pub struct VerificationService {
    model: Arc<SiameseModel>,
    threshold: DecisionThreshold,
    source: ThresholdSource,
    options: NormalizeOptions,
}

impl VerificationService {
    /// Load model and threshold. Fails fast if either is unavailable.
    pub fn open(config: &Config, registry: &OperatorRegistry) -> Result<Self, ServiceError> {
        let model = SiameseModel::load(&config.model_path, registry)?;
        let (threshold, source) = resolve_threshold(config)?;
        let service = Self::from_parts(model, threshold, source, config.normalize_options());
        tracing::info!(
            model = %config.model_path.display(),
            threshold = threshold.value(),
            profile = ?service.options.profile,
            "verification service ready"
        );
        Ok(service)
    }

    /// Normalizer output shape is pinned to the model's input shape.
    pub fn from_parts(
        model: SiameseModel,
        threshold: DecisionThreshold,
        source: ThresholdSource,
        options: NormalizeOptions,
    ) -> Self {
        let [height, width, _] = model.input_shape();
        Self {
            model: Arc::new(model),
            threshold,
            source,
            options: NormalizeOptions {
                height,
                width,
                ..options
            },
        }
    }

    pub fn model(&self) -> &SiameseModel {
        &self.model
    }

    pub fn threshold(&self) -> DecisionThreshold {
        self.threshold
    }

    pub fn threshold_source(&self) -> &ThresholdSource {
        &self.source
    }

    pub fn options(&self) -> &NormalizeOptions {
        &self.options
    }

    pub fn normalize(&self, image: &DynamicImage) -> NormalizedImage {
        normalize(image, &self.options)
    }

    pub fn verify_normalized(&self, a: &NormalizedImage, b: &NormalizedImage) -> Result<Verification, ServiceError> {
        let distance = self.model.compare(a, b)?;
        let result = Verification::from_distance(distance, self.threshold);
        tracing::debug!(distance, is_match = result.is_match, "verified pair");
        Ok(result)
    }

    pub fn verify(&self, a: &DynamicImage, b: &DynamicImage) -> Result<Verification, ServiceError> {
        self.verify_normalized(&self.normalize(a), &self.normalize(b))
    }

    pub fn verify_files(&self, a: &Path, b: &Path) -> Result<Verification, ServiceError> {
        self.verify(&load_image(a)?, &load_image(b)?)
    }

    pub fn verify_bytes(&self, a: &[u8], b: &[u8]) -> Result<Verification, ServiceError> {
        self.verify(&decode_image(a)?, &decode_image(b)?)
    }

    /// Embed the configured enrollment directory with this service's model.
    pub fn load_gallery(&self, root: &Path) -> Result<Gallery, ServiceError> {
        Gallery::load(root, &self.model, &self.options)
    }

    /// Rank every enrolled identity (or only `restrict_to`) against `candidate`.
    pub fn match_enrolled(
        &self,
        candidate: &DynamicImage,
        gallery: &Gallery,
        restrict_to: Option<&str>,
    ) -> Result<EnrollmentMatch, ServiceError> {
        let no_data = || ServiceError::NoEnrollmentData {
            restricted_to: restrict_to.map(str::to_string),
        };
        let identities: Vec<_> = match restrict_to {
            Some(key) => gallery.get(key).into_iter().collect(),
            None => gallery.identities().iter().collect(),
        };
        if identities.is_empty() {
            return Err(no_data());
        }

        let query = self.model.embed(&self.normalize(candidate))?;
        let scores: Vec<IdentityScore> = identities
            .into_iter()
            .filter_map(|identity| {
                let samples = identity
                    .samples
                    .iter()
                    .map(|s| SampleDistance {
                        sample: s.file_name.clone(),
                        distance: self.model.distance_between(&query, &s.embedding),
                    })
                    .collect();
                IdentityScore::new(identity.key.clone(), samples, self.threshold)
            })
            .collect();
        if scores.is_empty() {
            return Err(no_data());
        }

        let result = enrollment::rank(scores, self.threshold);
        tracing::info!(
            best_match = result.best_match.as_deref().unwrap_or("-"),
            confidence = result.confidence,
            candidates = result.ranking.len(),
            "enrollment match"
        );
        Ok(result)
    }

    pub fn match_enrolled_file(
        &self,
        candidate: &Path,
        gallery: &Gallery,
        restrict_to: Option<&str>,
    ) -> Result<EnrollmentMatch, ServiceError> {
        self.match_enrolled(&load_image(candidate)?, gallery, restrict_to)
    }
}
