//! signa-core — Signature similarity engine.
//!
//! Normalizes signature scans into canonical binary tensors, embeds them
//! with a twin-tower convolutional network, and compares embeddings by
//! Euclidean distance. Also hosts the offline side: pair sampling,
//! contrastive training and decision-threshold calibration.

pub mod artifact;
pub mod calibrate;
pub mod enrollment;
pub mod network;
pub mod pairs;
pub mod preprocess;
pub mod registry;
pub mod siamese;
pub mod train;
pub mod types;

pub use calibrate::{Calibration, DecisionThreshold, ThresholdGrid};
pub use enrollment::{EnrollmentMatch, IdentityScore, Verdict};
pub use network::NetworkConfig;
pub use pairs::{InsufficientPairs, SampledPairs};
pub use preprocess::{Binarization, CaptureProfile, NormalizeOptions};
pub use registry::OperatorRegistry;
pub use siamese::{ModelError, SiameseModel};
pub use train::{TrainConfig, TrainError, TrainingReport, TrainingSummary};
pub use types::{Embedding, LabeledSet, NormalizedImage, PairLabel, PairedSample};
