//! signa-service — Verification front end over the signature model.
//!
//! Loads configuration, the trained model and the calibrated threshold
//! once, scans identity directories into labeled sets or enrollment
//! galleries, and answers one-to-one and one-to-many verification requests.

pub mod config;
pub mod dataset;
pub mod gallery;
pub mod service;

pub use config::{Config, ConfigError};
pub use dataset::{DatasetError, DatasetReport, LoadedSet};
pub use gallery::Gallery;
pub use service::{ServiceError, ThresholdSource, Verification, VerificationService};
