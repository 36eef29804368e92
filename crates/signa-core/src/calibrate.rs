//! Decision-threshold calibration.
//!
//! Sweeps candidate thresholds over a set of labeled pair distances and
//! keeps the one with the best F1 for the `Same` class. The chosen value is
//! persisted as a one-line text file read by the verification service.

use crate::types::PairLabel;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("no distances to calibrate on")]
    Empty,
    #[error("{distances} distances but {labels} labels")]
    LengthMismatch { distances: usize, labels: usize },
    #[error("threshold grid {start}..={stop} step {step} has no candidates")]
    EmptyGrid { start: f32, stop: f32, step: f32 },
    #[error("distance at index {index} is not finite ({value})")]
    NonFinite { index: usize, value: f32 },
    #[error("cannot access threshold file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("threshold file {path} does not hold a number: {content:?}")]
    Parse { path: String, content: String },
    #[error("threshold {0} must be finite and positive at 4 decimals")]
    InvalidThreshold(f32),
}

fn round4(v: f32) -> f32 {
    ((v as f64 * 10_000.0).round() / 10_000.0) as f32
}

/// Inclusive, evenly spaced list of candidate thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThresholdGrid {
    pub start: f32,
    pub stop: f32,
    pub step: f32,
}

impl Default for ThresholdGrid {
    fn default() -> Self {
        Self {
            start: 0.05,
            stop: 0.95,
            step: 0.05,
        }
    }
}

impl ThresholdGrid {
    /// Candidate values, generated by index and rounded to 4 decimals.
    pub fn values(&self) -> Vec<f32> {
        if !(self.step > 0.0) || !self.start.is_finite() || !self.stop.is_finite() || self.stop < self.start {
            return Vec::new();
        }
        let (start, step) = (self.start as f64, self.step as f64);
        let count = ((self.stop as f64 - start) / step + 1e-6).floor() as usize + 1;
        (0..count).map(|i| round4((start + i as f64 * step) as f32)).collect()
    }
}

/// Scalar distance cut-off: `distance <= value` means same signer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DecisionThreshold(f32);

impl DecisionThreshold {
    /// Rounds to the 4 decimals the threshold file keeps; the rounded
    /// value must still be positive.
    pub fn new(value: f32) -> Result<Self, CalibrationError> {
        if !value.is_finite() {
            return Err(CalibrationError::InvalidThreshold(value));
        }
        let rounded = round4(value);
        if rounded <= 0.0 {
            return Err(CalibrationError::InvalidThreshold(value));
        }
        Ok(Self(rounded))
    }

    pub fn value(self) -> f32 {
        self.0
    }

    pub fn accepts(self, distance: f32) -> bool {
        distance <= self.0
    }

    pub fn save(self, path: &Path) -> Result<(), CalibrationError> {
        let io_err = |source| CalibrationError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(path, format!("{:.4}\n", self.0)).map_err(io_err)?;
        tracing::info!(path = %path.display(), threshold = self.0, "saved decision threshold");
        Ok(())
    }

    /// Read a threshold file; `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, CalibrationError> {
        let display = path.display().to_string();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CalibrationError::Io { path: display, source }),
        };
        let trimmed = text.trim();
        let value: f32 = trimmed.parse().map_err(|_| CalibrationError::Parse {
            path: display.clone(),
            content: trimmed.to_string(),
        })?;
        Self::new(value).map(Some)
    }
}

impl std::fmt::Display for DecisionThreshold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

/// Confusion-derived scores at one candidate threshold (positive = Same).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThresholdMetrics {
    pub threshold: f32,
    pub accuracy: f32,
    pub precision: f32,
    pub recall: f32,
    pub f1: f32,
}

fn ratio(num: usize, den: usize) -> f32 {
    if den == 0 {
        0.0
    } else {
        num as f32 / den as f32
    }
}

impl ThresholdMetrics {
    pub fn at(threshold: f32, distances: &[f32], labels: &[PairLabel]) -> Self {
        let (mut tp, mut fp, mut tn, mut fn_) = (0usize, 0usize, 0usize, 0usize);
        for (&d, &label) in distances.iter().zip(labels) {
            match (d <= threshold, label.is_same()) {
                (true, true) => tp += 1,
                (true, false) => fp += 1,
                (false, false) => tn += 1,
                (false, true) => fn_ += 1,
            }
        }
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self {
            threshold,
            accuracy: ratio(tp + tn, distances.len()),
            precision,
            recall,
            f1,
        }
    }
}

/// Mean and standard deviation of one class's distances.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DistanceStats {
    pub count: usize,
    pub mean: f32,
    pub std: f32,
}

impl DistanceStats {
    fn of(values: impl Iterator<Item = f32> + Clone) -> Self {
        let count = values.clone().count();
        if count == 0 {
            return Self {
                count,
                mean: 0.0,
                std: 0.0,
            };
        }
        let mean = values.clone().map(f64::from).sum::<f64>() / count as f64;
        let var = values.map(|v| (f64::from(v) - mean).powi(2)).sum::<f64>() / count as f64;
        Self {
            count,
            mean: mean as f32,
            std: var.sqrt() as f32,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Calibration {
    pub threshold: DecisionThreshold,
    pub best: ThresholdMetrics,
    pub sweep: Vec<ThresholdMetrics>,
    pub same: DistanceStats,
    pub different: DistanceStats,
}

impl Calibration {
    /// The `n` best candidates by F1; equal scores keep grid order.
    pub fn top(&self, n: usize) -> Vec<ThresholdMetrics> {
        let mut ranked = self.sweep.clone();
        ranked.sort_by(|a, b| b.f1.total_cmp(&a.f1));
        ranked.truncate(n);
        ranked
    }
}

/// Pick the grid threshold with the highest F1 (first one on ties).
pub fn calibrate(distances: &[f32], labels: &[PairLabel], grid: &ThresholdGrid) -> Result<Calibration, CalibrationError> {
    if distances.len() != labels.len() {
        return Err(CalibrationError::LengthMismatch {
            distances: distances.len(),
            labels: labels.len(),
        });
    }
    if distances.is_empty() {
        return Err(CalibrationError::Empty);
    }
    if let Some((index, &value)) = distances.iter().enumerate().find(|(_, d)| !d.is_finite()) {
        return Err(CalibrationError::NonFinite { index, value });
    }
    let candidates = grid.values();
    if candidates.is_empty() {
        return Err(CalibrationError::EmptyGrid {
            start: grid.start,
            stop: grid.stop,
            step: grid.step,
        });
    }

    let sweep: Vec<ThresholdMetrics> = candidates
        .iter()
        .map(|&t| ThresholdMetrics::at(t, distances, labels))
        .collect();
    let mut best = sweep[0];
    for m in &sweep[1..] {
        if m.f1 > best.f1 {
            best = *m;
        }
    }

    let paired = || distances.iter().zip(labels);
    let same = DistanceStats::of(paired().filter(|(_, l)| l.is_same()).map(|(&d, _)| d));
    let different = DistanceStats::of(paired().filter(|(_, l)| !l.is_same()).map(|(&d, _)| d));

    tracing::info!(
        threshold = best.threshold,
        f1 = best.f1,
        accuracy = best.accuracy,
        precision = best.precision,
        recall = best.recall,
        same_mean = same.mean,
        different_mean = different.mean,
        "calibrated decision threshold"
    );

    Ok(Calibration {
        threshold: DecisionThreshold::new(best.threshold)?,
        best,
        sweep,
        same,
        different,
    })
}
