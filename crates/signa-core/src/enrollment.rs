//! One-to-many ranking of a candidate against enrolled identities.
//!
//! Scoring is pure: it consumes distances that were already computed and a
//! decision threshold, so the same code serves the CLI, the service, and
//! tests.

use crate::calibrate::DecisionThreshold;
use serde::Serialize;

/// `clamp(1 - distance / (2 * threshold), 0, 1)`.
///
/// 1.0 at distance 0, 0.5 exactly at the threshold, 0.0 at twice the threshold.
pub fn confidence(distance: f32, threshold: DecisionThreshold) -> f32 {
    (1.0 - distance / (2.0 * threshold.value())).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Closest sample is within the threshold.
    Match,
    NoMatch,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleDistance {
    pub sample: String,
    pub distance: f32,
}

/// Distance summary of one enrolled identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityScore {
    pub key: String,
    pub samples: Vec<SampleDistance>,
    pub min: f32,
    pub mean: f32,
    pub max: f32,
    pub matches: usize,
    pub match_ratio: f32,
    pub verdict: Verdict,
}

impl IdentityScore {
    /// `None` when the identity has no samples.
    pub fn new(key: impl Into<String>, samples: Vec<SampleDistance>, threshold: DecisionThreshold) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let min = samples.iter().map(|s| s.distance).fold(f32::INFINITY, f32::min);
        let max = samples.iter().map(|s| s.distance).fold(f32::NEG_INFINITY, f32::max);
        let mean = samples.iter().map(|s| s.distance).sum::<f32>() / samples.len() as f32;
        let matches = samples.iter().filter(|s| threshold.accepts(s.distance)).count();
        let match_ratio = matches as f32 / samples.len() as f32;
        let verdict = if threshold.accepts(min) {
            Verdict::Match
        } else {
            Verdict::NoMatch
        };
        Some(Self {
            key: key.into(),
            samples,
            min,
            mean,
            max,
            matches,
            match_ratio,
            verdict,
        })
    }

    pub fn total(&self) -> usize {
        self.samples.len()
    }

    pub fn confidence(&self, threshold: DecisionThreshold) -> f32 {
        confidence(self.min, threshold)
    }
}

/// Ranked outcome of matching one candidate against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrollmentMatch {
    pub threshold: f32,
    /// Key of the top-ranked identity, only when its closest sample is
    /// within the threshold.
    pub best_match: Option<String>,
    pub confidence: f32,
    pub ranking: Vec<IdentityScore>,
}

impl EnrollmentMatch {
    pub fn is_recognized(&self) -> bool {
        self.best_match.is_some()
    }
}

/// Order identities by closest sample, ascending; equal minima keep key order.
pub fn rank(mut scores: Vec<IdentityScore>, threshold: DecisionThreshold) -> EnrollmentMatch {
    scores.sort_by(|a, b| a.key.cmp(&b.key));
    scores.sort_by(|a, b| a.min.total_cmp(&b.min));

    let top = scores.first();
    let best_match = top.filter(|s| threshold.accepts(s.min)).map(|s| s.key.clone());
    let confidence = top.map(|s| s.confidence(threshold)).unwrap_or(0.0);

    EnrollmentMatch {
        threshold: threshold.value(),
        best_match,
        confidence,
        ranking: scores,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(v: f32) -> DecisionThreshold {
        DecisionThreshold::new(v).unwrap()
    }

    fn samples(distances: &[f32]) -> Vec<SampleDistance> {
        distances
            .iter()
            .enumerate()
            .map(|(i, &distance)| SampleDistance {
                sample: format!("sig{}.png", i + 1),
                distance,
            })
            .collect()
    }

    #[test]
    fn test_confidence_close_pair() {
        let c = confidence(0.03, t(0.10));
        assert!((c - 0.85).abs() < 1e-6);
    }

    #[test]
    fn test_confidence_far_pair_clamps_to_zero() {
        assert_eq!(confidence(0.25, t(0.10)), 0.0);
        assert_eq!(confidence(0.0, t(0.10)), 1.0);
        assert!((confidence(0.10, t(0.10)) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_identity_stats() {
        let s = IdentityScore::new("A", samples(&[0.05, 0.12, 0.30]), t(0.10)).unwrap();
        assert_eq!(s.min, 0.05);
        assert_eq!(s.max, 0.30);
        assert!((s.mean - 0.47 / 3.0).abs() < 1e-6);
        assert_eq!(s.matches, 1);
        assert_eq!(s.total(), 3);
        assert_eq!(s.verdict, Verdict::Match);
    }

    #[test]
    fn test_rank_picks_closest_identity() {
        let threshold = t(0.10);
        let b = IdentityScore::new("B", samples(&[0.40, 0.45]), threshold).unwrap();
        let a = IdentityScore::new("A", samples(&[0.05, 0.12, 0.30]), threshold).unwrap();
        let result = rank(vec![b, a], threshold);
        assert_eq!(result.best_match.as_deref(), Some("A"));
        assert_eq!(result.ranking[0].key, "A");
        assert_eq!(result.ranking[0].min, 0.05);
        assert_eq!(result.ranking[1].key, "B");
        assert_eq!(result.ranking[1].min, 0.40);
        assert_eq!(result.ranking[1].verdict, Verdict::NoMatch);
        assert!((result.confidence - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_not_recognized_when_all_far() {
        let threshold = t(0.10);
        let b = IdentityScore::new("B", samples(&[0.40, 0.45]), threshold).unwrap();
        let result = rank(vec![b], threshold);
        assert!(!result.is_recognized());
        assert_eq!(result.ranking.len(), 1);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_ties_keep_key_order() {
        let threshold = t(0.10);
        let z = IdentityScore::new("zeta", samples(&[0.2]), threshold).unwrap();
        let a = IdentityScore::new("alpha", samples(&[0.2]), threshold).unwrap();
        let result = rank(vec![z, a], threshold);
        assert_eq!(result.ranking[0].key, "alpha");
        assert_eq!(result.ranking[1].key, "zeta");
    }

    #[test]
    fn test_any_accepted_sample_means_match() {
        // Any sample under the threshold puts the minimum under it too
        let threshold = t(0.10);
        let s = IdentityScore::new("C", samples(&[0.11, 0.09, 0.08, 0.5]), threshold).unwrap();
        assert_eq!(s.matches, 2);
        assert_eq!(s.match_ratio, 0.5);
        assert_eq!(s.verdict, Verdict::Match);

        let s = IdentityScore::new("D", samples(&[0.11, 0.2]), threshold).unwrap();
        assert_eq!(s.matches, 0);
        assert_eq!(s.verdict, Verdict::NoMatch);
    }

    #[test]
    fn test_empty_identity_has_no_score() {
        assert!(IdentityScore::new("x", Vec::new(), t(0.1)).is_none());
    }
}
