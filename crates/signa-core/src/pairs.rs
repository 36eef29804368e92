//! Pair sampling over a labeled signature set.
//!
//! Two strategies:
//! - exhaustive: every same-identity pair, plus a capped block of
//!   cross-identity pairs per identity pair (used for evaluation and
//!   calibration batches);
//! - online: per image, one random positive and one random negative
//!   (used for per-epoch training sets).
//!
//! Identities with fewer than two images cannot contribute positives. They
//! are reported in [`SampledPairs::insufficient`] and logged, never dropped
//! silently.

use crate::types::{LabeledSet, PairLabel, PairedSample};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;

/// Default cross-identity cap for training batches.
pub const DEFAULT_NEGATIVE_CAP: usize = 2;
/// Cross-identity cap used when sampling evaluation/calibration pairs.
pub const EVALUATION_NEGATIVE_CAP: usize = 3;

/// Data-quality warning: an identity that cannot yield the pairs it should.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InsufficientPairs {
    pub identity: String,
    pub image_count: usize,
    pub reason: InsufficientReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsufficientReason {
    /// Fewer than two images: no same-identity pair exists.
    NoPositivePartner,
    /// Only one identity in the set: no different-identity pair exists.
    NoNegativePartner,
}

impl std::fmt::Display for InsufficientPairs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.reason {
            InsufficientReason::NoPositivePartner => write!(
                f,
                "identity {:?} has {} image(s); at least 2 are needed for same-identity pairs",
                self.identity, self.image_count
            ),
            InsufficientReason::NoNegativePartner => write!(
                f,
                "identity {:?} is the only identity; no different-identity pairs are possible",
                self.identity
            ),
        }
    }
}

/// Result of a sampling run.
#[derive(Debug, Clone, Default)]
pub struct SampledPairs {
    pub pairs: Vec<PairedSample>,
    pub insufficient: Vec<InsufficientPairs>,
}

impl SampledPairs {
    pub fn positives(&self) -> usize {
        self.pairs.iter().filter(|p| p.label == PairLabel::Same).count()
    }

    pub fn negatives(&self) -> usize {
        self.pairs.iter().filter(|p| p.label == PairLabel::Different).count()
    }

    pub fn labels(&self) -> Vec<PairLabel> {
        self.pairs.iter().map(|p| p.label).collect()
    }

    fn flag(&mut self, identity: &str, image_count: usize, reason: InsufficientReason) {
        let warning = InsufficientPairs {
            identity: identity.to_string(),
            image_count,
            reason,
        };
        tracing::warn!(identity, image_count, "{warning}");
        self.insufficient.push(warning);
    }
}

/// All `C(n, 2)` positives per identity, and for each unordered pair of
/// distinct identities the first `min(cap, n_i) x min(cap, n_j)` negatives.
pub fn make_exhaustive_pairs(set: &LabeledSet, negative_cap: usize) -> SampledPairs {
    let groups = set.groups();
    let mut out = SampledPairs::default();

    for (identity, indices) in &groups {
        if indices.len() < 2 {
            out.flag(identity, indices.len(), InsufficientReason::NoPositivePartner);
            continue;
        }
        for (i, &a) in indices.iter().enumerate() {
            for &b in &indices[i + 1..] {
                out.pairs.push(PairedSample {
                    first: a,
                    second: b,
                    label: PairLabel::Same,
                });
            }
        }
    }

    for (gi, (_, left)) in groups.iter().enumerate() {
        for (_, right) in &groups[gi + 1..] {
            for &a in left.iter().take(negative_cap) {
                for &b in right.iter().take(negative_cap) {
                    out.pairs.push(PairedSample {
                        first: a,
                        second: b,
                        label: PairLabel::Different,
                    });
                }
            }
        }
    }

    tracing::debug!(
        identities = groups.len(),
        positives = out.positives(),
        negatives = out.negatives(),
        negative_cap,
        "sampled exhaustive pairs"
    );
    out
}

/// One random positive and one random negative per image.
///
/// The negative is drawn by first picking a different identity uniformly,
/// then an image within it uniformly.
pub fn make_online_pairs<R: Rng + ?Sized>(set: &LabeledSet, rng: &mut R) -> SampledPairs {
    let groups = set.groups();
    let mut out = SampledPairs::default();
    let group_of: Vec<usize> = {
        let mut v = vec![0; set.len()];
        for (g, (_, indices)) in groups.iter().enumerate() {
            for &i in indices {
                v[i] = g;
            }
        }
        v
    };

    for (identity, indices) in &groups {
        if indices.len() < 2 {
            out.flag(identity, indices.len(), InsufficientReason::NoPositivePartner);
        }
        if groups.len() < 2 {
            out.flag(identity, indices.len(), InsufficientReason::NoNegativePartner);
        }
    }

    for anchor in 0..set.len() {
        let g = group_of[anchor];
        let own = &groups[g].1;

        let partners: Vec<usize> = own.iter().copied().filter(|&i| i != anchor).collect();
        if let Some(&partner) = partners.choose(rng) {
            out.pairs.push(PairedSample {
                first: anchor,
                second: partner,
                label: PairLabel::Same,
            });
        }

        let others: Vec<usize> = (0..groups.len()).filter(|&o| o != g).collect();
        if let Some(&other) = others.choose(rng) {
            if let Some(&negative) = groups[other].1.choose(rng) {
                out.pairs.push(PairedSample {
                    first: anchor,
                    second: negative,
                    label: PairLabel::Different,
                });
            }
        }
    }

    tracing::debug!(
        images = set.len(),
        positives = out.positives(),
        negatives = out.negatives(),
        "sampled online pairs"
    );
    out
}

/// Positive/negative pair counts the exhaustive sampler would produce for
/// the given per-identity image counts, without touching any images.
pub fn exhaustive_pair_counts(counts: &[usize], negative_cap: usize) -> (usize, usize) {
    let positives = counts.iter().map(|&n| n * n.saturating_sub(1) / 2).sum();
    let mut negatives = 0;
    for (i, &a) in counts.iter().enumerate() {
        for &b in &counts[i + 1..] {
            negatives += a.min(negative_cap) * b.min(negative_cap);
        }
    }
    (positives, negatives)
}

/// Shuffle pairs in place (used between epochs).
pub fn shuffle_pairs<R: Rng + ?Sized>(pairs: &mut [PairedSample], rng: &mut R) {
    pairs.shuffle(rng);
}
