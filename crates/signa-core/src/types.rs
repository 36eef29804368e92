use ndarray::{Array2, Array3, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical normalized image height in pixels.
pub const CANONICAL_HEIGHT: usize = 155;
/// Canonical normalized image width in pixels.
pub const CANONICAL_WIDTH: usize = 220;
/// Lower bound applied to the squared distance before the square root.
pub const DISTANCE_EPSILON: f32 = 1e-7;

#[derive(Error, Debug, PartialEq)]
pub enum ImageValueError {
    #[error("pixel buffer has {actual} values, expected {expected} for {height}x{width}")]
    Length {
        expected: usize,
        actual: usize,
        height: usize,
        width: usize,
    },
    #[error("pixel value {value} at index {index} is outside [0, 1]")]
    OutOfRange { index: usize, value: f32 },
}

/// Single-channel signature tensor with values in [0, 1], ink high.
///
/// Produced by [`crate::preprocess::normalize`]; the pipeline always emits
/// `CANONICAL_HEIGHT x CANONICAL_WIDTH`. Smaller shapes are only built by
/// callers that construct a model for a matching input shape.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedImage {
    pixels: Array2<f32>,
}

impl NormalizedImage {
    /// Build from row-major pixels, validating length and value range.
    pub fn from_pixels(height: usize, width: usize, data: Vec<f32>) -> Result<Self, ImageValueError> {
        if data.len() != height * width {
            return Err(ImageValueError::Length {
                expected: height * width,
                actual: data.len(),
                height,
                width,
            });
        }
        if let Some((index, &value)) = data
            .iter()
            .enumerate()
            .find(|(_, v)| !(0.0..=1.0).contains(*v))
        {
            return Err(ImageValueError::OutOfRange { index, value });
        }
        let pixels = Array2::from_shape_vec((height, width), data).map_err(|_| ImageValueError::Length {
            expected: height * width,
            actual: 0,
            height,
            width,
        })?;
        Ok(Self { pixels })
    }

    /// All-zero image of the given size (no ink).
    pub fn blank(height: usize, width: usize) -> Self {
        Self {
            pixels: Array2::zeros((height, width)),
        }
    }

    pub(crate) fn from_array(pixels: Array2<f32>) -> Self {
        Self { pixels }
    }

    pub fn height(&self) -> usize {
        self.pixels.nrows()
    }

    pub fn width(&self) -> usize {
        self.pixels.ncols()
    }

    /// Shape as (height, width, channels).
    pub fn shape(&self) -> [usize; 3] {
        [self.height(), self.width(), 1]
    }

    pub fn pixels(&self) -> ArrayView2<'_, f32> {
        self.pixels.view()
    }

    /// Owned HWC tensor with the trailing channel axis.
    pub fn to_hwc(&self) -> Array3<f32> {
        self.pixels.clone().insert_axis(ndarray::Axis(2))
    }

    /// Owned CHW tensor (one channel) as consumed by the embedding network.
    pub fn to_chw(&self) -> Array3<f32> {
        self.pixels.clone().insert_axis(ndarray::Axis(0))
    }
}

/// Signature embedding vector (64 or 128 dimensions depending on the network variant).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance with the squared sum floored at [`DISTANCE_EPSILON`].
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        floored_euclidean(&self.values, &other.values)
    }
}

/// `sqrt(max(sum((a - b)^2), eps))`.
pub fn floored_euclidean(a: &[f32], b: &[f32]) -> f32 {
    let sum: f32 = a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum();
    sum.max(DISTANCE_EPSILON).sqrt()
}

#[derive(Error, Debug, PartialEq)]
pub enum PairLabelError {
    #[error("label value {0} is not a valid 0/1 flag")]
    InvalidFlag(i64),
}

/// Ground truth for a pair of signatures.
///
/// This enum is the only label representation inside the crate. Numeric
/// encodings from outside go through the `from_*_flag` adapters, and the
/// loss target is only ever derived from [`PairLabel::loss_target`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairLabel {
    Same,
    Different,
}

impl PairLabel {
    /// Encoding where `0 = same identity`, `1 = different identity`.
    pub fn from_dissimilarity_flag(flag: i64) -> Result<Self, PairLabelError> {
        match flag {
            0 => Ok(Self::Same),
            1 => Ok(Self::Different),
            other => Err(PairLabelError::InvalidFlag(other)),
        }
    }

    /// Encoding where `1 = same identity`, `0 = different identity`.
    pub fn from_match_flag(flag: i64) -> Result<Self, PairLabelError> {
        match flag {
            1 => Ok(Self::Same),
            0 => Ok(Self::Different),
            other => Err(PairLabelError::InvalidFlag(other)),
        }
    }

    pub fn to_dissimilarity_flag(self) -> u8 {
        match self {
            Self::Same => 0,
            Self::Different => 1,
        }
    }

    pub fn to_match_flag(self) -> u8 {
        1 - self.to_dissimilarity_flag()
    }

    /// Contrastive loss target: 0.0 pulls together, 1.0 pushes apart.
    pub fn loss_target(self) -> f32 {
        match self {
            Self::Same => 0.0,
            Self::Different => 1.0,
        }
    }

    pub fn is_same(self) -> bool {
        self == Self::Same
    }
}

/// A pair of samples drawn from a [`LabeledSet`], referenced by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairedSample {
    pub first: usize,
    pub second: usize,
    pub label: PairLabel,
}

/// One normalized image tagged with the identity it was enrolled under.
#[derive(Debug, Clone)]
pub struct LabeledSample {
    pub image: NormalizedImage,
    pub identity: String,
}

/// Ordered collection of labeled signature images.
#[derive(Debug, Clone, Default)]
pub struct LabeledSet {
    samples: Vec<LabeledSample>,
}

impl LabeledSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, image: NormalizedImage, identity: impl Into<String>) {
        self.samples.push(LabeledSample {
            image,
            identity: identity.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[LabeledSample] {
        &self.samples
    }

    pub fn image(&self, index: usize) -> &NormalizedImage {
        &self.samples[index].image
    }

    pub fn identity(&self, index: usize) -> &str {
        &self.samples[index].identity
    }

    /// Sample indices grouped by identity, in first-appearance order.
    pub fn groups(&self) -> Vec<(String, Vec<usize>)> {
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (i, sample) in self.samples.iter().enumerate() {
            match groups.iter_mut().find(|(key, _)| *key == sample.identity) {
                Some((_, indices)) => indices.push(i),
                None => groups.push((sample.identity.clone(), vec![i])),
            }
        }
        groups
    }

    /// Resolve a pair into its two images.
    pub fn resolve(&self, pair: &PairedSample) -> (&NormalizedImage, &NormalizedImage) {
        (self.image(pair.first), self.image(pair.second))
    }
}

impl FromIterator<(NormalizedImage, String)> for LabeledSet {
    fn from_iter<I: IntoIterator<Item = (NormalizedImage, String)>>(iter: I) -> Self {
        let mut set = LabeledSet::new();
        for (image, identity) in iter {
            set.push(image, identity);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_symmetric() {
        let a = Embedding { values: vec![0.3, 1.2, -0.5, 4.0] };
        let b = Embedding { values: vec![1.0, 0.1, 0.7, 2.5] };
        assert!((a.euclidean_distance(&b) - b.euclidean_distance(&a)).abs() < 1e-6);
    }

    #[test]
    fn test_distance_identity_floor() {
        let a = Embedding { values: vec![0.25, 0.5, 0.75] };
        let d = a.euclidean_distance(&a);
        assert!((d - DISTANCE_EPSILON.sqrt()).abs() < 1e-9);
        assert!(d > 0.0);
    }

    #[test]
    fn test_distance_known_value() {
        let a = Embedding { values: vec![0.0, 0.0] };
        let b = Embedding { values: vec![3.0, 4.0] };
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_label_adapters_agree() {
        assert_eq!(PairLabel::from_dissimilarity_flag(0), Ok(PairLabel::Same));
        assert_eq!(PairLabel::from_match_flag(1), Ok(PairLabel::Same));
        assert_eq!(PairLabel::from_dissimilarity_flag(1), Ok(PairLabel::Different));
        assert_eq!(PairLabel::from_match_flag(0), Ok(PairLabel::Different));
        assert_eq!(PairLabel::Same.to_match_flag(), 1);
        assert_eq!(PairLabel::Same.to_dissimilarity_flag(), 0);
    }

    #[test]
    fn test_label_adapter_rejects_other_values() {
        assert_eq!(
            PairLabel::from_match_flag(2),
            Err(PairLabelError::InvalidFlag(2))
        );
        assert!(PairLabel::from_dissimilarity_flag(-1).is_err());
    }

    #[test]
    fn test_loss_target() {
        assert_eq!(PairLabel::Same.loss_target(), 0.0);
        assert_eq!(PairLabel::Different.loss_target(), 1.0);
    }

    #[test]
    fn test_from_pixels_validates_range() {
        let err = NormalizedImage::from_pixels(1, 2, vec![0.5, 1.5]).unwrap_err();
        assert_eq!(err, ImageValueError::OutOfRange { index: 1, value: 1.5 });
        assert!(NormalizedImage::from_pixels(2, 2, vec![0.0; 3]).is_err());
    }

    #[test]
    fn test_normalized_image_shapes() {
        let img = NormalizedImage::blank(CANONICAL_HEIGHT, CANONICAL_WIDTH);
        assert_eq!(img.shape(), [155, 220, 1]);
        assert_eq!(img.to_hwc().shape(), &[155, 220, 1]);
        assert_eq!(img.to_chw().shape(), &[1, 155, 220]);
    }

    #[test]
    fn test_groups_first_appearance_order() {
        let mut set = LabeledSet::new();
        for id in ["bob", "alice", "bob", "carol", "alice"] {
            set.push(NormalizedImage::blank(2, 2), id);
        }
        let groups = set.groups();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0], ("bob".to_string(), vec![0, 2]));
        assert_eq!(groups[1], ("alice".to_string(), vec![1, 4]));
        assert_eq!(groups[2], ("carol".to_string(), vec![3]));
    }
}
