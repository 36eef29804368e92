//! Signature image normalization.
//!
//! Maps an arbitrary raster into the canonical 155x220 single-channel
//! tensor: grayscale, optional phone-capture cleanup (3x3 median blur and
//! histogram equalization), inverted binarization so ink is high, area
//! resize straight to the target size, then scaling into [0, 1].

use crate::types::{NormalizedImage, CANONICAL_HEIGHT, CANONICAL_WIDTH};
use image::{DynamicImage, GrayImage, Luma};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Image file extensions accepted for enrollment and datasets.
pub const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

const INK: u8 = 255;
const PAPER: u8 = 0;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("cannot read image {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot decode image {origin}: {source}")]
    Decode {
        origin: String,
        #[source]
        source: image::ImageError,
    },
    #[error("image {origin} is empty (0x0)")]
    Empty { origin: String },
}

/// How the source was captured; phone photos get denoising and contrast stretch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureProfile {
    #[default]
    Scan,
    Phone,
}

/// Foreground/background separation strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binarization {
    /// Threshold chosen per image by Otsu's method.
    #[default]
    Otsu,
    /// Caller-supplied threshold; pixels above it are background.
    Fixed(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeOptions {
    pub profile: CaptureProfile,
    pub binarization: Binarization,
    pub height: usize,
    pub width: usize,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            profile: CaptureProfile::Scan,
            binarization: Binarization::Otsu,
            height: CANONICAL_HEIGHT,
            width: CANONICAL_WIDTH,
        }
    }
}

impl NormalizeOptions {
    pub fn phone() -> Self {
        Self {
            profile: CaptureProfile::Phone,
            ..Self::default()
        }
    }
}

/// Read and decode an image file.
pub fn load_image(path: &Path) -> Result<DynamicImage, PreprocessError> {
    let bytes = std::fs::read(path).map_err(|source| PreprocessError::Io {
        path: path.display().to_string(),
        source,
    })?;
    decode(&bytes, &path.display().to_string())
}

/// Decode an in-memory encoded image (PNG, JPEG, BMP, ...).
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, PreprocessError> {
    decode(bytes, "<memory>")
}

fn decode(bytes: &[u8], origin: &str) -> Result<DynamicImage, PreprocessError> {
    let image = image::load_from_memory(bytes).map_err(|source| PreprocessError::Decode {
        origin: origin.to_string(),
        source,
    })?;
    if image.width() == 0 || image.height() == 0 {
        return Err(PreprocessError::Empty {
            origin: origin.to_string(),
        });
    }
    Ok(image)
}

/// Decode and normalize an image file.
pub fn normalize_file(path: &Path, options: &NormalizeOptions) -> Result<NormalizedImage, PreprocessError> {
    let image = load_image(path)?;
    Ok(normalize(&image, options))
}

/// Decode and normalize an in-memory encoded image.
pub fn normalize_bytes(bytes: &[u8], options: &NormalizeOptions) -> Result<NormalizedImage, PreprocessError> {
    let image = decode_image(bytes)?;
    Ok(normalize(&image, options))
}

/// Normalize a decoded image into the canonical tensor.
pub fn normalize(image: &DynamicImage, options: &NormalizeOptions) -> NormalizedImage {
    normalize_with_threshold(image, options).0
}

/// Normalize and also report the binarization threshold that was applied.
pub fn normalize_with_threshold(image: &DynamicImage, options: &NormalizeOptions) -> (NormalizedImage, u8) {
    let mut gray = to_gray(image);

    if options.profile == CaptureProfile::Phone {
        gray = median_blur_3x3(&gray);
        equalize_histogram(&mut gray);
    }

    let threshold = match options.binarization {
        Binarization::Otsu => otsu_threshold(&gray),
        Binarization::Fixed(t) => t,
    };
    let binary = binarize_inverted(&gray, threshold);

    let resized = resize_area(&binary, options.width, options.height);
    let pixels = resized.mapv(|v| (v / 255.0).clamp(0.0, 1.0));

    tracing::debug!(
        src_width = image.width(),
        src_height = image.height(),
        threshold,
        profile = ?options.profile,
        "normalized signature image"
    );

    (NormalizedImage::from_array(pixels), threshold)
}

/// Grayscale with BT.601 luma weights (0.299, 0.587, 0.114); alpha is ignored.
///
/// Images without color channels convert directly.
pub fn to_gray(image: &DynamicImage) -> GrayImage {
    if !image.color().has_color() {
        return image.to_luma8();
    }
    let rgb = image.to_rgb8();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let luma = 0.299 * f32::from(r) + 0.587 * f32::from(g) + 0.114 * f32::from(b);
        Luma([luma.round().clamp(0.0, 255.0) as u8])
    })
}

/// Otsu's threshold: the level maximizing between-class variance.
///
/// Pixels `<= t` form one class and pixels `> t` the other. Uniform images
/// have no valid split and return 0.
pub fn otsu_threshold(gray: &GrayImage) -> u8 {
    let mut hist = [0u64; 256];
    for p in gray.pixels() {
        hist[p.0[0] as usize] += 1;
    }
    let total: u64 = hist.iter().sum();
    if total == 0 {
        return 0;
    }
    let total_sum: f64 = hist.iter().enumerate().map(|(i, &c)| i as f64 * c as f64).sum();

    let mut best_t = 0u8;
    let mut best_var = -1.0f64;
    let mut w0 = 0u64;
    let mut sum0 = 0.0f64;

    for t in 0..256usize {
        w0 += hist[t];
        sum0 += t as f64 * hist[t] as f64;
        let w1 = total - w0;
        if w0 == 0 || w1 == 0 {
            continue;
        }
        let m0 = sum0 / w0 as f64;
        let m1 = (total_sum - sum0) / w1 as f64;
        let var = w0 as f64 * w1 as f64 * (m0 - m1).powi(2);
        if var > best_var {
            best_var = var;
            best_t = t as u8;
        }
    }

    best_t
}

/// Inverted binary threshold: `v > t` becomes paper (0), everything else ink (255).
pub fn binarize_inverted(gray: &GrayImage, threshold: u8) -> GrayImage {
    let mut out = gray.clone();
    for p in out.pixels_mut() {
        p.0[0] = if p.0[0] > threshold { PAPER } else { INK };
    }
    out
}

/// 3x3 median filter with replicated borders.
pub fn median_blur_3x3(gray: &GrayImage) -> GrayImage {
    let (w, h) = gray.dimensions();
    let mut out = GrayImage::new(w, h);
    if w == 0 || h == 0 {
        return out;
    }
    let at = |x: i64, y: i64| -> u8 {
        let cx = x.clamp(0, w as i64 - 1) as u32;
        let cy = y.clamp(0, h as i64 - 1) as u32;
        gray.get_pixel(cx, cy).0[0]
    };

    let mut window = [0u8; 9];
    for y in 0..h as i64 {
        for x in 0..w as i64 {
            let mut k = 0;
            for dy in -1..=1 {
                for dx in -1..=1 {
                    window[k] = at(x + dx, y + dy);
                    k += 1;
                }
            }
            window.sort_unstable();
            out.put_pixel(x as u32, y as u32, Luma([window[4]]));
        }
    }
    out
}

/// Global histogram equalization in-place.
///
/// `lut[v] = round((cdf[v] - cdf_min) * 255 / (N - cdf_min))`; an image with a
/// single intensity is left unchanged.
pub fn equalize_histogram(gray: &mut GrayImage) {
    let mut hist = [0u64; 256];
    for p in gray.pixels() {
        hist[p.0[0] as usize] += 1;
    }
    let total: u64 = hist.iter().sum();
    let Some(first) = hist.iter().position(|&c| c > 0) else {
        return;
    };
    let cdf_min = hist[first];
    if cdf_min == total {
        return;
    }

    let scale = 255.0 / (total - cdf_min) as f64;
    let mut lut = [0u8; 256];
    let mut cdf = 0u64;
    for v in 0..256 {
        cdf += hist[v];
        if v > first {
            lut[v] = ((cdf - cdf_min) as f64 * scale).round().clamp(0.0, 255.0) as u8;
        }
    }

    for p in gray.pixels_mut() {
        p.0[0] = lut[p.0[0] as usize];
    }
}

/// Area-averaging resize to exactly `width x height` (aspect ratio not kept).
///
/// Every output pixel is the coverage-weighted mean of the source
/// rectangle it maps onto, so a binary input yields fractional edges.
pub fn resize_area(gray: &GrayImage, width: usize, height: usize) -> Array2<f32> {
    let (sw, sh) = (gray.width() as usize, gray.height() as usize);
    let mut out = Array2::<f32>::zeros((height, width));
    if sw == 0 || sh == 0 || width == 0 || height == 0 {
        return out;
    }

    let wx = area_weights(sw, width);
    let wy = area_weights(sh, height);
    let raw = gray.as_raw();

    // Horizontal pass: sh x width
    let mut rows = vec![0.0f32; sh * width];
    for y in 0..sh {
        let src = &raw[y * sw..(y + 1) * sw];
        for (x, taps) in wx.iter().enumerate() {
            rows[y * width + x] = taps.iter().map(|&(i, w)| src[i] as f32 * w).sum();
        }
    }

    // Vertical pass
    for (y, taps) in wy.iter().enumerate() {
        for x in 0..width {
            out[[y, x]] = taps.iter().map(|&(i, w)| rows[i * width + x] * w).sum();
        }
    }

    out
}

/// Per-output-index source taps `(index, weight)`, weights summing to 1.
fn area_weights(src: usize, dst: usize) -> Vec<Vec<(usize, f32)>> {
    let scale = src as f64 / dst as f64;
    (0..dst)
        .map(|d| {
            let start = d as f64 * scale;
            let end = ((d + 1) as f64 * scale).min(src as f64);
            let mut taps = Vec::new();
            let mut s = start.floor() as usize;
            while (s as f64) < end && s < src {
                let lo = start.max(s as f64);
                let hi = end.min((s + 1) as f64);
                let cover = hi - lo;
                if cover > 1e-9 {
                    taps.push((s, (cover / (end - start)) as f32));
                }
                s += 1;
            }
            taps
        })
        .collect()
}

/// Whether a path has one of the accepted image extensions (case-insensitive).
pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let lower = e.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&lower.as_str())
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn bimodal(width: u32, height: u32) -> GrayImage {
        // Dark stroke band across the middle of light paper
        GrayImage::from_fn(width, height, |x, y| {
            if y >= height / 3 && y < 2 * height / 3 && x % 7 != 0 {
                Luma([30])
            } else {
                Luma([220])
            }
        })
    }

    fn assert_canonical(img: &NormalizedImage) {
        assert_eq!(img.shape(), [CANONICAL_HEIGHT, CANONICAL_WIDTH, 1]);
        assert!(img.pixels().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_normalize_shape_for_varied_inputs() {
        let opts = NormalizeOptions::default();
        let inputs = [
            DynamicImage::ImageLuma8(bimodal(640, 300)),
            DynamicImage::ImageLuma8(bimodal(17, 9)),
            DynamicImage::ImageLuma8(bimodal(1, 1)),
            DynamicImage::ImageRgb8(RgbImage::from_pixel(1000, 80, Rgb([200, 10, 90]))),
            DynamicImage::ImageLuma8(bimodal(220, 155)),
        ];
        for input in &inputs {
            assert_canonical(&normalize(input, &opts));
            assert_canonical(&normalize(input, &NormalizeOptions::phone()));
        }
    }

    #[test]
    fn test_ink_becomes_high() {
        let img = DynamicImage::ImageLuma8(bimodal(440, 310));
        let (norm, threshold) = normalize_with_threshold(&img, &NormalizeOptions::default());
        assert!((30..220).contains(&threshold));
        // Top rows are paper, middle rows carry ink
        assert_eq!(norm.pixels()[[5, 100]], 0.0);
        assert!(norm.pixels()[[77, 100]] > 0.5);
    }

    #[test]
    fn test_gray_uses_bt601_weights() {
        let rgb = RgbImage::from_fn(3, 1, |x, _| match x {
            0 => Rgb([255, 0, 0]),
            1 => Rgb([0, 255, 0]),
            _ => Rgb([0, 0, 255]),
        });
        let gray = to_gray(&DynamicImage::ImageRgb8(rgb));
        let values: Vec<u8> = gray.pixels().map(|p| p.0[0]).collect();
        assert_eq!(values, vec![76, 150, 29]);

        let luma = GrayImage::from_pixel(2, 2, Luma([123]));
        assert_eq!(to_gray(&DynamicImage::ImageLuma8(luma.clone())), luma);
    }

    #[test]
    fn test_otsu_splits_bimodal_histogram() {
        let gray = bimodal(100, 60);
        let t = otsu_threshold(&gray);
        assert!(t >= 30 && t < 220, "threshold {t} should separate 30 from 220");
    }

    #[test]
    fn test_otsu_uniform_image() {
        let gray = GrayImage::from_pixel(10, 10, Luma([128]));
        assert_eq!(otsu_threshold(&gray), 0);
    }

    #[test]
    fn test_fixed_binarization() {
        let gray = GrayImage::from_fn(4, 1, |x, _| Luma([[10, 126, 127, 128][x as usize]]));
        let bin = binarize_inverted(&gray, 127);
        let values: Vec<u8> = bin.pixels().map(|p| p.0[0]).collect();
        assert_eq!(values, vec![255, 255, 255, 0]);
    }

    #[test]
    fn test_median_removes_salt_noise() {
        let mut gray = GrayImage::from_pixel(5, 5, Luma([200]));
        gray.put_pixel(2, 2, Luma([0]));
        let out = median_blur_3x3(&gray);
        assert!(out.pixels().all(|p| p.0[0] == 200));
    }

    #[test]
    fn test_equalize_stretches_contrast() {
        let mut gray = GrayImage::from_fn(16, 16, |x, y| Luma([100 + ((x + y) % 11) as u8]));
        equalize_histogram(&mut gray);
        let min = gray.pixels().map(|p| p.0[0]).min().unwrap();
        let max = gray.pixels().map(|p| p.0[0]).max().unwrap();
        assert_eq!(min, 0);
        assert_eq!(max, 255);
    }

    #[test]
    fn test_equalize_single_intensity_unchanged() {
        let mut gray = GrayImage::from_pixel(4, 4, Luma([77]));
        equalize_histogram(&mut gray);
        assert!(gray.pixels().all(|p| p.0[0] == 77));
    }

    #[test]
    fn test_resize_area_averages_blocks() {
        // 4x2 -> 2x1: each output averages a 2x2 block
        let gray = GrayImage::from_raw(4, 2, vec![0, 255, 255, 255, 0, 255, 255, 255]).unwrap();
        let out = resize_area(&gray, 2, 1);
        assert!((out[[0, 0]] - 127.5).abs() < 1e-3);
        assert!((out[[0, 1]] - 255.0).abs() < 1e-3);
    }

    #[test]
    fn test_resize_area_upscale_preserves_constant() {
        let gray = GrayImage::from_pixel(3, 2, Luma([255]));
        let out = resize_area(&gray, 220, 155);
        assert!(out.iter().all(|&v| (v - 255.0).abs() < 1e-2));
    }

    #[test]
    fn test_decode_failure_is_error() {
        let err = normalize_bytes(b"definitely not an image", &NormalizeOptions::default());
        assert!(matches!(err, Err(PreprocessError::Decode { .. })));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = normalize_file(Path::new("/nonexistent/sig.png"), &NormalizeOptions::default());
        assert!(matches!(err, Err(PreprocessError::Io { .. })));
    }

    #[test]
    fn test_png_bytes_round_trip() {
        let mut bytes = Vec::new();
        DynamicImage::ImageLuma8(bimodal(300, 120))
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        let norm = normalize_bytes(&bytes, &NormalizeOptions::default()).unwrap();
        assert_canonical(&norm);
    }

    #[test]
    fn test_image_extension_filter() {
        assert!(has_image_extension(Path::new("a/sig1.PNG")));
        assert!(has_image_extension(Path::new("sig.jpeg")));
        assert!(has_image_extension(Path::new("sig.bmp")));
        assert!(!has_image_extension(Path::new("notes.txt")));
        assert!(!has_image_extension(Path::new("README")));
    }
}
