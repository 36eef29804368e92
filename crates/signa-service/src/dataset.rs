//! Identity-directory scanning and dataset analysis.
//!
//! Layout: `root/<identity>/<image>`. Directories and files are visited in
//! sorted order so every run sees the same sample order.

use rayon::prelude::*;
use serde::Serialize;
use signa_core::pairs::exhaustive_pair_counts;
use signa_core::preprocess::{has_image_extension, normalize_file};
use signa_core::{LabeledSet, NormalizeOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Minimum images per identity before the report stops flagging it.
pub const RECOMMENDED_IMAGES: usize = 5;
/// Minimum identities before the report stops flagging the set.
pub const RECOMMENDED_IDENTITIES: usize = 3;
/// Negative/positive ratio above which the set counts as imbalanced.
pub const MAX_NEGATIVE_RATIO: f32 = 10.0;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("cannot read directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} is not a directory")]
    NotADirectory(String),
    #[error("no identity sub-directories with images under {0}")]
    NoIdentities(String),
}

/// One identity sub-directory and its image files, sorted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityDir {
    pub key: String,
    pub files: Vec<PathBuf>,
}

/// A file that was found but could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    let io_err = |source| DatasetError::Io {
        path: dir.display().to_string(),
        source,
    };
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        entries.push(entry.map_err(io_err)?.path());
    }
    entries.sort();
    Ok(entries)
}

/// List identity directories under `root`, each with its image files.
///
/// Identities without any image file are still listed (with no files) so
/// the analysis can flag them.
pub fn scan_identities(root: &Path) -> Result<Vec<IdentityDir>, DatasetError> {
    if !root.is_dir() {
        return Err(DatasetError::NotADirectory(root.display().to_string()));
    }
    let mut identities = Vec::new();
    for dir in read_dir_sorted(root)? {
        if !dir.is_dir() {
            continue;
        }
        let Some(key) = dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let files = read_dir_sorted(&dir)?
            .into_iter()
            .filter(|p| p.is_file() && has_image_extension(p))
            .collect();
        identities.push(IdentityDir { key, files });
    }
    Ok(identities)
}

/// Normalized images of one identity, keyed by file name.
#[derive(Debug, Clone)]
pub(crate) struct LoadedIdentity {
    pub key: String,
    pub images: Vec<(String, signa_core::NormalizedImage)>,
}

/// Decode and normalize every file, in parallel, keeping file order.
pub(crate) fn load_identities(
    identities: &[IdentityDir],
    options: &NormalizeOptions,
) -> (Vec<LoadedIdentity>, Vec<SkippedFile>) {
    let mut loaded = Vec::with_capacity(identities.len());
    let mut skipped = Vec::new();
    for identity in identities {
        let results: Vec<_> = identity
            .files
            .par_iter()
            .map(|path| (path, normalize_file(path, options)))
            .collect();
        let mut images = Vec::with_capacity(results.len());
        for (path, result) in results {
            match result {
                Ok(image) => {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    images.push((name, image));
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable image");
                    skipped.push(SkippedFile {
                        path: path.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        loaded.push(LoadedIdentity {
            key: identity.key.clone(),
            images,
        });
    }
    (loaded, skipped)
}

/// A labeled set read from disk.
#[derive(Debug, Clone)]
pub struct LoadedSet {
    pub set: LabeledSet,
    pub skipped: Vec<SkippedFile>,
}

/// Read every identity directory under `root` into a [`LabeledSet`].
pub fn load_labeled_set(root: &Path, options: &NormalizeOptions) -> Result<LoadedSet, DatasetError> {
    let identities = scan_identities(root)?;
    let (loaded, skipped) = load_identities(&identities, options);

    let mut set = LabeledSet::new();
    for identity in loaded {
        for (_, image) in identity.images {
            set.push(image, identity.key.clone());
        }
    }
    if set.is_empty() {
        return Err(DatasetError::NoIdentities(root.display().to_string()));
    }
    tracing::info!(
        root = %root.display(),
        images = set.len(),
        identities = set.groups().len(),
        skipped = skipped.len(),
        "loaded labeled set"
    );
    Ok(LoadedSet { set, skipped })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetIssue {
    pub severity: Severity,
    pub identity: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentitySummary {
    pub key: String,
    pub images: usize,
    pub positive_pairs: usize,
}

/// Pair counts and structural problems of a dataset, before any training.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetReport {
    pub identities: Vec<IdentitySummary>,
    pub total_images: usize,
    pub positive_pairs: usize,
    /// Cross-identity pairs counted in both orders, as the evaluator
    /// enumerates them.
    pub negative_pairs: usize,
    pub negative_cap: usize,
    pub issues: Vec<DatasetIssue>,
}

impl DatasetReport {
    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Error)
    }
}

/// Analyze per-identity image counts.
pub fn analyze(counts: &[(String, usize)], negative_cap: usize) -> DatasetReport {
    let mut issues = Vec::new();
    let mut identities = Vec::with_capacity(counts.len());

    for (key, n) in counts {
        let n = *n;
        if n < 2 {
            issues.push(DatasetIssue {
                severity: Severity::Error,
                identity: Some(key.clone()),
                message: format!("only {n} image(s); same-identity pairs are impossible"),
            });
        } else if n < RECOMMENDED_IMAGES {
            issues.push(DatasetIssue {
                severity: Severity::Warning,
                identity: Some(key.clone()),
                message: format!("only {n} images; few same-identity pairs"),
            });
        }
        identities.push(IdentitySummary {
            key: key.clone(),
            images: n,
            positive_pairs: n * n.saturating_sub(1) / 2,
        });
    }

    let sizes: Vec<usize> = counts.iter().map(|(_, n)| *n).collect();
    let (positive_pairs, unordered_negatives) = exhaustive_pair_counts(&sizes, negative_cap);
    let negative_pairs = 2 * unordered_negatives;

    if positive_pairs == 0 {
        issues.push(DatasetIssue {
            severity: Severity::Error,
            identity: None,
            message: "no same-identity pairs can be built".to_string(),
        });
    } else if negative_pairs as f32 / positive_pairs as f32 > MAX_NEGATIVE_RATIO {
        issues.push(DatasetIssue {
            severity: Severity::Warning,
            identity: None,
            message: format!(
                "imbalanced: {:.1}x more different-identity pairs than same-identity pairs",
                negative_pairs as f32 / positive_pairs as f32
            ),
        });
    }
    if counts.len() < RECOMMENDED_IDENTITIES {
        issues.push(DatasetIssue {
            severity: Severity::Warning,
            identity: None,
            message: format!(
                "only {} identities; at least {RECOMMENDED_IDENTITIES} are recommended",
                counts.len()
            ),
        });
    }

    for issue in &issues {
        tracing::warn!(identity = issue.identity.as_deref().unwrap_or("-"), "{}", issue.message);
    }

    DatasetReport {
        identities,
        total_images: sizes.iter().sum(),
        positive_pairs,
        negative_pairs,
        negative_cap,
        issues,
    }
}

/// Analyze an identity directory tree without decoding any image.
pub fn analyze_dir(root: &Path, negative_cap: usize) -> Result<DatasetReport, DatasetError> {
    let counts: Vec<(String, usize)> = scan_identities(root)?
        .into_iter()
        .map(|d| (d.key, d.files.len()))
        .collect();
    Ok(analyze(&counts, negative_cap))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{GrayImage, ImageFormat, Luma};
    use signa_core::pairs::make_exhaustive_pairs;

    /// Dark stroke on white paper; `variant` shifts the stroke.
    pub(crate) fn write_signature(path: &Path, variant: u32) {
        let img = GrayImage::from_fn(40, 30, |x, y| {
            if (y + variant) % 7 == 0 || x == 5 + variant {
                Luma([20])
            } else {
                Luma([235])
            }
        });
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        img.save_with_format(path, ImageFormat::Png).unwrap();
    }

    fn owned(counts: &[(&str, usize)]) -> Vec<(String, usize)> {
        counts.iter().map(|(k, n)| (k.to_string(), *n)).collect()
    }

    #[test]
    fn test_scan_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        write_signature(&dir.path().join("bob/b.png"), 1);
        write_signature(&dir.path().join("bob/a.PNG"), 2);
        write_signature(&dir.path().join("alice/x.png"), 3);
        std::fs::write(dir.path().join("bob/notes.txt"), "n/a").unwrap();
        std::fs::write(dir.path().join("stray.png"), "n/a").unwrap();

        let ids = scan_identities(dir.path()).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0].key, "alice");
        assert_eq!(ids[1].key, "bob");
        let names: Vec<String> = ids[1]
            .files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.PNG", "b.png"]);
    }

    #[test]
    fn test_load_skips_undecodable_files() {
        let dir = tempfile::tempdir().unwrap();
        write_signature(&dir.path().join("ana/1.png"), 0);
        write_signature(&dir.path().join("ana/2.png"), 1);
        std::fs::write(dir.path().join("ana/3.png"), b"not an image").unwrap();

        let loaded = load_labeled_set(dir.path(), &NormalizeOptions::default()).unwrap();
        assert_eq!(loaded.set.len(), 2);
        assert_eq!(loaded.skipped.len(), 1);
        assert!(loaded.skipped[0].path.ends_with("3.png"));
        assert_eq!(loaded.set.image(0).shape(), [155, 220, 1]);
    }

    #[test]
    fn test_single_image_identity_is_flagged_not_dropped() {
        let dir = tempfile::tempdir().unwrap();
        write_signature(&dir.path().join("solo/only.png"), 0);

        let loaded = load_labeled_set(dir.path(), &NormalizeOptions::default()).unwrap();
        let sampled = make_exhaustive_pairs(&loaded.set, 2);
        assert_eq!(sampled.positives(), 0);
        assert_eq!(sampled.insufficient.len(), 1);
        assert_eq!(sampled.insufficient[0].identity, "solo");

        let report = analyze_dir(dir.path(), 3).unwrap();
        assert!(report.has_errors());
        assert_eq!(report.identities[0].positive_pairs, 0);
    }

    #[test]
    fn test_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_labeled_set(&dir.path().join("nope"), &NormalizeOptions::default()),
            Err(DatasetError::NotADirectory(_))
        ));
        assert!(matches!(
            load_labeled_set(dir.path(), &NormalizeOptions::default()),
            Err(DatasetError::NoIdentities(_))
        ));
    }

    #[test]
    fn test_analysis_counts() {
        let report = analyze(&owned(&[("a", 5), ("b", 2), ("c", 4)]), 3);
        assert_eq!(report.total_images, 11);
        assert_eq!(report.positive_pairs, 10 + 1 + 6);
        // Both orders: 2 * (3*2 + 3*3 + 2*3)
        assert_eq!(report.negative_pairs, 42);
        assert!(!report.has_errors());
        // b and c have fewer than 5 images
        assert_eq!(report.issues.len(), 2);
    }

    #[test]
    fn test_analysis_flags_imbalance_and_few_identities() {
        let report = analyze(&owned(&[("a", 2), ("b", 2)]), 3);
        assert_eq!(report.positive_pairs, 2);
        assert_eq!(report.negative_pairs, 8);
        assert!(report.issues.iter().any(|i| i.message.contains("identities")));

        let many: Vec<(String, usize)> = (0..12).map(|i| (format!("p{i}"), 2)).collect();
        let report = analyze(&many, 3);
        assert!(report.issues.iter().any(|i| i.message.starts_with("imbalanced")));
    }

    #[test]
    fn test_analysis_no_positives() {
        let report = analyze(&owned(&[("a", 1), ("b", 1), ("c", 1)]), 3);
        assert_eq!(report.positive_pairs, 0);
        assert!(report.issues.iter().any(|i| i.identity.is_none() && i.severity == Severity::Error));
    }
}
