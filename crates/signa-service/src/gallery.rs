//! Enrollment gallery: identities with precomputed embeddings.

use crate::dataset::{load_identities, scan_identities, SkippedFile};
use rayon::prelude::*;
use serde::Serialize;
use signa_core::{Embedding, ModelError, NormalizeOptions, NormalizedImage, SiameseModel};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct EnrolledSample {
    pub file_name: String,
    pub image: NormalizedImage,
    pub embedding: Embedding,
}

#[derive(Debug, Clone)]
pub struct EnrolledIdentity {
    pub key: String,
    pub samples: Vec<EnrolledSample>,
}

/// Identity key and sample count, for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityListing {
    pub key: String,
    pub samples: usize,
}

/// Enrolled identities, sorted by key, each sample embedded once.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    identities: Vec<EnrolledIdentity>,
    skipped: Vec<SkippedFile>,
}

impl Gallery {
    /// Scan `root` and embed every readable image with `model`.
    ///
    /// A missing directory yields an empty gallery; matching against it
    /// reports that nothing is enrolled.
    pub fn load(root: &Path, model: &SiameseModel, options: &NormalizeOptions) -> Result<Self, crate::ServiceError> {
        if !root.exists() {
            tracing::warn!(root = %root.display(), "enrollment directory does not exist");
            return Ok(Self::default());
        }
        let dirs = scan_identities(root)?;
        let (loaded, skipped) = load_identities(&dirs, options);

        let entries = loaded
            .into_iter()
            .flat_map(|identity| {
                let key = identity.key;
                identity
                    .images
                    .into_iter()
                    .map(move |(name, image)| (key.clone(), name, image))
            })
            .collect();
        let mut gallery = Self::from_images(entries, model)?;
        gallery.skipped = skipped;

        tracing::info!(
            root = %root.display(),
            identities = gallery.len(),
            samples = gallery.sample_count(),
            skipped = gallery.skipped.len(),
            "enrollment gallery loaded"
        );
        Ok(gallery)
    }

    /// Build from `(identity, file name, image)` entries; entries of one
    /// identity keep their relative order.
    pub fn from_images(entries: Vec<(String, String, NormalizedImage)>, model: &SiameseModel) -> Result<Self, ModelError> {
        let embeddings = entries
            .par_iter()
            .map(|(_, _, image)| model.embed(image))
            .collect::<Result<Vec<_>, _>>()?;

        let mut identities: Vec<EnrolledIdentity> = Vec::new();
        for ((key, file_name, image), embedding) in entries.into_iter().zip(embeddings) {
            let sample = EnrolledSample {
                file_name,
                image,
                embedding,
            };
            match identities.iter_mut().find(|i| i.key == key) {
                Some(identity) => identity.samples.push(sample),
                None => identities.push(EnrolledIdentity {
                    key,
                    samples: vec![sample],
                }),
            }
        }
        identities.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(Self {
            identities,
            skipped: Vec::new(),
        })
    }

    pub fn identities(&self) -> &[EnrolledIdentity] {
        &self.identities
    }

    pub fn get(&self, key: &str) -> Option<&EnrolledIdentity> {
        self.identities.iter().find(|i| i.key == key)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn sample_count(&self) -> usize {
        self.identities.iter().map(|i| i.samples.len()).sum()
    }

    pub fn skipped(&self) -> &[SkippedFile] {
        &self.skipped
    }

    pub fn listing(&self) -> Vec<IdentityListing> {
        self.identities
            .iter()
            .map(|i| IdentityListing {
                key: i.key.clone(),
                samples: i.samples.len(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::write_signature;
    use signa_core::NetworkConfig;

    fn small_options() -> NormalizeOptions {
        NormalizeOptions {
            height: 12,
            width: 16,
            ..NormalizeOptions::default()
        }
    }

    fn small_model() -> SiameseModel {
        let config = NetworkConfig {
            conv_channels: vec![2],
            dense_units: vec![4],
            dense_dropout: 0.0,
        };
        SiameseModel::new(12, 16, config, 3).unwrap()
    }

    #[test]
    fn test_load_embeds_every_sample_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_signature(&dir.path().join("bruno/2.png"), 2);
        write_signature(&dir.path().join("bruno/1.png"), 1);
        write_signature(&dir.path().join("ana/1.png"), 3);
        std::fs::write(dir.path().join("ana/broken.png"), b"xx").unwrap();
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();

        let model = small_model();
        let gallery = Gallery::load(dir.path(), &model, &small_options()).unwrap();
        assert_eq!(
            gallery.listing(),
            vec![
                IdentityListing { key: "ana".into(), samples: 1 },
                IdentityListing { key: "bruno".into(), samples: 2 },
            ]
        );
        assert_eq!(gallery.skipped().len(), 1);

        let bruno = gallery.get("bruno").unwrap();
        assert_eq!(bruno.samples[0].file_name, "1.png");
        let expected = model.embed(&bruno.samples[0].image).unwrap();
        assert_eq!(bruno.samples[0].embedding, expected);
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = Gallery::load(&dir.path().join("none"), &small_model(), &small_options()).unwrap();
        assert!(gallery.is_empty());
        assert_eq!(gallery.sample_count(), 0);
    }

    #[test]
    fn test_shape_mismatch_surfaces() {
        let entries = vec![("x".to_string(), "a.png".to_string(), NormalizedImage::blank(4, 4))];
        assert!(matches!(
            Gallery::from_images(entries, &small_model()),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }
}
