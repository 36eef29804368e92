use serde::{Deserialize, Serialize};
use signa_core::{Binarization, CaptureProfile, NormalizeOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },
}

/// Service configuration: TOML file and/or `SIGNA_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Trained model artifact.
    pub model_path: PathBuf,
    /// Calibrated decision threshold (one number, 4 decimals).
    pub threshold_path: PathBuf,
    /// One sub-directory per enrolled identity.
    pub enrollment_dir: PathBuf,
    /// Threshold used when no calibrated file exists. Unset means the
    /// service refuses to start without a calibration.
    pub fallback_threshold: Option<f32>,
    pub capture_profile: CaptureProfile,
    /// Fixed binarization cut-off; unset selects Otsu per image.
    pub fixed_binarization: Option<u8>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/signature_siamese.json"),
            threshold_path: PathBuf::from("results/optimal_threshold.txt"),
            enrollment_dir: PathBuf::from("enrolled_signatures"),
            fallback_threshold: None,
            capture_profile: CaptureProfile::Scan,
            fixed_binarization: None,
        }
    }
}

impl Config {
    /// Defaults overridden by `SIGNA_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Read a TOML file; missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// File (if given) then environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (environment-variable names as keys).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("SIGNA_MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SIGNA_THRESHOLD_PATH") {
            self.threshold_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SIGNA_ENROLLMENT_DIR") {
            self.enrollment_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("SIGNA_FALLBACK_THRESHOLD") {
            self.fallback_threshold = Some(parse_env("SIGNA_FALLBACK_THRESHOLD", &v)?);
        }
        if let Some(v) = lookup("SIGNA_CAPTURE_PROFILE") {
            self.capture_profile = match v.trim().to_ascii_lowercase().as_str() {
                "scan" => CaptureProfile::Scan,
                "phone" => CaptureProfile::Phone,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        key: "SIGNA_CAPTURE_PROFILE",
                        value: v,
                    })
                }
            };
        }
        if let Some(v) = lookup("SIGNA_FIXED_BINARIZATION") {
            self.fixed_binarization = Some(parse_env("SIGNA_FIXED_BINARIZATION", &v)?);
        }
        Ok(())
    }

    /// Normalizer options for the configured capture profile.
    pub fn normalize_options(&self) -> NormalizeOptions {
        NormalizeOptions {
            profile: self.capture_profile,
            binarization: self.fixed_binarization.map_or(Binarization::Otsu, Binarization::Fixed),
            ..NormalizeOptions::default()
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.model_path, PathBuf::from("models/signature_siamese.json"));
        assert_eq!(c.threshold_path, PathBuf::from("results/optimal_threshold.txt"));
        assert_eq!(c.enrollment_dir, PathBuf::from("enrolled_signatures"));
        assert_eq!(c.fallback_threshold, None);
        assert_eq!(c.normalize_options(), NormalizeOptions::default());
    }

    #[test]
    fn test_env_overrides() {
        let mut c = Config::default();
        c.apply_overrides(lookup(&[
            ("SIGNA_MODEL_PATH", "/srv/model.json"),
            ("SIGNA_FALLBACK_THRESHOLD", "0.10"),
            ("SIGNA_CAPTURE_PROFILE", "Phone"),
            ("SIGNA_FIXED_BINARIZATION", "127"),
        ]))
        .unwrap();
        assert_eq!(c.model_path, PathBuf::from("/srv/model.json"));
        assert_eq!(c.fallback_threshold, Some(0.10));
        assert_eq!(c.capture_profile, CaptureProfile::Phone);
        let opts = c.normalize_options();
        assert_eq!(opts.binarization, Binarization::Fixed(127));
        assert_eq!(opts.profile, CaptureProfile::Phone);
    }

    #[test]
    fn test_bad_env_value_is_an_error() {
        let mut c = Config::default();
        let err = c
            .apply_overrides(lookup(&[("SIGNA_FALLBACK_THRESHOLD", "abc")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { key: "SIGNA_FALLBACK_THRESHOLD", .. }));

        let err = c
            .apply_overrides(lookup(&[("SIGNA_CAPTURE_PROFILE", "webcam")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { key: "SIGNA_CAPTURE_PROFILE", .. }));
    }

    #[test]
    fn test_partial_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signa.toml");
        std::fs::write(
            &path,
            "model_path = \"m.json\"\nfallback_threshold = 0.5\ncapture_profile = \"phone\"\n",
        )
        .unwrap();
        let c = Config::from_file(&path).unwrap();
        assert_eq!(c.model_path, PathBuf::from("m.json"));
        assert_eq!(c.fallback_threshold, Some(0.5));
        assert_eq!(c.capture_profile, CaptureProfile::Phone);
        assert_eq!(c.enrollment_dir, PathBuf::from("enrolled_signatures"));
    }

    #[test]
    fn test_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signa.toml");
        std::fs::write(&path, "model_path = [").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            Config::from_file(&dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
