//! Ensemble run configuration, loaded from JSON.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{EnsembleError, Result};

/// Default power threshold handed to every atom.
pub const DEFAULT_POW_TH: f64 = 0.9;
/// Default number of workers per coaddition call.
pub const DEFAULT_WORKERS: usize = 2;

fn default_pow_th() -> f64 {
    DEFAULT_POW_TH
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

/// Configuration for an ensemble coaddition run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    /// Fraction of PSF power kept by each atom's basis, in (0, 1]
    #[serde(default = "default_pow_th")]
    pub pow_th: f64,
    /// Number of workers launched per `calculate_*` call
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Upper bound on the wait for each worker's result; `None` blocks indefinitely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collect_timeout_ms: Option<u64>,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            pow_th: DEFAULT_POW_TH,
            workers: DEFAULT_WORKERS,
            collect_timeout_ms: None,
        }
    }
}

impl EnsembleConfig {
    pub fn validate(&self) -> Result<()> {
        validate_pow_th(self.pow_th)?;
        if self.workers == 0 {
            return Err(EnsembleError::InvalidWorkerCount);
        }
        if self.collect_timeout_ms == Some(0) {
            return Err(EnsembleError::InvalidConfig(
                "collect_timeout_ms must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn collect_timeout(&self) -> Option<Duration> {
        self.collect_timeout_ms.map(Duration::from_millis)
    }

    /// Load and validate a JSON config file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Power threshold must lie in (0, 1].
pub fn validate_pow_th(pow_th: f64) -> Result<()> {
    if pow_th > 0.0 && pow_th <= 1.0 {
        Ok(())
    } else {
        Err(EnsembleError::InvalidConfig(format!(
            "pow_th must be in (0, 1], got {pow_th}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: EnsembleConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EnsembleConfig::default());
        assert!(config.collect_timeout().is_none());

        let config: EnsembleConfig =
            serde_json::from_str(r#"{"workers": 6, "collect_timeout_ms": 1500}"#).unwrap();
        assert_eq!(config.workers, 6);
        assert_eq!(config.collect_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_validation() {
        assert!(EnsembleConfig::default().validate().is_ok());

        for pow_th in [0.0, -0.1, 1.01, f64::NAN] {
            let config = EnsembleConfig {
                pow_th,
                ..Default::default()
            };
            assert!(matches!(
                config.validate(),
                Err(EnsembleError::InvalidConfig(_))
            ));
        }

        let config = EnsembleConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EnsembleError::InvalidWorkerCount)
        ));

        let config = EnsembleConfig {
            collect_timeout_ms: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ensemble.json");
        let config = EnsembleConfig {
            pow_th: 0.75,
            workers: 3,
            collect_timeout_ms: Some(250),
        };

        config.save_to_file(&path).unwrap();
        assert_eq!(EnsembleConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");

        std::fs::write(&path, r#"{"pow_th": 2.0}"#).unwrap();
        assert!(matches!(
            EnsembleConfig::load_from_file(&path),
            Err(EnsembleError::InvalidConfig(_))
        ));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            EnsembleConfig::load_from_file(&path),
            Err(EnsembleError::Json(_))
        ));
    }
}
