use crate::error::{DiagnosticsError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Diagnostic thresholds shared by both engines.
///
/// The value is immutable once built and is passed by reference into every
/// computation that compares against a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Maximum |VUE_XZDistance| for a passing DTest (inclusive)
    pub distance: f64,
    /// NSPCTest passes while |VAR_XUniverse (BAU vs ADJ)| is strictly below this
    pub nspc: f64,
    /// XFTest passes while |VAR_XFactor (BAU vs ADJ)| is strictly below this
    pub xf: f64,
    /// Minimum |ADJ_SalesImpact| for a relevant cell-category
    pub cell_cat: f64,
    /// Minimum Baseline_CellImportance for a relevant cell-category
    pub cell_weight: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            distance: 3.0,
            nspc: 0.1,
            xf: 0.1,
            cell_cat: 0.05,
            cell_weight: 0.01,
        }
    }
}

impl Thresholds {
    pub fn new(distance: f64, nspc: f64, xf: f64, cell_cat: f64, cell_weight: f64) -> Result<Self> {
        let thresholds = Self {
            distance,
            nspc,
            xf,
            cell_cat,
            cell_weight,
        };
        thresholds.validate()?;
        Ok(thresholds)
    }

    /// Load thresholds from a JSON parameters file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DiagnosticsError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let thresholds: Thresholds = serde_json::from_str(&content)?;
        thresholds.validate()?;
        Ok(thresholds)
    }

    pub fn validate(&self) -> Result<()> {
        let named = [
            ("distance", self.distance),
            ("nspc", self.nspc),
            ("xf", self.xf),
            ("cell_cat", self.cell_cat),
            ("cell_weight", self.cell_weight),
        ];
        for (name, value) in named {
            if !value.is_finite() || value < 0.0 {
                return Err(DiagnosticsError::Config(format!(
                    "Threshold '{}' must be a finite non-negative number, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Everything one pipeline run needs to know about its environment.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub working_dir: PathBuf,
    pub thresholds: Thresholds,
    /// Optional CSV of hand-edited ADJ values keyed by Cell_ID
    pub adjustments: Option<PathBuf>,
}

impl RunConfig {
    pub fn new(working_dir: impl Into<PathBuf>, thresholds: Thresholds) -> Self {
        Self {
            working_dir: working_dir.into(),
            thresholds,
            adjustments: None,
        }
    }

    pub fn with_adjustments(mut self, path: Option<PathBuf>) -> Self {
        self.adjustments = path;
        self
    }

    pub fn inputs_dir(&self) -> PathBuf {
        self.working_dir.join("inputs")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.working_dir.join("outputs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_negative_threshold() {
        let err = Thresholds::new(3.0, -0.1, 0.1, 0.05, 0.01).unwrap_err();
        assert!(err.to_string().contains("nspc"));
    }

    #[test]
    fn test_rejects_non_finite_threshold() {
        assert!(Thresholds::new(f64::NAN, 0.1, 0.1, 0.05, 0.01).is_err());
        assert!(Thresholds::new(3.0, 0.1, f64::INFINITY, 0.05, 0.01).is_err());
    }

    #[test]
    fn test_load_from_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("params.json");
        std::fs::write(
            &path,
            r#"{"distance": 2.5, "nspc": 0.2, "xf": 0.15, "cell_cat": 0.05, "cell_weight": 0.01}"#,
        )
        .unwrap();

        let thresholds = Thresholds::load(&path).unwrap();
        assert_eq!(thresholds.distance, 2.5);
        assert_eq!(thresholds.xf, 0.15);
    }

    #[test]
    fn test_run_config_dirs() {
        let config = RunConfig::new("/tmp/project", Thresholds::default());
        assert_eq!(config.inputs_dir(), PathBuf::from("/tmp/project/inputs"));
        assert_eq!(config.outputs_dir(), PathBuf::from("/tmp/project/outputs"));
        assert!(config.adjustments.is_none());
    }
}
