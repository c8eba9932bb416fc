//! Runtime settings for a pipeline process

use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default hyperparameters for training runs that don't override them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingDefaults {
    pub epochs: usize,
    pub cohesion_batch_size: usize,
    pub cohesion_learning_rate: f32,
    pub correction_batch_size: usize,
    pub correction_learning_rate: f32,
    /// Weight of the drift term in correction mode
    pub lambda: f32,
    /// Anchors/positives/negatives drawn per label per batch
    pub triplets_per_label: usize,
    pub margin: f32,
}

impl Default for TrainingDefaults {
    fn default() -> Self {
        Self {
            epochs: 5,
            cohesion_batch_size: 64,
            cohesion_learning_rate: 2e-4,
            correction_batch_size: 32,
            correction_learning_rate: 5e-5,
            lambda: 1.0,
            triplets_per_label: 30,
            margin: 1.0,
        }
    }
}

/// Process-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// SQLite database file
    pub db_path: PathBuf,
    /// Root directory for model artifacts, plot exports and scratch files
    pub storage_root: PathBuf,
    /// Texts encoded per embedding batch
    pub batch_size: usize,
    /// Spill embedding batches to scratch files instead of holding them in memory
    pub use_disk_storage: bool,
    pub training: TrainingDefaults,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            db_path: data_dir.join("cartograph.db"),
            storage_root: data_dir,
            batch_size: 124,
            use_disk_storage: false,
            training: TrainingDefaults::default(),
        }
    }
}

/// Default data directory: `~/.local/share/cartograph` on Linux.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cartograph")
}

/// Default settings file: `~/.config/cartograph/settings.yaml` on Linux.
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("cartograph").join("settings.yaml"))
}

impl Settings {
    /// Settings rooted in a single directory. Used by tests and the CLI's
    /// `--data-dir` flag.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            db_path: dir.join("cartograph.db"),
            storage_root: dir,
            ..Self::default()
        }
    }

    /// Parse settings from YAML. Missing keys take their defaults.
    pub fn from_yaml(yaml: &str) -> PipelineResult<Self> {
        let settings: Self = serde_yaml::from_str(yaml)
            .map_err(|e| PipelineError::Configuration(format!("invalid settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from `path`, or from the default location when `path`
    /// is `None`. A missing default file yields the defaults; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> PipelineResult<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match default_settings_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::debug!(path = %path.display(), "loaded settings");
                Self::from_yaml(&contents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => Ok(Self::default()),
            Err(e) => Err(PipelineError::Configuration(format!(
                "cannot read settings {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.batch_size == 0 {
            return Err(PipelineError::Configuration("batch_size must be > 0".into()));
        }
        if self.training.epochs == 0 {
            return Err(PipelineError::Configuration("training.epochs must be > 0".into()));
        }
        if self.training.lambda < 0.0 {
            return Err(PipelineError::Configuration("training.lambda must be >= 0".into()));
        }
        Ok(())
    }

    /// Scratch directory for spilled embedding batches.
    pub fn scratch_dir(&self) -> PathBuf {
        self.storage_root.join("tmp")
    }
}
