//! Stage and project configuration
//!
//! Each stage is configured by a `{ "model_name": ..., "args": { ... } }`
//! record. Configurations are values: changing one produces a new value (and
//! a new [`ModelIdentity`](crate::ModelIdentity)), never a mutation of a
//! hashed one.

mod settings;

pub use settings::{Settings, TrainingDefaults};

use crate::error::{PipelineError, PipelineResult};
use crate::lineage::{Stage, StageConfig};
use serde::{Deserialize, Serialize};

/// Arguments for the feature-hashing reference encoder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HashingArgs {
    /// Output vector length
    pub dimensions: usize,
    /// Character n-gram length hashed alongside whole words
    pub ngram: usize,
}

impl Default for HashingArgs {
    fn default() -> Self {
        Self {
            dimensions: 256,
            ngram: 3,
        }
    }
}

/// Arguments for the fastembed (ONNX) encoder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FastEmbedArgs {
    pub model: String,
}

impl Default for FastEmbedArgs {
    fn default() -> Self {
        Self {
            model: "nomic-embed-text-v1.5".to_string(),
        }
    }
}

/// Embedding stage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model_name", content = "args", rename_all = "snake_case")]
pub enum EmbeddingConfig {
    Hashing(HashingArgs),
    #[serde(rename = "fastembed")]
    FastEmbed(FastEmbedArgs),
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        EmbeddingConfig::Hashing(HashingArgs::default())
    }
}

impl StageConfig for EmbeddingConfig {
    const STAGE: Stage = Stage::Embedding;

    fn model_name(&self) -> &'static str {
        match self {
            EmbeddingConfig::Hashing(_) => "hashing",
            EmbeddingConfig::FastEmbed(_) => "fastembed",
        }
    }
}

/// Arguments for the principal-component projector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PcaArgs {
    pub power_iterations: usize,
    pub random_state: u64,
}

impl Default for PcaArgs {
    fn default() -> Self {
        Self {
            power_iterations: 100,
            random_state: 42,
        }
    }
}

/// Arguments for the trainable (parametric) projector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParametricArgs {
    /// Hidden layer width of the projection network
    pub hidden: usize,
    /// Epochs used to fit the network to the initial layout
    pub fit_epochs: usize,
    pub learning_rate: f32,
    pub random_state: u64,
}

impl Default for ParametricArgs {
    fn default() -> Self {
        Self {
            hidden: 32,
            fit_epochs: 50,
            learning_rate: 0.01,
            random_state: 42,
        }
    }
}

/// Reduction stage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model_name", content = "args", rename_all = "snake_case")]
pub enum ReductionConfig {
    Pca(PcaArgs),
    Parametric(ParametricArgs),
}

impl Default for ReductionConfig {
    fn default() -> Self {
        ReductionConfig::Pca(PcaArgs::default())
    }
}

impl ReductionConfig {
    /// Whether the configured projector supports online training.
    pub fn is_trainable(&self) -> bool {
        matches!(self, ReductionConfig::Parametric(_))
    }
}

impl StageConfig for ReductionConfig {
    const STAGE: Stage = Stage::Reduction;

    fn model_name(&self) -> &'static str {
        match self {
            ReductionConfig::Pca(_) => "pca",
            ReductionConfig::Parametric(_) => "parametric",
        }
    }
}

/// Arguments for density-based clustering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DbscanArgs {
    /// Neighbourhood radius
    pub eps: f32,
    /// Neighbours (including the point itself) required for a core point
    pub min_samples: usize,
}

impl Default for DbscanArgs {
    fn default() -> Self {
        Self {
            eps: 0.5,
            min_samples: 5,
        }
    }
}

/// Clustering stage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model_name", content = "args", rename_all = "snake_case")]
pub enum ClusterConfig {
    Dbscan(DbscanArgs),
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig::Dbscan(DbscanArgs::default())
    }
}

impl StageConfig for ClusterConfig {
    const STAGE: Stage = Stage::Clustering;

    fn model_name(&self) -> &'static str {
        match self {
            ClusterConfig::Dbscan(_) => "dbscan",
        }
    }
}

/// The full configuration of a project: one entry per stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    pub name: String,
    pub embedding_config: EmbeddingConfig,
    pub reduction_config: ReductionConfig,
    pub cluster_config: ClusterConfig,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            embedding_config: EmbeddingConfig::default(),
            reduction_config: ReductionConfig::default(),
            cluster_config: ClusterConfig::default(),
        }
    }
}

impl ProjectConfig {
    /// Parse and validate a configuration from JSON.
    pub fn from_json(json: &str) -> PipelineResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PipelineError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a configuration from YAML.
    pub fn from_yaml(yaml: &str) -> PipelineResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| PipelineError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> PipelineResult<String> {
        serde_json::to_string(self).map_err(|e| PipelineError::Configuration(e.to_string()))
    }

    /// Reject hyperparameters no model can run with.
    pub fn validate(&self) -> PipelineResult<()> {
        let invalid = |msg: String| Err(PipelineError::Configuration(msg));

        match &self.embedding_config {
            EmbeddingConfig::Hashing(args) => {
                if args.dimensions == 0 {
                    return invalid("hashing encoder needs dimensions > 0".into());
                }
                if args.ngram == 0 {
                    return invalid("hashing encoder needs ngram > 0".into());
                }
            }
            EmbeddingConfig::FastEmbed(args) => {
                if !cfg!(feature = "embeddings") {
                    return invalid(format!(
                        "encoder 'fastembed' ({}) requires the `embeddings` feature",
                        args.model
                    ));
                }
            }
        }

        match &self.reduction_config {
            ReductionConfig::Pca(args) => {
                if args.power_iterations == 0 {
                    return invalid("pca needs power_iterations > 0".into());
                }
            }
            ReductionConfig::Parametric(args) => {
                if args.hidden == 0 {
                    return invalid("parametric projector needs hidden > 0".into());
                }
                if !(args.learning_rate.is_finite() && args.learning_rate > 0.0) {
                    return invalid("parametric projector needs a positive learning_rate".into());
                }
            }
        }

        match &self.cluster_config {
            ClusterConfig::Dbscan(args) => {
                if !(args.eps.is_finite() && args.eps > 0.0) {
                    return invalid("dbscan needs eps > 0".into());
                }
                if args.min_samples == 0 {
                    return invalid("dbscan needs min_samples > 0".into());
                }
            }
        }

        Ok(())
    }
}
