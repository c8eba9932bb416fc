//! Stage models
//!
//! Every stage runs one model through the [`FitTransform`] capability. The
//! closed [`StageModel`] enum is what the registry persists: it serializes to
//! JSON with a `kind` tag and dispatches fit/transform to the concrete model.
//!
//! The models here are small deterministic reference implementations:
//! - [`Encoder`]: text → vector (feature hashing, or fastembed with the
//!   `embeddings` feature)
//! - [`Projector`]: vector → 2-D position by principal components
//! - [`OnlineProjector`]: vector → 2-D position by a trainable network
//! - [`Clusterer`]: position → cluster label by density (DBSCAN)

mod clusterer;
mod encoder;
mod network;
mod online;
mod projector;

pub use clusterer::{Clusterer, NOISE};
pub use encoder::{Embedder, Encoder, HashingEmbedder};
#[cfg(feature = "embeddings")]
pub use encoder::FastEmbedEmbedder;
pub use network::{input_tensor, position_tensor, Mlp, MlpWeights};
pub use online::OnlineProjector;
pub use projector::Projector;

use crate::config::{ClusterConfig, EmbeddingConfig, ReductionConfig};
use crate::lineage::StageConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by models
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("empty input")]
    EmptyInput,

    #[error("unexpected input: {0}")]
    InputMismatch(String),

    #[error("dimension mismatch: expected {expected}, found {found}")]
    Dimension { expected: usize, found: usize },

    #[error("model is not fitted")]
    NotFitted,

    #[error("model backend unavailable: {0}")]
    Unavailable(String),

    #[error("model backend error: {0}")]
    Backend(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ModelResult<T> = Result<T, ModelError>;

/// Input handed to a model, borrowed from the todo rows.
#[derive(Debug, Clone, Copy)]
pub enum ModelInput<'a> {
    Texts(&'a [String]),
    Vectors(&'a [Vec<f32>]),
    Points(&'a [[f32; 2]]),
}

impl<'a> ModelInput<'a> {
    pub fn len(&self) -> usize {
        match self {
            ModelInput::Texts(t) => t.len(),
            ModelInput::Vectors(v) => v.len(),
            ModelInput::Points(p) => p.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn kind(&self) -> &'static str {
        match self {
            ModelInput::Texts(_) => "texts",
            ModelInput::Vectors(_) => "vectors",
            ModelInput::Points(_) => "points",
        }
    }
}

/// Output of a transform, one entry per input row in input order.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelOutput {
    Vectors(Vec<Vec<f32>>),
    Positions(Vec<[f32; 2]>),
    Labels(Vec<i64>),
}

impl ModelOutput {
    pub fn len(&self) -> usize {
        match self {
            ModelOutput::Vectors(v) => v.len(),
            ModelOutput::Positions(p) => p.len(),
            ModelOutput::Labels(l) => l.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Knobs for a transform call
#[derive(Debug, Clone)]
pub struct TransformOptions {
    /// Rows processed per batch (only the encoder batches)
    pub batch_size: usize,
    /// When set, encoder batches are spilled to scratch files under this
    /// directory and reassembled after the last batch
    pub spill_dir: Option<PathBuf>,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            batch_size: 124,
            spill_dir: None,
        }
    }
}

/// The fit/transform capability every stage model implements
pub trait FitTransform {
    fn is_fitted(&self) -> bool;

    /// Whether `fit` must run before the first `transform`
    fn needs_fit(&self) -> bool {
        true
    }

    fn fit(&mut self, input: ModelInput<'_>) -> ModelResult<()>;

    fn transform(&self, input: ModelInput<'_>, options: &TransformOptions) -> ModelResult<ModelOutput>;
}

/// A persisted stage model
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageModel {
    Encoder(Encoder),
    Projector(Projector),
    OnlineProjector(OnlineProjector),
    Clusterer(Clusterer),
}

impl StageModel {
    fn inner(&self) -> &dyn FitTransform {
        match self {
            StageModel::Encoder(m) => m,
            StageModel::Projector(m) => m,
            StageModel::OnlineProjector(m) => m,
            StageModel::Clusterer(m) => m,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn FitTransform {
        match self {
            StageModel::Encoder(m) => m,
            StageModel::Projector(m) => m,
            StageModel::OnlineProjector(m) => m,
            StageModel::Clusterer(m) => m,
        }
    }

    /// The online projector, if this is one
    pub fn as_online_projector_mut(&mut self) -> Option<&mut OnlineProjector> {
        match self {
            StageModel::OnlineProjector(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_online_projector(&self) -> Option<&OnlineProjector> {
        match self {
            StageModel::OnlineProjector(p) => Some(p),
            _ => None,
        }
    }
}

impl FitTransform for StageModel {
    fn is_fitted(&self) -> bool {
        self.inner().is_fitted()
    }

    fn needs_fit(&self) -> bool {
        self.inner().needs_fit()
    }

    fn fit(&mut self, input: ModelInput<'_>) -> ModelResult<()> {
        self.inner_mut().fit(input)
    }

    fn transform(&self, input: ModelInput<'_>, options: &TransformOptions) -> ModelResult<ModelOutput> {
        self.inner().transform(input, options)
    }
}

/// A stage configuration that knows how to build its fresh, unfitted model
pub trait ModelConfig: StageConfig {
    fn build(&self) -> StageModel;
}

impl ModelConfig for EmbeddingConfig {
    fn build(&self) -> StageModel {
        StageModel::Encoder(Encoder::new(self.clone()))
    }
}

impl ModelConfig for ReductionConfig {
    fn build(&self) -> StageModel {
        match self {
            ReductionConfig::Pca(args) => StageModel::Projector(Projector::new(args.clone())),
            ReductionConfig::Parametric(args) => {
                StageModel::OnlineProjector(OnlineProjector::new(args.clone()))
            }
        }
    }
}

impl ModelConfig for ClusterConfig {
    fn build(&self) -> StageModel {
        match self {
            ClusterConfig::Dbscan(args) => StageModel::Clusterer(Clusterer::new(args.clone())),
        }
    }
}

fn expect_vectors<'a>(input: ModelInput<'a>, model: &str) -> ModelResult<&'a [Vec<f32>]> {
    match input {
        ModelInput::Vectors(v) => Ok(v),
        other => Err(ModelError::InputMismatch(format!(
            "{} expects vectors, got {}",
            model,
            other.kind()
        ))),
    }
}

/// Check every row has the same length, returning it.
fn uniform_dimension(vectors: &[Vec<f32>]) -> ModelResult<usize> {
    let dim = vectors.first().map(Vec::len).ok_or(ModelError::EmptyInput)?;
    if dim == 0 {
        return Err(ModelError::InputMismatch("zero-length vectors".into()));
    }
    for v in vectors {
        if v.len() != dim {
            return Err(ModelError::Dimension {
                expected: dim,
                found: v.len(),
            });
        }
    }
    Ok(dim)
}
