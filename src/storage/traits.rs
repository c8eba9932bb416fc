//! Storage trait definitions

use crate::config::ProjectConfig;
use crate::lineage::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Identifier of a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub i64);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ProjectId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Identifier of a corpus unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub i64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UnitId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// A project: a corpus plus the configuration its pipeline runs under
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub config: ProjectConfig,
    pub created_at: DateTime<Utc>,
}

/// A unit to be ingested
#[derive(Debug, Clone, PartialEq)]
pub struct NewUnit {
    pub text: String,
    pub label: Option<String>,
}

impl NewUnit {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// A stored corpus unit. Text is immutable; the label can be reassigned.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorpusUnit {
    pub id: UnitId,
    pub project: ProjectId,
    /// Ingestion order within the project
    pub position: i64,
    pub text: String,
    pub label: Option<String>,
}

/// Identity row binding a model hash to a project
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRow {
    pub id: i64,
    pub project: ProjectId,
    pub stage: Stage,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

/// An embedding materialized under some embedding model
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRow {
    pub id: i64,
    pub unit: UnitId,
    pub vector: Vec<f32>,
}

/// A 2-D position materialized under some reduction model
#[derive(Debug, Clone, PartialEq)]
pub struct ReducedRow {
    pub id: i64,
    pub unit: UnitId,
    pub position: [f32; 2],
}

/// Input to the training engine: one unit with its embedding and label
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingRow {
    pub unit: UnitId,
    pub vector: Vec<f32>,
    pub label: Option<String>,
}

/// One point of the plot view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlotRow {
    pub unit: UnitId,
    pub text: String,
    pub label: Option<String>,
    pub x: f32,
    pub y: f32,
    /// Cluster label, `None` until clustering has run for this point
    pub cluster: Option<i64>,
}

/// Relational storage for projects, units, model identities and derived rows.
///
/// Implementations must be thread-safe (Send + Sync). Every `insert_*` bulk
/// operation is all-or-nothing.
pub trait PipelineStore: Send + Sync {
    // === Project Operations ===

    fn create_project(&self, name: &str, config: &ProjectConfig) -> StorageResult<Project>;

    fn load_project(&self, id: ProjectId) -> StorageResult<Option<Project>>;

    fn list_projects(&self) -> StorageResult<Vec<Project>>;

    /// Replace a project's configuration. Returns false if the project does not exist.
    fn update_config(&self, id: ProjectId, config: &ProjectConfig) -> StorageResult<bool>;

    /// Delete a project with everything derived from it
    fn delete_project(&self, id: ProjectId) -> StorageResult<bool>;

    // === Unit Operations ===

    /// Append units in one transaction, preserving order
    fn add_units(&self, project: ProjectId, units: &[NewUnit]) -> StorageResult<Vec<UnitId>>;

    fn list_units(&self, project: ProjectId) -> StorageResult<Vec<CorpusUnit>>;

    fn count_units(&self, project: ProjectId) -> StorageResult<usize>;

    /// Delete a unit; its derived rows go with it
    fn delete_unit(&self, unit: UnitId) -> StorageResult<bool>;

    fn relabel_unit(&self, unit: UnitId, label: Option<&str>) -> StorageResult<bool>;

    // === Model Identity Operations ===

    fn find_model(&self, project: ProjectId, hash: &str) -> StorageResult<Option<ModelRow>>;

    /// Find or insert the identity row for `hash`
    fn ensure_model(&self, project: ProjectId, stage: Stage, hash: &str) -> StorageResult<ModelRow>;

    fn list_models(&self, project: ProjectId) -> StorageResult<Vec<ModelRow>>;

    /// Delete an identity row; derived rows under it go with it
    fn delete_model(&self, model_id: i64) -> StorageResult<bool>;

    // === Todo Resolution ===

    /// Units of `project` with no embedding under `model_id`
    fn todo_units(&self, project: ProjectId, model_id: i64) -> StorageResult<Vec<CorpusUnit>>;

    /// Embeddings under `upstream_id` with no position under `model_id`
    fn todo_embeddings(&self, upstream_id: i64, model_id: i64) -> StorageResult<Vec<EmbeddingRow>>;

    /// Positions under `upstream_id` with no cluster label under `model_id`
    fn todo_reduced(&self, upstream_id: i64, model_id: i64) -> StorageResult<Vec<ReducedRow>>;

    // === Derived Rows ===

    fn insert_embeddings(&self, model_id: i64, rows: &[(UnitId, Vec<f32>)]) -> StorageResult<usize>;

    /// Rows are `(embedding row id, position)`
    fn insert_reduced(&self, model_id: i64, rows: &[(i64, [f32; 2])]) -> StorageResult<usize>;

    /// Rows are `(reduced row id, cluster label)`
    fn insert_clusters(&self, model_id: i64, rows: &[(i64, i64)]) -> StorageResult<usize>;

    /// Number of derived rows materialized under a model
    fn count_derived(&self, stage: Stage, model_id: i64) -> StorageResult<usize>;

    /// Delete every derived row under a model (and, by cascade, whatever
    /// downstream rows were built on them)
    fn delete_derived(&self, stage: Stage, model_id: i64) -> StorageResult<usize>;

    // === Views ===

    /// Every unit of the project with its embedding under `embedding_id`
    fn training_rows(&self, project: ProjectId, embedding_id: i64) -> StorageResult<Vec<TrainingRow>>;

    /// Units positioned under `reduction_id`, with labels from `cluster_id` where present
    fn plot(&self, reduction_id: i64, cluster_id: Option<i64>) -> StorageResult<Vec<PlotRow>>;

    /// `(cluster label, member count)` under a clustering model, ordered by label
    fn cluster_counts(&self, cluster_id: i64) -> StorageResult<Vec<(i64, usize)>>;
}

/// Extension trait for opening stores from paths
pub trait OpenStore: PipelineStore + Sized {
    /// Open or create a store at the given path
    fn open(path: impl AsRef<Path>) -> StorageResult<Self>;

    /// Create an in-memory store (useful for testing)
    fn open_in_memory() -> StorageResult<Self>;
}
