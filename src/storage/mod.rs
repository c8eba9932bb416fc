//! Storage backends
//!
//! Relational data (projects, units, identity rows, derived rows) lives behind
//! the `PipelineStore` trait, with `SqliteStore` as the persistent
//! implementation. Serialized models live behind `ArtifactStore`.

mod artifacts;
mod blob;
mod sqlite;
mod traits;

pub(crate) use artifacts::write_atomic;
pub use artifacts::{ArtifactStore, FsArtifactStore, InMemoryArtifactStore};
pub use sqlite::SqliteStore;
pub use traits::{
    CorpusUnit, EmbeddingRow, ModelRow, NewUnit, OpenStore, PipelineStore, PlotRow, Project,
    ProjectId, ReducedRow, StorageError, StorageResult, TrainingRow, UnitId,
};
