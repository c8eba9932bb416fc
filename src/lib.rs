//! Cartograph: incremental embedding, projection and clustering of text corpora
//!
//! A project's corpus flows through three stages (embedding, 2-D reduction,
//! clustering). Every stage output is cached under a content-addressed
//! model identity that covers the stage's configuration and its upstream
//! lineage, so only work that is actually missing gets computed.
//!
//! # Core Concepts
//!
//! - **Lineage**: SHA-256 identities chained from stage to stage
//! - **Todo resolution**: one anti-join per stage finds units lacking output
//! - **Model registry**: identity rows plus serialized, atomically written
//!   model artifacts
//! - **Dynamic training**: cohesion and correction modes refine a trainable
//!   projector without a full refit
//!
//! # Example
//!
//! ```no_run
//! use cartograph::{NewUnit, PipelineContext, ProjectConfig, Settings};
//!
//! # async fn demo() -> cartograph::PipelineResult<()> {
//! let ctx = PipelineContext::open(Settings::in_dir("/tmp/cartograph"))?;
//! let project = ctx.create_project("demo", ProjectConfig::default())?;
//! ctx.add_units(project.id, &[NewUnit::new("first"), NewUnit::new("second")]).await?;
//! let report = ctx.extract_all(project.id).await?;
//! println!("embedded {}", report.embedded);
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod config;
mod error;
pub mod lineage;
pub mod model;
pub mod pipeline;
pub mod registry;
pub mod storage;
pub mod training;

pub use analysis::{ClusterSummary, LabelMismatch};
pub use config::{ClusterConfig, EmbeddingConfig, ProjectConfig, ReductionConfig, Settings};
pub use error::{PipelineError, PipelineResult};
pub use lineage::{hash_stage, LineageSet, ModelIdentity, Stage};
pub use model::{FitTransform, ModelError, StageModel};
pub use pipeline::{ExtractReport, GcReport, PipelineContext, ProjectStats, ResetReport};
pub use registry::ModelRegistry;
pub use storage::{
    ArtifactStore, FsArtifactStore, InMemoryArtifactStore, NewUnit, OpenStore, PipelineStore,
    PlotRow, ProjectId, SqliteStore, StorageError, StorageResult, UnitId,
};
pub use training::{Correction, TrainingMode, TrainingOptions, TrainingReport, TrainingRequest};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
