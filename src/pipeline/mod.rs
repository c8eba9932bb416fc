//! Pipeline orchestration
//!
//! [`PipelineContext`] owns the stores, the model registry, runtime settings
//! and the [`Gate`]. Every operation that reads the todo set and then writes
//! derived rows or artifacts runs under the gate; plot and statistics
//! queries do not.
//!
//! A stage pass resolves the current identity from configuration, loads or
//! builds the model, computes the todo set with one anti-join, fits and
//! transforms on the blocking pool, and commits its rows in one transaction.
//! Rows computed under identities that are no longer current stay in the
//! store until [`PipelineContext::collect_garbage`] or an explicit reset
//! removes them.

mod gate;
mod stage;

pub use gate::{Gate, GateGuard};

use crate::analysis::{self, ClusterSummary, LabelMismatch};
use crate::config::{ProjectConfig, Settings};
use crate::error::{PipelineError, PipelineResult};
use crate::lineage::{LineageSet, Stage};
use crate::registry::ModelRegistry;
use crate::storage::{
    write_atomic, ArtifactStore, CorpusUnit, FsArtifactStore, NewUnit, OpenStore, PipelineStore,
    PlotRow, Project, ProjectId, SqliteStore, UnitId,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Items newly materialized per stage by one extraction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExtractReport {
    pub embedded: usize,
    pub reduced: usize,
    pub clustered: usize,
}

impl ExtractReport {
    pub fn total(&self) -> usize {
        self.embedded + self.reduced + self.clustered
    }

    fn record(&mut self, stage: Stage, processed: usize) {
        match stage {
            Stage::Embedding => self.embedded = processed,
            Stage::Reduction => self.reduced = processed,
            Stage::Clustering => self.clustered = processed,
        }
    }
}

/// What a reset removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub stages: Vec<Stage>,
    /// Identity rows deleted (derived rows went with them)
    pub models_removed: usize,
    pub artifacts_removed: usize,
}

/// What garbage collection removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub models_removed: usize,
    pub artifacts_removed: usize,
}

/// Read-only summary of a project's materialized state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectStats {
    pub project: ProjectId,
    pub name: String,
    pub units: usize,
    pub embedded: usize,
    pub reduced: usize,
    pub clustered: usize,
    pub clusters: ClusterSummary,
    /// Identity rows stored for this project, current or not
    pub models: usize,
}

/// Everything a pipeline operation needs. Created once at start-up.
pub struct PipelineContext {
    pub(crate) store: Arc<dyn PipelineStore>,
    pub(crate) artifacts: Arc<dyn ArtifactStore>,
    pub(crate) registry: ModelRegistry,
    pub(crate) settings: Settings,
    pub(crate) gate: Gate,
}

impl PipelineContext {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        artifacts: Arc<dyn ArtifactStore>,
        settings: Settings,
    ) -> Self {
        let registry = ModelRegistry::new(store.clone(), artifacts.clone());
        Self {
            store,
            artifacts,
            registry,
            settings,
            gate: Gate::new(),
        }
    }

    /// Open the SQLite database and artifact directory named by `settings`.
    pub fn open(settings: Settings) -> PipelineResult<Self> {
        settings.validate()?;
        if let Some(parent) = settings.db_path.parent() {
            std::fs::create_dir_all(parent).map_err(crate::storage::StorageError::from)?;
        }
        let store = SqliteStore::open(&settings.db_path)?;
        let artifacts = FsArtifactStore::new(&settings.storage_root);
        tracing::info!(
            db = %settings.db_path.display(),
            storage = %settings.storage_root.display(),
            "opened pipeline context"
        );
        Ok(Self::new(Arc::new(store), Arc::new(artifacts), settings))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.store
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    // === Projects and units ===

    pub fn create_project(&self, name: &str, config: ProjectConfig) -> PipelineResult<Project> {
        config.validate()?;
        let project = self.store.create_project(name, &config)?;
        tracing::info!(project = %project.id, name, "created project");
        Ok(project)
    }

    /// Load a project, failing with `NotFound` if it does not exist.
    pub fn project(&self, id: ProjectId) -> PipelineResult<Project> {
        self.store
            .load_project(id)?
            .ok_or_else(|| PipelineError::NotFound(format!("project {}", id)))
    }

    pub fn list_projects(&self) -> PipelineResult<Vec<Project>> {
        Ok(self.store.list_projects()?)
    }

    /// Delete a project with its units, identities, derived rows and artifacts.
    pub async fn delete_project(&self, id: ProjectId) -> PipelineResult<()> {
        let _gate = self.gate.enter("delete_project").await;
        if !self.store.delete_project(id)? {
            return Err(PipelineError::NotFound(format!("project {}", id)));
        }
        self.artifacts.delete_project(id)?;
        tracing::info!(project = %id, "deleted project");
        Ok(())
    }

    /// Replace a project's configuration.
    ///
    /// Nothing is recomputed or invalidated here: the next extraction
    /// resolves new identities and processes their full todo sets.
    pub async fn set_config(&self, id: ProjectId, config: ProjectConfig) -> PipelineResult<Project> {
        config.validate()?;
        let _gate = self.gate.enter("set_config").await;
        if !self.store.update_config(id, &config)? {
            return Err(PipelineError::NotFound(format!("project {}", id)));
        }
        tracing::info!(project = %id, "updated configuration");
        self.project(id)
    }

    pub async fn add_units(&self, project: ProjectId, units: &[NewUnit]) -> PipelineResult<Vec<UnitId>> {
        self.project(project)?;
        let _gate = self.gate.enter("add_units").await;
        let ids = self.store.add_units(project, units)?;
        tracing::info!(project = %project, added = ids.len(), "ingested units");
        Ok(ids)
    }

    pub fn list_units(&self, project: ProjectId) -> PipelineResult<Vec<CorpusUnit>> {
        self.project(project)?;
        Ok(self.store.list_units(project)?)
    }

    /// Delete a unit and, by cascade, everything derived from it.
    pub async fn delete_unit(&self, unit: UnitId) -> PipelineResult<()> {
        let _gate = self.gate.enter("delete_unit").await;
        if !self.store.delete_unit(unit)? {
            return Err(PipelineError::NotFound(format!("unit {}", unit)));
        }
        Ok(())
    }

    pub async fn relabel_unit(&self, unit: UnitId, label: Option<&str>) -> PipelineResult<()> {
        let _gate = self.gate.enter("relabel_unit").await;
        if !self.store.relabel_unit(unit, label)? {
            return Err(PipelineError::NotFound(format!("unit {}", unit)));
        }
        Ok(())
    }

    // === Pipeline ===

    /// Current identities of every stage for a project.
    pub fn lineage(&self, project: ProjectId) -> PipelineResult<LineageSet> {
        LineageSet::resolve(&self.project(project)?.config)
    }

    /// Bring `stage` up to date, running every stage upstream of it first.
    /// Returns the number of items newly materialized for `stage` itself.
    pub async fn extract(&self, project: ProjectId, stage: Stage) -> PipelineResult<usize> {
        let gate = self.gate.enter("extract").await;
        let report = self.extract_locked(&gate, project, stage).await?;
        Ok(match stage {
            Stage::Embedding => report.embedded,
            Stage::Reduction => report.reduced,
            Stage::Clustering => report.clustered,
        })
    }

    /// Bring every stage up to date.
    pub async fn extract_all(&self, project: ProjectId) -> PipelineResult<ExtractReport> {
        let gate = self.gate.enter("extract").await;
        self.extract_locked(&gate, project, Stage::Clustering).await
    }

    pub(crate) async fn extract_locked(
        &self,
        gate: &GateGuard<'_>,
        project: ProjectId,
        stage: Stage,
    ) -> PipelineResult<ExtractReport> {
        let project = self.project(project)?;
        let lineage = LineageSet::resolve(&project.config)?;
        let started = Instant::now();

        let mut report = ExtractReport::default();
        for step in stage.through() {
            let processed = self.run_stage(gate, &project, &lineage, *step).await?;
            report.record(*step, processed);
        }
        tracing::info!(
            project = %project.id,
            stage = %stage,
            op = gate.op(),
            processed = report.total(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "extraction complete"
        );
        Ok(report)
    }

    /// Drop the current identity of `stage` and of every stage downstream
    /// of it: identity rows (with their derived rows) and artifacts.
    pub async fn reset(&self, project: ProjectId, stage: Stage) -> PipelineResult<ResetReport> {
        let gate = self.gate.enter("reset").await;
        self.reset_locked(&gate, project, stage)
    }

    fn reset_locked(
        &self,
        _gate: &GateGuard<'_>,
        project: ProjectId,
        stage: Stage,
    ) -> PipelineResult<ResetReport> {
        let lineage = self.lineage(project)?;
        let mut report = ResetReport {
            stages: stage.with_downstream().to_vec(),
            ..ResetReport::default()
        };

        // Downstream first so a failure never leaves children of a removed row.
        for step in stage.with_downstream().iter().rev() {
            let identity = lineage.get(*step);
            if let Some(row) = self.store.find_model(project, identity.as_str())? {
                if self.store.delete_model(row.id)? {
                    report.models_removed += 1;
                }
            }
            if self.registry.discard_artifact(project, identity.as_str())? {
                report.artifacts_removed += 1;
            }
        }
        tracing::info!(
            project = %project,
            stage = %stage,
            models = report.models_removed,
            artifacts = report.artifacts_removed,
            "reset stage"
        );
        Ok(report)
    }

    /// Refit reduction and clustering from scratch over the current
    /// embeddings.
    pub async fn recalculate(&self, project: ProjectId) -> PipelineResult<ExtractReport> {
        let gate = self.gate.enter("recalculate").await;
        self.reset_locked(&gate, project, Stage::Reduction)?;
        self.extract_locked(&gate, project, Stage::Clustering).await
    }

    /// Remove identity rows that are not on the project's current lineage,
    /// together with their derived rows, and artifacts that have no identity
    /// row.
    pub async fn collect_garbage(&self, project: ProjectId) -> PipelineResult<GcReport> {
        let _gate = self.gate.enter("collect_garbage").await;
        let lineage = self.lineage(project)?;
        let mut report = GcReport::default();

        let mut models = self.store.list_models(project)?;
        // Downstream stages first, matching reset.
        models.sort_by(|a, b| b.stage.cmp(&a.stage));
        let mut kept = Vec::new();
        for model in models {
            if lineage.contains(&model.hash) {
                kept.push(model.hash);
                continue;
            }
            if self.store.delete_model(model.id)? {
                report.models_removed += 1;
            }
        }

        for hash in self.artifacts.list(project)? {
            if kept.contains(&hash) {
                continue;
            }
            if self.registry.discard_artifact(project, &hash)? {
                report.artifacts_removed += 1;
            }
        }
        tracing::info!(
            project = %project,
            models = report.models_removed,
            artifacts = report.artifacts_removed,
            "collected garbage"
        );
        Ok(report)
    }

    // === Read-only views ===

    /// Positions under the current reduction identity, with cluster labels
    /// from the current clustering identity where computed. Empty before the
    /// first extraction.
    pub fn plot(&self, project: ProjectId) -> PipelineResult<Vec<PlotRow>> {
        let lineage = self.lineage(project)?;
        let Some(reduction) = self.store.find_model(project, lineage.reduction.as_str())? else {
            return Ok(Vec::new());
        };
        let cluster = self
            .store
            .find_model(project, lineage.clustering.as_str())?
            .map(|row| row.id);
        Ok(self.store.plot(reduction.id, cluster)?)
    }

    /// Write the plot view as JSON under the project's storage directory.
    pub fn export_plot(&self, project: ProjectId) -> PipelineResult<PathBuf> {
        let rows = self.plot(project)?;
        let path = self
            .settings
            .storage_root
            .join("projects")
            .join(project.to_string())
            .join("plots")
            .join(format!("plot_{}.json", project));
        let bytes = serde_json::to_vec_pretty(&rows).map_err(crate::storage::StorageError::from)?;
        write_atomic(&path, &bytes)?;
        tracing::info!(project = %project, rows = rows.len(), path = %path.display(), "exported plot");
        Ok(path)
    }

    pub fn stats(&self, project: ProjectId) -> PipelineResult<ProjectStats> {
        let record = self.project(project)?;
        let lineage = LineageSet::resolve(&record.config)?;

        let mut counts = [0usize; 3];
        let mut cluster_id = None;
        for (slot, stage) in Stage::ALL.iter().enumerate() {
            if let Some(row) = self.store.find_model(project, lineage.get(*stage).as_str())? {
                counts[slot] = self.store.count_derived(*stage, row.id)?;
                if *stage == Stage::Clustering {
                    cluster_id = Some(row.id);
                }
            }
        }
        let clusters = match cluster_id {
            Some(id) => ClusterSummary::from_counts(self.store.cluster_counts(id)?),
            None => ClusterSummary::default(),
        };

        Ok(ProjectStats {
            project,
            name: record.name,
            units: self.store.count_units(project)?,
            embedded: counts[0],
            reduced: counts[1],
            clustered: counts[2],
            clusters,
            models: self.store.list_models(project)?.len(),
        })
    }

    /// Units whose label disagrees with a clearly dominant label of their
    /// cluster. See [`analysis::label_mismatches`].
    pub fn mismatches(
        &self,
        project: ProjectId,
        cutoff: f32,
        max_count: usize,
    ) -> PipelineResult<Vec<LabelMismatch>> {
        if !(0.0..=1.0).contains(&cutoff) {
            return Err(PipelineError::Configuration(format!(
                "cutoff must lie in [0, 1], got {}",
                cutoff
            )));
        }
        let rows = self.plot(project)?;
        Ok(analysis::label_mismatches(&rows, cutoff, max_count))
    }
}
