//! One pass of one stage: resolve todo, run the model, persist.

use super::gate::GateGuard;
use super::PipelineContext;
use crate::error::{PipelineError, PipelineResult};
use crate::lineage::{LineageSet, ModelIdentity, Stage};
use crate::model::{FitTransform, ModelInput, ModelOutput, ModelResult, StageModel, TransformOptions};
use crate::storage::{ModelRow, Project};
use std::time::Instant;

/// Model input owned by a blocking task.
enum OwnedInput {
    Texts(Vec<String>),
    Vectors(Vec<Vec<f32>>),
    Points(Vec<[f32; 2]>),
}

impl OwnedInput {
    fn as_input(&self) -> ModelInput<'_> {
        match self {
            OwnedInput::Texts(t) => ModelInput::Texts(t),
            OwnedInput::Vectors(v) => ModelInput::Vectors(v),
            OwnedInput::Points(p) => ModelInput::Points(p),
        }
    }
}

/// Result of running a model over a todo set
struct ModelRun {
    model: StageModel,
    fitted: bool,
    output: ModelOutput,
}

/// Fit (when the model needs it and is unfitted) and transform on the
/// blocking pool.
async fn fit_transform(
    mut model: StageModel,
    input: OwnedInput,
    options: TransformOptions,
) -> PipelineResult<ModelRun> {
    let run = tokio::task::spawn_blocking(move || -> ModelResult<ModelRun> {
        let input_ref = input.as_input();
        let mut fitted = false;
        if model.needs_fit() && !model.is_fitted() {
            model.fit(input_ref)?;
            fitted = true;
        }
        let output = model.transform(input_ref, &options)?;
        Ok(ModelRun {
            model,
            fitted,
            output,
        })
    })
    .await??;
    Ok(run)
}

fn length_mismatch(stage: Stage, expected: usize, got: usize) -> PipelineError {
    PipelineError::Internal(format!(
        "{} model returned {} rows for {} inputs",
        stage, got, expected
    ))
}

impl PipelineContext {
    /// Run one stage pass for the current lineage. Returns the number of
    /// items newly materialized.
    pub(crate) async fn run_stage(
        &self,
        _gate: &GateGuard<'_>,
        project: &Project,
        lineage: &LineageSet,
        stage: Stage,
    ) -> PipelineResult<usize> {
        let started = Instant::now();
        let processed = match stage {
            Stage::Embedding => self.embedding_pass(project, lineage).await?,
            Stage::Reduction => self.reduction_pass(project, lineage).await?,
            Stage::Clustering => self.clustering_pass(project, lineage).await?,
        };
        tracing::info!(
            project = %project.id,
            stage = %stage,
            model = %lineage.get(stage),
            processed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "stage pass complete"
        );
        Ok(processed)
    }

    fn transform_options(&self) -> TransformOptions {
        TransformOptions {
            batch_size: self.settings.batch_size,
            spill_dir: self
                .settings
                .use_disk_storage
                .then(|| self.settings.scratch_dir()),
        }
    }

    /// Identity row of the upstream stage. Its pass has already run in this
    /// sequence, so this only ever finds the row.
    fn upstream_row(&self, project: &Project, identity: &ModelIdentity) -> PipelineResult<ModelRow> {
        Ok(self
            .store
            .ensure_model(project.id, identity.stage, identity.as_str())?)
    }

    /// Persist the artifact after a fit, and on first use of an identity.
    fn persist_model(
        &self,
        project: &Project,
        identity: &ModelIdentity,
        model: &StageModel,
        fitted: bool,
    ) -> PipelineResult<()> {
        if fitted || !self.registry.has_artifact(project.id, identity)? {
            self.registry.save(project.id, identity, model)?;
        }
        Ok(())
    }

    fn log_todo(&self, project: &Project, identity: &ModelIdentity, todo: usize) {
        tracing::debug!(project = %project.id, stage = %identity.stage, model = %identity, todo, "resolved todo");
    }

    async fn embedding_pass(&self, project: &Project, lineage: &LineageSet) -> PipelineResult<usize> {
        let identity = &lineage.embedding;
        let (row, model) =
            self.registry
                .get_or_create(project.id, identity, &project.config.embedding_config)?;

        let todo = self.store.todo_units(project.id, row.id)?;
        self.log_todo(project, identity, todo.len());
        if todo.is_empty() {
            return Ok(0);
        }

        let (units, texts): (Vec<_>, Vec<_>) = todo.into_iter().map(|u| (u.id, u.text)).unzip();
        let run = fit_transform(model, OwnedInput::Texts(texts), self.transform_options()).await?;
        let vectors = match run.output {
            ModelOutput::Vectors(v) if v.len() == units.len() => v,
            other => return Err(length_mismatch(Stage::Embedding, units.len(), other.len())),
        };

        let rows: Vec<_> = units.into_iter().zip(vectors).collect();
        let inserted = self.store.insert_embeddings(row.id, &rows)?;
        self.persist_model(project, identity, &run.model, run.fitted)?;
        Ok(inserted)
    }

    async fn reduction_pass(&self, project: &Project, lineage: &LineageSet) -> PipelineResult<usize> {
        let identity = &lineage.reduction;
        let upstream = self.upstream_row(project, &lineage.embedding)?;
        let (row, model) =
            self.registry
                .get_or_create(project.id, identity, &project.config.reduction_config)?;

        let todo = self.store.todo_embeddings(upstream.id, row.id)?;
        self.log_todo(project, identity, todo.len());
        if todo.is_empty() {
            return Ok(0);
        }

        let (ids, vectors): (Vec<_>, Vec<_>) = todo.into_iter().map(|e| (e.id, e.vector)).unzip();
        let run = fit_transform(model, OwnedInput::Vectors(vectors), TransformOptions::default()).await?;
        let positions = match run.output {
            ModelOutput::Positions(p) if p.len() == ids.len() => p,
            other => return Err(length_mismatch(Stage::Reduction, ids.len(), other.len())),
        };

        let rows: Vec<_> = ids.into_iter().zip(positions).collect();
        let inserted = self.store.insert_reduced(row.id, &rows)?;
        self.persist_model(project, identity, &run.model, run.fitted)?;
        Ok(inserted)
    }

    async fn clustering_pass(&self, project: &Project, lineage: &LineageSet) -> PipelineResult<usize> {
        let identity = &lineage.clustering;
        let upstream = self.upstream_row(project, &lineage.reduction)?;
        let (row, model) =
            self.registry
                .get_or_create(project.id, identity, &project.config.cluster_config)?;

        let todo = self.store.todo_reduced(upstream.id, row.id)?;
        self.log_todo(project, identity, todo.len());
        if todo.is_empty() {
            return Ok(0);
        }

        let (ids, points): (Vec<_>, Vec<_>) = todo.into_iter().map(|r| (r.id, r.position)).unzip();
        let run = fit_transform(model, OwnedInput::Points(points), TransformOptions::default()).await?;
        let labels = match run.output {
            ModelOutput::Labels(l) if l.len() == ids.len() => l,
            other => return Err(length_mismatch(Stage::Clustering, ids.len(), other.len())),
        };

        let rows: Vec<_> = ids.into_iter().zip(labels).collect();
        let inserted = self.store.insert_clusters(row.id, &rows)?;
        self.persist_model(project, identity, &run.model, run.fitted)?;
        Ok(inserted)
    }
}
