//! Dynamic training of the online projector
//!
//! Two modes refine the reduction network in place of a refit:
//!
//! - **Cohesion** pulls units that share a label together with a triplet
//!   margin loss.
//! - **Correction** drags chosen units towards caller-supplied positions
//!   while a drift term holds every other unit near where it was.
//!
//! Training works on a copy of the network; the projector only sees the
//! result once the whole epoch loop has finished, and the artifact is saved
//! only then. Afterwards every position and cluster label under the current
//! reduction identity is regenerated.

pub mod loss;
pub mod optimizer;
mod trainer;

pub use trainer::{train_cohesion, train_correction, TrainOutcome, TrainingOptions};

use crate::error::{PipelineError, PipelineResult};
use crate::lineage::{LineageSet, Stage, StageConfig};
use crate::pipeline::{ExtractReport, PipelineContext};
use crate::storage::{CorpusUnit, ProjectId, TrainingRow, UnitId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Instant;

/// A requested position for one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub unit: UnitId,
    /// Must have exactly two coordinates
    pub target: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "corrections", rename_all = "snake_case")]
pub enum TrainingMode {
    Cohesion,
    Correction(Vec<Correction>),
}

impl TrainingMode {
    pub fn name(&self) -> &'static str {
        match self {
            TrainingMode::Cohesion => "cohesion",
            TrainingMode::Correction(_) => "correction",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRequest {
    pub mode: TrainingMode,
    /// Falls back to the settings' training defaults for the mode
    #[serde(default)]
    pub options: Option<TrainingOptions>,
}

impl TrainingRequest {
    pub fn cohesion() -> Self {
        Self {
            mode: TrainingMode::Cohesion,
            options: None,
        }
    }

    pub fn correction(corrections: Vec<Correction>) -> Self {
        Self {
            mode: TrainingMode::Correction(corrections),
            options: None,
        }
    }

    pub fn with_options(mut self, options: TrainingOptions) -> Self {
        self.options = Some(options);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingReport {
    pub mode: &'static str,
    /// Units that took part in training
    pub units: usize,
    pub epoch_losses: Vec<f32>,
    pub steps: u32,
    /// Rows rebuilt from the retrained projector
    pub regenerated: ExtractReport,
}

/// Training inputs in the shape the loops take
enum Prepared {
    Cohesion {
        vectors: Vec<Vec<f32>>,
        labels: Vec<usize>,
    },
    Correction {
        vectors: Vec<Vec<f32>>,
        targets: Vec<Option<[f32; 2]>>,
    },
}

impl Prepared {
    fn units(&self) -> usize {
        match self {
            Prepared::Cohesion { vectors, .. } | Prepared::Correction { vectors, .. } => vectors.len(),
        }
    }
}

fn prepare_cohesion(rows: Vec<TrainingRow>) -> PipelineResult<Prepared> {
    let mut index: BTreeMap<String, usize> = BTreeMap::new();
    let mut vectors = Vec::new();
    let mut labels = Vec::new();
    for row in rows {
        let Some(label) = row.label else { continue };
        let next = index.len();
        labels.push(*index.entry(label).or_insert(next));
        vectors.push(row.vector);
    }
    if index.len() < 2 {
        return Err(PipelineError::Precondition(format!(
            "cohesion training needs at least two distinct labels, found {}",
            index.len()
        )));
    }
    Ok(Prepared::Cohesion { vectors, labels })
}

fn prepare_correction(rows: Vec<TrainingRow>, corrections: &[Correction]) -> PipelineResult<Prepared> {
    if corrections.is_empty() {
        return Err(PipelineError::Precondition(
            "correction training needs at least one correction".into(),
        ));
    }
    let position: HashMap<UnitId, usize> = rows
        .iter()
        .enumerate()
        .map(|(i, row)| (row.unit, i))
        .collect();

    let mut targets = vec![None; rows.len()];
    for correction in corrections {
        let target: [f32; 2] = correction.target.as_slice().try_into().map_err(|_| {
            PipelineError::Precondition(format!(
                "target for unit {} has {} coordinates, expected 2",
                correction.unit,
                correction.target.len()
            ))
        })?;
        let &i = position.get(&correction.unit).ok_or_else(|| {
            PipelineError::Precondition(format!("unit {} is not part of the project", correction.unit))
        })?;
        targets[i] = Some(target);
    }

    let vectors = rows.into_iter().map(|row| row.vector).collect();
    Ok(Prepared::Correction { vectors, targets })
}

/// Checks a request can be answered from the project's units, before any
/// stage is brought up to date.
fn check_request(mode: &TrainingMode, units: &[CorpusUnit]) -> PipelineResult<()> {
    if units.is_empty() {
        return Err(PipelineError::Precondition("project has no units to train on".into()));
    }
    match mode {
        TrainingMode::Cohesion => {
            let labels: BTreeSet<&str> = units.iter().filter_map(|u| u.label.as_deref()).collect();
            if labels.len() < 2 {
                return Err(PipelineError::Precondition(format!(
                    "cohesion training needs at least two distinct labels, found {}",
                    labels.len()
                )));
            }
        }
        TrainingMode::Correction(corrections) => {
            if corrections.is_empty() {
                return Err(PipelineError::Precondition(
                    "correction training needs at least one correction".into(),
                ));
            }
            let known: HashSet<UnitId> = units.iter().map(|u| u.id).collect();
            for correction in corrections {
                if correction.target.len() != 2 {
                    return Err(PipelineError::Precondition(format!(
                        "target for unit {} has {} coordinates, expected 2",
                        correction.unit,
                        correction.target.len()
                    )));
                }
                if !known.contains(&correction.unit) {
                    return Err(PipelineError::Precondition(format!(
                        "unit {} is not part of the project",
                        correction.unit
                    )));
                }
            }
        }
    }
    Ok(())
}

impl PipelineContext {
    /// Refine the project's online projector and regenerate its positions
    /// and cluster labels.
    ///
    /// The configuration is read once the gate is held, so training always
    /// targets the lineage that is current when it runs. Fails with
    /// `Unsupported` before touching anything when the reduction model is
    /// not trainable, and with `Precondition` before any extraction when the
    /// request does not fit the project's units.
    pub async fn train(&self, project: ProjectId, request: TrainingRequest) -> PipelineResult<TrainingReport> {
        let gate = self.gate.enter("train").await;
        let started = Instant::now();

        let record = self.project(project)?;
        if !record.config.reduction_config.is_trainable() {
            return Err(PipelineError::Unsupported(format!(
                "reduction model '{}' cannot be trained",
                record.config.reduction_config.model_name()
            )));
        }
        let options = match (&request.options, &request.mode) {
            (Some(options), _) => options.clone(),
            (None, TrainingMode::Cohesion) => TrainingOptions::cohesion(&self.settings.training),
            (None, TrainingMode::Correction(_)) => TrainingOptions::correction(&self.settings.training),
        };
        options.validate()?;
        check_request(&request.mode, &self.store.list_units(project)?)?;
        let lineage = LineageSet::resolve(&record.config)?;

        // Embeddings and the fitted projector must exist before training.
        self.extract_locked(&gate, project, Stage::Reduction).await?;

        let embedding = self
            .store
            .find_model(project, lineage.embedding.as_str())?
            .ok_or_else(|| PipelineError::NotFound(format!("model {}", lineage.embedding)))?;
        let rows = self.store.training_rows(project, embedding.id)?;
        if rows.is_empty() {
            return Err(PipelineError::Precondition("no embedded units to train on".into()));
        }

        let prepared = match &request.mode {
            TrainingMode::Cohesion => prepare_cohesion(rows)?,
            TrainingMode::Correction(corrections) => prepare_correction(rows, corrections)?,
        };
        let units = prepared.units();

        let (reduction, mut model) = self.registry.get_or_create(
            project,
            &lineage.reduction,
            &record.config.reduction_config,
        )?;
        let network = model
            .as_online_projector()
            .and_then(|p| p.network())
            .ok_or_else(|| PipelineError::Precondition("projector has not been fitted".into()))?
            .try_clone()?;

        tracing::info!(
            project = %project,
            model = %lineage.reduction,
            mode = request.mode.name(),
            units,
            epochs = options.epochs,
            "training started"
        );
        let outcome = tokio::task::spawn_blocking(move || match prepared {
            Prepared::Cohesion { vectors, labels } => train_cohesion(network, &vectors, &labels, &options),
            Prepared::Correction { vectors, targets } => {
                train_correction(network, &vectors, &targets, &options)
            }
        })
        .await??;

        if let Some(projector) = model.as_online_projector_mut() {
            projector.replace_network(outcome.network)?;
        }

        // Drop what the old network produced before the new one is stored:
        // if the save fails, the old artifact stays and its positions are
        // simply recomputed on the next extraction.
        let dropped = self.store.delete_derived(Stage::Reduction, reduction.id)?;
        self.registry
            .discard_artifact(project, lineage.clustering.as_str())?;
        tracing::debug!(project = %project, dropped, "invalidated positions");
        self.registry.save(project, &lineage.reduction, &model)?;

        let regenerated = ExtractReport {
            embedded: 0,
            reduced: self
                .run_stage(&gate, &record, &lineage, Stage::Reduction)
                .await?,
            clustered: self
                .run_stage(&gate, &record, &lineage, Stage::Clustering)
                .await?,
        };

        tracing::info!(
            project = %project,
            mode = request.mode.name(),
            steps = outcome.steps,
            regenerated = regenerated.total(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "training complete"
        );
        Ok(TrainingReport {
            mode: request.mode.name(),
            units,
            epoch_losses: outcome.epoch_losses,
            steps: outcome.steps,
            regenerated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ClusterConfig, DbscanArgs, EmbeddingConfig, HashingArgs, ParametricArgs, ProjectConfig,
        ReductionConfig, Settings,
    };
    use crate::storage::{
        ArtifactStore, InMemoryArtifactStore, NewUnit, SqliteStore, StorageError, StorageResult,
    };
    use crate::storage::OpenStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// In-memory artifacts whose writes can be made to fail.
    #[derive(Default)]
    struct FlakyArtifacts {
        inner: InMemoryArtifactStore,
        fail_writes: AtomicBool,
    }

    impl ArtifactStore for FlakyArtifacts {
        fn read(&self, project: ProjectId, hash: &str) -> StorageResult<Option<Vec<u8>>> {
            self.inner.read(project, hash)
        }

        fn write(&self, project: ProjectId, hash: &str, bytes: &[u8]) -> StorageResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.inner.write(project, hash, bytes)
        }

        fn delete(&self, project: ProjectId, hash: &str) -> StorageResult<()> {
            self.inner.delete(project, hash)
        }

        fn exists(&self, project: ProjectId, hash: &str) -> StorageResult<bool> {
            self.inner.exists(project, hash)
        }

        fn list(&self, project: ProjectId) -> StorageResult<Vec<String>> {
            self.inner.list(project)
        }

        fn delete_project(&self, project: ProjectId) -> StorageResult<()> {
            self.inner.delete_project(project)
        }
    }

    fn context(artifacts: Arc<FlakyArtifacts>) -> PipelineContext {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let dir = std::env::temp_dir().join("cartograph-training-unit");
        PipelineContext::new(store, artifacts, Settings::in_dir(dir))
    }

    fn trainable(dimensions: usize) -> ProjectConfig {
        ProjectConfig {
            embedding_config: EmbeddingConfig::Hashing(HashingArgs { dimensions, ngram: 3 }),
            reduction_config: ReductionConfig::Parametric(ParametricArgs {
                hidden: 8,
                fit_epochs: 5,
                ..ParametricArgs::default()
            }),
            cluster_config: ClusterConfig::Dbscan(DbscanArgs {
                eps: 0.5,
                min_samples: 2,
            }),
            ..ProjectConfig::default()
        }
    }

    fn quick() -> TrainingOptions {
        TrainingOptions {
            epochs: 2,
            batch_size: 4,
            learning_rate: 0.01,
            lambda: 1.0,
            triplets_per_label: 4,
            margin: 1.0,
            seed: 1,
        }
    }

    async fn labelled_project(ctx: &PipelineContext, config: ProjectConfig) -> ProjectId {
        let project = ctx.create_project("training", config).unwrap().id;
        let units: Vec<NewUnit> = [
            ("sea", "waves on the shore"),
            ("sea", "salt water and tides"),
            ("sea", "a harbour full of boats"),
            ("hill", "grass on the slope"),
            ("hill", "a path up the ridge"),
            ("hill", "sheep on the high pasture"),
        ]
        .iter()
        .map(|(label, text)| NewUnit::new(*text).with_label(*label))
        .collect();
        ctx.add_units(project, &units).await.unwrap();
        project
    }

    fn pin_first(ctx: &PipelineContext, project: ProjectId) -> TrainingRequest {
        let unit = ctx.list_units(project).unwrap()[0].id;
        TrainingRequest::correction(vec![Correction {
            unit,
            target: vec![5.0, 5.0],
        }])
        .with_options(quick())
    }

    #[tokio::test]
    async fn training_queued_behind_a_config_change_uses_the_new_lineage() {
        let artifacts = Arc::new(FlakyArtifacts::default());
        let ctx = Arc::new(context(artifacts.clone()));
        let project = labelled_project(&ctx, trainable(32)).await;
        ctx.extract_all(project).await.unwrap();
        let old = ctx.lineage(project).unwrap();
        let old_bytes = artifacts.read(project, old.reduction.as_str()).unwrap().unwrap();
        let request = pin_first(&ctx, project);

        let held = ctx.gate.enter("test").await;
        let reconfigure = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.set_config(project, trainable(48)).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let train = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.train(project, request).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        drop(held);

        reconfigure.await.unwrap().unwrap();
        let report = train.await.unwrap().unwrap();

        let current = ctx.lineage(project).unwrap();
        assert_ne!(current.reduction, old.reduction);
        assert_eq!(report.regenerated.reduced, 6);
        assert!(artifacts.exists(project, current.reduction.as_str()).unwrap());
        assert_eq!(
            artifacts.read(project, old.reduction.as_str()).unwrap().unwrap(),
            old_bytes
        );
        assert_eq!(ctx.stats(project).unwrap().reduced, 6);
    }

    #[tokio::test]
    async fn failed_save_keeps_the_prior_artifact_and_recomputes_positions() {
        let artifacts = Arc::new(FlakyArtifacts::default());
        let ctx = context(artifacts.clone());
        let project = labelled_project(&ctx, trainable(32)).await;
        ctx.extract_all(project).await.unwrap();
        let lineage = ctx.lineage(project).unwrap();
        let before_bytes = artifacts.read(project, lineage.reduction.as_str()).unwrap().unwrap();
        let before = ctx.plot(project).unwrap();

        artifacts.fail_writes.store(true, Ordering::SeqCst);
        let result = ctx.train(project, pin_first(&ctx, project)).await;
        assert!(matches!(result, Err(PipelineError::Storage(_))));
        assert_eq!(
            artifacts.read(project, lineage.reduction.as_str()).unwrap().unwrap(),
            before_bytes
        );

        // Positions from the old network were dropped, so the next extraction
        // rebuilds them from the artifact that is still stored.
        artifacts.fail_writes.store(false, Ordering::SeqCst);
        let report = ctx.extract_all(project).await.unwrap();
        assert_eq!(report, ExtractReport { embedded: 0, reduced: 6, clustered: 6 });
        let after = ctx.plot(project).unwrap();
        assert_eq!(after.len(), before.len());
        for (a, b) in after.iter().zip(&before) {
            assert_eq!(a.unit, b.unit);
            assert!((a.x - b.x).abs() < 1e-5 && (a.y - b.y).abs() < 1e-5);
        }
    }

    #[tokio::test]
    async fn malformed_requests_fail_before_any_extraction() {
        let ctx = context(Arc::new(FlakyArtifacts::default()));
        let project = labelled_project(&ctx, trainable(32)).await;
        let unit = ctx.list_units(project).unwrap()[0].id;

        let requests = [
            TrainingRequest::correction(Vec::new()),
            TrainingRequest::correction(vec![Correction {
                unit,
                target: vec![1.0],
            }]),
            TrainingRequest::correction(vec![Correction {
                unit: UnitId(9999),
                target: vec![1.0, 1.0],
            }]),
        ];
        for request in requests {
            assert!(matches!(
                ctx.train(project, request).await,
                Err(PipelineError::Precondition(_))
            ));
        }
        assert_eq!(ctx.stats(project).unwrap().embedded, 0);
        assert!(ctx.store().list_models(project).unwrap().is_empty());
    }

    fn row(unit: i64, label: Option<&str>) -> TrainingRow {
        TrainingRow {
            unit: UnitId(unit),
            vector: vec![unit as f32, 1.0],
            label: label.map(str::to_string),
        }
    }

    #[test]
    fn cohesion_skips_unlabelled_units() {
        let rows = vec![row(1, Some("a")), row(2, None), row(3, Some("b")), row(4, Some("a"))];
        match prepare_cohesion(rows).unwrap() {
            Prepared::Cohesion { vectors, labels } => {
                assert_eq!(vectors.len(), 3);
                assert_eq!(labels, vec![0, 1, 0]);
            }
            Prepared::Correction { .. } => panic!("wrong mode"),
        }
    }

    #[test]
    fn cohesion_needs_two_labels() {
        let rows = vec![row(1, Some("a")), row(2, Some("a")), row(3, None)];
        assert!(matches!(
            prepare_cohesion(rows),
            Err(PipelineError::Precondition(_))
        ));
    }

    #[test]
    fn correction_places_targets_by_unit() {
        let rows = vec![row(10, None), row(11, None), row(12, None)];
        let corrections = vec![Correction {
            unit: UnitId(11),
            target: vec![3.0, 4.0],
        }];
        match prepare_correction(rows, &corrections).unwrap() {
            Prepared::Correction { targets, .. } => {
                assert_eq!(targets, vec![None, Some([3.0, 4.0]), None]);
            }
            Prepared::Cohesion { .. } => panic!("wrong mode"),
        }
    }

    #[test]
    fn correction_rejects_bad_input() {
        let rows = || vec![row(1, None), row(2, None)];
        let unknown = vec![Correction {
            unit: UnitId(7),
            target: vec![0.0, 0.0],
        }];
        let wrong_dim = vec![Correction {
            unit: UnitId(1),
            target: vec![0.0, 0.0, 0.0],
        }];
        for corrections in [unknown, wrong_dim, Vec::new()] {
            assert!(matches!(
                prepare_correction(rows(), &corrections),
                Err(PipelineError::Precondition(_))
            ));
        }
    }

    #[test]
    fn request_parses_from_json() {
        let request: TrainingRequest = serde_json::from_str(
            r#"{"mode": {"mode": "correction", "corrections": [{"unit": 3, "target": [10.0, 5.0]}]}}"#,
        )
        .unwrap();
        assert_eq!(
            request,
            TrainingRequest::correction(vec![Correction {
                unit: UnitId(3),
                target: vec![10.0, 5.0],
            }])
        );
    }
}
