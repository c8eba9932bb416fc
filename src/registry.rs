//! Model registry
//!
//! Binds a [`ModelIdentity`] to an identity row in the relational store and
//! to a serialized [`StageModel`] artifact. A model that has never been
//! saved is built fresh (unfitted) from its configuration.

use crate::error::{PipelineError, PipelineResult};
use crate::lineage::ModelIdentity;
use crate::model::{ModelConfig, StageModel};
use crate::storage::{ArtifactStore, ModelRow, PipelineStore, ProjectId, StorageError};
use std::sync::Arc;

pub struct ModelRegistry {
    store: Arc<dyn PipelineStore>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl ModelRegistry {
    pub fn new(store: Arc<dyn PipelineStore>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { store, artifacts }
    }

    /// Find or insert the identity row and load the model.
    ///
    /// Never writes an artifact: a freshly built model is only persisted by
    /// an explicit [`save`](Self::save).
    pub fn get_or_create<C: ModelConfig>(
        &self,
        project: ProjectId,
        identity: &ModelIdentity,
        config: &C,
    ) -> PipelineResult<(ModelRow, StageModel)> {
        let row = self
            .store
            .ensure_model(project, identity.stage, identity.as_str())?;

        let model: StageModel = match self.artifacts.read(project, identity.as_str())? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(StorageError::from)?,
            None => {
                tracing::debug!(
                    project = %project,
                    model = %identity,
                    "no artifact, building fresh model"
                );
                config.build()
            }
        };
        Ok((row, model))
    }

    /// Persist a model's artifact, replacing any previous one atomically.
    pub fn save(
        &self,
        project: ProjectId,
        identity: &ModelIdentity,
        model: &StageModel,
    ) -> PipelineResult<()> {
        let bytes = serde_json::to_vec(model).map_err(StorageError::from)?;
        self.artifacts.write(project, identity.as_str(), &bytes)?;
        tracing::debug!(project = %project, model = %identity, bytes = bytes.len(), "saved model artifact");
        Ok(())
    }

    /// Remove a model's artifact and identity row (with every derived row
    /// under it).
    pub fn delete(&self, project: ProjectId, identity: &ModelIdentity) -> PipelineResult<()> {
        match self.artifacts.delete(project, identity.as_str()) {
            Ok(()) => {}
            Err(StorageError::ArtifactNotFound(hash)) => {
                return Err(PipelineError::NotFound(format!("artifact {}", hash)))
            }
            Err(e) => return Err(e.into()),
        }
        if let Some(row) = self.store.find_model(project, identity.as_str())? {
            self.store.delete_model(row.id)?;
        }
        Ok(())
    }

    /// Remove the artifact if there is one. Returns whether one existed.
    pub fn discard_artifact(&self, project: ProjectId, hash: &str) -> PipelineResult<bool> {
        match self.artifacts.delete(project, hash) {
            Ok(()) => Ok(true),
            Err(StorageError::ArtifactNotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn has_artifact(&self, project: ProjectId, identity: &ModelIdentity) -> PipelineResult<bool> {
        Ok(self.artifacts.exists(project, identity.as_str())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddingConfig, ProjectConfig, ReductionConfig};
    use crate::lineage::LineageSet;
    use crate::model::{FitTransform, ModelInput};
    use crate::storage::{InMemoryArtifactStore, OpenStore, SqliteStore};

    fn setup() -> (ModelRegistry, Arc<dyn PipelineStore>, ProjectId) {
        let store: Arc<dyn PipelineStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        let project = store
            .create_project("registry", &ProjectConfig::default())
            .unwrap()
            .id;
        (ModelRegistry::new(store.clone(), artifacts), store, project)
    }

    #[test]
    fn fresh_model_when_no_artifact() {
        let (registry, store, project) = setup();
        let lineage = LineageSet::resolve(&ProjectConfig::default()).unwrap();

        let (row, model) = registry
            .get_or_create(project, &lineage.reduction, &ReductionConfig::default())
            .unwrap();
        assert_eq!(row.hash, lineage.reduction.hash);
        assert!(!model.is_fitted());
        // The row exists, the artifact does not.
        assert!(store.find_model(project, lineage.reduction.as_str()).unwrap().is_some());
        assert!(!registry.has_artifact(project, &lineage.reduction).unwrap());
    }

    #[test]
    fn saved_model_is_loaded_back() {
        let (registry, _store, project) = setup();
        let lineage = LineageSet::resolve(&ProjectConfig::default()).unwrap();
        let config = ReductionConfig::default();

        let (first_row, mut model) = registry
            .get_or_create(project, &lineage.reduction, &config)
            .unwrap();
        let vectors = vec![vec![0.0, 1.0], vec![1.0, 0.0], vec![2.0, 2.0]];
        model.fit(ModelInput::Vectors(&vectors)).unwrap();
        registry.save(project, &lineage.reduction, &model).unwrap();

        let (second_row, loaded) = registry
            .get_or_create(project, &lineage.reduction, &config)
            .unwrap();
        assert_eq!(first_row.id, second_row.id);
        assert!(loaded.is_fitted());
    }

    #[test]
    fn delete_requires_artifact() {
        let (registry, store, project) = setup();
        let lineage = LineageSet::resolve(&ProjectConfig::default()).unwrap();
        let (_, model) = registry
            .get_or_create(project, &lineage.embedding, &EmbeddingConfig::default())
            .unwrap();

        assert!(matches!(
            registry.delete(project, &lineage.embedding),
            Err(PipelineError::NotFound(_))
        ));

        registry.save(project, &lineage.embedding, &model).unwrap();
        registry.delete(project, &lineage.embedding).unwrap();
        assert!(store.find_model(project, lineage.embedding.as_str()).unwrap().is_none());
        assert!(!registry.has_artifact(project, &lineage.embedding).unwrap());
    }
}
