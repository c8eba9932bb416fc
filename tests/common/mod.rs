//! Shared fixtures for pipeline integration tests

#![allow(dead_code)]

use cartograph::config::{DbscanArgs, HashingArgs, ParametricArgs};
use cartograph::{
    ClusterConfig, EmbeddingConfig, NewUnit, PipelineContext, ProjectConfig, ProjectId,
    ReductionConfig, Settings,
};
use tempfile::TempDir;

/// A pipeline over an on-disk database and artifact directory. The
/// directory lives as long as the fixture.
pub struct TestPipeline {
    pub ctx: PipelineContext,
    pub dir: TempDir,
}

pub fn pipeline() -> TestPipeline {
    pipeline_with(|_| {})
}

pub fn pipeline_with(tweak: impl FnOnce(&mut Settings)) -> TestPipeline {
    let dir = TempDir::new().expect("create temp dir");
    let mut settings = Settings::in_dir(dir.path());
    tweak(&mut settings);
    let ctx = PipelineContext::open(settings).expect("open pipeline");
    TestPipeline { ctx, dir }
}

pub fn hashing(dimensions: usize) -> EmbeddingConfig {
    EmbeddingConfig::Hashing(HashingArgs {
        dimensions,
        ngram: 3,
    })
}

/// Small hashing embeddings, PCA, and DBSCAN that forms clusters from pairs.
pub fn small_config() -> ProjectConfig {
    ProjectConfig {
        name: "test".into(),
        embedding_config: hashing(64),
        reduction_config: ReductionConfig::default(),
        cluster_config: ClusterConfig::Dbscan(DbscanArgs {
            eps: 0.5,
            min_samples: 2,
        }),
    }
}

/// Same as [`small_config`] with a trainable projector.
pub fn trainable_config() -> ProjectConfig {
    ProjectConfig {
        reduction_config: ReductionConfig::Parametric(ParametricArgs {
            hidden: 16,
            fit_epochs: 20,
            ..ParametricArgs::default()
        }),
        ..small_config()
    }
}

pub fn texts(texts: &[&str]) -> Vec<NewUnit> {
    texts.iter().map(|t| NewUnit::new(*t)).collect()
}

pub fn labelled(pairs: &[(&str, &str)]) -> Vec<NewUnit> {
    pairs
        .iter()
        .map(|(label, text)| NewUnit::new(*text).with_label(*label))
        .collect()
}

/// Ten short texts about two topics, labelled by topic.
pub fn two_topic_corpus() -> Vec<NewUnit> {
    labelled(&[
        ("weather", "rain falls over the hills"),
        ("weather", "a storm front brings heavy rain"),
        ("weather", "sunny skies and light wind"),
        ("weather", "snow expected overnight"),
        ("weather", "the forecast calls for fog"),
        ("cooking", "simmer the sauce for ten minutes"),
        ("cooking", "knead the dough until smooth"),
        ("cooking", "roast the vegetables with garlic"),
        ("cooking", "whisk eggs and sugar together"),
        ("cooking", "season the soup with pepper"),
    ])
}

pub async fn project_with(ctx: &PipelineContext, config: ProjectConfig, units: &[NewUnit]) -> ProjectId {
    let project = ctx.create_project("fixture", config).expect("create project");
    ctx.add_units(project.id, units).await.expect("add units");
    project.id
}
