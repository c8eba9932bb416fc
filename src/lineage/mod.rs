//! Content-addressed model identities
//!
//! Every stage of the pipeline is keyed by a [`ModelIdentity`] whose hash
//! covers the stage's own configuration *and* the identity of the stage
//! upstream of it. Changing the embedding configuration therefore yields new
//! reduction and clustering identities as well, and nothing computed under
//! the old lineage can be mistaken for current output.

mod canonical;

use crate::config::ProjectConfig;
use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

pub(crate) use canonical::canonical_json;

/// A step in the derived-data pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Embedding,
    Reduction,
    Clustering,
}

impl Stage {
    /// All stages in dependency order.
    pub const ALL: [Stage; 3] = [Stage::Embedding, Stage::Reduction, Stage::Clustering];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Embedding => "embedding",
            Stage::Reduction => "reduction",
            Stage::Clustering => "clustering",
        }
    }

    /// The stage whose output this stage consumes.
    pub fn upstream(&self) -> Option<Stage> {
        match self {
            Stage::Embedding => None,
            Stage::Reduction => Some(Stage::Embedding),
            Stage::Clustering => Some(Stage::Reduction),
        }
    }

    /// This stage followed by every stage that depends on it.
    pub fn with_downstream(&self) -> &'static [Stage] {
        match self {
            Stage::Embedding => &Stage::ALL,
            Stage::Reduction => &Stage::ALL[1..],
            Stage::Clustering => &Stage::ALL[2..],
        }
    }

    /// Every stage up to and including this one, in dependency order.
    pub fn through(&self) -> &'static [Stage] {
        match self {
            Stage::Embedding => &Stage::ALL[..1],
            Stage::Reduction => &Stage::ALL[..2],
            Stage::Clustering => &Stage::ALL,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "embedding" | "embeddings" => Ok(Stage::Embedding),
            "reduction" | "reduced" => Ok(Stage::Reduction),
            "clustering" | "clusters" | "cluster" => Ok(Stage::Clustering),
            other => Err(format!("unknown stage '{}'", other)),
        }
    }
}

/// Identity of one stage's model under a full configuration lineage.
///
/// Two identities are equal iff their configuration lineages are
/// bit-identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelIdentity {
    pub stage: Stage,
    pub hash: String,
}

impl ModelIdentity {
    pub fn as_str(&self) -> &str {
        &self.hash
    }
}

impl fmt::Display for ModelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash)
    }
}

/// A stage configuration that can be content-hashed.
pub trait StageConfig: Serialize {
    /// The stage this configuration belongs to.
    const STAGE: Stage;

    /// Short model kind name, embedded in the identity string.
    fn model_name(&self) -> &'static str;
}

/// The record that is actually hashed: the stage, a digest of its own
/// configuration, and the upstream identity it was derived from.
#[derive(Serialize)]
struct Lineage<'a> {
    stage: Stage,
    config_hash: String,
    upstream: Option<&'a str>,
}

fn sha256_hex(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

fn to_canonical<T: Serialize>(value: &T) -> PipelineResult<String> {
    let value = serde_json::to_value(value)
        .map_err(|e| PipelineError::Configuration(format!("configuration is not hashable: {}", e)))?;
    Ok(canonical_json(&value))
}

/// Compute the identity of a stage configuration chained to its upstream.
///
/// Pure and deterministic across process restarts. Fails only when the
/// configuration cannot be represented as JSON.
pub fn hash_stage<C: StageConfig>(
    config: &C,
    upstream: Option<&ModelIdentity>,
) -> PipelineResult<ModelIdentity> {
    debug_assert_eq!(
        upstream.map(|u| u.stage),
        C::STAGE.upstream(),
        "upstream identity must belong to the preceding stage"
    );

    let lineage = Lineage {
        stage: C::STAGE,
        config_hash: sha256_hex(&to_canonical(config)?),
        upstream: upstream.map(|u| u.hash.as_str()),
    };
    let digest = sha256_hex(&to_canonical(&lineage)?);

    Ok(ModelIdentity {
        stage: C::STAGE,
        hash: format!("{}_{}_{}", C::STAGE, config.model_name(), digest),
    })
}

/// The identities of all three stages for one project configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineageSet {
    pub embedding: ModelIdentity,
    pub reduction: ModelIdentity,
    pub clustering: ModelIdentity,
}

impl LineageSet {
    /// Resolve every stage identity, chaining each to its upstream.
    pub fn resolve(config: &ProjectConfig) -> PipelineResult<Self> {
        let embedding = hash_stage(&config.embedding_config, None)?;
        let reduction = hash_stage(&config.reduction_config, Some(&embedding))?;
        let clustering = hash_stage(&config.cluster_config, Some(&reduction))?;
        Ok(Self {
            embedding,
            reduction,
            clustering,
        })
    }

    pub fn get(&self, stage: Stage) -> &ModelIdentity {
        match stage {
            Stage::Embedding => &self.embedding,
            Stage::Reduction => &self.reduction,
            Stage::Clustering => &self.clustering,
        }
    }

    /// Whether `hash` names one of the current identities.
    pub fn contains(&self, hash: &str) -> bool {
        Stage::ALL.iter().any(|stage| self.get(*stage).hash == hash)
    }
}
