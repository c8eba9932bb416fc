//! Training loops over an owned projection network
//!
//! Both loops take the network by value, run a fixed number of epochs with
//! candle autograd and hand back the refined network. The caller decides
//! whether to swap it into the projector.

use super::loss::{mse, triplet_margin};
use super::optimizer::{Adam, AdamConfig};
use crate::config::TrainingDefaults;
use crate::error::{PipelineError, PipelineResult};
use crate::model::{input_tensor, position_tensor, Mlp, ModelResult};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hyperparameters of one training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingOptions {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// Weight of the drift term (correction mode)
    pub lambda: f32,
    /// Triplets drawn per label per batch (cohesion mode)
    pub triplets_per_label: usize,
    pub margin: f32,
    /// Seeds batch shuffling and triplet sampling
    pub seed: u64,
}

impl TrainingOptions {
    pub fn cohesion(defaults: &TrainingDefaults) -> Self {
        Self {
            epochs: defaults.epochs,
            batch_size: defaults.cohesion_batch_size,
            learning_rate: defaults.cohesion_learning_rate,
            lambda: defaults.lambda,
            triplets_per_label: defaults.triplets_per_label,
            margin: defaults.margin,
            seed: 42,
        }
    }

    pub fn correction(defaults: &TrainingDefaults) -> Self {
        Self {
            batch_size: defaults.correction_batch_size,
            learning_rate: defaults.correction_learning_rate,
            ..Self::cohesion(defaults)
        }
    }

    pub fn validate(&self) -> PipelineResult<()> {
        let invalid = |msg: &str| Err(PipelineError::Configuration(msg.to_string()));
        if self.epochs == 0 {
            return invalid("epochs must be > 0");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be > 0");
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return invalid("learning_rate must be positive");
        }
        if !(self.lambda.is_finite() && self.lambda >= 0.0) {
            return invalid("lambda must be >= 0");
        }
        if self.triplets_per_label == 0 {
            return invalid("triplets_per_label must be > 0");
        }
        Ok(())
    }
}

/// A trained network and how the run went
#[derive(Debug)]
pub struct TrainOutcome {
    pub network: Mlp,
    /// Mean batch loss per epoch
    pub epoch_losses: Vec<f32>,
    /// Optimizer steps taken
    pub steps: u32,
}

fn index_tensor(indices: &[usize]) -> ModelResult<Tensor> {
    let ids: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
    Ok(Tensor::from_vec(ids, indices.len(), &Device::Cpu)?)
}

/// Pull same-label points together and push other labels apart.
///
/// `labels[i]` is the label index of `vectors[i]`. Triplets are formed inside
/// each batch: for every label present, `triplets_per_label` anchors and
/// positives are drawn with replacement from that label and as many
/// negatives from the other labels in the batch. Batches holding a single
/// label contribute nothing.
pub fn train_cohesion(
    network: Mlp,
    vectors: &[Vec<f32>],
    labels: &[usize],
    options: &TrainingOptions,
) -> ModelResult<TrainOutcome> {
    debug_assert_eq!(vectors.len(), labels.len());
    let inputs = input_tensor(vectors, network.input_dim())?;
    let mut adam = Adam::new(AdamConfig::with_learning_rate(options.learning_rate), network.vars())?;
    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut order: Vec<usize> = (0..vectors.len()).collect();
    let mut epoch_losses = Vec::with_capacity(options.epochs);

    for epoch in 0..options.epochs {
        order.shuffle(&mut rng);
        let mut total = 0.0;
        let mut batches = 0usize;

        for batch in order.chunks(options.batch_size) {
            let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
            for (local, &i) in batch.iter().enumerate() {
                groups.entry(labels[i]).or_default().push(local);
            }
            if groups.len() < 2 {
                continue;
            }

            let (mut anchors, mut positives, mut negatives) = (Vec::new(), Vec::new(), Vec::new());
            for (label, members) in &groups {
                let others: Vec<usize> = (0..batch.len())
                    .filter(|&local| labels[batch[local]] != *label)
                    .collect();
                for _ in 0..options.triplets_per_label {
                    // Non-empty by construction: every group has a member and
                    // there are at least two groups.
                    if let (Some(&a), Some(&p), Some(&n)) = (
                        members.choose(&mut rng),
                        members.choose(&mut rng),
                        others.choose(&mut rng),
                    ) {
                        anchors.push(a);
                        positives.push(p);
                        negatives.push(n);
                    }
                }
            }

            let projected = network.forward(&inputs.index_select(&index_tensor(batch)?, 0)?)?;
            let pick = |locals: &[usize]| -> ModelResult<Tensor> {
                Ok(projected.index_select(&index_tensor(locals)?, 0)?)
            };
            let loss = triplet_margin(&pick(&anchors)?, &pick(&positives)?, &pick(&negatives)?, options.margin)?;
            total += loss.to_scalar::<f32>()?;
            adam.step(&loss)?;
            batches += 1;
        }

        let mean = if batches > 0 { total / batches as f32 } else { 0.0 };
        tracing::info!(mode = "cohesion", epoch, loss = mean, batches, "training epoch");
        epoch_losses.push(mean);
    }

    Ok(TrainOutcome {
        network,
        epoch_losses,
        steps: adam.steps(),
    })
}

/// Move corrected points towards their targets while holding the rest in
/// place.
///
/// `targets[i]` is `Some` for corrected points. Before the first epoch every
/// point's current projection is recorded; each batch then minimizes
/// `mse(corrected, targets) + lambda * mse(others, recorded)`.
pub fn train_correction(
    network: Mlp,
    vectors: &[Vec<f32>],
    targets: &[Option<[f32; 2]>],
    options: &TrainingOptions,
) -> ModelResult<TrainOutcome> {
    debug_assert_eq!(vectors.len(), targets.len());
    let inputs = input_tensor(vectors, network.input_dim())?;
    let snapshot = network.forward(&inputs)?.detach();
    let wanted = position_tensor(&targets.iter().map(|t| t.unwrap_or([0.0, 0.0])).collect::<Vec<_>>())?;

    let mut adam = Adam::new(AdamConfig::with_learning_rate(options.learning_rate), network.vars())?;
    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut order: Vec<usize> = (0..vectors.len()).collect();
    let mut epoch_losses = Vec::with_capacity(options.epochs);

    for epoch in 0..options.epochs {
        order.shuffle(&mut rng);
        let mut total = 0.0;
        let mut batches = 0usize;

        for batch in order.chunks(options.batch_size) {
            let (corrected, others): (Vec<usize>, Vec<usize>) =
                batch.iter().copied().partition(|&i| targets[i].is_some());

            let mut terms = Vec::with_capacity(2);
            if !corrected.is_empty() {
                let ids = index_tensor(&corrected)?;
                let predicted = network.forward(&inputs.index_select(&ids, 0)?)?;
                terms.push(mse(&predicted, &wanted.index_select(&ids, 0)?)?);
            }
            if !others.is_empty() && options.lambda > 0.0 {
                let ids = index_tensor(&others)?;
                let predicted = network.forward(&inputs.index_select(&ids, 0)?)?;
                let drift = mse(&predicted, &snapshot.index_select(&ids, 0)?)?;
                terms.push(drift.affine(options.lambda as f64, 0.0)?);
            }
            let Some(first) = terms.pop() else {
                continue;
            };
            let loss = terms.iter().try_fold(first, |acc, t| acc.add(t))?;

            total += loss.to_scalar::<f32>()?;
            adam.step(&loss)?;
            batches += 1;
        }

        let mean = if batches > 0 { total / batches as f32 } else { 0.0 };
        tracing::info!(mode = "correction", epoch, loss = mean, batches, "training epoch");
        epoch_losses.push(mean);
    }

    Ok(TrainOutcome {
        network,
        epoch_losses,
        steps: adam.steps(),
    })
}
