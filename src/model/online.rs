//! Trainable projector
//!
//! Fitting regresses a fresh network onto the principal-component layout of
//! the fit data; afterwards the network can be refined by the training
//! engine and its weights swapped in with [`OnlineProjector::replace_network`].

use super::network::{input_tensor, position_tensor, Mlp};
use super::projector::Projector;
use super::{
    expect_vectors, uniform_dimension, FitTransform, ModelError, ModelInput, ModelOutput,
    ModelResult, TransformOptions,
};
use crate::config::{ParametricArgs, PcaArgs};
use crate::training::loss::mse;
use crate::training::optimizer::{Adam, AdamConfig};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

const FIT_BATCH: usize = 32;

#[derive(Debug, Serialize, Deserialize)]
pub struct OnlineProjector {
    args: ParametricArgs,
    network: Option<Mlp>,
}

impl OnlineProjector {
    pub fn new(args: ParametricArgs) -> Self {
        Self {
            args,
            network: None,
        }
    }

    pub fn args(&self) -> &ParametricArgs {
        &self.args
    }

    pub fn network(&self) -> Option<&Mlp> {
        self.network.as_ref()
    }

    /// Swap in retrained weights. The replacement must accept the same input
    /// dimension.
    pub fn replace_network(&mut self, network: Mlp) -> ModelResult<()> {
        if let Some(current) = &self.network {
            if current.input_dim() != network.input_dim() {
                return Err(ModelError::Dimension {
                    expected: current.input_dim(),
                    found: network.input_dim(),
                });
            }
        }
        self.network = Some(network);
        Ok(())
    }
}

impl FitTransform for OnlineProjector {
    fn is_fitted(&self) -> bool {
        self.network.is_some()
    }

    fn fit(&mut self, input: ModelInput<'_>) -> ModelResult<()> {
        let vectors = expect_vectors(input, "parametric")?;
        let dim = uniform_dimension(vectors)?;

        let mut pca = Projector::new(PcaArgs {
            random_state: self.args.random_state,
            ..PcaArgs::default()
        });
        pca.fit(input)?;
        let targets = match pca.transform(input, &TransformOptions::default())? {
            ModelOutput::Positions(p) => p,
            other => {
                return Err(ModelError::Backend(format!(
                    "pca produced {} non-position rows",
                    other.len()
                )))
            }
        };

        let network = Mlp::new(dim, self.args.hidden, self.args.random_state)?;
        let inputs = input_tensor(vectors, dim)?;
        let wanted = position_tensor(&targets)?;
        let mut adam = Adam::new(AdamConfig::with_learning_rate(self.args.learning_rate), network.vars())?;
        let mut rng = StdRng::seed_from_u64(self.args.random_state);
        let mut order: Vec<usize> = (0..vectors.len()).collect();
        let mut last_loss = 0.0;

        for _ in 0..self.args.fit_epochs {
            order.shuffle(&mut rng);
            last_loss = 0.0;
            for batch in order.chunks(FIT_BATCH) {
                let ids: Vec<u32> = batch.iter().map(|&i| i as u32).collect();
                let ids = Tensor::from_vec(ids, batch.len(), &Device::Cpu)?;
                let predicted = network.forward(&inputs.index_select(&ids, 0)?)?;
                let loss = mse(&predicted, &wanted.index_select(&ids, 0)?)?;
                last_loss += loss.to_scalar::<f32>()?;
                adam.step(&loss)?;
            }
        }

        tracing::debug!(
            rows = vectors.len(),
            dim,
            epochs = self.args.fit_epochs,
            loss = last_loss,
            "fitted parametric projector"
        );
        self.network = Some(network);
        Ok(())
    }

    fn transform(&self, input: ModelInput<'_>, _options: &TransformOptions) -> ModelResult<ModelOutput> {
        let vectors = expect_vectors(input, "parametric")?;
        if vectors.is_empty() {
            return Err(ModelError::EmptyInput);
        }
        let network = self.network.as_ref().ok_or(ModelError::NotFitted)?;

        let positions = network.predict_batch(vectors)?;
        Ok(ModelOutput::Positions(positions))
    }
}
