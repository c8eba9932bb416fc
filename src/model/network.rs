//! A small fully-connected network mapping vectors to 2-D positions
//!
//! `input → tanh(hidden) → linear(2)`, held as candle [`Var`]s so the
//! training loops can differentiate through it:
//!
//! ```text
//! w1: [hidden, input]  b1: [hidden]  w2: [2, hidden]  b2: [2]
//! ```
//!
//! Cloning a `Var` shares its storage, so copies go through
//! [`Mlp::try_clone`], which duplicates the weights.

use super::{ModelError, ModelResult};
use candle_core::{Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const OUTPUT: usize = 2;

/// Plain weights of an [`Mlp`], row-major. This is the persisted form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpWeights {
    pub input: usize,
    pub hidden: usize,
    pub w1: Vec<f32>,
    pub b1: Vec<f32>,
    pub w2: Vec<f32>,
    pub b2: Vec<f32>,
}

#[derive(Debug)]
pub struct Mlp {
    input: usize,
    hidden: usize,
    w1: Var,
    b1: Var,
    w2: Var,
    b2: Var,
}

impl Mlp {
    /// Xavier-uniform weights, zero biases.
    pub fn new(input: usize, hidden: usize, seed: u64) -> ModelResult<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let a1 = (6.0 / (input + hidden) as f32).sqrt();
        let w1 = (0..hidden * input).map(|_| rng.gen_range(-a1..a1)).collect();
        let a2 = (6.0 / (hidden + OUTPUT) as f32).sqrt();
        let w2 = (0..OUTPUT * hidden).map(|_| rng.gen_range(-a2..a2)).collect();

        Self::from_weights(&MlpWeights {
            input,
            hidden,
            w1,
            b1: vec![0.0; hidden],
            w2,
            b2: vec![0.0; OUTPUT],
        })
    }

    pub fn from_weights(weights: &MlpWeights) -> ModelResult<Self> {
        let MlpWeights { input, hidden, .. } = *weights;
        let var = |data: &[f32], shape: &[usize]| -> ModelResult<Var> {
            let expected: usize = shape.iter().product();
            if data.len() != expected {
                return Err(ModelError::Dimension {
                    expected,
                    found: data.len(),
                });
            }
            Ok(Var::from_tensor(&Tensor::from_slice(data, shape, &Device::Cpu)?)?)
        };
        Ok(Self {
            input,
            hidden,
            w1: var(&weights.w1, &[hidden, input])?,
            b1: var(&weights.b1, &[hidden])?,
            w2: var(&weights.w2, &[OUTPUT, hidden])?,
            b2: var(&weights.b2, &[OUTPUT])?,
        })
    }

    pub fn weights(&self) -> ModelResult<MlpWeights> {
        let flat = |v: &Var| -> ModelResult<Vec<f32>> { Ok(v.as_tensor().flatten_all()?.to_vec1()?) };
        Ok(MlpWeights {
            input: self.input,
            hidden: self.hidden,
            w1: flat(&self.w1)?,
            b1: flat(&self.b1)?,
            w2: flat(&self.w2)?,
            b2: flat(&self.b2)?,
        })
    }

    /// An independent copy: training the copy leaves `self` untouched.
    pub fn try_clone(&self) -> ModelResult<Self> {
        Self::from_weights(&self.weights()?)
    }

    pub fn input_dim(&self) -> usize {
        self.input
    }

    /// The variables an optimizer updates.
    pub fn vars(&self) -> Vec<Var> {
        vec![
            self.w1.clone(),
            self.b1.clone(),
            self.w2.clone(),
            self.b2.clone(),
        ]
    }

    /// `[n, input]` → `[n, 2]`, tracked for backpropagation.
    pub fn forward(&self, x: &Tensor) -> ModelResult<Tensor> {
        let hidden = x
            .matmul(&self.w1.as_tensor().t()?)?
            .broadcast_add(self.b1.as_tensor())?
            .tanh()?;
        Ok(hidden
            .matmul(&self.w2.as_tensor().t()?)?
            .broadcast_add(self.b2.as_tensor())?)
    }

    pub fn predict_batch(&self, vectors: &[Vec<f32>]) -> ModelResult<Vec<[f32; 2]>> {
        if vectors.is_empty() {
            return Ok(Vec::new());
        }
        let x = input_tensor(vectors, self.input)?;
        let rows: Vec<Vec<f32>> = self.forward(&x)?.detach().to_vec2()?;
        Ok(rows.into_iter().map(|r| [r[0], r[1]]).collect())
    }

    pub fn predict(&self, x: &[f32]) -> ModelResult<[f32; 2]> {
        let mut out = self.predict_batch(std::slice::from_ref(&x.to_vec()))?;
        out.pop().ok_or(ModelError::EmptyInput)
    }
}

/// Stack equally sized vectors into a `[n, dim]` tensor.
pub fn input_tensor(vectors: &[Vec<f32>], dim: usize) -> ModelResult<Tensor> {
    let mut flat = Vec::with_capacity(vectors.len() * dim);
    for v in vectors {
        if v.len() != dim {
            return Err(ModelError::Dimension {
                expected: dim,
                found: v.len(),
            });
        }
        flat.extend_from_slice(v);
    }
    Ok(Tensor::from_vec(flat, (vectors.len(), dim), &Device::Cpu)?)
}

/// Stack 2-D positions into a `[n, 2]` tensor.
pub fn position_tensor(points: &[[f32; 2]]) -> ModelResult<Tensor> {
    let flat: Vec<f32> = points.iter().flat_map(|p| p.iter().copied()).collect();
    Ok(Tensor::from_vec(flat, (points.len(), OUTPUT), &Device::Cpu)?)
}

impl Serialize for Mlp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.weights()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Mlp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let weights = MlpWeights::deserialize(deserializer)?;
        Mlp::from_weights(&weights).map_err(serde::de::Error::custom)
    }
}
