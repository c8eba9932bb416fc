//! Principal-component projection to two dimensions

use super::{
    expect_vectors, uniform_dimension, FitTransform, ModelError, ModelInput, ModelOutput,
    ModelResult, TransformOptions,
};
use crate::config::PcaArgs;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Projects vectors onto their top two principal components.
///
/// Components are found by seeded power iteration with deflation, so the
/// same input and `random_state` always give the same projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Projector {
    args: PcaArgs,
    mean: Vec<f32>,
    components: Vec<Vec<f32>>,
}

impl Projector {
    pub fn new(args: PcaArgs) -> Self {
        Self {
            args,
            mean: Vec::new(),
            components: Vec::new(),
        }
    }

    pub fn dimension(&self) -> Option<usize> {
        if self.components.is_empty() {
            None
        } else {
            Some(self.mean.len())
        }
    }

    /// Project one vector. The caller has checked the dimension.
    fn project(&self, vector: &[f32]) -> [f32; 2] {
        let mut out = [0.0f32; 2];
        for (k, component) in self.components.iter().enumerate().take(2) {
            out[k] = vector
                .iter()
                .zip(&self.mean)
                .zip(component)
                .map(|((x, m), c)| (x - m) * c)
                .sum();
        }
        out
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Remove the projection onto each of `basis` from `v`.
fn orthogonalize(v: &mut [f64], basis: &[Vec<f64>]) {
    for b in basis {
        let d = dot(v, b);
        for (vi, bi) in v.iter_mut().zip(b) {
            *vi -= d * bi;
        }
    }
}

fn normalize(v: &mut [f64]) -> f64 {
    let norm = dot(v, v).sqrt();
    if norm > 1e-12 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    norm
}

impl FitTransform for Projector {
    fn is_fitted(&self) -> bool {
        !self.components.is_empty()
    }

    fn fit(&mut self, input: ModelInput<'_>) -> ModelResult<()> {
        let vectors = expect_vectors(input, "pca")?;
        let dim = uniform_dimension(vectors)?;
        let n = vectors.len() as f64;

        let mut mean = vec![0.0f64; dim];
        for v in vectors {
            for (m, x) in mean.iter_mut().zip(v) {
                *m += f64::from(*x);
            }
        }
        for m in &mut mean {
            *m /= n;
        }

        let centered: Vec<Vec<f64>> = vectors
            .iter()
            .map(|v| v.iter().zip(&mean).map(|(x, m)| f64::from(*x) - m).collect())
            .collect();

        let mut rng = StdRng::seed_from_u64(self.args.random_state);
        let mut basis: Vec<Vec<f64>> = Vec::with_capacity(2);

        for _ in 0..2 {
            let mut v: Vec<f64> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
            orthogonalize(&mut v, &basis);
            normalize(&mut v);

            for _ in 0..self.args.power_iterations {
                // w = Xᵀ(Xv)
                let mut w = vec![0.0f64; dim];
                for row in &centered {
                    let s = dot(row, &v);
                    for (wi, xi) in w.iter_mut().zip(row) {
                        *wi += s * xi;
                    }
                }
                orthogonalize(&mut w, &basis);
                if normalize(&mut w) <= 1e-12 {
                    // No variance left in this direction.
                    w.iter_mut().for_each(|x| *x = 0.0);
                    v = w;
                    break;
                }
                v = w;
            }

            // Fix the sign so the largest coordinate is positive.
            if let Some(pivot) = v
                .iter()
                .copied()
                .max_by(|a, b| a.abs().total_cmp(&b.abs()))
            {
                if pivot < 0.0 {
                    v.iter_mut().for_each(|x| *x = -*x);
                }
            }
            basis.push(v);
        }

        self.mean = mean.into_iter().map(|m| m as f32).collect();
        self.components = basis
            .into_iter()
            .map(|c| c.into_iter().map(|x| x as f32).collect())
            .collect();
        tracing::debug!(rows = vectors.len(), dim, "fitted pca projector");
        Ok(())
    }

    fn transform(&self, input: ModelInput<'_>, _options: &TransformOptions) -> ModelResult<ModelOutput> {
        let vectors = expect_vectors(input, "pca")?;
        if vectors.is_empty() {
            return Err(ModelError::EmptyInput);
        }
        let dim = self.dimension().ok_or(ModelError::NotFitted)?;

        let mut positions = Vec::with_capacity(vectors.len());
        for v in vectors {
            if v.len() != dim {
                return Err(ModelError::Dimension {
                    expected: dim,
                    found: v.len(),
                });
            }
            positions.push(self.project(v));
        }
        Ok(ModelOutput::Positions(positions))
    }
}
