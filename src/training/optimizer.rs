//! Adam optimizer for candle `Var` tensors.
//!
//! Gradients come from candle autograd: [`Adam::step`] runs
//! `loss.backward()` and applies one bias-corrected update to every
//! registered variable.

use crate::model::ModelResult;
use candle_core::{Tensor, Var};

/// Adam optimizer configuration.
#[derive(Debug, Clone)]
pub struct AdamConfig {
    pub learning_rate: f64,
    /// First moment exponential decay rate.
    pub beta1: f64,
    /// Second moment exponential decay rate.
    pub beta2: f64,
    /// Numerical stability constant.
    pub epsilon: f64,
}

impl AdamConfig {
    pub fn with_learning_rate(learning_rate: f32) -> Self {
        Self {
            learning_rate: learning_rate as f64,
            ..Self::default()
        }
    }
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// A tracked variable with its moment estimates.
struct TrackedParam {
    var: Var,
    /// First moment estimate (mean of gradients).
    m: Tensor,
    /// Second moment estimate (mean of squared gradients).
    v: Tensor,
}

pub struct Adam {
    config: AdamConfig,
    params: Vec<TrackedParam>,
    step: u32,
}

impl Adam {
    pub fn new(config: AdamConfig, vars: Vec<Var>) -> ModelResult<Self> {
        let params = vars
            .into_iter()
            .map(|var| {
                let m = var.as_tensor().zeros_like()?;
                let v = var.as_tensor().zeros_like()?;
                Ok(TrackedParam { var, m, v })
            })
            .collect::<ModelResult<Vec<_>>>()?;
        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn steps(&self) -> u32 {
        self.step
    }

    /// Backpropagate `loss` and apply one update.
    pub fn step(&mut self, loss: &Tensor) -> ModelResult<()> {
        let grads = loss.backward()?;
        self.step += 1;

        let AdamConfig {
            learning_rate,
            beta1,
            beta2,
            epsilon,
        } = self.config;
        let bias1 = 1.0 - beta1.powi(self.step as i32);
        let bias2 = 1.0 - beta2.powi(self.step as i32);

        for param in &mut self.params {
            let Some(grad) = grads.get(param.var.as_tensor()) else {
                continue;
            };

            // Moments are optimizer state; detach so the graph does not grow
            // across steps.
            param.m = param
                .m
                .affine(beta1, 0.0)?
                .add(&grad.affine(1.0 - beta1, 0.0)?)?
                .detach();
            param.v = param
                .v
                .affine(beta2, 0.0)?
                .add(&grad.sqr()?.affine(1.0 - beta2, 0.0)?)?
                .detach();

            let m_hat = param.m.affine(1.0 / bias1, 0.0)?;
            let denom = param.v.affine(1.0 / bias2, 0.0)?.sqrt()?.affine(1.0, epsilon)?;
            let update = m_hat.div(&denom)?.affine(-learning_rate, 0.0)?;

            let next = param.var.as_tensor().add(&update)?.detach();
            param.var.set(&next)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scalar_var(values: &[f32]) -> Var {
        Var::from_tensor(&Tensor::from_slice(values, values.len(), &Device::Cpu).unwrap()).unwrap()
    }

    fn values(var: &Var) -> Vec<f32> {
        var.as_tensor().to_vec1().unwrap()
    }

    #[test]
    fn first_step_moves_by_learning_rate() {
        // With bias correction the first step is lr * sign(g).
        let x = scalar_var(&[1.0, -1.0]);
        let mut adam = Adam::new(AdamConfig::with_learning_rate(0.1), vec![x.clone()]).unwrap();
        // loss = 0.5 * x0 - 2 * x1
        let c = Tensor::new(&[0.5f32, -2.0], &Device::Cpu).unwrap();
        let loss = x.as_tensor().mul(&c).unwrap().sum_all().unwrap();
        adam.step(&loss).unwrap();

        let after = values(&x);
        assert!((after[0] - 0.9).abs() < 1e-5);
        assert!((after[1] + 0.9).abs() < 1e-5);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn minimizes_a_quadratic() {
        // f(x) = (x - 3)²
        let x = scalar_var(&[0.0]);
        let mut adam = Adam::new(AdamConfig::with_learning_rate(0.1), vec![x.clone()]).unwrap();
        for _ in 0..500 {
            let loss = x.as_tensor().affine(1.0, -3.0).unwrap().sqr().unwrap().sum_all().unwrap();
            adam.step(&loss).unwrap();
        }
        let got = values(&x)[0];
        assert!((got - 3.0).abs() < 0.1, "x = {}", got);
    }

    #[test]
    fn untouched_variables_keep_their_values() {
        let used = scalar_var(&[1.0]);
        let unused = scalar_var(&[0.1, 0.2, 0.3]);
        let mut adam = Adam::new(AdamConfig::default(), vec![used.clone(), unused.clone()]).unwrap();
        let loss = used.as_tensor().sum_all().unwrap();
        adam.step(&loss).unwrap();
        assert_eq!(values(&unused), vec![0.1, 0.2, 0.3]);
        assert!(values(&used)[0] < 1.0);
    }
}
