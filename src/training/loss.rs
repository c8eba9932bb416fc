//! Loss functions in projected (2-D) space
//!
//! Losses take `[n, 2]` tensors of projected points and return a scalar
//! tensor that candle autograd can differentiate.

use crate::model::ModelResult;
use candle_core::Tensor;

/// Euclidean distance between two positions.
pub fn distance(a: [f32; 2], b: [f32; 2]) -> f32 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
}

/// Row-wise Euclidean distance, smoothed at zero so coincident points keep a
/// finite gradient.
fn row_distance(a: &Tensor, b: &Tensor) -> ModelResult<Tensor> {
    Ok(a.sub(b)?.sqr()?.sum(1)?.affine(1.0, 1e-12)?.sqrt()?)
}

/// Mean of `max(0, ‖a − p‖ − ‖a − n‖ + margin)` over the rows of the three
/// `[n, 2]` tensors.
pub fn triplet_margin(
    anchor: &Tensor,
    positive: &Tensor,
    negative: &Tensor,
    margin: f32,
) -> ModelResult<Tensor> {
    let d_ap = row_distance(anchor, positive)?;
    let d_an = row_distance(anchor, negative)?;
    Ok(d_ap.sub(&d_an)?.affine(1.0, margin as f64)?.relu()?.mean_all()?)
}

/// Mean squared error over every coordinate.
pub fn mse(predicted: &Tensor, target: &Tensor) -> ModelResult<Tensor> {
    Ok(candle_nn::loss::mse(predicted, target)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    fn points(rows: &[[f32; 2]]) -> Tensor {
        crate::model::position_tensor(rows).unwrap()
    }

    fn var(values: [f32; 2]) -> Var {
        Var::from_tensor(&Tensor::from_slice(&values, (1, 2), &Device::Cpu).unwrap()).unwrap()
    }

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar().unwrap()
    }

    #[test]
    fn satisfied_triplet_has_no_loss() {
        let loss = triplet_margin(
            &points(&[[0.0, 0.0]]),
            &points(&[[0.1, 0.0]]),
            &points(&[[5.0, 0.0]]),
            1.0,
        )
        .unwrap();
        assert_eq!(scalar(&loss), 0.0);
    }

    #[test]
    fn violated_triplet_pulls_positive_and_pushes_negative() {
        let positive = var([2.0, 0.0]);
        let negative = var([0.0, 1.0]);
        let loss = triplet_margin(
            &points(&[[0.0, 0.0]]),
            positive.as_tensor(),
            negative.as_tensor(),
            1.0,
        )
        .unwrap();
        assert!((scalar(&loss) - 2.0).abs() < 1e-5);

        let grads = loss.backward().unwrap();
        let g_pos: Vec<Vec<f32>> = grads.get(positive.as_tensor()).unwrap().to_vec2().unwrap();
        let g_neg: Vec<Vec<f32>> = grads.get(negative.as_tensor()).unwrap().to_vec2().unwrap();
        // Descending the gradient moves the positive towards the anchor ...
        assert!(g_pos[0][0] > 0.0);
        // ... and the negative away from it.
        assert!(g_neg[0][1] < 0.0);
    }

    #[test]
    fn coincident_points_keep_finite_gradients() {
        let anchor = var([1.0, 1.0]);
        let loss = triplet_margin(
            anchor.as_tensor(),
            anchor.as_tensor(),
            &points(&[[1.0, 1.5]]),
            1.0,
        )
        .unwrap();
        let grads = loss.backward().unwrap();
        let g: Vec<f32> = grads.get(anchor.as_tensor()).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(g.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn mse_value() {
        let loss = mse(&points(&[[1.0, 2.0], [0.0, 0.0]]), &points(&[[0.0, 0.0], [0.0, 0.0]])).unwrap();
        // (1 + 4 + 0 + 0) / 4
        assert!((scalar(&loss) - 1.25).abs() < 1e-6);
    }
}
