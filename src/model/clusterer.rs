//! Density-based clustering (DBSCAN) over 2-D positions

use super::{FitTransform, ModelError, ModelInput, ModelOutput, ModelResult, TransformOptions};
use crate::config::DbscanArgs;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Label of points that belong to no cluster.
pub const NOISE: i64 = -1;

/// DBSCAN clusterer.
///
/// Fitting keeps the core points and their cluster labels. Transform assigns
/// each point the label of its nearest core point within `eps`, or [`NOISE`],
/// so points added later are labelled without refitting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clusterer {
    args: DbscanArgs,
    fitted: bool,
    cores: Vec<([f32; 2], i64)>,
}

fn sq_dist(a: [f32; 2], b: [f32; 2]) -> f32 {
    (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)
}

fn expect_points<'a>(input: ModelInput<'a>) -> ModelResult<&'a [[f32; 2]]> {
    match input {
        ModelInput::Points(p) => Ok(p),
        other => Err(ModelError::InputMismatch(format!(
            "dbscan expects points, got {}",
            other.kind()
        ))),
    }
}

impl Clusterer {
    pub fn new(args: DbscanArgs) -> Self {
        Self {
            args,
            fitted: false,
            cores: Vec::new(),
        }
    }

    /// Number of clusters found at fit time
    pub fn cluster_count(&self) -> usize {
        self.cores
            .iter()
            .map(|(_, label)| *label)
            .max()
            .map_or(0, |max| max as usize + 1)
    }

    fn label_of(&self, point: [f32; 2]) -> i64 {
        let eps_sq = self.args.eps * self.args.eps;
        self.cores
            .iter()
            .map(|(core, label)| (sq_dist(*core, point), *label))
            .filter(|(d, _)| *d <= eps_sq)
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map_or(NOISE, |(_, label)| label)
    }
}

impl FitTransform for Clusterer {
    fn is_fitted(&self) -> bool {
        self.fitted
    }

    fn fit(&mut self, input: ModelInput<'_>) -> ModelResult<()> {
        let points = expect_points(input)?;
        if points.is_empty() {
            return Err(ModelError::EmptyInput);
        }

        let eps_sq = self.args.eps * self.args.eps;
        let neighbours: Vec<Vec<usize>> = points
            .iter()
            .map(|p| {
                (0..points.len())
                    .filter(|&j| sq_dist(*p, points[j]) <= eps_sq)
                    .collect()
            })
            .collect();
        let is_core: Vec<bool> = neighbours
            .iter()
            .map(|n| n.len() >= self.args.min_samples)
            .collect();

        let mut labels = vec![NOISE; points.len()];
        let mut next_label = 0i64;
        for start in 0..points.len() {
            if !is_core[start] || labels[start] != NOISE {
                continue;
            }
            labels[start] = next_label;
            let mut queue = VecDeque::from([start]);
            while let Some(i) = queue.pop_front() {
                for &j in &neighbours[i] {
                    if is_core[j] && labels[j] == NOISE {
                        labels[j] = next_label;
                        queue.push_back(j);
                    }
                }
            }
            next_label += 1;
        }

        self.cores = points
            .iter()
            .zip(&labels)
            .zip(&is_core)
            .filter(|(_, core)| **core)
            .map(|((p, label), _)| (*p, *label))
            .collect();
        self.fitted = true;
        tracing::debug!(
            points = points.len(),
            cores = self.cores.len(),
            clusters = next_label,
            "fitted dbscan"
        );
        Ok(())
    }

    fn transform(&self, input: ModelInput<'_>, _options: &TransformOptions) -> ModelResult<ModelOutput> {
        let points = expect_points(input)?;
        if points.is_empty() {
            return Err(ModelError::EmptyInput);
        }
        if !self.fitted {
            return Err(ModelError::NotFitted);
        }
        Ok(ModelOutput::Labels(
            points.iter().map(|p| self.label_of(*p)).collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(model: &Clusterer, points: &[[f32; 2]]) -> Vec<i64> {
        match model
            .transform(ModelInput::Points(points), &TransformOptions::default())
            .unwrap()
        {
            ModelOutput::Labels(l) => l,
            other => panic!("unexpected output {:?}", other),
        }
    }

    fn blobs() -> Vec<[f32; 2]> {
        let mut points = Vec::new();
        for i in 0..5 {
            points.push([0.0 + 0.1 * i as f32, 0.0]);
            points.push([10.0 + 0.1 * i as f32, 10.0]);
        }
        points.push([50.0, -50.0]);
        points
    }

    #[test]
    fn separates_blobs_and_noise() {
        let points = blobs();
        let mut model = Clusterer::new(DbscanArgs {
            eps: 0.5,
            min_samples: 3,
        });
        model.fit(ModelInput::Points(&points)).unwrap();
        assert_eq!(model.cluster_count(), 2);

        let got = labels(&model, &points);
        assert_eq!(got[0], got[2]);
        assert_eq!(got[1], got[3]);
        assert_ne!(got[0], got[1]);
        assert_eq!(got[10], NOISE);
    }

    #[test]
    fn new_points_join_nearby_clusters() {
        let points = blobs();
        let mut model = Clusterer::new(DbscanArgs {
            eps: 0.5,
            min_samples: 3,
        });
        model.fit(ModelInput::Points(&points)).unwrap();
        let fitted = labels(&model, &points);

        let later = labels(&model, &[[0.2, 0.3], [10.1, 9.8], [-20.0, 3.0]]);
        assert_eq!(later, vec![fitted[0], fitted[1], NOISE]);
    }

    #[test]
    fn all_noise_is_still_fitted() {
        let points = vec![[0.0, 0.0], [100.0, 100.0]];
        let mut model = Clusterer::new(DbscanArgs::default());
        model.fit(ModelInput::Points(&points)).unwrap();
        assert!(model.is_fitted());
        assert_eq!(labels(&model, &points), vec![NOISE, NOISE]);
    }

    #[test]
    fn rejects_vectors_and_empty_input() {
        let mut model = Clusterer::new(DbscanArgs::default());
        assert!(matches!(
            model.fit(ModelInput::Points(&[])),
            Err(ModelError::EmptyInput)
        ));
        let vectors = vec![vec![1.0, 2.0]];
        assert!(matches!(
            model.fit(ModelInput::Vectors(&vectors)),
            Err(ModelError::InputMismatch(_))
        ));
    }
}
