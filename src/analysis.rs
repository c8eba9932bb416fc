//! Read-only analyses over the plot view

use crate::model::NOISE;
use crate::storage::{PlotRow, UnitId};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Member count of one cluster label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClusterCount {
    pub cluster: i64,
    pub units: usize,
}

/// Cluster sizes under one clustering identity. Noise counts as a label of
/// its own, as it does in the stored rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterSummary {
    /// Units with a cluster label
    pub clustered: usize,
    pub unique_clusters: usize,
    pub counts: Vec<ClusterCount>,
}

impl ClusterSummary {
    pub fn from_counts(counts: Vec<(i64, usize)>) -> Self {
        Self {
            clustered: counts.iter().map(|(_, n)| n).sum(),
            unique_clusters: counts.len(),
            counts: counts
                .into_iter()
                .map(|(cluster, units)| ClusterCount { cluster, units })
                .collect(),
        }
    }
}

/// A unit whose label differs from its cluster's dominant label
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelMismatch {
    pub unit: UnitId,
    pub cluster: i64,
    pub label: String,
    pub dominant: String,
}

/// Find labelled units that disagree with a clearly dominant label.
///
/// Only labelled, clustered rows are considered and noise is skipped. A
/// cluster's most frequent label is dominant when its share of the
/// cluster's labelled units exceeds `cutoff`; every other labelled unit in
/// that cluster is reported. Results follow cluster order, then plot order,
/// truncated to `max_count`.
pub fn label_mismatches(rows: &[PlotRow], cutoff: f32, max_count: usize) -> Vec<LabelMismatch> {
    let mut clusters: BTreeMap<i64, Vec<(&PlotRow, &str)>> = BTreeMap::new();
    for row in rows {
        if let (Some(cluster), Some(label)) = (row.cluster, row.label.as_deref()) {
            if cluster != NOISE {
                clusters.entry(cluster).or_default().push((row, label));
            }
        }
    }

    let mut mismatches = Vec::new();
    for (cluster, members) in clusters {
        let mut tally: HashMap<&str, usize> = HashMap::new();
        for (_, label) in &members {
            *tally.entry(*label).or_default() += 1;
        }
        // Ties go to the lexicographically smallest label.
        let Some((dominant, count)) = tally
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        else {
            continue;
        };
        if (count as f32) / (members.len() as f32) <= cutoff {
            continue;
        }

        mismatches.extend(
            members
                .iter()
                .filter(|(_, label)| *label != dominant)
                .map(|(row, label)| LabelMismatch {
                    unit: row.unit,
                    cluster,
                    label: label.to_string(),
                    dominant: dominant.to_string(),
                }),
        );
        if mismatches.len() >= max_count {
            break;
        }
    }
    mismatches.truncate(max_count);
    mismatches
}
