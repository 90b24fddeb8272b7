//! Brute-force k-nearest-neighbour engine.
//!
//! Distances are Minkowski distances of order `dist_power`. Neighbours vote
//! (classification) or average (regression) with rectangular or inverse
//! distance weights. A `neighbors` value above the training size is clamped.

use super::{
    EngineOptions, ModelError, Mode, Predictions, Standardizer, WeightFunc, apply_standardizer,
    class_labels, maybe_standardize,
};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Added to distances before inverting so exact matches stay finite.
const INVERSE_DISTANCE_FLOOR: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnnModel {
    neighbors: usize,
    dist_power: f64,
    weight_func: WeightFunc,
    scaler: Option<Standardizer>,
    x: Array2<f64>,
    y: Array1<f64>,
    /// Present for classification.
    classes: Option<Vec<f64>>,
}

pub fn fit(
    x: &Array2<f64>,
    y: &Array1<f64>,
    mode: Mode,
    neighbors: f64,
    dist_power: f64,
    options: &EngineOptions,
) -> Result<KnnModel, ModelError> {
    let classes = match mode {
        Mode::Classification => Some(class_labels(y)?),
        Mode::Regression => None,
    };
    let requested = neighbors.round().max(1.0) as usize;
    if requested > x.nrows() {
        log::debug!(
            "Clamping neighbors from {requested} to the {} training rows",
            x.nrows()
        );
    }
    let (scaler, x) = maybe_standardize(x, options.scaled);
    Ok(KnnModel {
        neighbors: requested.min(x.nrows()),
        dist_power,
        weight_func: options.weight_func,
        scaler,
        x,
        y: y.clone(),
        classes,
    })
}

fn minkowski(a: ArrayView1<f64>, b: ArrayView1<f64>, p: f64) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs().powf(p))
        .sum::<f64>()
        .powf(1.0 / p)
}

impl KnnModel {
    /// Indices and weights of the nearest training rows to `row`.
    fn neighbourhood(&self, row: ArrayView1<f64>) -> Vec<(usize, f64)> {
        let mut distances: Vec<(usize, f64)> = self
            .x
            .axis_iter(Axis(0))
            .enumerate()
            .map(|(i, train)| (i, minkowski(row, train, self.dist_power)))
            .collect();
        // Stable sort keeps training order among equidistant rows.
        distances.sort_by(|a, b| a.1.total_cmp(&b.1));
        distances.truncate(self.neighbors);
        distances
            .into_iter()
            .map(|(i, d)| {
                let w = match self.weight_func {
                    WeightFunc::Rectangular => 1.0,
                    WeightFunc::Inverse => 1.0 / (d + INVERSE_DISTANCE_FLOOR),
                };
                (i, w)
            })
            .collect()
    }

    pub fn predict(&self, x: &Array2<f64>) -> Predictions {
        let x = apply_standardizer(&self.scaler, x);
        let rows: Vec<ArrayView1<f64>> = x.axis_iter(Axis(0)).collect();
        match &self.classes {
            Some(classes) => {
                let votes: Vec<Vec<f64>> = rows
                    .par_iter()
                    .map(|row| {
                        let mut tally = vec![0.0; classes.len()];
                        let hood = self.neighbourhood(*row);
                        let total: f64 = hood.iter().map(|(_, w)| w).sum();
                        for (i, w) in hood {
                            if let Some(k) = classes.iter().position(|&c| c == self.y[i]) {
                                tally[k] += w / total;
                            }
                        }
                        tally
                    })
                    .collect();
                let probs = Array2::from_shape_fn((votes.len(), classes.len()), |(i, k)| votes[i][k]);
                Predictions::from_scores(classes, &probs, Some(probs.clone()))
            }
            None => {
                let values: Vec<f64> = rows
                    .par_iter()
                    .map(|row| {
                        let hood = self.neighbourhood(*row);
                        let total: f64 = hood.iter().map(|(_, w)| w).sum();
                        hood.iter().map(|&(i, w)| w * self.y[i]).sum::<f64>() / total
                    })
                    .collect();
                Predictions::Numeric(Array1::from_vec(values))
            }
        }
    }
}
