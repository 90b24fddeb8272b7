//! # Hyperparameter Tuning
//!
//! A `Tuner` evaluates a workflow over every (configuration, fold) pair of a
//! grid and picks the best configuration from the resulting
//! `PerformanceTable`. `GridSearch` is the exhaustive implementation; it runs
//! the pairs on a `WorkerPool` when one is attached and sequentially
//! otherwise. Results are identical either way because every pair is
//! independent and collected in grid order.
//!
//! A pair that fails (for example an engine error on one fold) is logged and
//! left out of the table. Tuning only fails when no pair succeeds.

use crate::folds::{Fold, Resamples};
use crate::grid::{Configuration, Grid};
use crate::metrics::{Metric, MetricSet};
use crate::pool::WorkerPool;
use crate::workflow::{Workflow, WorkflowError};
use itertools::Itertools;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TuneError {
    #[error("The hyperparameter grid is empty.")]
    EmptyGrid,
    #[error("No resamples were supplied.")]
    NoFolds,
    #[error("All {attempted} tuning evaluations failed. First failure: {first}")]
    AllEvaluationsFailed {
        attempted: usize,
        #[source]
        first: WorkflowError,
    },
    #[error("Metric '{0}' was not computed during tuning.")]
    MetricNotComputed(Metric),
    #[error("No configuration has a finite mean for metric '{0}'.")]
    NoFiniteEstimate(Metric),
}

/// One row of a performance table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldEstimate {
    pub config_id: String,
    pub fold_id: String,
    pub metric: Metric,
    pub estimate: f64,
}

/// Resampled performance of one configuration on one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub config_id: String,
    pub metric: Metric,
    pub mean: f64,
    /// Number of folds with a finite estimate.
    pub n: usize,
    pub std_err: f64,
}

/// Estimates keyed by (configuration, fold, metric).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceTable {
    grid: Grid,
    metrics: Vec<Metric>,
    estimates: Vec<FoldEstimate>,
}

impl PerformanceTable {
    pub fn new(grid: Grid, metrics: Vec<Metric>, estimates: Vec<FoldEstimate>) -> Self {
        Self {
            grid,
            metrics,
            estimates,
        }
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn estimates(&self) -> &[FoldEstimate] {
        &self.estimates
    }

    fn summarize(&self, config: &Configuration, metric: Metric) -> MetricSummary {
        let values: Vec<f64> = self
            .estimates
            .iter()
            .filter(|e| e.config_id == config.id && e.metric == metric && e.estimate.is_finite())
            .map(|e| e.estimate)
            .collect();
        let n = values.len();
        let mean = if n == 0 {
            f64::NAN
        } else {
            values.iter().sum::<f64>() / n as f64
        };
        let std_err = if n < 2 {
            f64::NAN
        } else {
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
            (var / n as f64).sqrt()
        };
        MetricSummary {
            config_id: config.id.clone(),
            metric,
            mean,
            n,
            std_err,
        }
    }

    /// Mean, count and standard error per configuration and metric, in grid
    /// order and then metric-set order.
    pub fn collect_metrics(&self) -> Vec<MetricSummary> {
        self.grid
            .configurations
            .iter()
            .cartesian_product(&self.metrics)
            .map(|(config, &metric)| self.summarize(config, metric))
            .collect()
    }

    /// Summaries of one configuration.
    pub fn summary_for(&self, config_id: &str) -> Vec<MetricSummary> {
        self.collect_metrics()
            .into_iter()
            .filter(|s| s.config_id == config_id)
            .collect()
    }

    /// The `n` best configurations for `metric`. Configurations without a
    /// finite mean are ranked last; ties keep grid order.
    pub fn show_best(&self, metric: Metric, n: usize) -> Result<Vec<MetricSummary>, TuneError> {
        if !self.metrics.contains(&metric) {
            return Err(TuneError::MetricNotComputed(metric));
        }
        let direction = metric.direction();
        let mut ranked: Vec<MetricSummary> = self
            .grid
            .configurations
            .iter()
            .map(|c| self.summarize(c, metric))
            .collect();
        ranked.sort_by(|a, b| match (a.mean.is_finite(), b.mean.is_finite()) {
            (true, true) if direction.is_better(a.mean, b.mean) => std::cmp::Ordering::Less,
            (true, true) if direction.is_better(b.mean, a.mean) => std::cmp::Ordering::Greater,
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => std::cmp::Ordering::Equal,
        });
        ranked.truncate(n);
        Ok(ranked)
    }

    /// The configuration with the best mean for `metric`; the first in grid
    /// order on ties.
    pub fn select_best(&self, metric: Metric) -> Result<Configuration, TuneError> {
        let best = self
            .show_best(metric, 1)?
            .into_iter()
            .find(|s| s.mean.is_finite())
            .ok_or(TuneError::NoFiniteEstimate(metric))?;
        self.grid
            .get(&best.config_id)
            .cloned()
            .ok_or(TuneError::NoFiniteEstimate(metric))
    }
}

/// Evaluates a workflow over a grid and chooses a configuration.
pub trait Tuner {
    fn evaluate(
        &self,
        workflow: &Workflow,
        resamples: &Resamples<'_>,
        grid: &Grid,
        metrics: &MetricSet,
    ) -> Result<PerformanceTable, TuneError>;

    fn select_best(
        &self,
        table: &PerformanceTable,
        metric: Metric,
    ) -> Result<Configuration, TuneError> {
        table.select_best(metric)
    }
}

/// Exhaustive evaluation of every grid point on every fold.
#[derive(Default)]
pub struct GridSearch<'p> {
    pool: Option<&'p WorkerPool>,
}

impl<'p> GridSearch<'p> {
    pub fn new() -> Self {
        Self { pool: None }
    }

    pub fn with_pool(pool: &'p WorkerPool) -> Self {
        Self { pool: Some(pool) }
    }

    pub fn is_parallel(&self) -> bool {
        self.pool.is_some()
    }
}

fn evaluate_pair(
    workflow: &Workflow,
    resamples: &Resamples<'_>,
    config: &Configuration,
    fold: &Fold,
    metrics: &MetricSet,
) -> Result<Vec<FoldEstimate>, WorkflowError> {
    let fitted = workflow.finalize(config)?.fit(&fold.analysis_table(resamples.data))?;
    let assessment = fitted.assess(&fold.assessment_table(resamples.data), metrics)?;
    Ok(assessment
        .metrics
        .into_iter()
        .map(|m| FoldEstimate {
            config_id: config.id.clone(),
            fold_id: fold.id.clone(),
            metric: m.metric,
            estimate: m.estimate,
        })
        .collect())
}

impl Tuner for GridSearch<'_> {
    fn evaluate(
        &self,
        workflow: &Workflow,
        resamples: &Resamples<'_>,
        grid: &Grid,
        metrics: &MetricSet,
    ) -> Result<PerformanceTable, TuneError> {
        if grid.is_empty() {
            return Err(TuneError::EmptyGrid);
        }
        if resamples.is_empty() {
            return Err(TuneError::NoFolds);
        }

        let pairs: Vec<(&Configuration, &Fold)> = grid
            .configurations
            .iter()
            .cartesian_product(&resamples.folds)
            .collect();
        let run = |&(config, fold): &(&Configuration, &Fold)| {
            evaluate_pair(workflow, resamples, config, fold, metrics)
        };
        let outcomes: Vec<Result<Vec<FoldEstimate>, WorkflowError>> = match self.pool {
            Some(pool) => pool.install(|| pairs.par_iter().map(run).collect()),
            None => pairs.iter().map(run).collect(),
        };

        let attempted = outcomes.len();
        let mut estimates = Vec::new();
        let mut first_failure = None;
        let mut failed = 0usize;
        for ((config, fold), outcome) in pairs.iter().zip(outcomes) {
            match outcome {
                Ok(rows) => estimates.extend(rows),
                Err(e) => {
                    log::warn!("{} on {} failed and was skipped: {}", config.id, fold.id, e);
                    failed += 1;
                    first_failure.get_or_insert(e);
                }
            }
        }
        if failed == attempted {
            if let Some(first) = first_failure {
                return Err(TuneError::AllEvaluationsFailed { attempted, first });
            }
        }
        log::debug!(
            "Evaluated {} configurations on {} folds ({} failed)",
            grid.len(),
            resamples.len(),
            failed
        );

        Ok(PerformanceTable::new(
            grid.clone(),
            metrics.metrics().to_vec(),
            estimates,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Table;
    use crate::folds::vfold_cv;
    use crate::grid::regular_grid;
    use crate::model::{Mode, ModelFamily, ModelSpec, ParamRange, Transform};
    use crate::recipe::Recipe;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use std::collections::BTreeMap;

    fn config(id: &str, v: f64) -> Configuration {
        Configuration {
            id: id.to_string(),
            values: BTreeMap::from([("neighbors".to_string(), v)]),
        }
    }

    fn table_with(estimates: &[(&str, f64)]) -> PerformanceTable {
        let grid = Grid {
            params: vec!["neighbors".into()],
            configurations: vec![config("Model01", 1.0), config("Model02", 2.0), config("Model03", 3.0)],
        };
        let rows = estimates
            .iter()
            .enumerate()
            .map(|(i, &(id, estimate))| FoldEstimate {
                config_id: id.to_string(),
                fold_id: format!("Fold{}", i % 2 + 1),
                metric: Metric::Accuracy,
                estimate,
            })
            .collect();
        PerformanceTable::new(grid, vec![Metric::Accuracy], rows)
    }

    #[test]
    fn test_collect_metrics_mean_and_std_err() {
        let table = table_with(&[("Model01", 0.6), ("Model01", 0.8), ("Model02", 0.9)]);
        let summaries = table.collect_metrics();
        assert_eq!(summaries.len(), 3);
        assert_abs_diff_eq!(summaries[0].mean, 0.7, epsilon = 1e-12);
        assert_eq!(summaries[0].n, 2);
        assert_abs_diff_eq!(summaries[0].std_err, 0.1, epsilon = 1e-12);
        assert_eq!(summaries[1].n, 1);
        assert!(summaries[1].std_err.is_nan());
        assert!(summaries[2].mean.is_nan());
    }

    #[test]
    fn test_select_best_prefers_first_on_ties_and_skips_nan() {
        let table = table_with(&[
            ("Model01", f64::NAN),
            ("Model02", 0.8),
            ("Model03", 0.8),
        ]);
        assert_eq!(table.select_best(Metric::Accuracy).unwrap().id, "Model02");
        let best = table.show_best(Metric::Accuracy, 3).unwrap();
        let ids: Vec<&str> = best.iter().map(|s| s.config_id.as_str()).collect();
        assert_eq!(ids, ["Model02", "Model03", "Model01"]);
    }

    #[test]
    fn test_select_best_errors() {
        let table = table_with(&[("Model01", f64::NAN)]);
        assert!(matches!(
            table.select_best(Metric::Accuracy),
            Err(TuneError::NoFiniteEstimate(Metric::Accuracy))
        ));
        assert!(matches!(
            table.select_best(Metric::RocAuc),
            Err(TuneError::MetricNotComputed(Metric::RocAuc))
        ));
    }

    fn regression_setup() -> (Table, Workflow, Grid) {
        let values = Array2::from_shape_fn((60, 3), |(i, j)| {
            let x = i as f64 / 6.0;
            match j {
                0 => x.sin() * 2.0 + 0.1 * ((i * 7) % 5) as f64,
                1 => x,
                _ => ((i * 13) % 11) as f64,
            }
        });
        let data = Table::new(vec!["y".into(), "x".into(), "noise".into()], values).unwrap();
        let spec = ModelSpec::new(ModelFamily::NearestNeighbor, Mode::Regression)
            .tune("neighbors")
            .unwrap()
            .set_range(
                "neighbors",
                ParamRange {
                    lower: 1.0,
                    upper: 9.0,
                    transform: Transform::Identity,
                    integer: true,
                },
            )
            .unwrap();
        let grid = regular_grid(&spec.tunable(), 3).unwrap();
        let workflow = Workflow::new(Recipe::new("y ~ x", &data).unwrap(), spec);
        (data, workflow, grid)
    }

    #[test]
    fn test_grid_search_parallel_matches_sequential() {
        let (data, workflow, grid) = regression_setup();
        let resamples = Resamples {
            data: &data,
            folds: vfold_cv(&data, 5, None, 500).unwrap(),
        };
        let metrics = MetricSet::new(&[Metric::Rmse, Metric::Rsq]).unwrap();

        let sequential = GridSearch::new()
            .evaluate(&workflow, &resamples, &grid, &metrics)
            .unwrap();
        assert_eq!(sequential.estimates().len(), 3 * 5 * 2);

        let pool = WorkerPool::new(2).unwrap();
        let parallel = GridSearch::with_pool(&pool)
            .evaluate(&workflow, &resamples, &grid, &metrics)
            .unwrap();
        pool.shutdown();
        assert_eq!(sequential, parallel);

        let best = GridSearch::new().select_best(&sequential, Metric::Rmse).unwrap();
        assert!(grid.contains(&best));
    }

    #[test]
    fn test_grid_search_fails_when_every_pair_fails() {
        let (data, workflow, grid) = regression_setup();
        let resamples = Resamples {
            data: &data,
            folds: vfold_cv(&data, 3, None, 1).unwrap(),
        };
        // Scoring a regression model with a class metric fails on every pair.
        let metrics = MetricSet::new(&[Metric::Accuracy]).unwrap();
        match GridSearch::new().evaluate(&workflow, &resamples, &grid, &metrics) {
            Err(TuneError::AllEvaluationsFailed { attempted, .. }) => assert_eq!(attempted, 9),
            other => panic!("expected AllEvaluationsFailed, got {other:?}"),
        }
    }
}
