//! # Performance Metrics
//!
//! Estimators that score predictions against observed outcomes.
//!
//! - Class metrics: `accuracy`, `kap` (Cohen's kappa).
//! - Class probability metrics: `roc_auc` (Mann-Whitney with mid-ranks for two
//!   classes, Hand-Till for more), `mn_log_loss`.
//! - Numeric metrics: `rmse`, `rsq` (squared Pearson correlation), `mae`.
//!
//! An estimate that is undefined for the data at hand (AUC with a single
//! observed class, R-squared of a constant) is `NaN`, never an error.

use crate::model::{Mode, Predictions};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Probabilities are clamped away from zero before taking logs.
const LOG_LOSS_EPS: f64 = 1e-15;

#[derive(Error, Debug)]
pub enum MetricError {
    #[error("Unknown metric '{0}'. Expected one of: roc_auc, accuracy, kap, mn_log_loss, rmse, rsq, mae.")]
    Unknown(String),
    #[error("A metric set needs at least one metric.")]
    Empty,
    #[error("Metric '{metric}' is a {expected} metric and cannot score a {mode} model.")]
    ModeMismatch {
        metric: Metric,
        expected: Mode,
        mode: Mode,
    },
    #[error("Metric '{0}' needs class probabilities, but the model does not produce them. Enable prob_model.")]
    ProbabilitiesRequired(Metric),
    #[error("Truth has {truth} rows but there are {predicted} predictions.")]
    LengthMismatch { truth: usize, predicted: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Maximize,
    Minimize,
}

impl Direction {
    /// `true` if `candidate` is strictly better than `incumbent`.
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Direction::Maximize => candidate > incumbent,
            Direction::Minimize => candidate < incumbent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    RocAuc,
    Accuracy,
    #[serde(alias = "kappa")]
    Kap,
    MnLogLoss,
    Rmse,
    Rsq,
    Mae,
}

impl Metric {
    pub fn name(self) -> &'static str {
        match self {
            Metric::RocAuc => "roc_auc",
            Metric::Accuracy => "accuracy",
            Metric::Kap => "kap",
            Metric::MnLogLoss => "mn_log_loss",
            Metric::Rmse => "rmse",
            Metric::Rsq => "rsq",
            Metric::Mae => "mae",
        }
    }

    pub fn direction(self) -> Direction {
        match self {
            Metric::RocAuc | Metric::Accuracy | Metric::Kap | Metric::Rsq => Direction::Maximize,
            Metric::MnLogLoss | Metric::Rmse | Metric::Mae => Direction::Minimize,
        }
    }

    pub fn mode(self) -> Mode {
        match self {
            Metric::RocAuc | Metric::Accuracy | Metric::Kap | Metric::MnLogLoss => {
                Mode::Classification
            }
            Metric::Rmse | Metric::Rsq | Metric::Mae => Mode::Regression,
        }
    }

    pub fn needs_probabilities(self) -> bool {
        matches!(self, Metric::RocAuc | Metric::MnLogLoss)
    }

    /// Scores `predictions` against `truth`.
    pub fn estimate(self, truth: &Array1<f64>, predictions: &Predictions) -> Result<f64, MetricError> {
        if truth.len() != predictions.len() {
            return Err(MetricError::LengthMismatch {
                truth: truth.len(),
                predicted: predictions.len(),
            });
        }
        let mode = match predictions {
            Predictions::Classes { .. } => Mode::Classification,
            Predictions::Numeric(_) => Mode::Regression,
        };
        if self.mode() != mode {
            return Err(MetricError::ModeMismatch {
                metric: self,
                expected: self.mode(),
                mode,
            });
        }

        match predictions {
            Predictions::Numeric(estimate) => Ok(match self {
                Metric::Rmse => rmse(truth.view(), estimate.view()),
                Metric::Mae => mae(truth.view(), estimate.view()),
                _ => rsq(truth.view(), estimate.view()),
            }),
            Predictions::Classes {
                classes,
                predicted,
                probabilities,
            } => match self {
                Metric::Accuracy => Ok(accuracy(truth.view(), predicted.view())),
                Metric::Kap => Ok(kappa(truth.view(), predicted.view())),
                _ => {
                    let probs = probabilities
                        .as_ref()
                        .ok_or(MetricError::ProbabilitiesRequired(self))?;
                    let column = |label: f64| classes.iter().position(|&c| c == label);
                    Ok(if self == Metric::RocAuc {
                        roc_auc(truth.view(), classes, |row, k| probs[[row, k]])
                    } else {
                        let total: f64 = truth
                            .iter()
                            .enumerate()
                            .map(|(row, &t)| {
                                let p = column(t).map_or(0.0, |k| probs[[row, k]]);
                                -p.max(LOG_LOSS_EPS).ln()
                            })
                            .sum();
                        total / truth.len() as f64
                    })
                }
            },
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = MetricError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text.trim() {
            "roc_auc" => Ok(Metric::RocAuc),
            "accuracy" => Ok(Metric::Accuracy),
            "kap" | "kappa" => Ok(Metric::Kap),
            "mn_log_loss" => Ok(Metric::MnLogLoss),
            "rmse" => Ok(Metric::Rmse),
            "rsq" => Ok(Metric::Rsq),
            "mae" => Ok(Metric::Mae),
            other => Err(MetricError::Unknown(other.to_string())),
        }
    }
}

/// One metric value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricEstimate {
    pub metric: Metric,
    pub estimate: f64,
}

/// A fixed, ordered set of metrics shared by every iteration of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSet {
    metrics: Vec<Metric>,
}

impl MetricSet {
    /// Duplicates are dropped, keeping first occurrence order.
    pub fn new(metrics: &[Metric]) -> Result<Self, MetricError> {
        if metrics.is_empty() {
            return Err(MetricError::Empty);
        }
        let mut unique = Vec::with_capacity(metrics.len());
        for &m in metrics {
            if !unique.contains(&m) {
                unique.push(m);
            }
        }
        Ok(Self { metrics: unique })
    }

    /// The usual metrics for a mode.
    pub fn default_for(mode: Mode) -> Self {
        let metrics = match mode {
            Mode::Classification => vec![Metric::RocAuc, Metric::Accuracy, Metric::Kap],
            Mode::Regression => vec![Metric::Rmse, Metric::Rsq, Metric::Mae],
        };
        Self { metrics }
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn contains(&self, metric: Metric) -> bool {
        self.metrics.contains(&metric)
    }

    /// Checks every metric can score a model of this mode.
    pub fn validate(&self, mode: Mode, prob_model: bool) -> Result<(), MetricError> {
        for &metric in &self.metrics {
            if metric.mode() != mode {
                return Err(MetricError::ModeMismatch {
                    metric,
                    expected: metric.mode(),
                    mode,
                });
            }
            if metric.needs_probabilities() && !prob_model {
                return Err(MetricError::ProbabilitiesRequired(metric));
            }
        }
        Ok(())
    }

    pub fn compute(
        &self,
        truth: &Array1<f64>,
        predictions: &Predictions,
    ) -> Result<Vec<MetricEstimate>, MetricError> {
        self.metrics
            .iter()
            .map(|&metric| {
                Ok(MetricEstimate {
                    metric,
                    estimate: metric.estimate(truth, predictions)?,
                })
            })
            .collect()
    }
}

fn accuracy(truth: ArrayView1<f64>, predicted: ArrayView1<f64>) -> f64 {
    if truth.is_empty() {
        return f64::NAN;
    }
    let hits = truth.iter().zip(predicted.iter()).filter(|(t, p)| t == p).count();
    hits as f64 / truth.len() as f64
}

fn kappa(truth: ArrayView1<f64>, predicted: ArrayView1<f64>) -> f64 {
    let n = truth.len() as f64;
    if n == 0.0 {
        return f64::NAN;
    }
    let mut labels: Vec<f64> = truth.iter().chain(predicted.iter()).copied().collect();
    labels.sort_by(f64::total_cmp);
    labels.dedup();

    let observed = accuracy(truth, predicted);
    let expected: f64 = labels
        .iter()
        .map(|&label| {
            let t = truth.iter().filter(|&&v| v == label).count() as f64;
            let p = predicted.iter().filter(|&&v| v == label).count() as f64;
            (t / n) * (p / n)
        })
        .sum();
    if (1.0 - expected).abs() < f64::EPSILON {
        return f64::NAN;
    }
    (observed - expected) / (1.0 - expected)
}

/// Mid-ranks (1-based) of `scores`.
fn mid_ranks(scores: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));
    let mut ranks = vec![0.0; scores.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start;
        while end + 1 < order.len() && scores[order[end + 1]] == scores[order[start]] {
            end += 1;
        }
        let rank = (start + end) as f64 / 2.0 + 1.0;
        for &i in &order[start..=end] {
            ranks[i] = rank;
        }
        start = end + 1;
    }
    ranks
}

/// Probability that a random positive scores above a random negative.
fn mann_whitney(positive_scores: &[f64], negative_scores: &[f64]) -> f64 {
    let n1 = positive_scores.len() as f64;
    let n0 = negative_scores.len() as f64;
    if n1 == 0.0 || n0 == 0.0 {
        return f64::NAN;
    }
    let all: Vec<f64> = positive_scores.iter().chain(negative_scores).copied().collect();
    let ranks = mid_ranks(&all);
    let rank_sum: f64 = ranks[..positive_scores.len()].iter().sum();
    (rank_sum - n1 * (n1 + 1.0) / 2.0) / (n1 * n0)
}

fn roc_auc(truth: ArrayView1<f64>, classes: &[f64], prob: impl Fn(usize, usize) -> f64) -> f64 {
    let present: Vec<usize> = (0..classes.len())
        .filter(|&k| truth.iter().any(|&t| t == classes[k]))
        .collect();
    if present.len() < 2 {
        return f64::NAN;
    }

    // A(j | k): separation of class j from class k using the class-j probability.
    let pairwise = |j: usize, k: usize| {
        let mut pos = Vec::new();
        let mut neg = Vec::new();
        for (row, &t) in truth.iter().enumerate() {
            if t == classes[j] {
                pos.push(prob(row, j));
            } else if t == classes[k] {
                neg.push(prob(row, j));
            }
        }
        mann_whitney(&pos, &neg)
    };

    if classes.len() == 2 {
        return pairwise(1, 0);
    }
    let mut total = 0.0;
    let mut pairs = 0usize;
    for (a, &j) in present.iter().enumerate() {
        for &k in &present[a + 1..] {
            total += (pairwise(j, k) + pairwise(k, j)) / 2.0;
            pairs += 1;
        }
    }
    total / pairs as f64
}

fn rmse(truth: ArrayView1<f64>, estimate: ArrayView1<f64>) -> f64 {
    let n = truth.len() as f64;
    (truth.iter().zip(estimate.iter()).map(|(t, e)| (t - e).powi(2)).sum::<f64>() / n).sqrt()
}

fn mae(truth: ArrayView1<f64>, estimate: ArrayView1<f64>) -> f64 {
    let n = truth.len() as f64;
    truth.iter().zip(estimate.iter()).map(|(t, e)| (t - e).abs()).sum::<f64>() / n
}

fn rsq(truth: ArrayView1<f64>, estimate: ArrayView1<f64>) -> f64 {
    let n = truth.len() as f64;
    if n < 2.0 {
        return f64::NAN;
    }
    let mt = truth.sum() / n;
    let me = estimate.sum() / n;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (t, e) in truth.iter().zip(estimate.iter()) {
        sxy += (t - mt) * (e - me);
        sxx += (t - mt).powi(2);
        syy += (e - me).powi(2);
    }
    if sxx == 0.0 || syy == 0.0 {
        return f64::NAN;
    }
    sxy * sxy / (sxx * syy)
}
