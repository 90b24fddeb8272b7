//! # Elastic-Net Linear Models
//!
//! Regression fits a Gaussian linear model; classification fits logistic
//! regression, one binary model per class when there are more than two. Both
//! minimize the penalized objective
//!
//! ```text
//! (1 / 2n) * sum_i w_i (z_i - b0 - x_i' beta)^2
//!     + penalty * (mixture * |beta|_1 + (1 - mixture) / 2 * |beta|_2^2)
//! ```
//!
//! by cyclic coordinate descent with soft thresholding. The logistic model
//! wraps this in iteratively reweighted least squares, where `w` and `z` are
//! the working weights and response of each outer iteration. The intercept is
//! never penalized.

use super::{
    EngineOptions, ModelError, Mode, Predictions, Standardizer, apply_standardizer, class_labels,
    maybe_standardize, normalize_rows,
};
use ndarray::{Array1, Array2, ArrayView1, Zip};
use serde::{Deserialize, Serialize};

/// Upper bound on IRLS outer iterations.
const MAX_IRLS_ITERATIONS: usize = 50;
const MIN_WEIGHT: f64 = 1e-6;
const PROB_EPS: f64 = 1e-8;

/// `b0 + x' beta` on the engine's (possibly standardized) scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearPredictor {
    pub intercept: f64,
    pub coefficients: Array1<f64>,
}

impl LinearPredictor {
    fn eta(&self, x: &Array2<f64>) -> Array1<f64> {
        x.dot(&self.coefficients) + self.intercept
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElasticNetModel {
    scaler: Option<Standardizer>,
    /// Present for classification.
    classes: Option<Vec<f64>>,
    predictors: Vec<LinearPredictor>,
}

impl ElasticNetModel {
    pub fn linear_predictors(&self) -> &[LinearPredictor] {
        &self.predictors
    }

    pub fn predict(&self, x: &Array2<f64>) -> Predictions {
        let x = apply_standardizer(&self.scaler, x);
        let Some(classes) = &self.classes else {
            return Predictions::Numeric(self.predictors[0].eta(&x));
        };

        let n = x.nrows();
        let mut probs = Array2::zeros((n, classes.len()));
        if self.predictors.len() == 1 {
            let p = self.predictors[0].eta(&x).mapv(sigmoid);
            probs.column_mut(0).assign(&p.mapv(|v| 1.0 - v));
            probs.column_mut(1).assign(&p);
        } else {
            for (k, predictor) in self.predictors.iter().enumerate() {
                probs.column_mut(k).assign(&predictor.eta(&x).mapv(sigmoid));
            }
            probs = normalize_rows(probs);
        }
        Predictions::from_scores(classes, &probs, Some(probs.clone()))
    }
}

fn sigmoid(eta: f64) -> f64 {
    1.0 / (1.0 + (-eta.clamp(-700.0, 700.0)).exp())
}

fn soft_threshold(value: f64, threshold: f64) -> f64 {
    if value > threshold {
        value - threshold
    } else if value < -threshold {
        value + threshold
    } else {
        0.0
    }
}

pub fn fit(
    x: &Array2<f64>,
    y: &Array1<f64>,
    mode: Mode,
    penalty: f64,
    mixture: f64,
    options: &EngineOptions,
) -> Result<ElasticNetModel, ModelError> {
    let classes = match mode {
        Mode::Classification => Some(class_labels(y)?),
        Mode::Regression => None,
    };
    let (scaler, x) = maybe_standardize(x, options.scaled);

    let predictors = match &classes {
        None => {
            let weights = Array1::ones(x.nrows());
            let mut fit = LinearPredictor {
                intercept: 0.0,
                coefficients: Array1::zeros(x.ncols()),
            };
            coordinate_descent(&x, y.view(), weights.view(), penalty, mixture, &mut fit, options);
            vec![fit]
        }
        Some(classes) => {
            let positives: Vec<f64> = if classes.len() == 2 {
                vec![classes[1]]
            } else {
                classes.clone()
            };
            positives
                .iter()
                .map(|&c| {
                    let target = y.mapv(|v| (v == c) as u8 as f64);
                    logistic(&x, &target, penalty, mixture, options)
                })
                .collect()
        }
    };

    Ok(ElasticNetModel {
        scaler,
        classes,
        predictors,
    })
}

/// Penalized weighted least squares, warm-started from `fit`.
fn coordinate_descent(
    x: &Array2<f64>,
    z: ArrayView1<f64>,
    w: ArrayView1<f64>,
    penalty: f64,
    mixture: f64,
    fit: &mut LinearPredictor,
    options: &EngineOptions,
) {
    let n = x.nrows() as f64;
    let l1 = penalty * mixture;
    let l2 = penalty * (1.0 - mixture);
    let total_weight = w.sum();
    let curvature: Vec<f64> = x
        .columns()
        .into_iter()
        .map(|col| Zip::from(&col).and(&w).fold(0.0, |acc, &xi, &wi| acc + wi * xi * xi) / n)
        .collect();

    let mut residual = &z - &fit.eta(x);
    for _ in 0..options.max_iter {
        let shift = Zip::from(&residual).and(&w).fold(0.0, |acc, &r, &wi| acc + wi * r) / total_weight;
        fit.intercept += shift;
        residual -= shift;
        let mut max_change = shift.abs();

        for (j, col) in x.columns().into_iter().enumerate() {
            if curvature[j] == 0.0 {
                continue;
            }
            let old = fit.coefficients[j];
            let rho = Zip::from(&col)
                .and(&w)
                .and(&residual)
                .fold(0.0, |acc, &xi, &wi, &r| acc + wi * xi * r)
                / n
                + curvature[j] * old;
            let new = soft_threshold(rho, l1) / (curvature[j] + l2);
            let delta = new - old;
            if delta != 0.0 {
                residual.scaled_add(-delta, &col);
                fit.coefficients[j] = new;
                max_change = max_change.max(delta.abs() * curvature[j].sqrt());
            }
        }
        if max_change < options.tolerance {
            break;
        }
    }
}

/// Binomial deviance of 0/1 targets.
fn deviance(y: &Array1<f64>, mu: &Array1<f64>) -> f64 {
    -2.0 * Zip::from(y).and(mu).fold(0.0, |acc, &yi, &mi| {
        let m = mi.clamp(PROB_EPS, 1.0 - PROB_EPS);
        acc + yi * m.ln() + (1.0 - yi) * (1.0 - m).ln()
    })
}

fn logistic(
    x: &Array2<f64>,
    y: &Array1<f64>,
    penalty: f64,
    mixture: f64,
    options: &EngineOptions,
) -> LinearPredictor {
    let prevalence = y.mean().unwrap_or(0.5).clamp(PROB_EPS, 1.0 - PROB_EPS);
    let mut fit = LinearPredictor {
        intercept: (prevalence / (1.0 - prevalence)).ln(),
        coefficients: Array1::zeros(x.ncols()),
    };
    let mut last_deviance = f64::INFINITY;
    for iteration in 0..MAX_IRLS_ITERATIONS {
        let eta = fit.eta(x).mapv(|e| e.clamp(-700.0, 700.0));
        let mu = eta.mapv(sigmoid).mapv(|m| m.clamp(PROB_EPS, 1.0 - PROB_EPS));
        let weights = (&mu * &mu.mapv(|m| 1.0 - m)).mapv(|v| v.max(MIN_WEIGHT));
        let working = &eta + &((y - &mu) / &weights);

        coordinate_descent(x, working.view(), weights.view(), penalty, mixture, &mut fit, options);

        let current = deviance(y, &fit.eta(x).mapv(sigmoid));
        if (last_deviance - current).abs() / (current.abs() + 0.1) < options.tolerance {
            log::trace!("IRLS converged after {} iterations", iteration + 1);
            break;
        }
        last_deviance = current;
    }
    fit
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Axis, array};

    fn exact() -> EngineOptions {
        EngineOptions {
            scaled: false,
            tolerance: 1e-10,
            max_iter: 10_000,
            ..EngineOptions::default()
        }
    }

    #[test]
    fn test_soft_threshold() {
        assert_eq!(soft_threshold(3.0, 1.0), 2.0);
        assert_eq!(soft_threshold(-3.0, 1.0), -2.0);
        assert_eq!(soft_threshold(0.5, 1.0), 0.0);
    }

    #[test]
    fn test_unpenalized_gaussian_recovers_least_squares() {
        let x = Array2::from_shape_fn((30, 2), |(i, j)| if j == 0 { i as f64 } else { ((i * i) % 11) as f64 });
        let y = x.column(0).mapv(|v| 2.0 * v) - x.column(1).mapv(|v| 0.5 * v) + 1.0;
        let model = fit(&x, &y, Mode::Regression, 0.0, 1.0, &exact()).unwrap();
        let lp = &model.linear_predictors()[0];
        assert_abs_diff_eq!(lp.intercept, 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(lp.coefficients[0], 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(lp.coefficients[1], -0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_large_lasso_penalty_zeroes_coefficients() {
        let x = array![[1.0, 0.0], [2.0, 1.0], [3.0, 0.0], [4.0, 1.0]];
        let y = array![1.0, 2.0, 3.0, 4.0];
        let model = fit(&x, &y, Mode::Regression, 100.0, 1.0, &exact()).unwrap();
        let lp = &model.linear_predictors()[0];
        assert!(lp.coefficients.iter().all(|&b| b == 0.0));
        assert_abs_diff_eq!(lp.intercept, 2.5, epsilon = 1e-9);
    }

    #[test]
    fn test_ridge_shrinks_toward_zero() {
        let x = Array2::from_shape_fn((20, 1), |(i, _)| i as f64);
        let y = x.column(0).mapv(|v| 3.0 * v);
        let free = fit(&x, &y, Mode::Regression, 0.0, 0.0, &exact()).unwrap();
        let ridge = fit(&x, &y, Mode::Regression, 5.0, 0.0, &exact()).unwrap();
        let slope = |m: &ElasticNetModel| m.linear_predictors()[0].coefficients[0];
        assert!(slope(&ridge) < slope(&free));
        assert!(slope(&ridge) > 0.0);
    }

    #[test]
    fn test_logistic_classification() {
        let x = Array2::from_shape_fn((40, 1), |(i, _)| i as f64 / 4.0 - 5.0);
        let y = Array1::from_shape_fn(40, |i| if (i * 7) % 40 < 20 { 0.0 } else { 1.0 });
        let y_signal = Array1::from_shape_fn(40, |i| if x[[i, 0]] > 0.0 { 1.0 } else { 0.0 });
        let options = EngineOptions::default();

        let model = fit(&x, &y_signal, Mode::Classification, 0.01, 0.5, &options).unwrap();
        let Predictions::Classes { predicted, probabilities: Some(p), .. } = model.predict(&x) else {
            panic!("expected class probabilities");
        };
        let correct = predicted.iter().zip(&y_signal).filter(|(a, b)| a == b).count();
        assert!(correct >= 38);
        for row in p.axis_iter(Axis(0)) {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }

        // Noise labels still fit without error.
        assert!(fit(&x, &y, Mode::Classification, 0.1, 1.0, &options).is_ok());
    }

    #[test]
    fn test_multiclass_logistic_has_one_predictor_per_class() {
        let x = Array2::from_shape_fn((30, 1), |(i, _)| (i / 10) as f64 * 3.0 + (i % 10) as f64 * 0.05);
        let y = Array1::from_shape_fn(30, |i| (i / 10) as f64);
        let model = fit(&x, &y, Mode::Classification, 0.001, 0.0, &EngineOptions::default()).unwrap();
        assert_eq!(model.linear_predictors().len(), 3);
        let Predictions::Classes { classes, .. } = model.predict(&x) else {
            panic!("expected class predictions");
        };
        assert_eq!(classes, vec![0.0, 1.0, 2.0]);
    }
}
