//! # Radial-Basis Support Vector Machines
//!
//! Two engines share the kernel `K(a, b) = exp(-sigma * ||a - b||^2)`:
//!
//! - `smo`: the soft-margin dual solved by sequential minimal optimization,
//!   classification only. Multiclass problems use one machine per class.
//! - `lssvm`: the least-squares SVM. Every machine is one bordered linear
//!   system, so the engine handles regression as well as classification.
//!
//! Class probabilities come from Platt scaling of each machine's decision
//! values on its own training rows.

use super::{
    EngineOptions, ModelError, Mode, Predictions, Standardizer, apply_standardizer, class_labels,
    maybe_standardize, normalize_rows,
};
use ndarray::{Array1, Array2, ArrayView1, Axis, Zip, s};
use ndarray_linalg::Solve;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Kernel matrices are built eagerly; larger training sets are rejected.
const MAX_KERNEL_ROWS: usize = 10_000;
/// Full sweeps without any update before SMO declares convergence.
const SMO_QUIET_PASSES: usize = 5;
/// Multipliers below this are not support vectors.
const SUPPORT_THRESHOLD: f64 = 1e-8;

fn rbf(a: ArrayView1<f64>, b: ArrayView1<f64>, sigma: f64) -> f64 {
    let d2: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum();
    (-sigma * d2).exp()
}

fn kernel_matrix(x: &Array2<f64>, sigma: f64) -> Array2<f64> {
    let n = x.nrows();
    let rows: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|i| (0..n).map(|j| rbf(x.row(i), x.row(j), sigma)).collect())
        .collect();
    Array2::from_shape_fn((n, n), |(i, j)| rows[i][j])
}

/// Kernel values between every row of `x` and every row of `basis`.
fn cross_kernel(x: &Array2<f64>, basis: &Array2<f64>, sigma: f64) -> Array2<f64> {
    let mut k = Array2::zeros((x.nrows(), basis.nrows()));
    Zip::from(k.rows_mut())
        .and(x.rows())
        .par_for_each(|mut out, row| {
            for (slot, sv) in out.iter_mut().zip(basis.rows()) {
                *slot = rbf(row, sv, sigma);
            }
        });
    k
}

fn check_rows(n: usize) -> Result<(), ModelError> {
    if n > MAX_KERNEL_ROWS {
        return Err(ModelError::TooManyRows {
            found: n,
            limit: MAX_KERNEL_ROWS,
        });
    }
    Ok(())
}

/// Sigmoid calibration `P(y = +1 | f) = 1 / (1 + exp(a * f + b))`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlattScaling {
    pub a: f64,
    pub b: f64,
}

impl PlattScaling {
    /// Newton's method with backtracking on the regularized targets of Lin,
    /// Lin and Weng.
    pub fn fit(decision: &[f64], positive: &[bool]) -> Self {
        let prior1 = positive.iter().filter(|&&p| p).count() as f64;
        let prior0 = positive.len() as f64 - prior1;
        let hi = (prior1 + 1.0) / (prior1 + 2.0);
        let lo = 1.0 / (prior0 + 2.0);
        let targets: Vec<f64> = positive.iter().map(|&p| if p { hi } else { lo }).collect();

        let objective = |a: f64, b: f64| -> f64 {
            decision
                .iter()
                .zip(&targets)
                .map(|(&f, &t)| {
                    let z = f * a + b;
                    if z >= 0.0 {
                        t * z + (-z).exp().ln_1p()
                    } else {
                        (t - 1.0) * z + z.exp().ln_1p()
                    }
                })
                .sum()
        };

        let mut a = 0.0;
        let mut b = ((prior0 + 1.0) / (prior1 + 1.0)).ln();
        let mut fval = objective(a, b);
        for _ in 0..100 {
            let (mut h11, mut h22, mut h21, mut g1, mut g2) = (1e-12, 1e-12, 0.0, 0.0, 0.0);
            for (&f, &t) in decision.iter().zip(&targets) {
                let z = f * a + b;
                let (p, q) = if z >= 0.0 {
                    let e = (-z).exp();
                    (e / (1.0 + e), 1.0 / (1.0 + e))
                } else {
                    let e = z.exp();
                    (1.0 / (1.0 + e), e / (1.0 + e))
                };
                let d2 = p * q;
                h11 += f * f * d2;
                h22 += d2;
                h21 += f * d2;
                let d1 = t - p;
                g1 += f * d1;
                g2 += d1;
            }
            if g1.abs() < 1e-5 && g2.abs() < 1e-5 {
                break;
            }

            let det = h11 * h22 - h21 * h21;
            let da = -(h22 * g1 - h21 * g2) / det;
            let db = -(-h21 * g1 + h11 * g2) / det;
            let gd = g1 * da + g2 * db;

            let mut step = 1.0;
            while step >= 1e-10 {
                let (na, nb) = (a + step * da, b + step * db);
                let nf = objective(na, nb);
                if nf < fval + 1e-4 * step * gd {
                    a = na;
                    b = nb;
                    fval = nf;
                    break;
                }
                step /= 2.0;
            }
            if step < 1e-10 {
                log::debug!("Platt scaling line search stalled; keeping a={a:.4}, b={b:.4}");
                break;
            }
        }
        Self { a, b }
    }

    pub fn probability(&self, decision: f64) -> f64 {
        let z = decision * self.a + self.b;
        if z >= 0.0 {
            let e = (-z).exp();
            e / (1.0 + e)
        } else {
            1.0 / (1.0 + z.exp())
        }
    }
}

/// One kernel machine: `f(x) = sum_s coef_s K(sv_s, x) + bias`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelMachine {
    support_vectors: Array2<f64>,
    coefficients: Array1<f64>,
    bias: f64,
    platt: Option<PlattScaling>,
}

impl KernelMachine {
    fn decision(&self, x: &Array2<f64>, sigma: f64) -> Array1<f64> {
        cross_kernel(x, &self.support_vectors, sigma).dot(&self.coefficients) + self.bias
    }

    pub fn n_support(&self) -> usize {
        self.support_vectors.nrows()
    }
}

/// The positive class of each machine. Two classes need a single machine.
fn machine_targets(y: &Array1<f64>, classes: &[f64]) -> Vec<Vec<bool>> {
    let positives: Vec<f64> = if classes.len() == 2 {
        vec![classes[1]]
    } else {
        classes.to_vec()
    };
    positives
        .iter()
        .map(|&c| y.iter().map(|&v| v == c).collect())
        .collect()
}

/// Turns machine decision values into class predictions.
fn classify(
    machines: &[KernelMachine],
    classes: &[f64],
    x: &Array2<f64>,
    sigma: f64,
) -> Predictions {
    let n = x.nrows();
    let decisions: Vec<Array1<f64>> = machines.iter().map(|m| m.decision(x, sigma)).collect();
    let calibrated = machines.iter().all(|m| m.platt.is_some());

    let probabilities = calibrated.then(|| {
        let mut probs = Array2::zeros((n, classes.len()));
        if machines.len() == 1 {
            let platt = machines[0].platt.unwrap_or(PlattScaling { a: -1.0, b: 0.0 });
            for (i, &f) in decisions[0].iter().enumerate() {
                let p = platt.probability(f);
                probs[[i, 0]] = 1.0 - p;
                probs[[i, 1]] = p;
            }
            probs
        } else {
            for (k, (machine, decision)) in machines.iter().zip(&decisions).enumerate() {
                if let Some(platt) = machine.platt {
                    for (i, &f) in decision.iter().enumerate() {
                        probs[[i, k]] = platt.probability(f);
                    }
                }
            }
            normalize_rows(probs)
        }
    });

    let scores = match &probabilities {
        Some(p) => p.clone(),
        None if machines.len() == 1 => {
            let mut s = Array2::zeros((n, 2));
            s.column_mut(1).assign(&decisions[0]);
            s
        }
        None => {
            let mut s = Array2::zeros((n, classes.len()));
            for (k, d) in decisions.iter().enumerate() {
                s.column_mut(k).assign(d);
            }
            s
        }
    };
    Predictions::from_scores(classes, &scores, probabilities)
}

/// A fitted `smo` classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SvmModel {
    sigma: f64,
    scaler: Option<Standardizer>,
    classes: Vec<f64>,
    machines: Vec<KernelMachine>,
}

impl SvmModel {
    pub fn predict(&self, x: &Array2<f64>) -> Predictions {
        let x = apply_standardizer(&self.scaler, x);
        classify(&self.machines, &self.classes, &x, self.sigma)
    }

    pub fn machines(&self) -> &[KernelMachine] {
        &self.machines
    }
}

pub fn fit_smo(
    x: &Array2<f64>,
    y: &Array1<f64>,
    cost: f64,
    sigma: f64,
    options: &EngineOptions,
) -> Result<SvmModel, ModelError> {
    check_rows(x.nrows())?;
    let classes = class_labels(y)?;
    let (scaler, x) = maybe_standardize(x, options.scaled);
    let k = kernel_matrix(&x, sigma);

    let mut rng = ChaCha8Rng::seed_from_u64(options.seed);
    let machines = machine_targets(y, &classes)
        .into_iter()
        .map(|positive| {
            let signs: Array1<f64> = positive.iter().map(|&p| if p { 1.0 } else { -1.0 }).collect();
            let (alphas, bias) = smo(&k, &signs, cost, options, &mut rng);
            let support: Vec<usize> = (0..alphas.len())
                .filter(|&i| alphas[i] > SUPPORT_THRESHOLD)
                .collect();
            let machine = KernelMachine {
                support_vectors: x.select(Axis(0), &support),
                coefficients: support.iter().map(|&i| alphas[i] * signs[i]).collect(),
                bias,
                platt: None,
            };
            calibrate(machine, &x, &positive, sigma, options.prob_model)
        })
        .collect();

    Ok(SvmModel {
        sigma,
        scaler,
        classes,
        machines,
    })
}

fn calibrate(
    mut machine: KernelMachine,
    x: &Array2<f64>,
    positive: &[bool],
    sigma: f64,
    prob_model: bool,
) -> KernelMachine {
    if prob_model {
        let decision = machine.decision(x, sigma).to_vec();
        machine.platt = Some(PlattScaling::fit(&decision, positive));
    }
    machine
}

/// Simplified SMO with a random second multiplier. Returns the multipliers and bias.
fn smo(
    k: &Array2<f64>,
    y: &Array1<f64>,
    cost: f64,
    options: &EngineOptions,
    rng: &mut ChaCha8Rng,
) -> (Array1<f64>, f64) {
    let n = y.len();
    let tol = options.tolerance;
    let mut alphas = Array1::<f64>::zeros(n);
    let mut bias = 0.0;
    // Cached f(x_i) without the bias.
    let mut f = Array1::<f64>::zeros(n);

    let mut quiet = 0;
    let mut sweeps = 0;
    while quiet < SMO_QUIET_PASSES && sweeps < options.max_iter && n > 1 {
        let mut changed = 0;
        for i in 0..n {
            let e_i = f[i] + bias - y[i];
            let violates = (y[i] * e_i < -tol && alphas[i] < cost) || (y[i] * e_i > tol && alphas[i] > 0.0);
            if !violates {
                continue;
            }
            let j = loop {
                let j = rng.gen_range(0..n);
                if j != i {
                    break j;
                }
            };
            let e_j = f[j] + bias - y[j];
            let (ai_old, aj_old) = (alphas[i], alphas[j]);
            let (lo, hi) = if y[i] != y[j] {
                ((aj_old - ai_old).max(0.0), (cost + aj_old - ai_old).min(cost))
            } else {
                ((ai_old + aj_old - cost).max(0.0), (ai_old + aj_old).min(cost))
            };
            if (hi - lo).abs() < 1e-12 {
                continue;
            }
            let eta = 2.0 * k[[i, j]] - k[[i, i]] - k[[j, j]];
            if eta >= 0.0 {
                continue;
            }
            let aj = (aj_old - y[j] * (e_i - e_j) / eta).clamp(lo, hi);
            if (aj - aj_old).abs() < 1e-8 {
                continue;
            }
            let ai = ai_old + y[i] * y[j] * (aj_old - aj);
            alphas[i] = ai;
            alphas[j] = aj;

            let di = y[i] * (ai - ai_old);
            let dj = y[j] * (aj - aj_old);
            let b1 = bias - e_i - di * k[[i, i]] - dj * k[[i, j]];
            let b2 = bias - e_j - di * k[[i, j]] - dj * k[[j, j]];
            bias = if ai > 0.0 && ai < cost {
                b1
            } else if aj > 0.0 && aj < cost {
                b2
            } else {
                (b1 + b2) / 2.0
            };
            f.scaled_add(di, &k.row(i));
            f.scaled_add(dj, &k.row(j));
            changed += 1;
        }
        sweeps += 1;
        quiet = if changed == 0 { quiet + 1 } else { 0 };
    }
    if sweeps >= options.max_iter {
        log::debug!("SMO stopped after {sweeps} sweeps without reaching the KKT tolerance");
    }
    (alphas, bias)
}

/// A fitted `lssvm` model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LsSvmModel {
    sigma: f64,
    scaler: Option<Standardizer>,
    /// Present for classification.
    classes: Option<Vec<f64>>,
    machines: Vec<KernelMachine>,
}

impl LsSvmModel {
    pub fn predict(&self, x: &Array2<f64>) -> Predictions {
        let x = apply_standardizer(&self.scaler, x);
        match &self.classes {
            Some(classes) => classify(&self.machines, classes, &x, self.sigma),
            None => Predictions::Numeric(self.machines[0].decision(&x, self.sigma)),
        }
    }
}

pub fn fit_lssvm(
    x: &Array2<f64>,
    y: &Array1<f64>,
    mode: Mode,
    cost: f64,
    sigma: f64,
    options: &EngineOptions,
) -> Result<LsSvmModel, ModelError> {
    let n = x.nrows();
    check_rows(n)?;
    let classes = match mode {
        Mode::Classification => Some(class_labels(y)?),
        Mode::Regression => None,
    };
    let (scaler, x) = maybe_standardize(x, options.scaled);

    // [0  1'     ] [b]   [0]
    // [1  K + I/C] [a] = [t]
    let mut system = Array2::<f64>::zeros((n + 1, n + 1));
    system.slice_mut(s![1.., 1..]).assign(&kernel_matrix(&x, sigma));
    for i in 1..=n {
        system[[0, i]] = 1.0;
        system[[i, 0]] = 1.0;
        system[[i, i]] += 1.0 / cost;
    }

    let solve = |targets: &Array1<f64>| -> Result<KernelMachine, ModelError> {
        let mut rhs = Array1::<f64>::zeros(n + 1);
        rhs.slice_mut(s![1..]).assign(targets);
        let solution = system.solve(&rhs)?;
        Ok(KernelMachine {
            support_vectors: x.clone(),
            coefficients: solution.slice(s![1..]).to_owned(),
            bias: solution[0],
            platt: None,
        })
    };

    let machines = match &classes {
        Some(classes) => machine_targets(y, classes)
            .into_iter()
            .map(|positive| {
                let signs: Array1<f64> =
                    positive.iter().map(|&p| if p { 1.0 } else { -1.0 }).collect();
                let machine = solve(&signs)?;
                Ok(calibrate(machine, &x, &positive, sigma, options.prob_model))
            })
            .collect::<Result<Vec<_>, ModelError>>()?,
        None => vec![solve(y)?],
    };

    Ok(LsSvmModel {
        sigma,
        scaler,
        classes,
        machines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// Two well separated clusters on the first axis.
    fn clusters() -> (Array2<f64>, Array1<f64>) {
        let mut x = Array2::zeros((40, 2));
        let mut y = Array1::zeros(40);
        for i in 0..40 {
            let class = (i % 2) as f64;
            x[[i, 0]] = class * 4.0 - 2.0 + (i as f64 * 0.37).sin() * 0.5;
            x[[i, 1]] = (i as f64 * 0.91).cos();
            y[i] = class;
        }
        (x, y)
    }

    fn accuracy(pred: &Predictions, y: &Array1<f64>) -> f64 {
        let Predictions::Classes { predicted, .. } = pred else {
            panic!("expected class predictions");
        };
        predicted.iter().zip(y).filter(|(p, t)| p == t).count() as f64 / y.len() as f64
    }

    #[test]
    fn test_smo_separates_clusters() {
        let (x, y) = clusters();
        let model = fit_smo(&x, &y, 1.0, 0.5, &EngineOptions::default()).unwrap();
        assert_eq!(model.machines().len(), 1);
        assert!(model.machines()[0].n_support() > 0);
        let pred = model.predict(&x);
        assert!(accuracy(&pred, &y) >= 0.95);

        let Predictions::Classes { probabilities: Some(p), classes, .. } = pred else {
            panic!("expected probabilities");
        };
        assert_eq!(classes, vec![0.0, 1.0]);
        for row in p.axis_iter(Axis(0)) {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_smo_is_reproducible_for_a_seed() {
        let (x, y) = clusters();
        let a = fit_smo(&x, &y, 0.5, 0.2, &EngineOptions::default()).unwrap();
        let b = fit_smo(&x, &y, 0.5, 0.2, &EngineOptions::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_smo_without_probabilities() {
        let (x, y) = clusters();
        let options = EngineOptions {
            prob_model: false,
            ..EngineOptions::default()
        };
        let model = fit_smo(&x, &y, 1.0, 0.5, &options).unwrap();
        let Predictions::Classes { probabilities, .. } = model.predict(&x) else {
            panic!("expected class predictions");
        };
        assert!(probabilities.is_none());
    }

    #[test]
    fn test_multiclass_uses_one_machine_per_class() {
        let x = Array2::from_shape_fn((30, 1), |(i, _)| (i / 10) as f64 * 5.0 + (i % 10) as f64 * 0.1);
        let y = Array1::from_shape_fn(30, |i| (i / 10) as f64);
        let model = fit_smo(&x, &y, 1.0, 2.0, &EngineOptions::default()).unwrap();
        assert_eq!(model.machines().len(), 3);
        assert!(accuracy(&model.predict(&x), &y) >= 0.9);
    }

    #[test]
    fn test_lssvm_regression_interpolates_smooth_curve() {
        let x = Array2::from_shape_fn((25, 1), |(i, _)| i as f64 / 24.0 * 3.0);
        let y = x.column(0).mapv(f64::sin);
        let options = EngineOptions {
            scaled: false,
            ..EngineOptions::default()
        };
        let model = fit_lssvm(&x, &y, Mode::Regression, 100.0, 1.0, &options).unwrap();
        let Predictions::Numeric(pred) = model.predict(&array![[1.5]]) else {
            panic!("expected numeric predictions");
        };
        assert_abs_diff_eq!(pred[0], 1.5f64.sin(), epsilon = 0.05);
    }

    #[test]
    fn test_lssvm_classification() {
        let (x, y) = clusters();
        let model = fit_lssvm(&x, &y, Mode::Classification, 1.0, 0.5, &EngineOptions::default())
            .unwrap();
        assert!(accuracy(&model.predict(&x), &y) >= 0.95);
    }

    #[test]
    fn test_platt_scaling_is_monotone() {
        let decision = [-2.0, -1.5, -1.0, -0.2, 0.3, 1.0, 1.4, 2.2];
        let positive = [false, false, false, true, false, true, true, true];
        let platt = PlattScaling::fit(&decision, &positive);
        assert!(platt.a < 0.0);
        assert!(platt.probability(2.0) > platt.probability(0.0));
        assert!(platt.probability(0.0) > platt.probability(-2.0));
    }
}
