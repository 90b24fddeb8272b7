//! # Model Specifications and Engines
//!
//! A `ModelSpec` names a model family, the engine that fits it, a task mode,
//! and the value of every main argument. A main argument is either fixed or a
//! `Tune` placeholder that a grid search resolves later. Only a finalized spec
//! (no placeholders left) can be fit.
//!
//! | family             | engines                   | main arguments            |
//! |--------------------|---------------------------|---------------------------|
//! | `svm_rbf`          | `smo`, `lssvm`            | `cost`, `rbf_sigma`       |
//! | `nearest_neighbor` | `brute_force`             | `neighbors`, `dist_power` |
//! | `elastic_net`      | `coordinate_descent`      | `penalty`, `mixture`      |
//!
//! `smo` only supports classification; every other engine supports both modes.

pub mod elastic_net;
pub mod knn;
pub mod svm;

use crate::grid::Configuration;
use crate::recipe::mean_and_sd;
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model family '{family}' has no argument named '{name}'.")]
    UnknownParameter { family: ModelFamily, name: String },
    #[error("Engine '{engine}' cannot fit model family '{family}'.")]
    UnsupportedEngine { family: ModelFamily, engine: Engine },
    #[error("Engine '{engine}' does not support {mode} mode.")]
    UnsupportedMode { engine: Engine, mode: Mode },
    #[error("Argument '{0}' is still marked for tuning. Finalize the model before fitting.")]
    UnresolvedParameter(String),
    #[error("The configuration does not provide a value for tuned argument '{0}'.")]
    MissingParameter(String),
    #[error("The configuration sets argument '{0}', which is fixed rather than tuned.")]
    NotTunable(String),
    #[error("Invalid value {value} for argument '{name}': {reason}")]
    InvalidParameter {
        name: String,
        value: f64,
        reason: &'static str,
    },
    #[error(
        "Classification requires integer class labels, but row {row} has label {value}. Factor-encode the response column."
    )]
    NonIntegralLabel { row: usize, value: f64 },
    #[error("Classification requires at least two classes; the training data only contains {0}.")]
    SingleClass(f64),
    #[error("Cannot fit a model on an empty training set.")]
    EmptyTrainingSet,
    #[error("Expected {expected} predictor columns but found {found}.")]
    ShapeMismatch { expected: usize, found: usize },
    #[error("Training set has {found} rows, but the kernel engines accept at most {limit}.")]
    TooManyRows { found: usize, limit: usize },
    #[error("A linear system solve failed: {0}")]
    LinearSystemSolveFailed(#[from] ndarray_linalg::error::LinalgError),
}

/// The prediction task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Classification,
    Regression,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Classification => "classification",
            Mode::Regression => "regression",
        })
    }
}

/// A model family, independent of the algorithm that fits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    SvmRbf,
    NearestNeighbor,
    ElasticNet,
}

impl ModelFamily {
    pub fn name(self) -> &'static str {
        match self {
            ModelFamily::SvmRbf => "svm_rbf",
            ModelFamily::NearestNeighbor => "nearest_neighbor",
            ModelFamily::ElasticNet => "elastic_net",
        }
    }

    /// Main arguments in canonical order, with their default values.
    pub fn main_args(self) -> &'static [(&'static str, f64)] {
        match self {
            ModelFamily::SvmRbf => &[("cost", 1.0), ("rbf_sigma", 0.1)],
            ModelFamily::NearestNeighbor => &[("neighbors", 5.0), ("dist_power", 2.0)],
            ModelFamily::ElasticNet => &[("penalty", 0.01), ("mixture", 1.0)],
        }
    }

    pub fn engines(self) -> &'static [Engine] {
        match self {
            ModelFamily::SvmRbf => &[Engine::Smo, Engine::Lssvm],
            ModelFamily::NearestNeighbor => &[Engine::BruteForce],
            ModelFamily::ElasticNet => &[Engine::CoordinateDescent],
        }
    }

    pub fn default_engine(self) -> Engine {
        self.engines()[0]
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The algorithm used to fit a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    /// Sequential minimal optimization of the soft-margin SVM dual.
    Smo,
    /// Least-squares SVM, one linear solve per machine.
    Lssvm,
    BruteForce,
    CoordinateDescent,
}

impl Engine {
    pub fn name(self) -> &'static str {
        match self {
            Engine::Smo => "smo",
            Engine::Lssvm => "lssvm",
            Engine::BruteForce => "brute_force",
            Engine::CoordinateDescent => "coordinate_descent",
        }
    }

    pub fn supports(self, mode: Mode) -> bool {
        !(self == Engine::Smo && mode == Mode::Regression)
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Scale on which grid levels are evenly spaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Identity,
    Log2,
    Log10,
}

impl Transform {
    pub fn forward(self, value: f64) -> f64 {
        match self {
            Transform::Identity => value,
            Transform::Log2 => value.log2(),
            Transform::Log10 => value.log10(),
        }
    }

    pub fn inverse(self, value: f64) -> f64 {
        match self {
            Transform::Identity => value,
            Transform::Log2 => value.exp2(),
            Transform::Log10 => 10f64.powf(value),
        }
    }
}

/// The search range of one tunable argument, in natural units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamRange {
    pub lower: f64,
    pub upper: f64,
    #[serde(default = "identity_transform")]
    pub transform: Transform,
    #[serde(default)]
    pub integer: bool,
}

fn identity_transform() -> Transform {
    Transform::Identity
}

impl ParamRange {
    /// Default search range for a main argument.
    pub fn default_for(name: &str) -> Option<ParamRange> {
        let range = |lower, upper, transform, integer| ParamRange {
            lower,
            upper,
            transform,
            integer,
        };
        match name {
            "cost" => Some(range(2f64.powi(-10), 2f64.powi(5), Transform::Log2, false)),
            "rbf_sigma" => Some(range(1e-10, 1.0, Transform::Log10, false)),
            "neighbors" => Some(range(1.0, 10.0, Transform::Identity, true)),
            "dist_power" => Some(range(1.0, 2.0, Transform::Identity, false)),
            "penalty" => Some(range(1e-10, 1.0, Transform::Log10, false)),
            "mixture" => Some(range(0.0, 1.0, Transform::Identity, false)),
            _ => None,
        }
    }
}

/// The value of a main argument.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamValue {
    /// A placeholder, resolved by finalization.
    Tune,
    Fixed(f64),
}

/// A placeholder together with the range a grid should cover.
#[derive(Debug, Clone, PartialEq)]
pub struct TunableParam {
    pub name: String,
    pub range: ParamRange,
}

/// Neighbour weighting for the nearest-neighbour engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightFunc {
    #[default]
    Rectangular,
    Inverse,
}

/// Engine-level options that are never tuned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineOptions {
    /// Standardize predictors inside the engine.
    pub scaled: bool,
    /// Emit class probabilities. Only the SVM engines can switch this off.
    pub prob_model: bool,
    pub weight_func: WeightFunc,
    pub max_iter: usize,
    pub tolerance: f64,
    /// Seed for randomized working-set selection.
    pub seed: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            scaled: true,
            prob_model: true,
            weight_func: WeightFunc::Rectangular,
            max_iter: 1000,
            tolerance: 1e-4,
            seed: 42,
        }
    }
}

/// A model declaration. See the module documentation for families and engines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub family: ModelFamily,
    pub engine: Engine,
    pub mode: Mode,
    pub args: BTreeMap<String, ParamValue>,
    #[serde(default)]
    pub ranges: BTreeMap<String, ParamRange>,
    #[serde(default)]
    pub options: EngineOptions,
}

impl ModelSpec {
    /// A spec with the family's default engine and every argument at its default.
    pub fn new(family: ModelFamily, mode: Mode) -> Self {
        let args = family
            .main_args()
            .iter()
            .map(|&(name, value)| (name.to_string(), ParamValue::Fixed(value)))
            .collect();
        Self {
            family,
            engine: family.default_engine(),
            mode,
            args,
            ranges: BTreeMap::new(),
            options: EngineOptions::default(),
        }
    }

    pub fn set_engine(mut self, engine: Engine) -> Result<Self, ModelError> {
        if !self.family.engines().contains(&engine) {
            return Err(ModelError::UnsupportedEngine {
                family: self.family,
                engine,
            });
        }
        self.engine = engine;
        Ok(self)
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Marks a main argument for tuning.
    pub fn tune(mut self, name: &str) -> Result<Self, ModelError> {
        self.check_arg(name)?;
        self.args.insert(name.to_string(), ParamValue::Tune);
        Ok(self)
    }

    /// Fixes a main argument.
    pub fn set_arg(mut self, name: &str, value: f64) -> Result<Self, ModelError> {
        self.check_arg(name)?;
        validate_arg(name, value)?;
        self.args.insert(name.to_string(), ParamValue::Fixed(value));
        Ok(self)
    }

    /// Overrides the search range of a main argument.
    pub fn set_range(mut self, name: &str, range: ParamRange) -> Result<Self, ModelError> {
        self.check_arg(name)?;
        self.ranges.insert(name.to_string(), range);
        Ok(self)
    }

    fn check_arg(&self, name: &str) -> Result<(), ModelError> {
        if self.family.main_args().iter().any(|&(arg, _)| arg == name) {
            Ok(())
        } else {
            Err(ModelError::UnknownParameter {
                family: self.family,
                name: name.to_string(),
            })
        }
    }

    /// The placeholders, in the family's canonical argument order.
    pub fn tunable(&self) -> Vec<TunableParam> {
        self.family
            .main_args()
            .iter()
            .filter(|&&(name, _)| self.args.get(name) == Some(&ParamValue::Tune))
            .map(|&(name, _)| TunableParam {
                name: name.to_string(),
                range: self
                    .ranges
                    .get(name)
                    .copied()
                    .or_else(|| ParamRange::default_for(name))
                    .unwrap_or(ParamRange {
                        lower: 0.0,
                        upper: 1.0,
                        transform: Transform::Identity,
                        integer: false,
                    }),
            })
            .collect()
    }

    pub fn is_finalized(&self) -> bool {
        self.args.values().all(|v| matches!(v, ParamValue::Fixed(_)))
    }

    /// Replaces every placeholder with its value from `config`.
    pub fn finalize(&self, config: &Configuration) -> Result<ModelSpec, ModelError> {
        for name in config.values.keys() {
            self.check_arg(name)?;
            if self.args.get(name) != Some(&ParamValue::Tune) {
                return Err(ModelError::NotTunable(name.clone()));
            }
        }
        let mut finalized = self.clone();
        for (name, value) in finalized.args.iter_mut() {
            if *value == ParamValue::Tune {
                let chosen = *config
                    .values
                    .get(name)
                    .ok_or_else(|| ModelError::MissingParameter(name.clone()))?;
                validate_arg(name, chosen)?;
                *value = ParamValue::Fixed(chosen);
            }
        }
        Ok(finalized)
    }

    /// Checks that the engine fits this family in this mode.
    pub fn validate(&self) -> Result<(), ModelError> {
        if !self.family.engines().contains(&self.engine) {
            return Err(ModelError::UnsupportedEngine {
                family: self.family,
                engine: self.engine,
            });
        }
        if !self.engine.supports(self.mode) {
            return Err(ModelError::UnsupportedMode {
                engine: self.engine,
                mode: self.mode,
            });
        }
        Ok(())
    }

    /// Resolved argument values. Fails if any placeholder remains.
    pub fn values(&self) -> Result<BTreeMap<String, f64>, ModelError> {
        self.args
            .iter()
            .map(|(name, value)| match value {
                ParamValue::Fixed(v) => Ok((name.clone(), *v)),
                ParamValue::Tune => Err(ModelError::UnresolvedParameter(name.clone())),
            })
            .collect()
    }

    /// Fits the engine on a baked design matrix.
    pub fn fit(&self, x: &Array2<f64>, y: &Array1<f64>) -> Result<FittedModel, ModelError> {
        self.validate()?;
        let values = self.values()?;
        if x.nrows() == 0 {
            return Err(ModelError::EmptyTrainingSet);
        }
        if x.nrows() != y.len() {
            return Err(ModelError::ShapeMismatch {
                expected: x.nrows(),
                found: y.len(),
            });
        }
        let arg = |name: &str| values.get(name).copied().unwrap_or(f64::NAN);

        let engine_fit = match self.engine {
            Engine::Smo => EngineFit::Svm(svm::fit_smo(
                x,
                y,
                arg("cost"),
                arg("rbf_sigma"),
                &self.options,
            )?),
            Engine::Lssvm => EngineFit::LsSvm(svm::fit_lssvm(
                x,
                y,
                self.mode,
                arg("cost"),
                arg("rbf_sigma"),
                &self.options,
            )?),
            Engine::BruteForce => EngineFit::Knn(knn::fit(
                x,
                y,
                self.mode,
                arg("neighbors"),
                arg("dist_power"),
                &self.options,
            )?),
            Engine::CoordinateDescent => EngineFit::ElasticNet(elastic_net::fit(
                x,
                y,
                self.mode,
                arg("penalty"),
                arg("mixture"),
                &self.options,
            )?),
        };

        Ok(FittedModel {
            family: self.family,
            engine: self.engine,
            mode: self.mode,
            parameters: values,
            n_predictors: x.ncols(),
            engine_fit,
        })
    }
}

fn validate_arg(name: &str, value: f64) -> Result<(), ModelError> {
    let invalid = |reason| ModelError::InvalidParameter {
        name: name.to_string(),
        value,
        reason,
    };
    if !value.is_finite() {
        return Err(invalid("must be finite"));
    }
    match name {
        "cost" | "rbf_sigma" | "dist_power" if value <= 0.0 => Err(invalid("must be positive")),
        "neighbors" if value < 1.0 => Err(invalid("must be at least 1")),
        "penalty" if value < 0.0 => Err(invalid("must be non-negative")),
        "mixture" if !(0.0..=1.0).contains(&value) => Err(invalid("must lie in [0, 1]")),
        _ => Ok(()),
    }
}

/// The algorithm-specific part of a fitted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineFit {
    Svm(svm::SvmModel),
    LsSvm(svm::LsSvmModel),
    Knn(knn::KnnModel),
    ElasticNet(elastic_net::ElasticNetModel),
}

/// A fitted engine model, stripped of any preprocessing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    pub family: ModelFamily,
    pub engine: Engine,
    pub mode: Mode,
    /// The argument values the engine was fit with.
    pub parameters: BTreeMap<String, f64>,
    pub n_predictors: usize,
    pub engine_fit: EngineFit,
}

impl FittedModel {
    pub fn predict(&self, x: &Array2<f64>) -> Result<Predictions, ModelError> {
        if x.ncols() != self.n_predictors {
            return Err(ModelError::ShapeMismatch {
                expected: self.n_predictors,
                found: x.ncols(),
            });
        }
        Ok(match &self.engine_fit {
            EngineFit::Svm(model) => model.predict(x),
            EngineFit::LsSvm(model) => model.predict(x),
            EngineFit::Knn(model) => model.predict(x),
            EngineFit::ElasticNet(model) => model.predict(x),
        })
    }
}

/// Engine output for a batch of rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predictions {
    Classes {
        /// Class labels, in the column order of `probabilities`.
        classes: Vec<f64>,
        predicted: Array1<f64>,
        probabilities: Option<Array2<f64>>,
    },
    Numeric(Array1<f64>),
}

impl Predictions {
    pub fn len(&self) -> usize {
        match self {
            Predictions::Classes { predicted, .. } => predicted.len(),
            Predictions::Numeric(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Builds class predictions from per-class scores, taking the first
    /// maximum on ties.
    pub(crate) fn from_scores(
        classes: &[f64],
        scores: &Array2<f64>,
        probabilities: Option<Array2<f64>>,
    ) -> Predictions {
        let predicted = scores
            .axis_iter(Axis(0))
            .map(|row| classes[argmax(row.iter().copied())])
            .collect();
        Predictions::Classes {
            classes: classes.to_vec(),
            predicted,
            probabilities,
        }
    }
}

pub(crate) fn argmax(values: impl Iterator<Item = f64>) -> usize {
    let mut best = 0;
    let mut best_value = f64::NEG_INFINITY;
    for (i, v) in values.enumerate() {
        if v > best_value {
            best = i;
            best_value = v;
        }
    }
    best
}

/// Sorted distinct class labels. Rejects non-integral labels and single-class data.
pub(crate) fn class_labels(y: &Array1<f64>) -> Result<Vec<f64>, ModelError> {
    for (row, &value) in y.iter().enumerate() {
        if value.fract() != 0.0 || !value.is_finite() {
            return Err(ModelError::NonIntegralLabel { row, value });
        }
    }
    let mut classes = y.to_vec();
    classes.sort_by(f64::total_cmp);
    classes.dedup();
    if classes.len() < 2 {
        return Err(ModelError::SingleClass(classes.first().copied().unwrap_or(f64::NAN)));
    }
    Ok(classes)
}

/// Normalizes one-vs-rest scores in `[0, 1]` into rows summing to one.
pub(crate) fn normalize_rows(mut probs: Array2<f64>) -> Array2<f64> {
    let k = probs.ncols() as f64;
    for mut row in probs.axis_iter_mut(Axis(0)) {
        let total: f64 = row.sum();
        if total > 0.0 {
            row.mapv_inplace(|p| p / total);
        } else {
            row.fill(1.0 / k);
        }
    }
    probs
}

/// Column means and standard deviations learned inside an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    means: Array1<f64>,
    sds: Array1<f64>,
}

impl Standardizer {
    pub fn fit(x: &Array2<f64>) -> Self {
        let (means, sds): (Vec<f64>, Vec<f64>) = x
            .axis_iter(Axis(1))
            .map(|col| {
                let (mean, sd) = mean_and_sd(&col.to_owned());
                (mean, if sd > 1e-12 { sd } else { 1.0 })
            })
            .unzip();
        Self {
            means: Array1::from_vec(means),
            sds: Array1::from_vec(sds),
        }
    }

    pub fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        (x - &self.means) / &self.sds
    }
}

/// Fits a standardizer when the engine option asks for one.
pub(crate) fn maybe_standardize(
    x: &Array2<f64>,
    scaled: bool,
) -> (Option<Standardizer>, Array2<f64>) {
    if scaled {
        let scaler = Standardizer::fit(x);
        let transformed = scaler.transform(x);
        (Some(scaler), transformed)
    } else {
        (None, x.clone())
    }
}

pub(crate) fn apply_standardizer(scaler: &Option<Standardizer>, x: &Array2<f64>) -> Array2<f64> {
    match scaler {
        Some(s) => s.transform(x),
        None => x.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn config(values: &[(&str, f64)]) -> Configuration {
        Configuration {
            id: "Model01".to_string(),
            values: values.iter().map(|&(k, v)| (k.to_string(), v)).collect(),
        }
    }

    #[test]
    fn test_tune_placeholders_and_finalize() {
        let spec = ModelSpec::new(ModelFamily::SvmRbf, Mode::Classification)
            .tune("cost")
            .unwrap()
            .tune("rbf_sigma")
            .unwrap();
        assert!(!spec.is_finalized());
        let names: Vec<String> = spec.tunable().into_iter().map(|p| p.name).collect();
        assert_eq!(names, ["cost", "rbf_sigma"]);

        let finalized = spec
            .finalize(&config(&[("cost", 2.0), ("rbf_sigma", 0.5)]))
            .unwrap();
        assert!(finalized.is_finalized());
        assert_eq!(finalized.args["cost"], ParamValue::Fixed(2.0));
        // The original keeps its placeholders.
        assert_eq!(spec.args["cost"], ParamValue::Tune);
    }

    #[test]
    fn test_finalize_errors() {
        let spec = ModelSpec::new(ModelFamily::NearestNeighbor, Mode::Regression)
            .tune("neighbors")
            .unwrap();
        assert!(matches!(
            spec.finalize(&config(&[])),
            Err(ModelError::MissingParameter(name)) if name == "neighbors"
        ));
        assert!(matches!(
            spec.finalize(&config(&[("neighbors", 3.0), ("cost", 1.0)])),
            Err(ModelError::UnknownParameter { .. })
        ));
        assert!(matches!(
            spec.finalize(&config(&[("neighbors", 0.0)])),
            Err(ModelError::InvalidParameter { .. })
        ));
        // `dist_power` exists for the family but was never marked for tuning.
        assert!(matches!(
            spec.finalize(&config(&[("neighbors", 3.0), ("dist_power", 1.0)])),
            Err(ModelError::NotTunable(name)) if name == "dist_power"
        ));
    }

    #[test]
    fn test_fit_rejects_placeholders_and_bad_engines() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        let y = array![0.0, 0.0, 1.0, 1.0];
        let spec = ModelSpec::new(ModelFamily::SvmRbf, Mode::Classification)
            .tune("cost")
            .unwrap();
        assert!(matches!(
            spec.fit(&x, &y),
            Err(ModelError::UnresolvedParameter(name)) if name == "cost"
        ));

        assert!(matches!(
            ModelSpec::new(ModelFamily::ElasticNet, Mode::Regression).set_engine(Engine::Smo),
            Err(ModelError::UnsupportedEngine { .. })
        ));

        let smo_regression = ModelSpec::new(ModelFamily::SvmRbf, Mode::Regression);
        assert!(matches!(
            smo_regression.fit(&x, &y),
            Err(ModelError::UnsupportedMode { .. })
        ));
    }

    #[test]
    fn test_unknown_argument() {
        assert!(matches!(
            ModelSpec::new(ModelFamily::ElasticNet, Mode::Regression).tune("cost"),
            Err(ModelError::UnknownParameter { name, .. }) if name == "cost"
        ));
    }

    #[test]
    fn test_class_labels() {
        assert_eq!(class_labels(&array![2.0, 0.0, 2.0, 1.0]).unwrap(), vec![0.0, 1.0, 2.0]);
        assert!(matches!(
            class_labels(&array![0.0, 0.5]),
            Err(ModelError::NonIntegralLabel { row: 1, .. })
        ));
        assert!(matches!(
            class_labels(&array![1.0, 1.0]),
            Err(ModelError::SingleClass(_))
        ));
    }

    #[test]
    fn test_transforms_round_trip() {
        for t in [Transform::Identity, Transform::Log2, Transform::Log10] {
            let v = 0.37;
            assert!((t.inverse(t.forward(v)) - v).abs() < 1e-12);
        }
    }

    #[test]
    fn test_fitted_model_rejects_wrong_width() {
        let x = array![[0.0, 1.0], [1.0, 0.0], [2.0, 1.0], [3.0, 0.0]];
        let y = array![1.0, 2.0, 3.0, 4.0];
        let model = ModelSpec::new(ModelFamily::NearestNeighbor, Mode::Regression)
            .fit(&x, &y)
            .unwrap();
        assert!(matches!(
            model.predict(&array![[1.0]]),
            Err(ModelError::ShapeMismatch { expected: 2, found: 1 })
        ));
    }
}
