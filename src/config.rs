//! # Run Configuration
//!
//! A batch run is described by one TOML file with the sections `[data]`,
//! `[split]`, `[model]`, `[tuning]`, `[output]` and `[parallel]`. Every key has a
//! default except the data path, the column layout and the model family and
//! mode. Unknown keys are rejected so that typos surface before any fitting.

use crate::batch::{BatchConfig, RESPONSE_PLACEHOLDER, SeedPolicy};
use crate::data::{ColumnLayout, LoadOptions, Separator, Table};
use crate::metrics::{Metric, MetricError, MetricSet};
use crate::model::{Engine, EngineOptions, Mode, ModelError, ModelFamily, ModelSpec, ParamRange};
use crate::pool::default_worker_count;
use crate::recipe::{Formula, Step};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Invalid [model] section: {0}")]
    Model(#[from] ModelError),
    #[error("Invalid [tuning] metrics: {0}")]
    Metric(#[from] MetricError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataSection {
    pub path: PathBuf,
    #[serde(default)]
    pub separator: Separator,
    /// Number of leading response columns.
    pub responses: usize,
    /// Inclusive, 1-based feature column range.
    pub features: [usize; 2],
    #[serde(default)]
    pub factors: Vec<String>,
    #[serde(default = "default_minimum_rows")]
    pub minimum_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SplitSection {
    pub seed: u64,
    /// Column whose classes are balanced across the split. Defaults to the
    /// first response column.
    pub strata: Option<String>,
    pub prop: f64,
}

impl Default for SplitSection {
    fn default() -> Self {
        Self {
            seed: 500,
            strata: None,
            prop: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSection {
    pub family: ModelFamily,
    #[serde(default)]
    pub engine: Option<Engine>,
    pub mode: Mode,
    /// Main arguments marked for tuning.
    #[serde(default)]
    pub tune: Vec<String>,
    /// Main arguments fixed to a value.
    #[serde(default)]
    pub fixed: BTreeMap<String, f64>,
    #[serde(default)]
    pub ranges: BTreeMap<String, ParamRange>,
    #[serde(default)]
    pub engine_options: EngineOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TuningSection {
    pub levels: usize,
    pub folds: usize,
    /// Seed for fold assignment. Defaults to the split seed.
    pub seed: Option<u64>,
    pub seed_policy: SeedPolicy,
    pub stratify: bool,
    pub formula: String,
    pub steps: Vec<Step>,
    pub metrics: Option<Vec<Metric>>,
    pub select_metric: Option<Metric>,
}

impl Default for TuningSection {
    fn default() -> Self {
        Self {
            levels: 10,
            folds: 5,
            seed: None,
            seed_policy: SeedPolicy::Reuse,
            stratify: true,
            formula: format!("{RESPONSE_PLACEHOLDER} ~ ."),
            steps: Vec::new(),
            metrics: None,
            select_metric: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputSection {
    pub dir: PathBuf,
    pub prefix: String,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("results"),
            prefix: "multifit".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParallelSection {
    pub enabled: bool,
    /// Worker count; one fewer than the CPU count when absent.
    pub workers: Option<usize>,
}

impl Default for ParallelSection {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub data: DataSection,
    #[serde(default)]
    pub split: SplitSection,
    pub model: ModelSection,
    #[serde(default)]
    pub tuning: TuningSection,
    #[serde(default)]
    pub output: OutputSection,
    #[serde(default)]
    pub parallel: ParallelSection,
}

fn default_minimum_rows() -> usize {
    LoadOptions::default().minimum_rows
}

impl RunConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: RunConfig = toml::from_str(&text)?;
        // Relative data paths are resolved against the configuration file.
        if config.data.path.is_relative() {
            if let Some(parent) = path.parent() {
                config.data.path = parent.join(&config.data.path);
            }
        }
        Ok(config)
    }

    /// Checks everything that can be checked without reading the data.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };
        let [first, last] = self.data.features;
        if self.data.responses == 0 {
            return invalid("data.responses must be at least 1".to_string());
        }
        if first == 0 || first > last {
            return invalid(format!("data.features [{first}, {last}] is not a 1-based range"));
        }
        if first <= self.data.responses {
            return invalid(format!(
                "data.features starts at column {first}, inside the {} response columns",
                self.data.responses
            ));
        }
        if !(self.split.prop > 0.0 && self.split.prop < 1.0) {
            return invalid(format!("split.prop must be in (0, 1), got {}", self.split.prop));
        }
        if self.tuning.levels == 0 {
            return invalid("tuning.levels must be at least 1".to_string());
        }
        if self.tuning.folds < 2 {
            return invalid(format!("tuning.folds must be at least 2, got {}", self.tuning.folds));
        }
        match self.tuning.formula.parse::<Formula>() {
            Ok(formula) if formula.outcome == RESPONSE_PLACEHOLDER => {}
            Ok(_) => {
                return invalid(format!(
                    "tuning.formula must have {RESPONSE_PLACEHOLDER} as its outcome, got '{}'",
                    self.tuning.formula
                ));
            }
            Err(e) => return invalid(format!("tuning.formula: {e}")),
        }
        if self.output.prefix.is_empty() {
            return invalid("output.prefix must not be empty".to_string());
        }
        if self.parallel.workers == Some(0) {
            return invalid("parallel.workers must be at least 1".to_string());
        }
        self.batch_config().map(|_| ())
    }

    pub fn layout(&self) -> ColumnLayout {
        ColumnLayout {
            responses: self.data.responses,
            features: (self.data.features[0], self.data.features[1]),
        }
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            separator: self.data.separator,
            factors: self.data.factors.clone(),
            minimum_rows: self.data.minimum_rows,
        }
    }

    /// Builds the model declaration from the `[model]` section.
    pub fn model_spec(&self) -> Result<ModelSpec, ConfigError> {
        let section = &self.model;
        let mut spec = ModelSpec::new(section.family, section.mode);
        if let Some(engine) = section.engine {
            spec = spec.set_engine(engine)?;
        }
        for (name, &value) in &section.fixed {
            spec = spec.set_arg(name, value)?;
        }
        for name in &section.tune {
            if section.fixed.contains_key(name) {
                return Err(ConfigError::Invalid(format!(
                    "'{name}' is both tuned and fixed"
                )));
            }
            spec = spec.tune(name)?;
        }
        for (name, range) in &section.ranges {
            spec = spec.set_range(name, *range)?;
        }
        let spec = spec.with_options(section.engine_options.clone());
        spec.validate()?;
        Ok(spec)
    }

    pub fn metric_set(&self) -> Result<MetricSet, ConfigError> {
        let set = match &self.tuning.metrics {
            Some(metrics) => MetricSet::new(metrics)?,
            None => MetricSet::default_for(self.model.mode),
        };
        set.validate(self.model.mode, self.model.engine_options.prob_model)?;
        Ok(set)
    }

    pub fn batch_config(&self) -> Result<BatchConfig, ConfigError> {
        let mut config = BatchConfig::new(self.model_spec()?, self.metric_set()?);
        if let Some(metric) = self.tuning.select_metric {
            if !config.metrics.contains(metric) {
                return Err(ConfigError::Invalid(format!(
                    "tuning.select_metric '{metric}' is not in tuning.metrics"
                )));
            }
            config.select_metric = metric;
        }
        config.formula = self.tuning.formula.clone();
        config.steps = self.tuning.steps.clone();
        config.levels = self.tuning.levels;
        config.folds = self.tuning.folds;
        config.stratify = self.tuning.stratify;
        config.seed = self.tuning.seed.unwrap_or(self.split.seed);
        config.seed_policy = self.tuning.seed_policy;
        Ok(config)
    }

    /// Size of the worker pool, or `None` for a sequential run.
    pub fn workers(&self) -> Option<usize> {
        self.parallel
            .enabled
            .then(|| self.parallel.workers.unwrap_or_else(default_worker_count))
    }

    /// The column the initial split is stratified by.
    pub fn strata_column(&self, table: &Table) -> String {
        match &self.split.strata {
            Some(column) => column.clone(),
            None => table.columns().first().cloned().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ParamValue, Transform};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const EXAMPLE: &str = r#"
[data]
path = "traits.tsv"
responses = 10
features = [11, 30]
factors = ["habitat"]

[split]
seed = 500
strata = "presence_a"

[model]
family = "svm_rbf"
engine = "smo"
mode = "classification"
tune = ["cost", "rbf_sigma"]

[model.engine_options]
scaled = true
prob_model = true

[model.ranges.cost]
lower = 0.25
upper = 4.0
transform = "log2"

[tuning]
levels = 3
select_metric = "accuracy"
metrics = ["roc_auc", "accuracy", "kappa"]
seed_policy = "per_iteration"
steps = ["zv", "normalize"]

[output]
dir = "out"
prefix = "svm"
"#;

    fn parse(text: &str) -> RunConfig {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn test_example_parses_with_defaults() {
        let config = parse(EXAMPLE);
        assert_eq!(config.split.prop, 0.8);
        assert_eq!(config.tuning.folds, 5);
        assert_eq!(config.data.separator, Separator::Tab);
        assert!(config.parallel.enabled);
        assert!(config.validate().is_ok());

        let layout = config.layout();
        assert_eq!(layout.responses, 10);
        assert_eq!(layout.features, (11, 30));
    }

    #[test]
    fn test_batch_config_from_sections() {
        let config = parse(EXAMPLE);
        let batch = config.batch_config().unwrap();
        assert_eq!(batch.select_metric, Metric::Accuracy);
        assert_eq!(
            batch.metrics.metrics(),
            [Metric::RocAuc, Metric::Accuracy, Metric::Kap]
        );
        assert_eq!(batch.levels, 3);
        assert_eq!(batch.seed, 500);
        assert_eq!(batch.seed_policy, SeedPolicy::PerIteration);
        assert_eq!(batch.steps, [Step::Zv, Step::Normalize]);
        assert_eq!(batch.spec.engine, Engine::Smo);
        assert_eq!(batch.spec.args["cost"], ParamValue::Tune);
        assert_eq!(batch.spec.ranges["cost"].transform, Transform::Log2);
        assert_eq!(batch.spec.tunable().len(), 2);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let text = EXAMPLE.replace("levels = 3", "levles = 3");
        assert!(toml::from_str::<RunConfig>(&text).is_err());
    }

    #[test]
    fn test_invalid_sections() {
        let mut config = parse(EXAMPLE);
        config.data.features = [5, 30];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = parse(EXAMPLE);
        config.tuning.metrics = Some(vec![Metric::Rmse]);
        assert!(matches!(config.validate(), Err(ConfigError::Metric(_))));

        let mut config = parse(EXAMPLE);
        config.tuning.select_metric = Some(Metric::MnLogLoss);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = parse(EXAMPLE);
        config.model.tune.push("neighbors".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Model(ModelError::UnknownParameter { .. }))
        ));

        let mut config = parse(EXAMPLE);
        config.model.mode = Mode::Regression;
        config.tuning.metrics = None;
        config.tuning.select_metric = None;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Model(ModelError::UnsupportedMode { .. }))
        ));

        let mut config = parse(EXAMPLE);
        config.parallel.workers = Some(0);
        assert!(config.validate().is_err());

        let mut config = parse(EXAMPLE);
        config.tuning.formula = "y ~ . - {response}".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.tuning.formula = "{response} ~".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.tuning.formula = "{response} ~ . - site".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_workers_and_strata() {
        let mut config = parse(EXAMPLE);
        assert!(config.workers().unwrap() >= 1);
        config.parallel.workers = Some(3);
        assert_eq!(config.workers(), Some(3));
        config.parallel.enabled = false;
        assert_eq!(config.workers(), None);

        let table = Table::new(
            vec!["r1".into(), "f1".into()],
            ndarray::Array2::zeros((2, 2)),
        )
        .unwrap();
        assert_eq!(config.strata_column(&table), "presence_a");
        config.split.strata = None;
        assert_eq!(config.strata_column(&table), "r1");
    }

    #[test]
    fn test_from_path_resolves_data_relative_to_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(EXAMPLE.as_bytes()).unwrap();
        let config = RunConfig::from_path(file.path()).unwrap();
        let expected = file.path().parent().unwrap().join("traits.tsv");
        assert_eq!(config.data.path, expected);

        assert!(matches!(
            RunConfig::from_path(Path::new("/nonexistent/run.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
