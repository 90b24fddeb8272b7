//! # Workflows
//!
//! A workflow binds a recipe to a model spec so the pair is fit, tuned and
//! evaluated as one unit. Fitting a workflow preps the recipe on the training
//! table, bakes it, and fits the engine on the baked design matrix; the
//! resulting `FittedWorkflow` predicts directly from raw tables.

use crate::data::Table;
use crate::grid::Configuration;
use crate::metrics::{MetricError, MetricEstimate, MetricSet};
use crate::model::{FittedModel, ModelError, ModelSpec, Predictions};
use crate::recipe::{PreparedRecipe, Recipe, RecipeError};
use crate::tune::MetricSummary;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Preprocessing failed: {0}")]
    Recipe(#[from] RecipeError),
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
    #[error("Scoring failed: {0}")]
    Metric(#[from] MetricError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    recipe: Recipe,
    spec: ModelSpec,
    /// The configuration this workflow was finalized with, if any.
    selected: Option<Configuration>,
}

impl Workflow {
    pub fn new(recipe: Recipe, spec: ModelSpec) -> Self {
        Self {
            recipe,
            spec,
            selected: None,
        }
    }

    pub fn recipe(&self) -> &Recipe {
        &self.recipe
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn selected(&self) -> Option<&Configuration> {
        self.selected.as_ref()
    }

    /// A copy with every tuning placeholder replaced by `config`.
    pub fn finalize(&self, config: &Configuration) -> Result<Workflow, WorkflowError> {
        Ok(Workflow {
            recipe: self.recipe.clone(),
            spec: self.spec.finalize(config)?,
            selected: Some(config.clone()),
        })
    }

    pub fn fit(&self, training: &Table) -> Result<FittedWorkflow, WorkflowError> {
        let prepared = self.recipe.prep(training)?;
        let baked = prepared.bake(training)?;
        let model = self.spec.fit(&baked.x, &baked.y)?;
        Ok(FittedWorkflow {
            recipe: prepared,
            spec: self.spec.clone(),
            model,
        })
    }
}

/// A prepared recipe plus a fitted engine model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedWorkflow {
    pub recipe: PreparedRecipe,
    /// The finalized spec the engine was fit from.
    pub spec: ModelSpec,
    pub model: FittedModel,
}

/// Truth, predictions and metric values for one scored table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub truth: Array1<f64>,
    pub predictions: Predictions,
    pub metrics: Vec<MetricEstimate>,
}

impl FittedWorkflow {
    pub fn predict(&self, table: &Table) -> Result<Predictions, WorkflowError> {
        let baked = self.recipe.bake(table)?;
        Ok(self.model.predict(&baked.x)?)
    }

    /// Predicts `table` and scores the predictions against its outcome column.
    pub fn assess(&self, table: &Table, metrics: &MetricSet) -> Result<Assessment, WorkflowError> {
        let baked = self.recipe.bake(table)?;
        let predictions = self.model.predict(&baked.x)?;
        let estimates = metrics.compute(&baked.y, &predictions)?;
        Ok(Assessment {
            truth: baked.y,
            predictions,
            metrics: estimates,
        })
    }

    /// The engine model without the preprocessing wrapper.
    pub fn extract_fit_engine(&self) -> &FittedModel {
        &self.model
    }

    pub fn extract_recipe(&self) -> &PreparedRecipe {
        &self.recipe
    }
}

/// The final evaluation of a finalized workflow on the held-out test split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastFit {
    pub config: Configuration,
    pub n_train: usize,
    pub n_test: usize,
    /// Test-set metric values.
    pub metrics: Vec<MetricEstimate>,
    pub truth: Array1<f64>,
    pub predictions: Predictions,
    /// Cross-validated performance of `config`, filled in by the batch loop.
    #[serde(default)]
    pub resampled: Vec<MetricSummary>,
}

/// Fits a finalized workflow on the whole training table and evaluates it on
/// the test table.
pub fn last_fit(
    workflow: &Workflow,
    train: &Table,
    test: &Table,
    metrics: &MetricSet,
) -> Result<(FittedWorkflow, LastFit), WorkflowError> {
    let fitted = workflow.fit(train)?;
    let assessment = fitted.assess(test, metrics)?;
    let config = match workflow.selected() {
        Some(config) => config.clone(),
        None => Configuration {
            id: "fixed".to_string(),
            values: workflow.spec.values()?,
        },
    };
    log::debug!(
        "Last fit of {} on {} training rows, {} test rows",
        config.id,
        train.nrows(),
        test.nrows()
    );
    let result = LastFit {
        config,
        n_train: train.nrows(),
        n_test: test.nrows(),
        metrics: assessment.metrics,
        truth: assessment.truth,
        predictions: assessment.predictions,
        resampled: Vec::new(),
    };
    Ok((fitted, result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metric;
    use crate::model::{Mode, ModelFamily, ParamValue};
    use ndarray::Array2;
    use std::collections::BTreeMap;

    fn table(n: usize) -> Table {
        let values = Array2::from_shape_fn((n, 3), |(i, j)| match j {
            0 => (i as f64 * 0.5).sin() * 3.0 + i as f64 * 0.1,
            1 => (i as f64 * 0.5).sin(),
            _ => i as f64,
        });
        Table::new(vec!["y".into(), "a".into(), "b".into()], values).unwrap()
    }

    fn workflow(data: &Table) -> Workflow {
        let recipe = Recipe::new("y ~ .", data).unwrap();
        let spec = ModelSpec::new(ModelFamily::ElasticNet, Mode::Regression)
            .tune("penalty")
            .unwrap();
        Workflow::new(recipe, spec)
    }

    fn config(penalty: f64) -> Configuration {
        Configuration {
            id: "Model03".into(),
            values: BTreeMap::from([("penalty".to_string(), penalty)]),
        }
    }

    #[test]
    fn test_unfinalized_workflow_cannot_fit() {
        let data = table(20);
        assert!(matches!(
            workflow(&data).fit(&data),
            Err(WorkflowError::Model(ModelError::UnresolvedParameter(_)))
        ));
    }

    #[test]
    fn test_last_fit_records_configuration() {
        let data = table(40);
        let train = data.select_rows(&(0..30).collect::<Vec<_>>());
        let test = data.select_rows(&(30..40).collect::<Vec<_>>());
        let finalized = workflow(&data).finalize(&config(0.001)).unwrap();
        let metrics = MetricSet::new(&[Metric::Rmse, Metric::Rsq]).unwrap();

        let (fitted, result) = last_fit(&finalized, &train, &test, &metrics).unwrap();
        assert_eq!(result.config.id, "Model03");
        assert_eq!(result.n_train, 30);
        assert_eq!(result.n_test, 10);
        assert_eq!(result.metrics.len(), 2);
        assert_eq!(result.predictions.len(), 10);
        assert_eq!(fitted.spec.args["penalty"], ParamValue::Fixed(0.001));
        assert_eq!(fitted.extract_fit_engine().parameters["penalty"], 0.001);
        assert_eq!(fitted.extract_recipe().predictors(), ["a", "b"]);
    }

    #[test]
    fn test_predict_from_raw_table() {
        let data = table(30);
        let fitted = workflow(&data)
            .finalize(&config(0.0))
            .unwrap()
            .fit(&data)
            .unwrap();
        let Predictions::Numeric(values) = fitted.predict(&data).unwrap() else {
            panic!("expected numeric predictions");
        };
        assert_eq!(values.len(), 30);
    }
}
