//! # Preprocessing Recipes
//!
//! A recipe is declared from a model formula bound to a template table, plus an
//! ordered list of preprocessing steps. Declaring a recipe estimates nothing:
//! `prep` learns every data-dependent quantity (dummy levels, zero-variance
//! columns, centering and scaling constants) from a training table, and the
//! resulting `PreparedRecipe` can `bake` any table with the same columns into
//! a design matrix and an outcome vector.
//!
//! Formula grammar:
//!
//! ```text
//! outcome ~ .              every other column of the template
//! outcome ~ a + b          an explicit list of columns
//! outcome ~ . - a - b      every other column except a and b
//! ```

use crate::data::{DataError, Table};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Columns whose training standard deviation is below this are treated as constant.
const ZERO_VARIANCE_TOLERANCE: f64 = 1e-12;

#[derive(Error, Debug)]
pub enum RecipeError {
    #[error("Malformed formula '{formula}': {reason}")]
    MalformedFormula { formula: String, reason: String },
    #[error("Formula refers to column '{0}', which is not in the data.")]
    UnknownColumn(String),
    #[error("The outcome '{0}' cannot also be used as a predictor.")]
    OutcomeAsPredictor(String),
    #[error("The formula selects no predictors.")]
    NoPredictors,
    #[error("Unknown preprocessing step '{0}'. Expected one of: zv, dummy, normalize.")]
    UnknownStep(String),
    #[error("All predictors were removed by the zero-variance filter.")]
    AllPredictorsRemoved,
    #[error(transparent)]
    Data(#[from] DataError),
}

/// The right-hand side of a formula.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Terms {
    /// `.`, optionally minus some columns.
    All { exclude: Vec<String> },
    /// `a + b + ...`.
    Explicit(Vec<String>),
}

/// A parsed `outcome ~ terms` formula.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formula {
    pub outcome: String,
    pub terms: Terms,
}

impl FromStr for Formula {
    type Err = RecipeError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| RecipeError::MalformedFormula {
            formula: text.to_string(),
            reason: reason.to_string(),
        };

        let mut sides = text.split('~');
        let (Some(lhs), Some(rhs), None) = (sides.next(), sides.next(), sides.next()) else {
            return Err(malformed("expected exactly one '~'"));
        };

        let outcome = lhs.trim();
        if outcome.is_empty() {
            return Err(malformed("the outcome is empty"));
        }
        if outcome.contains(['+', '-', ' ']) || outcome == "." {
            return Err(malformed("the outcome must be a single column"));
        }

        let mut included = Vec::new();
        let mut excluded = Vec::new();
        let mut has_dot = false;
        let mut sign = '+';
        let mut token = String::new();
        for ch in rhs.chars().chain(std::iter::once('+')) {
            if ch == '+' || ch == '-' {
                let term = token.trim();
                if term.is_empty() {
                    return Err(malformed("empty term on the right-hand side"));
                }
                match (sign, term) {
                    ('+', ".") => has_dot = true,
                    ('-', ".") => return Err(malformed("'.' cannot be subtracted")),
                    ('+', name) => included.push(name.to_string()),
                    (_, name) => excluded.push(name.to_string()),
                }
                token.clear();
                sign = ch;
            } else {
                token.push(ch);
            }
        }

        let terms = if has_dot {
            if !included.is_empty() {
                return Err(malformed("'.' already includes every column"));
            }
            Terms::All { exclude: excluded }
        } else {
            included.retain(|name| !excluded.contains(name));
            Terms::Explicit(included)
        };

        Ok(Formula {
            outcome: outcome.to_string(),
            terms,
        })
    }
}

impl Formula {
    /// Replaces the outcome with a column name taken verbatim, so names that
    /// the formula grammar cannot express (spaces, `+`, `-`, `~`) still bind.
    pub fn with_outcome(mut self, outcome: &str) -> Self {
        self.outcome = outcome.to_string();
        self
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ~ ", self.outcome)?;
        match &self.terms {
            Terms::All { exclude } => {
                f.write_str(".")?;
                for name in exclude {
                    write!(f, " - {name}")?;
                }
                Ok(())
            }
            Terms::Explicit(names) => f.write_str(&names.join(" + ")),
        }
    }
}

/// A preprocessing step, applied in declaration order during `prep`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Drop predictors that are constant in the training data.
    Zv,
    /// Replace each factor predictor by indicators for all but its first level.
    Dummy,
    /// Center and scale every predictor with training means and deviations.
    Normalize,
}

impl FromStr for Step {
    type Err = RecipeError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text.trim() {
            "zv" => Ok(Step::Zv),
            "dummy" => Ok(Step::Dummy),
            "normalize" => Ok(Step::Normalize),
            other => Err(RecipeError::UnknownStep(other.to_string())),
        }
    }
}

/// A declared, not yet estimated, preprocessing specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub formula: Formula,
    pub predictors: Vec<String>,
    pub steps: Vec<Step>,
    /// Factor levels of the predictors, captured from the template table.
    #[serde(default)]
    pub levels: HashMap<String, Vec<String>>,
}

impl Recipe {
    /// Declares a recipe from `formula`, resolving its terms against `template`.
    pub fn new(formula: &str, template: &Table) -> Result<Self, RecipeError> {
        Self::from_formula(formula.parse()?, template)
    }

    /// Declares a recipe from an already parsed formula.
    pub fn from_formula(formula: Formula, template: &Table) -> Result<Self, RecipeError> {
        let columns = template.columns();
        if !columns.contains(&formula.outcome) {
            return Err(RecipeError::UnknownColumn(formula.outcome.clone()));
        }

        let predictors: Vec<String> = match &formula.terms {
            Terms::All { exclude } => {
                if let Some(unknown) = exclude.iter().find(|name| !columns.contains(name)) {
                    return Err(RecipeError::UnknownColumn(unknown.clone()));
                }
                columns
                    .iter()
                    .filter(|c| **c != formula.outcome && !exclude.contains(c))
                    .cloned()
                    .collect()
            }
            Terms::Explicit(names) => {
                if let Some(unknown) = names.iter().find(|name| !columns.contains(name)) {
                    return Err(RecipeError::UnknownColumn(unknown.clone()));
                }
                if names.contains(&formula.outcome) {
                    return Err(RecipeError::OutcomeAsPredictor(formula.outcome.clone()));
                }
                let mut unique: Vec<String> = Vec::with_capacity(names.len());
                for name in names {
                    if !unique.contains(name) {
                        unique.push(name.clone());
                    }
                }
                unique
            }
        };
        if predictors.is_empty() {
            return Err(RecipeError::NoPredictors);
        }

        let levels = predictors
            .iter()
            .filter_map(|p| template.levels(p).map(|l| (p.clone(), l.to_vec())))
            .collect();

        Ok(Self {
            formula,
            predictors,
            steps: Vec::new(),
            levels,
        })
    }

    pub fn with_steps(mut self, steps: &[Step]) -> Self {
        self.steps.extend_from_slice(steps);
        self
    }

    pub fn outcome(&self) -> &str {
        &self.formula.outcome
    }

    /// Estimates every step on `training`.
    pub fn prep(&self, training: &Table) -> Result<PreparedRecipe, RecipeError> {
        let mut columns: Vec<DerivedColumn> = self
            .predictors
            .iter()
            .map(|name| DerivedColumn::raw(name))
            .collect();

        for step in &self.steps {
            match step {
                Step::Dummy => {
                    columns = columns
                        .into_iter()
                        .flat_map(|column| match self.levels.get(&column.source) {
                            Some(levels) if column.indicator.is_none() => levels
                                .iter()
                                .enumerate()
                                .skip(1)
                                .map(|(code, level)| DerivedColumn {
                                    name: format!("{}_{}", column.source, level),
                                    source: column.source.clone(),
                                    indicator: Some(code as f64),
                                    shift: 0.0,
                                    scale: 1.0,
                                })
                                .collect::<Vec<_>>(),
                            _ => vec![column],
                        })
                        .collect();
                }
                Step::Zv => {
                    let mut kept = Vec::with_capacity(columns.len());
                    for column in columns {
                        let values = column.evaluate(training)?;
                        let (_, sd) = mean_and_sd(&values);
                        if sd > ZERO_VARIANCE_TOLERANCE {
                            kept.push(column);
                        } else {
                            log::debug!("Removing zero-variance predictor '{}'", column.name);
                        }
                    }
                    if kept.is_empty() {
                        return Err(RecipeError::AllPredictorsRemoved);
                    }
                    columns = kept;
                }
                Step::Normalize => {
                    for column in columns.iter_mut() {
                        let values = column.evaluate(training)?;
                        let (mean, sd) = mean_and_sd(&values);
                        column.shift += mean;
                        if sd > ZERO_VARIANCE_TOLERANCE {
                            column.scale /= sd;
                            column.shift /= sd;
                        }
                    }
                }
            }
        }

        Ok(PreparedRecipe {
            outcome: self.formula.outcome.clone(),
            columns,
        })
    }
}

/// One output column of a prepared recipe: `scale * f(source) - shift`, where
/// `f` is the identity or an indicator of one factor code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DerivedColumn {
    name: String,
    source: String,
    indicator: Option<f64>,
    shift: f64,
    scale: f64,
}

impl DerivedColumn {
    fn raw(name: &str) -> Self {
        Self {
            name: name.to_string(),
            source: name.to_string(),
            indicator: None,
            shift: 0.0,
            scale: 1.0,
        }
    }

    fn evaluate(&self, table: &Table) -> Result<Array1<f64>, DataError> {
        let source = table.column(&self.source)?;
        Ok(source.mapv(|v| {
            let base = match self.indicator {
                Some(code) => (v == code) as u8 as f64,
                None => v,
            };
            self.scale * base - self.shift
        }))
    }
}

/// A recipe with all statistics estimated. Baking is a pure function of the
/// input table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedRecipe {
    pub outcome: String,
    columns: Vec<DerivedColumn>,
}

/// A baked design matrix and outcome.
#[derive(Debug, Clone)]
pub struct Baked {
    pub x: Array2<f64>,
    pub y: Array1<f64>,
    pub predictors: Vec<String>,
}

impl PreparedRecipe {
    pub fn predictors(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn bake(&self, table: &Table) -> Result<Baked, RecipeError> {
        let y = table.column(&self.outcome)?.to_owned();
        let mut x = Array2::zeros((table.nrows(), self.columns.len()));
        for (j, column) in self.columns.iter().enumerate() {
            x.column_mut(j).assign(&column.evaluate(table)?);
        }
        Ok(Baked {
            x,
            y,
            predictors: self.predictors(),
        })
    }
}

/// Mean and sample standard deviation.
pub(crate) fn mean_and_sd(values: &Array1<f64>) -> (f64, f64) {
    let n = values.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = values.sum() / n as f64;
    if n < 2 {
        return (mean, 0.0);
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    (mean, var.sqrt())
}
