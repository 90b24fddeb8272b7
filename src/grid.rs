//! Regular hyperparameter grids.
//!
//! Each tunable argument gets `levels` values spaced evenly on its transformed
//! scale between the range bounds; the grid is the cartesian product, with the
//! first argument varying fastest.

use crate::model::TunableParam;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Relative tolerance used when matching a configuration against the grid.
const MATCH_TOLERANCE: f64 = 1e-9;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("A regular grid needs at least one level per parameter.")]
    NoLevels,
    #[error("Range for '{name}' is invalid: lower {lower}, upper {upper}.")]
    InvalidRange { name: String, lower: f64, upper: f64 },
}

/// One grid point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub id: String,
    pub values: BTreeMap<String, f64>,
}

impl Configuration {
    /// `true` when both configurations assign the same values, ignoring ids.
    pub fn same_values(&self, other: &Configuration) -> bool {
        self.values.len() == other.values.len()
            && self.values.iter().all(|(name, &v)| {
                other
                    .values
                    .get(name)
                    .is_some_and(|&w| (v - w).abs() <= MATCH_TOLERANCE * v.abs().max(w.abs()).max(1.0))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    /// Parameter names in grid order.
    pub params: Vec<String>,
    pub configurations: Vec<Configuration>,
}

impl Grid {
    pub fn len(&self) -> usize {
        self.configurations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configurations.is_empty()
    }

    pub fn contains(&self, config: &Configuration) -> bool {
        self.configurations.iter().any(|c| c.same_values(config))
    }

    pub fn get(&self, id: &str) -> Option<&Configuration> {
        self.configurations.iter().find(|c| c.id == id)
    }
}

fn config_id(index: usize, total: usize) -> String {
    let width = total.to_string().len().max(2);
    format!("Model{:0width$}", index + 1)
}

/// Evenly spaced levels of one parameter, in natural units.
pub fn param_levels(param: &TunableParam, levels: usize) -> Result<Vec<f64>, GridError> {
    if levels == 0 {
        return Err(GridError::NoLevels);
    }
    let range = &param.range;
    let lo = range.transform.forward(range.lower);
    let hi = range.transform.forward(range.upper);
    if !lo.is_finite() || !hi.is_finite() || lo > hi {
        return Err(GridError::InvalidRange {
            name: param.name.clone(),
            lower: range.lower,
            upper: range.upper,
        });
    }

    let mut values: Vec<f64> = (0..levels)
        .map(|k| {
            let t = if levels == 1 {
                lo
            } else {
                lo + (hi - lo) * k as f64 / (levels - 1) as f64
            };
            range.transform.inverse(t)
        })
        .collect();
    if range.integer {
        values = values.into_iter().map(f64::round).dedup().collect();
    }
    Ok(values)
}

/// Builds the regular grid over `params`. No parameters yields one empty
/// configuration.
pub fn regular_grid(params: &[TunableParam], levels: usize) -> Result<Grid, GridError> {
    let per_param: Vec<Vec<f64>> = params
        .iter()
        .map(|p| param_levels(p, levels))
        .collect::<Result<_, _>>()?;

    // multi_cartesian_product varies the last axis fastest, so build it over
    // the reversed parameter list and flip each point back.
    let points: Vec<Vec<f64>> = if per_param.is_empty() {
        vec![Vec::new()]
    } else {
        per_param
            .iter()
            .rev()
            .map(|v| v.iter().copied())
            .multi_cartesian_product()
            .map(|mut point| {
                point.reverse();
                point
            })
            .collect()
    };

    let total = points.len();
    let configurations = points
        .into_iter()
        .enumerate()
        .map(|(i, point)| Configuration {
            id: config_id(i, total),
            values: params
                .iter()
                .map(|p| p.name.clone())
                .zip(point)
                .collect(),
        })
        .collect();

    Ok(Grid {
        params: params.iter().map(|p| p.name.clone()).collect(),
        configurations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ParamRange, Transform};
    use approx::assert_relative_eq;

    fn param(name: &str, lower: f64, upper: f64, transform: Transform, integer: bool) -> TunableParam {
        TunableParam {
            name: name.to_string(),
            range: ParamRange {
                lower,
                upper,
                transform,
                integer,
            },
        }
    }

    #[test]
    fn test_levels_on_log_scale() {
        let cost = param("cost", 2f64.powi(-10), 2f64.powi(5), Transform::Log2, false);
        let values = param_levels(&cost, 4).unwrap();
        assert_eq!(values.len(), 4);
        assert_relative_eq!(values[0], 2f64.powi(-10), max_relative = 1e-12);
        assert_relative_eq!(values[1], 2f64.powi(-5), max_relative = 1e-12);
        assert_relative_eq!(values[3], 32.0, max_relative = 1e-12);
    }

    #[test]
    fn test_integer_levels_are_rounded_and_unique() {
        let neighbors = param("neighbors", 1.0, 3.0, Transform::Identity, true);
        assert_eq!(param_levels(&neighbors, 10).unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_first_parameter_varies_fastest() {
        let a = param("cost", 1.0, 2.0, Transform::Identity, false);
        let b = param("rbf_sigma", 10.0, 20.0, Transform::Identity, false);
        let grid = regular_grid(&[a, b], 2).unwrap();
        assert_eq!(grid.len(), 4);
        let cost: Vec<f64> = grid.configurations.iter().map(|c| c.values["cost"]).collect();
        let sigma: Vec<f64> = grid.configurations.iter().map(|c| c.values["rbf_sigma"]).collect();
        assert_eq!(cost, [1.0, 2.0, 1.0, 2.0]);
        assert_eq!(sigma, [10.0, 10.0, 20.0, 20.0]);
        assert_eq!(grid.configurations[0].id, "Model01");
        assert_eq!(grid.configurations[3].id, "Model04");
    }

    #[test]
    fn test_contains_ignores_ids() {
        let a = param("penalty", 0.0, 1.0, Transform::Identity, false);
        let grid = regular_grid(&[a], 3).unwrap();
        let inside = Configuration {
            id: "elsewhere".into(),
            values: BTreeMap::from([("penalty".to_string(), 0.5)]),
        };
        assert!(grid.contains(&inside));
        let outside = Configuration {
            id: "Model02".into(),
            values: BTreeMap::from([("penalty".to_string(), 0.25)]),
        };
        assert!(!grid.contains(&outside));
    }

    #[test]
    fn test_empty_parameter_list_and_errors() {
        let grid = regular_grid(&[], 10).unwrap();
        assert_eq!(grid.len(), 1);
        assert!(grid.configurations[0].values.is_empty());

        let a = param("mixture", 0.0, 1.0, Transform::Identity, false);
        assert!(matches!(regular_grid(&[a], 0), Err(GridError::NoLevels)));
        let bad = param("rbf_sigma", 0.0, 1.0, Transform::Log10, false);
        assert!(matches!(
            regular_grid(&[bad], 2),
            Err(GridError::InvalidRange { .. })
        ));
    }
}
