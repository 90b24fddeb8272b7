//! # Stratified Train/Test Split
//!
//! Partitions a table into training and test rows. The partition is a pure
//! function of the table, the stratification column, the proportion and the
//! seed, so repeated runs reproduce it exactly.
//!
//! Stratification groups rows before sampling. Discrete columns (factors, or
//! integral columns with few distinct values) stratify by value; continuous
//! columns are binned into quartiles. Strata that hold less than a tenth of
//! the rows are pooled into a neighbour so no stratum is too small to split.

use crate::data::{DataError, Table};
use ndarray::ArrayView1;
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Columns with at most this many distinct integral values stratify by value.
const MAX_DISCRETE_STRATA: usize = 10;
/// Continuous columns are cut into this many quantile bins.
const QUANTILE_BINS: usize = 4;
/// Strata holding a smaller share of the rows than this are pooled.
const POOL_FRACTION: f64 = 0.1;

#[derive(Error, Debug)]
pub enum SplitError {
    #[error("The training proportion must lie strictly between 0 and 1, got {0}.")]
    InvalidProportion(f64),
    #[error(
        "A proportion of {prop} over {rows} rows leaves the training or test subset empty."
    )]
    EmptySubset { prop: f64, rows: usize },
    #[error(transparent)]
    Data(#[from] DataError),
}

/// Row indices of the two subsets, both sorted ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialSplit {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

impl InitialSplit {
    pub fn training(&self, table: &Table) -> Table {
        table.select_rows(&self.train)
    }

    pub fn testing(&self, table: &Table) -> Table {
        table.select_rows(&self.test)
    }
}

/// Splits `table` so that `floor(n * prop)` rows land in the training subset.
///
/// With `strata`, the training quota is apportioned across strata by largest
/// remainder, which keeps the class balance of the reference column in both
/// subsets.
pub fn initial_split(
    table: &Table,
    strata: Option<&str>,
    prop: f64,
    seed: u64,
) -> Result<InitialSplit, SplitError> {
    if !(prop > 0.0 && prop < 1.0) {
        return Err(SplitError::InvalidProportion(prop));
    }
    let n = table.nrows();
    let n_train = (n as f64 * prop).floor() as usize;
    if n_train == 0 || n_train == n {
        return Err(SplitError::EmptySubset { prop, rows: n });
    }

    let keys = match strata {
        Some(column) => make_strata(table.column(column)?, table.is_factor(column)),
        None => vec![0; n],
    };
    let groups = group_rows(&keys);

    let sizes: Vec<usize> = groups.values().map(Vec::len).collect();
    let quotas = apportion(&sizes, n_train);

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut train = Vec::with_capacity(n_train);
    let mut test = Vec::with_capacity(n - n_train);
    for (mut rows, quota) in groups.into_values().zip(quotas) {
        rows.shuffle(&mut rng);
        train.extend_from_slice(&rows[..quota]);
        test.extend_from_slice(&rows[quota..]);
    }
    train.sort_unstable();
    test.sort_unstable();

    log::info!(
        "Split {} rows into {} training and {} test rows (seed {}, {} strata).",
        n,
        train.len(),
        test.len(),
        seed,
        sizes.len()
    );
    Ok(InitialSplit { train, test })
}

/// Assigns every value a stratum id in `0..k`.
pub fn make_strata(values: ArrayView1<f64>, is_factor: bool) -> Vec<usize> {
    let mut distinct: Vec<f64> = values.to_vec();
    distinct.sort_by(f64::total_cmp);
    distinct.dedup();

    let discrete = is_factor
        || (distinct.len() <= MAX_DISCRETE_STRATA && distinct.iter().all(|v| v.fract() == 0.0));

    let raw: Vec<usize> = if discrete {
        values
            .iter()
            .map(|v| {
                distinct
                    .binary_search_by(|d| d.total_cmp(v))
                    .unwrap_or_default()
            })
            .collect()
    } else {
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let last = sorted.len().saturating_sub(1);
        let cuts: Vec<f64> = (1..QUANTILE_BINS)
            .map(|k| sorted[k * last / QUANTILE_BINS])
            .collect();
        values
            .iter()
            .map(|v| cuts.iter().filter(|&&c| *v > c).count())
            .collect()
    };

    pool_small_strata(raw)
}

/// Merges strata below `POOL_FRACTION` of the rows into their neighbour in key
/// order, then relabels the survivors as `0..k`.
fn pool_small_strata(mut keys: Vec<usize>) -> Vec<usize> {
    let n = keys.len();
    let threshold = POOL_FRACTION * n as f64;
    loop {
        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        for &k in &keys {
            *counts.entry(k).or_default() += 1;
        }
        if counts.len() < 2 {
            break;
        }
        let Some((&small, _)) = counts
            .iter()
            .filter(|&(_, &c)| (c as f64) < threshold)
            .min_by_key(|&(_, &c)| c)
        else {
            break;
        };
        let target = counts
            .range(small + 1..)
            .next()
            .or_else(|| counts.range(..small).next_back())
            .map(|(&k, _)| k)
            .unwrap_or(small);
        for k in keys.iter_mut() {
            if *k == small {
                *k = target;
            }
        }
    }

    let survivors: BTreeSet<usize> = keys.iter().copied().collect();
    let relabel: BTreeMap<usize, usize> = survivors
        .into_iter()
        .enumerate()
        .map(|(new, old)| (old, new))
        .collect();
    keys.iter().map(|k| relabel[k]).collect()
}

/// Row indices grouped by stratum id, each group in ascending row order.
pub(crate) fn group_rows(keys: &[usize]) -> BTreeMap<usize, Vec<usize>> {
    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (row, &k) in keys.iter().enumerate() {
        groups.entry(k).or_default().push(row);
    }
    groups
}

/// Largest-remainder apportionment of `total` across groups of the given sizes.
fn apportion(sizes: &[usize], total: usize) -> Vec<usize> {
    let n: usize = sizes.iter().sum();
    let exact: Vec<f64> = sizes
        .iter()
        .map(|&s| s as f64 * total as f64 / n as f64)
        .collect();
    let mut quotas: Vec<usize> = exact.iter().map(|e| e.floor() as usize).collect();
    let mut remaining = total - quotas.iter().sum::<usize>();

    let mut order: Vec<usize> = (0..sizes.len()).collect();
    order.sort_by(|&a, &b| {
        let ra = exact[a] - exact[a].floor();
        let rb = exact[b] - exact[b].floor();
        rb.total_cmp(&ra).then(a.cmp(&b))
    });
    for idx in order {
        if remaining == 0 {
            break;
        }
        if quotas[idx] < sizes[idx] {
            quotas[idx] += 1;
            remaining -= 1;
        }
    }
    quotas
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2};

    fn labelled_table(n: usize) -> Table {
        let values = Array2::from_shape_fn((n, 2), |(i, j)| {
            if j == 0 {
                // 30% ones.
                if i % 10 < 3 { 1.0 } else { 0.0 }
            } else {
                i as f64
            }
        });
        Table::new(vec!["y".into(), "x".into()], values).unwrap()
    }

    #[test]
    fn test_split_sizes_follow_floor_of_proportion() {
        let table = labelled_table(100);
        let split = initial_split(&table, Some("y"), 0.8, 500).unwrap();
        assert_eq!(split.train.len(), 80);
        assert_eq!(split.test.len(), 20);

        let mut all: Vec<usize> = split.train.iter().chain(&split.test).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_split_is_deterministic_for_a_seed() {
        let table = labelled_table(57);
        let a = initial_split(&table, Some("y"), 0.75, 500).unwrap();
        let b = initial_split(&table, Some("y"), 0.75, 500).unwrap();
        let c = initial_split(&table, Some("y"), 0.75, 501).unwrap();
        assert_eq!(a, b);
        assert_ne!(a.train, c.train);
    }

    #[test]
    fn test_stratified_split_preserves_class_balance() {
        let table = labelled_table(100);
        let split = initial_split(&table, Some("y"), 0.8, 500).unwrap();
        let y = table.column("y").unwrap();
        let train_ones = split.train.iter().filter(|&&r| y[r] == 1.0).count();
        let test_ones = split.test.iter().filter(|&&r| y[r] == 1.0).count();
        assert_eq!(train_ones, 24);
        assert_eq!(test_ones, 6);
    }

    #[test]
    fn test_invalid_proportions() {
        let table = labelled_table(20);
        assert!(matches!(
            initial_split(&table, None, 1.0, 1),
            Err(SplitError::InvalidProportion(_))
        ));
        assert!(matches!(
            initial_split(&table, None, 0.01, 1),
            Err(SplitError::EmptySubset { .. })
        ));
        assert!(matches!(
            initial_split(&table, Some("missing"), 0.5, 1),
            Err(SplitError::Data(DataError::ColumnNotFound(_)))
        ));
    }

    #[test]
    fn test_continuous_strata_use_quartiles() {
        let values: Array1<f64> = (0..40).map(|i| i as f64 * 0.37).collect();
        let strata = make_strata(values.view(), false);
        let groups = group_rows(&strata);
        assert_eq!(groups.len(), 4);
        assert!(groups.values().all(|rows| rows.len() >= 9));
    }

    #[test]
    fn test_rare_stratum_is_pooled() {
        // One row of class 2 among twenty.
        let mut values = vec![0.0; 10];
        values.extend(vec![1.0; 9]);
        values.push(2.0);
        let strata = make_strata(Array1::from_vec(values).view(), true);
        let groups = group_rows(&strata);
        assert_eq!(groups.len(), 2);
        assert_eq!(strata[19], strata[18]);
    }

    #[test]
    fn test_apportion_hits_total_exactly() {
        assert_eq!(apportion(&[33, 33, 34], 80), vec![27, 26, 27]);
        assert_eq!(apportion(&[5, 5], 8), vec![4, 4]);
        assert_eq!(apportion(&[1, 9], 5).iter().sum::<usize>(), 5);
    }
}
