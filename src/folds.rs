//! V-fold cross-validation resamples.
//!
//! Folds are row-index partitions of one table. With stratification, the rows
//! of each stratum are shuffled and dealt round-robin across folds, continuing
//! the deal from one stratum to the next so fold sizes never differ by more
//! than one row.

use crate::data::{DataError, Table};
use crate::split::{group_rows, make_strata};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FoldError {
    #[error("At least 2 folds are required, got {0}.")]
    TooFewFolds(usize),
    #[error("Cannot build {folds} folds from only {rows} rows.")]
    TooFewRows { folds: usize, rows: usize },
    #[error(transparent)]
    Data(#[from] DataError),
}

/// One resample: the model is fit on `analysis` and scored on `assessment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fold {
    pub id: String,
    pub analysis: Vec<usize>,
    pub assessment: Vec<usize>,
}

impl Fold {
    pub fn analysis_table(&self, data: &Table) -> Table {
        data.select_rows(&self.analysis)
    }

    pub fn assessment_table(&self, data: &Table) -> Table {
        data.select_rows(&self.assessment)
    }
}

/// Folds bound to the table whose rows they index.
#[derive(Debug, Clone)]
pub struct Resamples<'a> {
    pub data: &'a Table,
    pub folds: Vec<Fold>,
}

impl Resamples<'_> {
    pub fn len(&self) -> usize {
        self.folds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folds.is_empty()
    }
}

/// Builds `v` folds over the rows of `table`.
pub fn vfold_cv(
    table: &Table,
    v: usize,
    strata: Option<&str>,
    seed: u64,
) -> Result<Vec<Fold>, FoldError> {
    if v < 2 {
        return Err(FoldError::TooFewFolds(v));
    }
    let n = table.nrows();
    if n < v {
        return Err(FoldError::TooFewRows { folds: v, rows: n });
    }

    let keys = match strata {
        Some(column) => make_strata(table.column(column)?, table.is_factor(column)),
        None => vec![0; n],
    };

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut assignment = vec![0usize; n];
    let mut dealt = 0usize;
    for (_, mut rows) in group_rows(&keys) {
        rows.shuffle(&mut rng);
        for row in rows {
            assignment[row] = dealt % v;
            dealt += 1;
        }
    }

    let folds = (0..v)
        .map(|f| {
            let (assessment, analysis): (Vec<usize>, Vec<usize>) =
                (0..n).partition(|&row| assignment[row] == f);
            Fold {
                id: format!("Fold{}", f + 1),
                analysis,
                assessment,
            }
        })
        .collect();
    Ok(folds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn table(n: usize) -> Table {
        let values = Array2::from_shape_fn((n, 2), |(i, j)| {
            if j == 0 { (i % 4 == 0) as u8 as f64 } else { i as f64 }
        });
        Table::new(vec!["y".into(), "x".into()], values).unwrap()
    }

    #[test]
    fn test_folds_partition_rows() {
        let t = table(80);
        let folds = vfold_cv(&t, 5, Some("y"), 500).unwrap();
        assert_eq!(folds.len(), 5);

        let mut seen = vec![0; 80];
        for fold in &folds {
            assert_eq!(fold.assessment.len(), 16);
            assert_eq!(fold.analysis.len() + fold.assessment.len(), 80);
            for &row in &fold.assessment {
                seen[row] += 1;
            }
        }
        assert!(seen.iter().all(|&c| c == 1));
        assert_eq!(folds[4].id, "Fold5");
        assert_eq!(folds[0].assessment_table(&t).nrows(), 16);
        assert_eq!(folds[0].analysis_table(&t).nrows(), 64);
    }

    #[test]
    fn test_stratified_folds_keep_class_ratio() {
        let t = table(80);
        let y = t.column("y").unwrap();
        let folds = vfold_cv(&t, 5, Some("y"), 500).unwrap();
        for fold in &folds {
            let ones = fold.assessment.iter().filter(|&&r| y[r] == 1.0).count();
            assert_eq!(ones, 4);
        }
    }

    #[test]
    fn test_folds_are_reproducible() {
        let t = table(33);
        let a = vfold_cv(&t, 5, Some("y"), 7).unwrap();
        let b = vfold_cv(&t, 5, Some("y"), 7).unwrap();
        assert_eq!(a, b);
        let sizes: Vec<usize> = a.iter().map(|f| f.assessment.len()).collect();
        assert!(sizes.iter().max().unwrap() - sizes.iter().min().unwrap() <= 1);
    }

    #[test]
    fn test_fold_errors() {
        assert!(matches!(
            vfold_cv(&table(10), 1, None, 1),
            Err(FoldError::TooFewFolds(1))
        ));
        assert!(matches!(
            vfold_cv(&table(3), 5, None, 1),
            Err(FoldError::TooFewRows { folds: 5, rows: 3 })
        ));
    }
}
