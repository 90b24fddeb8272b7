//! Per-response-variable dataset construction.
//!
//! Each derived table holds exactly one response in its first column followed
//! by the fixed block of feature columns. Tables are independent copies of the
//! source rows; nothing aliases back into the split.

use crate::data::{ColumnLayout, DataError, Table};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Response index {index} is outside the configured range 1..={responses}.")]
    IndexOutOfRange { index: usize, responses: usize },
    #[error(transparent)]
    Data(#[from] DataError),
}

/// Builds the table `[response_index, features...]` for a 1-based `index`.
///
/// The range of valid indices comes from `layout.responses`, not from the
/// width of `source`.
pub fn response_frame(
    source: &Table,
    layout: &ColumnLayout,
    index: usize,
) -> Result<Table, FrameError> {
    if index == 0 || index > layout.responses {
        return Err(FrameError::IndexOutOfRange {
            index,
            responses: layout.responses,
        });
    }
    layout.validate(source.ncols())?;

    let mut positions = Vec::with_capacity(1 + layout.n_features());
    positions.push(index - 1);
    positions.extend(layout.feature_positions());
    Ok(source.select_columns(&positions))
}

/// Builds every per-response table in index order.
pub fn response_frames(source: &Table, layout: &ColumnLayout) -> Result<Vec<Table>, FrameError> {
    (1..=layout.responses)
        .map(|index| response_frame(source, layout, index))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn source() -> Table {
        let names = ["r1", "r2", "r3", "f1", "f2", "f3", "f4"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let values = Array2::from_shape_fn((9, 7), |(i, j)| (i * 10 + j) as f64);
        Table::new(names, values)
            .unwrap()
            .with_levels("r2", vec!["absent".into(), "present".into()])
            .unwrap()
    }

    fn layout() -> ColumnLayout {
        ColumnLayout {
            responses: 3,
            features: (4, 7),
        }
    }

    #[test]
    fn test_frame_shape_for_every_index() {
        let table = source();
        for index in 1..=3 {
            let frame = response_frame(&table, &layout(), index).unwrap();
            assert_eq!(frame.nrows(), table.nrows());
            assert_eq!(frame.ncols(), 1 + layout().n_features());
            assert_eq!(frame.columns()[0], format!("r{index}"));
            assert_eq!(&frame.columns()[1..], ["f1", "f2", "f3", "f4"]);
        }
    }

    #[test]
    fn test_frame_copies_values_and_levels() {
        let table = source();
        let frame = response_frame(&table, &layout(), 2).unwrap();
        assert_eq!(frame.values()[[4, 0]], 41.0);
        assert_eq!(frame.values()[[4, 1]], 43.0);
        assert!(frame.is_factor("r2"));

        let other = response_frame(&table, &layout(), 1).unwrap();
        assert!(!other.is_factor("r2"));
    }

    #[test]
    fn test_out_of_range_index() {
        let table = source();
        for index in [0, 4] {
            match response_frame(&table, &layout(), index) {
                Err(FrameError::IndexOutOfRange { index: got, responses }) => {
                    assert_eq!(got, index);
                    assert_eq!(responses, 3);
                }
                other => panic!("Expected IndexOutOfRange, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_range_comes_from_layout_not_table_width() {
        let table = source();
        let narrow = ColumnLayout {
            responses: 2,
            features: (4, 7),
        };
        assert!(response_frame(&table, &narrow, 3).is_err());
        assert_eq!(response_frames(&table, &narrow).unwrap().len(), 2);
    }
}
