//! Read-only access to a tabular dataset, one categorical column at a time.

use indexmap::IndexMap;

use crate::error::{Result, WeightingError};

/// A single row: column name → raw value.
pub type Record = IndexMap<String, String>;

/// A record collection the weighting pipeline can read categories from.
///
/// Implementations never expose mutable access; the pipeline only reads the
/// columns it weights on.
pub trait Records {
    fn record_count(&self) -> usize;

    /// Raw values of `column`, one per record, `None` where the value is
    /// absent. Fails when the dataset has no such column.
    fn column_values(&self, column: &str) -> Result<Vec<Option<String>>>;
}

impl Records for [Record] {
    fn record_count(&self) -> usize {
        self.len()
    }

    /// A column is known if at least one row carries it; rows without it hold
    /// an absent value.
    fn column_values(&self, column: &str) -> Result<Vec<Option<String>>> {
        let values: Vec<Option<String>> = self.iter().map(|row| row.get(column).cloned()).collect();
        if !values.is_empty() && values.iter().all(Option::is_none) {
            return Err(WeightingError::ColumnNotFound {
                column: column.to_owned(),
            });
        }
        Ok(values)
    }
}

impl Records for Vec<Record> {
    fn record_count(&self) -> usize {
        self.len()
    }

    fn column_values(&self, column: &str) -> Result<Vec<Option<String>>> {
        self.as_slice().column_values(column)
    }
}
