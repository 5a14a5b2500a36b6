//! Arrow middleware for RIM weighting.
//!
//! Sits between the pure pipeline (`weighting.rs`) and any language binding
//! (`python.rs`). It operates on Arrow RecordBatches and has **zero PyO3
//! dependency**.
//!
//! Two tiers:
//!   1. Column helpers: category extraction, weight column append
//!   2. `weight_batch*`: orchestrators returning a new RecordBatch with the
//!      weight column attached

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, Float64Array, RecordBatch};
use arrow::compute::{can_cast_types, cast};
use arrow::datatypes::{DataType, Field, FieldRef, Float32Type, Float64Type, Schema};

use crate::engine::RakeResult;
use crate::error::{Result, WeightingError};
use crate::records::Records;
use crate::weighting::{self, GroupedWeights, WeightingScheme};

// ---------------------------------------------------------------------------
// Tier 1: Column helpers
// ---------------------------------------------------------------------------

fn owned<'a>(values: impl Iterator<Item = Option<&'a str>>) -> Vec<Option<String>> {
    values.map(|v| v.map(str::to_owned)).collect()
}

fn float_labels<T: std::fmt::Display>(values: impl Iterator<Item = Option<T>>) -> Vec<Option<String>> {
    values.map(|v| v.map(|x| x.to_string())).collect()
}

/// Extract a column as optional category labels, `None` for null cells.
///
/// String columns (Utf8, LargeUtf8, Utf8View) are read directly. Float
/// columns are labelled with the shortest decimal form, so a whole value drops
/// its fraction: `1.0` becomes `"1"`, matching the integer code `1`, while
/// `1.5` stays `"1.5"`. Anything else Arrow can cast to Utf8 (integers,
/// booleans, dictionaries) is cast, so the integer code `3` becomes `"3"`.
pub fn extract_category_column(batch: &RecordBatch, col_name: &str) -> Result<Vec<Option<String>>> {
    let col_idx = batch
        .schema()
        .index_of(col_name)
        .map_err(|_| WeightingError::ColumnNotFound {
            column: col_name.to_owned(),
        })?;

    let array = batch.column(col_idx);

    match array.data_type() {
        DataType::Utf8 => Ok(owned(array.as_string::<i32>().iter())),
        DataType::LargeUtf8 => Ok(owned(array.as_string::<i64>().iter())),
        DataType::Utf8View => Ok(owned(array.as_string_view().iter())),
        DataType::Float16 | DataType::Float32 => {
            let values = cast(array, &DataType::Float32)?;
            Ok(float_labels(values.as_primitive::<Float32Type>().iter()))
        }
        DataType::Float64 => Ok(float_labels(array.as_primitive::<Float64Type>().iter())),
        dt if can_cast_types(dt, &DataType::Utf8) => {
            let labels = cast(array, &DataType::Utf8)?;
            Ok(owned(labels.as_string::<i32>().iter()))
        }
        dt => Err(WeightingError::UnsupportedColumnType {
            column: col_name.to_owned(),
            data_type: format!("{dt:?}"),
        }),
    }
}

impl Records for RecordBatch {
    fn record_count(&self) -> usize {
        self.num_rows()
    }

    fn column_values(&self, column: &str) -> Result<Vec<Option<String>>> {
        extract_category_column(self, column)
    }
}

/// Return a new batch with a non-nullable Float64 weight column.
///
/// Existing columns are Arc-shared (zero-copy). A column already named
/// `column_name` is replaced in place; otherwise the weights are appended.
pub fn append_weight_column(
    batch: &RecordBatch,
    weights: Vec<f64>,
    column_name: &str,
) -> Result<RecordBatch> {
    if weights.len() != batch.num_rows() {
        return Err(WeightingError::LengthMismatch {
            column: column_name.to_owned(),
            expected: batch.num_rows(),
            actual: weights.len(),
        });
    }

    let schema = batch.schema();
    let weight_array: ArrayRef = Arc::new(Float64Array::from(weights));
    let weight_field: FieldRef = Arc::new(Field::new(column_name, DataType::Float64, false));

    let mut fields: Vec<FieldRef> = schema.fields().iter().cloned().collect();
    let mut columns: Vec<ArrayRef> = batch.columns().to_vec();
    match schema.index_of(column_name) {
        Ok(idx) => {
            fields[idx] = weight_field;
            columns[idx] = weight_array;
        }
        Err(_) => {
            fields.push(weight_field);
            columns.push(weight_array);
        }
    }

    let new_schema = Arc::new(Schema::new_with_metadata(fields, schema.metadata().clone()));
    Ok(RecordBatch::try_new(new_schema, columns)?)
}

// ---------------------------------------------------------------------------
// Tier 2: Orchestrators
// ---------------------------------------------------------------------------

/// Weight a batch. Returns a new RecordBatch with the weight column attached,
/// plus diagnostics. The input batch is untouched.
pub fn weight_batch(
    batch: &RecordBatch,
    scheme: &WeightingScheme,
    weight_column: &str,
) -> Result<(RecordBatch, RakeResult)> {
    let result = weighting::weight_records(batch, scheme)?;
    let result_batch = append_weight_column(batch, result.weights.clone(), weight_column)?;
    Ok((result_batch, result))
}

/// Grouped weighting: every distinct value of `group_column` is raked on its
/// own, in parallel, and the group weights are assembled into one column.
pub fn weight_batch_grouped(
    batch: &RecordBatch,
    group_column: &str,
    scheme: &WeightingScheme,
    weight_column: &str,
) -> Result<(RecordBatch, GroupedWeights)> {
    let grouped = weighting::weight_records_grouped(batch, group_column, scheme)?;
    let result_batch = append_weight_column(batch, grouped.weights.clone(), weight_column)?;
    Ok((result_batch, grouped))
}
