//! PyO3 bindings for rimweight.
//!
//! Arrow PyCapsule architecture:
//!   DataFrame → __arrow_c_stream__ → Rust → RecordBatch + weight column → __arrow_c_stream__
//!
//! No NumPy. No Python lists in the data path.

use std::collections::HashMap;
use std::ffi::CString;

use arrow::array::{RecordBatch, RecordBatchReader};
use arrow::ffi_stream::{ArrowArrayStreamReader, FFI_ArrowArrayStream};
use arrow::record_batch::RecordBatchIterator;

use pyo3::exceptions::{PyKeyError, PyRuntimeError, PyTypeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyCapsule, PyDict, PyFloat};

use crate::arrow_adapter;
use crate::engine::{MissingCategoryPolicy, RakeOpts, RakeResult};
use crate::error::WeightingError;
use crate::target::VariableSpec;
use crate::weighting::WeightingScheme;

const STREAM_CAPSULE_NAME: &str = "arrow_array_stream";

fn to_py_err(err: WeightingError) -> PyErr {
    match err {
        WeightingError::ColumnNotFound { .. } => PyKeyError::new_err(err.to_string()),
        WeightingError::UnsupportedColumnType { .. } => PyTypeError::new_err(err.to_string()),
        e if e.is_validation() => PyValueError::new_err(e.to_string()),
        e => PyRuntimeError::new_err(e.to_string()),
    }
}

fn capsule_name() -> PyResult<CString> {
    CString::new(STREAM_CAPSULE_NAME).map_err(|e| PyValueError::new_err(e.to_string()))
}

// ---------------------------------------------------------------------------
// Arrow FFI helpers
// ---------------------------------------------------------------------------

/// Consume a Python object implementing `__arrow_c_stream__` into a RecordBatch.
fn arrow_from_pycapsule(py: Python<'_>, data: &Bound<'_, PyAny>) -> PyResult<RecordBatch> {
    let capsule: Bound<'_, PyCapsule> = data
        .call_method1("__arrow_c_stream__", (py.None(),))?
        .cast_into()?;

    // SAFETY: The PyCapsule wraps an FFI_ArrowArrayStream allocated by the producer.
    // We take ownership by reading the struct and nulling the release callback on
    // the original, so the PyCapsule destructor becomes a no-op.
    let name = capsule_name()?;
    let ptr = capsule.pointer_checked(Some(name.as_c_str()))?;
    let stream_ptr = ptr.as_ptr() as *mut FFI_ArrowArrayStream;
    let stream_owned = unsafe { std::ptr::read(stream_ptr) };
    unsafe {
        (*stream_ptr).release = None;
    }

    let reader = ArrowArrayStreamReader::try_new(stream_owned)
        .map_err(|e| PyValueError::new_err(format!("Arrow stream error: {e}")))?;

    let schema = reader.schema();
    let mut batches: Vec<RecordBatch> = reader
        .collect::<Result<_, _>>()
        .map_err(|e| PyValueError::new_err(format!("Arrow batch error: {e}")))?;

    match batches.len() {
        0 => Ok(RecordBatch::new_empty(schema)),
        1 => Ok(batches.remove(0)),
        _ => arrow::compute::concat_batches(&schema, &batches)
            .map_err(|e| PyValueError::new_err(format!("Arrow concat error: {e}"))),
    }
}

/// Wraps an Arrow RecordBatch and exports it via the Arrow PyCapsule Interface.
#[pyclass(name = "_ArrowData")]
struct PyArrowData {
    batch: RecordBatch,
}

#[pymethods]
impl PyArrowData {
    /// Arrow PyCapsule Interface: export as an ArrowArrayStream capsule.
    #[pyo3(signature = (requested_schema=None))]
    fn __arrow_c_stream__<'py>(
        &self,
        py: Python<'py>,
        requested_schema: Option<Bound<'py, PyCapsule>>,
    ) -> PyResult<Bound<'py, PyCapsule>> {
        let _ = requested_schema;
        let schema = self.batch.schema();
        let batches = vec![self.batch.clone()];
        let reader = RecordBatchIterator::new(batches.into_iter().map(Ok), schema);
        let reader: Box<dyn RecordBatchReader + Send> = Box::new(reader);
        let ffi_stream = FFI_ArrowArrayStream::new(reader);

        PyCapsule::new(py, ffi_stream, Some(capsule_name()?))
    }

    fn __repr__(&self) -> String {
        format!(
            "_ArrowData(rows={}, cols={})",
            self.batch.num_rows(),
            self.batch.num_columns()
        )
    }
}

// ---------------------------------------------------------------------------
// Python-facing RakeResult (diagnostics only, weights live in the batch)
// ---------------------------------------------------------------------------

#[pyclass(name = "RakeResult")]
struct PyRakeResult {
    #[pyo3(get)]
    group_key: Option<String>,

    #[pyo3(get)]
    n_records: usize,

    #[pyo3(get)]
    iterations: usize,

    #[pyo3(get)]
    converged: bool,

    #[pyo3(get)]
    max_delta: f64,

    #[pyo3(get)]
    efficiency: f64,

    #[pyo3(get)]
    weight_min: f64,

    #[pyo3(get)]
    weight_max: f64,
}

impl PyRakeResult {
    fn from_result(group_key: Option<String>, result: &RakeResult) -> Self {
        Self {
            group_key,
            n_records: result.weights.len(),
            iterations: result.iterations,
            converged: result.converged,
            max_delta: result.max_delta,
            efficiency: result.efficiency,
            weight_min: result.weight_min,
            weight_max: result.weight_max,
        }
    }
}

#[pymethods]
impl PyRakeResult {
    /// Ratio of max to min weight.
    #[getter]
    fn weight_ratio(&self) -> f64 {
        match self.weight_min {
            min if min > 0.0 => self.weight_max / min,
            _ => f64::INFINITY,
        }
    }

    /// Diagnostics as a Python dict; extreme weights rounded to 4 places.
    fn summary(&self) -> HashMap<String, f64> {
        let round = |x: f64, places: i32| {
            let scale = 10f64.powi(places);
            (x * scale).round() / scale
        };
        [
            ("n_records", self.n_records as f64),
            ("iterations", self.iterations as f64),
            ("converged", f64::from(u8::from(self.converged))),
            ("max_delta", self.max_delta),
            ("efficiency", round(self.efficiency, 2)),
            ("weight_min", round(self.weight_min, 4)),
            ("weight_max", round(self.weight_max, 4)),
            ("weight_ratio", round(self.weight_ratio(), 2)),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
    }

    fn __repr__(&self) -> String {
        format!(
            "RakeResult(n_records={}, iterations={}, converged={}, max_delta={:.2e}, efficiency={:.2}%, weights=[{:.4}..{:.4}])",
            self.n_records,
            self.iterations,
            self.converged,
            self.max_delta,
            self.efficiency,
            self.weight_min,
            self.weight_max,
        )
    }
}

// ---------------------------------------------------------------------------
// Helper: convert Python dicts to a weighting scheme
// ---------------------------------------------------------------------------

/// Label a dict key the way `arrow_adapter` labels column cells: floats in
/// shortest form (`1.0` → `"1"`), booleans lowercase, anything else via `str()`.
fn category_label(key: &Bound<'_, PyAny>) -> PyResult<String> {
    if let Ok(s) = key.extract::<String>() {
        return Ok(s);
    }
    if key.is_instance_of::<PyBool>() {
        return Ok(key.extract::<bool>()?.to_string());
    }
    if key.is_instance_of::<PyFloat>() {
        return Ok(key.extract::<f64>()?.to_string());
    }
    Ok(key.str()?.to_string())
}

/// Convert `dict[str, dict[Any, float]]` (column → kept category → ratio) into
/// variable specs, preserving dict order.
fn extract_variables(variables: &Bound<'_, PyDict>) -> PyResult<Vec<VariableSpec>> {
    let mut specs = Vec::with_capacity(variables.len());

    for (col_key, ratios_obj) in variables.iter() {
        let column: String = col_key.extract()?;
        let ratios: Bound<'_, PyDict> = ratios_obj.extract()?;
        let mut spec = VariableSpec::new(column);

        for (category_key, ratio) in ratios.iter() {
            spec = spec.keep(category_label(&category_key)?, ratio.extract::<f64>()?);
        }

        specs.push(spec);
    }

    Ok(specs)
}

fn build_scheme(
    variables: &Bound<'_, PyDict>,
    max_iterations: usize,
    convergence_epsilon: Option<f64>,
    missing_category: &str,
    parallel: bool,
) -> PyResult<WeightingScheme> {
    let options = RakeOpts {
        max_iterations,
        convergence_epsilon,
        missing_category: missing_category
            .parse::<MissingCategoryPolicy>()
            .map_err(to_py_err)?,
        parallel,
    };
    Ok(WeightingScheme {
        variables: extract_variables(variables)?,
        options,
    })
}

// ---------------------------------------------------------------------------
// rim_weight: single sample (Arrow in → Arrow out)
// ---------------------------------------------------------------------------

/// RIM weighting over a whole table.
///
/// Accepts any object with `__arrow_c_stream__` (polars, pyarrow, narwhals).
/// Non-string cells and keys are compared as labels: `1`, `1.0` and `"1"` all
/// name the same category.
/// Returns (Arrow data with the weight column attached, RakeResult diagnostics).
#[pyfunction]
#[pyo3(signature = (
    data,
    variables,
    weight_column = "weight",
    max_iterations = 10,
    convergence_epsilon = None,
    missing_category = "identity",
    parallel = false,
))]
#[allow(clippy::too_many_arguments)]
fn rim_weight(
    py: Python<'_>,
    data: &Bound<'_, PyAny>,
    variables: &Bound<'_, PyDict>,
    weight_column: &str,
    max_iterations: usize,
    convergence_epsilon: Option<f64>,
    missing_category: &str,
    parallel: bool,
) -> PyResult<(PyArrowData, PyRakeResult)> {
    let batch = arrow_from_pycapsule(py, data)?;
    let scheme = build_scheme(
        variables,
        max_iterations,
        convergence_epsilon,
        missing_category,
        parallel,
    )?;

    let (result_batch, result) =
        arrow_adapter::weight_batch(&batch, &scheme, weight_column).map_err(to_py_err)?;

    Ok((
        PyArrowData {
            batch: result_batch,
        },
        PyRakeResult::from_result(None, &result),
    ))
}

// ---------------------------------------------------------------------------
// rim_weight_grouped: same scheme raked within each group
// ---------------------------------------------------------------------------

/// RIM weighting within each distinct value of `group_by`.
///
/// Returns (Arrow data with the weight column attached, per-group diagnostics).
#[pyfunction]
#[pyo3(signature = (
    data,
    variables,
    group_by,
    weight_column = "weight",
    max_iterations = 10,
    convergence_epsilon = None,
    missing_category = "identity",
    parallel = false,
))]
#[allow(clippy::too_many_arguments)]
fn rim_weight_grouped(
    py: Python<'_>,
    data: &Bound<'_, PyAny>,
    variables: &Bound<'_, PyDict>,
    group_by: &str,
    weight_column: &str,
    max_iterations: usize,
    convergence_epsilon: Option<f64>,
    missing_category: &str,
    parallel: bool,
) -> PyResult<(PyArrowData, Vec<PyRakeResult>)> {
    let batch = arrow_from_pycapsule(py, data)?;
    let scheme = build_scheme(
        variables,
        max_iterations,
        convergence_epsilon,
        missing_category,
        parallel,
    )?;

    let (result_batch, grouped) =
        arrow_adapter::weight_batch_grouped(&batch, group_by, &scheme, weight_column)
            .map_err(to_py_err)?;

    let diagnostics = grouped
        .groups
        .iter()
        .map(|g| PyRakeResult::from_result(Some(g.group_key.clone()), &g.result))
        .collect();

    Ok((
        PyArrowData {
            batch: result_batch,
        },
        diagnostics,
    ))
}

// ---------------------------------------------------------------------------
// Module definition
// ---------------------------------------------------------------------------

/// rimweight - RIM weighting engine written in Rust.
#[pymodule]
fn _rimweight(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyRakeResult>()?;
    m.add_class::<PyArrowData>()?;
    m.add_function(wrap_pyfunction!(rim_weight, m)?)?;
    m.add_function(wrap_pyfunction!(rim_weight_grouped, m)?)?;
    Ok(())
}
