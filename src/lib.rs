//! rimweight - RIM weighting (raking / iterative proportional fitting) for
//! survey data.
//!
//! Given a record collection and, for each weighting variable, the categories
//! to keep and their target proportions, computes one weight per record such
//! that every variable's weighted marginal matches its target and the weights
//! sum to the record count.
//!
//! ```
//! use rimweight::{weight_records, Record, VariableSpec, WeightingScheme};
//!
//! let records: Vec<Record> = ["M", "M", "M", "F"]
//!     .iter()
//!     .map(|g| Record::from([("gender".to_string(), g.to_string())]))
//!     .collect();
//! let scheme = WeightingScheme::new()
//!     .variable(VariableSpec::new("gender").keep("M", 0.5).keep("F", 0.5));
//!
//! let result = weight_records(&records, &scheme).unwrap();
//! assert!((result.weights[3] - 2.0).abs() < 1e-9);
//! ```
//!
//! Pipeline: [`target`] validates every variable before any weighting,
//! [`bucket`] folds unkept values into `"Others"`, [`engine`] rakes, and
//! [`normalize`] rescales the result.

pub mod arrow_adapter;
pub mod bucket;
pub mod engine;
pub mod error;
pub mod normalize;
pub mod records;
pub mod target;
pub mod weighting;

#[cfg(feature = "python")]
mod python;

pub use bucket::{BucketedColumn, CategoryBucketer, OTHERS};
pub use engine::{MissingCategoryPolicy, RakeOpts, RakeResult, RakeVariable, rim_iterate, rim_iterate_from};
pub use error::{Result, WeightingError};
pub use records::{Record, Records};
pub use target::{TargetDistribution, VariableSpec};
pub use weighting::{
    GroupRakeResult, GroupedWeights, WeightingScheme, weight_records, weight_records_from,
    weight_records_grouped,
};
