//! The weighting pipeline: validate every variable up front, bucket, rake,
//! normalize.
//!
//! Everything here is pure: records are only read, and results come back as
//! new weight vectors.

use std::collections::HashSet;

use indexmap::IndexMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bucket::BucketedColumn;
use crate::engine::{self, RakeOpts, RakeResult, RakeVariable};
use crate::error::{Result, WeightingError};
use crate::normalize::normalize;
use crate::records::Records;
use crate::target::{TargetDistribution, VariableSpec};

/// Group key given to records whose group value is absent.
pub const NULL_GROUP: &str = "__null__";

/// Variables to rake on, in fitting order, plus the stopping rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightingScheme {
    pub variables: Vec<VariableSpec>,
    #[serde(default)]
    pub options: RakeOpts,
}

impl WeightingScheme {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn variable(mut self, spec: VariableSpec) -> Self {
        self.variables.push(spec);
        self
    }

    pub fn options(mut self, options: RakeOpts) -> Self {
        self.options = options;
        self
    }

    /// Parse a scheme such as
    /// `{"variables": [{"column": "gender", "targets": {"M": 0.49}}], "options": {"max_iterations": 20}}`.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate options and every variable, returning one target distribution
    /// per variable in scheme order.
    pub fn validate(&self) -> Result<Vec<TargetDistribution>> {
        self.options.validate()?;

        let mut seen = HashSet::new();
        for spec in &self.variables {
            if !seen.insert(spec.column.as_str()) {
                return Err(WeightingError::DuplicateVariable {
                    variable: spec.column.clone(),
                });
            }
        }

        self.variables.iter().map(VariableSpec::distribution).collect()
    }
}

/// Per-group result returned by grouped weighting.
#[derive(Debug, Clone)]
pub struct GroupRakeResult {
    pub group_key: String,
    pub n_records: usize,
    pub result: RakeResult,
}

/// Full weight vector assembled from independently raked groups.
#[derive(Debug, Clone)]
pub struct GroupedWeights {
    pub weights: Vec<f64>,
    pub groups: Vec<GroupRakeResult>,
}

impl GroupedWeights {
    pub fn converged(&self) -> bool {
        self.groups.iter().all(|g| g.result.converged)
    }
}

// ---------------------------------------------------------------------------
// Single-sample weighting
// ---------------------------------------------------------------------------

/// Weight every record so each variable's weighted marginal matches its
/// target. The returned weights sum to the record count.
pub fn weight_records<R: Records + ?Sized>(
    records: &R,
    scheme: &WeightingScheme,
) -> Result<RakeResult> {
    weight_records_from(records, None, scheme)
}

/// Like [`weight_records`], starting from design weights instead of 1.0.
pub fn weight_records_from<R: Records + ?Sized>(
    records: &R,
    base_weights: Option<&[f64]>,
    scheme: &WeightingScheme,
) -> Result<RakeResult> {
    let targets = scheme.validate()?;
    let n = records.record_count();

    let weights = match base_weights {
        Some(base) if base.len() != n => {
            return Err(WeightingError::LengthMismatch {
                column: "base weights".to_owned(),
                expected: n,
                actual: base.len(),
            });
        }
        Some(base) => base.to_vec(),
        None => vec![1.0; n],
    };

    let columns = bucket_columns(records, scheme)?;
    rake_and_normalize(weights, &columns, &targets, &scheme.options)
}

// ---------------------------------------------------------------------------
// Grouped weighting
// ---------------------------------------------------------------------------

/// Rake each group of records (distinct values of `group_column`)
/// independently against the same scheme.
///
/// Groups share no state, so they run in parallel. Each group is normalized to
/// its own size, which keeps the overall sum at the record count.
pub fn weight_records_grouped<R: Records + ?Sized>(
    records: &R,
    group_column: &str,
    scheme: &WeightingScheme,
) -> Result<GroupedWeights> {
    let targets = scheme.validate()?;
    let n = records.record_count();

    let columns = bucket_columns(records, scheme)?;
    let group_keys = records.column_values(group_column)?;
    let group_entries: Vec<(String, Vec<usize>)> =
        partition_by_group(&group_keys).into_iter().collect();

    let group_results: Vec<(String, Vec<usize>, RakeResult)> = group_entries
        .into_par_iter()
        .map(|(key, row_indices)| -> Result<(String, Vec<usize>, RakeResult)> {
            let group_columns: Vec<BucketedColumn> =
                columns.iter().map(|c| c.select(&row_indices)).collect();
            let result = rake_and_normalize(
                vec![1.0; row_indices.len()],
                &group_columns,
                &targets,
                &scheme.options,
            )?;
            debug!(
                group = %key,
                n_records = row_indices.len(),
                iterations = result.iterations,
                converged = result.converged,
                "group raked"
            );
            Ok((key, row_indices, result))
        })
        .collect::<Result<_>>()?;

    let mut weights = vec![1.0_f64; n];
    let mut groups = Vec::with_capacity(group_results.len());
    for (key, row_indices, result) in group_results {
        for (&idx, &w) in row_indices.iter().zip(&result.weights) {
            weights[idx] = w;
        }
        groups.push(GroupRakeResult {
            group_key: key,
            n_records: row_indices.len(),
            result,
        });
    }

    Ok(GroupedWeights { weights, groups })
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn bucket_columns<R: Records + ?Sized>(
    records: &R,
    scheme: &WeightingScheme,
) -> Result<Vec<BucketedColumn>> {
    scheme
        .variables
        .iter()
        .map(|spec| -> Result<BucketedColumn> {
            let values = records.column_values(&spec.column)?;
            Ok(spec.bucketer().bucket(values.iter().map(|v| v.as_deref())))
        })
        .collect()
}

fn rake_and_normalize(
    weights: Vec<f64>,
    columns: &[BucketedColumn],
    targets: &[TargetDistribution],
    opts: &RakeOpts,
) -> Result<RakeResult> {
    let n = weights.len();
    let variables: Vec<RakeVariable<'_>> = columns
        .iter()
        .zip(targets)
        .map(|(column, target)| RakeVariable::new(column, target))
        .collect();

    let mut result = engine::rim_iterate_from(weights, &variables, opts)?;
    normalize(&mut result.weights, n)?;
    result.refresh_stats();
    Ok(result)
}

/// Partition rows by group key, returning (group_key, row_indices) in insertion order.
fn partition_by_group(group_keys: &[Option<String>]) -> IndexMap<String, Vec<usize>> {
    let mut map: IndexMap<String, Vec<usize>> = IndexMap::new();
    for (i, key) in group_keys.iter().enumerate() {
        let key = key.as_deref().unwrap_or(NULL_GROUP);
        match map.get_mut(key) {
            Some(rows) => rows.push(i),
            None => {
                map.insert(key.to_owned(), vec![i]);
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Record;

    fn rows(gender: &[&str], region: &[&str]) -> Vec<Record> {
        gender
            .iter()
            .zip(region)
            .map(|(g, r)| {
                let mut row = Record::new();
                row.insert("gender".into(), g.to_string());
                row.insert("region".into(), r.to_string());
                row
            })
            .collect()
    }

    #[test]
    fn test_weights_sum_to_record_count() {
        let records = rows(
            &["M", "M", "M", "F", "F", "X"],
            &["N", "S", "S", "N", "E", "W"],
        );
        let scheme = WeightingScheme::new()
            .variable(VariableSpec::new("gender").keep("M", 0.45).keep("F", 0.45))
            .variable(VariableSpec::new("region").keep("N", 0.5).keep("S", 0.3));

        let result = weight_records(&records, &scheme).unwrap();

        assert_eq!(result.weights.len(), 6);
        let sum: f64 = result.weights.iter().sum();
        assert!((sum - 6.0).abs() < 1e-9);
        assert!(result.weights.iter().all(|w| *w >= 0.0));
    }

    #[test]
    fn test_validation_happens_before_weighting() {
        let records = rows(&["A", "B"], &["N", "S"]);
        let scheme = WeightingScheme::new()
            .variable(VariableSpec::new("gender").keep("A", 0.6).keep("B", 0.6));

        assert!(matches!(
            weight_records(&records, &scheme),
            Err(WeightingError::RatiosExceedOne { .. })
        ));

        // Still rejected with no records at all.
        let empty: Vec<Record> = Vec::new();
        assert!(weight_records(&empty, &scheme).is_err());
    }

    #[test]
    fn test_zero_records_is_noop() {
        let empty: Vec<Record> = Vec::new();
        let scheme = WeightingScheme::new().variable(VariableSpec::new("gender").keep("M", 0.5));
        let result = weight_records(&empty, &scheme).unwrap();
        assert!(result.weights.is_empty());
    }

    #[test]
    fn test_duplicate_variable_rejected() {
        let records = rows(&["M"], &["N"]);
        let scheme = WeightingScheme::new()
            .variable(VariableSpec::new("gender").keep("M", 0.5))
            .variable(VariableSpec::new("gender").keep("F", 0.5));
        assert!(matches!(
            weight_records(&records, &scheme),
            Err(WeightingError::DuplicateVariable { .. })
        ));
    }

    #[test]
    fn test_no_variables_gives_unit_weights() {
        let records = rows(&["M", "F", "F"], &["N", "S", "E"]);
        let result = weight_records(&records, &WeightingScheme::new()).unwrap();
        assert_eq!(result.weights, vec![1.0, 1.0, 1.0]);
        assert!(result.converged);
    }

    #[test]
    fn test_base_weights_length_checked() {
        let records = rows(&["M", "F"], &["N", "S"]);
        let scheme = WeightingScheme::new().variable(VariableSpec::new("gender").keep("M", 0.5));
        assert!(matches!(
            weight_records_from(&records, Some(&[1.0][..]), &scheme),
            Err(WeightingError::LengthMismatch { .. })
        ));

        let result = weight_records_from(&records, Some(&[3.0, 1.0][..]), &scheme).unwrap();
        let sum: f64 = result.weights.iter().sum();
        assert!((sum - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_grouped_weighting_normalizes_each_group() {
        let records = rows(
            &["M", "M", "M", "F", "M", "F", "F", "F"],
            &["N", "N", "N", "N", "S", "S", "S", "S"],
        );
        let scheme =
            WeightingScheme::new().variable(VariableSpec::new("gender").keep("M", 0.5).keep("F", 0.5));

        let grouped = weight_records_grouped(&records, "region", &scheme).unwrap();

        assert_eq!(grouped.groups.len(), 2);
        assert_eq!(grouped.groups[0].group_key, "N");
        assert_eq!(grouped.groups[0].n_records, 4);
        let north: f64 = grouped.weights[..4].iter().sum();
        let south: f64 = grouped.weights[4..].iter().sum();
        assert!((north - 4.0).abs() < 1e-9);
        assert!((south - 4.0).abs() < 1e-9);

        // North: 3 M / 1 F raked to 50/50.
        assert!((grouped.weights[0] - 2.0 / 3.0).abs() < 1e-9);
        assert!((grouped.weights[3] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_absent_group_values_form_their_own_group() {
        let keys = vec![Some("a".to_string()), None, Some("a".to_string()), None];
        let groups = partition_by_group(&keys);
        assert_eq!(groups["a"], vec![0, 2]);
        assert_eq!(groups[NULL_GROUP], vec![1, 3]);
    }

    #[test]
    fn test_scheme_from_json() {
        let json = r#"{
            "variables": [
                {"column": "gender", "targets": {"M": 0.49, "F": 0.51}},
                {"column": "region", "targets": {"N": 0.4}}
            ],
            "options": {"max_iterations": 25, "convergence_epsilon": 1e-6, "missing_category": "zero"}
        }"#;

        let scheme = WeightingScheme::from_json(json).unwrap();
        assert_eq!(scheme.variables.len(), 2);
        assert_eq!(scheme.options.max_iterations, 25);
        assert_eq!(scheme.options.convergence_epsilon, Some(1e-6));
        assert_eq!(
            scheme.options.missing_category,
            engine::MissingCategoryPolicy::Zero
        );
        assert!(!scheme.options.parallel);

        let targets = scheme.validate().unwrap();
        assert!((targets[1].others() - 0.6).abs() < 1e-12);

        assert!(matches!(
            WeightingScheme::from_json("{\"variables\": 3}"),
            Err(WeightingError::Scheme(_))
        ));
    }
}
