//! Target distributions: the validated category → proportion mapping a
//! variable is raked towards.

use std::fmt;

use indexmap::IndexMap;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::bucket::{CategoryBucketer, OTHERS};
use crate::error::{Result, WeightingError};

/// Slack allowed on the ratio sum before it counts as exceeding 1.
pub const RATIO_TOLERANCE: f64 = 1e-9;

/// Caller-facing description of one weighting variable: the column to read and
/// the target ratio for each kept category. Every category not listed here is
/// folded into `"Others"`, which receives the remaining proportion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub column: String,
    #[serde(default, deserialize_with = "unique_targets")]
    pub targets: IndexMap<String, f64>,
    /// Categories passed to [`VariableSpec::keep`] more than once.
    #[serde(skip)]
    duplicates: Vec<String>,
}

impl VariableSpec {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            targets: IndexMap::new(),
            duplicates: Vec::new(),
        }
    }

    /// Keep `category` with the given target ratio.
    ///
    /// Keeping the same category twice is reported by
    /// [`VariableSpec::distribution`]; the first ratio is retained.
    pub fn keep(mut self, category: impl Into<String>, ratio: f64) -> Self {
        let category = category.into();
        if self.targets.contains_key(&category) {
            self.duplicates.push(category);
        } else {
            self.targets.insert(category, ratio);
        }
        self
    }

    pub fn keep_set(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }

    pub fn bucketer(&self) -> CategoryBucketer {
        CategoryBucketer::new(self.keep_set())
    }

    /// Validate into a [`TargetDistribution`].
    pub fn distribution(&self) -> Result<TargetDistribution> {
        if let Some(category) = self.duplicates.first() {
            return Err(WeightingError::DuplicateCategory {
                variable: self.column.clone(),
                category: category.clone(),
            });
        }
        TargetDistribution::from_ratios(
            &self.column,
            self.targets.iter().map(|(k, &v)| (k.as_str(), v)),
        )
    }
}

/// JSON objects may repeat a key; a repeated category is an error rather than
/// a silent overwrite.
fn unique_targets<'de, D>(deserializer: D) -> std::result::Result<IndexMap<String, f64>, D::Error>
where
    D: Deserializer<'de>,
{
    struct UniqueTargets;

    impl<'de> Visitor<'de> for UniqueTargets {
        type Value = IndexMap<String, f64>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of category to target ratio")
        }

        fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut targets = IndexMap::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((category, ratio)) = map.next_entry::<String, f64>()? {
                if targets.contains_key(&category) {
                    return Err(de::Error::custom(format_args!(
                        "duplicate category '{category}'"
                    )));
                }
                targets.insert(category, ratio);
            }
            Ok(targets)
        }
    }

    deserializer.deserialize_map(UniqueTargets)
}

/// Proportions over the keep set plus `"Others"`, summing to 1.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetDistribution {
    variable: String,
    proportions: IndexMap<String, f64>,
}

impl TargetDistribution {
    /// Build from `(category, ratio)` pairs for the kept values.
    ///
    /// `"Others"` receives `1 - sum(ratios)`. A sum above 1 is rejected, never
    /// clamped; a residue within [`RATIO_TOLERANCE`] is treated as zero.
    pub fn from_ratios<I, S>(variable: &str, ratios: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        if variable.is_empty() {
            return Err(WeightingError::EmptyColumnName);
        }

        let mut proportions: IndexMap<String, f64> = IndexMap::new();
        let mut sum = 0.0;
        for (category, ratio) in ratios {
            let category = category.into();
            if category == OTHERS {
                return Err(WeightingError::ReservedCategory {
                    variable: variable.to_owned(),
                    category,
                });
            }
            if !ratio.is_finite() || !(0.0..=1.0).contains(&ratio) {
                return Err(WeightingError::InvalidRatio {
                    variable: variable.to_owned(),
                    category,
                    ratio,
                });
            }
            if proportions.contains_key(&category) {
                return Err(WeightingError::DuplicateCategory {
                    variable: variable.to_owned(),
                    category,
                });
            }
            sum += ratio;
            proportions.insert(category, ratio);
        }

        if sum > 1.0 + RATIO_TOLERANCE {
            return Err(WeightingError::RatiosExceedOne {
                variable: variable.to_owned(),
                sum,
            });
        }

        proportions.insert(OTHERS.to_owned(), (1.0 - sum).max(0.0));

        Ok(Self {
            variable: variable.to_owned(),
            proportions,
        })
    }

    pub fn variable(&self) -> &str {
        &self.variable
    }

    /// Target proportion of `category`, or `None` outside the domain.
    pub fn get(&self, category: &str) -> Option<f64> {
        self.proportions.get(category).copied()
    }

    pub fn others(&self) -> f64 {
        self.proportions.get(OTHERS).copied().unwrap_or(0.0)
    }

    pub fn contains(&self, category: &str) -> bool {
        self.proportions.contains_key(category)
    }

    /// Categories in keep-set order, `"Others"` last.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.proportions.iter().map(|(k, &v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.proportions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proportions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_others_gets_remainder() {
        let dist = TargetDistribution::from_ratios("region", [("North", 0.3), ("South", 0.5)])
            .expect("valid ratios");

        assert_eq!(dist.len(), 3);
        assert!((dist.others() - 0.2).abs() < 1e-12);
        let cats: Vec<&str> = dist.iter().map(|(c, _)| c).collect();
        assert_eq!(cats, vec!["North", "South", "Others"]);
    }

    #[test]
    fn test_ratios_above_one_rejected() {
        let err = TargetDistribution::from_ratios("v", [("A", 0.6), ("B", 0.6)]).unwrap_err();
        match err {
            WeightingError::RatiosExceedOne { variable, sum } => {
                assert_eq!(variable, "v");
                assert!((sum - 1.2).abs() < 1e-12);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_exact_sum_of_one_gives_zero_others() {
        let dist = TargetDistribution::from_ratios("g", [("M", 0.5), ("F", 0.5)]).unwrap();
        assert_eq!(dist.others(), 0.0);

        // 0.33 + 0.56 + 0.11 overshoots 1.0 by one ulp.
        let dist = TargetDistribution::from_ratios("g", [("a", 0.33), ("b", 0.56), ("c", 0.11)])
            .unwrap();
        assert_eq!(dist.others(), 0.0);
    }

    #[test]
    fn test_empty_ratios_put_everything_in_others() {
        let dist = TargetDistribution::from_ratios("g", Vec::<(String, f64)>::new()).unwrap();
        assert_eq!(dist.len(), 1);
        assert_eq!(dist.others(), 1.0);
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        assert!(matches!(
            TargetDistribution::from_ratios("g", [("A", -0.1)]),
            Err(WeightingError::InvalidRatio { .. })
        ));
        assert!(matches!(
            TargetDistribution::from_ratios("g", [("A", f64::NAN)]),
            Err(WeightingError::InvalidRatio { .. })
        ));
        assert!(matches!(
            TargetDistribution::from_ratios("g", [("A", 0.2), ("A", 0.3)]),
            Err(WeightingError::DuplicateCategory { .. })
        ));
        assert!(matches!(
            TargetDistribution::from_ratios("g", [("Others", 0.2)]),
            Err(WeightingError::ReservedCategory { .. })
        ));
        assert!(matches!(
            TargetDistribution::from_ratios("", [("A", 0.2)]),
            Err(WeightingError::EmptyColumnName)
        ));
    }

    #[test]
    fn test_domain_excludes_unlisted_categories() {
        let dist = TargetDistribution::from_ratios("g", [("A", 0.4)]).unwrap();
        assert!(dist.contains("A"));
        assert!(dist.contains("Others"));
        assert_eq!(dist.get("B"), None);
    }

    #[test]
    fn test_repeated_keep_is_a_duplicate_category() {
        let spec = VariableSpec::new("gender").keep("M", 0.4).keep("F", 0.3).keep("M", 0.2);
        match spec.distribution().unwrap_err() {
            WeightingError::DuplicateCategory { variable, category } => {
                assert_eq!(variable, "gender");
                assert_eq!(category, "M");
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = serde_json::from_str::<VariableSpec>(
            r#"{"column": "gender", "targets": {"M": 0.4, "M": 0.2}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate category 'M'"));
    }

    #[test]
    fn test_variable_spec_round_trips_through_json() {
        let spec = VariableSpec::new("gender").keep("M", 0.48).keep("F", 0.5);
        let json = serde_json::to_string(&spec).unwrap();
        let back: VariableSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);

        let dist = back.distribution().unwrap();
        assert!((dist.others() - 0.02).abs() < 1e-12);
        let bucketer = spec.bucketer();
        let keep: Vec<&str> = bucketer.categories().collect();
        assert_eq!(keep, vec!["M", "F", "Others"]);
    }
}
