//! Category bucketing: fold every value outside a variable's keep set into a
//! shared `"Others"` bucket before any distribution math runs.

use indexmap::IndexSet;

/// Label of the catch-all bucket.
pub const OTHERS: &str = "Others";

/// Maps raw categorical values to either a kept value or [`OTHERS`].
#[derive(Debug, Clone)]
pub struct CategoryBucketer {
    keep: IndexSet<String>,
}

impl CategoryBucketer {
    /// Build a bucketer from a keep set. Order is preserved; duplicates and a
    /// literal `"Others"` entry collapse into the existing categories.
    pub fn new<I, S>(keep: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keep = keep
            .into_iter()
            .map(Into::into)
            .filter(|value| value != OTHERS)
            .collect();
        Self { keep }
    }

    pub fn keep_set(&self) -> impl Iterator<Item = &str> {
        self.keep.iter().map(String::as_str)
    }

    /// Categories of the bucketed column: the keep set followed by `"Others"`.
    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.keep_set().chain(std::iter::once(OTHERS))
    }

    /// Bucket a single value. Absent values land in `"Others"`.
    pub fn bucket_value<'a>(&'a self, value: Option<&'a str>) -> &'a str {
        match value {
            Some(v) if self.keep.contains(v) => v,
            _ => OTHERS,
        }
    }

    /// Bucket a whole column in one pass.
    pub fn bucket<'v, I>(&self, values: I) -> BucketedColumn
    where
        I: IntoIterator<Item = Option<&'v str>>,
    {
        let others_code = self.keep.len() as u32;
        let codes = values
            .into_iter()
            .map(|value| {
                value
                    .and_then(|v| self.keep.get_index_of(v))
                    .map_or(others_code, |idx| idx as u32)
            })
            .collect();

        BucketedColumn {
            categories: self.categories().map(str::to_owned).collect(),
            codes,
        }
    }
}

/// A column after bucketing, stored as dense category codes.
///
/// `codes[i]` indexes into `categories`; every record carries exactly one code.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketedColumn {
    categories: Vec<String>,
    codes: Vec<u32>,
}

impl BucketedColumn {
    /// Build from already-collapsed string values. The category set is the
    /// distinct values in first-seen order; use this when the caller has
    /// bucketed the data itself.
    pub fn from_values<'v, I>(values: I) -> Self
    where
        I: IntoIterator<Item = &'v str>,
    {
        let mut categories: IndexSet<String> = IndexSet::new();
        let codes = values
            .into_iter()
            .map(|value| match categories.get_index_of(value) {
                Some(idx) => idx as u32,
                None => categories.insert_full(value.to_owned()).0 as u32,
            })
            .collect();

        Self {
            categories: categories.into_iter().collect(),
            codes,
        }
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn codes(&self) -> &[u32] {
        &self.codes
    }

    /// Bucketed value of record `i`.
    pub fn value(&self, i: usize) -> Option<&str> {
        self.codes
            .get(i)
            .map(|&code| self.categories[code as usize].as_str())
    }

    /// Unweighted record count per category, aligned with [`Self::categories`].
    pub fn counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.categories.len()];
        for &code in &self.codes {
            counts[code as usize] += 1;
        }
        counts
    }

    /// Restrict to a subset of records, keeping the full category set.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            categories: self.categories.clone(),
            codes: indices.iter().map(|&i| self.codes[i]).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unkept_values_fold_into_others() {
        let bucketer = CategoryBucketer::new(["A", "B"]);
        let raw = [Some("A"), Some("B"), Some("C"), Some("D"), Some("A")];
        let column = bucketer.bucket(raw);

        assert_eq!(column.categories(), &["A", "B", "Others"]);
        assert_eq!(column.codes(), &[0, 1, 2, 2, 0]);
        assert_eq!(column.value(2), Some("Others"));
        assert_eq!(column.value(3), Some("Others"));
        assert_eq!(column.counts(), vec![2, 1, 2]);
    }

    #[test]
    fn test_empty_keep_set_is_single_category() {
        let bucketer = CategoryBucketer::new(Vec::<String>::new());
        let column = bucketer.bucket([Some("x"), Some("y"), None]);

        assert_eq!(column.categories(), &["Others"]);
        assert_eq!(column.codes(), &[0, 0, 0]);
    }

    #[test]
    fn test_absent_values_bucket_to_others() {
        let bucketer = CategoryBucketer::new(["yes"]);
        assert_eq!(bucketer.bucket_value(None), OTHERS);
        assert_eq!(bucketer.bucket_value(Some("yes")), "yes");
        assert_eq!(bucketer.bucket_value(Some("no")), OTHERS);
    }

    #[test]
    fn test_literal_others_in_keep_set_is_not_duplicated() {
        let bucketer = CategoryBucketer::new(["A", "Others", "A"]);
        let cats: Vec<&str> = bucketer.categories().collect();
        assert_eq!(cats, vec!["A", "Others"]);

        let column = bucketer.bucket([Some("Others"), Some("A"), Some("Z")]);
        assert_eq!(column.codes(), &[1, 0, 1]);
    }

    #[test]
    fn test_categories_present_without_records() {
        let bucketer = CategoryBucketer::new(["A", "B"]);
        let column = bucketer.bucket([Some("A"), Some("A")]);
        assert_eq!(column.categories().len(), 3);
        assert_eq!(column.counts(), vec![2, 0, 0]);
    }

    #[test]
    fn test_from_values_and_select() {
        let column = BucketedColumn::from_values(["x", "y", "x", "z"]);
        assert_eq!(column.categories(), &["x", "y", "z"]);
        assert_eq!(column.codes(), &[0, 1, 0, 2]);

        let subset = column.select(&[1, 3]);
        assert_eq!(subset.codes(), &[1, 2]);
        assert_eq!(subset.categories().len(), 3);
    }
}
