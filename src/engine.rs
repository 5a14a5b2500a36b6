//! Core RIM (Raking / Iterative Proportional Fitting) algorithm.
//!
//! All computation uses dense category codes and plain weight slices; Arrow
//! and row-oriented inputs are bucketed upstream.
//!
//! Per-category sums are reduced over fixed-size chunks and merged in chunk
//! order, so a sequential run and a rayon-parallel run produce bit-identical
//! weights.

use std::str::FromStr;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bucket::BucketedColumn;
use crate::error::{Result, WeightingError};
use crate::target::TargetDistribution;

pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Records per reduction chunk.
const CHUNK_LEN: usize = 16 * 1024;

/// Multiplier applied to records whose bucketed category has no target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingCategoryPolicy {
    /// Leave the weight unchanged (factor 1).
    #[default]
    Identity,
    /// Zero the weight (factor 0).
    Zero,
}

impl MissingCategoryPolicy {
    fn factor(self) -> f64 {
        match self {
            MissingCategoryPolicy::Identity => 1.0,
            MissingCategoryPolicy::Zero => 0.0,
        }
    }
}

impl FromStr for MissingCategoryPolicy {
    type Err = WeightingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "identity" => Ok(MissingCategoryPolicy::Identity),
            "zero" => Ok(MissingCategoryPolicy::Zero),
            other => Err(WeightingError::InvalidOptions {
                reason: format!("unknown missing-category policy '{other}'"),
            }),
        }
    }
}

/// Options for the raking algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RakeOpts {
    /// Upper bound on full passes over all variables.
    pub max_iterations: usize,
    /// Stop once every weighted marginal is within this distance of its
    /// target. `None` always runs `max_iterations` passes.
    pub convergence_epsilon: Option<f64>,
    pub missing_category: MissingCategoryPolicy,
    /// Run reductions and weight updates on the rayon pool.
    pub parallel: bool,
}

impl Default for RakeOpts {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            convergence_epsilon: None,
            missing_category: MissingCategoryPolicy::Identity,
            parallel: false,
        }
    }
}

impl RakeOpts {
    pub fn validate(&self) -> Result<()> {
        if let Some(eps) = self.convergence_epsilon
            && !(eps.is_finite() && eps > 0.0)
        {
            return Err(WeightingError::InvalidOptions {
                reason: format!("convergence epsilon must be positive and finite, got {eps}"),
            });
        }
        Ok(())
    }
}

/// Result of a single raking operation.
#[derive(Debug, Clone)]
pub struct RakeResult {
    pub weights: Vec<f64>,
    /// Full passes performed.
    pub iterations: usize,
    /// `true` when the convergence tolerance was met (or there was nothing to
    /// fit); `false` when the pass cap was exhausted.
    pub converged: bool,
    /// Largest `|actual - target|` over all variables and categories for the
    /// final weights.
    pub max_delta: f64,
    pub efficiency: f64,
    pub weight_min: f64,
    pub weight_max: f64,
}

impl RakeResult {
    pub(crate) fn new(weights: Vec<f64>, iterations: usize, converged: bool, max_delta: f64) -> Self {
        let mut result = Self {
            weights,
            iterations,
            converged,
            max_delta,
            efficiency: 100.0,
            weight_min: 1.0,
            weight_max: 1.0,
        };
        result.refresh_stats();
        result
    }

    /// Recompute efficiency and the weight range after the weights changed.
    pub fn refresh_stats(&mut self) {
        if self.weights.is_empty() {
            self.efficiency = 100.0;
            self.weight_min = 1.0;
            self.weight_max = 1.0;
            return;
        }
        self.efficiency = calculate_efficiency(&self.weights);
        self.weight_min = self.weights.iter().cloned().fold(f64::INFINITY, f64::min);
        self.weight_max = self.weights.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    }

    pub fn weight_ratio(&self) -> f64 {
        if self.weight_min > 0.0 {
            self.weight_max / self.weight_min
        } else {
            f64::INFINITY
        }
    }
}

/// One variable to rake on: its bucketed column and its target.
#[derive(Debug, Clone, Copy)]
pub struct RakeVariable<'a> {
    pub column: &'a BucketedColumn,
    pub target: &'a TargetDistribution,
}

impl<'a> RakeVariable<'a> {
    pub fn new(column: &'a BucketedColumn, target: &'a TargetDistribution) -> Self {
        Self { column, target }
    }
}

// ---------------------------------------------------------------------------
// Target cache: built once per variable, reused across all passes
// ---------------------------------------------------------------------------

struct PreparedVariable<'a> {
    name: &'a str,
    codes: &'a [u32],
    /// Target per category slot. Slots past the bucketed categories belong to
    /// target categories no record carries; they only count towards the
    /// convergence residual.
    targets: Vec<Option<f64>>,
}

fn prepare<'a>(var: &RakeVariable<'a>, policy: MissingCategoryPolicy) -> PreparedVariable<'a> {
    let categories = var.column.categories();
    let mut targets: Vec<Option<f64>> = categories.iter().map(|c| var.target.get(c)).collect();

    for (category, proportion) in var.target.iter() {
        if !categories.iter().any(|c| c == category) {
            targets.push(Some(proportion));
        }
    }

    for (category, target) in categories.iter().zip(&targets) {
        if target.is_none() {
            warn!(
                variable = var.target.variable(),
                category = %category,
                policy = ?policy,
                "bucketed category has no target proportion"
            );
        }
    }

    PreparedVariable {
        name: var.target.variable(),
        codes: var.column.codes(),
        targets,
    }
}

// ---------------------------------------------------------------------------
// Chunked reductions
// ---------------------------------------------------------------------------

fn chunk_sums(weights: &[f64], codes: &[u32], n_categories: usize) -> Vec<f64> {
    let mut sums = vec![0.0_f64; n_categories];
    for (&w, &code) in weights.iter().zip(codes) {
        sums[code as usize] += w;
    }
    sums
}

/// Weight mass per category slot.
fn category_sums(weights: &[f64], codes: &[u32], n_categories: usize, parallel: bool) -> Vec<f64> {
    let partials: Vec<Vec<f64>> = if parallel {
        weights
            .par_chunks(CHUNK_LEN)
            .zip(codes.par_chunks(CHUNK_LEN))
            .map(|(w, c)| chunk_sums(w, c, n_categories))
            .collect()
    } else {
        weights
            .chunks(CHUNK_LEN)
            .zip(codes.chunks(CHUNK_LEN))
            .map(|(w, c)| chunk_sums(w, c, n_categories))
            .collect()
    };

    let mut sums = vec![0.0_f64; n_categories];
    for partial in &partials {
        for (total, value) in sums.iter_mut().zip(partial) {
            *total += value;
        }
    }
    sums
}

fn apply_factors(weights: &mut [f64], codes: &[u32], factors: &[f64], parallel: bool) {
    if parallel {
        weights
            .par_iter_mut()
            .zip(codes.par_iter())
            .for_each(|(w, &code)| *w *= factors[code as usize]);
    } else {
        for (w, &code) in weights.iter_mut().zip(codes) {
            *w *= factors[code as usize];
        }
    }
}

fn total_mass(sums: &[f64], variable: &str, pass: usize) -> Result<f64> {
    let total: f64 = sums.iter().sum();
    if total > 0.0 && total.is_finite() {
        Ok(total)
    } else {
        Err(WeightingError::WeightCollapse {
            variable: variable.to_owned(),
            pass,
        })
    }
}

// ---------------------------------------------------------------------------
// Single-variable raking adjustment
// ---------------------------------------------------------------------------

/// Adjust weights so the weighted distribution of one variable matches its
/// target. A category with no weighted mass gets factor 0.
///
/// Target mass assigned to empty categories can never be reached; every factor
/// is scaled by `1 / (1 - unreachable)` so the total weight is not drained by
/// it on each pass. The scaling is uniform and leaves all proportions intact.
fn rake_on_variable(
    weights: &mut [f64],
    var: &PreparedVariable<'_>,
    opts: &RakeOpts,
    pass: usize,
) -> Result<()> {
    let sums = category_sums(weights, var.codes, var.targets.len(), opts.parallel);
    let total = total_mass(&sums, var.name, pass)?;

    let unreachable: f64 = sums
        .iter()
        .zip(&var.targets)
        .filter(|(sum, _)| **sum <= 0.0)
        .filter_map(|(_, target)| *target)
        .sum();
    let rescale = if unreachable > 0.0 && unreachable < 1.0 {
        1.0 / (1.0 - unreachable)
    } else {
        1.0
    };

    let factors: Vec<f64> = sums
        .iter()
        .zip(&var.targets)
        .map(|(&sum, target)| match target {
            Some(target) => {
                let actual = sum / total;
                if actual > 0.0 { target / actual } else { 0.0 }
            }
            None => opts.missing_category.factor(),
        })
        .map(|factor| factor * rescale)
        .collect();

    apply_factors(weights, var.codes, &factors, opts.parallel);
    Ok(())
}

/// Largest gap between weighted and target proportions across all variables.
fn max_marginal_delta(
    weights: &[f64],
    prepared: &[PreparedVariable<'_>],
    parallel: bool,
    pass: usize,
) -> Result<f64> {
    let mut max_delta = 0.0_f64;
    for var in prepared {
        let sums = category_sums(weights, var.codes, var.targets.len(), parallel);
        let total = total_mass(&sums, var.name, pass)?;
        for (&sum, target) in sums.iter().zip(&var.targets) {
            if let Some(target) = target {
                max_delta = max_delta.max((sum / total - target).abs());
            }
        }
    }
    Ok(max_delta)
}

// ---------------------------------------------------------------------------
// Weighting efficiency
// ---------------------------------------------------------------------------

/// Efficiency = (sum(w))^2 / (n * sum(w^2)) * 100
/// Perfect weights (all 1.0) = 100%.
pub fn calculate_efficiency(weights: &[f64]) -> f64 {
    let n = weights.len() as f64;
    if n == 0.0 {
        return 0.0;
    }

    let sum_w: f64 = weights.iter().sum();
    let sum_w_sq: f64 = weights.iter().map(|w| w * w).sum();

    if sum_w_sq == 0.0 {
        return 0.0;
    }

    (sum_w * sum_w) / (n * sum_w_sq) * 100.0
}

// ---------------------------------------------------------------------------
// Main entry points
// ---------------------------------------------------------------------------

/// Rake from uniform starting weights of 1.0.
///
/// The record count is taken from the first variable; no variables means no
/// records to weight.
pub fn rim_iterate(variables: &[RakeVariable<'_>], opts: &RakeOpts) -> Result<RakeResult> {
    let n = variables.first().map_or(0, |v| v.column.len());
    rim_iterate_from(vec![1.0; n], variables, opts)
}

/// Core RIM iteration loop, starting from caller-supplied base weights.
///
/// Variables are fitted one at a time in the given order; each fit sees the
/// weights left by the previous one. Returns raw (unnormalized) weights.
pub fn rim_iterate_from(
    mut weights: Vec<f64>,
    variables: &[RakeVariable<'_>],
    opts: &RakeOpts,
) -> Result<RakeResult> {
    opts.validate()?;

    let n = weights.len();
    if let Some(bad) = weights.iter().find(|w| !(w.is_finite() && **w >= 0.0)) {
        return Err(WeightingError::InvalidBaseWeights {
            reason: format!("weights must be finite and non-negative, found {bad}"),
        });
    }
    for var in variables {
        if var.column.len() != n {
            return Err(WeightingError::LengthMismatch {
                column: var.target.variable().to_owned(),
                expected: n,
                actual: var.column.len(),
            });
        }
    }

    if n == 0 || variables.is_empty() {
        return Ok(RakeResult::new(weights, 0, true, 0.0));
    }
    if weights.iter().sum::<f64>() <= 0.0 {
        return Err(WeightingError::InvalidBaseWeights {
            reason: "total base weight is zero".to_owned(),
        });
    }

    let prepared: Vec<PreparedVariable<'_>> = variables
        .iter()
        .map(|v| prepare(v, opts.missing_category))
        .collect();

    let mut converged = false;
    let mut iterations = 0;
    let mut last_delta = None;

    for pass in 1..=opts.max_iterations {
        iterations = pass;

        for var in &prepared {
            rake_on_variable(&mut weights, var, opts, pass)?;
        }

        if let Some(eps) = opts.convergence_epsilon {
            let delta = max_marginal_delta(&weights, &prepared, opts.parallel, pass)?;
            debug!(pass, max_delta = delta, "raking pass complete");
            last_delta = Some(delta);
            if delta < eps {
                converged = true;
                break;
            }
        }
    }

    let max_delta = match last_delta {
        Some(delta) => delta,
        None => max_marginal_delta(&weights, &prepared, opts.parallel, iterations)?,
    };

    if converged {
        info!(iterations, max_delta, "raking converged");
    } else if let Some(eps) = opts.convergence_epsilon {
        warn!(
            iterations,
            max_delta,
            epsilon = eps,
            "raking stopped at iteration cap without converging"
        );
    } else {
        info!(iterations, max_delta, "raking finished fixed pass count");
    }

    Ok(RakeResult::new(weights, iterations, converged, max_delta))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
