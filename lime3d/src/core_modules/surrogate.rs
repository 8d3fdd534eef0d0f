// THEORY:
// The surrogate is a weighted linear model fitted locally around the
// explained video:
//
//     output[target_class] ≈ intercept + Σ_r coef_r · blacked_out_r
//
// with each sample weighted by its locality kernel. The fit is a pure
// function of the dataset; no model object outlives the call.
//
// Solving: the weighted means of the features and the target are removed
// first so the intercept drops out, then the normal equations
// (XᵀWX + λI)·β = XᵀWy are solved through a Cholesky factorization. The tiny
// ridge λ keeps the system positive definite when the design is rank
// deficient (fewer samples than regions, a region that is never or always
// blacked out); those coefficients then settle at the minimum-norm answer.
//
// Sign: a coefficient on the blackout indicator says how much the output
// moves when a region is REMOVED. A region that supports the prediction gets a
// negative coefficient. Importance is the effect of KEEPING a region, so the
// coefficients are negated before min-max scaling to [0, 1].
//
// Degenerate fits (all coefficients equal, or anything non-finite) cannot be
// min-max scaled. They fall back to a uniform zero vector and are flagged,
// never turned into an error and never allowed to leak a NaN.

use crate::core_modules::dataset::Dataset;
use crate::core_modules::oracle::OutputVector;
use crate::error::{LimeError, Result};
use ndarray::{Array1, Array2, Axis};
use serde::Serialize;
use tracing::{debug, warn};

/// Coefficient ranges at or below this are treated as flat.
pub const DEGENERATE_RANGE: f64 = 1e-12;

const RIDGE_SCALE: f64 = 1e-8;

/// Per-region importance in `[0, 1]`, indexed by region ID.
pub type ImportanceVector = Vec<f64>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurrogateFit {
    /// Output component the surrogate was regressed on.
    pub target_class: usize,
    /// Raw coefficients on the blackout indicators.
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    pub importance: ImportanceVector,
    /// `true` when the uniform fallback replaced the normalized coefficients.
    pub degenerate: bool,
}

/// Picks the regressed output component: the requested one, or the baseline's argmax.
pub fn select_target_class(baseline: &OutputVector, requested: Option<usize>) -> Result<usize> {
    match requested {
        Some(class) if class < baseline.len() => Ok(class),
        Some(class) => Err(LimeError::validation(format!(
            "target_class {class} is out of range for a model output of length {}",
            baseline.len()
        ))),
        None => baseline
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, f64)>, (index, &value)| match best {
                Some((_, top)) if top >= value => best,
                _ => Some((index, value)),
            })
            .map(|(index, _)| index)
            .ok_or_else(|| LimeError::validation("baseline output is empty")),
    }
}

/// Weighted least squares with intercept.
///
/// Returns `(coefficients, intercept)`, or `None` when the weights carry no
/// mass or the normal equations cannot be factorized.
pub fn weighted_least_squares(
    features: &Array2<f64>,
    targets: &Array1<f64>,
    weights: &Array1<f64>,
) -> Option<(Array1<f64>, f64)> {
    let total_weight = weights.sum();
    if !(total_weight.is_finite() && total_weight > 0.0) {
        return None;
    }

    let weighted = features * &weights.view().insert_axis(Axis(1));
    let feature_means = weighted.sum_axis(Axis(0)) / total_weight;
    let target_mean = targets.dot(weights) / total_weight;

    let centered = features - &feature_means.view().insert_axis(Axis(0));
    let centered_targets = targets - target_mean;

    // Constant target: every coefficient is exactly zero.
    if centered_targets.iter().all(|&value| value == 0.0) {
        return Some((Array1::zeros(features.ncols()), target_mean));
    }

    let weighted_centered = &centered * &weights.view().insert_axis(Axis(1));
    let mut gram = weighted_centered.t().dot(&centered);
    let rhs = weighted_centered.t().dot(&centered_targets);

    let regions = gram.nrows().max(1) as f64;
    let ridge = RIDGE_SCALE * (gram.diag().sum() / regions).max(1.0);
    gram.diag_mut().mapv_inplace(|value| value + ridge);

    let coefficients = cholesky_solve(&gram, &rhs)?;
    let intercept = target_mean - feature_means.dot(&coefficients);
    Some((coefficients, intercept))
}

/// Solves `a · x = b` for a symmetric positive definite `a`.
fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    let mut lower = Array2::<f64>::zeros((n, n));

    for i in 0..n {
        for j in 0..=i {
            let mut sum = 0.0;
            for k in 0..j {
                sum += lower[[i, k]] * lower[[j, k]];
            }
            if i == j {
                let diag = a[[j, j]] - sum;
                if !(diag > 0.0) {
                    return None;
                }
                lower[[j, j]] = diag.sqrt();
            } else {
                lower[[i, j]] = (a[[i, j]] - sum) / lower[[j, j]];
            }
        }
    }

    // L · y = b
    let mut y = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = 0.0;
        for j in 0..i {
            sum += lower[[i, j]] * y[j];
        }
        y[i] = (b[i] - sum) / lower[[i, i]];
    }

    // Lᵀ · x = y
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = 0.0;
        for j in (i + 1)..n {
            sum += lower[[j, i]] * x[j];
        }
        x[i] = (y[i] - sum) / lower[[i, i]];
    }

    Some(x)
}

/// Min-max scales `values` to `[0, 1]`, or `None` when that is undefined.
pub fn normalize(values: &[f64]) -> Option<ImportanceVector> {
    if values.is_empty() || values.iter().any(|value| !value.is_finite()) {
        return None;
    }
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    if range <= DEGENERATE_RANGE {
        return None;
    }
    Some(values.iter().map(|&value| (value - min) / range).collect())
}

/// Fits the surrogate and turns its coefficients into region importance.
pub fn fit(dataset: &Dataset, target_class: Option<usize>) -> Result<SurrogateFit> {
    if dataset.is_empty() {
        return Err(LimeError::validation("cannot fit a surrogate on zero samples"));
    }
    dataset.validate()?;
    let target_class = select_target_class(&dataset.baseline, target_class)?;
    let regions = dataset.region_count();

    let features = Array2::from_shape_fn((dataset.len(), regions), |(row, col)| {
        if dataset.activations[row].is_blacked_out(col) {
            1.0
        } else {
            0.0
        }
    });
    let targets = Array1::from_iter(dataset.outputs.iter().map(|output| output[target_class]));
    let weights = Array1::from_vec(dataset.weights.clone());

    let solution = weighted_least_squares(&features, &targets, &weights);
    let (coefficients, intercept) = match solution {
        Some((coefficients, intercept)) => (coefficients.to_vec(), intercept),
        None => (vec![0.0; regions], targets.mean().unwrap_or(0.0)),
    };

    let keep_effect: Vec<f64> = coefficients.iter().map(|&value| -value).collect();
    let (importance, degenerate) = match normalize(&keep_effect) {
        Some(importance) => (importance, false),
        None => {
            warn!(
                regions,
                samples = dataset.len(),
                "surrogate fit is degenerate, using uniform zero importance"
            );
            (vec![0.0; regions], true)
        }
    };
    debug!(target_class, intercept, degenerate, "surrogate fitted");

    Ok(SurrogateFit {
        target_class,
        coefficients,
        intercept,
        importance,
        degenerate,
    })
}
