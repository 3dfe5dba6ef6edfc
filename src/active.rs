//! Linear active subspaces from gradient samples.
//!
//! Given gradients `g_i = ∇f(x_i)` and weights `w_i` (uniform `1/M` unless
//! supplied), the gradient covariance
//!
//! ```text
//! C = Σ_i w_i g_i g_iᵀ
//! ```
//!
//! is symmetric PSD. Its leading eigenvectors span the directions along which
//! `f` varies most on average; the partition `[W1 | W2]` splits them into the
//! active block (first `k` columns) and the inactive block.

use crate::estimate::ReductionError;
use crate::linalg::faer_ndarray::{FaerEigh, FaerSvd, fast_ab, fast_ata, sort_eigenpairs_descending};
use crate::linalg::utils::{cholesky_with_jitter, symmetrize};
use crate::types::ComputeMethod;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use rayon::prelude::*;

#[derive(Debug, Clone)]
struct Partition {
    dim: usize,
    active: Array2<f64>,
    inactive: Array2<f64>,
}

/// Gradient-covariance estimator with cached eigenpairs and partition.
#[derive(Debug, Clone, Default)]
pub struct ActiveSubspaces {
    method: ComputeMethod,
    eigenvalues: Option<Array1<f64>>,
    eigenvectors: Option<Array2<f64>>,
    covariance: Option<Array2<f64>>,
    partition: Option<Partition>,
}

/// Bootstrap spread of the eigen-decomposition.
#[derive(Debug, Clone)]
pub struct BootstrapSummary {
    /// `(m, 2)`: min and max of each eigenvalue across replicates.
    pub eigenvalue_bounds: Array2<f64>,
    /// `(m - 1, 3)`: min, mean and max of `‖W1ᵀ W2_boot‖₂` for `k = 1..m-1`.
    pub subspace_distances: Array2<f64>,
}

impl ActiveSubspaces {
    pub fn new(method: ComputeMethod) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn method(&self) -> ComputeMethod {
        self.method
    }

    /// Build and decompose the gradient covariance. Clears any earlier partition.
    pub fn compute(
        &mut self,
        gradients: ArrayView2<'_, f64>,
        weights: Option<ArrayView1<'_, f64>>,
    ) -> Result<(), ReductionError> {
        let weights = resolve_weights(gradients.nrows(), weights)?;
        let (values, vectors, covariance) = decompose(gradients, &weights, self.method)?;
        log::debug!(
            "active subspace: {} eigenpairs, leading eigenvalues {:?}",
            values.len(),
            values.iter().take(4).collect::<Vec<_>>()
        );
        self.eigenvalues = Some(values);
        self.eigenvectors = Some(vectors);
        self.covariance = covariance;
        self.partition = None;
        Ok(())
    }

    /// Split the eigenvectors into `W1` (first `dim` columns) and `W2`.
    pub fn partition(&mut self, dim: usize) -> Result<(), ReductionError> {
        let vectors = self
            .eigenvectors
            .as_ref()
            .ok_or(ReductionError::NotComputed("partition"))?;
        let ambient = vectors.nrows();
        if dim < 1 || dim >= ambient {
            return Err(ReductionError::InvalidDimension {
                requested: dim,
                ambient,
            });
        }
        self.partition = Some(Partition {
            dim,
            active: vectors.slice(s![.., ..dim]).to_owned(),
            inactive: vectors.slice(s![.., dim..]).to_owned(),
        });
        Ok(())
    }

    pub fn eigenvalues(&self) -> Option<&Array1<f64>> {
        self.eigenvalues.as_ref()
    }

    pub fn eigenvectors(&self) -> Option<&Array2<f64>> {
        self.eigenvectors.as_ref()
    }

    /// The covariance matrix itself; only formed by [`ComputeMethod::Exact`].
    pub fn covariance(&self) -> Option<&Array2<f64>> {
        self.covariance.as_ref()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.partition.as_ref().map(|p| p.dim)
    }

    pub fn active_basis(&self) -> Option<&Array2<f64>> {
        self.partition.as_ref().map(|p| &p.active)
    }

    pub fn inactive_basis(&self) -> Option<&Array2<f64>> {
        self.partition.as_ref().map(|p| &p.inactive)
    }

    /// Active and inactive coordinates `(X W1, X W2)`.
    pub fn transform(
        &self,
        inputs: ArrayView2<'_, f64>,
    ) -> Result<(Array2<f64>, Array2<f64>), ReductionError> {
        let partition = self.require_partition("transform")?;
        check_ambient(inputs.ncols(), partition.active.nrows())?;
        Ok((
            fast_ab(&inputs, &partition.active),
            fast_ab(&inputs, &partition.inactive),
        ))
    }

    /// Active coordinates only.
    pub fn project(&self, inputs: ArrayView2<'_, f64>) -> Result<Array2<f64>, ReductionError> {
        let partition = self.require_partition("project")?;
        check_ambient(inputs.ncols(), partition.active.nrows())?;
        Ok(fast_ab(&inputs, &partition.active))
    }

    /// Per-coordinate activity `a_j = Σ_{i<k} λ_i W1[j, i]²`.
    pub fn activity_scores(&self) -> Result<Array1<f64>, ReductionError> {
        let partition = self.require_partition("activity scores")?;
        let values = self
            .eigenvalues
            .as_ref()
            .ok_or(ReductionError::NotComputed("activity scores"))?;
        let lambdas = values.slice(s![..partition.dim]);
        Ok(partition.active.mapv(|w| w * w).dot(&lambdas))
    }

    /// Smallest `k` whose leading eigenvalues carry at least `energy` of the
    /// total, clamped to the valid partition range `1..m`.
    pub fn suggest_dimension(&self, energy: f64) -> Result<usize, ReductionError> {
        if !(energy > 0.0 && energy <= 1.0) {
            return Err(ReductionError::InvalidInput(format!(
                "energy fraction must lie in (0, 1], got {energy}"
            )));
        }
        let values = self
            .eigenvalues
            .as_ref()
            .ok_or(ReductionError::NotComputed("dimension suggestion"))?;
        let ambient = values.len();
        if ambient < 2 {
            return Err(ReductionError::InvalidDimension {
                requested: 1,
                ambient,
            });
        }
        let total: f64 = values.sum();
        if total <= 0.0 {
            return Ok(1);
        }
        let mut cumulative = 0.0;
        for (i, v) in values.iter().enumerate() {
            cumulative += v;
            if cumulative / total >= energy {
                return Ok((i + 1).clamp(1, ambient - 1));
            }
        }
        Ok(ambient - 1)
    }

    /// Bootstrap the decomposition by resampling gradient rows with
    /// replacement. Replicate `b` uses `StdRng::seed_from_u64(seed + b)`, so the
    /// summary is reproducible regardless of how rayon schedules replicates.
    pub fn bootstrap(
        &self,
        gradients: ArrayView2<'_, f64>,
        weights: Option<ArrayView1<'_, f64>>,
        n_boot: usize,
        seed: u64,
    ) -> Result<BootstrapSummary, ReductionError> {
        let vectors = self
            .eigenvectors
            .as_ref()
            .ok_or(ReductionError::NotComputed("bootstrap"))?;
        if n_boot == 0 {
            return Err(ReductionError::InvalidInput(
                "bootstrap needs at least one replicate".to_string(),
            ));
        }
        let n = gradients.nrows();
        let ambient = vectors.nrows();
        check_ambient(gradients.ncols(), ambient)?;
        let weights = resolve_weights(n, weights)?;
        let method = self.method;

        let replicates: Vec<(Array1<f64>, Vec<f64>)> = (0..n_boot)
            .into_par_iter()
            .map(|b| {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(b as u64));
                let rows: Vec<usize> = (0..n).map(|_| rng.random_range(0..n)).collect();
                let g_b = gradients.select(Axis(0), &rows);
                let mut w_b = weights.select(Axis(0), &rows);
                let total = w_b.sum();
                if total <= 0.0 {
                    return Err(ReductionError::InvalidInput(format!(
                        "bootstrap replicate {b} drew only zero-weight samples"
                    )));
                }
                w_b /= total;
                let (values_b, vectors_b, _) = decompose(g_b.view(), &w_b, method)?;
                let mut distances = Vec::with_capacity(ambient.saturating_sub(1));
                for k in 1..ambient {
                    let cross = vectors
                        .slice(s![.., ..k])
                        .t()
                        .dot(&vectors_b.slice(s![.., k..]));
                    distances.push(cross.spectral_norm()?);
                }
                Ok((values_b, distances))
            })
            .collect::<Result<_, ReductionError>>()?;

        let mut eigenvalue_bounds = Array2::<f64>::zeros((ambient, 2));
        for i in 0..ambient {
            let (lo, hi) = replicates
                .iter()
                .map(|(values, _)| values[i])
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                    (lo.min(v), hi.max(v))
                });
            eigenvalue_bounds[[i, 0]] = lo;
            eigenvalue_bounds[[i, 1]] = hi;
        }
        let mut subspace_distances = Array2::<f64>::zeros((ambient.saturating_sub(1), 3));
        for k in 0..ambient.saturating_sub(1) {
            let column: Vec<f64> = replicates.iter().map(|(_, d)| d[k]).collect();
            subspace_distances[[k, 0]] = column.iter().copied().fold(f64::INFINITY, f64::min);
            subspace_distances[[k, 1]] = column.iter().sum::<f64>() / column.len() as f64;
            subspace_distances[[k, 2]] = column.iter().copied().fold(0.0, f64::max);
        }
        Ok(BootstrapSummary {
            eigenvalue_bounds,
            subspace_distances,
        })
    }

    fn require_partition(&self, what: &'static str) -> Result<&Partition, ReductionError> {
        self.partition
            .as_ref()
            .ok_or(ReductionError::NotComputed(what))
    }
}

fn check_ambient(got: usize, expected: usize) -> Result<(), ReductionError> {
    if got != expected {
        return Err(ReductionError::InvalidInput(format!(
            "expected {expected} input columns, got {got}"
        )));
    }
    Ok(())
}

/// Validate caller weights or produce uniform `1/M` weights.
pub(crate) fn resolve_weights(
    n: usize,
    weights: Option<ArrayView1<'_, f64>>,
) -> Result<Array1<f64>, ReductionError> {
    if n == 0 {
        return Err(ReductionError::InvalidInput(
            "at least one sample is required".to_string(),
        ));
    }
    match weights {
        None => Ok(Array1::from_elem(n, 1.0 / n as f64)),
        Some(w) => {
            if w.len() != n {
                return Err(ReductionError::InvalidInput(format!(
                    "weights length {} does not match {} samples",
                    w.len(),
                    n
                )));
            }
            if w.iter().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(ReductionError::InvalidInput(
                    "weights must be finite and non-negative".to_string(),
                ));
            }
            Ok(w.to_owned())
        }
    }
}

/// `C = Σ_i w_i g_i g_iᵀ`, computed as the Gram matrix of `√w_i g_i`.
pub fn gradient_covariance(
    gradients: ArrayView2<'_, f64>,
    weights: Option<ArrayView1<'_, f64>>,
) -> Result<Array2<f64>, ReductionError> {
    let weights = resolve_weights(gradients.nrows(), weights)?;
    let mut cov = fast_ata(&weighted_rows(gradients, &weights)?);
    symmetrize(&mut cov);
    Ok(cov)
}

fn weighted_rows(
    gradients: ArrayView2<'_, f64>,
    weights: &Array1<f64>,
) -> Result<Array2<f64>, ReductionError> {
    if gradients.iter().any(|v| !v.is_finite()) {
        return Err(ReductionError::InvalidInput(
            "gradients contain non-finite values".to_string(),
        ));
    }
    let sqrt_w = weights.mapv(f64::sqrt).insert_axis(Axis(1));
    Ok(&gradients * &sqrt_w)
}

fn decompose(
    gradients: ArrayView2<'_, f64>,
    weights: &Array1<f64>,
    method: ComputeMethod,
) -> Result<(Array1<f64>, Array2<f64>, Option<Array2<f64>>), ReductionError> {
    let ambient = gradients.ncols();
    if ambient == 0 {
        return Err(ReductionError::InvalidInput(
            "gradients have zero columns".to_string(),
        ));
    }
    let scaled = weighted_rows(gradients, weights)?;
    let (mut values, vectors, covariance) = match method {
        ComputeMethod::Exact => {
            let mut cov = fast_ata(&scaled);
            symmetrize(&mut cov);
            let (values, vectors) = cov.eigh_descending()?;
            (values, vectors, Some(cov))
        }
        ComputeMethod::LowRank => {
            let (singular, v) = scaled.svd_right(true)?;
            let v = v.ok_or(ReductionError::NotComputed("right singular vectors"))?;
            let mut values = Array1::<f64>::zeros(ambient);
            for (i, s) in singular.iter().enumerate() {
                values[i] = s * s;
            }
            let (values, vectors) = sort_eigenpairs_descending(values, v);
            (values, vectors, None)
        }
    };
    // round-off can leave tiny negative eigenvalues on a PSD matrix
    values.mapv_inplace(|v| v.max(0.0));
    Ok((values, vectors, covariance))
}

/// Gradient estimates from local linear fits, for data without gradients.
///
/// Every sample anchors a least-squares fit `f ≈ a + bᵀx` over its
/// `n_neighbors` nearest samples (itself included); `b` is the gradient
/// estimate. Defaults to `⌊1.7 m⌋` neighbours, at least `m + 1`. Returns the
/// gradients with uniform weights.
pub fn local_linear_gradients(
    inputs: ArrayView2<'_, f64>,
    outputs: ArrayView1<'_, f64>,
    n_neighbors: Option<usize>,
) -> Result<(Array2<f64>, Array1<f64>), ReductionError> {
    let (n, m) = inputs.dim();
    if outputs.len() != n {
        return Err(ReductionError::InvalidInput(format!(
            "outputs length {} does not match {} inputs",
            outputs.len(),
            n
        )));
    }
    let p = n_neighbors.unwrap_or(((1.7 * m as f64).floor() as usize).max(m + 1));
    if p < m + 1 || p > n {
        return Err(ReductionError::InvalidInput(format!(
            "local linear fits need between {} and {} neighbours, got {}",
            m + 1,
            n,
            p
        )));
    }

    let mut gradients = Array2::<f64>::zeros((n, m));
    for (anchor, mut grad) in gradients.rows_mut().into_iter().enumerate() {
        let x0 = inputs.row(anchor);
        let mut order: Vec<(f64, usize)> = inputs
            .rows()
            .into_iter()
            .enumerate()
            .map(|(i, row)| {
                let d = &row - &x0;
                (d.dot(&d), i)
            })
            .collect();
        order.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut design = Array2::<f64>::ones((p, m + 1));
        let mut rhs = Array1::<f64>::zeros(p);
        for (r, &(_, i)) in order.iter().take(p).enumerate() {
            design.slice_mut(s![r, 1..]).assign(&inputs.row(i));
            rhs[r] = outputs[i];
        }
        let normal = fast_ata(&design);
        let (factor, _) = cholesky_with_jitter(&normal, "local linear fit")?;
        let coef = factor.solve_vec(&design.t().dot(&rhs));
        grad.assign(&coef.slice(s![1..]));
    }
    Ok((gradients, Array1::from_elem(n, 1.0 / n as f64)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn ridge_gradients() -> Array2<f64> {
        // f(x) = sin(aᵀx) with a = (3, 1, 0): gradients all parallel to a
        let mut rng = StdRng::seed_from_u64(7);
        let a = array![3.0, 1.0, 0.0];
        let mut g = Array2::<f64>::zeros((60, 3));
        for mut row in g.rows_mut() {
            let x: Array1<f64> = (0..3).map(|_| rng.random_range(-1.0..1.0)).collect();
            row.assign(&(&a * a.dot(&x).cos()));
        }
        g
    }

    #[test]
    fn exact_and_low_rank_agree() {
        let g = ridge_gradients();
        let mut exact = ActiveSubspaces::new(ComputeMethod::Exact);
        exact.compute(g.view(), None).expect("exact");
        let mut low = ActiveSubspaces::new(ComputeMethod::LowRank);
        assert_eq!(low.method(), ComputeMethod::LowRank);
        low.compute(g.view(), None).expect("low rank");
        let (ev_e, ev_l) = (exact.eigenvalues().unwrap(), low.eigenvalues().unwrap());
        for i in 0..3 {
            assert_abs_diff_eq!(ev_e[i], ev_l[i], epsilon = 1e-9);
        }
        // leading direction is ±a/|a|, signs canonicalized identically
        let w_e = exact.eigenvectors().unwrap().column(0).to_owned();
        let w_l = low.eigenvectors().unwrap().column(0).to_owned();
        assert_abs_diff_eq!(w_e.dot(&w_l), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(w_e[0], 3.0 / 10f64.sqrt(), epsilon = 1e-9);
        assert!(low.covariance().is_none());
        assert!(exact.covariance().is_some());
    }

    #[test]
    fn covariance_is_symmetric_psd_with_orthonormal_partitions() {
        let mut rng = StdRng::seed_from_u64(11);
        // includes fewer samples than dimensions (rank-deficient C)
        for (samples, m) in [(40, 3), (25, 5), (4, 6), (60, 2), (12, 8)] {
            let df = Array2::from_shape_fn((samples, m), |_| rng.random_range(-2.0..2.0));
            let mut ss = ActiveSubspaces::new(ComputeMethod::Exact);
            ss.compute(df.view(), None).expect("decomposition");

            let cov = ss.covariance().expect("covariance");
            let scale = cov.diag().sum().max(1.0);
            for i in 0..m {
                for j in 0..m {
                    assert_abs_diff_eq!(cov[[i, j]], cov[[j, i]], epsilon = 1e-12 * scale);
                }
            }
            let (raw, _) = cov.eigh_descending().expect("eigh");
            assert!(
                raw.iter().all(|v| *v >= -1e-10 * scale),
                "negative eigenvalue in {raw:?}"
            );

            for k in 1..m {
                ss.partition(k).expect("partition");
                let w1 = ss.active_basis().expect("W1");
                let w2 = ss.inactive_basis().expect("W2");
                let w = ndarray::concatenate![Axis(1), *w1, *w2];
                let gram = w.t().dot(&w);
                for i in 0..m {
                    for j in 0..m {
                        let expected = if i == j { 1.0 } else { 0.0 };
                        assert_abs_diff_eq!(gram[[i, j]], expected, epsilon = 1e-10);
                    }
                }
            }
        }
    }

    #[test]
    fn partition_requires_compute_and_valid_dimension() {
        let mut ss = ActiveSubspaces::new(ComputeMethod::Exact);
        assert!(matches!(ss.partition(1), Err(ReductionError::NotComputed(_))));
        ss.compute(ridge_gradients().view(), None).expect("compute");
        assert!(matches!(
            ss.partition(0),
            Err(ReductionError::InvalidDimension { requested: 0, ambient: 3 })
        ));
        assert!(matches!(
            ss.partition(3),
            Err(ReductionError::InvalidDimension { requested: 3, ambient: 3 })
        ));
        ss.partition(1).expect("valid");
        assert_eq!(ss.active_basis().unwrap().dim(), (3, 1));
        assert_eq!(ss.inactive_basis().unwrap().dim(), (3, 2));
    }

    #[test]
    fn weights_scale_the_covariance() {
        let g = array![[1.0, 0.0], [0.0, 2.0]];
        let cov = gradient_covariance(g.view(), Some(array![0.25, 0.75].view())).expect("cov");
        assert_abs_diff_eq!(cov[[0, 0]], 0.25, epsilon = 1e-15);
        assert_abs_diff_eq!(cov[[1, 1]], 3.0, epsilon = 1e-15);
        assert_abs_diff_eq!(cov[[0, 1]], 0.0, epsilon = 1e-15);
        assert!(gradient_covariance(g.view(), Some(array![1.0].view())).is_err());
        assert!(gradient_covariance(g.view(), Some(array![1.0, -1.0].view())).is_err());
    }

    #[test]
    fn activity_scores_sum_to_active_eigenvalues() {
        let mut ss = ActiveSubspaces::new(ComputeMethod::Exact);
        ss.compute(ridge_gradients().view(), None).expect("compute");
        ss.partition(2).expect("partition");
        let scores = ss.activity_scores().expect("scores");
        let ev = ss.eigenvalues().unwrap();
        assert_abs_diff_eq!(scores.sum(), ev[0] + ev[1], epsilon = 1e-10);
        assert_abs_diff_eq!(scores[2], 0.0, epsilon = 1e-10);
    }

    #[test]
    fn suggested_dimension_follows_energy() {
        let mut ss = ActiveSubspaces::new(ComputeMethod::Exact);
        ss.compute(ridge_gradients().view(), None).expect("compute");
        assert_eq!(ss.suggest_dimension(0.99).expect("suggest"), 1);
        assert!(ss.suggest_dimension(1.0).expect("suggest") <= 2);
        assert!(ss.suggest_dimension(0.0).is_err());
    }

    #[test]
    fn bootstrap_is_reproducible_and_brackets_eigenvalues() {
        let g = ridge_gradients();
        let mut ss = ActiveSubspaces::new(ComputeMethod::Exact);
        ss.compute(g.view(), None).expect("compute");
        let a = ss.bootstrap(g.view(), None, 20, 3).expect("bootstrap");
        let b = ss.bootstrap(g.view(), None, 20, 3).expect("bootstrap");
        assert_eq!(a.eigenvalue_bounds, b.eigenvalue_bounds);
        assert_eq!(a.eigenvalue_bounds.dim(), (3, 2));
        assert_eq!(a.subspace_distances.dim(), (2, 3));
        for row in a.eigenvalue_bounds.rows() {
            assert!(row[0] >= 0.0 && row[0] <= row[1]);
        }
        // a rank-one covariance has a perfectly stable leading direction
        assert!(a.subspace_distances[[0, 2]] < 1e-6);
    }

    #[test]
    fn local_linear_gradients_recover_a_plane() {
        let mut rng = StdRng::seed_from_u64(11);
        let x = Array2::from_shape_fn((40, 3), |_| rng.random_range(-1.0..1.0));
        let slope = array![0.5, -2.0, 1.25];
        let f = x.dot(&slope) + 3.0;
        let (g, w) = local_linear_gradients(x.view(), f.view(), None).expect("fits");
        assert_eq!(g.dim(), (40, 3));
        assert_abs_diff_eq!(w.sum(), 1.0, epsilon = 1e-12);
        for row in g.rows() {
            for j in 0..3 {
                assert_abs_diff_eq!(row[j], slope[j], epsilon = 1e-6);
            }
        }
    }
}
