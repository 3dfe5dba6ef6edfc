use dyn_stack::{MemBuffer, MemStack};
use faer::diag::{Diag, DiagRef};
use faer::linalg::solvers::{self, Solve};
use faer::linalg::svd::{self, ComputeSvdVectors};
use faer::{Mat, MatMut, MatRef, Par, Side, get_global_parallelism};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("SVD failed to converge")]
    SvdNoConvergence,
    #[error("Self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
    #[error("Matrix contains non-finite entries")]
    NonFinite,
}

#[inline]
fn should_use_faer_matmul(m: usize, n: usize, k: usize) -> bool {
    // ndarray for tiny products, faer GEMM once the product is large enough
    // to amortize the view setup.
    const MIN_DIM: usize = 32;
    const MIN_FLOP_SCALE: usize = 64 * 64;
    (m >= MIN_DIM || n >= MIN_DIM || k >= MIN_DIM)
        && m.saturating_mul(n).saturating_mul(k) >= MIN_FLOP_SCALE
}

#[inline]
fn matmul_parallelism(dims: &[usize]) -> Par {
    if dims.iter().any(|&d| d < 128) {
        Par::Seq
    } else {
        get_global_parallelism()
    }
}

#[inline]
pub fn array2_to_mat_mut(array: &mut Array2<f64>) -> MatMut<'_, f64> {
    let (rows, cols) = array.dim();
    let strides = array.strides();
    let (s0, s1) = (strides[0], strides[1]);
    // SAFETY: dimensions and strides come straight from the live Array2 and the
    // returned view borrows it mutably for its whole lifetime.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), rows, cols, s0, s1) }
}

/// Compute Aᵀ A. For A of shape (n, p) the result is (p, p).
///
/// This is the Gram matrix behind every gradient covariance: with the rows of
/// A scaled by `sqrt(w_i)` it equals `Σ_i w_i a_i a_iᵀ`.
#[inline]
pub fn fast_ata<S: Data<Elem = f64>>(a: &ArrayBase<S, Ix2>) -> Array2<f64> {
    use faer::Accum;
    use faer::linalg::matmul::matmul;

    let (n, p) = a.dim();
    if !should_use_faer_matmul(p, p, n) {
        return a.t().dot(a);
    }

    let mut result = Mat::<f64>::zeros(p, p);
    let a_view = FaerArrayView::new(a);
    let a_ref = a_view.as_ref();
    matmul(
        result.as_mut(),
        Accum::Replace,
        a_ref.transpose(),
        a_ref,
        1.0,
        matmul_parallelism(&[n, p]),
    );
    mat_to_array(result.as_ref())
}

/// Compute A * B. For A of shape (n, p) and B of shape (p, q) the result is (n, q).
#[inline]
pub fn fast_ab<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    a: &ArrayBase<S1, Ix2>,
    b: &ArrayBase<S2, Ix2>,
) -> Array2<f64> {
    use faer::Accum;
    use faer::linalg::matmul::matmul;

    let (n, p) = a.dim();
    let (p_b, q) = b.dim();
    debug_assert_eq!(p, p_b, "A and B must have compatible inner dimensions");

    if !should_use_faer_matmul(n, q, p) {
        return a.dot(b);
    }

    let mut result = Mat::<f64>::zeros(n, q);
    let a_view = FaerArrayView::new(a);
    let b_view = FaerArrayView::new(b);
    matmul(
        result.as_mut(),
        Accum::Replace,
        a_view.as_ref(),
        b_view.as_ref(),
        1.0,
        matmul_parallelism(&[n, p, q]),
    );
    mat_to_array(result.as_ref())
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

/// Borrowed faer view over an ndarray matrix. Layouts with non-positive
/// strides are materialized into a compact owned copy first.
pub struct FaerArrayView<'a> {
    ptr: *const f64,
    rows: usize,
    cols: usize,
    row_stride: isize,
    col_stride: isize,
    owned: Option<Array2<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let strides = array.strides();
        if strides[0] <= 0 || strides[1] <= 0 {
            let owned = array.to_owned();
            let owned_strides = owned.strides();
            return Self {
                ptr: owned.as_ptr(),
                rows,
                cols,
                row_stride: owned_strides[0],
                col_stride: owned_strides[1],
                owned: Some(owned),
                _marker: PhantomData,
            };
        }

        Self {
            ptr: array.as_ptr(),
            rows,
            cols,
            row_stride: strides[0],
            col_stride: strides[1],
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, rows, cols, row_stride, col_stride) = match &self.owned {
            Some(owned) => {
                let strides = owned.strides();
                (
                    owned.as_ptr(),
                    owned.nrows(),
                    owned.ncols(),
                    strides[0],
                    strides[1],
                )
            }
            None => (
                self.ptr,
                self.rows,
                self.cols,
                self.row_stride,
                self.col_stride,
            ),
        };
        // SAFETY: pointer/shape/strides either come directly from a live ndarray
        // view with positive strides, or from the owned compact copy stored in
        // this wrapper, which outlives the returned view.
        unsafe { MatRef::from_raw_parts(ptr, rows, cols, row_stride, col_stride) }
    }
}

pub trait FaerEigh {
    /// Symmetric eigendecomposition, eigenvalues ascending (faer's order).
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError>;

    /// Symmetric eigendecomposition with eigenvalues sorted descending and each
    /// eigenvector's sign fixed so that its first nonzero entry is positive.
    fn eigh_descending(&self) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError> {
        let (values, vectors) = self.eigh(Side::Lower)?;
        Ok(sort_eigenpairs_descending(values, vectors))
    }
}

impl<S: Data<Elem = f64>> FaerEigh for ArrayBase<S, Ix2> {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError> {
        if self.iter().any(|v| !v.is_finite()) {
            return Err(FaerLinalgError::NonFinite);
        }
        let faer_view = FaerArrayView::new(self);
        let eigen = faer_view
            .as_ref()
            .self_adjoint_eigen(side)
            .map_err(FaerLinalgError::SelfAdjointEigen)?;
        let values = diag_to_array(eigen.S());
        let vectors = mat_to_array(eigen.U());
        Ok((values, vectors))
    }
}

/// Reorder eigenpairs by descending eigenvalue and canonicalize signs.
pub fn sort_eigenpairs_descending(
    values: Array1<f64>,
    vectors: Array2<f64>,
) -> (Array1<f64>, Array2<f64>) {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));

    let mut sorted_values = Array1::<f64>::zeros(n);
    let mut sorted_vectors = Array2::<f64>::zeros((vectors.nrows(), n));
    for (dst, &src) in order.iter().enumerate() {
        sorted_values[dst] = values[src];
        let column = vectors.column(src);
        let sign = column
            .iter()
            .find(|v| v.abs() > 1e-14)
            .map_or(1.0, |v| v.signum());
        sorted_vectors
            .column_mut(dst)
            .assign(&column.mapv(|v| sign * v));
    }
    (sorted_values, sorted_vectors)
}

pub trait FaerSvd {
    /// Singular values (descending) and, optionally, the full right singular
    /// vectors V (columns) of shape (cols, cols).
    fn svd_right(
        &self,
        compute_v: bool,
    ) -> Result<(Array1<f64>, Option<Array2<f64>>), FaerLinalgError>;

    /// Largest singular value.
    fn spectral_norm(&self) -> Result<f64, FaerLinalgError> {
        let (singular, _) = self.svd_right(false)?;
        Ok(singular.iter().copied().fold(0.0, f64::max))
    }
}

impl<S: Data<Elem = f64>> FaerSvd for ArrayBase<S, Ix2> {
    fn svd_right(
        &self,
        compute_v: bool,
    ) -> Result<(Array1<f64>, Option<Array2<f64>>), FaerLinalgError> {
        if self.iter().any(|v| !v.is_finite()) {
            return Err(FaerLinalgError::NonFinite);
        }
        let faer_view = FaerArrayView::new(self);
        let faer_mat = faer_view.as_ref();
        let (rows, cols) = faer_mat.shape();
        let v_flag = if compute_v {
            ComputeSvdVectors::Full
        } else {
            ComputeSvdVectors::No
        };

        let mut singular = Diag::<f64>::zeros(rows.min(cols));
        let mut v_storage = compute_v.then(|| Mat::<f64>::zeros(cols, cols));

        let par = get_global_parallelism();
        let mut mem = MemBuffer::new(svd::svd_scratch::<f64>(
            rows,
            cols,
            ComputeSvdVectors::No,
            v_flag,
            par,
            Default::default(),
        ));
        let stack = MemStack::new(&mut mem);
        svd::svd(
            faer_mat,
            singular.as_mut(),
            None,
            v_storage.as_mut().map(|mat| mat.as_mut()),
            par,
            stack,
            Default::default(),
        )
        .map_err(|_| FaerLinalgError::SvdNoConvergence)?;

        let singular_values = diag_to_array(singular.as_ref());
        let v = v_storage.map(|mat| mat_to_array(mat.as_ref()));
        Ok((singular_values, v))
    }
}

pub struct FaerCholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl FaerCholeskyFactor {
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let mut column = Array2::from_shape_fn((rhs.len(), 1), |(i, _)| rhs[i]);
        let mut column_view = array2_to_mat_mut(&mut column);
        self.factor.solve_in_place(column_view.as_mut());
        column.column(0).to_owned()
    }

    pub fn solve_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        let mut rhs = rhs.to_owned();
        let mut rhs_view = array2_to_mat_mut(&mut rhs);
        self.factor.solve_in_place(rhs_view.as_mut());
        rhs
    }

    /// Diagonal of the Cholesky factor L.
    pub fn diag(&self) -> Array1<f64> {
        diag_to_array(self.factor.L().diagonal())
    }

    /// log |A| = 2 Σ log L_ii.
    pub fn log_determinant(&self) -> f64 {
        2.0 * self.diag().iter().map(|d| d.ln()).sum::<f64>()
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        if self.iter().any(|v| !v.is_finite()) {
            return Err(FaerLinalgError::NonFinite);
        }
        let faer_view = FaerArrayView::new(self);
        let factor = faer_view
            .as_ref()
            .llt(side)
            .map_err(FaerLinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor { factor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn eigh_descending_orders_and_fixes_signs() {
        let a = array![[2.0, 1.0, 0.0], [1.0, 2.0, 0.0], [0.0, 0.0, 5.0]];
        let (values, vectors) = a.eigh_descending().expect("eigh should succeed");
        assert_abs_diff_eq!(values[0], 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(values[1], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(values[2], 1.0, epsilon = 1e-12);
        for j in 0..3 {
            let first = vectors.column(j).iter().copied().find(|v| v.abs() > 1e-14);
            assert!(first.is_some_and(|v| v > 0.0));
        }
        let reconstructed = vectors.dot(&Array2::from_diag(&values)).dot(&vectors.t());
        for (x, y) in reconstructed.iter().zip(a.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-10);
        }
    }

    #[test]
    fn svd_right_matches_gram_eigenvalues() {
        let a = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let (singular, v) = a.svd_right(true).expect("svd should succeed");
        let (values, _) = fast_ata(&a).eigh_descending().expect("eigh should succeed");
        for i in 0..2 {
            assert_abs_diff_eq!(singular[i] * singular[i], values[i], epsilon = 1e-9);
        }
        let v = v.expect("V requested");
        assert_eq!(v.dim(), (2, 2));
        let vtv = v.t().dot(&v);
        assert_abs_diff_eq!(vtv[[0, 1]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn cholesky_solves_and_reports_log_determinant() {
        let a = array![[4.0, 2.0], [2.0, 3.0]];
        let chol = a.cholesky(Side::Lower).expect("SPD matrix");
        let x = chol.solve_vec(&array![2.0, 1.0]);
        let back = a.dot(&x);
        assert_abs_diff_eq!(back[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(back[1], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(chol.log_determinant(), 8.0f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn non_finite_input_is_rejected() {
        let a = array![[1.0, f64::NAN], [f64::NAN, 2.0]];
        assert!(matches!(a.eigh(Side::Lower), Err(FaerLinalgError::NonFinite)));
    }
}
