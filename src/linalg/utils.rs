use crate::linalg::faer_ndarray::{FaerCholesky, FaerCholeskyFactor, FaerLinalgError};
use faer::Side;
use ndarray::Array2;

const MAX_FACTORIZATION_ATTEMPTS: usize = 8;
const RIDGE_GROWTH: f64 = 10.0;

pub(crate) fn max_abs_diag(matrix: &Array2<f64>) -> f64 {
    matrix
        .diag()
        .iter()
        .copied()
        .map(f64::abs)
        .fold(0.0, f64::max)
        .max(1.0)
}

pub(crate) fn add_ridge(matrix: &Array2<f64>, ridge: f64) -> Array2<f64> {
    let mut regularized = matrix.clone();
    if ridge > 0.0 {
        for i in 0..regularized.nrows() {
            regularized[[i, i]] += ridge;
        }
    }
    regularized
}

/// Average the matrix with its transpose in place.
pub(crate) fn symmetrize(matrix: &mut Array2<f64>) {
    let n = matrix.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (matrix[[i, j]] + matrix[[j, i]]);
            matrix[[i, j]] = avg;
            matrix[[j, i]] = avg;
        }
    }
}

/// Escalating diagonal ridge used when a nominally SPD matrix fails to factor.
#[derive(Clone, Debug)]
pub(crate) struct RidgePlanner {
    ridge: f64,
    attempts: usize,
}

impl RidgePlanner {
    pub(crate) fn new(matrix: &Array2<f64>) -> Self {
        Self {
            ridge: max_abs_diag(matrix) * 1e-10,
            attempts: 0,
        }
    }

    pub(crate) fn ridge(&self) -> f64 {
        self.ridge
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts
    }

    pub(crate) fn bump(&mut self) {
        self.attempts += 1;
        self.ridge *= RIDGE_GROWTH;
    }
}

/// Cholesky factorization that retries with a growing diagonal jitter.
///
/// Returns the factor together with the ridge actually added (0 when the
/// matrix factored as given).
pub(crate) fn cholesky_with_jitter(
    matrix: &Array2<f64>,
    label: &str,
) -> Result<(FaerCholeskyFactor, f64), FaerLinalgError> {
    if let Ok(factor) = matrix.cholesky(Side::Lower) {
        return Ok((factor, 0.0));
    }
    let mut planner = RidgePlanner::new(matrix);
    loop {
        let ridge = planner.ridge();
        match add_ridge(matrix, ridge).cholesky(Side::Lower) {
            Ok(factor) => {
                log::debug!("{} stabilized with ridge {:.1e}.", label, ridge);
                return Ok((factor, ridge));
            }
            Err(err) if planner.attempts() + 1 >= MAX_FACTORIZATION_ATTEMPTS => {
                log::warn!(
                    "Failed to factorize {} after ridge {:.3e}: {}",
                    label,
                    ridge,
                    err
                );
                return Err(err);
            }
            Err(_) => planner.bump(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn jitter_rescues_singular_gram_matrix() {
        // rank-one PSD matrix: plain Cholesky rejects it
        let a = array![[1.0, 1.0], [1.0, 1.0]];
        let (factor, ridge) = cholesky_with_jitter(&a, "rank-one test").expect("jitter");
        assert!(ridge > 0.0);
        assert!(factor.diag().iter().all(|d| d.is_finite() && *d > 0.0));
    }

    #[test]
    fn well_conditioned_matrix_needs_no_ridge() {
        let a = array![[2.0, 0.5], [0.5, 1.0]];
        let (_, ridge) = cholesky_with_jitter(&a, "spd test").expect("spd");
        assert_eq!(ridge, 0.0);
    }

    #[test]
    fn symmetrize_averages_off_diagonal() {
        let mut a = array![[1.0, 2.0], [4.0, 1.0]];
        symmetrize(&mut a);
        assert_eq!(a[[0, 1]], 3.0);
        assert_eq!(a[[1, 0]], 3.0);
    }
}
