//! Radial test functions `f(x) = g(‖x‖)` evaluated on normalized inputs.
//!
//! A radial function has no linear active subspace (its gradient covariance
//! is isotropic), which makes it the standard example where the nonlinear
//! variant pays off.

use crate::estimate::ReductionError;
use crate::normalizer::Normalizer;
use ndarray::{Array1, Array2, ArrayView2};

pub fn paraboloid(r: f64) -> f64 {
    r * r
}

pub fn dparaboloid(r: f64) -> f64 {
    2.0 * r
}

/// `profile(‖x_phys‖)` for each row of the normalized inputs.
pub fn radial<F>(
    profile: F,
    inputs: ArrayView2<'_, f64>,
    normalizer: &Normalizer,
) -> Result<Array1<f64>, ReductionError>
where
    F: Fn(f64) -> f64,
{
    let physical = normalizer.denormalize(inputs)?;
    Ok(physical
        .rows()
        .into_iter()
        .map(|row| profile(row.dot(&row).sqrt()))
        .collect())
}

/// Gradient of [`radial`] with respect to the normalized coordinates:
/// `dprofile(r) · x_phys / r`, scaled by the normalizer's half widths.
/// The gradient at the origin is taken to be zero.
pub fn radial_gradient<F>(
    dprofile: F,
    inputs: ArrayView2<'_, f64>,
    normalizer: &Normalizer,
) -> Result<Array2<f64>, ReductionError>
where
    F: Fn(f64) -> f64,
{
    let physical = normalizer.denormalize(inputs)?;
    let scale = normalizer.gradient_scale();
    let mut grads = Array2::<f64>::zeros(physical.raw_dim());
    for (row, mut grad) in physical.rows().into_iter().zip(grads.rows_mut()) {
        let r = row.dot(&row).sqrt();
        if r <= f64::EPSILON {
            continue;
        }
        let outer = dprofile(r) / r;
        grad.assign(&(&row * outer * &scale));
    }
    Ok(grads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn paraboloid_gradient_matches_finite_differences() {
        let normalizer =
            Normalizer::new(array![-2.0, 0.0, -1.0], array![2.0, 3.0, 1.0]).expect("bounds");
        let x = array![[0.2, -0.4, 0.7]];
        let grad = radial_gradient(dparaboloid, x.view(), &normalizer).expect("in range");
        let h = 1e-6;
        for j in 0..3 {
            let mut xp = x.clone();
            let mut xm = x.clone();
            xp[[0, j]] += h;
            xm[[0, j]] -= h;
            let fp = radial(paraboloid, xp.view(), &normalizer).expect("in range")[0];
            let fm = radial(paraboloid, xm.view(), &normalizer).expect("in range")[0];
            assert_abs_diff_eq!(grad[[0, j]], (fp - fm) / (2.0 * h), epsilon = 1e-6);
        }
    }

    #[test]
    fn gradient_vanishes_at_origin() {
        let normalizer = Normalizer::symmetric_unit(2).expect("bounds");
        let g = radial_gradient(dparaboloid, array![[0.0, 0.0]].view(), &normalizer)
            .expect("in range");
        assert_eq!(g.row(0).to_vec(), vec![0.0, 0.0]);
    }
}
