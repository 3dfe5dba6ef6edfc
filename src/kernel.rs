use crate::types::KernelKind;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Squared scaled distance `r² = Σ_j (a_j - b_j)² / ℓ_j²`.
#[inline]
pub(crate) fn scaled_sq_dist(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>, lengths: &Array1<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .zip(lengths.iter())
        .map(|((x, y), l)| {
            let d = (x - y) / l;
            d * d
        })
        .sum()
}

/// Unit-variance kernel value as a function of `r²`.
#[inline]
pub(crate) fn profile(kind: KernelKind, r2: f64) -> f64 {
    match kind {
        KernelKind::Rbf => (-0.5 * r2).exp(),
        KernelKind::RationalQuadratic { power } => (1.0 + r2 / (2.0 * power)).powf(-power),
        KernelKind::Exponential => (-r2.sqrt()).exp(),
    }
}

/// `d profile / d r²`. Zero at coincident points for the exponential kernel,
/// where every `∂r²/∂ℓ_j` vanishes as well.
#[inline]
pub(crate) fn profile_dr2(kind: KernelKind, r2: f64) -> f64 {
    match kind {
        KernelKind::Rbf => -0.5 * (-0.5 * r2).exp(),
        KernelKind::RationalQuadratic { power } => {
            -0.5 * (1.0 + r2 / (2.0 * power)).powf(-power - 1.0)
        }
        KernelKind::Exponential => {
            if r2 <= f64::MIN_POSITIVE {
                0.0
            } else {
                let r = r2.sqrt();
                -(-r).exp() / (2.0 * r)
            }
        }
    }
}

/// Cross-covariance `variance · profile(r²(a_i, b_j))`, shape (|a|, |b|).
pub(crate) fn cross_covariance(
    kind: KernelKind,
    a: ArrayView2<'_, f64>,
    b: ArrayView2<'_, f64>,
    variance: f64,
    lengths: &Array1<f64>,
) -> Array2<f64> {
    Array2::from_shape_fn((a.nrows(), b.nrows()), |(i, j)| {
        variance * profile(kind, scaled_sq_dist(a.row(i), b.row(j), lengths))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn derivative_matches_finite_difference() {
        let kinds = [
            KernelKind::Rbf,
            KernelKind::RationalQuadratic { power: 1.0 },
            KernelKind::RationalQuadratic { power: 2.5 },
            KernelKind::Exponential,
        ];
        let h = 1e-7;
        for kind in kinds {
            for r2 in [0.01, 0.5, 2.0, 7.0] {
                let fd = (profile(kind, r2 + h) - profile(kind, r2 - h)) / (2.0 * h);
                assert_abs_diff_eq!(profile_dr2(kind, r2), fd, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn all_profiles_are_one_at_zero_distance() {
        for kind in [
            KernelKind::Rbf,
            KernelKind::RationalQuadratic { power: 1.0 },
            KernelKind::Exponential,
        ] {
            assert_eq!(profile(kind, 0.0), 1.0);
        }
    }
}
