use crate::estimate::ReductionError;
use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};

/// Relative slack tolerated at the domain boundary before a sample is rejected.
const BOUNDARY_REL_TOL: f64 = 1e-12;

/// Affine map between a physical box `[lower, upper]` and `[-1, 1]^m`.
///
/// Out-of-range samples are rejected with [`ReductionError::DomainError`]
/// instead of being extrapolated.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalizer {
    lower: Array1<f64>,
    upper: Array1<f64>,
}

impl Normalizer {
    pub fn new(lower: Array1<f64>, upper: Array1<f64>) -> Result<Self, ReductionError> {
        if lower.is_empty() || lower.len() != upper.len() {
            return Err(ReductionError::InvalidInput(format!(
                "bounds must be non-empty and of equal length (lower {}, upper {})",
                lower.len(),
                upper.len()
            )));
        }
        for (i, (&lo, &hi)) in lower.iter().zip(upper.iter()).enumerate() {
            if !(lo.is_finite() && hi.is_finite() && lo < hi) {
                return Err(ReductionError::InvalidInput(format!(
                    "bound {i} must satisfy finite lower < upper, got [{lo}, {hi}]"
                )));
            }
        }
        Ok(Self { lower, upper })
    }

    /// The box `[-1, 1]^dim`, for which normalization is the identity.
    pub fn symmetric_unit(dim: usize) -> Result<Self, ReductionError> {
        Self::new(Array1::from_elem(dim, -1.0), Array1::ones(dim))
    }

    pub fn dim(&self) -> usize {
        self.lower.len()
    }

    pub fn lower(&self) -> &Array1<f64> {
        &self.lower
    }

    pub fn upper(&self) -> &Array1<f64> {
        &self.upper
    }

    /// `(upper - lower) / 2`: multiplies a physical-space gradient to give the
    /// gradient with respect to normalized coordinates.
    pub fn gradient_scale(&self) -> Array1<f64> {
        (&self.upper - &self.lower) * 0.5
    }

    /// Rows of `x` mapped from `[lower, upper]` to `[-1, 1]`.
    pub fn normalize(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>, ReductionError> {
        self.check_columns(x)?;
        check_within(x, |j| (self.lower[j], self.upper[j]))?;
        let mut out = x.to_owned();
        for (j, mut col) in out.axis_iter_mut(Axis(1)).enumerate() {
            let (lo, hi) = (self.lower[j], self.upper[j]);
            col.mapv_inplace(|v| (2.0 * (v - lo) / (hi - lo) - 1.0).clamp(-1.0, 1.0));
        }
        Ok(out)
    }

    /// Exact inverse of [`Normalizer::normalize`].
    pub fn denormalize(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>, ReductionError> {
        self.check_columns(x)?;
        check_within(x, |_| (-1.0, 1.0))?;
        let mut out = x.to_owned();
        for (j, mut col) in out.axis_iter_mut(Axis(1)).enumerate() {
            let (lo, hi) = (self.lower[j], self.upper[j]);
            col.mapv_inplace(|v| lo + 0.5 * (v.clamp(-1.0, 1.0) + 1.0) * (hi - lo));
        }
        Ok(out)
    }

    fn check_columns(&self, x: ArrayView2<'_, f64>) -> Result<(), ReductionError> {
        if x.ncols() != self.dim() {
            return Err(ReductionError::InvalidInput(format!(
                "expected {} columns, got {}",
                self.dim(),
                x.ncols()
            )));
        }
        Ok(())
    }
}

fn check_within<B>(x: ArrayView2<'_, f64>, bounds: B) -> Result<(), ReductionError>
where
    B: Fn(usize) -> (f64, f64),
{
    let mut violation: Option<ReductionError> = None;
    Zip::indexed(x).for_each(|(row, col), &value| {
        if violation.is_some() {
            return;
        }
        let (lower, upper) = bounds(col);
        let slack = BOUNDARY_REL_TOL * (upper - lower).abs().max(lower.abs()).max(upper.abs());
        if !value.is_finite() || value < lower - slack || value > upper + slack {
            violation = Some(ReductionError::DomainError {
                row,
                col,
                value,
                lower,
                upper,
            });
        }
    });
    violation.map_or(Ok(()), Err)
}
