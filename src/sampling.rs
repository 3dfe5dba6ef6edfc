use crate::estimate::ReductionError;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

/// `n` points drawn uniformly in the box `[lower, upper]`, column by column
/// from a single `StdRng` seeded with `seed`.
pub fn uniform_samples(
    lower: &Array1<f64>,
    upper: &Array1<f64>,
    n: usize,
    seed: u64,
) -> Result<Array2<f64>, ReductionError> {
    if lower.len() != upper.len() {
        return Err(ReductionError::InvalidInput(format!(
            "bounds length mismatch: {} vs {}",
            lower.len(),
            upper.len()
        )));
    }
    if let Some(i) = (0..lower.len()).find(|&i| !(lower[i] < upper[i])) {
        return Err(ReductionError::InvalidInput(format!(
            "bound {i} is empty: [{}, {}]",
            lower[i], upper[i]
        )));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut samples = Array2::<f64>::zeros((n, lower.len()));
    for (j, mut column) in samples.columns_mut().into_iter().enumerate() {
        for v in column.iter_mut() {
            *v = rng.random_range(lower[j]..upper[j]);
        }
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn samples_are_reproducible_and_in_bounds() {
        let lo = array![-1.0, 0.0, 5.0];
        let hi = array![1.0, 0.5, 6.0];
        let a = uniform_samples(&lo, &hi, 50, 42).expect("valid bounds");
        let b = uniform_samples(&lo, &hi, 50, 42).expect("valid bounds");
        assert_eq!(a, b);
        for row in a.rows() {
            for j in 0..3 {
                assert!(row[j] >= lo[j] && row[j] < hi[j]);
            }
        }
        let c = uniform_samples(&lo, &hi, 50, 43).expect("valid bounds");
        assert_ne!(a, c);
    }
}
