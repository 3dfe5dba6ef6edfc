//! Random Fourier feature maps with analytic Jacobians.
//!
//! `φ(x) = √(2/D) σ_f cos(Ω x + b)` approximates a shift-invariant kernel
//! whose spectral density generates the rows of `Ω`. The draws are taken once
//! at unit scale (`Z`, `b`) and the hyperparameters only rescale them,
//! `Ω_kj = Z_kj / ℓ_j`, so a feature map evaluated at different length scales
//! stays comparable across a tuning run.

use crate::estimate::ReductionError;
use crate::linalg::faer_ndarray::fast_ab;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use rand::RngExt;
use rand_distr::{Cauchy, Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

/// Spectral density the unit-scale frequencies are drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpectralDistribution {
    /// Standard normal frequencies: squared-exponential kernel.
    #[default]
    Gaussian,
    /// Standard Cauchy frequencies: Laplace (exponential) kernel.
    Laplace,
}

pub fn default_n_params() -> usize {
    1
}

pub fn default_sigma_f() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMapConfig {
    pub input_dim: usize,
    /// Embedding dimension `D`.
    pub n_features: usize,
    /// 1 for an isotropic length scale, `input_dim` for one per coordinate.
    #[serde(default = "default_n_params")]
    pub n_params: usize,
    /// Output scale; the variance of the modelled outputs is a good choice.
    #[serde(default = "default_sigma_f")]
    pub sigma_f: f64,
    #[serde(default)]
    pub distribution: SpectralDistribution,
}

impl FeatureMapConfig {
    pub fn new(input_dim: usize, n_features: usize) -> Self {
        Self {
            input_dim,
            n_features,
            n_params: default_n_params(),
            sigma_f: default_sigma_f(),
            distribution: SpectralDistribution::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeatureMap {
    /// Unit-scale frequencies `Z`, shape (D, m).
    base: Array2<f64>,
    /// Phases `b`, length D.
    phases: Array1<f64>,
    /// Length scales `ℓ`, length `n_params`.
    params: Array1<f64>,
    sigma_f: f64,
    distribution: SpectralDistribution,
    tuned: bool,
}

impl FeatureMap {
    /// Draw frequencies and phases from `rng` and set the initial length scales.
    pub fn new<R: rand::Rng + ?Sized>(
        config: &FeatureMapConfig,
        params: Array1<f64>,
        rng: &mut R,
    ) -> Result<Self, ReductionError> {
        validate_config(config)?;
        let base = draw_base(config, rng)?;
        let phases = Array1::from_shape_fn(config.n_features, |_| rng.random_range(0.0..TAU));
        Self::assemble(config, base, phases, params)
    }

    /// Like [`FeatureMap::new`] with caller-supplied phases.
    pub fn with_phases<R: rand::Rng + ?Sized>(
        config: &FeatureMapConfig,
        params: Array1<f64>,
        phases: Array1<f64>,
        rng: &mut R,
    ) -> Result<Self, ReductionError> {
        validate_config(config)?;
        if phases.len() != config.n_features || phases.iter().any(|b| !b.is_finite()) {
            return Err(ReductionError::InvalidInput(format!(
                "expected {} finite phases, got {}",
                config.n_features,
                phases.len()
            )));
        }
        let base = draw_base(config, rng)?;
        Self::assemble(config, base, phases, params)
    }

    fn assemble(
        config: &FeatureMapConfig,
        base: Array2<f64>,
        phases: Array1<f64>,
        params: Array1<f64>,
    ) -> Result<Self, ReductionError> {
        let mut map = Self {
            base,
            phases,
            params: Array1::ones(config.n_params),
            sigma_f: config.sigma_f,
            distribution: config.distribution,
            tuned: false,
        };
        map.params = map.validated_params(params)?;
        Ok(map)
    }

    pub fn input_dim(&self) -> usize {
        self.base.ncols()
    }

    pub fn n_features(&self) -> usize {
        self.base.nrows()
    }

    pub fn n_params(&self) -> usize {
        self.params.len()
    }

    pub fn sigma_f(&self) -> f64 {
        self.sigma_f
    }

    pub fn distribution(&self) -> SpectralDistribution {
        self.distribution
    }

    pub fn params(&self) -> &Array1<f64> {
        &self.params
    }

    pub fn phases(&self) -> &Array1<f64> {
        &self.phases
    }

    pub fn is_tuned(&self) -> bool {
        self.tuned
    }

    pub fn set_params(&mut self, params: Array1<f64>) -> Result<(), ReductionError> {
        if self.tuned {
            return Err(ReductionError::FeatureMapFrozen);
        }
        self.params = self.validated_params(params)?;
        Ok(())
    }

    /// An untuned copy sharing these random draws, at other length scales.
    pub fn with_params(&self, params: Array1<f64>) -> Result<Self, ReductionError> {
        let params = self.validated_params(params)?;
        Ok(Self {
            params,
            tuned: false,
            ..self.clone()
        })
    }

    /// Set the final length scales and mark the map tuned.
    pub fn freeze(&mut self, params: Array1<f64>) -> Result<(), ReductionError> {
        self.set_params(params)?;
        self.tuned = true;
        Ok(())
    }

    /// Effective frequencies `Ω`, shape (D, m).
    pub fn frequencies(&self) -> Array2<f64> {
        let mut omega = self.base.clone();
        if self.params.len() == 1 {
            omega /= self.params[0];
        } else {
            omega /= &self.params.view().insert_axis(Axis(0));
        }
        omega
    }

    fn amplitude(&self) -> f64 {
        (2.0 / self.n_features() as f64).sqrt() * self.sigma_f
    }

    /// Arguments `Ω x_i + b` for each row, shape (M, D).
    fn arguments(&self, inputs: ArrayView2<'_, f64>) -> Result<Array2<f64>, ReductionError> {
        if inputs.ncols() != self.input_dim() {
            return Err(ReductionError::InvalidInput(format!(
                "feature map expects {} input columns, got {}",
                self.input_dim(),
                inputs.ncols()
            )));
        }
        let omega = self.frequencies();
        let mut args = fast_ab(&inputs, &omega.t());
        args += &self.phases.view().insert_axis(Axis(0));
        Ok(args)
    }

    /// Embed each row of `inputs`: shape (M, D).
    pub fn map(&self, inputs: ArrayView2<'_, f64>) -> Result<Array2<f64>, ReductionError> {
        let amplitude = self.amplitude();
        Ok(self.arguments(inputs)?.mapv(|z| amplitude * z.cos()))
    }

    /// Jacobian `∂φ/∂x` at one point: shape (D, m).
    pub fn jacobian(&self, x: ArrayView1<'_, f64>) -> Result<Array2<f64>, ReductionError> {
        let row = x.insert_axis(Axis(0));
        let jac = self.jacobians(row)?;
        Ok(jac.index_axis_move(Axis(0), 0))
    }

    /// Jacobians at every row: shape (M, D, m).
    pub fn jacobians(&self, inputs: ArrayView2<'_, f64>) -> Result<Array3<f64>, ReductionError> {
        let args = self.arguments(inputs)?;
        let omega = self.frequencies();
        let amplitude = self.amplitude();
        let (n, d) = args.dim();
        let m = self.input_dim();
        let mut out = Array3::<f64>::zeros((n, d, m));
        for (mut jac, arg_row) in out.outer_iter_mut().zip(args.rows()) {
            for ((mut jac_row, omega_row), &z) in
                jac.rows_mut().into_iter().zip(omega.rows()).zip(arg_row.iter())
            {
                let scale = -amplitude * z.sin();
                jac_row.assign(&omega_row.mapv(|w| scale * w));
            }
        }
        Ok(out)
    }

    fn validated_params(&self, params: Array1<f64>) -> Result<Array1<f64>, ReductionError> {
        let expected = self.params.len();
        if params.len() != expected {
            return Err(ReductionError::InvalidInput(format!(
                "feature map expects {} hyperparameters, got {}",
                expected,
                params.len()
            )));
        }
        if params.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err(ReductionError::InvalidInput(format!(
                "length scales must be positive and finite, got {params}"
            )));
        }
        Ok(params)
    }
}

fn validate_config(config: &FeatureMapConfig) -> Result<(), ReductionError> {
    if config.input_dim == 0 || config.n_features == 0 {
        return Err(ReductionError::InvalidInput(format!(
            "feature map needs positive dimensions (input {}, features {})",
            config.input_dim, config.n_features
        )));
    }
    if config.n_params != 1 && config.n_params != config.input_dim {
        return Err(ReductionError::InvalidInput(format!(
            "n_params must be 1 or the input dimension {}, got {}",
            config.input_dim, config.n_params
        )));
    }
    if !(config.sigma_f.is_finite() && config.sigma_f > 0.0) {
        return Err(ReductionError::InvalidInput(format!(
            "sigma_f must be positive and finite, got {}",
            config.sigma_f
        )));
    }
    Ok(())
}

fn draw_base<R: rand::Rng + ?Sized>(
    config: &FeatureMapConfig,
    rng: &mut R,
) -> Result<Array2<f64>, ReductionError> {
    let shape = (config.n_features, config.input_dim);
    match config.distribution {
        SpectralDistribution::Gaussian => Ok(Array2::from_shape_fn(shape, |_| {
            StandardNormal.sample(&mut *rng)
        })),
        SpectralDistribution::Laplace => {
            let cauchy = Cauchy::new(0.0, 1.0).map_err(|e| {
                ReductionError::InvalidInput(format!("invalid Cauchy spectral density: {e}"))
            })?;
            Ok(Array2::from_shape_fn(shape, |_| cauchy.sample(&mut *rng)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn gaussian_map(d: usize, length: f64, seed: u64) -> FeatureMap {
        let mut rng = StdRng::seed_from_u64(seed);
        FeatureMap::new(&FeatureMapConfig::new(3, d), array![length], &mut rng).expect("map")
    }

    #[test]
    fn inner_products_approximate_the_rbf_kernel() {
        let fm = gaussian_map(6000, 0.8, 5);
        let x = array![[0.1, -0.3, 0.4], [0.5, 0.0, -0.2]];
        let phi = fm.map(x.view()).expect("map");
        let approx_k = phi.row(0).dot(&phi.row(1));
        let diff = &x.row(0) - &x.row(1);
        let exact_k = (-diff.dot(&diff) / (2.0 * 0.8 * 0.8)).exp();
        assert_abs_diff_eq!(approx_k, exact_k, epsilon = 0.05);
    }

    #[test]
    fn jacobian_matches_finite_differences() {
        let fm = gaussian_map(25, 0.5, 9);
        let x = array![0.2, -0.7, 0.3];
        let jac = fm.jacobian(x.view()).expect("jacobian");
        assert_eq!(jac.dim(), (25, 3));
        let h = 1e-6;
        for j in 0..3 {
            let mut xp = x.clone();
            let mut xm = x.clone();
            xp[j] += h;
            xm[j] -= h;
            let fp = fm.map(xp.view().insert_axis(Axis(0))).expect("map");
            let fm_ = fm.map(xm.view().insert_axis(Axis(0))).expect("map");
            for k in 0..25 {
                let fd = (fp[[0, k]] - fm_[[0, k]]) / (2.0 * h);
                assert_abs_diff_eq!(jac[[k, j]], fd, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn draws_survive_parameter_changes() {
        let fm = gaussian_map(10, 1.0, 1);
        let wider = fm.with_params(array![2.0]).expect("valid");
        assert_eq!(fm.phases(), wider.phases());
        let ratio = &fm.frequencies() / &wider.frequencies();
        assert!(ratio.iter().all(|r| (r - 2.0).abs() < 1e-12));
    }

    #[test]
    fn per_coordinate_scales_divide_columns() {
        let mut rng = StdRng::seed_from_u64(2);
        let config = FeatureMapConfig {
            n_params: 3,
            ..FeatureMapConfig::new(3, 4)
        };
        let fm = FeatureMap::new(&config, array![1.0, 2.0, 4.0], &mut rng).expect("map");
        let unit = fm.with_params(array![1.0, 1.0, 1.0]).expect("valid");
        let (omega, base) = (fm.frequencies(), unit.frequencies());
        for k in 0..4 {
            assert_abs_diff_eq!(omega[[k, 2]] * 4.0, base[[k, 2]], epsilon = 1e-12);
        }
        assert!(fm.with_params(array![1.0]).is_err());
    }

    #[test]
    fn frozen_map_rejects_new_parameters() {
        let mut fm = gaussian_map(8, 1.0, 3);
        fm.freeze(array![0.3]).expect("first freeze");
        assert!(fm.is_tuned());
        assert_eq!(fm.params(), &array![0.3]);
        assert!(matches!(
            fm.set_params(array![0.5]),
            Err(ReductionError::FeatureMapFrozen)
        ));
        assert_eq!(fm.params(), &array![0.3]);
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(FeatureMap::new(&FeatureMapConfig::new(0, 10), array![1.0], &mut rng).is_err());
        assert!(FeatureMap::new(&FeatureMapConfig::new(2, 10), array![-1.0], &mut rng).is_err());
        let bad_sigma = FeatureMapConfig {
            sigma_f: 0.0,
            ..FeatureMapConfig::new(2, 10)
        };
        assert!(FeatureMap::new(&bad_sigma, array![1.0], &mut rng).is_err());
    }
}
