use crate::estimate::ReductionError;
use crate::feature_map::{FeatureMap, FeatureMapConfig};
use crate::kernel::{cross_covariance, profile, profile_dr2, scaled_sq_dist};
use crate::linalg::utils::{cholesky_with_jitter, symmetrize};
use crate::types::{KernelKind, RegressorKind};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, array};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use wolfe_bfgs::{Bfgs, BfgsError};

/// Smallest training set a surface can be fitted on.
pub const MIN_TRAINING_POINTS: usize = 2;

/// Predictive mean and variance at each query row.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub mean: Array1<f64>,
    pub variance: Array1<f64>,
}

/// A response surface over the reduced coordinates.
pub trait Regressor: Send + Sync {
    fn fit(&mut self, inputs: ArrayView2<'_, f64>, outputs: ArrayView1<'_, f64>)
    -> Result<(), ReductionError>;

    fn predict(&self, inputs: ArrayView2<'_, f64>) -> Result<Prediction, ReductionError>;
}

/// A fresh, unfitted surface of the requested kind.
pub fn build_regressor(kind: &RegressorKind) -> Box<dyn Regressor> {
    match *kind {
        RegressorKind::GaussianProcess { kernel } => Box::new(GaussianProcess::new(kernel)),
        RegressorKind::RandomFeatureRidge {
            n_features,
            length_scale,
            regularization,
            seed,
        } => Box::new(RandomFeatureRidge::new(
            n_features,
            length_scale,
            regularization,
            seed,
        )),
    }
}

fn check_training_data(
    inputs: ArrayView2<'_, f64>,
    outputs: ArrayView1<'_, f64>,
) -> Result<(), ReductionError> {
    if inputs.nrows() != outputs.len() {
        return Err(ReductionError::InvalidInput(format!(
            "{} input rows but {} outputs",
            inputs.nrows(),
            outputs.len()
        )));
    }
    if inputs.ncols() == 0 {
        return Err(ReductionError::InvalidInput(
            "inputs have no columns".to_string(),
        ));
    }
    if inputs.nrows() < MIN_TRAINING_POINTS {
        return Err(ReductionError::FitError(format!(
            "need at least {} training points, got {}",
            MIN_TRAINING_POINTS,
            inputs.nrows()
        )));
    }
    if inputs.iter().chain(outputs.iter()).any(|v| !v.is_finite()) {
        return Err(ReductionError::InvalidInput(
            "training data contains non-finite values".to_string(),
        ));
    }
    Ok(())
}

fn check_query(inputs: ArrayView2<'_, f64>, expected: usize) -> Result<(), ReductionError> {
    if inputs.ncols() != expected {
        return Err(ReductionError::InvalidInput(format!(
            "surface was fitted on {} coordinates, query has {}",
            expected,
            inputs.ncols()
        )));
    }
    Ok(())
}

/// Mean and population standard deviation; a constant vector gets scale 1.
fn standardization(values: ArrayView1<'_, f64>) -> (f64, f64) {
    let mean = values.mean().unwrap_or(0.0);
    let var = values.mapv(|v| (v - mean).powi(2)).mean().unwrap_or(0.0);
    let std = var.sqrt();
    (mean, if std > 1e-12 { std } else { 1.0 })
}

// Box constraints on the log hyperparameters of the standardized problem.
const LOG_VARIANCE_BOUNDS: (f64, f64) = (-9.2, 9.2);
const LOG_LENGTH_BOUNDS: (f64, f64) = (-6.9, 6.9);
const LOG_NOISE_BOUNDS: (f64, f64) = (-18.4, 0.7);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaussianProcessOptions {
    pub max_iter: usize,
    pub tol: f64,
    /// Initial length scales are these multiples of each coordinate's spread.
    pub length_scale_starts: Vec<f64>,
}

impl Default for GaussianProcessOptions {
    fn default() -> Self {
        Self {
            max_iter: 100,
            tol: 1e-6,
            length_scale_starts: vec![1.0, 0.3],
        }
    }
}

/// Hyperparameters on the standardized output scale.
#[derive(Debug, Clone, PartialEq)]
pub struct GpHyperparameters {
    pub signal_variance: f64,
    pub length_scales: Array1<f64>,
    pub noise_variance: f64,
}

impl GpHyperparameters {
    fn from_log(theta: &Array1<f64>) -> Self {
        let d = theta.len() - 2;
        Self {
            signal_variance: theta[0].exp(),
            length_scales: theta.slice(ndarray::s![1..=d]).mapv(f64::exp),
            noise_variance: theta[d + 1].exp(),
        }
    }
}

#[derive(Debug, Clone)]
struct GpState {
    train: Array2<f64>,
    y_mean: f64,
    y_scale: f64,
    hyper: GpHyperparameters,
    alpha: Array1<f64>,
    k_inverse: Array2<f64>,
    nlml: f64,
}

/// Exact GP regression with an ARD kernel; hyperparameters maximize the log
/// marginal likelihood of the standardized outputs.
#[derive(Debug, Clone)]
pub struct GaussianProcess {
    kernel: KernelKind,
    options: GaussianProcessOptions,
    state: Option<GpState>,
}

/// Result of one marginal-likelihood evaluation at fixed hyperparameters.
struct MarginalFit {
    nlml: f64,
    alpha: Array1<f64>,
    k_inverse: Array2<f64>,
    signal: Array2<f64>,
}

impl GaussianProcess {
    pub fn new(kernel: KernelKind) -> Self {
        Self::with_options(kernel, GaussianProcessOptions::default())
    }

    pub fn with_options(kernel: KernelKind, options: GaussianProcessOptions) -> Self {
        Self {
            kernel,
            options,
            state: None,
        }
    }

    pub fn kernel(&self) -> KernelKind {
        self.kernel
    }

    /// Fitted hyperparameters (standardized output scale).
    pub fn hyperparameters(&self) -> Option<&GpHyperparameters> {
        self.state.as_ref().map(|s| &s.hyper)
    }

    /// Negative log marginal likelihood at the optimum.
    pub fn negative_log_likelihood(&self) -> Option<f64> {
        self.state.as_ref().map(|s| s.nlml)
    }

    fn marginal_fit(
        &self,
        x: ArrayView2<'_, f64>,
        y: &Array1<f64>,
        hyper: &GpHyperparameters,
    ) -> Result<MarginalFit, ReductionError> {
        let n = x.nrows();
        let signal = cross_covariance(self.kernel, x, x, hyper.signal_variance, &hyper.length_scales);
        let mut k = signal.clone();
        for i in 0..n {
            k[[i, i]] += hyper.noise_variance;
        }
        symmetrize(&mut k);
        let (factor, _) = cholesky_with_jitter(&k, "GP covariance")?;
        let alpha = factor.solve_vec(y);
        let k_inverse = factor.solve_mat(&Array2::eye(n));
        let nlml = 0.5 * y.dot(&alpha)
            + 0.5 * factor.log_determinant()
            + 0.5 * n as f64 * (2.0 * std::f64::consts::PI).ln();
        Ok(MarginalFit {
            nlml,
            alpha,
            k_inverse,
            signal,
        })
    }

    /// NLML and its gradient in `θ = [log σ², log ℓ_1..log ℓ_d, log σ_n²]`.
    ///
    /// `∂NLML/∂θ_p = ½ tr((K⁻¹ - ααᵀ) ∂K/∂θ_p)`.
    fn cost_and_gradient(
        &self,
        x: ArrayView2<'_, f64>,
        y: &Array1<f64>,
        theta: &Array1<f64>,
    ) -> Result<(f64, Array1<f64>), ReductionError> {
        let hyper = GpHyperparameters::from_log(theta);
        let fit = self.marginal_fit(x, y, &hyper)?;
        let n = x.nrows();
        let d = x.ncols();
        let mut q = fit.k_inverse.clone();
        for i in 0..n {
            for j in 0..n {
                q[[i, j]] -= fit.alpha[i] * fit.alpha[j];
            }
        }

        let mut grad = Array1::<f64>::zeros(d + 2);
        for i in 0..n {
            grad[d + 1] += 0.5 * q[[i, i]] * hyper.noise_variance;
            for j in 0..n {
                let qij = q[[i, j]];
                grad[0] += 0.5 * qij * fit.signal[[i, j]];
                if i == j {
                    continue;
                }
                let r2 = scaled_sq_dist(x.row(i), x.row(j), &hyper.length_scales);
                let slope = -2.0 * hyper.signal_variance * profile_dr2(self.kernel, r2);
                if slope == 0.0 {
                    continue;
                }
                for c in 0..d {
                    let s = (x[[i, c]] - x[[j, c]]) / hyper.length_scales[c];
                    grad[1 + c] += 0.5 * qij * slope * s * s;
                }
            }
        }
        Ok((fit.nlml, grad))
    }

    fn bounds(d: usize) -> (Array1<f64>, Array1<f64>) {
        let mut lower = Array1::from_elem(d + 2, LOG_LENGTH_BOUNDS.0);
        let mut upper = Array1::from_elem(d + 2, LOG_LENGTH_BOUNDS.1);
        lower[0] = LOG_VARIANCE_BOUNDS.0;
        upper[0] = LOG_VARIANCE_BOUNDS.1;
        lower[d + 1] = LOG_NOISE_BOUNDS.0;
        upper[d + 1] = LOG_NOISE_BOUNDS.1;
        (lower, upper)
    }

    fn starting_points(&self, x: ArrayView2<'_, f64>) -> Vec<Array1<f64>> {
        let d = x.ncols();
        let spreads: Vec<f64> = (0..d)
            .map(|c| {
                let (_, s) = standardization(x.column(c));
                s
            })
            .collect();
        self.options
            .length_scale_starts
            .iter()
            .map(|factor| {
                let mut theta = Array1::<f64>::zeros(d + 2);
                for c in 0..d {
                    theta[1 + c] = (factor * spreads[c])
                        .ln()
                        .clamp(LOG_LENGTH_BOUNDS.0, LOG_LENGTH_BOUNDS.1);
                }
                theta[d + 1] = (1e-2f64).ln();
                theta
            })
            .collect()
    }

    fn optimize(
        &self,
        x: ArrayView2<'_, f64>,
        y: &Array1<f64>,
    ) -> Result<Array1<f64>, ReductionError> {
        let (lower, upper) = Self::bounds(x.ncols());
        let mut best: Option<(Array1<f64>, f64)> = None;
        for start in self.starting_points(x) {
            let mut optimizer = Bfgs::new(start.clone(), |theta| {
                let clamped = clamp_to_box(theta, &lower, &upper);
                match self.cost_and_gradient(x, y, &clamped) {
                    Ok((cost, grad)) if cost.is_finite() && grad.iter().all(|g| g.is_finite()) => {
                        (cost, grad)
                    }
                    _ => invalid_bfgs_sample(theta),
                }
            })
            .with_bounds(lower.clone(), upper.clone(), 1e-6)
            .with_tolerance(self.options.tol)
            .with_max_iterations(self.options.max_iter);

            let solution = match optimizer.run() {
                Ok(sol) => sol,
                Err(BfgsError::MaxIterationsReached { last_solution })
                | Err(BfgsError::LineSearchFailed { last_solution, .. }) => *last_solution,
                Err(_) => {
                    log::warn!("GP hyperparameter search from {:?} failed.", start.to_vec());
                    continue;
                }
            };
            let theta = clamp_to_box(&solution.final_point, &lower, &upper);
            let value = solution.final_value;
            // never left the barrier: no valid covariance was reached
            if !value.is_finite() || value >= COST_BARRIER {
                log::warn!("GP hyperparameter search from {:?} found no valid point.", start.to_vec());
                continue;
            }
            if best.as_ref().is_none_or(|(_, v)| value < *v) {
                best = Some((theta, value));
            }
        }

        best.map(|(theta, _)| theta).ok_or_else(|| {
            ReductionError::FitError(format!(
                "GP hyperparameter optimization failed from all {} starting points",
                self.options.length_scale_starts.len()
            ))
        })
    }
}

fn clamp_to_box(theta: &Array1<f64>, lower: &Array1<f64>, upper: &Array1<f64>) -> Array1<f64> {
    Array1::from_shape_fn(theta.len(), |i| theta[i].clamp(lower[i], upper[i]))
}

// Finite cost returned where the covariance cannot be factored, so the line
// search backs off instead of aborting.
const COST_BARRIER: f64 = 1e50;

fn invalid_bfgs_sample(theta: &Array1<f64>) -> (f64, Array1<f64>) {
    const GRAD_SCALE: f64 = 1e6;

    let mut grad = theta.clone();
    for g in grad.iter_mut() {
        if !g.is_finite() || g.abs() < 1e-6 {
            *g = 1.0;
        }
    }
    grad *= GRAD_SCALE;
    (COST_BARRIER + 0.5 * theta.dot(theta), grad)
}

impl Regressor for GaussianProcess {
    fn fit(
        &mut self,
        inputs: ArrayView2<'_, f64>,
        outputs: ArrayView1<'_, f64>,
    ) -> Result<(), ReductionError> {
        check_training_data(inputs, outputs)?;
        if let KernelKind::RationalQuadratic { power } = self.kernel
            && !(power.is_finite() && power > 0.0)
        {
            return Err(ReductionError::InvalidInput(format!(
                "rational quadratic power must be positive, got {power}"
            )));
        }
        let (y_mean, y_scale) = standardization(outputs);
        let y = outputs.mapv(|v| (v - y_mean) / y_scale);

        let theta = self.optimize(inputs, &y)?;
        let hyper = GpHyperparameters::from_log(&theta);
        let fit = self
            .marginal_fit(inputs, &y, &hyper)
            .map_err(|e| ReductionError::FitError(format!("GP at optimum: {e}")))?;
        log::debug!(
            "GP fit: σ² = {:.3e}, ℓ = {:?}, σ_n² = {:.3e}, NLML = {:.4}",
            hyper.signal_variance,
            hyper.length_scales.to_vec(),
            hyper.noise_variance,
            fit.nlml
        );
        self.state = Some(GpState {
            train: inputs.to_owned(),
            y_mean,
            y_scale,
            hyper,
            alpha: fit.alpha,
            k_inverse: fit.k_inverse,
            nlml: fit.nlml,
        });
        Ok(())
    }

    fn predict(&self, inputs: ArrayView2<'_, f64>) -> Result<Prediction, ReductionError> {
        let state = self
            .state
            .as_ref()
            .ok_or(ReductionError::NotComputed("GaussianProcess::predict"))?;
        check_query(inputs, state.train.ncols())?;
        let hyper = &state.hyper;
        let cross = cross_covariance(
            self.kernel,
            inputs,
            state.train.view(),
            hyper.signal_variance,
            &hyper.length_scales,
        );
        let mean = cross.dot(&state.alpha).mapv(|v| v * state.y_scale + state.y_mean);
        let reduced = cross.dot(&state.k_inverse);
        let explained = (&reduced * &cross).sum_axis(Axis(1));
        let prior = hyper.signal_variance * profile(self.kernel, 0.0) + hyper.noise_variance;
        let scale2 = state.y_scale * state.y_scale;
        let variance = explained.mapv(|e| (prior - e).max(0.0) * scale2);
        Ok(Prediction { mean, variance })
    }
}

#[derive(Debug, Clone)]
struct RidgeState {
    map: FeatureMap,
    weights: Array1<f64>,
    a_inverse: Array2<f64>,
    noise: f64,
    y_mean: f64,
}

/// Bayesian ridge regression on random Fourier features of the reduced
/// coordinates.
#[derive(Debug, Clone)]
pub struct RandomFeatureRidge {
    n_features: usize,
    length_scale: f64,
    regularization: f64,
    seed: u64,
    state: Option<RidgeState>,
}

impl RandomFeatureRidge {
    pub fn new(n_features: usize, length_scale: f64, regularization: f64, seed: u64) -> Self {
        Self {
            n_features,
            length_scale,
            regularization,
            seed,
            state: None,
        }
    }

    pub fn coefficients(&self) -> Option<&Array1<f64>> {
        self.state.as_ref().map(|s| &s.weights)
    }
}

impl Regressor for RandomFeatureRidge {
    fn fit(
        &mut self,
        inputs: ArrayView2<'_, f64>,
        outputs: ArrayView1<'_, f64>,
    ) -> Result<(), ReductionError> {
        check_training_data(inputs, outputs)?;
        if !(self.regularization > 0.0 && self.length_scale > 0.0) || self.n_features == 0 {
            return Err(ReductionError::InvalidInput(format!(
                "ridge needs positive regularization, length scale and feature count \
                 (got {}, {}, {})",
                self.regularization, self.length_scale, self.n_features
            )));
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        let config = FeatureMapConfig::new(inputs.ncols(), self.n_features);
        let map = FeatureMap::new(&config, array![self.length_scale], &mut rng)?;
        let phi = map.map(inputs)?;

        let y_mean = outputs.mean().unwrap_or(0.0);
        let centered = outputs.mapv(|v| v - y_mean);
        let mut a = phi.t().dot(&phi);
        for i in 0..a.nrows() {
            a[[i, i]] += self.regularization;
        }
        symmetrize(&mut a);
        let (factor, _) = cholesky_with_jitter(&a, "ridge normal equations")
            .map_err(|e| ReductionError::FitError(e.to_string()))?;
        let weights = factor.solve_vec(&phi.t().dot(&centered));
        let a_inverse = factor.solve_mat(&Array2::eye(a.nrows()));
        let residuals = &centered - &phi.dot(&weights);
        let noise = residuals.dot(&residuals) / inputs.nrows() as f64;
        log::debug!(
            "random-feature ridge: D = {}, residual variance {:.3e}",
            self.n_features,
            noise
        );
        self.state = Some(RidgeState {
            map,
            weights,
            a_inverse,
            noise,
            y_mean,
        });
        Ok(())
    }

    fn predict(&self, inputs: ArrayView2<'_, f64>) -> Result<Prediction, ReductionError> {
        let state = self
            .state
            .as_ref()
            .ok_or(ReductionError::NotComputed("RandomFeatureRidge::predict"))?;
        check_query(inputs, state.map.input_dim())?;
        let phi = state.map.map(inputs)?;
        let mean = phi.dot(&state.weights).mapv(|v| v + state.y_mean);
        let leverage = (&phi.dot(&state.a_inverse) * &phi).sum_axis(Axis(1));
        let variance = leverage.mapv(|h| state.noise * (1.0 + h.max(0.0)));
        Ok(Prediction { mean, variance })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array;

    fn smooth_1d(n: usize) -> (Array2<f64>, Array1<f64>) {
        let x = Array::linspace(-1.0f64, 1.0, n).insert_axis(Axis(1));
        let y = x.column(0).mapv(|t| (2.0 * t).sin() + 0.5 * t * t);
        (x, y)
    }

    #[test]
    fn gp_interpolates_smooth_function() {
        let (x, y) = smooth_1d(25);
        let mut gp = GaussianProcess::new(KernelKind::Rbf);
        assert!(gp.hyperparameters().is_none());
        gp.fit(x.view(), y.view()).expect("fit");
        assert_eq!(gp.kernel(), KernelKind::Rbf);
        let hyper = gp.hyperparameters().expect("fitted");
        assert_eq!(hyper.length_scales.len(), 1);
        assert!(hyper.signal_variance > 0.0 && hyper.noise_variance > 0.0);
        assert!(gp.negative_log_likelihood().is_some_and(f64::is_finite));
        let query = array![[-0.55], [0.1], [0.73]];
        let pred = gp.predict(query.view()).expect("predict");
        for (i, t) in [-0.55f64, 0.1, 0.73].iter().enumerate() {
            let truth = (2.0 * t).sin() + 0.5 * t * t;
            assert_abs_diff_eq!(pred.mean[i], truth, epsilon = 5e-2);
            assert!(pred.variance[i] >= 0.0);
        }
    }

    #[test]
    fn analytic_gradient_matches_finite_differences() {
        let (x, y) = smooth_1d(12);
        let x2 = ndarray::concatenate![Axis(1), x, x.mapv(|v| v * v)];
        for kernel in [
            KernelKind::Rbf,
            KernelKind::RationalQuadratic { power: 1.5 },
            KernelKind::Exponential,
        ] {
            let gp = GaussianProcess::new(kernel);
            let theta = array![0.2, -0.3, 0.4, -3.0];
            let (_, grad) = gp.cost_and_gradient(x2.view(), &y, &theta).expect("cost");
            let h = 1e-5;
            for p in 0..theta.len() {
                let mut tp = theta.clone();
                tp[p] += h;
                let mut tm = theta.clone();
                tm[p] -= h;
                let fp = gp.cost_and_gradient(x2.view(), &y, &tp).expect("cost").0;
                let fm = gp.cost_and_gradient(x2.view(), &y, &tm).expect("cost").0;
                let fd = (fp - fm) / (2.0 * h);
                assert_abs_diff_eq!(grad[p], fd, epsilon = 1e-4 * (1.0 + fd.abs()));
            }
        }
    }

    #[test]
    fn gp_predictive_variance_grows_away_from_data() {
        let (x, y) = smooth_1d(15);
        let mut gp = GaussianProcess::new(KernelKind::Rbf);
        gp.fit(x.view(), y.view()).expect("fit");
        let pred = gp.predict(array![[0.0], [5.0]].view()).expect("predict");
        assert!(pred.variance[1] > pred.variance[0]);
    }

    #[test]
    fn too_few_points_is_a_fit_error() {
        let x = array![[0.3]];
        let y = array![1.0];
        let mut gp = GaussianProcess::new(KernelKind::Rbf);
        assert!(matches!(
            gp.fit(x.view(), y.view()),
            Err(ReductionError::FitError(_))
        ));
        let mut ridge = RandomFeatureRidge::new(50, 0.5, 1e-3, 1);
        assert!(matches!(
            ridge.fit(x.view(), y.view()),
            Err(ReductionError::FitError(_))
        ));
    }

    #[test]
    fn failed_hyperparameter_search_is_a_fit_error() {
        let (x, y) = smooth_1d(10);
        let options = GaussianProcessOptions {
            length_scale_starts: Vec::new(),
            ..GaussianProcessOptions::default()
        };
        let mut gp = GaussianProcess::with_options(KernelKind::Rbf, options);
        assert!(matches!(
            gp.fit(x.view(), y.view()),
            Err(ReductionError::FitError(_))
        ));
        assert!(gp.hyperparameters().is_none());
        assert!(matches!(
            gp.predict(x.view()),
            Err(ReductionError::NotComputed(_))
        ));
    }

    #[test]
    fn predict_before_fit_is_not_computed() {
        let gp = GaussianProcess::new(KernelKind::Exponential);
        assert!(matches!(
            gp.predict(array![[0.0]].view()),
            Err(ReductionError::NotComputed(_))
        ));
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let x = array![[0.0], [1.0], [2.0]];
        let y = array![1.0, 2.0];
        let mut gp = GaussianProcess::new(KernelKind::Rbf);
        assert!(matches!(
            gp.fit(x.view(), y.view()),
            Err(ReductionError::InvalidInput(_))
        ));
    }

    #[test]
    fn ridge_fits_smooth_function() {
        let (x, y) = smooth_1d(60);
        let mut ridge = RandomFeatureRidge::new(200, 0.5, 1e-4, 7);
        ridge.fit(x.view(), y.view()).expect("fit");
        assert_eq!(ridge.coefficients().map(|w| w.len()), Some(200));
        let pred = ridge.predict(x.view()).expect("predict");
        let rmse = ((&pred.mean - &y).mapv(|e| e * e).mean().expect("mean")).sqrt();
        assert!(rmse < 0.05, "rmse {rmse}");
        assert!(pred.variance.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn builder_follows_kind() {
        let (x, y) = smooth_1d(10);
        let mut reg = build_regressor(&RegressorKind::RandomFeatureRidge {
            n_features: 40,
            length_scale: 0.7,
            regularization: 1e-3,
            seed: 3,
        });
        reg.fit(x.view(), y.view()).expect("fit");
        assert_eq!(reg.predict(x.view()).expect("predict").mean.len(), 10);
    }
}
