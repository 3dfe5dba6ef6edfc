//! Nonlinear active subspaces.
//!
//! Inputs are embedded with a [`FeatureMap`] `φ: R^m -> R^D`. If `f = h ∘ φ`,
//! then `∇f(x) = J(x)ᵀ ∇h(φ(x))`, so the feature-space gradient is recovered
//! with the pseudo-inverse of the Jacobian,
//!
//! ```text
//! ∇h ≈ J (JᵀJ)⁻¹ ∇f,
//! ```
//!
//! and the linear machinery of [`crate::active`] runs on those pseudo-gradients.

use crate::active::ActiveSubspaces;
use crate::estimate::ReductionError;
use crate::feature_map::FeatureMap;
use crate::linalg::utils::cholesky_with_jitter;
use crate::types::ComputeMethod;
use ndarray::{Array2, ArrayView1, ArrayView2};

#[derive(Debug, Clone)]
pub struct NonlinearActiveSubspaces {
    feature_map: FeatureMap,
    inner: ActiveSubspaces,
}

impl NonlinearActiveSubspaces {
    pub fn new(feature_map: FeatureMap, method: ComputeMethod) -> Self {
        Self {
            feature_map,
            inner: ActiveSubspaces::new(method),
        }
    }

    pub fn feature_map(&self) -> &FeatureMap {
        &self.feature_map
    }

    /// The linear decomposition carried out in feature space.
    pub fn feature_space(&self) -> &ActiveSubspaces {
        &self.inner
    }

    /// Feature-space gradients `J_i (J_iᵀ J_i)⁻¹ ∇f(x_i)`, shape (M, D).
    pub fn pseudo_gradients(
        &self,
        inputs: ArrayView2<'_, f64>,
        gradients: ArrayView2<'_, f64>,
    ) -> Result<Array2<f64>, ReductionError> {
        if inputs.dim() != gradients.dim() {
            return Err(ReductionError::InvalidInput(format!(
                "inputs {:?} and gradients {:?} must have the same shape",
                inputs.dim(),
                gradients.dim()
            )));
        }
        let jacobians = self.feature_map.jacobians(inputs)?;
        let mut pseudo = Array2::<f64>::zeros((inputs.nrows(), self.feature_map.n_features()));
        for ((jac, grad), mut out) in jacobians
            .outer_iter()
            .zip(gradients.rows())
            .zip(pseudo.rows_mut())
        {
            let gram = jac.t().dot(&jac);
            let (factor, _) = cholesky_with_jitter(&gram, "feature map Jacobian Gram")?;
            let coeffs = factor.solve_vec(&grad.to_owned());
            out.assign(&jac.dot(&coeffs));
        }
        Ok(pseudo)
    }

    pub fn compute(
        &mut self,
        inputs: ArrayView2<'_, f64>,
        gradients: ArrayView2<'_, f64>,
        weights: Option<ArrayView1<'_, f64>>,
    ) -> Result<(), ReductionError> {
        let pseudo = self.pseudo_gradients(inputs, gradients)?;
        self.inner.compute(pseudo.view(), weights)
    }

    pub fn partition(&mut self, dim: usize) -> Result<(), ReductionError> {
        self.inner.partition(dim)
    }

    /// Active and inactive coordinates of the embedded inputs.
    pub fn transform(
        &self,
        inputs: ArrayView2<'_, f64>,
    ) -> Result<(Array2<f64>, Array2<f64>), ReductionError> {
        let features = self.feature_map.map(inputs)?;
        self.inner.transform(features.view())
    }

    pub fn project(&self, inputs: ArrayView2<'_, f64>) -> Result<Array2<f64>, ReductionError> {
        let features = self.feature_map.map(inputs)?;
        self.inner.project(features.view())
    }
}
