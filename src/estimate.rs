use crate::active::resolve_weights;
use crate::cross_validation::{CrossValidationSummary, CrossValidator};
use crate::feature_map::FeatureMap;
use crate::linalg::faer_ndarray::FaerLinalgError;
use crate::regression::{Prediction, Regressor, build_regressor};
use crate::subspace::{ReducedSpace, SubspaceType};
use crate::types::ReductionConfig;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use thiserror::Error;

/// Errors raised by the reduction, regression, validation and tuning stages.
#[derive(Error)]
pub enum ReductionError {
    #[error(
        "Value {value} at row {row}, column {col} lies outside the domain [{lower}, {upper}]."
    )]
    DomainError {
        row: usize,
        col: usize,
        value: f64,
        lower: f64,
        upper: f64,
    },

    #[error(
        "Invalid subspace dimension {requested}: it must satisfy 1 <= dim < {ambient} (ambient dimension)."
    )]
    InvalidDimension { requested: usize, ambient: usize },

    #[error("{0} requested before the decomposition or fit it depends on was computed.")]
    NotComputed(&'static str),

    #[error("Regression fit failed: {0}")]
    FitError(String),

    #[error(
        "Held-out fold {fold} has constant outputs (std = {std:.3e}); the normalized RMSE is undefined."
    )]
    DegenerateFold { fold: usize, std: f64 },

    #[error(
        "Hyperparameter search did not converge after {evaluations} objective evaluations."
    )]
    TuningDidNotConverge { evaluations: usize },

    #[error("Feature map is tuned; its hyperparameters can no longer be changed.")]
    FeatureMapFrozen,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Linear algebra failure: {0}")]
    Linalg(#[from] FaerLinalgError),
}

impl ReductionError {
    /// Failures that come from the numerics of one particular configuration
    /// (ill-conditioned systems, optimizer breakdown) rather than from the
    /// data or the request itself.
    pub fn is_numerical(&self) -> bool {
        matches!(
            self,
            ReductionError::Linalg(_) | ReductionError::FitError(_)
        )
    }
}

// Debug prints the message so `?` in tests and binaries reads naturally.
impl core::fmt::Debug for ReductionError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self)
    }
}

/// Inputs, outputs and gradients of one sample set, row-aligned.
#[derive(Debug, Clone)]
pub struct SampleSet {
    inputs: Array2<f64>,
    outputs: Array1<f64>,
    gradients: Array2<f64>,
    weights: Option<Array1<f64>>,
}

impl SampleSet {
    pub fn new(
        inputs: Array2<f64>,
        outputs: Array1<f64>,
        gradients: Array2<f64>,
    ) -> Result<Self, ReductionError> {
        if inputs.nrows() == 0 {
            return Err(ReductionError::InvalidInput(
                "sample set is empty".to_string(),
            ));
        }
        if outputs.len() != inputs.nrows() || gradients.dim() != inputs.dim() {
            return Err(ReductionError::InvalidInput(format!(
                "inputs {:?}, outputs ({},) and gradients {:?} are not row-aligned",
                inputs.dim(),
                outputs.len(),
                gradients.dim()
            )));
        }
        Ok(Self {
            inputs,
            outputs,
            gradients,
            weights: None,
        })
    }

    /// Attach quadrature weights; validated like the decomposition validates them.
    pub fn with_weights(mut self, weights: Array1<f64>) -> Result<Self, ReductionError> {
        resolve_weights(self.len(), Some(weights.view()))?;
        self.weights = Some(weights);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.inputs.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.nrows() == 0
    }

    pub fn dim(&self) -> usize {
        self.inputs.ncols()
    }

    pub fn inputs(&self) -> ArrayView2<'_, f64> {
        self.inputs.view()
    }

    pub fn outputs(&self) -> ArrayView1<'_, f64> {
        self.outputs.view()
    }

    pub fn gradients(&self) -> ArrayView2<'_, f64> {
        self.gradients.view()
    }

    pub fn weights(&self) -> Option<ArrayView1<'_, f64>> {
        self.weights.as_ref().map(|w| w.view())
    }

    /// Rows at `indices`. Weights are renormalized to the subset's total.
    pub fn subset(&self, indices: &[usize]) -> Result<Self, ReductionError> {
        if indices.is_empty() || indices.iter().any(|&i| i >= self.len()) {
            return Err(ReductionError::InvalidInput(format!(
                "subset indices must be non-empty and below {}",
                self.len()
            )));
        }
        let weights = self.weights.as_ref().map(|w| {
            let sub = w.select(Axis(0), indices);
            let total = sub.sum();
            if total > 0.0 { sub / total } else { sub }
        });
        Ok(Self {
            inputs: self.inputs.select(Axis(0), indices),
            outputs: self.outputs.select(Axis(0), indices),
            gradients: self.gradients.select(Axis(0), indices),
            weights,
        })
    }
}

/// A reduction plus the ridge surface fitted over its coordinates.
pub struct FittedRidge {
    subspace: Box<dyn ReducedSpace>,
    regressor: Box<dyn Regressor>,
}

impl FittedRidge {
    pub fn subspace(&self) -> &dyn ReducedSpace {
        self.subspace.as_ref()
    }

    /// Reduced coordinates of `inputs`.
    pub fn reduce(&self, inputs: ArrayView2<'_, f64>) -> Result<Array2<f64>, ReductionError> {
        self.subspace.reduce(inputs)
    }

    pub fn predict(&self, inputs: ArrayView2<'_, f64>) -> Result<Prediction, ReductionError> {
        let reduced = self.subspace.reduce(inputs)?;
        self.regressor.predict(reduced.view())
    }
}

/// Builds a ridge approximation `f(x) ≈ g(Wᵀ x)` (or `g(Wᵀ φ(x))`) from samples.
#[derive(Debug, Clone)]
pub struct Estimator {
    sstype: SubspaceType,
    config: ReductionConfig,
}

impl Estimator {
    pub fn new(sstype: SubspaceType, config: ReductionConfig) -> Self {
        Self { sstype, config }
    }

    pub fn active(config: ReductionConfig) -> Self {
        Self::new(SubspaceType::Active, config)
    }

    pub fn nonlinear(feature_map: FeatureMap, config: ReductionConfig) -> Self {
        Self::new(SubspaceType::Nonlinear(feature_map), config)
    }

    pub fn sstype(&self) -> &SubspaceType {
        &self.sstype
    }

    pub fn config(&self) -> &ReductionConfig {
        &self.config
    }

    pub fn fit(&self, samples: &SampleSet) -> Result<FittedRidge, ReductionError> {
        let mut subspace = self.sstype.build(self.config.method);
        subspace.fit(
            samples.inputs(),
            samples.gradients(),
            samples.weights(),
            self.config.dimension,
        )?;
        let reduced = subspace.reduce(samples.inputs())?;
        let mut regressor = build_regressor(&self.config.regressor);
        regressor.fit(reduced.view(), samples.outputs())?;
        Ok(FittedRidge {
            subspace,
            regressor,
        })
    }

    /// k-fold NRMSE of this estimator on `samples`.
    pub fn cross_validation(
        &self,
        samples: &SampleSet,
    ) -> Result<CrossValidationSummary, ReductionError> {
        let validator = CrossValidator::from_config(&self.config);
        let summary = validator.run(samples, |train, test_inputs| {
            Ok(self.fit(train)?.predict(test_inputs)?.mean)
        })?;
        log::debug!(
            "{} cross validation: mean {:.4e}, std {:.4e}",
            self.sstype.label(),
            summary.mean,
            summary.std
        );
        Ok(summary)
    }
}
