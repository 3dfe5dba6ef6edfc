use serde::{Deserialize, Serialize};

/// How the gradient covariance and its eigenpairs are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ComputeMethod {
    /// Form `C = Σ w_i g_i g_iᵀ` and run a symmetric eigensolver.
    #[default]
    Exact,
    /// SVD of the weighted gradient matrix; never forms `C`. Preferred when the
    /// gradient dimension is large (feature spaces) and samples are few.
    LowRank,
}

/// Stationary covariance functions for the Gaussian-process ridge surface.
/// All carry one length scale per reduced coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum KernelKind {
    #[default]
    Rbf,
    /// `σ² (1 + r²/(2α))^(-α)`; `power = 1` gives the heavy-tailed kernel used
    /// for Laplace-like profiles.
    RationalQuadratic { power: f64 },
    /// Ornstein-Uhlenbeck / Matérn-1/2 kernel `σ² exp(-r)`.
    Exponential,
}

/// Regression surface fitted over the reduced coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RegressorKind {
    GaussianProcess {
        kernel: KernelKind,
    },
    RandomFeatureRidge {
        n_features: usize,
        length_scale: f64,
        regularization: f64,
        seed: u64,
    },
}

impl Default for RegressorKind {
    fn default() -> Self {
        RegressorKind::GaussianProcess {
            kernel: KernelKind::default(),
        }
    }
}

pub fn default_folds() -> usize {
    3
}

pub fn default_dimension() -> usize {
    1
}

pub fn default_shuffle_seed() -> Option<u64> {
    Some(42)
}

/// Everything an estimator needs besides the data: reduced dimension, how the
/// subspace is computed, which surface is fitted and how it is validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReductionConfig {
    /// Reduced dimension of the ridge surface (the `k` of the partition).
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    #[serde(default)]
    pub method: ComputeMethod,
    #[serde(default)]
    pub regressor: RegressorKind,
    #[serde(default = "default_folds")]
    pub folds: usize,
    /// `None` keeps folds contiguous in sample order.
    #[serde(default = "default_shuffle_seed")]
    pub shuffle_seed: Option<u64>,
    /// Evaluate folds on the rayon pool. Results do not depend on this flag.
    #[serde(default)]
    pub parallel: bool,
}

impl Default for ReductionConfig {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
            method: ComputeMethod::default(),
            regressor: RegressorKind::default(),
            folds: default_folds(),
            shuffle_seed: default_shuffle_seed(),
            parallel: false,
        }
    }
}

impl ReductionConfig {
    pub fn with_folds(mut self, folds: usize) -> Self {
        self.folds = folds;
        self
    }

    pub fn with_method(mut self, method: ComputeMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn with_regressor(mut self, regressor: RegressorKind) -> Self {
        self.regressor = regressor;
        self
    }
}
