#![deny(dead_code)]
#![deny(unused_imports)]

pub mod active;
pub mod cross_validation;
pub mod estimate;
pub mod feature_map;
mod kernel;
pub mod linalg;
pub mod nas;
pub mod normalizer;
pub mod radial;
pub mod regression;
pub mod sampling;
pub mod subspace;
pub mod tuning;
pub mod types;

pub use active::{ActiveSubspaces, BootstrapSummary, gradient_covariance, local_linear_gradients};
pub use cross_validation::{CrossValidationSummary, CrossValidator, k_fold_indices, nrmse};
pub use estimate::{Estimator, FittedRidge, ReductionError, SampleSet};
pub use feature_map::{FeatureMap, FeatureMapConfig, SpectralDistribution};
pub use nas::NonlinearActiveSubspaces;
pub use normalizer::Normalizer;
pub use regression::{
    GaussianProcess, GaussianProcessOptions, GpHyperparameters, Prediction, RandomFeatureRidge,
    Regressor, build_regressor,
};
pub use subspace::{ReducedSpace, SubspaceType};
pub use tuning::{
    BrentSearch, GridSearch, SearchOutcome, SearchRange, SearchStrategy, TuningConfig,
    TuningOutcome, tune,
};
pub use types::{ComputeMethod, KernelKind, ReductionConfig, RegressorKind};
