use crate::active::ActiveSubspaces;
use crate::estimate::ReductionError;
use crate::feature_map::FeatureMap;
use crate::nas::NonlinearActiveSubspaces;
use crate::types::ComputeMethod;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// A fitted map from the input space to `k` reduced coordinates.
pub trait ReducedSpace: Send + Sync {
    /// Decompose the gradients and keep a `dim`-dimensional active block.
    fn fit(
        &mut self,
        inputs: ArrayView2<'_, f64>,
        gradients: ArrayView2<'_, f64>,
        weights: Option<ArrayView1<'_, f64>>,
        dim: usize,
    ) -> Result<(), ReductionError>;

    /// Reduced coordinates of each input row, shape (M, dim).
    fn reduce(&self, inputs: ArrayView2<'_, f64>) -> Result<Array2<f64>, ReductionError>;

    fn eigenvalues(&self) -> Option<&Array1<f64>>;
}

impl ReducedSpace for ActiveSubspaces {
    fn fit(
        &mut self,
        _inputs: ArrayView2<'_, f64>,
        gradients: ArrayView2<'_, f64>,
        weights: Option<ArrayView1<'_, f64>>,
        dim: usize,
    ) -> Result<(), ReductionError> {
        self.compute(gradients, weights)?;
        self.partition(dim)
    }

    fn reduce(&self, inputs: ArrayView2<'_, f64>) -> Result<Array2<f64>, ReductionError> {
        self.project(inputs)
    }

    fn eigenvalues(&self) -> Option<&Array1<f64>> {
        ActiveSubspaces::eigenvalues(self)
    }
}

impl ReducedSpace for NonlinearActiveSubspaces {
    fn fit(
        &mut self,
        inputs: ArrayView2<'_, f64>,
        gradients: ArrayView2<'_, f64>,
        weights: Option<ArrayView1<'_, f64>>,
        dim: usize,
    ) -> Result<(), ReductionError> {
        self.compute(inputs, gradients, weights)?;
        self.partition(dim)
    }

    fn reduce(&self, inputs: ArrayView2<'_, f64>) -> Result<Array2<f64>, ReductionError> {
        self.project(inputs)
    }

    fn eigenvalues(&self) -> Option<&Array1<f64>> {
        self.feature_space().eigenvalues()
    }
}

/// Which reduction an estimator fits: linear active subspaces, or nonlinear
/// ones through a (usually tuned) feature map.
#[derive(Debug, Clone)]
pub enum SubspaceType {
    Active,
    Nonlinear(FeatureMap),
}

impl SubspaceType {
    /// A fresh, unfitted reduction of this type.
    pub fn build(&self, method: ComputeMethod) -> Box<dyn ReducedSpace> {
        match self {
            SubspaceType::Active => Box::new(ActiveSubspaces::new(method)),
            SubspaceType::Nonlinear(fm) => {
                Box::new(NonlinearActiveSubspaces::new(fm.clone(), method))
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SubspaceType::Active => "AS",
            SubspaceType::Nonlinear(_) => "NAS",
        }
    }
}
