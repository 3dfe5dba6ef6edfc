//! k-fold cross validation scored by normalized RMSE.

use crate::estimate::{ReductionError, SampleSet};
use crate::types::ReductionConfig;
use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Held-out outputs with a smaller population std than this are constant.
const DEGENERATE_STD: f64 = 1e-12;

/// Per-fold scores with their mean and population standard deviation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossValidationSummary {
    pub mean: f64,
    pub std: f64,
    pub fold_scores: Vec<f64>,
}

impl CrossValidationSummary {
    fn from_scores(fold_scores: Vec<f64>) -> Self {
        let n = fold_scores.len() as f64;
        let mean = fold_scores.iter().sum::<f64>() / n;
        let var = fold_scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        Self {
            mean,
            std: var.sqrt(),
            fold_scores,
        }
    }
}

/// Split `0..n` into `folds` disjoint groups whose sizes differ by at most one.
///
/// With a seed the indices are shuffled by `StdRng::seed_from_u64(seed)` first;
/// without one the groups are contiguous runs in sample order.
pub fn k_fold_indices(
    n: usize,
    folds: usize,
    seed: Option<u64>,
) -> Result<Vec<Vec<usize>>, ReductionError> {
    if folds < 2 {
        return Err(ReductionError::InvalidInput(format!(
            "cross validation needs at least 2 folds, got {folds}"
        )));
    }
    if folds > n {
        return Err(ReductionError::InvalidInput(format!(
            "{folds} folds requested for {n} samples"
        )));
    }
    let mut order: Vec<usize> = (0..n).collect();
    if let Some(seed) = seed {
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);
    }
    let base = n / folds;
    let extra = n % folds;
    let mut groups = Vec::with_capacity(folds);
    let mut start = 0;
    for f in 0..folds {
        let len = base + usize::from(f < extra);
        groups.push(order[start..start + len].to_vec());
        start += len;
    }
    Ok(groups)
}

/// `sqrt(mean((pred - actual)²)) / std(actual)` with the population std.
///
/// Constant `actual` yields [`ReductionError::DegenerateFold`] with fold 0;
/// [`CrossValidator`] rewrites the fold index.
pub fn nrmse(
    predicted: ArrayView1<'_, f64>,
    actual: ArrayView1<'_, f64>,
) -> Result<f64, ReductionError> {
    if predicted.len() != actual.len() || actual.is_empty() {
        return Err(ReductionError::InvalidInput(format!(
            "{} predictions for {} held-out outputs",
            predicted.len(),
            actual.len()
        )));
    }
    let n = actual.len() as f64;
    let mean = actual.sum() / n;
    let std = (actual.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / n).sqrt();
    if std.is_nan() || std <= DEGENERATE_STD {
        return Err(ReductionError::DegenerateFold { fold: 0, std });
    }
    let mse = predicted
        .iter()
        .zip(actual.iter())
        .map(|(p, a)| (p - a).powi(2))
        .sum::<f64>()
        / n;
    Ok(mse.sqrt() / std)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossValidator {
    folds: usize,
    shuffle_seed: Option<u64>,
    parallel: bool,
}

impl CrossValidator {
    pub fn new(folds: usize, shuffle_seed: Option<u64>) -> Self {
        Self {
            folds,
            shuffle_seed,
            parallel: false,
        }
    }

    pub fn from_config(config: &ReductionConfig) -> Self {
        Self {
            folds: config.folds,
            shuffle_seed: config.shuffle_seed,
            parallel: config.parallel,
        }
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn folds(&self) -> usize {
        self.folds
    }

    /// Train on all groups but one, predict the held-out group, score it.
    ///
    /// `fit_and_predict(train, test_inputs)` returns predicted means for the
    /// test rows.
    pub fn run<F>(
        &self,
        samples: &SampleSet,
        fit_and_predict: F,
    ) -> Result<CrossValidationSummary, ReductionError>
    where
        F: Fn(&SampleSet, ArrayView2<'_, f64>) -> Result<Array1<f64>, ReductionError> + Sync,
    {
        let groups = k_fold_indices(samples.len(), self.folds, self.shuffle_seed)?;
        let score_fold = |fold: usize| -> Result<f64, ReductionError> {
            let train_idx: Vec<usize> = groups
                .iter()
                .enumerate()
                .filter(|(g, _)| *g != fold)
                .flat_map(|(_, idx)| idx.iter().copied())
                .collect();
            let train = samples.subset(&train_idx)?;
            let test = samples.subset(&groups[fold])?;
            let predicted = fit_and_predict(&train, test.inputs())?;
            let score = nrmse(predicted.view(), test.outputs()).map_err(|err| match err {
                ReductionError::DegenerateFold { std, .. } => {
                    ReductionError::DegenerateFold { fold, std }
                }
                other => other,
            })?;
            log::debug!("fold {}/{}: NRMSE {:.4e}", fold + 1, self.folds, score);
            Ok(score)
        };

        let scores = if self.parallel {
            (0..self.folds)
                .into_par_iter()
                .map(score_fold)
                .collect::<Result<Vec<_>, _>>()?
        } else {
            (0..self.folds)
                .map(score_fold)
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(CrossValidationSummary::from_scores(scores))
    }
}
