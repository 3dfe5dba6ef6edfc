//! Feature-map hyperparameter search by cross-validated NRMSE.
//!
//! Search points live in `log10` space: a point `t` is evaluated with length
//! scales `10^t`, and the tuned map is frozen at `10^t*`.

use crate::estimate::{Estimator, ReductionError, SampleSet};
use crate::feature_map::FeatureMap;
use crate::types::ReductionConfig;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Golden-section ratio `(3 - √5) / 2`.
const GOLDEN: f64 = 0.381_966_011_250_105;

/// Closed interval `[low, high]` of one search coordinate, optionally stepped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchRange {
    pub low: f64,
    pub high: f64,
    #[serde(default)]
    pub step: Option<f64>,
}

impl SearchRange {
    pub fn new(low: f64, high: f64) -> Self {
        Self {
            low,
            high,
            step: None,
        }
    }

    pub fn with_step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }

    fn validate(&self) -> Result<(), ReductionError> {
        if !(self.low.is_finite() && self.high.is_finite() && self.low < self.high) {
            return Err(ReductionError::InvalidInput(format!(
                "search range needs finite low < high, got ({}, {})",
                self.low, self.high
            )));
        }
        if let Some(step) = self.step
            && !(step.is_finite() && step > 0.0)
        {
            return Err(ReductionError::InvalidInput(format!(
                "search step must be positive, got {step}"
            )));
        }
        Ok(())
    }

    /// Grid points along this axis: `low, low + step, ..` up to `high` when a
    /// step is set, otherwise `points` evenly spaced values including both ends.
    pub fn grid(&self, points: usize) -> Result<Vec<f64>, ReductionError> {
        self.validate()?;
        let span = self.high - self.low;
        match self.step {
            Some(step) => {
                let count = (span / step + 1e-9).floor() as usize + 1;
                Ok((0..count)
                    .map(|i| (self.low + i as f64 * step).min(self.high))
                    .collect())
            }
            None => match points {
                0 => Err(ReductionError::InvalidInput(
                    "grid search needs at least one point per axis".to_string(),
                )),
                1 => Ok(vec![0.5 * (self.low + self.high)]),
                _ => Ok((0..points)
                    .map(|i| (self.low + span * i as f64 / (points - 1) as f64).min(self.high))
                    .collect()),
            },
        }
    }
}

/// Best point found by a search and the number of objective evaluations.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub point: Array1<f64>,
    pub value: f64,
    pub evaluations: usize,
}

/// Objective of a search. `Err` aborts the search.
pub type SearchObjective<'a> = dyn FnMut(&Array1<f64>) -> Result<f64, ReductionError> + 'a;

/// A policy for minimizing an objective over a box of [`SearchRange`]s.
pub trait SearchStrategy {
    fn minimize(
        &self,
        ranges: &[SearchRange],
        objective: &mut SearchObjective<'_>,
    ) -> Result<SearchOutcome, ReductionError>;
}

fn sanitize(value: f64) -> f64 {
    if value.is_nan() { f64::INFINITY } else { value }
}

/// Exhaustive scan of the cartesian grid. Ties keep the earliest point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSearch {
    pub points_per_axis: usize,
}

impl Default for GridSearch {
    fn default() -> Self {
        Self { points_per_axis: 10 }
    }
}

impl SearchStrategy for GridSearch {
    fn minimize(
        &self,
        ranges: &[SearchRange],
        objective: &mut SearchObjective<'_>,
    ) -> Result<SearchOutcome, ReductionError> {
        if ranges.is_empty() {
            return Err(ReductionError::InvalidInput(
                "grid search needs at least one range".to_string(),
            ));
        }
        let axes = ranges
            .iter()
            .map(|r| r.grid(self.points_per_axis))
            .collect::<Result<Vec<_>, _>>()?;
        let dims = axes.len();
        let mut cursor = vec![0usize; dims];
        let mut best: Option<SearchOutcome> = None;
        let mut evaluations = 0;
        loop {
            let point = Array1::from_shape_fn(dims, |j| axes[j][cursor[j]]);
            let value = sanitize(objective(&point)?);
            evaluations += 1;
            log::debug!("grid point {:?}: {:.4e}", point.to_vec(), value);
            if best.as_ref().is_none_or(|b| value < b.value) {
                best = Some(SearchOutcome {
                    point,
                    value,
                    evaluations: 0,
                });
            }

            // odometer increment, last axis fastest
            let mut axis = dims;
            loop {
                if axis == 0 {
                    let mut outcome = best.ok_or(ReductionError::TuningDidNotConverge {
                        evaluations,
                    })?;
                    outcome.evaluations = evaluations;
                    return Ok(outcome);
                }
                axis -= 1;
                cursor[axis] += 1;
                if cursor[axis] < axes[axis].len() {
                    break;
                }
                cursor[axis] = 0;
            }
        }
    }
}

/// Brent's bounded minimizer (golden section with parabolic steps), 1-D only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BrentSearch {
    /// Tolerance on the abscissa, relative to `1 + |x|`.
    pub tol: f64,
    pub max_iter: usize,
}

impl Default for BrentSearch {
    fn default() -> Self {
        Self {
            tol: 1e-3,
            max_iter: 50,
        }
    }
}

impl SearchStrategy for BrentSearch {
    fn minimize(
        &self,
        ranges: &[SearchRange],
        objective: &mut SearchObjective<'_>,
    ) -> Result<SearchOutcome, ReductionError> {
        let [range] = ranges else {
            return Err(ReductionError::InvalidInput(format!(
                "Brent search is one-dimensional, got {} ranges",
                ranges.len()
            )));
        };
        range.validate()?;
        let mut evaluations = 0;
        let mut eval = |t: f64, evaluations: &mut usize| -> Result<f64, ReductionError> {
            *evaluations += 1;
            let value = sanitize(objective(&Array1::from_elem(1, t))?);
            log::debug!("brent point {:.4}: {:.4e}", t, value);
            Ok(value)
        };

        let (mut a, mut b) = (range.low, range.high);
        let mut x = a + GOLDEN * (b - a);
        let (mut w, mut v) = (x, x);
        let mut fx = eval(x, &mut evaluations)?;
        let (mut fw, mut fv) = (fx, fx);
        let mut d: f64 = 0.0;
        let mut e: f64 = 0.0;

        for _ in 0..self.max_iter {
            let mid = 0.5 * (a + b);
            let tol1 = self.tol * (x.abs() + 1.0);
            let tol2 = 2.0 * tol1;
            if (x - mid).abs() <= tol2 - 0.5 * (b - a) {
                return Ok(SearchOutcome {
                    point: Array1::from_elem(1, x),
                    value: fx,
                    evaluations,
                });
            }

            let mut golden_step = true;
            if e.abs() > tol1 {
                let r = (x - w) * (fx - fv);
                let q = (x - v) * (fx - fw);
                let p = (x - v) * q - (x - w) * r;
                let q = 2.0 * (q - r);
                let (p, q) = if q > 0.0 { (-p, q) } else { (p, -q) };
                let e_old = e;
                e = d;
                // parabolic step only when it stays inside and shrinks
                if p.abs() < (0.5 * q * e_old).abs() && p > q * (a - x) && p < q * (b - x) {
                    d = p / q;
                    let u = x + d;
                    if u - a < tol2 || b - u < tol2 {
                        d = if x < mid { tol1 } else { -tol1 };
                    }
                    golden_step = false;
                }
            }
            if golden_step {
                e = if x < mid { b - x } else { a - x };
                d = GOLDEN * e;
            }

            let u = if d.abs() >= tol1 {
                x + d
            } else if d > 0.0 {
                x + tol1
            } else {
                x - tol1
            };
            let fu = eval(u, &mut evaluations)?;

            if fu <= fx {
                if u < x {
                    b = x;
                } else {
                    a = x;
                }
                (v, fv) = (w, fw);
                (w, fw) = (x, fx);
                (x, fx) = (u, fu);
            } else {
                if u < x {
                    a = u;
                } else {
                    b = u;
                }
                if fu <= fw || w == x {
                    (v, fv) = (w, fw);
                    (w, fw) = (u, fu);
                } else if fu <= fv || v == x || v == w {
                    (v, fv) = (u, fu);
                }
            }
        }
        log::warn!(
            "Brent search stopped after {} iterations without meeting tol {:.1e}",
            self.max_iter,
            self.tol
        );
        Err(ReductionError::TuningDidNotConverge { evaluations })
    }
}

/// Search box (one range per feature-map parameter, in `log10`) and the
/// estimator settings the candidates are cross-validated with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningConfig {
    pub ranges: Vec<SearchRange>,
    #[serde(default)]
    pub reduction: ReductionConfig,
}

impl TuningConfig {
    pub fn new(ranges: Vec<SearchRange>, reduction: ReductionConfig) -> Self {
        Self { ranges, reduction }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TuningOutcome {
    /// Best search point `t*`; the map is frozen at `10^t*`.
    pub params: Array1<f64>,
    /// Mean cross-validated NRMSE at `t*`.
    pub value: f64,
    pub evaluations: usize,
}

/// Pick feature-map length scales minimizing the NAS cross-validation error
/// and freeze `feature_map` at them.
///
/// Candidates failing for numerical reasons score `+∞`; any other error
/// aborts the search.
pub fn tune(
    samples: &SampleSet,
    feature_map: &mut FeatureMap,
    config: &TuningConfig,
    strategy: &dyn SearchStrategy,
) -> Result<TuningOutcome, ReductionError> {
    if feature_map.is_tuned() {
        return Err(ReductionError::FeatureMapFrozen);
    }
    if config.ranges.len() != feature_map.n_params() {
        return Err(ReductionError::InvalidInput(format!(
            "{} search ranges for a feature map with {} parameters",
            config.ranges.len(),
            feature_map.n_params()
        )));
    }

    let outcome = {
        let template: &FeatureMap = feature_map;
        let mut objective = |t: &Array1<f64>| -> Result<f64, ReductionError> {
            let candidate = template.with_params(t.mapv(|v| 10f64.powf(v)))?;
            let estimator = Estimator::nonlinear(candidate, config.reduction.clone());
            match estimator.cross_validation(samples) {
                Ok(summary) => Ok(summary.mean),
                Err(err) if err.is_numerical() => {
                    log::warn!("Tuning candidate {:?} failed: {}", t.to_vec(), err);
                    Ok(f64::INFINITY)
                }
                Err(err) => Err(err),
            }
        };
        strategy.minimize(&config.ranges, &mut objective)?
    };

    if !outcome.value.is_finite() {
        return Err(ReductionError::TuningDidNotConverge {
            evaluations: outcome.evaluations,
        });
    }
    feature_map.freeze(outcome.point.mapv(|v| 10f64.powf(v)))?;
    log::debug!(
        "tuned feature map: t* = {:?}, CV NRMSE {:.4e} after {} evaluations",
        outcome.point.to_vec(),
        outcome.value,
        outcome.evaluations
    );
    Ok(TuningOutcome {
        params: outcome.point,
        value: outcome.value,
        evaluations: outcome.evaluations,
    })
}
