//! Linear and nonlinear active subspaces of an 8-dimensional paraboloid.
//!
//! Run with `cargo run --release --example hyperparaboloid`.

use active_subspaces::radial::{dparaboloid, paraboloid, radial, radial_gradient};
use active_subspaces::sampling::uniform_samples;
use active_subspaces::{
    ActiveSubspaces, ComputeMethod, Estimator, FeatureMap, FeatureMapConfig, GridSearch,
    Normalizer, ReductionConfig, ReductionError, SampleSet, SearchRange, TuningConfig, tune,
};
use ndarray::{Array1, array};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use std::f64::consts::TAU;

const N_SAMPLES: usize = 300;
const INPUT_DIM: usize = 8;
const N_FEATURES: usize = 1000;
const FOLDS: usize = 3;
const SEED: u64 = 42;

fn main() -> Result<(), ReductionError> {
    let lower = Array1::from_elem(INPUT_DIM, -1.0);
    let upper = Array1::from_elem(INPUT_DIM, 1.0);
    let raw = uniform_samples(&lower, &upper, N_SAMPLES, SEED)?;
    let normalizer = Normalizer::new(lower, upper)?;
    let inputs = normalizer.normalize(raw.view())?;

    let outputs = radial(paraboloid, inputs.view(), &normalizer)?;
    let gradients = radial_gradient(dparaboloid, inputs.view(), &normalizer)?;

    let mut subspace = ActiveSubspaces::new(ComputeMethod::Exact);
    subspace.compute(gradients.view(), None)?;
    subspace.partition(2)?;
    if let Some(values) = subspace.eigenvalues() {
        println!("AS eigenvalues: {:.4}", values);
    }

    let output_variance = outputs.var(0.0);
    let samples = SampleSet::new(inputs, outputs, gradients)?;
    let config = ReductionConfig::default().with_folds(FOLDS).with_dimension(1);
    let summary = Estimator::active(config.clone()).cross_validation(&samples)?;
    println!("AS: mean {}, std {}", summary.mean, summary.std);

    let mut rng = StdRng::seed_from_u64(SEED);
    let phases = Array1::from_shape_fn(N_FEATURES, |_| rng.random_range(0.0..TAU));
    let fm_config = FeatureMapConfig {
        sigma_f: output_variance,
        ..FeatureMapConfig::new(INPUT_DIM, N_FEATURES)
    };
    let mut feature_map = FeatureMap::with_phases(&fm_config, array![1.0], phases, &mut rng)?;

    let nas_config = config.with_method(ComputeMethod::LowRank);
    let tuning = TuningConfig::new(
        vec![SearchRange::new(-2.0, 1.0)],
        nas_config.clone().with_folds(2),
    );
    let outcome = tune(&samples, &mut feature_map, &tuning, &GridSearch::default())?;
    println!(
        "Best params are {}, corresponding NRMSE is {}",
        outcome.params, outcome.value
    );
    println!("Is feature map tuned? {}", feature_map.is_tuned());

    let summary = Estimator::nonlinear(feature_map, nas_config).cross_validation(&samples)?;
    println!("NAS: mean {}, std {}", summary.mean, summary.std);
    Ok(())
}
