use active_subspaces::linalg::faer_ndarray::FaerEigh;
use active_subspaces::radial::{dparaboloid, paraboloid, radial, radial_gradient};
use active_subspaces::sampling::uniform_samples;
use active_subspaces::{
    ActiveSubspaces, ComputeMethod, Estimator, KernelKind, Normalizer, ReductionConfig,
    RegressorKind, SampleSet,
};
use approx::assert_abs_diff_eq;
use ndarray::{Array1, Array2};

fn paraboloid_samples(n: usize, m: usize, seed: u64) -> (Normalizer, SampleSet) {
    let lower = Array1::from_elem(m, -1.0);
    let upper = Array1::from_elem(m, 1.0);
    let raw = uniform_samples(&lower, &upper, n, seed).expect("uniform samples");
    let normalizer = Normalizer::new(lower, upper).expect("bounds are valid");
    let x = normalizer.normalize(raw.view()).expect("samples lie in bounds");
    let f = radial(paraboloid, x.view(), &normalizer).expect("paraboloid");
    let df = radial_gradient(dparaboloid, x.view(), &normalizer).expect("paraboloid gradient");
    let samples = SampleSet::new(x, f, df).expect("aligned samples");
    (normalizer, samples)
}

#[test]
fn normalizer_round_trips_samples() {
    let (normalizer, samples) = paraboloid_samples(50, 4, 3);
    let back = normalizer
        .normalize(normalizer.denormalize(samples.inputs()).expect("denormalize").view())
        .expect("normalize");
    for (a, b) in back.iter().zip(samples.inputs().iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-12);
    }
}

#[test]
fn exact_decomposition_of_paraboloid_gradients() {
    let (_, samples) = paraboloid_samples(300, 8, 42);
    let mut ss = ActiveSubspaces::new(ComputeMethod::Exact);
    ss.compute(samples.gradients(), None).expect("decomposition");
    ss.partition(2).expect("partition");

    let values = ss.eigenvalues().expect("eigenvalues");
    assert_eq!(values.len(), 8);
    let (raw, _) = ss
        .covariance()
        .expect("exact mode keeps C")
        .eigh_descending()
        .expect("eigh");
    assert!(raw.iter().all(|v| *v >= -1e-10), "{raw:?}");
    assert!(values.iter().zip(values.iter().skip(1)).all(|(a, b)| a >= b));

    let w1 = ss.active_basis().expect("W1");
    let w2 = ss.inactive_basis().expect("W2");
    assert_eq!(w1.dim(), (8, 2));
    assert_eq!(w2.dim(), (8, 6));
    let cross = w1.t().dot(w2);
    for (w, k) in [(w1, 2), (w2, 6)] {
        let gram = w.t().dot(w);
        for (a, b) in gram.iter().zip(Array2::<f64>::eye(k).iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }
    assert!(cross.iter().all(|v| v.abs() < 1e-10));

    // radial function: no preferred direction, the spectrum is nearly flat
    let ratio = values[0] / values[7];
    assert!(ratio < 3.0, "eigenvalue ratio {ratio}");
}

#[test]
fn three_fold_cross_validation_of_one_dimensional_ridge() {
    let (_, samples) = paraboloid_samples(300, 8, 42);
    let config = ReductionConfig::default().with_folds(3).with_dimension(1);
    let summary = Estimator::active(config).cross_validation(&samples).expect("cv");
    assert_eq!(summary.fold_scores.len(), 3);
    assert!(summary.mean.is_finite() && summary.mean >= 0.0);
    assert!(summary.std.is_finite() && summary.std >= 0.0);
}

#[test]
fn alternative_kernels_cross_validate() {
    let (_, samples) = paraboloid_samples(120, 8, 42);
    for kernel in [
        KernelKind::RationalQuadratic { power: 1.0 },
        KernelKind::Exponential,
    ] {
        let config = ReductionConfig::default()
            .with_folds(3)
            .with_regressor(RegressorKind::GaussianProcess { kernel });
        let summary = Estimator::active(config).cross_validation(&samples).expect("cv");
        assert!(summary.mean.is_finite() && summary.mean >= 0.0);
    }
}

#[test]
fn parallel_folds_match_sequential_folds() {
    let (_, samples) = paraboloid_samples(90, 4, 8);
    let config = ReductionConfig::default().with_folds(3);
    let seq = Estimator::active(config.clone())
        .cross_validation(&samples)
        .expect("sequential");
    let par = Estimator::active(ReductionConfig {
        parallel: true,
        ..config
    })
    .cross_validation(&samples)
    .expect("parallel");
    assert_eq!(seq.fold_scores, par.fold_scores);
}
