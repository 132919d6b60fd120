//! Cross-module properties of the filter, smoother and simulator.
//!
//! - covariances stay symmetric PSD through filtering and smoothing
//! - terminal smoothed estimate equals the terminal filtered estimate
//! - RMSE ordering on a tracking problem: smoothed <= filtered <= raw
//! - noise-free zero-input rollout reduces to `A^t x0`

use approx::assert_relative_eq;
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use ssm_inference::{ParameterSet, kalman_filter, rts_smoother, sample, simulate};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Constant-velocity tracker with a single (zero) input.
fn tracker(mu0: &[f64], sigma0: f64) -> ParameterSet {
    ParameterSet::new(
        DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0]),
        DMatrix::zeros(2, 1),
        DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
        DMatrix::zeros(1, 1),
        DMatrix::identity(2, 2) * 1e-3,
        DMatrix::from_row_slice(1, 1, &[1e-2]),
        DVector::from_row_slice(mu0),
        DMatrix::identity(2, 2) * sigma0,
    )
    .unwrap()
}

fn zero_inputs(t_max: usize) -> Vec<DVector<f64>> {
    vec![DVector::zeros(1); t_max]
}

fn rmse(estimates: &[DVector<f64>], truth: &[DVector<f64>], component: usize) -> f64 {
    let sse: f64 = estimates
        .iter()
        .zip(truth)
        .map(|(e, x)| (e[component] - x[component]).powi(2))
        .sum();
    (sse / estimates.len() as f64).sqrt()
}

fn min_eig(m: &DMatrix<f64>) -> f64 {
    SymmetricEigen::new(m.clone()).eigenvalues.min()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn covariances_are_symmetric_psd() {
    let params = ParameterSet::new(
        DMatrix::from_row_slice(2, 2, &[0.95, 0.2, -0.1, 0.7]),
        DMatrix::from_row_slice(2, 1, &[1.0, 0.0]),
        DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]),
        DMatrix::from_row_slice(3, 1, &[0.0, 0.1, 0.0]),
        DMatrix::from_row_slice(2, 2, &[0.05, 0.01, 0.01, 0.02]),
        DMatrix::identity(3, 3) * 0.1,
        DVector::zeros(2),
        DMatrix::identity(2, 2) * 5.0,
    )
    .unwrap();

    let mut rng = StdRng::seed_from_u64(17);
    let noise = Normal::new(0.0, 1.0).unwrap();
    let us: Vec<DVector<f64>> =
        (0..80).map(|_| DVector::from_row_slice(&[noise.sample(&mut rng)])).collect();
    let mut ys = sample(&params, &us, 18).unwrap().outputs;
    // Sprinkle missing entries.
    for t in (0..80).step_by(7) {
        ys[t][t % 3] = f64::NAN;
    }

    let fr = kalman_filter(&params, &ys, &us).unwrap();
    let sr = rts_smoother(&params, &fr).unwrap();

    for covs in [&fr.predicted_covs, &fr.filtered_covs, &sr.smoothed_covs] {
        for p in covs.iter() {
            assert_eq!(p, &p.transpose());
            assert!(min_eig(p) >= -1e-10, "min eigenvalue {}", min_eig(p));
        }
    }
}

#[test]
fn terminal_smoothed_equals_filtered_with_inputs() {
    let params = tracker(&[0.0, 1.0], 1.0)
        .with_prior(DVector::from_row_slice(&[0.5, 0.5]), DMatrix::identity(2, 2))
        .unwrap();
    let us = zero_inputs(30);
    let ys = sample(&params, &us, 3).unwrap().outputs;
    let fr = kalman_filter(&params, &ys, &us).unwrap();
    let sr = rts_smoother(&params, &fr).unwrap();
    assert_eq!(sr.smoothed_means.last(), fr.filtered_means.last());
    assert_eq!(sr.smoothed_covs.last(), fr.filtered_covs.last());
}

#[test]
fn tracking_smoother_beats_filter_beats_raw() {
    // Truth starts exactly at [0, 1]; the estimator uses a loose prior there.
    let truth = tracker(&[0.0, 1.0], 0.0);
    let model = tracker(&[0.0, 1.0], 0.1);
    let us = zero_inputs(50);

    let (mut raw, mut filt, mut smooth) = (0.0, 0.0, 0.0);
    for seed in 0..5u64 {
        let draw = sample(&truth, &us, seed).unwrap();
        let xs = &draw.states[..50];
        let fr = kalman_filter(&model, &draw.outputs, &us).unwrap();
        let sr = rts_smoother(&model, &fr).unwrap();

        let e_filt = rmse(&fr.filtered_means, xs, 0);
        let e_smooth = rmse(&sr.smoothed_means, xs, 0);
        assert!(e_smooth < e_filt, "seed {seed}: smoothed {e_smooth} vs filtered {e_filt}");

        raw += rmse(&draw.outputs, xs, 0);
        filt += e_filt;
        smooth += e_smooth;
    }
    assert!(smooth <= filt, "smoothed {smooth} vs filtered {filt}");
    assert!(filt <= raw, "filtered {filt} vs raw {raw}");
}

#[test]
fn zero_input_rollout_is_matrix_power() {
    let a = DMatrix::from_row_slice(2, 2, &[0.9, 0.3, -0.2, 0.8]);
    let params = ParameterSet::new(
        a.clone(),
        DMatrix::from_row_slice(2, 1, &[1.0, 2.0]),
        DMatrix::identity(2, 2),
        DMatrix::zeros(2, 1),
        DMatrix::identity(2, 2),
        DMatrix::identity(2, 2),
        DVector::zeros(2),
        DMatrix::identity(2, 2),
    )
    .unwrap();
    let x0 = DVector::from_row_slice(&[1.0, -2.0]);
    let sim = simulate(&params, &x0, &zero_inputs(12)).unwrap();

    assert_eq!(sim.states.len(), 13);
    assert_eq!(sim.outputs.len(), 12);
    let mut expected = x0.clone();
    for (t, x) in sim.states.iter().enumerate() {
        for i in 0..2 {
            assert_relative_eq!(x[i], expected[i], epsilon = 1e-12);
        }
        if t < 12 {
            assert_eq!(&sim.outputs[t], x);
        }
        expected = &a * expected;
    }
}
