//! Parallel EM fitting over independent datasets.
//!
//! Each dataset is fit with the same state dimension, prior and configuration.
//! Work is spread with Rayon `par_iter` (the caller's thread pool). Failures are
//! reported per dataset and never abort the batch.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use ssm_core::Result;

use crate::em::{EmConfig, EmResult, em_fit};

/// One observation/input sequence pair.
#[derive(Debug, Clone)]
pub struct EmDataset {
    /// Observations `y_0..y_{T-1}`.
    pub ys: Vec<DVector<f64>>,
    /// Inputs `u_0..u_{T-1}`.
    pub us: Vec<DVector<f64>>,
}

/// Fit every dataset independently; results keep the input order.
pub fn em_fit_batch(
    datasets: &[EmDataset],
    nx: usize,
    mu0: &DVector<f64>,
    sigma0: &DMatrix<f64>,
    cfg: &EmConfig,
) -> Vec<Result<EmResult>> {
    datasets
        .par_iter()
        .enumerate()
        .map(|(i, ds)| {
            let res = em_fit(&ds.ys, &ds.us, nx, mu0, sigma0, cfg);
            if let Err(e) = &res {
                log::debug!("EM batch dataset {i} failed: {e}");
            }
            res
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ParameterSet, no_inputs};
    use crate::simulate::sample;
    use ssm_core::Error;

    #[test]
    fn test_batch_matches_sequential_and_isolates_failures() {
        let truth = ParameterSet::ar1(0.8, 0.05, 0.05, 0.0, 1.0).unwrap();
        let mut datasets: Vec<EmDataset> = (0..3)
            .map(|seed| {
                let us = no_inputs(60);
                let ys = sample(&truth, &us, seed).unwrap().outputs;
                EmDataset { ys, us }
            })
            .collect();
        datasets.push(EmDataset { ys: vec![DVector::zeros(1)], us: no_inputs(1) });

        let mu0 = DVector::zeros(1);
        let sigma0 = DMatrix::identity(1, 1);
        let cfg = EmConfig { n_iter: 5, ..Default::default() };
        let out = em_fit_batch(&datasets, 1, &mu0, &sigma0, &cfg);

        assert_eq!(out.len(), 4);
        for (ds, res) in datasets.iter().zip(&out).take(3) {
            let seq = em_fit(&ds.ys, &ds.us, 1, &mu0, &sigma0, &cfg).unwrap();
            let par = res.as_ref().unwrap();
            assert_eq!(par.loglik_trace, seq.loglik_trace);
        }
        assert!(matches!(out[3], Err(Error::InsufficientData { n: 1, min: 2 })));
    }
}
