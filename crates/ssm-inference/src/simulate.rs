//! Forward rollout of a [`ParameterSet`] under a given input sequence.
//!
//! - [`simulate`]: deterministic mean path, no noise. This is the plant-response
//!   predictor for controllers and guardrail checks.
//! - [`sample`]: one stochastic draw, for synthetic data.
//!
//! Both follow `x_{t+1} = A x_t + B u_t`, `y_t = C x_t + D u_t` and return
//! `T + 1` states and `T` outputs.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use ssm_core::{Error, Result};

use crate::internal::{check_len, symmetrize};
use crate::params::ParameterSet;

/// Deterministic rollout output.
#[derive(Debug, Clone)]
pub struct SimulationTrace {
    /// States `x_0..x_T` (length T+1, each nx).
    pub states: Vec<DVector<f64>>,
    /// Outputs `y_0..y_{T-1}` (length T, each ny).
    pub outputs: Vec<DVector<f64>>,
}

/// Stochastic draw output.
#[derive(Debug, Clone)]
pub struct SampleTrace {
    /// Latent states `x_0..x_T` (length T+1, each nx).
    pub states: Vec<DVector<f64>>,
    /// Noisy observations `y_0..y_{T-1}` (length T, each ny).
    pub outputs: Vec<DVector<f64>>,
}

fn check_inputs(params: &ParameterSet, us: &[DVector<f64>]) -> Result<()> {
    let nu = params.nu();
    for (t, u) in us.iter().enumerate() {
        check_len(&format!("u[{t}]"), u, nu)?;
        if u.iter().any(|v| !v.is_finite()) {
            return Err(Error::Validation(format!("u[{t}] must be finite")));
        }
    }
    Ok(())
}

/// Noise-free rollout from `x0` under `us`.
///
/// An empty input sequence yields just `[x0]` and no outputs.
pub fn simulate(
    params: &ParameterSet,
    x0: &DVector<f64>,
    us: &[DVector<f64>],
) -> Result<SimulationTrace> {
    check_len("x0", x0, params.nx())?;
    if x0.iter().any(|v| !v.is_finite()) {
        return Err(Error::Validation("x0 must be finite".to_string()));
    }
    check_inputs(params, us)?;

    let mut states = Vec::with_capacity(us.len() + 1);
    let mut outputs = Vec::with_capacity(us.len());
    states.push(x0.clone());
    for (t, u) in us.iter().enumerate() {
        let x = &states[t];
        outputs.push(params.output(x, u));
        let next = params.transition(x, u);
        states.push(next);
    }

    Ok(SimulationTrace { states, outputs })
}

/// Square-root factor `L` with `L L^T = cov`.
///
/// Cholesky when `cov` is positive definite; otherwise a clipped eigen
/// factorization so that PSD-but-singular covariances (e.g. `Q = 0`) still sample.
fn sqrt_factor(cov: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    if let Some(chol) = cov.clone().cholesky() {
        return Ok(chol.l());
    }
    let eig = SymmetricEigen::new(symmetrize(cov));
    let scale = cov.amax().max(1.0);
    if eig.eigenvalues.iter().any(|&l| l < -1e-10 * scale) {
        return Err(Error::NumericalInstability(
            "covariance is not positive semi-definite".to_string(),
        ));
    }
    let sqrt_l = DMatrix::from_diagonal(&eig.eigenvalues.map(|l| l.max(0.0).sqrt()));
    Ok(eig.eigenvectors * sqrt_l)
}

fn standard_normal(rng: &mut StdRng, n: usize) -> DVector<f64> {
    DVector::from_iterator(n, (0..n).map(|_| StandardNormal.sample(rng)))
}

/// Draw one trajectory: `x_0 ~ N(mu0, Sigma0)`, then process and observation noise.
pub fn sample(params: &ParameterSet, us: &[DVector<f64>], seed: u64) -> Result<SampleTrace> {
    if us.is_empty() {
        return Err(Error::Validation("us must be non-empty".to_string()));
    }
    check_inputs(params, us)?;

    let n = params.nx();
    let m = params.ny();
    let l0 = sqrt_factor(params.sigma0())?;
    let lq = sqrt_factor(params.q())?;
    let lr = sqrt_factor(params.r())?;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut states = Vec::with_capacity(us.len() + 1);
    let mut outputs = Vec::with_capacity(us.len());

    states.push(params.mu0() + &l0 * standard_normal(&mut rng, n));
    for (t, u) in us.iter().enumerate() {
        let x = &states[t];
        let y = params.output(x, u) + &lr * standard_normal(&mut rng, m);
        let next = params.transition(x, u) + &lq * standard_normal(&mut rng, n);
        outputs.push(y);
        states.push(next);
    }

    Ok(SampleTrace { states, outputs })
}
