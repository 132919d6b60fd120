//! Causal Kalman filter for linear-Gaussian state-space models with inputs.
//!
//! Conventions: `(mu0, Sigma0)` is the prior on `x_0`, so the prediction at
//! `t = 0` is the prior itself; for `t >= 1` the prediction is driven by
//! `u_{t-1}`. The output at `t` uses `u_t` through `D`.
//!
//! Missing observations are NaN entries of `y_t`; the update then uses only
//! the observed rows of `C`, `D` and `R`.

use nalgebra::{DMatrix, DVector};
use ssm_core::{Error, Result};

use crate::internal::{LN_2PI, symmetrize};
use crate::params::{ParameterSet, input_term};

/// Kalman filter output, one entry per timestep in increasing time order.
#[derive(Debug, Clone)]
pub struct FilterTrace {
    /// Total log-likelihood `log p(y_0..y_{T-1} | u)`.
    pub log_likelihood: f64,
    /// Prior means `m_{t|t-1}`.
    pub predicted_means: Vec<DVector<f64>>,
    /// Prior covariances `P_{t|t-1}`.
    pub predicted_covs: Vec<DMatrix<f64>>,
    /// Posterior means `m_{t|t}`.
    pub filtered_means: Vec<DVector<f64>>,
    /// Posterior covariances `P_{t|t}`.
    pub filtered_covs: Vec<DMatrix<f64>>,
    /// Kalman gains `K_t` (nx x ny). Columns of missing outputs are zero.
    pub gains: Vec<DMatrix<f64>>,
    /// Innovations `y_t - (C m_{t|t-1} + D u_t)`. Missing entries are zero.
    pub innovations: Vec<DVector<f64>>,
    /// Innovation covariances `S_t` (ny x ny). Rows/cols of missing outputs are zero.
    pub innovation_covs: Vec<DMatrix<f64>>,
}

impl FilterTrace {
    /// Number of timesteps.
    pub fn len(&self) -> usize {
        self.filtered_means.len()
    }

    /// Whether the trace is empty.
    pub fn is_empty(&self) -> bool {
        self.filtered_means.is_empty()
    }
}

/// Observation system restricted to the non-missing rows of `y_t`.
#[derive(Debug, Clone)]
pub(crate) struct ReducedObservation {
    pub(crate) obs_idx: Vec<usize>,
    pub(crate) y: DVector<f64>,
    pub(crate) c: DMatrix<f64>,
    pub(crate) d: DMatrix<f64>,
    pub(crate) r: DMatrix<f64>,
}

/// Returns `None` when every entry of `y` is missing.
pub(crate) fn reduce_observation(
    params: &ParameterSet,
    y: &DVector<f64>,
) -> Option<ReducedObservation> {
    let obs_idx: Vec<usize> = (0..y.len()).filter(|&i| y[i].is_finite()).collect();
    if obs_idx.is_empty() {
        return None;
    }
    if obs_idx.len() == y.len() {
        return Some(ReducedObservation {
            obs_idx,
            y: y.clone(),
            c: params.c().clone(),
            d: params.d().clone(),
            r: params.r().clone(),
        });
    }

    let y_obs = DVector::from_iterator(obs_idx.len(), obs_idx.iter().map(|&i| y[i]));
    Some(ReducedObservation {
        y: y_obs,
        c: params.c().select_rows(obs_idx.iter()),
        d: params.d().select_rows(obs_idx.iter()),
        r: params.r().select_rows(obs_idx.iter()).select_columns(obs_idx.iter()),
        obs_idx,
    })
}

/// Run the Kalman filter over a full observation/input sequence.
///
/// Fails with [`Error::ShapeMismatch`] before any computation when shapes
/// disagree, and with [`Error::NumericalInstability`] ("ill-conditioned
/// filter") when an innovation covariance is not positive definite.
pub fn kalman_filter(
    params: &ParameterSet,
    ys: &[DVector<f64>],
    us: &[DVector<f64>],
) -> Result<FilterTrace> {
    params.validate_sequences(ys, us)?;

    let n = params.nx();
    let m = params.ny();
    let t_max = ys.len();

    let mut predicted_means = Vec::with_capacity(t_max);
    let mut predicted_covs = Vec::with_capacity(t_max);
    let mut filtered_means: Vec<DVector<f64>> = Vec::with_capacity(t_max);
    let mut filtered_covs: Vec<DMatrix<f64>> = Vec::with_capacity(t_max);
    let mut gains = Vec::with_capacity(t_max);
    let mut innovations = Vec::with_capacity(t_max);
    let mut innovation_covs = Vec::with_capacity(t_max);

    let identity = DMatrix::<f64>::identity(n, n);
    let mut loglik = 0.0f64;

    for t in 0..t_max {
        // Predict: x_t | y_{0..t-1}.
        let (m_pred, p_pred) = if t == 0 {
            (params.mu0().clone(), params.sigma0().clone())
        } else {
            let m_prev = &filtered_means[t - 1];
            let p_prev = &filtered_covs[t - 1];
            let m_pred = params.transition(m_prev, &us[t - 1]);
            let p_pred = params.a() * p_prev * params.a().transpose() + params.q();
            (m_pred, symmetrize(&p_pred))
        };

        let Some(red) = reduce_observation(params, &ys[t]) else {
            // Nothing observed: carry the prediction through.
            filtered_means.push(m_pred.clone());
            filtered_covs.push(p_pred.clone());
            predicted_means.push(m_pred);
            predicted_covs.push(p_pred);
            gains.push(DMatrix::zeros(n, m));
            innovations.push(DVector::zeros(m));
            innovation_covs.push(DMatrix::zeros(m, m));
            continue;
        };
        let mo = red.obs_idx.len();

        // Innovation: v = y - (C m_pred + D u)
        let y_hat = &red.c * &m_pred + input_term(&red.d, &us[t]);
        let v = &red.y - y_hat;

        // Innovation covariance: S = C P_pred C^T + R
        let s = symmetrize(&(&red.c * &p_pred * red.c.transpose() + &red.r));
        let chol = s.clone().cholesky().ok_or_else(|| {
            Error::NumericalInstability(format!(
                "ill-conditioned filter: innovation covariance is not positive definite at t={t}"
            ))
        })?;

        // Gain from S K^T = C P_pred (P_pred symmetric), no explicit inverse.
        let cp = &red.c * &p_pred;
        let k = chol.solve(&cp).transpose();
        if k.iter().any(|x| !x.is_finite()) {
            return Err(Error::NumericalInstability(format!(
                "ill-conditioned filter: non-finite Kalman gain at t={t}"
            )));
        }

        let s_inv_v = chol.solve(&v);
        let quad = v.dot(&s_inv_v);
        let l = chol.l();
        let mut logdet = 0.0;
        for i in 0..mo {
            let d = l[(i, i)];
            if d <= 0.0 || !d.is_finite() {
                return Err(Error::NumericalInstability(format!(
                    "ill-conditioned filter: invalid Cholesky diagonal at t={t}"
                )));
            }
            logdet += 2.0 * d.ln();
        }
        loglik += -0.5 * ((mo as f64) * LN_2PI + logdet + quad);

        let m_filt = &m_pred + &k * &v;

        // Joseph form: (I - K C) P (I - K C)^T + K R K^T. Equals (I - K C) P for the
        // optimal gain and stays symmetric PSD in floating point.
        let i_minus_kc = &identity - &k * &red.c;
        let p_filt = &i_minus_kc * &p_pred * i_minus_kc.transpose() + &k * &red.r * k.transpose();
        let p_filt = symmetrize(&p_filt);

        // Expand to full output dimension.
        let mut k_full = DMatrix::<f64>::zeros(n, m);
        let mut v_full = DVector::<f64>::zeros(m);
        let mut s_full = DMatrix::<f64>::zeros(m, m);
        for (ii, &i) in red.obs_idx.iter().enumerate() {
            k_full.set_column(i, &k.column(ii));
            v_full[i] = v[ii];
            for (jj, &j) in red.obs_idx.iter().enumerate() {
                s_full[(i, j)] = s[(ii, jj)];
            }
        }

        predicted_means.push(m_pred);
        predicted_covs.push(p_pred);
        filtered_means.push(m_filt);
        filtered_covs.push(p_filt);
        gains.push(k_full);
        innovations.push(v_full);
        innovation_covs.push(s_full);
    }

    Ok(FilterTrace {
        log_likelihood: loglik,
        predicted_means,
        predicted_covs,
        filtered_means,
        filtered_covs,
        gains,
        innovations,
        innovation_covs,
    })
}

/// Data log-likelihood under `params`, computed from the filter's innovations.
pub fn log_likelihood(
    params: &ParameterSet,
    ys: &[DVector<f64>],
    us: &[DVector<f64>],
) -> Result<f64> {
    Ok(kalman_filter(params, ys, us)?.log_likelihood)
}
