//! Rauch–Tung–Striebel fixed-interval smoother.
//!
//! Strict backward recurrence: step `t` consumes the already-smoothed `t+1`.
//! The returned trace is indexed `0..T` in input time order.

use nalgebra::{DMatrix, DVector};
use ssm_core::{Error, Result};

use crate::internal::{check_len, check_shape, solve_spd_right, symmetrize};
use crate::kalman::FilterTrace;
use crate::params::ParameterSet;

/// RTS smoother output.
#[derive(Debug, Clone)]
pub struct SmoothTrace {
    /// Smoothed means `m_{t|T}`.
    pub smoothed_means: Vec<DVector<f64>>,
    /// Smoothed covariances `P_{t|T}`.
    pub smoothed_covs: Vec<DMatrix<f64>>,
    /// Smoother gains `J_t = P_{t|t} A^T P_{t+1|t}^{-1}` for `t = 0..T-2`.
    pub gains: Vec<DMatrix<f64>>,
    /// Lag-one covariances `Cov(x_{t+1}, x_t | Y) = P_{t+1|T} J_t^T` for `t = 0..T-2`.
    pub lag_one_covs: Vec<DMatrix<f64>>,
}

impl SmoothTrace {
    /// Number of timesteps.
    pub fn len(&self) -> usize {
        self.smoothed_means.len()
    }

    /// Whether the trace is empty.
    pub fn is_empty(&self) -> bool {
        self.smoothed_means.is_empty()
    }
}

/// Run RTS smoothing given a completed filter trace.
pub fn rts_smoother(params: &ParameterSet, fr: &FilterTrace) -> Result<SmoothTrace> {
    let t_max = fr.filtered_means.len();
    if t_max == 0 {
        return Err(Error::Validation("filter trace must be non-empty".to_string()));
    }
    if fr.predicted_means.len() != t_max
        || fr.predicted_covs.len() != t_max
        || fr.filtered_covs.len() != t_max
    {
        return Err(Error::Validation("filter trace has inconsistent lengths".to_string()));
    }
    let n = params.nx();
    for t in 0..t_max {
        check_len(&format!("filtered_means[{t}]"), &fr.filtered_means[t], n)?;
        check_shape(&format!("filtered_covs[{t}]"), &fr.filtered_covs[t], n, n)?;
        check_len(&format!("predicted_means[{t}]"), &fr.predicted_means[t], n)?;
        check_shape(&format!("predicted_covs[{t}]"), &fr.predicted_covs[t], n, n)?;
    }

    let mut m_smooth = fr.filtered_means.clone();
    let mut p_smooth = fr.filtered_covs.clone();
    let mut gains = vec![DMatrix::<f64>::zeros(n, n); t_max - 1];
    let mut lag_one_covs = vec![DMatrix::<f64>::zeros(n, n); t_max - 1];

    for t in (0..t_max - 1).rev() {
        let p_filt = &fr.filtered_covs[t];
        let p_pred_next = &fr.predicted_covs[t + 1];

        // J_t = (P_{t|t} A^T) P_{t+1|t}^{-1}, via a solve against P_{t+1|t}.
        let pf_at = p_filt * params.a().transpose();
        let j = solve_spd_right(p_pred_next, &pf_at).ok_or_else(|| {
            Error::NumericalInstability(format!(
                "RTS smoother failed: predicted covariance not positive definite at t={}",
                t + 1
            ))
        })?;

        // m_{t|T} = m_{t|t} + J (m_{t+1|T} - m_{t+1|t})
        let dm = &m_smooth[t + 1] - &fr.predicted_means[t + 1];
        m_smooth[t] = &fr.filtered_means[t] + &j * dm;

        // P_{t|T} = P_{t|t} + J (P_{t+1|T} - P_{t+1|t}) J^T
        let dp = &p_smooth[t + 1] - p_pred_next;
        p_smooth[t] = symmetrize(&(p_filt + &j * dp * j.transpose()));

        lag_one_covs[t] = &p_smooth[t + 1] * j.transpose();
        gains[t] = j;
    }

    Ok(SmoothTrace { smoothed_means: m_smooth, smoothed_covs: p_smooth, gains, lag_one_covs })
}
