//! Multi-step forecasting from a filtered state.
//!
//! Given the filtered estimate at `T-1` and the input `u_{T-1}` that drives
//! the transition out of it, step `k` predicts `x_{T-1+k}` and
//! `y_{T-1+k} = C x_{T-1+k} + D u_{T-1+k}`, where `u_{T-1+k}` is `future_us[k-1]`.

use nalgebra::{DMatrix, DVector};
use ssm_core::{Error, Result};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::internal::{check_len, check_shape, symmetrize};
use crate::kalman::FilterTrace;
use crate::params::{ParameterSet, input_term};

/// Forecast output.
#[derive(Debug, Clone)]
pub struct Forecast {
    /// Predicted state means for steps 1..=K (each nx).
    pub state_means: Vec<DVector<f64>>,
    /// Predicted state covariances for steps 1..=K (each nx x nx).
    pub state_covs: Vec<DMatrix<f64>>,
    /// Predicted observation means for steps 1..=K (each ny).
    pub obs_means: Vec<DVector<f64>>,
    /// Predicted observation covariances for steps 1..=K (each ny x ny).
    pub obs_covs: Vec<DMatrix<f64>>,
}

/// Marginal observation prediction intervals.
#[derive(Debug, Clone)]
pub struct ForecastIntervals {
    /// Two-sided level (0.05 gives a 95% interval).
    pub alpha: f64,
    /// Standard normal quantile at `1 - alpha/2`.
    pub z: f64,
    /// Lower bounds for steps 1..=K (each ny).
    pub obs_lower: Vec<DVector<f64>>,
    /// Upper bounds for steps 1..=K (each ny).
    pub obs_upper: Vec<DVector<f64>>,
}

/// Forecast `future_us.len()` steps ahead from `(m_last, p_last)`.
pub fn forecast_from(
    params: &ParameterSet,
    m_last: &DVector<f64>,
    p_last: &DMatrix<f64>,
    u_last: &DVector<f64>,
    future_us: &[DVector<f64>],
) -> Result<Forecast> {
    if future_us.is_empty() {
        return Err(Error::Validation("future_us must be non-empty".to_string()));
    }
    let n = params.nx();
    let nu = params.nu();
    check_len("m_last", m_last, n)?;
    check_shape("p_last", p_last, n, n)?;
    check_len("u_last", u_last, nu)?;
    for (k, u) in future_us.iter().enumerate() {
        check_len(&format!("future_us[{k}]"), u, nu)?;
    }
    if u_last.iter().chain(future_us.iter().flat_map(|u| u.iter())).any(|v| !v.is_finite()) {
        return Err(Error::Validation("forecast inputs must be finite".to_string()));
    }

    let steps = future_us.len();
    let mut state_means = Vec::with_capacity(steps);
    let mut state_covs = Vec::with_capacity(steps);
    let mut obs_means = Vec::with_capacity(steps);
    let mut obs_covs = Vec::with_capacity(steps);

    let mut m = m_last.clone();
    let mut p = p_last.clone();
    let mut u_drive = u_last;

    for u_obs in future_us {
        m = params.transition(&m, u_drive);
        p = symmetrize(&(params.a() * &p * params.a().transpose() + params.q()));

        let y_mean = params.c() * &m + input_term(params.d(), u_obs);
        let y_cov = params.c() * &p * params.c().transpose() + params.r();

        state_means.push(m.clone());
        state_covs.push(p.clone());
        obs_means.push(y_mean);
        obs_covs.push(symmetrize(&y_cov));
        u_drive = u_obs;
    }

    Ok(Forecast { state_means, state_covs, obs_means, obs_covs })
}

/// Forecast from the last filtered state in `fr`, driven first by the last input in `us`.
pub fn forecast(
    params: &ParameterSet,
    fr: &FilterTrace,
    us: &[DVector<f64>],
    future_us: &[DVector<f64>],
) -> Result<Forecast> {
    let t_max = fr.filtered_means.len();
    if t_max == 0 {
        return Err(Error::Validation("filter trace must be non-empty".to_string()));
    }
    if fr.filtered_covs.len() != t_max {
        return Err(Error::Validation("filter trace has inconsistent lengths".to_string()));
    }
    if us.len() != t_max {
        return Err(Error::ShapeMismatch {
            what: "us".to_string(),
            expected: format!("{t_max} timesteps"),
            got: format!("{} timesteps", us.len()),
        });
    }
    forecast_from(
        params,
        &fr.filtered_means[t_max - 1],
        &fr.filtered_covs[t_max - 1],
        &us[t_max - 1],
        future_us,
    )
}

/// Marginal normal prediction intervals for the observation forecasts in `fc`.
pub fn forecast_intervals(fc: &Forecast, alpha: f64) -> Result<ForecastIntervals> {
    if !(alpha.is_finite() && alpha > 0.0 && alpha < 1.0) {
        return Err(Error::Validation("alpha must be in (0, 1)".to_string()));
    }
    if fc.obs_means.is_empty() || fc.obs_means.len() != fc.obs_covs.len() {
        return Err(Error::Validation("forecast must be non-empty with consistent lengths".to_string()));
    }

    let ny = fc.obs_means[0].len();
    for (k, (m, s)) in fc.obs_means.iter().zip(&fc.obs_covs).enumerate() {
        check_len(&format!("obs_means[{k}]"), m, ny)?;
        check_shape(&format!("obs_covs[{k}]"), s, ny, ny)?;
    }

    let normal = Normal::new(0.0, 1.0)
        .map_err(|e| Error::Validation(format!("failed to construct normal distribution: {e}")))?;
    let z = normal.inverse_cdf(1.0 - 0.5 * alpha);

    let mut obs_lower = Vec::with_capacity(fc.obs_means.len());
    let mut obs_upper = Vec::with_capacity(fc.obs_means.len());
    for (k, (m, s)) in fc.obs_means.iter().zip(&fc.obs_covs).enumerate() {
        let sd = s.diagonal().map(|v| v.sqrt());
        if sd.iter().chain(m.iter()).any(|v| !v.is_finite()) {
            return Err(Error::NumericalInstability(format!(
                "forecast step {} has non-finite mean or variance",
                k + 1
            )));
        }
        obs_lower.push(m - &sd * z);
        obs_upper.push(m + &sd * z);
    }

    Ok(ForecastIntervals { alpha, z, obs_lower, obs_upper })
}
