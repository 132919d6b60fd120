//! # ssm-inference
//!
//! Linear-Gaussian state-space estimation with exogenous inputs.
//!
//! This crate provides:
//! - Kalman filtering with missing-observation support
//! - Rauch–Tung–Striebel smoothing
//! - EM estimation of `A, B, C, D, Q, R` (serial and batched)
//! - Deterministic simulation, seeded sampling and multi-step forecasts
//!
//! Model: `x_{t+1} = A x_t + B u_t + w_t`, `y_t = C x_t + D u_t + v_t`,
//! `w_t ~ N(0, Q)`, `v_t ~ N(0, R)`, `x_0 ~ N(mu0, Sigma0)`.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Parallel EM over independent datasets.
pub mod batch;
/// EM parameter estimation.
pub mod em;
/// Multi-step forecasting and prediction intervals.
pub mod forecast;
mod internal;
/// Kalman filter.
pub mod kalman;
/// Model parameters.
pub mod params;
/// Deterministic and stochastic rollouts.
pub mod simulate;
/// RTS smoother.
pub mod smoother;

pub use batch::{EmDataset, em_fit_batch};
pub use em::{EmConfig, EmResult, em_fit, em_init};
pub use forecast::{Forecast, ForecastIntervals, forecast, forecast_from, forecast_intervals};
pub use kalman::{FilterTrace, kalman_filter, log_likelihood};
pub use params::{ParameterSet, no_inputs};
pub use simulate::{SampleTrace, SimulationTrace, sample, simulate};
pub use smoother::{SmoothTrace, rts_smoother};
pub use ssm_core::{Error, Result};
