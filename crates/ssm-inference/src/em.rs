//! EM parameter estimation for linear-Gaussian state-space models with inputs.
//!
//! Learns `A, B, C, D, Q, R` for a chosen state dimension `nx`. The prior
//! `(mu0, Sigma0)` is supplied by the caller and never re-estimated.
//!
//! Each iteration runs filter + smoother (E-step), then two regularized
//! least-squares regressions on the expected sufficient statistics (M-step):
//! `x_{t+1}` on `z_t = [x_t; u_t]` for `[A B]`, and `y_t` on `z_t` for `[C D]`.
//! `Q` and `R` are the expected residual covariances under the new coefficients.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use ssm_core::{Error, Result};

use crate::internal::{check_len, check_shape, ensure_spd, solve_right, symmetrize};
use crate::kalman::kalman_filter;
use crate::params::ParameterSet;
use crate::smoother::{SmoothTrace, rts_smoother};

/// EM configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmConfig {
    /// Number of EM iterations (the only termination rule unless `tol` is set).
    pub n_iter: usize,
    /// Scale of the initial `Q = R = init_scale * I`.
    pub init_scale: f64,
    /// Diagonal ridge added to the normal equations of both regressions.
    pub ridge: f64,
    /// Diagonal floor added to the re-estimated `Q` and `R`.
    pub cov_floor: f64,
    /// Optional early stop on relative log-likelihood improvement.
    pub tol: Option<f64>,
    /// Relative tolerance for the non-decreasing log-likelihood check.
    pub monotone_tol: f64,
}

impl Default for EmConfig {
    fn default() -> Self {
        Self {
            n_iter: 20,
            init_scale: 1e-2,
            ridge: 1e-4,
            cov_floor: 1e-6,
            tol: None,
            monotone_tol: 1e-6,
        }
    }
}

impl EmConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.n_iter == 0 {
            return Err(Error::Validation("n_iter must be > 0".to_string()));
        }
        if !self.init_scale.is_finite() || self.init_scale <= 0.0 {
            return Err(Error::Validation("init_scale must be finite and > 0".to_string()));
        }
        if !self.ridge.is_finite() || self.ridge < 0.0 {
            return Err(Error::Validation("ridge must be finite and >= 0".to_string()));
        }
        if !self.cov_floor.is_finite() || self.cov_floor <= 0.0 {
            return Err(Error::Validation("cov_floor must be finite and > 0".to_string()));
        }
        if matches!(self.tol, Some(tol) if !tol.is_finite() || tol <= 0.0) {
            return Err(Error::Validation("tol must be finite and > 0".to_string()));
        }
        if !self.monotone_tol.is_finite() || self.monotone_tol < 0.0 {
            return Err(Error::Validation("monotone_tol must be finite and >= 0".to_string()));
        }
        Ok(())
    }
}

/// EM result.
#[derive(Debug, Clone)]
pub struct EmResult {
    /// Final parameter set (last entry of `history`).
    pub params: ParameterSet,
    /// Initial parameter set followed by one set per completed iteration.
    pub history: Vec<ParameterSet>,
    /// Log-likelihood of each entry in `history`.
    pub loglik_trace: Vec<f64>,
    /// Number of completed M-steps.
    pub n_iter: usize,
    /// Whether the optional `tol` early stop fired.
    pub converged: bool,
    /// `false` if the log-likelihood ever dropped by more than `monotone_tol`.
    pub monotone: bool,
}

fn validate_data(
    ys: &[DVector<f64>],
    us: &[DVector<f64>],
    nx: usize,
    mu0: &DVector<f64>,
    sigma0: &DMatrix<f64>,
) -> Result<(usize, usize)> {
    if nx == 0 {
        return Err(Error::Validation("nx must be > 0".to_string()));
    }
    if ys.is_empty() {
        return Err(Error::Validation("ys must be non-empty".to_string()));
    }
    if us.len() != ys.len() {
        return Err(Error::ShapeMismatch {
            what: "us".to_string(),
            expected: format!("{} timesteps", ys.len()),
            got: format!("{} timesteps", us.len()),
        });
    }
    check_len("mu0", mu0, nx)?;
    check_shape("Sigma0", sigma0, nx, nx)?;

    let ny = ys[0].len();
    let nu = us[0].len();
    if ny == 0 {
        return Err(Error::Validation("observations must have n_obs > 0".to_string()));
    }
    for (t, (y, u)) in ys.iter().zip(us).enumerate() {
        check_len(&format!("y[{t}]"), y, ny)?;
        check_len(&format!("u[{t}]"), u, nu)?;
        if y.iter().any(|v| !v.is_finite()) {
            return Err(Error::Validation(format!(
                "y[{t}] must be finite (EM does not support missing observations)"
            )));
        }
        if u.iter().any(|v| !v.is_finite()) {
            return Err(Error::Validation(format!("u[{t}] must be finite")));
        }
    }

    let min = nx + nu + 1;
    if ys.len() < min {
        return Err(Error::InsufficientData { n: ys.len(), min });
    }
    Ok((ny, nu))
}

/// Principal-component state proxy, one row per timestep (T x nx).
///
/// Mean-centered observations are projected onto their top-`nx` right
/// singular directions. When `nx > ny`, each row stacks `ceil(nx / ny)`
/// consecutive observations (indices clamped at `T - 1`) so that enough
/// directions exist.
fn pca_proxy(ys: &[DVector<f64>], nx: usize) -> Result<DMatrix<f64>> {
    let t_max = ys.len();
    let ny = ys[0].len();
    let lags = nx.div_ceil(ny);
    let width = lags * ny;

    let mut emb = DMatrix::<f64>::zeros(t_max, width);
    for t in 0..t_max {
        for k in 0..lags {
            let y = &ys[(t + k).min(t_max - 1)];
            for i in 0..ny {
                emb[(t, k * ny + i)] = y[i];
            }
        }
    }
    for j in 0..width {
        let mean = emb.column(j).mean();
        emb.column_mut(j).add_scalar_mut(-mean);
    }

    let svd = emb.clone().svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| Error::NumericalInstability("SVD of observations failed".to_string()))?;

    let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
    order.sort_by(|&i, &j| svd.singular_values[j].total_cmp(&svd.singular_values[i]));
    if order.len() < nx {
        return Err(Error::InsufficientData { n: t_max, min: nx + 1 });
    }

    let mut basis = DMatrix::<f64>::zeros(width, nx);
    for (k, &i) in order.iter().take(nx).enumerate() {
        basis.set_column(k, &v_t.row(i).transpose());
    }
    Ok(emb * basis)
}

/// Build the initial parameter set: `A = I`, `B = 0`, `C` from a least-squares
/// fit of the PCA proxy to the observations, `D = 0`, `Q = R = init_scale * I`.
pub fn em_init(
    ys: &[DVector<f64>],
    us: &[DVector<f64>],
    nx: usize,
    mu0: &DVector<f64>,
    sigma0: &DMatrix<f64>,
    cfg: &EmConfig,
) -> Result<ParameterSet> {
    cfg.validate()?;
    let (ny, nu) = validate_data(ys, us, nx, mu0, sigma0)?;

    let proxy = pca_proxy(ys, nx)?;

    let mut sxx = DMatrix::<f64>::zeros(nx, nx);
    let mut syx = DMatrix::<f64>::zeros(ny, nx);
    for (t, y) in ys.iter().enumerate() {
        let x = proxy.row(t).transpose();
        sxx += &x * x.transpose();
        syx += y * x.transpose();
    }
    sxx += DMatrix::<f64>::identity(nx, nx) * cfg.ridge;
    let c = solve_right(&sxx, &syx).ok_or_else(|| {
        Error::NumericalInstability("initial C regression is singular".to_string())
    })?;

    ParameterSet::new(
        DMatrix::identity(nx, nx),
        DMatrix::zeros(nx, nu),
        c,
        DMatrix::zeros(ny, nu),
        DMatrix::identity(nx, nx) * cfg.init_scale,
        DMatrix::identity(ny, ny) * cfg.init_scale,
        mu0.clone(),
        sigma0.clone(),
    )
}

/// `E[z z^T]` for `z = [x; u]` given `E[x x^T]`, `E[x]` and a known `u`.
fn z_second_moment(exx: &DMatrix<f64>, m: &DVector<f64>, u: &DVector<f64>) -> DMatrix<f64> {
    let n = m.len();
    let p = u.len();
    let mut out = DMatrix::<f64>::zeros(n + p, n + p);
    out.view_mut((0, 0), (n, n)).copy_from(exx);
    if p > 0 {
        let xu = m * u.transpose();
        out.view_mut((0, n), (n, p)).copy_from(&xu);
        out.view_mut((n, 0), (p, n)).copy_from(&xu.transpose());
        out.view_mut((n, n), (p, p)).copy_from(&(u * u.transpose()));
    }
    out
}

/// `[E[a x^T], E[a] u^T]` for a target `a` paired with `z = [x; u]`.
fn cross_moment(e_ax: &DMatrix<f64>, e_a: &DVector<f64>, u: &DVector<f64>) -> DMatrix<f64> {
    let n = e_ax.ncols();
    let p = u.len();
    let mut out = DMatrix::<f64>::zeros(e_ax.nrows(), n + p);
    out.view_mut((0, 0), (e_ax.nrows(), n)).copy_from(e_ax);
    if p > 0 {
        out.view_mut((0, n), (e_ax.nrows(), p)).copy_from(&(e_a * u.transpose()));
    }
    out
}

/// Solve `W (S_zz + ridge I) = S_az` and return `(W, residual covariance)`.
///
/// The residual covariance is `(S_aa - W S_az^T - S_az W^T + W S_zz W^T) / count`.
fn regress(
    s_aa: &DMatrix<f64>,
    s_az: &DMatrix<f64>,
    s_zz: &DMatrix<f64>,
    count: usize,
    ridge: f64,
    what: &str,
) -> Result<(DMatrix<f64>, DMatrix<f64>)> {
    let k = s_zz.nrows();
    let lhs = s_zz + DMatrix::<f64>::identity(k, k) * ridge;
    let w = solve_right(&lhs, s_az).ok_or_else(|| {
        Error::NumericalInstability(format!("{what} regression normal equations are singular"))
    })?;
    let w_saz_t = &w * s_az.transpose();
    let resid = s_aa - &w_saz_t - w_saz_t.transpose() + &w * s_zz * w.transpose();
    Ok((w, symmetrize(&resid) / count as f64))
}

fn m_step(
    cur: &ParameterSet,
    ys: &[DVector<f64>],
    us: &[DVector<f64>],
    sr: &SmoothTrace,
    cfg: &EmConfig,
) -> Result<ParameterSet> {
    let n = cur.nx();
    let p = cur.nu();
    let m = cur.ny();
    let t_max = ys.len();

    let exx: Vec<DMatrix<f64>> = sr
        .smoothed_means
        .iter()
        .zip(&sr.smoothed_covs)
        .map(|(ms, ps)| ps + ms * ms.transpose())
        .collect();

    // Dynamics: x_{t+1} on [x_t; u_t], t = 0..T-2.
    let mut s_next = DMatrix::<f64>::zeros(n, n);
    let mut s_next_z = DMatrix::<f64>::zeros(n, n + p);
    let mut s_zz_dyn = DMatrix::<f64>::zeros(n + p, n + p);
    for t in 0..t_max - 1 {
        let m_t = &sr.smoothed_means[t];
        let m_next = &sr.smoothed_means[t + 1];
        let e_next_x = &sr.lag_one_covs[t] + m_next * m_t.transpose();
        s_next += &exx[t + 1];
        s_next_z += cross_moment(&e_next_x, m_next, &us[t]);
        s_zz_dyn += z_second_moment(&exx[t], m_t, &us[t]);
    }
    let (ab, q_hat) = regress(&s_next, &s_next_z, &s_zz_dyn, t_max - 1, cfg.ridge, "dynamics")?;

    // Observations: y_t on [x_t; u_t], t = 0..T-1.
    let mut s_yy = DMatrix::<f64>::zeros(m, m);
    let mut s_yz = DMatrix::<f64>::zeros(m, n + p);
    let mut s_zz_obs = DMatrix::<f64>::zeros(n + p, n + p);
    for t in 0..t_max {
        let y = &ys[t];
        let m_t = &sr.smoothed_means[t];
        s_yy += y * y.transpose();
        s_yz += cross_moment(&(y * m_t.transpose()), y, &us[t]);
        s_zz_obs += z_second_moment(&exx[t], m_t, &us[t]);
    }
    let (cd, r_hat) = regress(&s_yy, &s_yz, &s_zz_obs, t_max, cfg.ridge, "observation")?;

    let q = ensure_spd(q_hat + DMatrix::<f64>::identity(n, n) * cfg.cov_floor, cfg.cov_floor)?;
    let r = ensure_spd(r_hat + DMatrix::<f64>::identity(m, m) * cfg.cov_floor, cfg.cov_floor)?;

    ParameterSet::new(
        ab.columns(0, n).into_owned(),
        ab.columns(n, p).into_owned(),
        cd.columns(0, n).into_owned(),
        cd.columns(n, p).into_owned(),
        q,
        r,
        cur.mu0().clone(),
        cur.sigma0().clone(),
    )
}

/// Fit `A, B, C, D, Q, R` by EM for state dimension `nx`, holding `(mu0, Sigma0)` fixed.
///
/// Runs `cfg.n_iter` iterations, or fewer if `cfg.tol` is set and the relative
/// log-likelihood improvement falls below it.
pub fn em_fit(
    ys: &[DVector<f64>],
    us: &[DVector<f64>],
    nx: usize,
    mu0: &DVector<f64>,
    sigma0: &DMatrix<f64>,
    cfg: &EmConfig,
) -> Result<EmResult> {
    let init = em_init(ys, us, nx, mu0, sigma0, cfg)?;

    let mut history = Vec::with_capacity(cfg.n_iter + 1);
    let mut loglik_trace: Vec<f64> = Vec::with_capacity(cfg.n_iter + 1);
    let mut converged = false;
    let mut monotone = true;
    history.push(init);

    for iter in 0..=cfg.n_iter {
        let cur = &history[iter];
        let fr = kalman_filter(cur, ys, us)?;
        let ll = fr.log_likelihood;
        log::debug!("EM iteration {iter}: log-likelihood {ll:.6}");

        if let Some(&prev) = loglik_trace.last() {
            let scale = 1.0 + f64::abs(prev);
            if ll + cfg.monotone_tol * scale < prev {
                log::warn!(
                    "EM log-likelihood decreased at iteration {iter}: {prev:.6} -> {ll:.6}"
                );
                monotone = false;
            }
            if cfg.tol.is_some_and(|tol| (ll - prev).abs() / scale <= tol) {
                loglik_trace.push(ll);
                converged = true;
                break;
            }
        }
        loglik_trace.push(ll);

        // Last set in budget has been scored.
        if iter == cfg.n_iter {
            break;
        }

        let sr = rts_smoother(cur, &fr)?;
        let next = m_step(cur, ys, us, &sr, cfg)?;
        history.push(next);
    }

    let n_iter = history.len() - 1;
    let params = history[n_iter].clone();
    Ok(EmResult { params, history, loglik_trace, n_iter, converged, monotone })
}
