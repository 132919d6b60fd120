//! Parameter bundle for linear-Gaussian state-space models with control inputs.
//!
//! State:
//! `x_{t+1} = A x_t + B u_t + w_t`,  `w_t ~ N(0, Q)`
//!
//! Observation:
//! `y_t = C x_t + D u_t + v_t`,      `v_t ~ N(0, R)`
//!
//! Initial prior:
//! `x_0 ~ N(mu0, Sigma0)`
//!
//! Dimension ordering is always (state `nx`, input `nu`, output `ny`).

use nalgebra::{DMatrix, DVector};
use ssm_core::{Error, Result};

use crate::internal::{check_len, check_shape, is_symmetric, min_eigenvalue};

/// Relative tolerance for the PSD check on Q, R and Sigma0.
const PSD_TOL: f64 = 1e-10;

/// Immutable, dimension-checked set of system matrices and the initial-state prior.
///
/// Every estimation step produces a new `ParameterSet`; nothing mutates one in place.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSet {
    nx: usize,
    nu: usize,
    ny: usize,
    a: DMatrix<f64>,
    b: DMatrix<f64>,
    c: DMatrix<f64>,
    d: DMatrix<f64>,
    q: DMatrix<f64>,
    r: DMatrix<f64>,
    mu0: DVector<f64>,
    sigma0: DMatrix<f64>,
}

fn check_finite(name: &str, values: &[f64]) -> Result<()> {
    if values.iter().any(|v| !v.is_finite()) {
        return Err(Error::Validation(format!("{name} must contain only finite values")));
    }
    Ok(())
}

fn check_covariance(name: &str, m: &DMatrix<f64>) -> Result<()> {
    if !is_symmetric(m) {
        return Err(Error::Validation(format!("{name} must be symmetric")));
    }
    let scale = m.amax().max(1.0);
    if min_eigenvalue(m) < -PSD_TOL * scale {
        return Err(Error::Validation(format!("{name} must be positive semi-definite")));
    }
    Ok(())
}

fn positive(name: &str, v: f64) -> Result<()> {
    if !v.is_finite() || v <= 0.0 {
        return Err(Error::Validation(format!("{name} must be finite and > 0")));
    }
    Ok(())
}

impl ParameterSet {
    /// Create a new parameter set, validating every shape against `(nx, nu, ny)`.
    ///
    /// `nx` is taken from `A`, `nu` from the columns of `B`, `ny` from the rows of `C`.
    /// `nu = 0` (no control input) is allowed; `nx` and `ny` must be positive.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        a: DMatrix<f64>,
        b: DMatrix<f64>,
        c: DMatrix<f64>,
        d: DMatrix<f64>,
        q: DMatrix<f64>,
        r: DMatrix<f64>,
        mu0: DVector<f64>,
        sigma0: DMatrix<f64>,
    ) -> Result<Self> {
        let nx = a.nrows();
        if nx == 0 {
            return Err(Error::Validation("A must have n_state > 0".to_string()));
        }
        check_shape("A", &a, nx, nx)?;
        let nu = b.ncols();
        check_shape("B", &b, nx, nu)?;
        let ny = c.nrows();
        if ny == 0 {
            return Err(Error::Validation("C must have n_obs > 0".to_string()));
        }
        check_shape("C", &c, ny, nx)?;
        check_shape("D", &d, ny, nu)?;
        check_shape("Q", &q, nx, nx)?;
        check_shape("R", &r, ny, ny)?;
        check_len("mu0", &mu0, nx)?;
        check_shape("Sigma0", &sigma0, nx, nx)?;

        for (name, m) in [("A", &a), ("B", &b), ("C", &c), ("D", &d), ("Q", &q), ("R", &r)] {
            check_finite(name, m.as_slice())?;
        }
        check_finite("mu0", mu0.as_slice())?;
        check_finite("Sigma0", sigma0.as_slice())?;

        check_covariance("Q", &q)?;
        check_covariance("R", &r)?;
        check_covariance("Sigma0", &sigma0)?;

        Ok(Self { nx, nu, ny, a, b, c, d, q, r, mu0, sigma0 })
    }

    /// Local level model (random walk) with 1D state, 1D observations and no inputs.
    ///
    /// `x_{t+1} = x_t + w_t`, `y_t = x_t + v_t`.
    pub fn local_level(q: f64, r: f64, m0: f64, p0: f64) -> Result<Self> {
        positive("q", q)?;
        positive("r", r)?;
        positive("p0", p0)?;
        check_finite("m0", &[m0])?;

        ParameterSet::new(
            DMatrix::from_row_slice(1, 1, &[1.0]),
            DMatrix::zeros(1, 0),
            DMatrix::from_row_slice(1, 1, &[1.0]),
            DMatrix::zeros(1, 0),
            DMatrix::from_row_slice(1, 1, &[q]),
            DMatrix::from_row_slice(1, 1, &[r]),
            DVector::from_row_slice(&[m0]),
            DMatrix::from_row_slice(1, 1, &[p0]),
        )
    }

    /// Local linear trend (level + slope) with 2D state, 1D observations and no inputs.
    ///
    /// `level_{t+1} = level_t + slope_t + w_level`
    /// `slope_{t+1} = slope_t + w_slope`
    /// `y_t = level_t + v_t`
    #[allow(clippy::too_many_arguments)]
    pub fn local_linear_trend(
        q_level: f64,
        q_slope: f64,
        r: f64,
        level0: f64,
        slope0: f64,
        p0_level: f64,
        p0_slope: f64,
    ) -> Result<Self> {
        positive("q_level", q_level)?;
        positive("q_slope", q_slope)?;
        positive("r", r)?;
        positive("p0_level", p0_level)?;
        positive("p0_slope", p0_slope)?;
        check_finite("initial state", &[level0, slope0])?;

        ParameterSet::new(
            DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0]),
            DMatrix::zeros(2, 0),
            DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
            DMatrix::zeros(1, 0),
            DMatrix::from_row_slice(2, 2, &[q_level, 0.0, 0.0, q_slope]),
            DMatrix::from_row_slice(1, 1, &[r]),
            DVector::from_row_slice(&[level0, slope0]),
            DMatrix::from_row_slice(2, 2, &[p0_level, 0.0, 0.0, p0_slope]),
        )
    }

    /// AR(1) state observed with noise, no inputs.
    ///
    /// `x_{t+1} = phi * x_t + w_t`, `y_t = x_t + v_t`.
    pub fn ar1(phi: f64, q: f64, r: f64, m0: f64, p0: f64) -> Result<Self> {
        check_finite("phi", &[phi])?;
        positive("q", q)?;
        positive("r", r)?;
        positive("p0", p0)?;
        check_finite("m0", &[m0])?;

        ParameterSet::new(
            DMatrix::from_row_slice(1, 1, &[phi]),
            DMatrix::zeros(1, 0),
            DMatrix::from_row_slice(1, 1, &[1.0]),
            DMatrix::zeros(1, 0),
            DMatrix::from_row_slice(1, 1, &[q]),
            DMatrix::from_row_slice(1, 1, &[r]),
            DVector::from_row_slice(&[m0]),
            DMatrix::from_row_slice(1, 1, &[p0]),
        )
    }

    /// Same system matrices with a replaced initial-state prior.
    pub fn with_prior(&self, mu0: DVector<f64>, sigma0: DMatrix<f64>) -> Result<Self> {
        ParameterSet::new(
            self.a.clone(),
            self.b.clone(),
            self.c.clone(),
            self.d.clone(),
            self.q.clone(),
            self.r.clone(),
            mu0,
            sigma0,
        )
    }

    /// Number of latent state dimensions.
    pub fn nx(&self) -> usize {
        self.nx
    }

    /// Number of control-input dimensions.
    pub fn nu(&self) -> usize {
        self.nu
    }

    /// Number of observation dimensions.
    pub fn ny(&self) -> usize {
        self.ny
    }

    /// Transition matrix `A` (nx x nx).
    pub fn a(&self) -> &DMatrix<f64> {
        &self.a
    }

    /// Input matrix `B` (nx x nu).
    pub fn b(&self) -> &DMatrix<f64> {
        &self.b
    }

    /// Output matrix `C` (ny x nx).
    pub fn c(&self) -> &DMatrix<f64> {
        &self.c
    }

    /// Input feedthrough `D` (ny x nu).
    pub fn d(&self) -> &DMatrix<f64> {
        &self.d
    }

    /// Process-noise covariance `Q` (nx x nx).
    pub fn q(&self) -> &DMatrix<f64> {
        &self.q
    }

    /// Observation-noise covariance `R` (ny x ny).
    pub fn r(&self) -> &DMatrix<f64> {
        &self.r
    }

    /// Initial-state mean `mu0` (nx).
    pub fn mu0(&self) -> &DVector<f64> {
        &self.mu0
    }

    /// Initial-state covariance `Sigma0` (nx x nx).
    pub fn sigma0(&self) -> &DMatrix<f64> {
        &self.sigma0
    }

    /// Noise-free transition `A x + B u`.
    pub fn transition(&self, x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
        &self.a * x + input_term(&self.b, u)
    }

    /// Noise-free output `C x + D u`.
    pub fn output(&self, x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
        &self.c * x + input_term(&self.d, u)
    }

    /// Check that `ys`/`us` are time-aligned and match this model's dimensions.
    ///
    /// Observations may contain NaN (missing); inputs must be finite.
    pub fn validate_sequences(&self, ys: &[DVector<f64>], us: &[DVector<f64>]) -> Result<()> {
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
        let ny = self.ny();
        let nu = self.nu();
        for (t, (y, u)) in ys.iter().zip(us).enumerate() {
            check_len(&format!("y[{t}]"), y, ny)?;
            check_len(&format!("u[{t}]"), u, nu)?;
            if y.iter().any(|v| v.is_infinite()) {
                return Err(Error::Validation(format!(
                    "y[{t}] must be finite or NaN (NaN means missing)"
                )));
            }
            if u.iter().any(|v| !v.is_finite()) {
                return Err(Error::Validation(format!("u[{t}] must be finite")));
            }
        }
        Ok(())
    }
}

// Empty input blocks (nu = 0) contribute zeros.
pub(crate) fn input_term(m: &DMatrix<f64>, u: &DVector<f64>) -> DVector<f64> {
    if m.ncols() == 0 { DVector::zeros(m.nrows()) } else { m * u }
}

/// `T` empty input vectors, for models without control inputs.
pub fn no_inputs(t_max: usize) -> Vec<DVector<f64>> {
    vec![DVector::zeros(0); t_max]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracking() -> ParameterSet {
        ParameterSet::new(
            DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0]),
            DMatrix::from_row_slice(2, 1, &[0.0, 0.0]),
            DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
            DMatrix::from_row_slice(1, 1, &[0.0]),
            DMatrix::identity(2, 2) * 1e-3,
            DMatrix::from_row_slice(1, 1, &[1e-2]),
            DVector::from_row_slice(&[0.0, 1.0]),
            DMatrix::identity(2, 2),
        )
        .unwrap()
    }

    #[test]
    fn test_dimensions() {
        let p = tracking();
        assert_eq!((p.nx(), p.nu(), p.ny()), (2, 1, 1));
    }

    #[test]
    fn test_rejects_bad_shapes() {
        let err = ParameterSet::new(
            DMatrix::identity(2, 2),
            DMatrix::zeros(2, 1),
            DMatrix::zeros(1, 2),
            DMatrix::zeros(1, 2),
            DMatrix::identity(2, 2),
            DMatrix::identity(1, 1),
            DVector::zeros(2),
            DMatrix::identity(2, 2),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { ref what, .. } if what == "D"), "{err}");

        let err = ParameterSet::new(
            DMatrix::identity(2, 2),
            DMatrix::zeros(2, 1),
            DMatrix::zeros(1, 2),
            DMatrix::zeros(1, 1),
            DMatrix::identity(2, 2),
            DMatrix::identity(1, 1),
            DVector::zeros(3),
            DMatrix::identity(2, 2),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { ref what, .. } if what == "mu0"), "{err}");
    }

    #[test]
    fn test_rejects_asymmetric_or_indefinite_noise() {
        let asym = ParameterSet::new(
            DMatrix::identity(2, 2),
            DMatrix::zeros(2, 0),
            DMatrix::identity(2, 2),
            DMatrix::zeros(2, 0),
            DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.0, 1.0]),
            DMatrix::identity(2, 2),
            DVector::zeros(2),
            DMatrix::identity(2, 2),
        );
        assert!(matches!(asym, Err(Error::Validation(_))));

        let indefinite = ParameterSet::new(
            DMatrix::identity(1, 1),
            DMatrix::zeros(1, 0),
            DMatrix::identity(1, 1),
            DMatrix::zeros(1, 0),
            DMatrix::identity(1, 1),
            DMatrix::from_row_slice(1, 1, &[-0.1]),
            DVector::zeros(1),
            DMatrix::identity(1, 1),
        );
        assert!(matches!(indefinite, Err(Error::Validation(_))));
    }

    #[test]
    fn test_dimensions_survive_prior_replacement() {
        let p = tracking();
        let p2 = p.with_prior(DVector::zeros(2), DMatrix::identity(2, 2)).unwrap();
        assert_eq!((p2.nx(), p2.nu(), p2.ny()), (2, 1, 1));
        assert_eq!(p2.b().shape(), (p2.nx(), p2.nu()));
        assert_eq!(p2.d().shape(), (p2.ny(), p2.nu()));

        let err = p.with_prior(DVector::zeros(3), DMatrix::identity(3, 3)).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { ref what, .. } if what == "mu0"), "{err}");
    }

    #[test]
    fn test_builders() {
        let ll = ParameterSet::local_level(0.1, 0.2, 0.0, 1.0).unwrap();
        assert_eq!((ll.nx(), ll.nu(), ll.ny()), (1, 0, 1));

        let lt = ParameterSet::local_linear_trend(0.1, 0.01, 0.2, 0.0, 1.0, 1.0, 1.0).unwrap();
        assert_eq!((lt.nx(), lt.nu(), lt.ny()), (2, 0, 1));
        assert_eq!(lt.a()[(0, 1)], 1.0);

        assert!(ParameterSet::ar1(0.5, -1.0, 0.2, 0.0, 1.0).is_err());
    }

    #[test]
    fn test_with_prior_keeps_system_matrices() {
        let p = tracking();
        let p2 = p.with_prior(DVector::from_row_slice(&[5.0, 0.0]), DMatrix::identity(2, 2) * 2.0)
            .unwrap();
        assert_eq!(p.a(), p2.a());
        assert_eq!(p2.mu0()[0], 5.0);
        assert_eq!(p.mu0()[0], 0.0);
    }

    #[test]
    fn test_validate_sequences() {
        let p = tracking();
        let ys = vec![DVector::from_row_slice(&[1.0]), DVector::from_row_slice(&[f64::NAN])];
        let us = vec![DVector::from_row_slice(&[0.0]), DVector::from_row_slice(&[0.0])];
        p.validate_sequences(&ys, &us).unwrap();

        let err = p.validate_sequences(&ys, &us[..1]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));

        let bad_u = vec![DVector::from_row_slice(&[0.0]), DVector::zeros(2)];
        let err = p.validate_sequences(&ys, &bad_u).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { ref what, .. } if what == "u[1]"));
    }
}
