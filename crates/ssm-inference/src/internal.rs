use nalgebra::{DMatrix, DVector, SymmetricEigen};
use ssm_core::{Error, Result};

/// Natural log of `2*pi` as an f64 constant.
///
/// We keep this as a literal because `ln()` is not a `const fn` on stable Rust.
pub(crate) const LN_2PI: f64 = 1.837_877_066_409_345_3;

#[inline]
pub(crate) fn symmetrize(p: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (p + p.transpose())
}

pub(crate) fn check_shape(what: &str, m: &DMatrix<f64>, rows: usize, cols: usize) -> Result<()> {
    if m.nrows() != rows || m.ncols() != cols {
        return Err(Error::matrix_shape(what, rows, cols, m.shape()));
    }
    Ok(())
}

pub(crate) fn check_len(what: &str, v: &DVector<f64>, len: usize) -> Result<()> {
    if v.len() != len {
        return Err(Error::vector_len(what, len, v.len()));
    }
    Ok(())
}

pub(crate) fn is_symmetric(m: &DMatrix<f64>) -> bool {
    let scale = m.amax().max(1.0);
    (m - m.transpose()).amax() <= 1e-9 * scale
}

/// Smallest eigenvalue of a symmetric matrix.
pub(crate) fn min_eigenvalue(m: &DMatrix<f64>) -> f64 {
    if m.is_empty() {
        return 0.0;
    }
    SymmetricEigen::new(symmetrize(m)).eigenvalues.min()
}

/// `rhs * S^{-1}` for symmetric positive definite `S`, via `S X^T = rhs^T`.
///
/// Returns `None` when `S` has no Cholesky factor.
pub(crate) fn solve_spd_right(s: &DMatrix<f64>, rhs: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let chol = s.clone().cholesky()?;
    let x = chol.solve(&rhs.transpose());
    if x.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Some(x.transpose())
}

/// Same as [`solve_spd_right`], falling back to a pivoted LU solve when the
/// Cholesky factorization fails (rank-deficient normal equations).
pub(crate) fn solve_right(s: &DMatrix<f64>, rhs: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if let Some(x) = solve_spd_right(s, rhs) {
        return Some(x);
    }
    let x = s.clone().lu().solve(&rhs.transpose())?;
    if x.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Some(x.transpose())
}

/// Symmetrize `a`, floor its diagonal at `min_diag`, and add jitter until
/// a Cholesky factor exists.
pub(crate) fn ensure_spd(mut a: DMatrix<f64>, min_diag: f64) -> Result<DMatrix<f64>> {
    a = symmetrize(&a);

    let n = a.nrows().min(a.ncols());
    for i in 0..n {
        if !a[(i, i)].is_finite() {
            return Err(Error::NumericalInstability(
                "covariance has non-finite diagonal".to_string(),
            ));
        }
        if a[(i, i)] < min_diag {
            a[(i, i)] = min_diag;
        }
    }

    if a.clone().cholesky().is_some() {
        return Ok(a);
    }

    let mut jitter = min_diag.max(1e-12);
    for _ in 0..20 {
        let j = DMatrix::<f64>::identity(a.nrows(), a.ncols()) * jitter;
        let candidate = symmetrize(&(&a + j));
        if candidate.clone().cholesky().is_some() {
            log::warn!("covariance required jitter {jitter:.3e} to become positive definite");
            return Ok(candidate);
        }
        jitter *= 10.0;
    }

    Err(Error::NumericalInstability(
        "failed to make covariance positive definite (Cholesky never succeeded)".to_string(),
    ))
}
