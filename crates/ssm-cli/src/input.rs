//! JSON input schema and conversions to `nalgebra` types.

use anyhow::{Context, Result};
use nalgebra::{DMatrix, DVector};
use serde::Deserialize;
use ssm_inference::{EmConfig, ParameterSet};
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct ModelJson {
    a: Vec<Vec<f64>>,
    #[serde(default)]
    b: Option<Vec<Vec<f64>>>,
    c: Vec<Vec<f64>>,
    #[serde(default)]
    d: Option<Vec<Vec<f64>>>,
    q: Vec<Vec<f64>>,
    r: Vec<Vec<f64>>,
    mu0: Vec<f64>,
    sigma0: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalLevelJson {
    q: f64,
    r: f64,
    #[serde(default)]
    m0: f64,
    #[serde(default = "default_p0")]
    p0: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalLinearTrendJson {
    q_level: f64,
    q_slope: f64,
    r: f64,
    #[serde(default)]
    level0: f64,
    #[serde(default)]
    slope0: f64,
    #[serde(default = "default_p0")]
    p0_level: f64,
    #[serde(default = "default_p0")]
    p0_slope: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ar1Json {
    phi: f64,
    q: f64,
    r: f64,
    #[serde(default)]
    m0: f64,
    #[serde(default = "default_p0")]
    p0: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriorJson {
    mu0: Vec<f64>,
    sigma0: Vec<Vec<f64>>,
}

/// Top-level input document shared by every subcommand.
#[derive(Debug, Clone, Deserialize)]
pub struct InputJson {
    #[serde(default)]
    model: Option<ModelJson>,
    #[serde(default)]
    local_level: Option<LocalLevelJson>,
    #[serde(default)]
    local_linear_trend: Option<LocalLinearTrendJson>,
    #[serde(default)]
    ar1: Option<Ar1Json>,
    #[serde(default)]
    ys: Option<Vec<Vec<Option<f64>>>>,
    #[serde(default)]
    us: Option<Vec<Vec<f64>>>,
    #[serde(default)]
    future_us: Option<Vec<Vec<f64>>>,
    #[serde(default)]
    x0: Option<Vec<f64>>,
    #[serde(default)]
    prior: Option<PriorJson>,
    #[serde(default)]
    pub em: Option<EmConfig>,
}

fn default_p0() -> f64 {
    1.0
}

fn read_input(path: &Path) -> ssm_core::Result<InputJson> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn load_input(path: &Path) -> Result<InputJson> {
    tracing::info!(path = %path.display(), "loading input");
    read_input(path).with_context(|| format!("failed to load {}", path.display()))
}

pub fn dmatrix_from_nested(name: &str, rows: Vec<Vec<f64>>) -> Result<DMatrix<f64>> {
    if rows.is_empty() {
        anyhow::bail!("{name} must be non-empty");
    }
    let nrows = rows.len();
    let ncols = rows[0].len();
    for (i, r) in rows.iter().enumerate() {
        if r.len() != ncols {
            anyhow::bail!(
                "{name} must be rectangular: row {i} has len {}, expected {}",
                r.len(),
                ncols
            );
        }
        if r.iter().any(|v| !v.is_finite()) {
            anyhow::bail!("{name} must contain only finite values");
        }
    }
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Ok(DMatrix::from_row_slice(nrows, ncols, &flat))
}

fn dvector_from_vec(name: &str, v: Vec<f64>) -> Result<DVector<f64>> {
    if v.is_empty() {
        anyhow::bail!("{name} must be non-empty");
    }
    if v.iter().any(|x| !x.is_finite()) {
        anyhow::bail!("{name} must contain only finite values");
    }
    Ok(DVector::from_vec(v))
}

fn dvector_from_opt_vec(name: &str, v: Vec<Option<f64>>) -> Result<DVector<f64>> {
    if v.is_empty() {
        anyhow::bail!("{name} must be non-empty");
    }
    let mut out = Vec::with_capacity(v.len());
    for x in v {
        match x {
            Some(v) if v.is_finite() => out.push(v),
            Some(_) => anyhow::bail!("{name} must contain only finite values or null"),
            None => out.push(f64::NAN),
        }
    }
    Ok(DVector::from_vec(out))
}

fn input_sequence(name: &str, rows: Vec<Vec<f64>>) -> Result<Vec<DVector<f64>>> {
    rows.into_iter()
        .enumerate()
        .map(|(t, u)| {
            if u.iter().any(|x| !x.is_finite()) {
                anyhow::bail!("{name}[{t}] must contain only finite values");
            }
            Ok(DVector::from_vec(u))
        })
        .collect()
}

pub fn dvector_to_vec(v: &DVector<f64>) -> Vec<f64> {
    v.iter().copied().collect()
}

pub fn dmatrix_to_nested(m: &DMatrix<f64>) -> Vec<Vec<f64>> {
    m.row_iter().map(|row| row.iter().copied().collect()).collect()
}

impl InputJson {
    /// Build the parameter set from exactly one of `model`, `local_level`,
    /// `local_linear_trend`, `ar1`.
    pub fn params(&self) -> Result<ParameterSet> {
        let model_count = self.model.is_some() as usize
            + self.local_level.is_some() as usize
            + self.local_linear_trend.is_some() as usize
            + self.ar1.is_some() as usize;
        if model_count != 1 {
            anyhow::bail!("expected exactly one of: model, local_level, local_linear_trend, ar1");
        }

        let params = if let Some(mj) = self.model.clone() {
            let a = dmatrix_from_nested("A", mj.a)?;
            let c = dmatrix_from_nested("C", mj.c)?;
            let b = match mj.b {
                Some(b) => dmatrix_from_nested("B", b)?,
                None => DMatrix::zeros(a.nrows(), 0),
            };
            let d = match mj.d {
                Some(d) => dmatrix_from_nested("D", d)?,
                None => DMatrix::zeros(c.nrows(), b.ncols()),
            };
            ParameterSet::new(
                a,
                b,
                c,
                d,
                dmatrix_from_nested("Q", mj.q)?,
                dmatrix_from_nested("R", mj.r)?,
                dvector_from_vec("mu0", mj.mu0)?,
                dmatrix_from_nested("Sigma0", mj.sigma0)?,
            )
            .context("invalid model")?
        } else if let Some(ll) = &self.local_level {
            ParameterSet::local_level(ll.q, ll.r, ll.m0, ll.p0).context("invalid local_level model")?
        } else if let Some(lt) = &self.local_linear_trend {
            ParameterSet::local_linear_trend(
                lt.q_level,
                lt.q_slope,
                lt.r,
                lt.level0,
                lt.slope0,
                lt.p0_level,
                lt.p0_slope,
            )
            .context("invalid local_linear_trend model")?
        } else if let Some(ar) = &self.ar1 {
            ParameterSet::ar1(ar.phi, ar.q, ar.r, ar.m0, ar.p0).context("invalid ar1 model")?
        } else {
            anyhow::bail!("no model given");
        };

        tracing::info!(nx = params.nx(), nu = params.nu(), ny = params.ny(), "model loaded");
        Ok(params)
    }

    /// Observations; `null` entries become NaN (missing).
    pub fn ys(&self) -> Result<Vec<DVector<f64>>> {
        let Some(ys) = self.ys.clone() else {
            anyhow::bail!("input must contain ys");
        };
        ys.into_iter()
            .enumerate()
            .map(|(t, y)| dvector_from_opt_vec(&format!("y[{t}]"), y))
            .collect()
    }

    /// Inputs, defaulting to `t_max` empty vectors (no control input).
    pub fn us(&self, t_max: usize) -> Result<Vec<DVector<f64>>> {
        match self.us.clone() {
            Some(us) => input_sequence("u", us),
            None => Ok(ssm_inference::no_inputs(t_max)),
        }
    }

    /// Inputs for forecasting; falls back to `steps` empty vectors.
    pub fn future_us(&self, steps: Option<usize>) -> Result<Vec<DVector<f64>>> {
        match (self.future_us.clone(), steps) {
            (Some(us), Some(k)) if us.len() != k => {
                anyhow::bail!("future_us has {} steps but --steps is {k}", us.len())
            }
            (Some(us), _) => input_sequence("future_u", us),
            (None, Some(k)) => Ok(ssm_inference::no_inputs(k)),
            (None, None) => anyhow::bail!("either future_us or --steps is required"),
        }
    }

    pub fn x0(&self) -> Result<Option<DVector<f64>>> {
        self.x0.clone().map(|x| dvector_from_vec("x0", x)).transpose()
    }

    /// Prior for EM, defaulting to `N(0, I)`.
    pub fn prior(&self, nx: usize) -> Result<(DVector<f64>, DMatrix<f64>)> {
        match self.prior.clone() {
            Some(p) => Ok((dvector_from_vec("prior.mu0", p.mu0)?, dmatrix_from_nested("prior.sigma0", p.sigma0)?)),
            None => Ok((DVector::zeros(nx), DMatrix::identity(nx, nx))),
        }
    }
}
