//! ssm CLI

mod input;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use input::{dmatrix_to_nested, dvector_to_vec, load_input};

#[derive(Parser)]
#[command(name = "ssm")]
#[command(about = "ssm - linear-Gaussian state-space filtering, smoothing and EM")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Kalman filter
    Filter {
        /// Input JSON file (model + ys [+ us])
        #[arg(short, long)]
        input: PathBuf,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// RTS smoother (runs filter + smoother)
    Smooth {
        /// Input JSON file (model + ys [+ us])
        #[arg(short, long)]
        input: PathBuf,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Fit A, B, C, D, Q, R with EM (prior held fixed)
    Em {
        /// Input JSON file (ys [+ us] [+ prior] [+ em])
        #[arg(short, long)]
        input: PathBuf,

        /// Latent state dimension
        #[arg(long)]
        nx: usize,

        /// Number of EM iterations (overrides `em.n_iter`)
        #[arg(long)]
        n_iter: Option<usize>,

        /// Relative log-likelihood early-stop tolerance (overrides `em.tol`)
        #[arg(long)]
        tol: Option<f64>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Forecast after filtering the provided `ys`
    Forecast {
        /// Input JSON file (model + ys [+ us] [+ future_us])
        #[arg(short, long)]
        input: PathBuf,

        /// Number of forecast steps (required when the input has no `future_us`)
        #[arg(long)]
        steps: Option<usize>,

        /// Also report two-sided observation intervals at this level
        #[arg(long)]
        alpha: Option<f64>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Noise-free rollout from `x0` (defaults to the prior mean)
    Simulate {
        /// Input JSON file (model [+ us] [+ x0])
        #[arg(short, long)]
        input: PathBuf,

        /// Number of steps when the input has no `us`
        #[arg(long)]
        t_max: Option<usize>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Draw one noisy trajectory from the model
    Sample {
        /// Input JSON file (model [+ us])
        #[arg(short, long)]
        input: PathBuf,

        /// Number of steps when the input has no `us`
        #[arg(long)]
        t_max: Option<usize>,

        /// RNG seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print version information
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).init();

    match cli.command {
        Commands::Filter { input, output } => cmd_filter(&input, output.as_deref()),
        Commands::Smooth { input, output } => cmd_smooth(&input, output.as_deref()),
        Commands::Em { input, nx, n_iter, tol, output } => {
            cmd_em(&input, nx, n_iter, tol, output.as_deref())
        }
        Commands::Forecast { input, steps, alpha, output } => {
            cmd_forecast(&input, steps, alpha, output.as_deref())
        }
        Commands::Simulate { input, t_max, output } => {
            cmd_simulate(&input, t_max, output.as_deref())
        }
        Commands::Sample { input, t_max, seed, output } => {
            cmd_sample(&input, t_max, seed, output.as_deref())
        }
        Commands::Version => {
            println!("ssm {}", ssm_core::VERSION);
            Ok(())
        }
    }
}

fn write_json(output: Option<&Path>, value: serde_json::Value) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}

fn vecs_json(vs: &[nalgebra::DVector<f64>]) -> Vec<Vec<f64>> {
    vs.iter().map(dvector_to_vec).collect()
}

fn mats_json(ms: &[nalgebra::DMatrix<f64>]) -> Vec<Vec<Vec<f64>>> {
    ms.iter().map(dmatrix_to_nested).collect()
}

fn params_json(p: &ssm_inference::ParameterSet) -> serde_json::Value {
    serde_json::json!({
        "a": dmatrix_to_nested(p.a()),
        "b": dmatrix_to_nested(p.b()),
        "c": dmatrix_to_nested(p.c()),
        "d": dmatrix_to_nested(p.d()),
        "q": dmatrix_to_nested(p.q()),
        "r": dmatrix_to_nested(p.r()),
        "mu0": dvector_to_vec(p.mu0()),
        "sigma0": dmatrix_to_nested(p.sigma0()),
    })
}

fn cmd_filter(input: &Path, output: Option<&Path>) -> Result<()> {
    let doc = load_input(input)?;
    let params = doc.params()?;
    let ys = doc.ys()?;
    let us = doc.us(ys.len())?;
    let fr = ssm_inference::kalman_filter(&params, &ys, &us).context("kalman_filter failed")?;
    tracing::info!(t_max = fr.len(), log_likelihood = fr.log_likelihood, "filter done");

    let output_json = serde_json::json!({
        "log_likelihood": fr.log_likelihood,
        "predicted_means": vecs_json(&fr.predicted_means),
        "predicted_covs": mats_json(&fr.predicted_covs),
        "filtered_means": vecs_json(&fr.filtered_means),
        "filtered_covs": mats_json(&fr.filtered_covs),
        "gains": mats_json(&fr.gains),
        "innovations": vecs_json(&fr.innovations),
        "innovation_covs": mats_json(&fr.innovation_covs),
    });

    write_json(output, output_json)
}

fn cmd_smooth(input: &Path, output: Option<&Path>) -> Result<()> {
    let doc = load_input(input)?;
    let params = doc.params()?;
    let ys = doc.ys()?;
    let us = doc.us(ys.len())?;
    let fr = ssm_inference::kalman_filter(&params, &ys, &us).context("kalman_filter failed")?;
    let sr = ssm_inference::rts_smoother(&params, &fr).context("rts_smoother failed")?;

    let output_json = serde_json::json!({
        "log_likelihood": fr.log_likelihood,
        "filtered_means": vecs_json(&fr.filtered_means),
        "filtered_covs": mats_json(&fr.filtered_covs),
        "smoothed_means": vecs_json(&sr.smoothed_means),
        "smoothed_covs": mats_json(&sr.smoothed_covs),
        "smoother_gains": mats_json(&sr.gains),
    });

    write_json(output, output_json)
}

fn cmd_em(
    input: &Path,
    nx: usize,
    n_iter: Option<usize>,
    tol: Option<f64>,
    output: Option<&Path>,
) -> Result<()> {
    let doc = load_input(input)?;
    let ys = doc.ys()?;
    let us = doc.us(ys.len())?;
    let (mu0, sigma0) = doc.prior(nx)?;

    let mut cfg = doc.em.clone().unwrap_or_default();
    if let Some(n) = n_iter {
        cfg.n_iter = n;
    }
    if tol.is_some() {
        cfg.tol = tol;
    }

    tracing::info!(nx, t_max = ys.len(), n_iter = cfg.n_iter, "starting EM");
    let res = ssm_inference::em_fit(&ys, &us, nx, &mu0, &sigma0, &cfg).context("em_fit failed")?;
    tracing::info!(n_iter = res.n_iter, converged = res.converged, monotone = res.monotone, "EM done");

    let mut output_json = params_json(&res.params);
    if let Some(obj) = output_json.as_object_mut() {
        obj.insert("loglik_trace".into(), serde_json::json!(res.loglik_trace));
        obj.insert("n_iter".into(), serde_json::json!(res.n_iter));
        obj.insert("converged".into(), serde_json::json!(res.converged));
        obj.insert("monotone".into(), serde_json::json!(res.monotone));
    }

    write_json(output, output_json)
}

fn cmd_forecast(
    input: &Path,
    steps: Option<usize>,
    alpha: Option<f64>,
    output: Option<&Path>,
) -> Result<()> {
    let doc = load_input(input)?;
    let params = doc.params()?;
    let ys = doc.ys()?;
    let us = doc.us(ys.len())?;
    let future_us = doc.future_us(steps)?;

    let fr = ssm_inference::kalman_filter(&params, &ys, &us).context("kalman_filter failed")?;
    let fc =
        ssm_inference::forecast(&params, &fr, &us, &future_us).context("forecast failed")?;

    let mut output_json = serde_json::json!({
        "state_means": vecs_json(&fc.state_means),
        "state_covs": mats_json(&fc.state_covs),
        "obs_means": vecs_json(&fc.obs_means),
        "obs_covs": mats_json(&fc.obs_covs),
    });
    if let Some(alpha) = alpha {
        let iv = ssm_inference::forecast_intervals(&fc, alpha).context("forecast_intervals failed")?;
        if let Some(obj) = output_json.as_object_mut() {
            obj.insert("alpha".into(), serde_json::json!(iv.alpha));
            obj.insert("z".into(), serde_json::json!(iv.z));
            obj.insert("obs_lower".into(), serde_json::json!(vecs_json(&iv.obs_lower)));
            obj.insert("obs_upper".into(), serde_json::json!(vecs_json(&iv.obs_upper)));
        }
    }

    write_json(output, output_json)
}

fn rollout_inputs(doc: &input::InputJson, t_max: Option<usize>) -> Result<Vec<nalgebra::DVector<f64>>> {
    match t_max {
        Some(t) => {
            let us = doc.us(t)?;
            if us.len() != t {
                anyhow::bail!("us has {} steps but --t-max is {t}", us.len());
            }
            Ok(us)
        }
        None => doc.us(0).and_then(|us| {
            if us.is_empty() {
                anyhow::bail!("either us or --t-max is required");
            }
            Ok(us)
        }),
    }
}

fn cmd_simulate(input: &Path, t_max: Option<usize>, output: Option<&Path>) -> Result<()> {
    let doc = load_input(input)?;
    let params = doc.params()?;
    let us = rollout_inputs(&doc, t_max)?;
    let x0 = doc.x0()?.unwrap_or_else(|| params.mu0().clone());

    let sim = ssm_inference::simulate(&params, &x0, &us).context("simulate failed")?;

    let output_json = serde_json::json!({
        "states": vecs_json(&sim.states),
        "outputs": vecs_json(&sim.outputs),
    });
    write_json(output, output_json)
}

fn cmd_sample(input: &Path, t_max: Option<usize>, seed: u64, output: Option<&Path>) -> Result<()> {
    let doc = load_input(input)?;
    let params = doc.params()?;
    let us = rollout_inputs(&doc, t_max)?;

    let draw = ssm_inference::sample(&params, &us, seed).context("sample failed")?;

    let output_json = serde_json::json!({
        "seed": seed,
        "states": vecs_json(&draw.states),
        "outputs": vecs_json(&draw.outputs),
    });
    write_json(output, output_json)
}
