use std::path::PathBuf;
use std::process::{Command, Output};

fn bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_ssm"))
}

fn repo_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..").canonicalize().unwrap()
}

fn fixture_path(name: &str) -> PathBuf {
    repo_root().join("tests/fixtures").join(name)
}

fn run(args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {:?} {:?}: {}", bin_path(), args, e))
}

fn run_json(args: &[&str]) -> serde_json::Value {
    let out = run(args);
    assert!(
        out.status.success(),
        "{:?} should succeed, stderr={}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    serde_json::from_slice(&out.stdout).expect("stdout should be valid JSON")
}

fn f64_rows(v: &serde_json::Value) -> Vec<Vec<f64>> {
    v.as_array()
        .expect("array")
        .iter()
        .map(|row| row.as_array().expect("row").iter().map(|x| x.as_f64().unwrap()).collect())
        .collect()
}

#[test]
fn filter_contract_with_missing_step() {
    let input = fixture_path("tracking.json");
    assert!(input.exists(), "missing fixture: {}", input.display());

    let v = run_json(&["filter", "--input", input.to_string_lossy().as_ref()]);
    assert!(v["log_likelihood"].as_f64().unwrap().is_finite());

    let fm = f64_rows(&v["filtered_means"]);
    let pm = f64_rows(&v["predicted_means"]);
    assert_eq!(fm.len(), 6);
    // Step 2 is missing: no update, zero innovation.
    assert_eq!(fm[2], pm[2]);
    assert_eq!(f64_rows(&v["innovations"])[2], vec![0.0]);
    // First prediction is the prior mean.
    assert_eq!(pm[0], vec![0.0, 1.0]);
}

#[test]
fn filter_local_level_contract() {
    let input = fixture_path("local_level.json");
    let v = run_json(&["filter", "--input", input.to_string_lossy().as_ref()]);
    assert!(v["log_likelihood"].as_f64().unwrap().is_finite());
    assert_eq!(v["gains"].as_array().unwrap().len(), 5);
}

#[test]
fn smooth_contract_terminal_equals_filtered() {
    let input = fixture_path("tracking.json");
    let v = run_json(&["smooth", "--input", input.to_string_lossy().as_ref()]);

    let sm = f64_rows(&v["smoothed_means"]);
    let fm = f64_rows(&v["filtered_means"]);
    assert_eq!(sm.len(), 6);
    assert_eq!(sm.last(), fm.last());
    assert_eq!(v["smoother_gains"].as_array().unwrap().len(), 5);
}

#[test]
fn em_contract() {
    let input = fixture_path("em_input.json");
    let v = run_json(&["em", "--input", input.to_string_lossy().as_ref(), "--nx", "1"]);

    // n_iter comes from the "em" section of the input.
    assert_eq!(v["n_iter"].as_u64(), Some(10));
    assert_eq!(v["loglik_trace"].as_array().unwrap().len(), 11);
    assert_eq!(v["monotone"].as_bool(), Some(true));
    assert_eq!(v["converged"].as_bool(), Some(false));

    let a = f64_rows(&v["a"]);
    assert_eq!(a.len(), 1);
    assert!((a[0][0] - 0.8).abs() < 0.15, "a = {a:?}");
    assert_eq!(f64_rows(&v["c"]).len(), 2);
    let b = f64_rows(&v["b"]);
    assert_eq!((b.len(), b[0].len()), (1, 1));
}

#[test]
fn em_flag_overrides_input_config() {
    let input = fixture_path("em_input.json");
    let v = run_json(&[
        "em",
        "--input",
        input.to_string_lossy().as_ref(),
        "--nx",
        "1",
        "--n-iter",
        "3",
    ]);
    assert_eq!(v["n_iter"].as_u64(), Some(3));
    assert_eq!(v["loglik_trace"].as_array().unwrap().len(), 4);
}

#[test]
fn em_rejects_missing_observations() {
    let input = fixture_path("local_level.json");
    let out = run(&["em", "--input", input.to_string_lossy().as_ref(), "--nx", "1"]);
    // local_level.json has a null observation.
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("em_fit failed"), "stderr={stderr}");
}

#[test]
fn forecast_contract_with_intervals() {
    let input = fixture_path("tracking.json");
    let v = run_json(&[
        "forecast",
        "--input",
        input.to_string_lossy().as_ref(),
        "--alpha",
        "0.05",
    ]);

    let means = f64_rows(&v["obs_means"]);
    let lo = f64_rows(&v["obs_lower"]);
    let hi = f64_rows(&v["obs_upper"]);
    assert_eq!(means.len(), 3);
    for k in 0..3 {
        assert!(lo[k][0] < means[k][0] && means[k][0] < hi[k][0]);
    }
    assert!((v["z"].as_f64().unwrap() - 1.959964).abs() < 1e-5);
}

#[test]
fn forecast_steps_without_future_inputs() {
    let input = fixture_path("local_level.json");
    let v = run_json(&["forecast", "--input", input.to_string_lossy().as_ref(), "--steps", "4"]);
    assert_eq!(v["state_means"].as_array().unwrap().len(), 4);
    assert!(v.get("obs_lower").is_none());
}

#[test]
fn simulate_contract() {
    let input = fixture_path("controlled.json");
    let v = run_json(&["simulate", "--input", input.to_string_lossy().as_ref()]);
    assert_eq!(f64_rows(&v["states"]), vec![vec![4.0], vec![4.0], vec![2.0], vec![-1.0]]);
    assert_eq!(f64_rows(&v["outputs"]), vec![vec![13.0], vec![12.0], vec![5.0]]);
}

#[test]
fn sample_is_deterministic_per_seed() {
    let input = fixture_path("controlled.json");
    let path = input.to_string_lossy();
    let a = run_json(&["sample", "--input", path.as_ref(), "--seed", "7"]);
    let b = run_json(&["sample", "--input", path.as_ref(), "--seed", "7"]);
    assert_eq!(a["outputs"], b["outputs"]);
    assert_eq!(a["states"].as_array().unwrap().len(), 4);
}

#[test]
fn shape_mismatch_is_reported() {
    let dir = std::env::temp_dir().join(format!("ssm-cli-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let input = dir.join("bad_us.json");
    std::fs::write(
        &input,
        r#"{"local_level": {"q": 0.1, "r": 0.2}, "ys": [[1.0], [2.0]], "us": [[1.0], [2.0]]}"#,
    )
    .unwrap();

    let out = run(&["filter", "--input", input.to_string_lossy().as_ref()]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("shape mismatch"), "stderr={stderr}");
}

#[test]
fn version_prints_crate_version() {
    let out = run(&["version"]);
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).starts_with("ssm "));
}
