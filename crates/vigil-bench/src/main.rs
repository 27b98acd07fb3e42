//! vigil-bench: CLI tool for running inspection pipelines on image files.
//!
//! Loads an image and a JSON stage list, runs one or more inspection
//! cycles sequentially, and prints the per-stage report. Useful for:
//!
//! - Tuning ROI placement, thresholds and blob/locate parameters
//! - Measuring per-stage durations to identify bottlenecks
//! - Checking how a configuration change affects the verdict
//!
//! Set `RUST_LOG=vigil_pipeline=debug` to trace every stage.
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin vigil-bench -- --config stages.json <IMAGE_PATH>
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use vigil_pipeline::{Frame, InspectionRun, Pipeline, StageResult, StageStatus};

/// Inspection pipeline runner and diagnostics for vigil.
///
/// Runs the configured stages on a given image and prints per-stage
/// timing, measurements, and the overall verdict.
#[derive(Parser)]
#[command(name = "vigil-bench", version)]
struct Cli {
    /// Path to the input image (PNG, JPEG, BMP, WebP).
    image_path: PathBuf,

    /// Path to a JSON file holding the stage list.
    #[arg(long, conflicts_with = "config_json", required_unless_present = "config_json")]
    config: Option<PathBuf>,

    /// Stage list as a JSON string.
    #[arg(long)]
    config_json: Option<String>,

    /// Number of cycles to run.
    #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    runs: usize,

    /// Output results as JSON instead of the human-readable report.
    #[arg(long)]
    json: bool,

    /// Write the final working image of the first cycle to this file.
    #[arg(long)]
    output: Option<PathBuf>,
}

/// Read the stage list from `--config` or `--config-json`.
fn config_from_cli(cli: &Cli) -> Result<String, String> {
    if let Some(ref json) = cli.config_json {
        return Ok(json.clone());
    }
    let path = cli
        .config
        .as_ref()
        .ok_or_else(|| "one of --config or --config-json is required".to_owned())?;
    std::fs::read_to_string(path).map_err(|e| format!("Error reading {}: {e}", path.display()))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let pipeline = match config_from_cli(&cli)
        .and_then(|json| Pipeline::from_json(&json).map_err(|e| format!("Invalid config: {e}")))
    {
        Ok(p) => p,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let frame = match std::fs::read(&cli.image_path)
        .map_err(|e| format!("Error reading {}: {e}", cli.image_path.display()))
        .and_then(|bytes| Frame::decode(&bytes).map_err(|e| format!("Error decoding image: {e}")))
    {
        Ok(f) => f,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    eprintln!(
        "Image: {} ({}x{}, {} channel(s))",
        cli.image_path.display(),
        frame.width(),
        frame.height(),
        frame.channels(),
    );
    eprintln!("Stages: {}", pipeline.len());
    eprintln!("Runs: {}", cli.runs);
    eprintln!();

    let mut all_runs = Vec::with_capacity(cli.runs);

    for run in 0..cli.runs {
        if cli.runs > 1 {
            eprintln!("--- Run {}/{} ---", run + 1, cli.runs);
        }

        let inspection = match pipeline.run(&frame) {
            Ok(inspection) => inspection,
            Err(e) => {
                eprintln!("Pipeline error: {e}");
                return ExitCode::FAILURE;
            }
        };

        if cli.json {
            // The final image is left out; use --output to save it.
            let value = serde_json::json!({
                "results": inspection.results,
                "summary": inspection.summary,
            });
            match serde_json::to_string_pretty(&value) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("Error serializing results: {e}");
                    return ExitCode::FAILURE;
                }
            }
        } else {
            println!("{}", inspection.report());
        }

        if run == 0
            && let Some(ref path) = cli.output
        {
            match save_frame(&inspection.final_image, path) {
                Ok(()) => eprintln!("Final image written to {}", path.display()),
                Err(e) => eprintln!("Error writing final image to {}: {e}", path.display()),
            }
        }

        all_runs.push(inspection);

        if cli.runs > 1 {
            eprintln!();
        }
    }

    if cli.runs > 1 {
        print_multi_run_summary(&all_runs);
    }

    ExitCode::SUCCESS
}

fn save_frame(frame: &Frame, path: &Path) -> Result<(), image::ImageError> {
    match frame {
        Frame::Gray(img) => img.save(path),
        Frame::Color(img) => img.save(path),
    }
}

/// Print aggregated statistics across multiple runs.
///
/// Stage rows show how often each stage passed and errored, the region it
/// ran on in the first run, and its mean duration.
#[allow(clippy::cast_precision_loss)]
fn print_multi_run_summary(all_runs: &[InspectionRun]) {
    let Some(first) = all_runs.first() else {
        return;
    };
    let n = all_runs.len();
    let totals: Vec<f64> = all_runs.iter().map(|r| r.summary.total_time_ms).collect();
    let fastest = totals.iter().copied().fold(f64::INFINITY, f64::min);
    let slowest = totals.iter().copied().fold(0.0, f64::max);
    let verdicts = all_runs.iter().filter(|r| r.summary.overall_pass).count();

    println!();
    println!("Verdict over {n} cycles: {verdicts} PASS, {} FAIL", n - verdicts);
    println!(
        "Cycle time: fastest {fastest:.3}ms, mean {:.3}ms, slowest {slowest:.3}ms",
        totals.iter().sum::<f64>() / n as f64
    );
    println!();
    println!(
        "{:<20} {:>7} {:>7} {:<22} {:>10}",
        "stage", "pass", "errors", "region", "mean ms"
    );

    for (index, stage) in first.results.iter().enumerate() {
        let runs: Vec<&StageResult> = all_runs.iter().filter_map(|r| r.results.get(index)).collect();
        let pass = if stage.pass.is_some() {
            let passed = runs.iter().filter(|r| r.pass == Some(true)).count();
            format!("{passed}/{}", runs.len())
        } else {
            "-".to_owned()
        };
        let errors = runs.iter().filter(|r| r.status == StageStatus::Error).count();
        let region = match (stage.effective_roi, stage.roi_degenerate) {
            (_, true) => "degenerate".to_owned(),
            (Some(b), false) => format!("{}x{}@({},{})", b.width, b.height, b.x, b.y),
            (None, false) => "full".to_owned(),
        };
        let mean = runs.iter().map(|r| r.processing_time_ms).sum::<f64>() / runs.len() as f64;
        println!(
            "{:<20} {pass:>7} {errors:>7} {region:<22} {mean:>10.3}",
            stage.stage_name
        );
    }
}
