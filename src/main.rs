use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use soc_range::artifact::{self, PredictionArtifact};
use soc_range::evaluate::{evaluate_csv, write_rows};
use soc_range::range::{consumption_curve, reference_speeds, Terrain, Weather};
use soc_range::serve::{predict_and_derive, PredictionRequest};
use soc_range::train::train_from_csv;
use soc_range::{CancelToken, Settings};
use std::fs::File;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "soc-range")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Train and serve the EV state-of-charge and range estimator", long_about = None)]
struct Cli {
    /// Settings file (TOML); falls back to SOC_RANGE_CONFIG, then ./soc_range.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug-level logging unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Grid-search a forest on a telemetry CSV and write the artifact
    Train {
        #[arg(short, long)]
        input: PathBuf,
        /// Defaults to serve.artifact_path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Predict SoC, range and efficiency for one driving situation
    Predict {
        #[arg(short, long, env = "SOC_RANGE_ARTIFACT")]
        artifact: Option<PathBuf>,
        #[arg(long)]
        speed: f64,
        #[arg(long)]
        acceleration: f64,
        #[arg(long)]
        braking: f64,
        #[arg(long)]
        terrain: String,
        #[arg(long)]
        weather: String,
        #[arg(long)]
        prev_soc: f64,
    },
    /// Score an artifact against labelled telemetry
    Evaluate {
        #[arg(short, long, env = "SOC_RANGE_ARTIFACT")]
        artifact: Option<PathBuf>,
        #[arg(short, long)]
        input: PathBuf,
        /// Per-row results CSV
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the consumption rate over the reference speed sweep
    Curve {
        #[arg(long, default_value = "Flat")]
        terrain: String,
        #[arg(long, default_value = "Normal")]
        weather: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;

    match cli.command {
        Command::Train { input, output } => {
            let outcome = train_from_csv(&input, &settings.training, CancelToken::new())
                .with_context(|| format!("training on {} failed", input.display()))?;
            let path = output.unwrap_or_else(|| settings.serve.artifact_path.clone());
            outcome.artifact.save(&path).context("failed to write artifact")?;

            let meta = &outcome.artifact.metadata;
            info!(
                rows_read = outcome.load_report.rows_read,
                dropped = outcome.load_report.dropped(),
                feature_rows = outcome.feature_rows,
                "data summary"
            );
            for (rank, score) in outcome.ranking().iter().take(5).enumerate() {
                info!("#{} {} cv MAE {:.3} (± {:.3})", rank + 1, score.params, score.mean_mae, score.std_mae);
            }
            info!("best parameters: {}", meta.params);
            info!("cv MAE: {:.3} (± {:.3})", meta.cv_mae, meta.cv_mae_std);
            if let Some(h) = &meta.holdout {
                info!("holdout MAE: {:.3}, RMSE: {:.3} over {} rows", h.mae, h.rmse, h.rows);
                if let Some(b) = h.baseline_mae {
                    info!("linear baseline MAE: {:.3}", b);
                }
            }
            info!("artifact {} written to {}", outcome.artifact.version(), path.display());
        }
        Command::Predict {
            artifact: artifact_path,
            speed,
            acceleration,
            braking,
            terrain,
            weather,
            prev_soc,
        } => {
            let path = artifact_path.unwrap_or_else(|| settings.serve.artifact_path.clone());
            let model = artifact::shared(&path).context("failed to load artifact")?;
            let request = PredictionRequest {
                speed,
                acceleration,
                braking,
                terrain,
                weather,
                prev_soc,
            };
            let result = predict_and_derive(&model, &request, &settings.serve)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Evaluate {
            artifact: artifact_path,
            input,
            output,
        } => {
            let path = artifact_path.unwrap_or_else(|| settings.serve.artifact_path.clone());
            let model = PredictionArtifact::load(&path).context("failed to load artifact")?;
            let evaluation = evaluate_csv(&model, &input, &settings.serve)
                .with_context(|| format!("evaluation on {} failed", input.display()))?;
            if let Some(out) = output {
                let file = File::create(&out).with_context(|| format!("cannot create {}", out.display()))?;
                write_rows(&evaluation.rows, file)?;
                info!("wrote {} rows to {}", evaluation.rows.len(), out.display());
            }
            println!("{}", serde_json::to_string_pretty(&evaluation.summary)?);
        }
        Command::Curve { terrain, weather } => {
            let curve = consumption_curve(
                settings.serve.weather_penalty,
                Terrain::from_label(&terrain),
                Weather::from_label(&weather),
                reference_speeds(),
            );
            for (speed, rate) in curve {
                println!("{speed:>5.0} km/h  {rate:.4} kWh/km");
            }
        }
    }

    Ok(())
}
