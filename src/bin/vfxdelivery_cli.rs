//! VFX Delivery CLI
//!
//! Commands: check-config, plan, deliver, resolve-version, evaluate
//! Outputs JSON to stdout, logs to stderr
//! Exit code 1 on error, 2 when a plan or delivery has failures

use chrono::{Local, NaiveDate, NaiveDateTime};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vfxdelivery_core::{
    entity::Fields,
    execution::{CommandRenderer, FsExecutor},
    expression::{Expression, ExpressionContext},
    planner::Planned,
    DeliveryBatch, DeliveryPipeline, PlanRequest, SnapshotStore, ENGINE_VERSION,
};

#[derive(Parser)]
#[command(name = "vfxdelivery-cli")]
#[command(about = "VFX Delivery CLI - plans, versions and ships deliverables")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the delivery configuration
    #[arg(short, long, default_value = "delivery.json", global = true)]
    config: PathBuf,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

/// Options shared by every command that plans a batch
#[derive(clap::Args)]
struct PlanArgs {
    /// Tracking snapshot (JSON)
    #[arg(short, long)]
    snapshot: PathBuf,

    /// Delivery date, defaults to today
    #[arg(long)]
    date: Option<NaiveDate>,

    /// Use this version tag instead of resolving one
    #[arg(long = "version-tag")]
    version_tag: Option<String>,

    /// Deliver under this root instead of the configured one
    #[arg(long)]
    destination: Option<PathBuf>,

    /// Submission note replacing the Version's note on preview slates
    #[arg(long)]
    note: Option<String>,
}

impl PlanArgs {
    fn request(&self) -> PlanRequest {
        let now = Local::now().naive_local();
        let timestamp = match self.date {
            Some(date) => NaiveDateTime::new(date, now.time()),
            None => now,
        };
        let mut request = PlanRequest::new(timestamp);
        request.manual_version = self.version_tag.clone();
        request.destination_root = self.destination.clone();
        request.preview_submission_note = self.note.clone();
        request
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the configuration
    CheckConfig,

    /// Plan a delivery batch without touching the delivery tree
    Plan {
        #[command(flatten)]
        args: PlanArgs,
    },

    /// Plan, execute and commit statuses
    Deliver {
        #[command(flatten)]
        args: PlanArgs,

        /// Render program receiving each job as a JSON argument
        #[arg(long)]
        renderer: PathBuf,

        /// Extra arguments passed to the renderer before the job
        #[arg(long = "renderer-arg")]
        renderer_args: Vec<String>,
    },

    /// Print the delivery version the next batch would use
    ResolveVersion {
        #[command(flatten)]
        args: PlanArgs,
    },

    /// Evaluate a field expression
    Evaluate {
        /// Expression text, e.g. "<shot.code>_<date.%Y%m%d>"
        expression: String,

        /// JSON object with optional fields/project/shot/version maps
        #[arg(long, default_value = "{}")]
        context: String,

        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EvaluateContext {
    fields: Fields,
    project: Fields,
    shot: Fields,
    version: Fields,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("vfxdelivery_core={0},vfxdelivery_cli={0},warn", cli.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Evaluate { expression, context, date } => evaluate(&expression, &context, date),
        command => {
            let pipeline = match DeliveryPipeline::load(&cli.config) {
                Ok(p) => p,
                Err(e) => return failure(format!("Failed to load configuration: {}", e)),
            };
            run(&pipeline, command)
        }
    }
}

fn run(pipeline: &DeliveryPipeline, command: Commands) -> ExitCode {
    match command {
        Commands::CheckConfig => {
            let config = pipeline.config();
            let templates = match config.template_registry() {
                Ok(registry) => registry.list().iter().map(|t| t.name.to_string()).collect::<Vec<_>>(),
                Err(e) => return failure(e),
            };
            emit(&serde_json::json!({
                "valid": true,
                "engine_version": ENGINE_VERSION,
                "templates": templates,
                "sequence_outputs": config.sequence_outputs.len(),
                "preview_outputs": config.preview_outputs.len(),
                "version_overrides": config.version_overrides.len(),
                "csv_columns": config.default_csv.iter().map(|c| &c.name).collect::<Vec<_>>(),
            }));
            ExitCode::SUCCESS
        }

        Commands::Plan { args } => match plan(pipeline, &args) {
            Ok((batch, _)) => {
                emit(&batch);
                if has_failures(&batch) {
                    ExitCode::from(2)
                } else {
                    ExitCode::SUCCESS
                }
            }
            Err(code) => code,
        },

        Commands::ResolveVersion { args } => match plan(pipeline, &args) {
            Ok((batch, _)) => {
                emit(&serde_json::json!({
                    "folders": batch.folders,
                    "warnings": batch.warnings,
                }));
                ExitCode::SUCCESS
            }
            Err(code) => code,
        },

        Commands::Deliver { args, renderer, renderer_args } => {
            let (mut batch, mut store) = match plan(pipeline, &args) {
                Ok(planned) => planned,
                Err(code) => return code,
            };
            let executor = FsExecutor::new(CommandRenderer::new(renderer).with_args(renderer_args));

            let report = match pipeline.deliver(&mut batch, &executor, &mut store) {
                Ok(report) => report,
                Err(e) => return failure(e),
            };
            if let Err(e) = store.save() {
                error!("Statuses committed but snapshot not saved: {}", e);
                return failure(e);
            }

            emit(&serde_json::json!({ "success": !report.has_failures(), "report": report }));
            if report.has_failures() {
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            }
        }

        Commands::Evaluate { .. } => ExitCode::FAILURE,
    }
}

fn plan(pipeline: &DeliveryPipeline, args: &PlanArgs) -> Result<(DeliveryBatch, SnapshotStore), ExitCode> {
    let store = load_store(&args.snapshot)?;
    let snapshot = pipeline.snapshot(&store).map_err(failure)?;
    let batch = pipeline.plan(&snapshot, args.request()).map_err(failure)?;
    let tags: Vec<&str> = batch.folders.iter().map(|f| f.delivery_version.tag.as_str()).collect();
    info!("Planned batch {} ({})", batch.id, tags.join(", "));
    Ok((batch, store))
}

fn load_store(path: &Path) -> Result<SnapshotStore, ExitCode> {
    SnapshotStore::load(path).map_err(failure)
}

fn has_failures(batch: &DeliveryBatch) -> bool {
    batch.units.iter().any(|unit| {
        matches!(unit.sequence, Planned::Failed { .. }) || matches!(unit.preview, Planned::Failed { .. })
    })
}

fn evaluate(text: &str, context: &str, date: Option<NaiveDate>) -> ExitCode {
    let context: EvaluateContext = match serde_json::from_str(context) {
        Ok(c) => c,
        Err(e) => return failure(format!("Invalid context: {}", e)),
    };
    let now = Local::now().naive_local();
    let timestamp = date.map_or(now, |date| NaiveDateTime::new(date, now.time()));

    let expression = Expression::parse(text);
    if let Err(e) = expression.validate() {
        return failure(e);
    }
    let ctx = ExpressionContext::new(timestamp)
        .with_fields(&context.fields)
        .with_project(&context.project)
        .with_shot(&context.shot)
        .with_version(&context.version);

    match expression.evaluate(&ctx) {
        Ok(value) => {
            emit(&serde_json::json!({ "success": true, "value": value }));
            ExitCode::SUCCESS
        }
        Err(e) => {
            emit(&serde_json::json!({ "success": false, "error": e.to_string() }));
            ExitCode::from(2)
        }
    }
}

fn emit<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Failed to serialize output: {}", e),
    }
}

fn failure(e: impl Display) -> ExitCode {
    let output = serde_json::json!({ "success": false, "error": e.to_string() });
    println!("{}", output);
    ExitCode::FAILURE
}
