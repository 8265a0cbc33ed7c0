use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use leukoscan::annotation::AnnotationRenderer;
use leukoscan::config::{PipelineConfig, TensorLayout};
use leukoscan::core::db::ArtifactDb;
use leukoscan::core::store::RecordRepository;
use leukoscan::{InferenceServices, PatientRef, Pipeline};

#[derive(Parser)]
#[command(name = "leukoscan")]
#[command(about = "Detect and classify white blood cells in blood smear images")]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding region crops, overview images and the results database
    #[arg(long, value_name = "DIR", global = true, env = "LEUKOSCAN_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run detection and classification on one smear image
    Analyze(AnalyzeArgs),
    /// List stored classification records for a patient
    Results {
        /// Patient the records belong to
        #[arg(long)]
        patient: i64,
    },
}

#[derive(Args)]
struct AnalyzeArgs {
    /// Path to input image file
    #[arg(value_name = "IMAGE")]
    image_path: PathBuf,

    /// Patient the results are recorded for
    #[arg(long)]
    patient: i64,

    /// Detection confidence threshold
    #[arg(long)]
    threshold: Option<f32>,

    /// Region detector model (.rten)
    #[arg(long, value_name = "FILE")]
    detector_model: Option<PathBuf>,

    /// Cell-type classifier model (.rten)
    #[arg(long, value_name = "FILE")]
    classifier_model: Option<PathBuf>,

    /// Classifier input layout (nhwc or nchw)
    #[arg(long)]
    classifier_layout: Option<TensorLayout>,

    /// TrueType font for overview labels
    #[arg(long, value_name = "FILE")]
    font: Option<PathBuf>,

    /// Regions classified concurrently
    #[arg(long)]
    workers: Option<usize>,

    /// Give up after this many seconds
    #[arg(long)]
    deadline_secs: Option<u64>,
}

impl AnalyzeArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(v) = self.threshold {
            config.conf_threshold = v;
        }
        if let Some(v) = &self.detector_model {
            config.models.detector_path = v.clone();
        }
        if let Some(v) = &self.classifier_model {
            config.models.classifier_path = v.clone();
        }
        if let Some(v) = self.classifier_layout {
            config.models.classifier_layout = v;
        }
        if let Some(v) = &self.font {
            config.render.font_path = Some(v.clone());
        }
        if let Some(v) = self.workers {
            config.workers = v;
        }
        if let Some(v) = self.deadline_secs {
            config.deadline = Duration::from_secs(v);
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "leukoscan=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Cli::parse();
    init_tracing(args.verbose);

    let mut config = PipelineConfig::from_env()?;
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir = dir.clone();
    }

    match args.command {
        Command::Analyze(analyze) => {
            analyze.apply(&mut config);
            config.validate()?;
            analyze_image(&analyze, &config).await
        }
        Command::Results { patient } => list_results(PatientRef(patient), &config).await,
    }
}

async fn analyze_image(args: &AnalyzeArgs, config: &PipelineConfig) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(&args.image_path)
        .await
        .with_context(|| format!("Failed to read image {:?}", args.image_path))?;

    let services = InferenceServices::init_global(&config.models)?;
    let renderer = AnnotationRenderer::new(config.render.clone())?;
    let store = ArtifactDb::new(&config.storage)
        .await
        .context("Failed to open artifact store")?;
    let pipeline = Pipeline::new(services, renderer, store).with_config(config);

    let source_name = args
        .image_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload");
    let result = pipeline.run(&bytes, source_name, PatientRef(args.patient)).await;

    match result {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(err) => {
            let hint = if err.is_retryable() { " (retryable)" } else { "" };
            Err(anyhow::anyhow!("{:?}{}: {}", err.kind(), hint, err))
        }
    }
}

async fn list_results(patient: PatientRef, config: &PipelineConfig) -> anyhow::Result<()> {
    let store = ArtifactDb::new(&config.storage)
        .await
        .context("Failed to open artifact store")?;
    let records = store.records_for_patient(patient).await?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}
