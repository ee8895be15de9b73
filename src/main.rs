//! CLI Entry Point for nrn-viewer
//!
//! Runs a headless viewer session against a simulation backend:
//! - Loads a model by identifier or from an archive URL
//! - Optionally switches to the dendrogram view, places the current clamp and runs a
//!   simulation
//! - Writes the final traces as CSV
//!
//! # Usage
//!
//! ```bash
//! nrn-viewer --model model-42 --view dendrogram
//! nrn-viewer --url https://example.org/cell.zip --run --record "dend[3]_0" --export sim.csv
//! ```

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{ArgGroup, Parser, ValueEnum};
use nrn_viewer::app::{App, RunOptions, TracingRenderer};
use nrn_viewer::config::{ViewerConfig, DEFAULT_CONFIG_FILE};
use nrn_viewer::params::MAX_RECORDING_SITES;
use nrn_viewer::tracing_setup::{self, OutputFormat, TracingConfig};
use nrn_viewer::transport::{self, Target, WebSocketConnector};
use nrn_viewer::viewer::{ViewMode, Viewer};
use tracing::info;

#[derive(Parser)]
#[command(name = "nrn-viewer")]
#[command(about = "Headless NEURON morphology viewer with live voltage overlay", long_about = None)]
#[command(group(ArgGroup::new("target").required(true).args(["model", "url"])))]
struct Cli {
    /// Model identifier to load
    #[arg(long)]
    model: Option<String>,

    /// Model archive URL to load
    #[arg(long)]
    url: Option<String>,

    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Backend base URL (overrides the configuration)
    #[arg(long)]
    base_url: Option<String>,

    /// View to show once the model is loaded
    #[arg(long, value_enum, default_value_t = ViewArg::ThreeD)]
    view: ViewArg,

    /// Start a simulation once the morphology arrives and exit when it finishes
    #[arg(long)]
    run: bool,

    /// Segment to record, such as `dend[3]_0` (repeatable)
    #[arg(long = "record", value_name = "SEGMENT")]
    record: Vec<String>,

    /// Section to place the current clamp on
    #[arg(long, value_name = "SECTION")]
    iclamp: Option<String>,

    /// Write the final traces to this CSV file; recorded sites go to `<stem>.recordings.csv`
    #[arg(long, value_name = "PATH")]
    export: Option<PathBuf>,

    /// Keep dendrogram parents at least as wide as their own footprint
    #[arg(long)]
    clamp_dendrogram: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, ValueEnum)]
enum ViewArg {
    /// Anatomical 3-D view
    #[value(name = "3d")]
    ThreeD,
    /// Flat dendrogram view
    Dendrogram,
}

impl From<ViewArg> for ViewMode {
    fn from(view: ViewArg) -> Self {
        match view {
            ViewArg::ThreeD => ViewMode::Anatomical,
            ViewArg::Dendrogram => ViewMode::Dendrogram,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl From<LogFormat> for OutputFormat {
    fn from(format: LogFormat) -> Self {
        match format {
            LogFormat::Pretty => OutputFormat::Pretty,
            LogFormat::Compact => OutputFormat::Compact,
            LogFormat::Json => OutputFormat::Json,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ViewerConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if let Some(base_url) = &cli.base_url {
        config.session.base_url = base_url.clone();
    }
    if cli.clamp_dendrogram {
        config.view.clamp_dendrogram = true;
    }
    config.validate().context("Invalid configuration")?;

    let tracing_config = TracingConfig::from_viewer_config(&config)
        .map_err(|e| anyhow!(e))?
        .with_format(cli.log_format.into());
    tracing_setup::init(tracing_config).map_err(|e| anyhow!(e))?;

    if cli.record.len() > MAX_RECORDING_SITES {
        anyhow::bail!(
            "At most {MAX_RECORDING_SITES} recording sites are supported, got {}",
            cli.record.len()
        );
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    runtime.block_on(run(cli, config))
}

async fn run(cli: Cli, config: ViewerConfig) -> Result<()> {
    let target = match (cli.model, cli.url) {
        (Some(model), _) => Target::Model(model),
        (None, Some(url)) => Target::Url(url),
        (None, None) => anyhow::bail!("Either --model or --url is required"),
    };

    let session_options = config
        .session_options()
        .context("Invalid backend endpoint")?;
    info!(
        app = %config.application.name,
        endpoint = %session_options.endpoint,
        target = %target,
        "Starting viewer"
    );

    let connector = WebSocketConnector::new(config.connect_timeout());
    let (session, inbound, task) = transport::spawn(connector, session_options);
    let mut viewer = Viewer::new(
        config.camera_settings(),
        config.tween_duration().as_secs_f64() * 1000.0,
    );
    viewer.set_layout_options(config.layout_options());

    let mut options = RunOptions::new(target);
    options.view = cli.view.into();
    options.run = cli.run;
    options.record = cli.record;
    options.iclamp = cli.iclamp;
    options.export = cli.export;
    options.frame_interval = config.frame_interval();

    let mut app = App::new(viewer, session, inbound, TracingRenderer::default(), options);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let summary = app.run(shutdown).await.context("Viewer session failed")?;
    task.abort();

    println!("Frames applied: {}", summary.frames_applied);
    if let Some(result) = &summary.result {
        println!("Simulation rows: {}", result.rows.len());
    }
    if let Some(path) = &summary.exported {
        println!("Exported: {}", path.display());
    }
    if let Some(path) = &summary.recordings_exported {
        println!("Recordings: {}", path.display());
    }
    for notification in &summary.notifications {
        println!("{notification}");
    }
    println!("Rendered frames: {}", app.renderer().frames());

    if cli.run && summary.result.is_none() && summary.final_state.is_terminal() {
        anyhow::bail!("Session ended before the simulation finished");
    }
    Ok(())
}
