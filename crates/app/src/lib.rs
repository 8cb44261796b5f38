use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use upscale_core::backend::InferenceBackend;
use upscale_core::config::{config_path, data_dir, AppConfig};
use upscale_core::device::DevicePreference;
use upscale_core::inspect::inspect_checkpoint;
use upscale_core::logging::{
    self, CrashHookPlan, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER,
};
use upscale_core::{upscale, UpscaleOptions, UpscaleRequest};

#[derive(Parser, Debug)]
#[command(
    name = "upscale",
    about = "Upscale a single image with a super-resolution checkpoint",
    args_conflicts_with_subcommands = true,
    subcommand_negates_reqs = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    upscale: UpscaleArgs,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, value_name = "PATH", global = true, help = "TOML config file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "PATH",
        global = true,
        help = "Directory for config, logs and crash reports"
    )]
    data_dir: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_parser = ["auto", "cpu", "cuda", "metal"],
        help = "Compute device (overrides the config file)"
    )]
    device: Option<String>,

    #[arg(
        long = "onnx-backend",
        global = true,
        value_parser = ["cpu", "cuda", "tensorrt", "trt"],
        help = "Execution provider for ONNX models (overrides the config file)"
    )]
    onnx_backend: Option<String>,
}

#[derive(Args, Debug)]
struct UpscaleArgs {
    #[arg(short = 'i', long, required = true, help = "Input image")]
    input: Option<PathBuf>,

    #[arg(
        short = 'o',
        long,
        required = true,
        help = "Output image; the extension picks the format"
    )]
    output: Option<PathBuf>,

    #[arg(
        short = 'm',
        long,
        required = true,
        help = "Model checkpoint (.pth, .safetensors or .onnx)"
    )]
    model: Option<PathBuf>,

    #[arg(
        short = 'd',
        long,
        value_name = "SIZE",
        value_parser = clap::value_parser!(u32).range(1..),
        help = "Resize the input so its longer side is SIZE before upscaling"
    )]
    downscale: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print what a model file contains as JSON.
    Inspect {
        #[arg(help = "Model file")]
        model: PathBuf,
    },
}

impl UpscaleArgs {
    fn into_request(self) -> Result<UpscaleRequest> {
        Ok(UpscaleRequest {
            input: self.input.context("--input is required")?,
            output: self.output.context("--output is required")?,
            model: self.model.context("--model is required")?,
            downscale: self.downscale,
        })
    }
}

pub fn run_from_env() -> Result<()> {
    run(Cli::parse())
}

fn run(cli: Cli) -> Result<()> {
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());
    let config = AppConfig::load(cli.config.as_deref(), resolved_data_dir.as_deref());

    upscale_core::runtime::setup_runtime_libs();
    init_logging(
        resolved_data_dir.as_deref(),
        cli.verbose,
        cli.log_filter.as_deref(),
        config.as_ref().map_or(logging::DEFAULT_LOG_RETENTION_FILES, |c| c.logging.retention_files),
    );
    upscale_core::runtime::log_runtime_lib_status();
    log_startup_metadata(resolved_data_dir.as_deref(), cli.config.as_deref());

    let mut config = config?;
    if let Some(device) = cli.device.as_deref() {
        config.inference.device = DevicePreference::from_str_lossy(device);
    }
    if let Some(backend) = cli.onnx_backend.as_deref() {
        config.inference.onnx_backend = InferenceBackend::from_str_lossy(backend);
    }

    match cli.command {
        Some(Commands::Inspect { model }) => {
            let report = inspect_checkpoint(&model)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        None => {
            let request = cli.upscale.into_request()?;
            let options =
                UpscaleOptions::from_config(&config.inference, resolved_data_dir.as_deref());
            info!(
                input = %request.input.display(),
                model = %request.model.display(),
                downscale = request.downscale,
                device = %options.device,
                "Upscaling"
            );
            let summary = upscale(&request, &options)?;
            info!(
                model = %summary.model.name,
                scale = summary.model.scale,
                alpha_passes = summary.alpha_passes,
                "Done"
            );
            Ok(())
        }
    }
}

fn log_filter_options(
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
    retention_files: usize,
) -> LoggingInitOptions {
    LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        retention_files,
        ..Default::default()
    }
}

fn init_logging(
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
    retention_files: usize,
) {
    let crash_hook_plan = logging::install_panic_hook(data_dir);

    let init_options = log_filter_options(data_dir, verbose, cli_log_filter, retention_files);
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let filter = init_plan.filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(appender)
                        .with_filter(parse_env_filter_with_fallback(&filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&filter, "console")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            // Without a data directory console-only logging is the normal mode.
            if let Some(attempted_log_dir) = attempted_log_dir {
                warn!(
                    attempted_log_dir = %attempted_log_dir.display(),
                    reason = %reason,
                    "Persistent file logging unavailable; continuing with console-only logging"
                );
            }
        }
    }

    if let CrashHookPlan::Fallback {
        attempted_crash_dir: Some(attempted_crash_dir),
        reason,
    } = crash_hook_plan
    {
        warn!(
            attempted_crash_dir = %attempted_crash_dir.display(),
            reason = %reason,
            "Panic crash report hook unavailable; continuing without crash reports"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: Option<&Path>, explicit_config: Option<&Path>) {
    let pid = std::process::id();
    let cfg_path = explicit_config
        .map(Path::to_path_buf)
        .or_else(|| data_dir.map(config_path));
    match (data_dir, cfg_path) {
        (Some(data_dir), Some(cfg_path)) => info!(
            pid,
            data_dir = %data_dir.display(),
            config_path = %cfg_path.display(),
            "Runtime startup metadata"
        ),
        (None, Some(cfg_path)) => {
            info!(pid, config_path = %cfg_path.display(), "Runtime startup metadata")
        }
        _ => info!(pid, "Runtime startup metadata"),
    }
}
