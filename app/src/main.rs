use clap::Parser;
use motrack_app::{run, Cli, DirectorySource, FrameSource, SyntheticSource};
use mt_config::Config;
use mt_core::telemetry;
use std::process;
use validator::Validate;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load configuration - exit with non-zero if invalid
    let mut config = match Config::load_from(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            telemetry::init_tracing("development", "motrack");
            tracing::error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };
    telemetry::init_tracing(&config.telemetry.environment, &config.telemetry.service_name);
    tracing::info!("motrack starting");

    if cli.record {
        config.recording.enable_recording = true;
    }
    if let Some(path) = cli.save_path {
        config.recording.save_path = path;
    }
    if let Some(fps) = cli.fps {
        config.capture.fps = fps;
    }
    if let Err(e) = config.validate() {
        tracing::error!("Invalid command-line overrides: {}", e);
        process::exit(1);
    }
    tracing::debug!(?config, "Configuration loaded successfully");

    let source: Box<dyn FrameSource> = match (&cli.source.input, cli.source.synthetic) {
        (Some(dir), _) => match DirectorySource::open(dir) {
            Ok(source) => Box::new(source),
            Err(e) => {
                tracing::error!("Failed to open frame source: {}", e);
                process::exit(1);
            }
        },
        (None, Some(frames)) => Box::new(SyntheticSource::new(frames)),
        (None, None) => {
            tracing::error!("No frame source given");
            process::exit(1);
        }
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let settings = config.recording.clone();
    if let Err(e) = run(&config, settings, source, std::io::stdout(), shutdown).await {
        tracing::error!("Analysis failed: {}", e);
        process::exit(1);
    }
}
