use std::{path::PathBuf, process::ExitCode};

use ::tracing::{error, info_span};
use clap::{Parser, Subcommand};
use config::PipelineConfig;
use service::Service;

mod config;
mod error;
mod index_store;
mod pipeline;
mod renderer;
mod service;
mod tracing;
use tracing::setup_tracing;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every configured product once and exit.
    Run,
    /// Run on the configured schedule until interrupted.
    Serve,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => PipelineConfig::from_path(&path),
        None => PipelineConfig::from_env(),
    };
    let config = match config {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {:#}", err);
            return ExitCode::FAILURE;
        }
    };

    let tracing_provider = match setup_tracing(&config) {
        Ok(provider) => provider,
        Err(err) => {
            eprintln!("error setting up tracing: {:?}", err);
            return ExitCode::FAILURE;
        }
    };

    let instance_id = config.instance_id();
    let root_span = info_span!(
        "radar-pipeline",
        env = config.env,
        "radar-instance" = instance_id
    );
    let _guard = root_span.enter();

    let exit_code = match Service::new(config, &instance_id).await {
        Ok(service) => {
            let exit_code = match cli.command {
                Command::Run => {
                    if service.run_once().await.has_failures() {
                        ExitCode::FAILURE
                    } else {
                        ExitCode::SUCCESS
                    }
                }
                Command::Serve => match service.start().await {
                    Ok(()) => ExitCode::SUCCESS,
                    Err(err) => {
                        error!("error running scheduler: {:?}", err);
                        ExitCode::FAILURE
                    }
                },
            };
            service.shutdown();
            exit_code
        }
        Err(err) => {
            error!("error creating service: {:?}", err);
            ExitCode::FAILURE
        }
    };

    // export traces before shutdown
    if let Some(tracer_provider) = tracing_provider {
        if let Err(err) = tracer_provider.force_flush() {
            error!("Error flushing traces: {:?}", err);
        }
        if let Err(err) = tracer_provider.shutdown() {
            error!("Error shutting down tracer provider: {:?}", err);
        }
    }
    exit_code
}
