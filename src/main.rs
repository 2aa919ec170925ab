use std::path::PathBuf;

use ::tracing::{error, info_span};
use clap::Parser;
use service::Service;

mod bulk_delete;
mod config;
mod error;
mod lifecycle;
mod reaper;
mod retention;
mod service;
mod state_store;
mod tracing;
use tracing::setup_tracing;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => match config::ServerConfig::from_path(&path.to_string_lossy()) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("error loading config {}: {:?}", path.display(), err);
                std::process::exit(1);
            }
        },
        None => config::ServerConfig::default(),
    };

    if let Err(err) = setup_tracing(&config) {
        eprintln!("error setting up tracing: {:?}", err);
        std::process::exit(1);
    }

    let root_span = info_span!("attachment-server", env = config.env);
    let _guard = root_span.enter();

    let service = match Service::new(config) {
        Ok(service) => service,
        Err(err) => {
            error!("error creating service: {:?}", err);
            return;
        }
    };
    if let Err(err) = service.start().await {
        error!("error running service: {:?}", err);
    }
}
