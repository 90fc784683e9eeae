//! Taskworker - Entry Point

use clap::Parser;
use core_config::tracing::install_color_eyre;
use taskworker_app::cli::Cli;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    install_color_eyre();
    taskworker_app::run(Cli::parse()).await
}
