mod access;
mod archive;
mod backup;
mod cli;
mod config;
mod correlation;
mod error;
mod event;
mod lifecycle;
mod paths;
mod pipes;
mod process;
mod schedule;
mod status;
mod supervisor;
mod updater;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::archive::TarArchiver;
use crate::cli::Cli;
use crate::process::LaunchSpec;
use crate::supervisor::Supervisor;
use crate::updater::PaperUpdater;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!("{e:#}");
            1
        }
    };
    // The console reader may still be parked on stdin; exit without waiting for it.
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<()> {
    // ── Configuration ─────────────────────────────────────────────────────────
    let config = Arc::new(config::load(&cli.config)?);
    info!(
        "papermc-launcher v{} starting in {}",
        env!("CARGO_PKG_VERSION"),
        config.work_dir.display()
    );

    // ── Server binary ─────────────────────────────────────────────────────────
    let updater = PaperUpdater::new(&config);
    if cli.skip_update {
        info!("[updater] Skipped by --skip-update");
    } else {
        updater::refresh_at_startup(&updater, &config.work_dir).await?;
    }

    // ── Supervisor ────────────────────────────────────────────────────────────
    let supervisor = Supervisor::new(
        Arc::clone(&config),
        LaunchSpec::paper(&config),
        Box::new(TarArchiver::default()),
        Box::new(updater),
    );
    supervisor::spawn_console_reader(supervisor.events());
    supervisor::spawn_signal_listener(supervisor.events());

    supervisor.run().await?;
    Ok(())
}
