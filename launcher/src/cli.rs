use std::path::PathBuf;

use clap::Parser;

use crate::config::DEFAULT_CONFIG_FILE;

/// Runs a PaperMC server and drives its weekly access and backup schedule.
#[derive(Parser, Debug)]
#[command(name = "papermc-launcher", version, about)]
pub struct Cli {
    /// Path to the TOML config file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Start with the installed server jar instead of checking for a newer build
    #[arg(long)]
    pub skip_update: bool,
}
