//! trackdb: migrate a project's legacy SQLite store to Dolt and keep it
//! backed up.

use anyhow::Result;
use clap::Parser;
use trackdb::cli::{self, Cli, CliContext};
use trackdb::config::ConfigLoader;
use trackdb::logging::{self, LogTarget};
use tracing::debug;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(&LogTarget::parse(&cli.log), cli.verbose)?;

    // If explicit config path given, set it as env var for ConfigLoader to pick up
    // SAFETY: called before any task touches the environment
    if let Some(config_path) = &cli.config {
        unsafe {
            std::env::set_var("TRACKDB_CONFIG_PATH", config_path);
        }
    }
    let loader = ConfigLoader::load(cli.data_dir.as_deref())?;
    debug!(sources = ?loader.sources(), data_dir = %loader.paths.data_dir.display(), "config loaded");

    let ctx = CliContext::new(loader.into_config(), cli.json);
    cli::run(&cli.command, &ctx).await
}
