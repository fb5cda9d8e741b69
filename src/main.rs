use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

mod cache;
mod cli;
mod config;
mod error;
mod progress;
mod remote;
mod sync;
mod transfer;

use cli::args::{Cli, Commands};
use config::types::{AppConfig, Verbosity};
use error::DriveError;

fn main() {
    let cli = Cli::parse();

    // Convert CLI flags to verbosity level
    let verbosity = Verbosity::from((cli.quiet, cli.verbose));

    // RUST_LOG env var overrides CLI flags
    let filter = verbosity.as_tracing_filter();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr) // Keep stdout clean for listings
        .init();

    tracing::debug!("Verbosity level: {:?}", verbosity);

    if let Err(err) = run(cli, verbosity) {
        display_error(&err);
        std::process::exit(1);
    }
}

/// Execute the dispatched command.
fn run(cli: Cli, verbosity: Verbosity) -> Result<(), DriveError> {
    if let Commands::Completions(args) = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(args.shell, &mut cmd, "drivesync", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::resolve(
        verbosity,
        cli.config_dir.as_deref(),
        cli.store.as_deref(),
        cli.no_progress,
    )?;
    tracing::debug!(
        config_dir = %config.config_dir.display(),
        store = %config.store_dir.display(),
        cache = %config.cache_path.display(),
        "Resolved configuration"
    );

    match cli.command {
        Commands::Sync(args) => sync::execute_sync(args, &config),
        Commands::Upload(args) => transfer::execute_upload(args, &config),
        Commands::Update(args) => transfer::execute_update(args, &config),
        Commands::Download(args) => transfer::execute_download(args, &config),
        Commands::Mkdir(args) => transfer::execute_mkdir(args, &config),
        Commands::List(args) => transfer::execute_list(args, &config),
        Commands::Info(args) => transfer::execute_info(args, &config),
        Commands::ListSync(args) => transfer::execute_list_sync(args, &config),
        Commands::Delete(args) => transfer::execute_delete(args, &config),
        Commands::Completions(_) => Ok(()),
    }
}

/// Display a DriveError with optional suggestion hint to stderr.
fn display_error(err: &DriveError) {
    eprintln!("error: {}", err);
    if let Some(suggestion) = err.suggestion() {
        eprintln!("  hint: {}", suggestion);
    }
}
