//! Bulk import launcher
//!
//! Runs an import from the built-in sample source into an in-memory target,
//! reporting status as text or JSON. SIGINT/SIGTERM request a clean stop.

use anyhow::{Context, Result};
use bulkimport::config::{PARAM_DRY_RUN, PARAM_REPLACE_EXISTING};
use bulkimport::source::sample::{
    PARAM_FILES_PER_FOLDER, PARAM_FOLDER_COUNT, PARAM_VERSIONS_PER_FILE, SAMPLE_SOURCE_NAME,
};
use bulkimport::{BulkImporter, ImportConfig, ImportParameters, MemoryStore, SampleSource};
use bulkimport_logging::{init_logging, LogConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

const TARGET_PATH: &str = "import";

#[derive(Parser, Debug)]
#[command(name = "bulkimport", about = "Weight-bounded, backpressured bulk import engine")]
struct Cli {
    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Import the synthesised sample tree and print the final status
    Run {
        /// Engine configuration (TOML)
        #[arg(long, env = "BULKIMPORT_CONFIG")]
        config: Option<PathBuf>,

        /// Top-level folders to synthesise
        #[arg(long)]
        folders: Option<u64>,

        /// Files per synthesised folder
        #[arg(long)]
        files_per_folder: Option<u64>,

        /// Versions of the first file in each folder
        #[arg(long)]
        versions_per_file: Option<u64>,

        /// Replace nodes that already exist in the target
        #[arg(long)]
        replace_existing: bool,

        /// Run every transaction but roll it back
        #[arg(long)]
        dry_run: bool,

        /// Print the final status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective engine configuration
    Config {
        #[arg(long, env = "BULKIMPORT_CONFIG")]
        config: Option<PathBuf>,

        /// Print as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let quiet = matches!(cli.command, Commands::Run { json: true, .. });

    let _guard = match init_logging(LogConfig {
        verbose: cli.verbose,
        quiet,
        ..LogConfig::new("bulkimport")
    }) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialise logging: {:#}", e);
            None
        }
    };

    match run(cli.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ImportConfig> {
    match path {
        Some(path) => ImportConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(ImportConfig::default()),
    }
}

fn run(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Config { config, json } => {
            let config = load_config(config.as_ref())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                print!("{}", toml::to_string_pretty(&config)?);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            config,
            folders,
            files_per_folder,
            versions_per_file,
            replace_existing,
            dry_run,
            json,
        } => {
            let config = load_config(config.as_ref())?;

            let mut params = ImportParameters::new()
                .with(PARAM_REPLACE_EXISTING, replace_existing.to_string())
                .with(PARAM_DRY_RUN, dry_run.to_string());
            for (name, value) in [
                (PARAM_FOLDER_COUNT, folders),
                (PARAM_FILES_PER_FOLDER, files_per_folder),
                (PARAM_VERSIONS_PER_FILE, versions_per_file),
            ] {
                if let Some(value) = value {
                    params.set(name, value.to_string());
                }
            }

            let store = Arc::new(MemoryStore::new());
            store
                .create_folder_path(TARGET_PATH)
                .context("Failed to prepare target folder")?;

            let importer = Arc::new(BulkImporter::new(store, config));
            importer.register_source(Arc::new(SampleSource::new()));
            install_stop_handler(Arc::clone(&importer))?;

            let job_id = importer.start(SAMPLE_SOURCE_NAME, params, TARGET_PATH)?;
            info!(job_id = %job_id, "Waiting for import to finish");
            importer.await_completion()?;

            let snapshot = importer.status().snapshot();
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print!("{}", snapshot);
            }

            if importer.status().failed() {
                Ok(ExitCode::FAILURE)
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
    }
}

/// First SIGINT/SIGTERM (Ctrl+C on Windows) asks the running job to stop.
fn install_stop_handler(importer: Arc<BulkImporter>) -> Result<()> {
    #[cfg(unix)]
    {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        std::thread::Builder::new()
            .name("bulkimport-signals".to_string())
            .spawn(move || {
                for sig in signals.forever() {
                    info!("Received signal {}, stopping import...", sig);
                    if let Err(e) = importer.stop() {
                        warn!("Stop request ignored: {}", e);
                    }
                }
            })?;
    }

    #[cfg(windows)]
    {
        ctrlc::set_handler(move || {
            info!("Received Ctrl+C, stopping import...");
            if let Err(e) = importer.stop() {
                warn!("Stop request ignored: {}", e);
            }
        })?;
    }

    Ok(())
}
