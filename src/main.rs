use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use dropsync::apply::Applier;
use dropsync::config::{Config, ConfigOverrides};
use dropsync::daemon::{run_daemon, Syncer};
use dropsync::http::DropboxClient;
use dropsync::{hasher, logging};

#[derive(Parser, Debug)]
#[command(name = "dropsync", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Local folder override (takes precedence over env/config)
    #[arg(long = "local-folder")]
    local_folder: Option<PathBuf>,

    /// Remote folder override; "" or "/" means the account root
    #[arg(long = "dropbox-folder")]
    dropbox_folder: Option<String>,

    /// Seconds between sync passes
    #[arg(long = "interval")]
    interval: Option<u64>,

    /// Log upward operations without executing them
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync loop until interrupted
    Run,

    /// Run a single sync pass and exit
    Sync,

    /// Probe remote metadata for a path relative to the remote folder
    Stat { path: String },

    /// Print the content hash of a local file
    Hash { file: PathBuf },

    /// Print the resolved config file path
    ConfigPath,

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = Config::resolve_config_path(cli.config.as_deref());
    let overrides = ConfigOverrides {
        local_folder: cli.local_folder.clone(),
        dropbox_folder: cli.dropbox_folder.clone(),
        interval_seconds: cli.interval,
        debug: if cli.debug { Some(true) } else { None },
    };

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let cfg = Config::load_with_overrides(&config_path, overrides)?;
            logging::init_log_file(&cfg.log_file_path())?;
            logging::info(format!(
                "dropsync start version={} config={}",
                env!("CARGO_PKG_VERSION"),
                config_path.display()
            ));

            let shutdown = Arc::new(tokio::sync::Notify::new());
            let signal_shutdown = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    logging::info("interrupt received, finishing current operation");
                    signal_shutdown.notify_waiters();
                }
            });
            run_daemon(cfg, shutdown).await
        }
        Commands::Sync => {
            let cfg = Config::load_with_overrides(&config_path, overrides)?;
            logging::init_log_file(&cfg.log_file_path())?;
            let store = DropboxClient::new(&cfg)?;
            let mut syncer = Syncer::new(cfg, store);
            let report = syncer.sync_once().await?;
            println!(
                "staged {} applied {} conflicts {} failures {}",
                report.staged,
                report.applied,
                report.conflicts.len(),
                report.failures.len()
            );
            Ok(())
        }
        Commands::Stat { path } => {
            let cfg = Config::load_with_overrides(&config_path, overrides)?;
            let store = DropboxClient::new(&cfg)?;
            let applier = Applier::new(&store, &cfg.local_folder, &cfg.dropbox_folder, cfg.debug);
            let rel = path.trim_matches('/');
            match applier.stat(rel).await? {
                Some(entry) => {
                    let mtime = entry
                        .server_modified
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{} kind={:?} size={} server_modified={} content_hash={}",
                        entry.path_display,
                        entry.kind,
                        entry.size,
                        mtime,
                        entry.content_hash.as_deref().unwrap_or("-")
                    );
                }
                None => println!("not found: /{rel}"),
            }
            Ok(())
        }
        Commands::Hash { file } => {
            println!("{}", hasher::hash_file(&file)?);
            Ok(())
        }
        Commands::ConfigPath => {
            println!("{}", config_path.display());
            Ok(())
        }
        Commands::Version => {
            println!("dropsync {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
