//! objstash CLI - daemon launcher and control client.
//!
//! `run` starts the cache daemon: it loads the service configuration,
//! rebuilds the cache from disk, starts the maintenance ticker and
//! serves the request router on a Unix socket.  `status` queries a
//! running daemon.

mod error;
mod server;

use clap::{Parser, Subcommand};
use error::CliError;
use objstash::cache::set::CacheSet;
use objstash::cache::walker;
use objstash::config::{default_config_path, default_socket_path, ServiceConfig};
use objstash::logging;
use objstash::service::{MaintenanceTicker, Request, Router, SubscriptionRegistry};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "objstash")]
#[command(version = objstash::VERSION)]
#[command(about = "Persistent disk-backed object cache service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cache daemon
    Run {
        /// Service configuration file (default: platform config dir)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Control socket path (default: platform runtime dir)
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Cache base directory (overrides the config file)
        #[arg(long)]
        base_dir: Option<PathBuf>,

        /// Total cache space in bytes (overrides the config file)
        #[arg(long)]
        total_space: Option<u64>,

        /// Directory for log files
        #[arg(long, default_value_t = logging::default_log_dir().to_string())]
        log_dir: String,
    },

    /// Query a running daemon for its cache status
    Status {
        /// Control socket path (default: platform runtime dir)
        #[arg(long)]
        socket: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run {
            config,
            socket,
            base_dir,
            total_space,
            log_dir,
        } => run(config, socket, base_dir, total_space, log_dir).await,
        Commands::Status { socket } => status(socket).await,
    };

    if let Err(e) = result {
        e.exit();
    }
}

async fn run(
    config: Option<PathBuf>,
    socket: Option<PathBuf>,
    base_dir: Option<PathBuf>,
    total_space: Option<u64>,
    log_dir: String,
) -> Result<(), CliError> {
    let _logging_guard = logging::init_logging(&log_dir, logging::default_log_file())
        .map_err(|e| CliError::LoggingInit(e.to_string()))?;

    let config_path = config.unwrap_or_else(default_config_path);
    let mut service_config =
        ServiceConfig::load_from(&config_path).map_err(|e| CliError::Config(e.to_string()))?;
    if let Some(base_dir) = base_dir {
        service_config.base_dir = base_dir;
    }
    if let Some(total_space) = total_space {
        service_config.total_cache_space = total_space;
    }

    info!(
        base = %service_config.base_dir.display(),
        total = service_config.total_cache_space,
        "starting objstash daemon"
    );

    let mut set = CacheSet::new(&service_config.base_dir, service_config.total_cache_space)
        .map_err(CliError::Engine)?;
    walker::walk_tree(&mut set);
    set.cleanup_at_startup();

    let set = Arc::new(Mutex::new(set));
    let registry = SubscriptionRegistry::new();
    let router = Arc::new(Router::new(
        Arc::clone(&set),
        registry.clone(),
        service_config.download_dir.clone(),
    ));

    let shutdown = CancellationToken::new();
    let ticker = MaintenanceTicker::new(Arc::clone(&set), registry);
    let ticker_task = tokio::spawn(ticker.run(shutdown.clone()));

    let socket_path = socket.unwrap_or_else(default_socket_path);
    let server_task = tokio::spawn(server::serve(router, socket_path, shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .map_err(CliError::Serve)?;
    info!("shutdown requested");
    shutdown.cancel();

    let _ = ticker_task.await;
    match server_task.await {
        Ok(result) => result.map_err(CliError::Serve)?,
        Err(_) => {}
    }
    Ok(())
}

async fn status(socket: Option<PathBuf>) -> Result<(), CliError> {
    let socket_path = socket.unwrap_or_else(default_socket_path);
    let reply = server::request_once(&socket_path, &Request::GetCacheStatus)
        .await
        .map_err(CliError::Client)?;

    if reply["returnValue"].as_bool() == Some(true) {
        println!("types:       {}", reply["numTypes"]);
        println!("objects:     {}", reply["numObjs"]);
        println!("used bytes:  {}", reply["size"]);
        println!("avail bytes: {}", reply["availSpace"]);
        Ok(())
    } else {
        Err(CliError::Client(std::io::Error::new(
            std::io::ErrorKind::Other,
            reply["errorText"].as_str().unwrap_or("unknown error").to_string(),
        )))
    }
}
