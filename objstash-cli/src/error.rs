//! CLI error handling with user-friendly messages.

use std::fmt;
use std::process;

/// CLI-specific errors with user-friendly messages.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(String),
    /// Configuration error
    Config(String),
    /// Failed to open the cache engine
    Engine(objstash::cache::CacheError),
    /// Socket server error
    Serve(std::io::Error),
    /// Failed to reach a running daemon
    Client(std::io::Error),
}

impl CliError {
    /// Exit the process with an appropriate error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        match self {
            CliError::Client(_) => {
                eprintln!();
                eprintln!("Is the daemon running?  Start it with: objstash run");
            }
            CliError::Engine(_) => {
                eprintln!();
                eprintln!("Check that the cache base directory is writable.");
            }
            _ => {}
        }

        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(msg) => write!(f, "Failed to initialize logging: {}", msg),
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Engine(e) => write!(f, "Failed to open cache: {}", e),
            CliError::Serve(e) => write!(f, "Socket server error: {}", e),
            CliError::Client(e) => write!(f, "Could not reach daemon: {}", e),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Engine(e) => Some(e),
            CliError::Serve(e) => Some(e),
            CliError::Client(e) => Some(e),
            _ => None,
        }
    }
}
