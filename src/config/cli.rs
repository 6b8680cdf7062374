//! CLI argument parsing using clap

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// distloop host - stores client packages and runs their worker sessions
#[derive(Parser, Debug)]
#[command(name = "distloop")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file (command line values take precedence)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Address to listen on (e.g., 0.0.0.0:9096)
    #[arg(short = 'l', long)]
    pub listen: Option<SocketAddr>,

    /// Endpoint reported to clients when it differs from the listen address
    #[arg(long)]
    pub advertise: Option<SocketAddr>,

    /// Package store directory
    #[arg(long)]
    pub package_dir: Option<PathBuf>,

    /// Session execution directory
    #[arg(long)]
    pub exec_dir: Option<PathBuf>,

    /// Directory for worker sockets
    #[arg(long)]
    pub socket_dir: Option<PathBuf>,

    /// Run sessions inside the host process (debugging)
    #[arg(long)]
    pub in_process: bool,

    /// Logical processor count reported to clients
    #[arg(long)]
    pub logical_processors: Option<usize>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}
