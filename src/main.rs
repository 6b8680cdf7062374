//! distloop host entry point

use anyhow::{Context, Result};
use clap::Parser;
use distloop::config::{cli::Cli, toml::load_host_config, validator::validate_host_config};
use distloop::host::{HostService, ProcessLauncher};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    println!("distloop host v{}", env!("CARGO_PKG_VERSION"));
    println!();

    let config = load_host_config(&cli)?;
    validate_host_config(&config).context("Configuration validation failed")?;
    if config.run_local_in_process {
        anyhow::bail!(
            "In-process sessions need the worker implementations linked into the host; \
             embed HostService::with_catalog in the application instead"
        );
    }

    println!("Configuration:");
    println!("{}", config);
    println!();

    let host = HostService::new(config, Arc::new(ProcessLauncher)).start().await?;
    println!("Listening on {} (Ctrl-C to stop)", host.local_addr());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;

    println!();
    println!("Shutting down");
    host.shutdown();
    Ok(())
}
