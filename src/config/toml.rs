//! TOML configuration file parsing

use super::*;
use crate::config::cli::Cli;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<HostConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<HostConfig> {
    let config: HostConfig = ::toml::from_str(contents)
        .context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Parse client connect options from a TOML string
pub fn parse_connect_options(contents: &str) -> Result<ConnectOptions> {
    ::toml::from_str(contents).context("Failed to parse connect options")
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: HostConfig) -> HostConfig {
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(advertise) = cli.advertise {
        config.advertise = Some(advertise);
    }
    if let Some(ref dir) = cli.package_dir {
        config.package_dir = dir.clone();
    }
    if let Some(ref dir) = cli.exec_dir {
        config.exec_dir = dir.clone();
    }
    if let Some(ref dir) = cli.socket_dir {
        config.socket_dir = dir.clone();
    }
    if cli.in_process {
        config.run_local_in_process = true;
    }
    if let Some(count) = cli.logical_processors {
        config.logical_processors = Some(count);
    }

    config
}

/// Build the host configuration from CLI arguments and the optional config file
pub fn load_host_config(cli: &Cli) -> Result<HostConfig> {
    let config = match cli.config {
        Some(ref path) => parse_toml_file(path)?,
        None => HostConfig::default(),
    };
    Ok(merge_cli_with_config(cli, config))
}
