//! Configuration validation

use super::*;
use anyhow::Result;

/// Validate host configuration
pub fn validate_host_config(config: &HostConfig) -> Result<()> {
    if config.agent_connect_timeout_ms == 0 {
        anyhow::bail!("agent_connect_timeout_ms must be greater than 0");
    }

    if let Some(0) = config.logical_processors {
        anyhow::bail!("logical_processors must be at least 1 when set");
    }

    if config.package_dir == config.exec_dir {
        anyhow::bail!(
            "package_dir and exec_dir must differ, both are {}",
            config.package_dir.display()
        );
    }

    if let Some(advertise) = config.advertise {
        if advertise.ip().is_unspecified() {
            anyhow::bail!("advertise address must be routable, got {}", advertise);
        }
        if advertise.port() == 0 {
            anyhow::bail!("advertise address needs an explicit port");
        }
    }

    Ok(())
}

/// Validate the server list of a connect call
pub fn validate_servers(servers: &[SocketAddr]) -> Result<()> {
    if servers.is_empty() {
        anyhow::bail!("at least one server endpoint is required");
    }
    Ok(())
}

/// Validate connect options before clamping
///
/// Out-of-range values are clamped rather than rejected; only values that
/// cannot be clamped are errors.
pub fn validate_connect_options(options: &ConnectOptions) -> Result<()> {
    if !options.subscription_rate.is_finite() {
        anyhow::bail!("subscription_rate must be a finite number, got {}", options.subscription_rate);
    }
    Ok(())
}
