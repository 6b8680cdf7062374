//! Configuration module
//!
//! Handles host CLI argument parsing, TOML configuration files, client
//! connect options, and validation.

pub mod cli;
pub mod toml;
pub mod validator;

use crate::logsink::LogLevel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Highest accepted subscription rate
pub const MAX_SUBSCRIPTION_RATE: f32 = 30.0;

/// Highest accepted log polling interval, in seconds
pub const MAX_LOG_POLLING_INTERVAL_SECS: u64 = 300;

/// Host service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    /// Address the service listens on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Endpoint reported to clients and passed to workers (defaults to `listen`)
    #[serde(default)]
    pub advertise: Option<SocketAddr>,
    /// Package store: one descriptor and one files directory per package
    #[serde(default = "default_package_dir")]
    pub package_dir: PathBuf,
    /// Session execution directories
    #[serde(default = "default_exec_dir")]
    pub exec_dir: PathBuf,
    /// Directory for worker Unix sockets
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    /// Run sessions as tasks inside the host process instead of spawning
    #[serde(default)]
    pub run_local_in_process: bool,
    /// How long to retry connecting to a freshly launched worker
    #[serde(default = "default_agent_connect_timeout_ms")]
    pub agent_connect_timeout_ms: u64,
    /// Override for the logical processor count reported to clients
    #[serde(default)]
    pub logical_processors: Option<usize>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9096))
}

fn default_package_dir() -> PathBuf {
    exe_dir().join("_dpack")
}

fn default_exec_dir() -> PathBuf {
    exe_dir().join("_dexec")
}

fn default_socket_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_agent_connect_timeout_ms() -> u64 {
    10_000
}

/// Directory of the running executable, or the working directory
fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            advertise: None,
            package_dir: default_package_dir(),
            exec_dir: default_exec_dir(),
            socket_dir: default_socket_dir(),
            run_local_in_process: false,
            agent_connect_timeout_ms: default_agent_connect_timeout_ms(),
            logical_processors: None,
        }
    }
}

impl HostConfig {
    pub fn agent_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_connect_timeout_ms)
    }
}

impl fmt::Display for HostConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Listen:        {}", self.listen)?;
        if let Some(advertise) = self.advertise {
            writeln!(f, "  Advertise:     {}", advertise)?;
        }
        writeln!(f, "  Package dir:   {}", self.package_dir.display())?;
        writeln!(f, "  Exec dir:      {}", self.exec_dir.display())?;
        writeln!(f, "  Socket dir:    {}", self.socket_dir.display())?;
        write!(
            f,
            "  Sessions:      {}",
            if self.run_local_in_process { "in-process" } else { "spawned" }
        )
    }
}

/// Client side options for connecting to a set of hosts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectOptions {
    /// Slots per logical processor, clamped to [0, 30]
    #[serde(default = "default_subscription_rate")]
    pub subscription_rate: f32,
    /// Seconds between log polls, clamped to [0, 300]; 0 disables polling
    #[serde(default = "default_log_polling_interval_secs")]
    pub log_polling_interval_secs: u64,
    #[serde(default)]
    pub log_level: LogLevel,
    /// Session lifetime; 0 means the default of 48
    #[serde(default = "default_hours_to_live")]
    pub hours_to_live: u16,
    /// Fixed seed for the slot shuffle (random when unset)
    #[serde(default)]
    pub shuffle_seed: Option<u64>,
}

fn default_subscription_rate() -> f32 {
    1.0
}

fn default_log_polling_interval_secs() -> u64 {
    5
}

fn default_hours_to_live() -> u16 {
    crate::distributed::protocol::DEFAULT_HOURS_TO_LIVE
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            subscription_rate: default_subscription_rate(),
            log_polling_interval_secs: default_log_polling_interval_secs(),
            log_level: LogLevel::default(),
            hours_to_live: default_hours_to_live(),
            shuffle_seed: None,
        }
    }
}

impl ConnectOptions {
    /// Copy with rate and interval clamped into their accepted ranges
    pub fn clamped(&self) -> Self {
        let subscription_rate = if self.subscription_rate.is_nan() {
            default_subscription_rate()
        } else {
            self.subscription_rate.clamp(0.0, MAX_SUBSCRIPTION_RATE)
        };
        Self {
            subscription_rate,
            log_polling_interval_secs: self.log_polling_interval_secs.min(MAX_LOG_POLLING_INTERVAL_SECS),
            ..self.clone()
        }
    }

    /// Poll interval, or `None` when polling is disabled
    pub fn log_polling_interval(&self) -> Option<Duration> {
        match self.log_polling_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
