//! Worker session launch
//!
//! [`ProcessLauncher`] starts the session's runner executable as a separate
//! process. [`InProcessLauncher`] runs the session as a task inside the host
//! process, which is useful when debugging an application together with an
//! embedded host.

use crate::agent::{BoundSession, Catalog, WorkerArgs, AGENT_ENV, SOCKET_DIR_ENV};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Everything needed to start one worker session
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Runner executable inside the execution directory
    pub runner: PathBuf,
    /// Execution directory; the worker's working directory
    pub working_dir: PathBuf,
    pub socket_dir: PathBuf,
    pub args: WorkerArgs,
}

/// A started session, possibly not yet accepting connections
#[derive(Debug, Default)]
pub struct Launched {
    exit: Option<oneshot::Receiver<ExitStatus>>,
}

impl Launched {
    /// Resolves when the session's process exits; never for in-process sessions
    pub async fn exited(self) -> ExitStatus {
        match self.exit {
            Some(exit) => match exit.await {
                Ok(status) => status,
                Err(_) => std::future::pending().await,
            },
            None => std::future::pending().await,
        }
    }
}

/// Starts worker sessions
pub trait Launcher: Send + Sync {
    /// Start the session described by `spec`
    ///
    /// Returns once the session has been started; it does not wait for the
    /// session to accept connections.
    fn launch(&self, spec: &LaunchSpec) -> Result<Launched>;

    fn name(&self) -> &'static str;
}

/// Spawns the runner as a child process
#[derive(Debug, Default, Clone)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Launched> {
        if !spec.runner.is_file() {
            anyhow::bail!("Runner executable not found: {}", spec.runner.display());
        }

        let mut child = Command::new(&spec.runner)
            .args(spec.args.to_args())
            .current_dir(&spec.working_dir)
            .env(AGENT_ENV, "1")
            .env(SOCKET_DIR_ENV, &spec.socket_dir)
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to launch worker: {}", spec.runner.display()))?;

        let session_id = spec.args.session_id;
        info!("Launched session {} (pid {:?})", session_id, child.id());

        // Reap the child so exited workers do not linger as zombies
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    if status.success() {
                        debug!("Session {} exited", session_id);
                    } else {
                        warn!("Session {} exited with {}", session_id, status);
                    }
                    let _ = exit_tx.send(status);
                }
                Err(e) => warn!("Failed to wait for session {}: {}", session_id, e),
            }
        });

        Ok(Launched { exit: Some(exit_rx) })
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

/// Runs sessions as tasks of the host process
#[derive(Debug, Clone)]
pub struct InProcessLauncher {
    catalog: Catalog,
}

impl InProcessLauncher {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }
}

impl Launcher for InProcessLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Launched> {
        let bound = BoundSession::bind(spec.args.clone(), &self.catalog, &spec.socket_dir)?;
        let session_id = spec.args.session_id;
        info!("Started in-process session {}", session_id);

        tokio::spawn(async move {
            if let Err(e) = bound.run().await {
                warn!("In-process session {} failed: {:#}", session_id, e);
            }
        });
        Ok(Launched::default())
    }

    fn name(&self) -> &'static str {
        "in-process"
    }
}
