//! Worker session
//!
//! A worker session is one process (or, in the host's in-process mode, one
//! task) hosting exactly one implementation singleton. It is started by a
//! host with six positional arguments:
//!
//! ```text
//! <session id> <contract type> <implementation type> <hours to live> <log level> <host endpoint>
//! ```
//!
//! and then answers `SyncInterface`, `InvokeRemoteMethod`,
//! `SweepLogMessages` and `KillSession` on a Unix socket named after the
//! session id. The session ends when it is killed or when its time to live
//! runs out, whichever happens first.
//!
//! # Lifecycle
//!
//! ```text
//! Initialized → Serving → Killed
//!                       → Expired
//! ```
//!
//! Startup (argument parsing and type resolution) happens inside
//! [`AgentSession::initialize`]; a session that fails it is never built.
//!
//! Applications that want to be deployable call [`is_agent_invocation`] and
//! [`run_from_env`] at the top of `main`; the host launches the package's own
//! entry executable in agent mode.

pub mod catalog;
pub mod registry;

pub use catalog::{Catalog, Implementation, SessionContext};
pub use registry::{CallArgs, Dispatch, MethodRegistry, Param, ServiceInstance};

use crate::distributed::protocol::{
    normalize_hours_to_live, read_message, write_message, ErrorKind, ErrorMessage, InvokeResponse, Message,
    RemoteFault, SessionId,
};
use crate::error::{DistError, FaultKind};
use crate::logsink::{LogLevel, LogSink};
use crate::Result;
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Set to `1` in the environment of a process launched as a worker
pub const AGENT_ENV: &str = "DISTLOOP_AGENT";

/// Directory holding worker sockets, passed to launched workers
pub const SOCKET_DIR_ENV: &str = "DISTLOOP_SOCKET_DIR";

/// Startup arguments of one worker session
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerArgs {
    pub session_id: SessionId,
    pub contract_type_name: String,
    pub implementation_type_name: String,
    pub hours_to_live: u16,
    pub log_level: LogLevel,
    pub host_endpoint: SocketAddr,
}

impl WorkerArgs {
    /// Parse the six positional arguments (program name excluded)
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        if args.len() != 6 {
            return Err(DistError::InvalidArguments(format!("expected 6 positional arguments, got {}", args.len())).into());
        }
        let arg = |i: usize| args[i].as_ref().trim();

        let session_id = SessionId::parse_str(arg(0))
            .map_err(|e| DistError::InvalidArguments(format!("session id '{}': {}", arg(0), e)))?;
        let contract_type_name = arg(1).to_string();
        let implementation_type_name = arg(2).to_string();
        if contract_type_name.is_empty() || implementation_type_name.is_empty() {
            return Err(DistError::InvalidArguments("empty contract or implementation type name".to_string()).into());
        }
        let hours_to_live: u16 = arg(3)
            .parse()
            .map_err(|e| DistError::InvalidArguments(format!("hours to live '{}': {}", arg(3), e)))?;
        let log_level: LogLevel = arg(4)
            .parse()
            .map_err(|e| DistError::InvalidArguments(format!("log level '{}': {}", arg(4), e)))?;
        let host_endpoint: SocketAddr = arg(5)
            .parse()
            .map_err(|e| DistError::InvalidArguments(format!("host endpoint '{}': {}", arg(5), e)))?;

        Ok(Self {
            session_id,
            contract_type_name,
            implementation_type_name,
            hours_to_live: normalize_hours_to_live(hours_to_live),
            log_level,
            host_endpoint,
        })
    }

    /// Render back into positional arguments, in launch order
    pub fn to_args(&self) -> Vec<String> {
        vec![
            self.session_id.to_string(),
            self.contract_type_name.clone(),
            self.implementation_type_name.clone(),
            self.hours_to_live.to_string(),
            self.log_level.as_u8().to_string(),
            self.host_endpoint.to_string(),
        ]
    }

    pub fn time_to_live(&self) -> Duration {
        Duration::from_secs(u64::from(self.hours_to_live) * 3600)
    }
}

/// Local endpoint of a session
pub fn socket_path(socket_dir: &Path, session_id: SessionId) -> PathBuf {
    socket_dir.join(format!("dpp-{}.sock", session_id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initialized,
    Serving,
    Killed,
    Expired,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Killed | SessionState::Expired)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Initialized => "initialized",
            SessionState::Serving => "serving",
            SessionState::Killed => "killed",
            SessionState::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// One live worker session
pub struct AgentSession {
    args: WorkerArgs,
    created: DateTime<Utc>,
    state: Mutex<SessionState>,
    dispatch: Arc<dyn Dispatch>,
    log: LogSink,
    kill: Notify,
    ttl: Duration,
}

impl AgentSession {
    /// Resolve the type names and build the singleton
    ///
    /// Fails without creating a session when either name is unknown or the
    /// implementation does not serve the contract.
    pub fn initialize(args: WorkerArgs, catalog: &Catalog) -> Result<Self> {
        let created = Utc::now();
        let log = LogSink::new(args.log_level, Some(args.host_endpoint));
        let ctx = SessionContext {
            session_id: args.session_id,
            contract_type_name: args.contract_type_name.clone(),
            implementation_type_name: args.implementation_type_name.clone(),
            host_endpoint: args.host_endpoint,
            log: log.clone(),
        };

        let dispatch: Arc<dyn Dispatch> = Arc::from(catalog.instantiate(&ctx).with_context(|| {
            format!(
                "Failed to create session {} ({} as {})",
                args.session_id, args.implementation_type_name, args.contract_type_name
            )
        })?);

        log.info(format!(
            "session {} created: {} as {}, {} methods",
            args.session_id,
            args.implementation_type_name,
            args.contract_type_name,
            dispatch.method_table().len()
        ));

        let ttl = args.time_to_live();
        Ok(Self {
            args,
            created,
            state: Mutex::new(SessionState::Initialized),
            dispatch,
            log,
            kill: Notify::new(),
            ttl,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.args.session_id
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn log(&self) -> &LogSink {
        &self.log
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Release the session; `serve` returns once it observes the release
    pub fn kill(&self) {
        self.kill.notify_one();
    }

    /// Accept requests until killed or expired
    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> Result<SessionState> {
        self.set_state(SessionState::Serving);
        let expiry = tokio::time::sleep(self.ttl);
        tokio::pin!(expiry);

        let end = loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let session = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = session.handle_connection(stream).await {
                                    debug!("Session {} connection error: {:#}", session.session_id(), e);
                                }
                            });
                        }
                        Err(e) => warn!("Session {} accept failed: {}", self.session_id(), e),
                    }
                }
                _ = self.kill.notified() => break SessionState::Killed,
                _ = &mut expiry => break SessionState::Expired,
            }
        };

        self.set_state(end);
        info!("Session {} {}", self.session_id(), end);
        Ok(end)
    }

    async fn handle_connection(&self, mut stream: UnixStream) -> Result<()> {
        let request = read_message(&mut stream).await?;
        let kill_after_reply = matches!(request, Message::KillSession(_));

        let reply = self.handle_request(request).await;
        write_message(&mut stream, &reply).await?;

        if kill_after_reply {
            self.kill();
        }
        Ok(())
    }

    async fn handle_request(&self, request: Message) -> Message {
        match request {
            Message::SyncInterface(_) => Message::Interface(self.dispatch.method_table()),
            Message::InvokeRemoteMethod {
                method_ident, params, ..
            } => {
                let dispatch = self.dispatch.clone();
                let outcome = tokio::task::spawn_blocking(move || dispatch.invoke(method_ident, params)).await;
                match outcome {
                    Ok(response) => {
                        if let Some(fault) = response.fault_info() {
                            self.log.warning(format!("method {} faulted: {}", method_ident, fault.message));
                        }
                        Message::Invoked(response)
                    }
                    Err(e) => Message::Invoked(InvokeResponse::faulted(&RemoteFault::new(
                        FaultKind::Panic,
                        e.to_string(),
                    ))),
                }
            }
            Message::SweepLogMessages(_) => Message::LogMessages(self.log.sweep()),
            Message::KillSession(_) => {
                self.log.info(format!("session {} killed", self.session_id()));
                Message::SessionKilled
            }
            other => Message::Error(ErrorMessage::new(
                ErrorKind::Protocol,
                format!("{} is not a session request", other.name()),
            )),
        }
    }
}

/// An initialized session bound to its local endpoint, not yet serving
pub struct BoundSession {
    session: Arc<AgentSession>,
    listener: UnixListener,
    path: PathBuf,
}

impl BoundSession {
    /// Initialize the session and bind `<socket_dir>/dpp-<session id>.sock`
    pub fn bind(args: WorkerArgs, catalog: &Catalog, socket_dir: &Path) -> Result<Self> {
        let session = Arc::new(AgentSession::initialize(args, catalog)?);
        let path = socket_path(socket_dir, session.session_id());

        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove stale socket: {}", path.display()))?;
        }
        let listener = UnixListener::bind(&path)
            .with_context(|| format!("Failed to bind session socket: {}", path.display()))?;
        debug!("Session {} listening on {}", session.session_id(), path.display());

        Ok(Self { session, listener, path })
    }

    pub fn session(&self) -> &Arc<AgentSession> {
        &self.session
    }

    /// Serve until killed or expired, then remove the socket
    pub async fn run(self) -> Result<SessionState> {
        let end = self.session.serve(self.listener).await;

        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("Failed to remove session socket {}: {}", self.path.display(), e);
        }
        end
    }
}

/// Run a session to completion on `<socket_dir>/dpp-<session id>.sock`
pub async fn run_session(args: WorkerArgs, catalog: &Catalog, socket_dir: &Path) -> Result<SessionState> {
    BoundSession::bind(args, catalog, socket_dir)?.run().await
}

/// Whether this process was launched by a host as a worker
pub fn is_agent_invocation() -> bool {
    std::env::var(AGENT_ENV).map(|v| v == "1").unwrap_or(false)
}

/// Run the worker session described by this process's arguments and environment
pub async fn run_from_env(catalog: Catalog) -> Result<()> {
    let positional: Vec<String> = std::env::args().skip(1).collect();
    let args = WorkerArgs::parse(&positional)?;
    let socket_dir = std::env::var_os(SOCKET_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);

    run_session(args, &catalog, &socket_dir).await?;
    Ok(())
}
