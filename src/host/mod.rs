//! Host service
//!
//! One host runs per machine. It:
//! - Stores client packages (content-addressed, replaced on update)
//! - Creates worker sessions from a stored package
//! - Relays session requests to the addressed worker over a local socket
//!
//! Every accepted connection carries one request and one response. The host
//! never interprets method identifiers; invocations pass through unchanged.

pub mod launcher;
pub mod relay;
pub mod store;

pub use launcher::{InProcessLauncher, LaunchSpec, Launched, Launcher, ProcessLauncher};
pub use store::PackageStore;

use crate::agent::{Catalog, WorkerArgs};
use crate::config::HostConfig;
use crate::distributed::protocol::{
    read_message, write_message, DistributedSessionNode, DistributedSessionRequest, ErrorMessage, Message,
    SessionId, PROTOCOL_VERSION,
};
use crate::error::DistError;
use crate::package::PackageHash;
use crate::util::system;
use crate::Result;
use anyhow::Context;
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Per-machine service state
pub struct HostService {
    config: HostConfig,
    store: PackageStore,
    launcher: Arc<dyn Launcher>,
    /// Live session → execution directory
    sessions: Mutex<HashMap<SessionId, PathBuf>>,
    end_point: SocketAddr,
    logical_processors: usize,
}

impl HostService {
    /// Create a host that launches sessions with `launcher`
    pub fn new(config: HostConfig, launcher: Arc<dyn Launcher>) -> Self {
        let logical_processors = config
            .logical_processors
            .unwrap_or_else(system::logical_processors);
        let end_point = config.advertise.unwrap_or(config.listen);
        Self {
            store: PackageStore::new(&config.package_dir),
            config,
            launcher,
            sessions: Mutex::new(HashMap::new()),
            end_point,
            logical_processors,
        }
    }

    /// Create a host for an application that embeds its own catalog
    ///
    /// Sessions run in-process when the configuration asks for it and as
    /// spawned processes otherwise.
    pub fn with_catalog(config: HostConfig, catalog: Catalog) -> Self {
        let launcher: Arc<dyn Launcher> = if config.run_local_in_process {
            Arc::new(InProcessLauncher::new(catalog))
        } else {
            Arc::new(ProcessLauncher)
        };
        Self::new(config, launcher)
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn end_point(&self) -> SocketAddr {
        self.end_point
    }

    pub fn store(&self) -> &PackageStore {
        &self.store
    }

    /// Number of sessions created and not yet killed
    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    /// Bind the listener and serve on a background task
    pub async fn start(mut self) -> Result<RunningHost> {
        let listener = TcpListener::bind(self.config.listen)
            .await
            .with_context(|| format!("Failed to bind host service on {}", self.config.listen))?;
        let local_addr = listener.local_addr().context("Failed to read bound address")?;

        if self.config.advertise.is_none() {
            self.end_point = advertised_end_point(local_addr);
        }
        info!("Host service listening on {} (advertised as {})", local_addr, self.end_point);
        info!("Sessions launched {}", self.launcher.name());

        let service = Arc::new(self);
        let task = tokio::spawn(service.clone().accept_loop(listener));
        Ok(RunningHost {
            service,
            local_addr,
            task: Some(task),
        })
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let service = self.clone();
            tokio::spawn(async move {
                if let Err(e) = service.handle_connection(stream).await {
                    debug!("Connection from {} failed: {:#}", addr, e);
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let request = read_message(&mut stream).await?;
        let name = request.name();
        let reply = match self.handle_request(request).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("{} failed: {:#}", name, e);
                Message::Error(ErrorMessage::from_error(&e))
            }
        };
        write_message(&mut stream, &reply).await
    }

    /// Answer one client request
    pub async fn handle_request(&self, request: Message) -> Result<Message> {
        match request {
            Message::HasPackage(hash) => Ok(Message::HasPackageReply(self.has_package(&hash)?)),
            Message::AddUpdatePackage { hash, bundle } => {
                self.add_update_package(&hash, &bundle)?;
                Ok(Message::PackageStored)
            }
            Message::CreateSession(request) => Ok(Message::SessionCreated(self.create_session(&request).await?)),
            Message::KillSession(Some(session_id)) => {
                self.kill_session(session_id).await?;
                Ok(Message::SessionKilled)
            }
            msg @ (Message::SyncInterface(Some(_))
            | Message::InvokeRemoteMethod { session_id: Some(_), .. }
            | Message::SweepLogMessages(Some(_))) => self.relay(&msg).await,
            other => Err(DistError::Protocol(format!("unexpected request {}", other.name())).into()),
        }
    }

    pub fn has_package(&self, hash: &PackageHash) -> Result<bool> {
        let found = self.store.has_package(hash)?;
        debug!("HasPackage {}: {}", hash, found);
        Ok(found)
    }

    pub fn add_update_package(&self, hash: &PackageHash, bundle: &[u8]) -> Result<()> {
        self.store.add_update(hash, bundle)?;
        Ok(())
    }

    /// Start a worker session from a stored package
    pub async fn create_session(&self, request: &DistributedSessionRequest) -> Result<DistributedSessionNode> {
        if request.protocol_version != PROTOCOL_VERSION {
            return Err(DistError::Protocol(format!(
                "protocol version mismatch: client={}, host={}",
                request.protocol_version, PROTOCOL_VERSION
            ))
            .into());
        }

        store::validate_package_name(&request.package_name)?;
        if !self.store.exists(&request.package_name) {
            return Err(DistError::PackageNotFound(request.package_name.clone()).into());
        }

        let package_root = self.config.exec_dir.join(&request.package_name);
        let (instance_key, exec_dir) = create_instance_dir(&package_root)?;
        let files_dir = self.store.files_dir(&request.package_name);
        let copied = store::copy_dir_all(&files_dir, &exec_dir)?;
        debug!("Copied {} package files to {}", copied, exec_dir.display());

        let runner = install_runner(&files_dir, &exec_dir, &request.package_name, &instance_key)?;

        fs::create_dir_all(&self.config.socket_dir)
            .with_context(|| format!("Failed to create socket directory: {}", self.config.socket_dir.display()))?;

        let spec = LaunchSpec {
            runner,
            working_dir: exec_dir.clone(),
            socket_dir: self.config.socket_dir.clone(),
            args: WorkerArgs {
                session_id: request.session_id,
                contract_type_name: request.contract_type_name.clone(),
                implementation_type_name: request.implementation_type_name.clone(),
                hours_to_live: request.effective_hours_to_live(),
                log_level: request.log_level,
                host_endpoint: self.end_point,
            },
        };
        let launched = self.launcher.launch(&spec)?;
        let ready =
            relay::wait_for_session(&self.config.socket_dir, request.session_id, self.config.agent_connect_timeout());
        tokio::select! {
            ready = ready => ready?,
            status = launched.exited() => {
                anyhow::bail!("Session {} exited with {} before accepting connections", request.session_id, status)
            }
        }

        self.lock_sessions().insert(request.session_id, exec_dir);
        info!(
            "Session {} created: {} as {} from package {}",
            request.session_id, request.implementation_type_name, request.contract_type_name, request.package_name
        );

        Ok(DistributedSessionNode {
            session_id: request.session_id,
            package_name: request.package_name.clone(),
            end_point: self.end_point,
            logical_processor_count: self.logical_processors,
            memory: system::memory_detail(),
        })
    }

    /// Ask a session to terminate and forget it
    ///
    /// Its execution directory is left on disk.
    pub async fn kill_session(&self, session_id: SessionId) -> Result<()> {
        let exec_dir = self.lock_sessions().remove(&session_id);
        match exec_dir {
            Some(dir) => debug!("Killing session {} ({})", session_id, dir.display()),
            None => debug!("Killing unregistered session {}", session_id),
        }
        match relay::relay(&self.config.socket_dir, session_id, &Message::KillSession(Some(session_id))).await? {
            Message::SessionKilled => {
                info!("Session {} killed", session_id);
                Ok(())
            }
            other => Err(unexpected_reply(other)),
        }
    }

    async fn relay(&self, msg: &Message) -> Result<Message> {
        let session_id = msg
            .session_id()
            .ok_or_else(|| DistError::Protocol(format!("{} without a session id", msg.name())))?;
        relay::relay(&self.config.socket_dir, session_id, msg).await
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, PathBuf>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn unexpected_reply(reply: Message) -> anyhow::Error {
    match reply {
        Message::Error(e) => e.into_error(),
        other => DistError::Protocol(format!("unexpected reply {}", other.name())).into(),
    }
}

/// Endpoint reported when no advertise address is configured
fn advertised_end_point(local_addr: SocketAddr) -> SocketAddr {
    if local_addr.ip().is_unspecified() {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .and_then(|h| std::net::ToSocketAddrs::to_socket_addrs(&(h.as_str(), local_addr.port())).ok())
            .and_then(|mut addrs| addrs.find(|a| a.is_ipv4() && !a.ip().is_loopback()));
        host.unwrap_or(local_addr)
    } else {
        local_addr
    }
}

/// Create `<package_root>/<timestamp key>`, distinguishing same-millisecond keys
fn create_instance_dir(package_root: &Path) -> Result<(String, PathBuf)> {
    fs::create_dir_all(package_root)
        .with_context(|| format!("Failed to create execution root: {}", package_root.display()))?;

    let base = Utc::now().format("%Y%m%d%H%M%S%3f").to_string();
    let mut key = base.clone();
    let mut suffix = 0u32;
    loop {
        let dir = package_root.join(&key);
        match fs::create_dir(&dir) {
            Ok(()) => return Ok((key, dir)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                suffix += 1;
                key = format!("{}-{}", base, suffix);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create execution directory: {}", dir.display()))
            }
        }
    }
}

/// Copy the package's entry executable to `dpp-<key>` and carry over its config
///
/// Returns the runner path. A package without an entry executable yields a
/// path that does not exist; only process launchers need it.
fn install_runner(files_dir: &Path, exec_dir: &Path, package_name: &str, instance_key: &str) -> Result<PathBuf> {
    let runner = exec_dir.join(format!("dpp-{}", instance_key));
    let entry = files_dir.join(package_name);
    if !entry.is_file() {
        return Ok(runner);
    }

    fs::copy(&entry, &runner).with_context(|| format!("Failed to write runner: {}", runner.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&runner, fs::Permissions::from_mode(0o755))
            .with_context(|| format!("Failed to mark runner executable: {}", runner.display()))?;
    }

    let config = files_dir.join(format!("{}.toml", package_name));
    if config.is_file() {
        let runner_config = exec_dir.join(format!("dpp-{}.toml", instance_key));
        fs::copy(&config, &runner_config)
            .with_context(|| format!("Failed to copy runner config: {}", runner_config.display()))?;
    }
    Ok(runner)
}

/// A host service accepting connections
pub struct RunningHost {
    service: Arc<HostService>,
    local_addr: SocketAddr,
    task: Option<JoinHandle<()>>,
}

impl RunningHost {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn service(&self) -> &Arc<HostService> {
        &self.service
    }

    /// Serve until the task is aborted
    pub async fn wait(mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => match task.await {
                Ok(()) => Ok(()),
                Err(e) if e.is_cancelled() => Ok(()),
                Err(e) => {
                    error!("Host service task failed: {}", e);
                    Err(e.into())
                }
            },
            None => Ok(()),
        }
    }

    /// Stop accepting connections and release the listener
    pub fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        info!("Host service on {} stopped", self.local_addr);
    }
}

impl Drop for RunningHost {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Implementation, MethodRegistry, Param, SessionContext};
    use crate::distributed::protocol::{decode_value, encode_value, request as send, ErrorKind};
    use crate::package::Packager;
    use tempfile::TempDir;

    struct Echo;

    impl Implementation for Echo {
        const NAME: &'static str = "Echo";
        const CONTRACTS: &'static [&'static str] = &["IEcho"];

        fn create(_ctx: &SessionContext) -> Result<Self> {
            Ok(Echo)
        }

        fn register(methods: &mut MethodRegistry<Self>) {
            methods.method("echo", &[Param::value("String")], |_: &Echo, args| args.get::<String>(0));
        }
    }

    struct Fixture {
        _dir: TempDir,
        client: TempDir,
        host: RunningHost,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = HostConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            package_dir: dir.path().join("_dpack"),
            exec_dir: dir.path().join("_dexec"),
            socket_dir: dir.path().join("sock"),
            run_local_in_process: true,
            logical_processors: Some(4),
            ..Default::default()
        };
        let host = HostService::with_catalog(config, Catalog::new().register::<Echo>())
            .start()
            .await
            .unwrap();

        let client = TempDir::new().unwrap();
        fs::write(client.path().join("app"), b"entry").unwrap();
        fs::write(client.path().join("app.toml"), b"answer = 42").unwrap();

        Fixture { _dir: dir, client, host }
    }

    async fn call(addr: SocketAddr, msg: Message) -> Message {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send(&mut stream, &msg).await.unwrap()
    }

    #[tokio::test]
    async fn test_package_push_is_idempotent() {
        let f = fixture().await;
        let packager = Packager::from_dir(f.client.path(), "app").unwrap();
        let addr = f.host.local_addr();

        assert!(matches!(call(addr, Message::HasPackage(packager.hash().clone())).await, Message::HasPackageReply(false)));
        let push = Message::AddUpdatePackage {
            hash: packager.hash().clone(),
            bundle: packager.bundle().unwrap(),
        };
        assert!(matches!(call(addr, push).await, Message::PackageStored));
        assert!(matches!(call(addr, Message::HasPackage(packager.hash().clone())).await, Message::HasPackageReply(true)));
    }

    #[tokio::test]
    async fn test_create_session_without_package_fails() {
        let f = fixture().await;
        let request = DistributedSessionRequest::new("app", "IEcho", "Echo");
        match call(f.host.local_addr(), Message::CreateSession(request)).await {
            Message::Error(e) => assert_eq!(e.kind, ErrorKind::PackageNotFound),
            other => panic!("unexpected reply: {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let f = fixture().await;
        let service = f.host.service().clone();
        let packager = Packager::from_dir(f.client.path(), "app").unwrap();
        service.add_update_package(packager.hash(), &packager.bundle().unwrap()).unwrap();

        let mut request = DistributedSessionRequest::new("app", "IEcho", "Echo");
        request.hours_to_live = 0;
        let node = service.create_session(&request).await.unwrap();
        assert_eq!(node.session_id, request.session_id);
        assert_eq!(node.logical_processor_count, 4);
        assert_eq!(node.end_point, f.host.local_addr());
        assert_eq!(service.session_count(), 1);

        let exec_root = service.config().exec_dir.join("app");
        let instance = fs::read_dir(&exec_root).unwrap().next().unwrap().unwrap().path();
        let key = instance.file_name().unwrap().to_string_lossy().into_owned();
        assert!(instance.join(format!("dpp-{}", key)).is_file());
        assert!(instance.join(format!("dpp-{}.toml", key)).is_file());
        assert!(instance.join("app.toml").is_file());

        let invoke = Message::InvokeRemoteMethod {
            session_id: Some(node.session_id),
            method_ident: 0,
            params: vec![encode_value("ping").unwrap()],
        };
        match call(f.host.local_addr(), invoke).await {
            Message::Invoked(response) => {
                let value: String = decode_value(response.values[0].as_ref().unwrap()).unwrap();
                assert_eq!(value, "ping");
            }
            other => panic!("unexpected reply: {}", other.name()),
        }

        assert!(matches!(
            call(f.host.local_addr(), Message::KillSession(Some(node.session_id))).await,
            Message::SessionKilled
        ));
        assert_eq!(service.session_count(), 0);
    }

    #[tokio::test]
    async fn test_contract_mismatch_fails_session() {
        let f = fixture().await;
        let service = f.host.service().clone();
        let packager = Packager::from_dir(f.client.path(), "app").unwrap();
        service.add_update_package(packager.hash(), &packager.bundle().unwrap()).unwrap();

        let request = DistributedSessionRequest::new("app", "IOther", "Echo");
        assert!(service.create_session(&request).await.is_err());
        assert_eq!(service.session_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_worker_fails_session_promptly() {
        let dir = TempDir::new().unwrap();
        let config = HostConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            package_dir: dir.path().join("_dpack"),
            exec_dir: dir.path().join("_dexec"),
            socket_dir: dir.path().join("sock"),
            agent_connect_timeout_ms: 60_000,
            ..Default::default()
        };
        let service = HostService::new(config, Arc::new(ProcessLauncher));

        let client = TempDir::new().unwrap();
        fs::write(client.path().join("app"), b"#!/bin/sh\nexit 3\n").unwrap();
        let packager = Packager::from_dir(client.path(), "app").unwrap();
        service.add_update_package(packager.hash(), &packager.bundle().unwrap()).unwrap();

        let request = DistributedSessionRequest::new("app", "IEcho", "Echo");
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(10), service.create_session(&request))
            .await
            .unwrap();
        assert!(outcome.is_err());
        assert_eq!(service.session_count(), 0);
    }

    #[tokio::test]
    async fn test_relay_to_unknown_session() {
        let f = fixture().await;
        let id = SessionId::new_v4();
        match call(f.host.local_addr(), Message::SweepLogMessages(Some(id))).await {
            Message::Error(e) => assert_eq!(e.kind, ErrorKind::SessionNotFound),
            other => panic!("unexpected reply: {}", other.name()),
        }
    }

    #[test]
    fn test_instance_dirs_are_distinct() {
        let dir = TempDir::new().unwrap();
        let (a, dir_a) = create_instance_dir(dir.path()).unwrap();
        let (b, dir_b) = create_instance_dir(dir.path()).unwrap();
        assert_ne!(a, b);
        assert_ne!(dir_a, dir_b);
        assert!(dir_a.is_dir() && dir_b.is_dir());
    }
}
