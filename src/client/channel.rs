//! Client side RPC
//!
//! [`ServiceClient`] talks to one host, opening a fresh TCP connection per
//! request. [`RemoteChannel`] binds a service client to one session and
//! turns named method calls into synchronized method identifiers; contract
//! adapters ([`Contract`]) are thin wrappers around a channel.

use crate::distributed::protocol::{
    decode_value, request, DistributedSessionNode, DistributedSessionRequest, InvokeResponse, Message,
    MethodSyncInfo, SessionId,
};
use crate::error::{DistError, FaultKind};
use crate::logsink::LogMessage;
use crate::package::PackageHash;
use crate::Result;
use anyhow::Context;
use serde::de::DeserializeOwned;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::OnceCell;

/// Requests to one host service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceClient {
    server: SocketAddr,
}

impl ServiceClient {
    pub fn new(server: SocketAddr) -> Self {
        Self { server }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Send one request on a new connection and wait for its reply
    ///
    /// An `Error` reply is returned as an error.
    pub async fn call(&self, msg: &Message) -> Result<Message> {
        let mut stream = TcpStream::connect(self.server)
            .await
            .with_context(|| format!("Failed to connect to host {}", self.server))?;
        stream.set_nodelay(true).ok();

        match request(&mut stream, msg)
            .await
            .with_context(|| format!("{} to {} failed", msg.name(), self.server))?
        {
            Message::Error(e) => Err(e.into_error()),
            reply => Ok(reply),
        }
    }

    pub async fn has_package(&self, hash: &PackageHash) -> Result<bool> {
        match self.call(&Message::HasPackage(hash.clone())).await? {
            Message::HasPackageReply(found) => Ok(found),
            other => Err(unexpected(other)),
        }
    }

    pub async fn add_update_package(&self, hash: &PackageHash, bundle: Vec<u8>) -> Result<()> {
        let msg = Message::AddUpdatePackage {
            hash: hash.clone(),
            bundle,
        };
        match self.call(&msg).await? {
            Message::PackageStored => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn create_session(&self, request: DistributedSessionRequest) -> Result<DistributedSessionNode> {
        match self.call(&Message::CreateSession(request)).await? {
            Message::SessionCreated(node) => Ok(node),
            other => Err(unexpected(other)),
        }
    }

    pub async fn kill_session(&self, session_id: SessionId) -> Result<()> {
        match self.call(&Message::KillSession(Some(session_id))).await? {
            Message::SessionKilled => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn sync_interface(&self, session_id: SessionId) -> Result<Vec<MethodSyncInfo>> {
        match self.call(&Message::SyncInterface(Some(session_id))).await? {
            Message::Interface(table) => Ok(table),
            other => Err(unexpected(other)),
        }
    }

    pub async fn invoke(&self, session_id: SessionId, method_ident: u32, params: Vec<Vec<u8>>) -> Result<InvokeResponse> {
        let msg = Message::InvokeRemoteMethod {
            session_id: Some(session_id),
            method_ident,
            params,
        };
        match self.call(&msg).await? {
            Message::Invoked(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    pub async fn sweep_log_messages(&self, session_id: SessionId) -> Result<Vec<LogMessage>> {
        match self.call(&Message::SweepLogMessages(Some(session_id))).await? {
            Message::LogMessages(messages) => Ok(messages),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: Message) -> anyhow::Error {
    DistError::Protocol(format!("unexpected reply {}", reply.name())).into()
}

/// Hooks run around every remote invocation on a channel
pub trait CallObserver: Send + Sync {
    fn call_started(&self);
    fn call_finished(&self);
}

struct ObserverGuard<'a>(&'a dyn CallObserver);

impl<'a> ObserverGuard<'a> {
    fn new(observer: &'a dyn CallObserver) -> Self {
        observer.call_started();
        Self(observer)
    }
}

impl Drop for ObserverGuard<'_> {
    fn drop(&mut self) {
        self.0.call_finished();
    }
}

/// Successful outcome of a call with by-reference parameters
#[derive(Debug, Clone)]
pub struct CallOutcome {
    values: Vec<Option<Vec<u8>>>,
}

impl CallOutcome {
    /// Decode the return value
    pub fn return_value<R: DeserializeOwned>(&self) -> Result<R> {
        let bytes = self
            .values
            .first()
            .and_then(|v| v.as_deref())
            .ok_or_else(|| DistError::Protocol("response carries no return value".to_string()))?;
        decode_value(bytes)
    }

    /// Write the echoed value of parameter `index` back into `target`
    pub fn read_back<T: DeserializeOwned>(&self, index: usize, target: &mut T) -> Result<()> {
        let bytes = self
            .values
            .get(index + 1)
            .and_then(|v| v.as_deref())
            .ok_or_else(|| DistError::Protocol(format!("parameter {} was not echoed back", index)))?;
        *target = decode_value(bytes)?;
        Ok(())
    }
}

/// A session-bound channel with a lazily synchronized method table
pub struct RemoteChannel {
    client: ServiceClient,
    session_id: SessionId,
    methods: OnceCell<Vec<MethodSyncInfo>>,
    observer: Option<Arc<dyn CallObserver>>,
}

impl RemoteChannel {
    pub fn new(end_point: SocketAddr, session_id: SessionId) -> Self {
        Self {
            client: ServiceClient::new(end_point),
            session_id,
            methods: OnceCell::new(),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn CallObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn end_point(&self) -> SocketAddr {
        self.client.server()
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The session's method table, fetched on first use
    pub async fn methods(&self) -> Result<&[MethodSyncInfo]> {
        let table = self
            .methods
            .get_or_try_init(|| self.client.sync_interface(self.session_id))
            .await?;
        Ok(table)
    }

    /// Identifier of the method with this name and parameter types
    pub async fn resolve(&self, name: &str, param_types: &[&str]) -> Result<u32> {
        self.methods()
            .await?
            .iter()
            .find(|m| {
                m.method_name == name
                    && m.parameter_types.len() == param_types.len()
                    && m.parameter_types.iter().zip(param_types).all(|(a, b)| a == b)
            })
            .map(|m| m.method_ident)
            .ok_or_else(|| {
                DistError::MethodUnresolved {
                    name: name.to_string(),
                }
                .into()
            })
    }

    /// Invoke a method and decode its return value
    ///
    /// A fault raised by the remote method is returned as
    /// [`DistError::RemoteFault`]; an identifier the worker does not know
    /// is returned as [`DistError::MethodNotFound`].
    pub async fn call<R: DeserializeOwned>(&self, name: &str, param_types: &[&str], args: Vec<Vec<u8>>) -> Result<R> {
        self.call_with_refs(name, param_types, args).await?.return_value()
    }

    /// Invoke a method whose by-reference parameters the caller reads back
    pub async fn call_with_refs(&self, name: &str, param_types: &[&str], args: Vec<Vec<u8>>) -> Result<CallOutcome> {
        let method_ident = self.resolve(name, param_types).await?;

        let response = {
            let _guard = self.observer.as_deref().map(ObserverGuard::new);
            self.client.invoke(self.session_id, method_ident, args).await?
        };

        match response.fault_info() {
            // Stale method table on our side
            Some(fault) if fault.kind == FaultKind::MethodNotFound => {
                return Err(DistError::MethodNotFound { ident: method_ident }.into())
            }
            Some(fault) => return Err(DistError::from(fault).into()),
            None => {}
        }
        Ok(CallOutcome {
            values: response.values,
        })
    }
}

impl fmt::Debug for RemoteChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteChannel")
            .field("end_point", &self.client.server())
            .field("session_id", &self.session_id)
            .field("synchronized", &self.methods.initialized())
            .finish()
    }
}

/// Client side adapter for one contract
///
/// Each contract method encodes its arguments, calls
/// [`RemoteChannel::call`] with the method name and declared parameter
/// types, and returns the decoded value.
pub trait Contract: Send + Sync + Sized + 'static {
    /// Name of the contract; must match the implementation's declaration
    const NAME: &'static str;

    fn bind(channel: RemoteChannel) -> Self;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::protocol::{encode_value, read_message, write_message, RemoteFault};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use uuid::Uuid;

    /// Host stand-in answering SyncInterface and InvokeRemoteMethod
    async fn fake_host(fault_on: u32, fault: FaultKind) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let reply = match read_message(&mut stream).await.unwrap() {
                    Message::SyncInterface(_) => Message::Interface(vec![
                        MethodSyncInfo {
                            method_ident: 0,
                            method_name: "square".to_string(),
                            parameter_types: vec!["i64".to_string()],
                        },
                        MethodSyncInfo {
                            method_ident: 1,
                            method_name: "swap".to_string(),
                            parameter_types: vec!["String".to_string(), "String".to_string()],
                        },
                    ]),
                    Message::InvokeRemoteMethod { method_ident, .. } if method_ident == fault_on => {
                        Message::Invoked(InvokeResponse::faulted(&RemoteFault::new(
                            fault,
                            "negative input",
                        )))
                    }
                    Message::InvokeRemoteMethod { method_ident: 0, params, .. } => {
                        let n: i64 = decode_value(&params[0]).unwrap();
                        Message::Invoked(InvokeResponse::success(vec![Some(encode_value(&(n * n)).unwrap()), None]))
                    }
                    Message::InvokeRemoteMethod { params, .. } => Message::Invoked(InvokeResponse::success(vec![
                        Some(encode_value(&()).unwrap()),
                        Some(params[1].clone()),
                        Some(params[0].clone()),
                    ])),
                    other => panic!("unexpected request {}", other.name()),
                };
                write_message(&mut stream, &reply).await.unwrap();
            }
        });
        addr
    }

    #[derive(Default)]
    struct Counting {
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    impl CallObserver for Counting {
        fn call_started(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        fn call_finished(&self) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_call_resolves_and_decodes() {
        let addr = fake_host(99, FaultKind::Invocation).await;
        let observer = Arc::new(Counting::default());
        let channel = RemoteChannel::new(addr, Uuid::new_v4()).with_observer(observer.clone());

        let squared: i64 = channel.call("square", &["i64"], vec![encode_value(&7i64).unwrap()]).await.unwrap();
        assert_eq!(squared, 49);
        assert_eq!(observer.started.load(Ordering::SeqCst), 1);
        assert_eq!(observer.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_by_ref_read_back() {
        let addr = fake_host(99, FaultKind::Invocation).await;
        let channel = RemoteChannel::new(addr, Uuid::new_v4());

        let mut a = "left".to_string();
        let mut b = "right".to_string();
        let outcome = channel
            .call_with_refs("swap", &["String", "String"], vec![encode_value(&a).unwrap(), encode_value(&b).unwrap()])
            .await
            .unwrap();
        outcome.read_back(0, &mut a).unwrap();
        outcome.read_back(1, &mut b).unwrap();
        assert_eq!((a.as_str(), b.as_str()), ("right", "left"));
    }

    #[tokio::test]
    async fn test_remote_fault_is_reraised() {
        let addr = fake_host(0, FaultKind::Invocation).await;
        let channel = RemoteChannel::new(addr, Uuid::new_v4());

        let err = channel
            .call::<i64>("square", &["i64"], vec![encode_value(&-1i64).unwrap()])
            .await
            .unwrap_err();
        match err.downcast_ref::<DistError>() {
            Some(DistError::RemoteFault { kind, message }) => {
                assert_eq!(*kind, FaultKind::Invocation);
                assert_eq!(message, "negative input");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_ident_maps_to_method_not_found() {
        let addr = fake_host(1, FaultKind::MethodNotFound).await;
        let channel = RemoteChannel::new(addr, Uuid::new_v4());

        let a = "left".to_string();
        let err = channel
            .call_with_refs("swap", &["String", "String"], vec![encode_value(&a).unwrap(), encode_value(&a).unwrap()])
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<DistError>(), Some(DistError::MethodNotFound { ident: 1 })));

        // Other methods on the same channel are unaffected
        let squared: i64 = channel.call("square", &["i64"], vec![encode_value(&3i64).unwrap()]).await.unwrap();
        assert_eq!(squared, 9);
    }

    #[tokio::test]
    async fn test_unresolved_method() {
        let addr = fake_host(99, FaultKind::Invocation).await;
        let channel = RemoteChannel::new(addr, Uuid::new_v4());

        let err = channel.resolve("square", &["String"]).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<DistError>(), Some(DistError::MethodUnresolved { name }) if name == "square"));
        assert_eq!(channel.resolve("swap", &["String", "String"]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(ServiceClient::new(addr).sync_interface(Uuid::new_v4()).await.is_err());
    }
}
