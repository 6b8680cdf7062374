//! Client entry point
//!
//! [`Distributor`] deploys the running application to every host that does
//! not already hold an identical package, starts one worker session per host
//! and hands back a [`DistributedClient`] over the sessions that came up.
//! A host that fails is recorded and never aborts the others.

use super::channel::{Contract, ServiceClient};
use super::DistributedClient;
use crate::agent::Implementation;
use crate::config::validator::{validate_connect_options, validate_servers};
use crate::config::ConnectOptions;
use crate::distributed::protocol::{DistributedSessionNode, DistributedSessionRequest};
use crate::error::DistError;
use crate::logsink::LogLevel;
use crate::package::Packager;
use crate::Result;
use anyhow::Context;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// A host that could not be connected
#[derive(Debug)]
pub struct FailedNode {
    pub end_point: SocketAddr,
    pub error: anyhow::Error,
}

impl fmt::Display for FailedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#}", self.end_point, self.error)
    }
}

/// Builder for a [`DistributedClient`]
#[derive(Debug, Clone)]
pub struct Distributor {
    servers: Vec<SocketAddr>,
    options: ConnectOptions,
    package: Option<Packager>,
}

impl Distributor {
    pub fn new(servers: impl IntoIterator<Item = SocketAddr>) -> Self {
        Self {
            servers: servers.into_iter().collect(),
            options: ConnectOptions::default(),
            package: None,
        }
    }

    /// Slots per logical processor of each node
    pub fn subscription_rate(mut self, rate: f32) -> Self {
        self.options.subscription_rate = rate;
        self
    }

    /// Seconds between log polls; zero disables polling
    pub fn log_polling_interval(mut self, secs: u64) -> Self {
        self.options.log_polling_interval_secs = secs;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.options.log_level = level;
        self
    }

    pub fn hours_to_live(mut self, hours: u16) -> Self {
        self.options.hours_to_live = hours;
        self
    }

    /// Fix the slot shuffle order
    pub fn shuffle_seed(mut self, seed: u64) -> Self {
        self.options.shuffle_seed = Some(seed);
        self
    }

    pub fn options(mut self, options: ConnectOptions) -> Self {
        self.options = options;
        self
    }

    /// Deploy this package instead of the running executable's
    pub fn package(mut self, packager: Packager) -> Self {
        self.package = Some(packager);
        self
    }

    /// Connect sessions hosting `I` and bind them as `C`
    pub async fn connect<C: Contract, I: Implementation>(self) -> Result<DistributedClient<C>> {
        if !I::CONTRACTS.contains(&C::NAME) {
            return Err(DistError::ContractMismatch {
                contract: C::NAME.to_string(),
                implementation: I::NAME.to_string(),
            }
            .into());
        }
        self.connect_named::<C>(I::NAME).await
    }

    /// Connect sessions hosting the implementation registered as `implementation`
    ///
    /// The worker checks that the implementation serves `C`.
    pub async fn connect_named<C: Contract>(self, implementation: &str) -> Result<DistributedClient<C>> {
        validate_servers(&self.servers)?;
        if implementation.trim().is_empty() {
            return Err(DistError::InvalidArguments("implementation type name is empty".to_string()).into());
        }
        validate_connect_options(&self.options)?;
        let options = self.options.clamped();

        let packager = match self.package {
            Some(packager) => Arc::new(packager),
            None => Arc::new(Packager::current()?.clone()),
        };
        info!(
            "Connecting {} as {} to {} hosts with package {}",
            implementation,
            C::NAME,
            self.servers.len(),
            packager.hash()
        );

        let bundle: Arc<OnceCell<Vec<u8>>> = Arc::new(OnceCell::new());
        let handles: Vec<_> = self
            .servers
            .iter()
            .map(|&server| {
                let packager = packager.clone();
                let bundle = bundle.clone();
                let implementation = implementation.to_string();
                let options = options.clone();
                tokio::spawn(async move {
                    let mut request =
                        DistributedSessionRequest::new(packager.hash().name.clone(), C::NAME, implementation);
                    request.hours_to_live = options.hours_to_live;
                    request.log_level = options.log_level;
                    connect_node(server, &packager, &bundle, request).await
                })
            })
            .collect();

        let mut nodes = Vec::new();
        let mut failed = Vec::new();
        for (&server, handle) in self.servers.iter().zip(handles) {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(anyhow::Error::new(e).context("Connect task failed")),
            };
            match outcome {
                Ok(node) => nodes.push(node),
                Err(error) => {
                    warn!("Failed to connect {}: {:#}", server, error);
                    failed.push(FailedNode {
                        end_point: server,
                        error,
                    });
                }
            }
        }
        info!("Connected {} of {} hosts", nodes.len(), self.servers.len());

        Ok(DistributedClient::new(self.servers, nodes, failed, &options))
    }
}

/// Push the package if the host lacks it, then start a session there
async fn connect_node(
    server: SocketAddr,
    packager: &Packager,
    bundle: &OnceCell<Vec<u8>>,
    request: DistributedSessionRequest,
) -> Result<DistributedSessionNode> {
    let client = ServiceClient::new(server);
    let hash = packager.hash();

    if client.has_package(hash).await? {
        debug!("{} already holds package {}", server, hash);
    } else {
        let bytes = bundle
            .get_or_try_init(|| async {
                let packager = packager.clone();
                tokio::task::spawn_blocking(move || packager.bundle())
                    .await
                    .context("Bundling task failed")?
            })
            .await?;
        info!("Pushing package {} ({} bytes) to {}", hash, bytes.len(), server);
        client.add_update_package(hash, bytes.clone()).await?;
    }

    let mut node = client.create_session(request).await?;
    // A host bound to a wildcard address reports an unusable endpoint
    if node.end_point.ip().is_unspecified() {
        node.end_point = server;
    }
    Ok(node)
}
