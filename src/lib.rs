//! distloop - distributed parallel loops over self-deploying worker sessions
//!
//! A client ships its own executable set to a group of hosts, starts one
//! worker session per host and runs parallel loops whose iterations call
//! into those sessions.
//!
//! # Architecture
//!
//! - **Packages**: content-addressed bundles of the client's files, pushed
//!   only to hosts that lack an identical copy
//! - **Hosts**: per-machine services storing packages, spawning sessions
//!   and relaying calls to them
//! - **Worker sessions**: one process per session hosting a single
//!   implementation instance behind an explicit method table
//! - **Client**: slot pool, `For`/`ForEach`/`OncePerNode` loops with
//!   per-iteration exception capture, and log polling
//!
//! Applications that act as workers check [`agent::is_agent_invocation`]
//! at the top of `main` and hand control to [`agent::run_from_env`].

pub mod agent;
pub mod client;
pub mod config;
pub mod distributed;
pub mod error;
pub mod host;
pub mod logsink;
pub mod package;
pub mod util;

// Re-export commonly used types
pub use agent::{Catalog, Implementation, MethodRegistry, Param};
pub use client::{Contract, DistributedClient, Distributor, LoopState, RemoteChannel};
pub use error::DistError;
pub use host::HostService;
pub use package::{PackageHash, Packager};

/// Result type used throughout distloop
pub type Result<T> = anyhow::Result<T>;
