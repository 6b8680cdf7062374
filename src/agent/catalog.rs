//! Implementation catalog
//!
//! A worker process starts from two strings: the contract name and the
//! implementation name. The catalog resolves them to a factory that builds
//! the session singleton together with its method table.

use super::registry::{Dispatch, MethodRegistry, ServiceInstance};
use crate::error::DistError;
use crate::logsink::LogSink;
use crate::Result;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

/// What an implementation sees when its session singleton is created
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub contract_type_name: String,
    pub implementation_type_name: String,
    /// Endpoint of the host that launched this session
    pub host_endpoint: SocketAddr,
    pub log: LogSink,
}

/// A type that can serve as the singleton of a worker session
pub trait Implementation: Send + Sync + Sized + 'static {
    /// Name clients pass as the implementation type
    const NAME: &'static str;

    /// Contract names this implementation serves
    const CONTRACTS: &'static [&'static str];

    fn create(ctx: &SessionContext) -> Result<Self>;

    /// Declare the method table; registration order defines identifiers
    fn register(methods: &mut MethodRegistry<Self>);
}

type Factory = dyn Fn(&SessionContext) -> Result<Box<dyn Dispatch>> + Send + Sync;

struct CatalogEntry {
    contracts: &'static [&'static str],
    factory: Box<Factory>,
}

/// Name → implementation lookup used by worker sessions
#[derive(Clone, Default)]
pub struct Catalog {
    entries: HashMap<String, Arc<CatalogEntry>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an implementation; a later registration under the same name wins
    pub fn register<I: Implementation>(mut self) -> Self {
        let entry = CatalogEntry {
            contracts: I::CONTRACTS,
            factory: Box::new(|ctx: &SessionContext| {
                let instance = I::create(ctx)?;
                let mut methods = MethodRegistry::new();
                I::register(&mut methods);
                Ok(Box::new(ServiceInstance::new(instance, methods)) as Box<dyn Dispatch>)
            }),
        };
        self.entries.insert(I::NAME.to_string(), Arc::new(entry));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every contract name served by some registered implementation
    pub fn contracts(&self) -> BTreeSet<&'static str> {
        self.entries
            .values()
            .flat_map(|e| e.contracts.iter().copied())
            .collect()
    }

    /// Check that `implementation` exists and serves `contract`
    pub fn resolve(&self, contract: &str, implementation: &str) -> Result<()> {
        let entry = self
            .entries
            .get(implementation)
            .ok_or_else(|| DistError::UnknownType(implementation.to_string()))?;

        if !self.contracts().contains(contract) {
            return Err(DistError::UnknownType(contract.to_string()).into());
        }
        if !entry.contracts.contains(&contract) {
            return Err(DistError::ContractMismatch {
                contract: contract.to_string(),
                implementation: implementation.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Resolve the context's type names and build the session singleton
    pub fn instantiate(&self, ctx: &SessionContext) -> Result<Box<dyn Dispatch>> {
        self.resolve(&ctx.contract_type_name, &ctx.implementation_type_name)?;
        let entry = self
            .entries
            .get(&ctx.implementation_type_name)
            .ok_or_else(|| DistError::UnknownType(ctx.implementation_type_name.clone()))?;
        (entry.factory)(ctx)
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("Catalog").field("implementations", &names).finish()
    }
}
