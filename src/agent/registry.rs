//! Explicit method tables
//!
//! An implementation registers each contract method with a name, its
//! declared parameter types and a handler. Identifiers are assigned
//! sequentially from 0 in registration order, so the table an implementation
//! declares is the table every client sees, independent of compiler or
//! runtime enumeration order.
//!
//! Parameters declared with [`Param::by_ref`] are echoed back to the caller
//! after the handler runs, carrying whatever value the handler stored with
//! [`CallArgs::set`].

use crate::distributed::protocol::{decode_value, encode_value, InvokeResponse, MethodSyncInfo, RemoteFault};
use crate::error::FaultKind;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Declared parameter of a registered method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub type_name: String,
    pub by_ref: bool,
}

impl Param {
    /// Parameter passed by value
    pub fn value(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            by_ref: false,
        }
    }

    /// Parameter whose post-call value is echoed back to the caller
    pub fn by_ref(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            by_ref: true,
        }
    }
}

/// Encoded arguments of one call
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    params: Vec<Vec<u8>>,
}

impl CallArgs {
    pub fn new(params: Vec<Vec<u8>>) -> Self {
        Self { params }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Decode the argument at `index`
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let bytes = self
            .params
            .get(index)
            .with_context(|| format!("Missing argument {}", index))?;
        decode_value(bytes).with_context(|| format!("Failed to decode argument {}", index))
    }

    /// Replace the argument at `index`; echoed back if it is by-reference
    pub fn set<T: Serialize + ?Sized>(&mut self, index: usize, value: &T) -> Result<()> {
        let slot = self
            .params
            .get_mut(index)
            .with_context(|| format!("Missing argument {}", index))?;
        *slot = encode_value(value)?;
        Ok(())
    }

    fn into_inner(self) -> Vec<Vec<u8>> {
        self.params
    }
}

type Handler<T> = Box<dyn Fn(&T, &mut CallArgs) -> Result<Vec<u8>> + Send + Sync>;

struct MethodEntry<T> {
    info: MethodSyncInfo,
    by_ref: Vec<bool>,
    handler: Handler<T>,
}

/// Ordered method table for one implementation type
pub struct MethodRegistry<T> {
    methods: Vec<MethodEntry<T>>,
}

impl<T> Default for MethodRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MethodRegistry<T> {
    pub fn new() -> Self {
        Self { methods: Vec::new() }
    }

    /// Register a method; its identifier is its position in the table
    pub fn method<R, F>(&mut self, name: &str, params: &[Param], handler: F) -> &mut Self
    where
        R: Serialize,
        F: Fn(&T, &mut CallArgs) -> Result<R> + Send + Sync + 'static,
    {
        let method_ident = self.methods.len() as u32;
        self.methods.push(MethodEntry {
            info: MethodSyncInfo {
                method_ident,
                method_name: name.to_string(),
                parameter_types: params.iter().map(|p| p.type_name.clone()).collect(),
            },
            by_ref: params.iter().map(|p| p.by_ref).collect(),
            handler: Box::new(move |this, args| {
                let value = handler(this, args)?;
                encode_value(&value)
            }),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// The table sent to clients by `SyncInterface`
    pub fn table(&self) -> Vec<MethodSyncInfo> {
        self.methods.iter().map(|m| m.info.clone()).collect()
    }

    /// Invoke method `method_ident` on `instance`
    ///
    /// Every failure of the method itself (unknown identifier, wrong
    /// argument count, returned error, panic) becomes a faulted response.
    pub fn invoke(&self, instance: &T, method_ident: u32, params: Vec<Vec<u8>>) -> InvokeResponse {
        let entry = match self.methods.get(method_ident as usize) {
            Some(entry) => entry,
            None => {
                return InvokeResponse::faulted(&RemoteFault::new(
                    FaultKind::MethodNotFound,
                    format!("unknown method identifier {}", method_ident),
                ))
            }
        };

        if params.len() != entry.by_ref.len() {
            return InvokeResponse::faulted(&RemoteFault::new(
                FaultKind::Invocation,
                format!(
                    "{} expects {} arguments, got {}",
                    entry.info.method_name,
                    entry.by_ref.len(),
                    params.len()
                ),
            ));
        }

        let mut args = CallArgs::new(params);
        let outcome = catch_unwind(AssertUnwindSafe(|| (entry.handler)(instance, &mut args)));

        match outcome {
            Ok(Ok(return_value)) => {
                let mut values = Vec::with_capacity(1 + entry.by_ref.len());
                values.push(Some(return_value));
                for (param, by_ref) in args.into_inner().into_iter().zip(&entry.by_ref) {
                    values.push(if *by_ref { Some(param) } else { None });
                }
                InvokeResponse::success(values)
            }
            Ok(Err(e)) => InvokeResponse::faulted(&RemoteFault::new(FaultKind::Invocation, format!("{:#}", e))),
            Err(panic) => InvokeResponse::faulted(&RemoteFault::new(FaultKind::Panic, panic_message(panic.as_ref()))),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Type-erased session singleton: an instance plus its method table
pub trait Dispatch: Send + Sync {
    fn method_table(&self) -> Vec<MethodSyncInfo>;
    fn invoke(&self, method_ident: u32, params: Vec<Vec<u8>>) -> InvokeResponse;
}

/// An implementation instance bound to its registry
pub struct ServiceInstance<T> {
    instance: T,
    registry: MethodRegistry<T>,
}

impl<T> ServiceInstance<T> {
    pub fn new(instance: T, registry: MethodRegistry<T>) -> Self {
        Self { instance, registry }
    }

    pub fn instance(&self) -> &T {
        &self.instance
    }
}

impl<T: Send + Sync> Dispatch for ServiceInstance<T> {
    fn method_table(&self) -> Vec<MethodSyncInfo> {
        self.registry.table()
    }

    fn invoke(&self, method_ident: u32, params: Vec<Vec<u8>>) -> InvokeResponse {
        self.registry.invoke(&self.instance, method_ident, params)
    }
}
