//! The wrap side: a local handle whose operations travel to the exposed
//! object graph on the other side of an endpoint.
//!
//! Navigation is free: `get` only extends the recorded path. A request is
//! posted when the handle is fetched, called, assigned through, or
//! constructed.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::endpoint::{Endpoint, MessagePort};
use crate::error::{Error, Result};
use crate::lifecycle::RefLifecycle;
use crate::protocol::Operation;
use crate::transfer::{HandlerRegistry, TransferSlots};
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct WrapOptions {
    /// Bound how long a call may wait for its reply. `None` pends forever,
    /// matching the protocol's fail-closed drops.
    pub reply_timeout: Option<Duration>,
    pub handlers: HandlerRegistry,
}

impl Default for WrapOptions {
    fn default() -> Self {
        Self {
            reply_timeout: None,
            handlers: HandlerRegistry::builtin(),
        }
    }
}

/// Wrap an endpoint whose other side has an exposed object graph.
pub fn wrap(endpoint: Arc<dyn Endpoint>) -> RemoteRef {
    wrap_with(endpoint, WrapOptions::default())
}

pub fn wrap_with(endpoint: Arc<dyn Endpoint>, options: WrapOptions) -> RemoteRef {
    RemoteRef::new(RefLifecycle::attach(endpoint, options), Vec::new())
}

struct RefState {
    lifecycle: Arc<RefLifecycle>,
    path: Vec<String>,
    released: AtomicBool,
}

impl Drop for RefState {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            self.lifecycle.clone().forget();
        }
    }
}

/// Local handle to an object living on the other side of an endpoint.
///
/// Clones are handles to the same reference; navigating allocates a fresh
/// one. Handles from one endpoint share a reference count, and the last
/// one to go sends RELEASE and closes the channel.
#[derive(Clone)]
pub struct RemoteRef {
    state: Arc<RefState>,
}

impl RemoteRef {
    pub(crate) fn new(lifecycle: Arc<RefLifecycle>, path: Vec<String>) -> Self {
        lifecycle.register();
        Self {
            state: Arc::new(RefState {
                lifecycle,
                path,
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn path(&self) -> &[String] {
        &self.state.path
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.state.released.load(Ordering::Acquire) {
            return Err(Error::Released);
        }
        Ok(())
    }

    /// Navigate to a property. No request is sent; only fetching, calling,
    /// assigning or constructing goes on the wire.
    pub fn get(&self, property: impl Into<String>) -> RemoteRef {
        let property = property.into();
        // a root handle probed for `then` must not turn into a remote call,
        // or awaiting the wrap result would never settle on the handle itself
        if self.state.path.is_empty() && property == "then" {
            return self.clone();
        }
        let mut path = self.state.path.clone();
        path.push(property);
        RemoteRef::new(self.state.lifecycle.clone(), path)
    }

    /// GET the value at the current path.
    pub async fn fetch(&self) -> Result<Value> {
        self.ensure_usable()?;
        self.state
            .lifecycle
            .round_trip(
                Operation::Get {
                    path: self.state.path.clone(),
                },
                TransferSlots::new(),
            )
            .await
    }

    /// SET a property under the current path and await the acknowledgement.
    pub async fn set(&self, property: impl Into<String>, value: Value) -> Result<()> {
        self.ensure_usable()?;
        let mut slots = TransferSlots::new();
        let wire = self.state.lifecycle.codec().to_wire(value, &mut slots)?;
        let mut path = self.state.path.clone();
        path.push(property.into());
        self.state
            .lifecycle
            .round_trip(Operation::Set { path, value: wire }, slots)
            .await?;
        Ok(())
    }

    /// APPLY the function at the current path.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        self.ensure_usable()?;
        // `obj.method.bind(obj)` ergonomics: a path ending in `bind` just
        // drops the segment, nothing goes on the wire
        if self.state.path.last().map(String::as_str) == Some("bind") {
            let parent = self.state.path[..self.state.path.len() - 1].to_vec();
            return Ok(Value::Remote(RemoteRef::new(
                self.state.lifecycle.clone(),
                parent,
            )));
        }
        let (argument_list, slots) = self.encode_args(args)?;
        self.state
            .lifecycle
            .round_trip(
                Operation::Apply {
                    path: self.state.path.clone(),
                    argument_list,
                },
                slots,
            )
            .await
    }

    /// Navigate to `method` and APPLY it.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.get(method).call(args).await
    }

    /// CONSTRUCT at the current path. The result is always a fresh handle,
    /// never a copied value.
    pub async fn construct(&self, args: Vec<Value>) -> Result<RemoteRef> {
        self.ensure_usable()?;
        let (argument_list, slots) = self.encode_args(args)?;
        let value = self
            .state
            .lifecycle
            .round_trip(
                Operation::Construct {
                    path: self.state.path.clone(),
                    argument_list,
                },
                slots,
            )
            .await?;
        value
            .into_remote()
            .ok_or_else(|| Error::Decode("CONSTRUCT reply was not a remote object".to_string()))
    }

    /// Ask the other side for a fresh channel serving the same root.
    pub async fn endpoint(&self) -> Result<MessagePort> {
        self.ensure_usable()?;
        let value = self
            .state
            .lifecycle
            .round_trip(
                Operation::Endpoint { path: Vec::new() },
                TransferSlots::new(),
            )
            .await?;
        value
            .into_port()
            .ok_or_else(|| Error::Decode("ENDPOINT reply was not a transferable port".to_string()))
    }

    /// Release this handle. The endpoint's last handle sends RELEASE and
    /// closes the channel. A second release fails locally without another
    /// frame.
    pub async fn release(&self) -> Result<()> {
        if self.state.released.swap(true, Ordering::AcqRel) {
            return Err(Error::Released);
        }
        self.state.lifecycle.release_one().await
    }

    fn encode_args(&self, args: Vec<Value>) -> Result<(Vec<crate::protocol::WireValue>, TransferSlots)> {
        let codec = self.state.lifecycle.codec();
        let mut slots = TransferSlots::new();
        let encoded = args
            .into_iter()
            .map(|arg| codec.to_wire(arg, &mut slots))
            .collect::<Result<Vec<_>>>()?;
        Ok((encoded, slots))
    }
}

impl fmt::Debug for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteRef")
            .field("path", &self.state.path)
            .field("released", &self.state.released.load(Ordering::Relaxed))
            .finish()
    }
}
