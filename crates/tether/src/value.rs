//! Portable value model for everything that can cross an endpoint.

use std::fmt;
use std::sync::Arc;

use crate::endpoint::MessagePort;
use crate::error::CallError;
use crate::proxy::RemoteRef;
use crate::target::Target;

/// Any value a remote operation can produce or consume.
///
/// `Data` is copied across the channel. `Exposed` carries the proxy marker:
/// serializing it ships a fresh private channel instead of the object, and
/// the other side receives it as `Remote`. `Failure` carries the thrown
/// marker: deserializing it re-throws.
#[derive(Clone)]
pub enum Value {
    /// Plain data. Held behind an `Arc` so the transfer side table can key
    /// entries by identity.
    Data(Arc<serde_json::Value>),

    /// A local object made remotely callable when sent.
    Exposed(Arc<dyn Target>),

    /// A handle to an object living on the other side of an endpoint.
    Remote(RemoteRef),

    /// A raw channel half, moved across the endpoint.
    Port(MessagePort),

    /// A thrown value in transit.
    Failure(CallError),
}

impl Value {
    pub fn json(value: impl Into<serde_json::Value>) -> Self {
        Self::Data(Arc::new(value.into()))
    }

    pub fn null() -> Self {
        Self::Data(Arc::new(serde_json::Value::Null))
    }

    pub fn exposed(target: impl Target + 'static) -> Self {
        Self::Exposed(Arc::new(target))
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }

    pub fn into_remote(self) -> Option<RemoteRef> {
        match self {
            Self::Remote(remote) => Some(remote),
            _ => None,
        }
    }

    pub fn into_port(self) -> Option<MessagePort> {
        match self {
            Self::Port(port) => Some(port),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Self::Data(Arc::new(value))
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(data) => f.debug_tuple("Data").field(data).finish(),
            Self::Exposed(_) => f.write_str("Exposed(..)"),
            Self::Remote(remote) => f.debug_tuple("Remote").field(remote).finish(),
            Self::Port(port) => f.debug_tuple("Port").field(port).finish(),
            Self::Failure(err) => f.debug_tuple("Failure").field(err).finish(),
        }
    }
}
