//! Error taxonomy for the proxying protocol.
//!
//! `CallError` is the portable form of a thrown value: it crosses the wire
//! through the throw handler and is re-thrown on arrival. `Error` is the
//! caller-facing type covering everything that can go wrong with a remote
//! operation.

use crate::endpoint::EndpointError;

/// A value thrown on the other side of an endpoint.
///
/// Error-like values keep `name`/`message`/`stack`; anything else travels
/// as an opaque JSON payload.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    #[error("{name}: {message}")]
    Error {
        name: String,
        message: String,
        stack: Option<String>,
    },

    #[error("thrown value: {0}")]
    Opaque(serde_json::Value),
}

impl CallError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn opaque(value: serde_json::Value) -> Self {
        Self::Opaque(value)
    }

    /// The thrown message, or a rendering of the opaque payload.
    pub fn message(&self) -> String {
        match self {
            Self::Error { message, .. } => message.clone(),
            Self::Opaque(value) => value.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The remote operation threw; the thrown value is preserved.
    #[error(transparent)]
    Remote(#[from] CallError),

    /// A handler name arrived that this side's registry does not know.
    #[error("unknown transfer handler: {0}")]
    UnknownHandler(String),

    #[error("unserializable value: {0}")]
    Unserializable(String),

    #[error("Proxy has been released and is not useable")]
    Released,

    #[error("endpoint closed before the reply arrived")]
    ChannelClosed,

    #[error("timed out waiting for a reply")]
    ReplyTimeout,

    #[error("malformed wire data: {0}")]
    Decode(String),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

pub type Result<T> = std::result::Result<T, Error>;
