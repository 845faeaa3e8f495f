//! tether: transparent remote-object calls over asynchronous message
//! channels.
//!
//! One side [`expose`]s an object graph on an endpoint; the other side
//! [`wrap`]s its half and gets a [`RemoteRef`] whose property reads,
//! writes, calls and constructions travel as correlated request/response
//! messages. Functions, thrown errors and channel halves cross the wire
//! through an ordered registry of transfer handlers.
//!
//! # Architecture
//!
//! - **protocol**: the tagged wire envelope (requests, responses, values)
//! - **codec** + **transfer**: value serialization and pluggable handlers
//! - **endpoint** + **stream**: channel abstraction and concrete carriers
//! - **dispatch**: the expose side (validate, resolve, execute, reply)
//! - **proxy**: the wrap side (path-addressed remote handles)
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether::{expose, wrap, Function, MessageChannel, Object, Value};
//!
//! # async fn demo() -> tether::Result<()> {
//! let (served, held) = MessageChannel::new();
//!
//! let root = Object::new().with(
//!     "add",
//!     Value::exposed(Function::new(|args| async move {
//!         let a = args[0].as_json().and_then(|v| v.as_i64()).unwrap_or(0);
//!         let b = args[1].as_json().and_then(|v| v.as_i64()).unwrap_or(0);
//!         Ok(Value::json(a + b))
//!     })),
//! );
//! expose(Arc::new(root), Arc::new(served));
//!
//! let remote = wrap(Arc::new(held));
//! let sum = remote.invoke("add", vec![Value::json(2), Value::json(3)]).await?;
//! assert_eq!(sum.as_json().and_then(|v| v.as_i64()), Some(5));
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod proxy;
pub mod stream;
pub mod target;
pub mod transfer;
pub mod value;

mod correlate;
mod lifecycle;

pub use codec::WireCodec;
pub use dispatch::{DropPolicy, ExposeHandle, ExposeOptions, OriginPattern, expose, expose_with};
pub use endpoint::{
    Endpoint, EndpointError, ListenerId, Message, MessageChannel, MessageListener, MessagePort,
    Transferable,
};
pub use error::{CallError, Error, Result};
pub use protocol::{Operation, Packet, Request, RequestId, Response, WireValue};
pub use proxy::{RemoteRef, WrapOptions, wrap, wrap_with};
pub use stream::StreamEndpoint;
pub use target::{Constructor, Function, Object, Target};
pub use transfer::{
    HandlerRegistry, ProxyHandler, ThrowHandler, TransferHandler, TransferRegistry, TransferSlots,
    transfer,
};
pub use value::Value;
