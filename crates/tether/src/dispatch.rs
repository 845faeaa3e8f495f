//! The expose side: serves a local object graph to whoever holds the other
//! half of an endpoint.
//!
//! Per message: validate origin, resolve the path, execute, reply. Every
//! failure between validation and execution is caught once at the outer
//! boundary and shipped back through the throw handler, so the caller's
//! future rejects instead of pending. Messages from disallowed origins are
//! dropped without a reply.

use std::sync::{Arc, OnceLock};

use regex_lite::Regex;

use crate::codec::WireCodec;
use crate::endpoint::{Endpoint, ListenerId, Message, MessageChannel};
use crate::error::CallError;
use crate::protocol::{Operation, Packet, Request, Response, WireValue};
use crate::target::Target;
use crate::transfer::{HandlerRegistry, TransferSlots};
use crate::value::Value;

/// How messages rejected before dispatch are reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DropPolicy {
    #[default]
    Warn,
    Silent,
}

/// One entry of the origin allow-list.
#[derive(Debug, Clone)]
pub enum OriginPattern {
    Any,
    Exact(String),
    Pattern(Regex),
}

impl OriginPattern {
    fn matches(&self, origin: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => expected == origin,
            Self::Pattern(pattern) => pattern.is_match(origin),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExposeOptions {
    pub allowed_origins: Vec<OriginPattern>,
    pub drop_policy: DropPolicy,
    pub handlers: HandlerRegistry,
}

impl Default for ExposeOptions {
    fn default() -> Self {
        Self {
            allowed_origins: vec![OriginPattern::Any],
            drop_policy: DropPolicy::default(),
            handlers: HandlerRegistry::builtin(),
        }
    }
}

/// Serve `root` to the other side of `endpoint`.
pub fn expose(root: Arc<dyn Target>, endpoint: Arc<dyn Endpoint>) -> ExposeHandle {
    expose_with(root, endpoint, ExposeOptions::default())
}

pub fn expose_with(
    root: Arc<dyn Target>,
    endpoint: Arc<dyn Endpoint>,
    options: ExposeOptions,
) -> ExposeHandle {
    let codec = WireCodec::with_handlers(options.handlers.clone());
    let dispatcher = Arc::new(RequestDispatcher {
        root,
        endpoint: endpoint.clone(),
        codec,
        options,
        listener: OnceLock::new(),
    });

    let receiver = dispatcher.clone();
    let listener = endpoint.add_listener(Arc::new(move |message| receiver.clone().receive(message)));
    let _ = dispatcher.listener.set(listener);
    endpoint.start();

    ExposeHandle { endpoint, listener }
}

/// Detaches an exposed object from its endpoint without tearing the
/// channel down.
pub struct ExposeHandle {
    endpoint: Arc<dyn Endpoint>,
    listener: ListenerId,
}

impl ExposeHandle {
    pub fn detach(self) {
        self.endpoint.remove_listener(self.listener);
    }
}

struct RequestDispatcher {
    root: Arc<dyn Target>,
    endpoint: Arc<dyn Endpoint>,
    codec: WireCodec,
    options: ExposeOptions,
    listener: OnceLock<ListenerId>,
}

impl RequestDispatcher {
    fn origin_allowed(&self, origin: &str) -> bool {
        self.options
            .allowed_origins
            .iter()
            .any(|pattern| pattern.matches(origin))
    }

    fn receive(self: Arc<Self>, message: Message) {
        if !self.origin_allowed(&message.origin) {
            // no reply: the sender is left pending by design
            if self.options.drop_policy == DropPolicy::Warn {
                tracing::warn!(origin = %message.origin, "dropping message from disallowed origin");
            }
            return;
        }
        let Packet::Request(request) = message.data else {
            return;
        };
        let slots = TransferSlots::from(message.transfers);
        tokio::spawn(async move {
            self.handle(request, slots).await;
        });
    }

    async fn handle(self: Arc<Self>, request: Request, slots: TransferSlots) {
        let Request { id, op } = request;
        tracing::trace!(id = %id, kind = op.kind(), "dispatching request");
        let releasing = matches!(op, Operation::Release { .. });

        let outcome = self.perform(op, &slots).await;
        let value = match outcome {
            Ok(value) => value,
            Err(thrown) => Value::Failure(thrown),
        };

        let mut reply_slots = TransferSlots::new();
        let wire = match self.codec.to_wire(value, &mut reply_slots) {
            Ok(wire) => wire,
            Err(err) => {
                tracing::debug!(error = %err, "return value is not serializable");
                reply_slots = TransferSlots::new();
                let fallback = Value::Failure(CallError::type_error("Unserializable return value"));
                match self.codec.to_wire(fallback, &mut reply_slots) {
                    Ok(wire) => wire,
                    Err(_) => return,
                }
            }
        };

        let reply = Message::with_transfers(
            Packet::Response(Response { id, value: wire }),
            reply_slots.into_vec(),
        );
        if let Err(err) = self.endpoint.post_message(reply) {
            tracing::warn!(error = %err, "failed to post reply");
        }

        if releasing {
            self.teardown();
        }
    }

    /// The single catch boundary: every error below comes back as the
    /// thrown value for the reply.
    async fn perform(&self, op: Operation, slots: &TransferSlots) -> Result<Value, CallError> {
        match op {
            Operation::Get { path } => self.resolve(&path),

            Operation::Set { path, value } => {
                let (parent_path, property) = split_path(&path)?;
                let Value::Exposed(parent) = self.resolve(parent_path)? else {
                    return Err(CallError::type_error(format!(
                        "cannot set `{property}` on a plain value"
                    )));
                };
                parent.set(property, self.decode(value, slots)?)?;
                Ok(Value::json(true))
            }

            Operation::Apply {
                path,
                argument_list,
            } => {
                let Value::Exposed(target) = self.resolve(&path)? else {
                    return Err(CallError::type_error(format!(
                        "`{}` is not a function",
                        path.join(".")
                    )));
                };
                let args = self.decode_all(argument_list, slots)?;
                target.apply(args).await
            }

            Operation::Construct {
                path,
                argument_list,
            } => {
                let Value::Exposed(target) = self.resolve(&path)? else {
                    return Err(CallError::type_error(format!(
                        "`{}` is not a constructor",
                        path.join(".")
                    )));
                };
                let args = self.decode_all(argument_list, slots)?;
                let built = target.construct(args).await?;
                // constructed objects go back remotely addressable, never copied
                Ok(Value::Exposed(built))
            }

            Operation::Endpoint { .. } => {
                let (local, remote) = MessageChannel::new();
                expose_with(self.root.clone(), Arc::new(local), self.options.clone());
                Ok(Value::Port(remote))
            }

            Operation::Release { .. } => Ok(Value::null()),
        }
    }

    /// Teardown runs after the RELEASE reply is on the wire.
    fn teardown(&self) {
        if let Some(listener) = self.listener.get() {
            self.endpoint.remove_listener(*listener);
        }
        self.endpoint.close();
        self.root.finalize();
        tracing::debug!("exposed endpoint released");
    }

    fn resolve(&self, path: &[String]) -> Result<Value, CallError> {
        let mut current = Value::Exposed(self.root.clone());
        for segment in path {
            current = match current {
                Value::Exposed(target) => target.get(segment)?,
                Value::Data(data) => Value::Data(Arc::new(index_json(&data, segment)?)),
                other => {
                    return Err(CallError::type_error(format!(
                        "cannot read `{segment}` of {other:?}"
                    )));
                }
            };
        }
        Ok(current)
    }

    fn decode(&self, wire: WireValue, slots: &TransferSlots) -> Result<Value, CallError> {
        self.codec
            .from_wire(wire, slots)
            .map_err(|err| match err {
                crate::error::Error::Remote(thrown) => thrown,
                other => CallError::new("Error", other.to_string()),
            })
    }

    fn decode_all(
        &self,
        wires: Vec<WireValue>,
        slots: &TransferSlots,
    ) -> Result<Vec<Value>, CallError> {
        wires
            .into_iter()
            .map(|wire| self.decode(wire, slots))
            .collect()
    }
}

fn split_path(path: &[String]) -> Result<(&[String], &str), CallError> {
    match path.split_last() {
        Some((property, parent)) => Ok((parent, property)),
        None => Err(CallError::type_error("cannot set the root object")),
    }
}

fn index_json(data: &serde_json::Value, segment: &str) -> Result<serde_json::Value, CallError> {
    let child = match data {
        serde_json::Value::Object(map) => map.get(segment).cloned(),
        serde_json::Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get(index).cloned()),
        _ => None,
    };
    child.ok_or_else(|| CallError::type_error(format!("no such property: {segment}")))
}
