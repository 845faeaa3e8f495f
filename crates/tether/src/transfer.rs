//! Transfer handlers: pluggable serializers for values that cannot simply
//! be copied.
//!
//! The registry is an ordered list and the order is a contract: the first
//! handler whose `can_handle` matches wins. Built-ins, in order:
//!
//! - **proxy**: ships an exposed object as a fresh private channel, so
//!   functions and live objects become remotely callable.
//! - **throw**: ships a thrown value; deserializing re-throws.
//!
//! Everything else falls through to the `RAW` arm of the envelope.
//!
//! Channel halves cannot be written into JSON, so a port travels in the
//! message's transfer list and its payload is the slot index, encoded as
//! `{"@port": n}`.

use std::fmt;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use serde_json::json;

use crate::endpoint::{MessageChannel, Transferable};
use crate::error::{CallError, Error, Result};
use crate::value::Value;

/// JSON key marking a transfer-slot reference inside `RAW` data.
pub const PORT_SLOT_KEY: &str = "@port";

/// Positional transfer list for one message. Payloads reference entries by
/// index, so slots are shared across every wire value in the message.
#[derive(Debug, Default)]
pub struct TransferSlots {
    slots: Vec<Transferable>,
}

impl TransferSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, transferable: Transferable) -> usize {
        self.slots.push(transferable);
        self.slots.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<Transferable> {
        self.slots.get(index).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn into_vec(self) -> Vec<Transferable> {
        self.slots
    }
}

impl From<Vec<Transferable>> for TransferSlots {
    fn from(slots: Vec<Transferable>) -> Self {
        Self { slots }
    }
}

/// Reads a `{"@port": n}` slot reference, if that is all `value` is.
pub(crate) fn port_slot_ref(value: &serde_json::Value) -> Option<usize> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    map.get(PORT_SLOT_KEY)?.as_u64().map(|n| n as usize)
}

/// A pluggable serializer for one category of values.
///
/// `name` must resolve to the same handler in both endpoints' registries.
pub trait TransferHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_handle(&self, value: &Value) -> bool;

    /// Encode into a JSON payload, pushing any transferables that must
    /// move with it.
    fn serialize(&self, value: Value, slots: &mut TransferSlots) -> Result<serde_json::Value>;

    /// Decode a payload, claiming transferables from the message's slots.
    fn deserialize(&self, payload: serde_json::Value, slots: &TransferSlots) -> Result<Value>;
}

/// Ships an exposed object as one end of a fresh private channel.
pub struct ProxyHandler;

impl TransferHandler for ProxyHandler {
    fn name(&self) -> &'static str {
        "proxy"
    }

    fn can_handle(&self, value: &Value) -> bool {
        matches!(value, Value::Exposed(_))
    }

    fn serialize(&self, value: Value, slots: &mut TransferSlots) -> Result<serde_json::Value> {
        let Value::Exposed(target) = value else {
            return Err(Error::Unserializable(
                "proxy handler fed a non-exposed value".to_string(),
            ));
        };
        let (local, remote) = MessageChannel::new();
        crate::dispatch::expose(target, Arc::new(local));
        let slot = slots.push(Transferable::Port(remote));
        Ok(json!({ PORT_SLOT_KEY: slot }))
    }

    fn deserialize(&self, payload: serde_json::Value, slots: &TransferSlots) -> Result<Value> {
        let slot = port_slot_ref(&payload)
            .ok_or_else(|| Error::Decode("proxy payload is not a slot reference".to_string()))?;
        let Transferable::Port(port) = slots
            .get(slot)
            .ok_or_else(|| Error::Decode(format!("missing transfer slot {slot}")))?;
        Ok(Value::Remote(crate::proxy::wrap(Arc::new(port))))
    }
}

/// Ships a thrown value; deserializing re-throws it.
pub struct ThrowHandler;

impl TransferHandler for ThrowHandler {
    fn name(&self) -> &'static str {
        "throw"
    }

    fn can_handle(&self, value: &Value) -> bool {
        matches!(value, Value::Failure(_))
    }

    fn serialize(&self, value: Value, _slots: &mut TransferSlots) -> Result<serde_json::Value> {
        let Value::Failure(error) = value else {
            return Err(Error::Unserializable(
                "throw handler fed a non-failure value".to_string(),
            ));
        };
        Ok(match error {
            CallError::Error {
                name,
                message,
                stack,
            } => json!({
                "isError": true,
                "value": { "name": name, "message": message, "stack": stack }
            }),
            CallError::Opaque(value) => json!({ "isError": false, "value": value }),
        })
    }

    fn deserialize(&self, payload: serde_json::Value, _slots: &TransferSlots) -> Result<Value> {
        let is_error = payload
            .get("isError")
            .and_then(|b| b.as_bool())
            .unwrap_or(false);
        let value = payload
            .get("value")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let thrown = if is_error {
            CallError::Error {
                name: value
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Error")
                    .to_string(),
                message: value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                stack: value
                    .get("stack")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            }
        } else {
            CallError::Opaque(value)
        };
        Err(Error::Remote(thrown))
    }
}

/// Ordered handler list; first match wins.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn TransferHandler>>,
}

impl HandlerRegistry {
    /// The built-in order: proxy, then throw.
    pub fn builtin() -> Self {
        Self {
            handlers: vec![Arc::new(ProxyHandler), Arc::new(ThrowHandler)],
        }
    }

    pub fn empty() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Append a handler. Earlier entries take precedence, so a handler
    /// meant to shadow a built-in must go through `insert`.
    pub fn push(&mut self, handler: Arc<dyn TransferHandler>) {
        self.handlers.push(handler);
    }

    /// Insert a handler at `index`, shifting later entries down in
    /// precedence.
    pub fn insert(&mut self, index: usize, handler: Arc<dyn TransferHandler>) {
        self.handlers.insert(index, handler);
    }

    pub fn find(&self, value: &Value) -> Option<&Arc<dyn TransferHandler>> {
        self.handlers.iter().find(|h| h.can_handle(value))
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<dyn TransferHandler>> {
        self.handlers.iter().find(|h| h.name() == name)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|h| h.name()))
            .finish()
    }
}

/// Identity-keyed side table recording which data values carry
/// transferables that must move with them on the next send.
pub struct TransferRegistry {
    entries: DashMap<usize, Vec<Transferable>>,
}

impl TransferRegistry {
    pub fn global() -> &'static TransferRegistry {
        static GLOBAL: OnceLock<TransferRegistry> = OnceLock::new();
        GLOBAL.get_or_init(|| TransferRegistry {
            entries: DashMap::new(),
        })
    }

    fn key(data: &Arc<serde_json::Value>) -> usize {
        Arc::as_ptr(data) as usize
    }

    pub fn register(&self, data: &Arc<serde_json::Value>, transfers: Vec<Transferable>) {
        self.entries.insert(Self::key(data), transfers);
    }

    /// Claims the registered transferables; they move, so the entry is
    /// consumed.
    pub fn take(&self, data: &Arc<serde_json::Value>) -> Option<Vec<Transferable>> {
        self.entries.remove(&Self::key(data)).map(|(_, t)| t)
    }
}

/// Mark `data` so its transferables move with the next send. Local slot
/// references inside `data` (written as `{"@port": i}` against the order
/// of `transfers`) are rebased when the message is encoded.
pub fn transfer(data: Arc<serde_json::Value>, transfers: Vec<Transferable>) -> Value {
    TransferRegistry::global().register(&data, transfers);
    Value::Data(data)
}
