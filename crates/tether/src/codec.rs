//! Conversion between [`Value`]s and the tagged wire envelope.
//!
//! Encoding walks the handler registry in order and falls through to the
//! `RAW` arm. Decoding dispatches on the handler name; a name missing from
//! the local registry is a hard error, never a silent null, so version
//! skew between endpoints surfaces immediately.

use std::sync::Arc;

use serde_json::json;

use crate::endpoint::Transferable;
use crate::error::{Error, Result};
use crate::protocol::WireValue;
use crate::transfer::{
    HandlerRegistry, PORT_SLOT_KEY, TransferRegistry, TransferSlots, port_slot_ref,
};
use crate::value::Value;

pub struct WireCodec {
    handlers: HandlerRegistry,
}

impl WireCodec {
    pub fn new() -> Self {
        Self::with_handlers(HandlerRegistry::builtin())
    }

    pub fn with_handlers(handlers: HandlerRegistry) -> Self {
        Self { handlers }
    }

    pub fn to_wire(&self, value: Value, slots: &mut TransferSlots) -> Result<WireValue> {
        if let Some(handler) = self.handlers.find(&value) {
            let name = handler.name().to_string();
            let payload = handler.serialize(value, slots)?;
            return Ok(WireValue::Handler {
                name,
                value: payload,
            });
        }
        match value {
            Value::Data(data) => Ok(WireValue::raw(splice_registered(&data, slots))),
            Value::Port(port) => {
                let slot = slots.push(Transferable::Port(port));
                Ok(WireValue::raw(json!({ PORT_SLOT_KEY: slot })))
            }
            Value::Remote(_) => Err(Error::Unserializable(
                "remote references cannot be re-serialized".to_string(),
            )),
            other => Err(Error::Unserializable(format!(
                "no transfer handler accepts {other:?}"
            ))),
        }
    }

    pub fn from_wire(&self, wire: WireValue, slots: &TransferSlots) -> Result<Value> {
        match wire {
            WireValue::Handler { name, value } => match self.handlers.by_name(&name) {
                Some(handler) => handler.deserialize(value, slots),
                None => Err(Error::UnknownHandler(name)),
            },
            WireValue::Raw { value } => {
                if let Some(slot) = port_slot_ref(&value) {
                    let Transferable::Port(port) = slots
                        .get(slot)
                        .ok_or_else(|| Error::Decode(format!("missing transfer slot {slot}")))?;
                    return Ok(Value::Port(port));
                }
                Ok(Value::Data(Arc::new(value)))
            }
        }
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Splices side-table transferables into the message slots, rebasing the
/// local `{"@port": i}` references embedded in the data.
fn splice_registered(
    data: &Arc<serde_json::Value>,
    slots: &mut TransferSlots,
) -> serde_json::Value {
    match TransferRegistry::global().take(data) {
        None => (**data).clone(),
        Some(registered) => {
            let mut value = (**data).clone();
            rebase_slot_refs(&mut value, &registered, slots);
            value
        }
    }
}

fn rebase_slot_refs(
    value: &mut serde_json::Value,
    registered: &[Transferable],
    slots: &mut TransferSlots,
) {
    if let Some(local) = port_slot_ref(value) {
        if let Some(transferable) = registered.get(local) {
            let slot = slots.push(transferable.clone());
            *value = json!({ PORT_SLOT_KEY: slot });
        }
        return;
    }
    match value {
        serde_json::Value::Object(map) => {
            for child in map.values_mut() {
                rebase_slot_refs(child, registered, slots);
            }
        }
        serde_json::Value::Array(items) => {
            for child in items.iter_mut() {
                rebase_slot_refs(child, registered, slots);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::MessageChannel;
    use crate::transfer::transfer;

    #[test]
    fn plain_data_takes_the_raw_arm() {
        let codec = WireCodec::new();
        let mut slots = TransferSlots::new();
        let wire = codec
            .to_wire(Value::json(json!({"a": 1})), &mut slots)
            .unwrap();

        assert_eq!(wire, WireValue::raw(json!({"a": 1})));
        assert!(slots.is_empty());

        let back = codec.from_wire(wire, &slots).unwrap();
        assert_eq!(back.as_json(), Some(&json!({"a": 1})));
    }

    #[test]
    fn ports_travel_as_slot_references() {
        let codec = WireCodec::new();
        let mut slots = TransferSlots::new();
        let (_keep, port) = MessageChannel::new();

        let wire = codec.to_wire(Value::Port(port), &mut slots).unwrap();
        assert_eq!(wire, WireValue::raw(json!({PORT_SLOT_KEY: 0})));

        let slots = TransferSlots::from(slots.into_vec());
        let back = codec.from_wire(wire, &slots).unwrap();
        assert!(matches!(back, Value::Port(_)));
    }

    #[test]
    fn unknown_handler_name_fails_loudly() {
        let codec = WireCodec::new();
        let wire = WireValue::Handler {
            name: "from-a-newer-build".to_string(),
            value: serde_json::Value::Null,
        };
        let err = codec.from_wire(wire, &TransferSlots::new()).unwrap_err();
        assert!(matches!(err, Error::UnknownHandler(name) if name == "from-a-newer-build"));
    }

    #[test]
    fn remote_references_do_not_reserialize() {
        let (_a, b) = MessageChannel::new();
        let remote = crate::proxy::wrap(Arc::new(b));

        let codec = WireCodec::new();
        let err = codec
            .to_wire(Value::Remote(remote), &mut TransferSlots::new())
            .unwrap_err();
        assert!(matches!(err, Error::Unserializable(_)));
    }

    #[test]
    fn registered_transfers_are_spliced_and_rebased() {
        let codec = WireCodec::new();
        let (_x, port) = MessageChannel::new();

        let data = Arc::new(json!({"reply_to": {PORT_SLOT_KEY: 0}, "n": 7}));
        let value = transfer(data, vec![Transferable::Port(port)]);

        // a slot is already occupied, so the rebased index moves to 1
        let mut slots = TransferSlots::new();
        let (_y, occupant) = MessageChannel::new();
        slots.push(Transferable::Port(occupant));

        let wire = codec.to_wire(value, &mut slots).unwrap();
        assert_eq!(
            wire,
            WireValue::raw(json!({"reply_to": {PORT_SLOT_KEY: 1}, "n": 7}))
        );
    }

    #[test]
    fn exposed_values_go_through_the_proxy_handler() {
        let codec = WireCodec::new();
        let mut slots = TransferSlots::new();
        let wire = codec
            .to_wire(Value::exposed(crate::target::Object::new()), &mut slots)
            .unwrap();

        match wire {
            WireValue::Handler { name, value } => {
                assert_eq!(name, "proxy");
                assert_eq!(value, json!({PORT_SLOT_KEY: 0}));
            }
            other => panic!("expected a handler envelope, got {other:?}"),
        }
        assert!(!slots.is_empty());
    }
}
