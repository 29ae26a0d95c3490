// Inline encoding: the synchronous walker shared by the sync path, the
// header, and leaf payloads.
//
// Protocol tuples are JSON arrays whose first element is the bare nonce,
// which keeps them unambiguous next to user arrays of the same shape:
//
//   [nonce, "obj", id, {..}]    identity-tagged object
//   [nonce, "arr", id, [..]]    identity-tagged array
//   [nonce, "ref", id]          reference to a completed composite
//   [nonce, "x", key, enc]      sync handler value
//   [nonce, "head", id, tag]    typed aggregate placeholder (async path only)
//
// A whole document frames its header as the envelope {"json": enc,
// "nonce": nonce}; the chunk section follows it.

use crate::error::CodecError;
use crate::handler::{Handler, HandlerRegistry};
use crate::ids::{IdAllocator, NodeId, Nonce};
use crate::track::{RefTracker, Visit};
use crate::value::{read_map, read_vec, Value};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use std::collections::HashMap;

pub(crate) const TAG_OBJ: &str = "obj";
pub(crate) const TAG_ARR: &str = "arr";
pub(crate) const TAG_REF: &str = "ref";
pub(crate) const TAG_HANDLER: &str = "x";
pub(crate) const TAG_HEAD: &str = "head";

/// Typed placeholder naming an aggregate whose content arrives as chunks.
/// The tag is the async handler key whose fold reconstructs the value.
pub(crate) fn placeholder(nonce: &Nonce, id: NodeId, tag: &str) -> JsonValue {
    json!([nonce.as_str(), TAG_HEAD, id.as_u64(), tag])
}

/// Header envelope of one document: `{"json": <shape>, "nonce": <token>}`.
pub(crate) fn envelope(nonce: &Nonce, json: JsonValue) -> JsonValue {
    json!({ "json": json, "nonce": nonce.as_str() })
}

pub(crate) fn split_envelope(value: &JsonValue) -> Result<(Nonce, &JsonValue), CodecError> {
    let map = value
        .as_object()
        .ok_or_else(|| CodecError::protocol("header must be a {json, nonce} envelope"))?;
    let nonce = map
        .get("nonce")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CodecError::protocol("header envelope is missing its nonce"))?;
    let payload = map
        .get("json")
        .ok_or_else(|| CodecError::protocol("header envelope is missing its json payload"))?;
    Ok((Nonce::new(nonce), payload))
}

pub(crate) struct SyncEncoder<'a> {
    pub registry: &'a HandlerRegistry,
    pub nonce: &'a Nonce,
}

impl SyncEncoder<'_> {
    /// Encode a fully synchronous value. Asynchronous values are an error
    /// here; the multiplexer intercepts them before this walker runs.
    pub fn encode(
        &self,
        tracker: &mut RefTracker,
        ids: &mut IdAllocator,
        value: &Value,
    ) -> Result<JsonValue, CodecError> {
        if let Some(handler) = self.registry.resolve(value) {
            return match handler {
                Handler::Sync(h) => {
                    let key = h.key().to_string();
                    let inner = h.serialize(value)?;
                    let enc = self.encode(tracker, ids, &inner)?;
                    Ok(json!([self.nonce.as_str(), TAG_HANDLER, key, enc]))
                }
                Handler::Async(_) => Err(CodecError::AsyncInSyncContext),
            };
        }

        self.registry.check_guards(value)?;

        match value {
            Value::Null => Ok(JsonValue::Null),
            Value::Bool(b) => Ok(JsonValue::Bool(*b)),
            Value::Number(n) => Ok(JsonValue::Number(n.clone())),
            Value::String(s) => Ok(JsonValue::String(s.clone())),
            Value::Array(items) => {
                match tracker.visit(value, ids)? {
                    Visit::Seen(id) => {
                        return Ok(json!([self.nonce.as_str(), TAG_REF, id.as_u64()]))
                    }
                    Visit::New(id) => {
                        // snapshot before recursing so no lock is held
                        let snapshot: Vec<Value> = read_vec(items).clone();
                        let mut encoded = Vec::with_capacity(snapshot.len());
                        for item in &snapshot {
                            encoded.push(self.encode(tracker, ids, item)?);
                        }
                        tracker.complete(value);
                        Ok(json!([
                            self.nonce.as_str(),
                            TAG_ARR,
                            id.as_u64(),
                            encoded
                        ]))
                    }
                    Visit::Untracked => unreachable!("arrays are always tracked"),
                }
            }
            Value::Object(map) => match tracker.visit(value, ids)? {
                Visit::Seen(id) => Ok(json!([self.nonce.as_str(), TAG_REF, id.as_u64()])),
                Visit::New(id) => {
                    let snapshot: Vec<(String, Value)> = read_map(map)
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    let mut encoded = JsonMap::with_capacity(snapshot.len());
                    for (k, v) in &snapshot {
                        encoded.insert(k.clone(), self.encode(tracker, ids, v)?);
                    }
                    tracker.complete(value);
                    Ok(json!([
                        self.nonce.as_str(),
                        TAG_OBJ,
                        id.as_u64(),
                        encoded
                    ]))
                }
                Visit::Untracked => unreachable!("objects are always tracked"),
            },
            Value::Future(_) | Value::Stream(_) => Err(CodecError::AsyncInSyncContext),
            other => Err(CodecError::unsupported(other.kind_name())),
        }
    }
}

pub(crate) struct InlineDecoder<'a> {
    pub registry: &'a HandlerRegistry,
    pub nonce: &'a Nonce,
}

impl InlineDecoder<'_> {
    /// Strict decode: an aggregate placeholder is a protocol error. This is
    /// the form for synchronous documents and chunk payloads.
    pub fn decode(
        &self,
        materialized: &mut HashMap<NodeId, Value>,
        json: &JsonValue,
    ) -> Result<Value, CodecError> {
        self.decode_with(materialized, json, &mut |_, _| {
            Err(CodecError::protocol(
                "aggregate placeholder in an inline-only position",
            ))
        })
    }

    /// Decode with a caller-supplied substitution for aggregate
    /// placeholders. The demultiplexer uses this to put live deferred
    /// values at the positions the header announces.
    pub fn decode_with<F>(
        &self,
        materialized: &mut HashMap<NodeId, Value>,
        json: &JsonValue,
        on_placeholder: &mut F,
    ) -> Result<Value, CodecError>
    where
        F: FnMut(NodeId, &str) -> Result<Value, CodecError>,
    {
        match json {
            JsonValue::Null => Ok(Value::Null),
            JsonValue::Bool(b) => Ok(Value::Bool(*b)),
            JsonValue::Number(n) => Ok(Value::Number(n.clone())),
            JsonValue::String(s) => Ok(Value::String(s.clone())),
            JsonValue::Array(arr)
                if arr.first().and_then(|v| v.as_str()) == Some(self.nonce.as_str()) =>
            {
                self.decode_tuple(materialized, arr, on_placeholder)
            }
            JsonValue::Array(arr) => {
                let mut items = Vec::with_capacity(arr.len());
                for item in arr {
                    items.push(self.decode_with(materialized, item, on_placeholder)?);
                }
                Ok(Value::array(items))
            }
            JsonValue::Object(map) => {
                let mut entries = Vec::with_capacity(map.len());
                for (k, v) in map {
                    entries.push((k.clone(), self.decode_with(materialized, v, on_placeholder)?));
                }
                Ok(Value::object(entries))
            }
        }
    }

    fn decode_tuple<F>(
        &self,
        materialized: &mut HashMap<NodeId, Value>,
        arr: &[JsonValue],
        on_placeholder: &mut F,
    ) -> Result<Value, CodecError>
    where
        F: FnMut(NodeId, &str) -> Result<Value, CodecError>,
    {
        let tag = arr
            .get(1)
            .and_then(|v| v.as_str())
            .ok_or_else(|| CodecError::protocol("protocol tuple is missing its tag"))?;
        match tag {
            TAG_ARR => {
                let id = tuple_id(arr)?;
                let items = arr
                    .get(3)
                    .and_then(|v| v.as_array())
                    .ok_or_else(|| CodecError::protocol("arr tuple payload must be an array"))?;
                let mut decoded = Vec::with_capacity(items.len());
                for item in items {
                    decoded.push(self.decode_with(materialized, item, on_placeholder)?);
                }
                let value = Value::array(decoded);
                materialized.insert(id, value.clone());
                Ok(value)
            }
            TAG_OBJ => {
                let id = tuple_id(arr)?;
                let entries = arr
                    .get(3)
                    .and_then(|v| v.as_object())
                    .ok_or_else(|| CodecError::protocol("obj tuple payload must be an object"))?;
                let mut decoded = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    decoded.push((k.clone(), self.decode_with(materialized, v, on_placeholder)?));
                }
                let value = Value::object(decoded);
                materialized.insert(id, value.clone());
                Ok(value)
            }
            TAG_REF => {
                let id = tuple_id(arr)?;
                materialized.get(&id).cloned().ok_or_else(|| {
                    CodecError::protocol(format!("reference to unknown node {}", id))
                })
            }
            TAG_HANDLER => {
                let key = arr
                    .get(2)
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| CodecError::protocol("handler tuple key must be a string"))?;
                let payload = arr
                    .get(3)
                    .ok_or_else(|| CodecError::protocol("handler tuple is missing its payload"))?;
                let inner = self.decode_with(materialized, payload, on_placeholder)?;
                match self.registry.by_key(key) {
                    Some(Handler::Sync(h)) => h.deserialize(inner),
                    Some(Handler::Async(_)) => Err(CodecError::protocol(format!(
                        "async handler '{}' cannot appear in an inline value",
                        key
                    ))),
                    None => Err(CodecError::protocol(format!(
                        "no handler registered for wire key '{}'",
                        key
                    ))),
                }
            }
            TAG_HEAD => {
                let id = tuple_id(arr)?;
                let tag = arr.get(3).and_then(|v| v.as_str()).ok_or_else(|| {
                    CodecError::protocol("aggregate placeholder requires a handler tag")
                })?;
                on_placeholder(id, tag)
            }
            other => Err(CodecError::protocol(format!(
                "unknown protocol tuple tag '{}'",
                other
            ))),
        }
    }
}

fn tuple_id(arr: &[JsonValue]) -> Result<NodeId, CodecError> {
    arr.get(2)
        .and_then(|v| v.as_u64())
        .map(NodeId::new)
        .ok_or_else(|| CodecError::protocol("protocol tuple id must be a non-negative integer"))
}
