// Built-in handlers. The sync ones are stateless value<->value conversions
// the engine encodes inline; the async ones (promise, stream) are the
// unfold/fold pairs driving the streaming protocol.

use crate::chunk::{ChunkKey, TailStatus};
use crate::error::{CodecError, RemoteError};
use crate::handler::{
    AsyncTransformer, FoldStream, ProducerEvent, ProducerStream, RegistryBuilder, SyncTransformer,
};
use crate::value::{read_vec, PrimitiveKind, Value};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::ready;
use futures::stream::{self, StreamExt};
use std::sync::Arc;

/// Register every built-in handler on the builder.
pub fn install(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .register_sync(Arc::new(BigIntHandler))
        .register_sync(Arc::new(DateHandler))
        .register_sync(Arc::new(MapHandler))
        .register_sync(Arc::new(SetHandler))
        .register_sync(Arc::new(RegexHandler))
        .register_sync(Arc::new(UrlHandler))
        .register_sync(Arc::new(SymbolHandler))
        .register_async(Arc::new(PromiseHandler))
        .register_async(Arc::new(StreamHandler))
}

fn mismatch(key: &str, value: &Value) -> CodecError {
    CodecError::protocol(format!(
        "'{}' handler applied to a value of kind '{}'",
        key,
        value.kind_name()
    ))
}

/// Terminates a producer stream right after its first `End` event, so an
/// erroring source cannot keep occupying the multiplexer's race set.
fn fuse_after_end<S>(events: S) -> ProducerStream
where
    S: futures::Stream<Item = ProducerEvent> + Send + 'static,
{
    events
        .scan(false, |done, event| {
            if *done {
                return ready(None);
            }
            if matches!(event, ProducerEvent::End(..)) {
                *done = true;
            }
            ready(Some(event))
        })
        .boxed()
}

#[derive(Debug, Clone, Copy)]
pub struct DateHandler;

impl SyncTransformer for DateHandler {
    fn key(&self) -> &str {
        "date"
    }

    fn test(&self, value: &Value) -> bool {
        matches!(value, Value::Date(_))
    }

    fn serialize(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::Date(dt) => Ok(Value::String(
                dt.to_rfc3339_opts(SecondsFormat::Millis, true),
            )),
            other => Err(mismatch(self.key(), other)),
        }
    }

    fn deserialize(&self, payload: Value) -> Result<Value, CodecError> {
        let text = payload
            .as_str()
            .ok_or_else(|| CodecError::protocol("date payload must be a string"))?;
        let parsed = DateTime::parse_from_rfc3339(text)
            .map_err(|e| CodecError::protocol(format!("invalid date '{}': {}", text, e)))?;
        Ok(Value::Date(parsed.with_timezone(&Utc)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MapHandler;

impl SyncTransformer for MapHandler {
    fn key(&self) -> &str {
        "map"
    }

    fn test(&self, value: &Value) -> bool {
        matches!(value, Value::Map(_))
    }

    fn serialize(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::Map(pairs) => Ok(Value::array(
                pairs
                    .iter()
                    .map(|(k, v)| Value::array(vec![k.clone(), v.clone()]))
                    .collect(),
            )),
            other => Err(mismatch(self.key(), other)),
        }
    }

    fn deserialize(&self, payload: Value) -> Result<Value, CodecError> {
        let Value::Array(items) = payload else {
            return Err(CodecError::protocol("map payload must be an array of pairs"));
        };
        let mut pairs = Vec::new();
        for entry in read_vec(&items).iter() {
            let (k, v) = match entry {
                Value::Array(pair) => {
                    let pair = read_vec(pair);
                    if pair.len() != 2 {
                        return Err(CodecError::protocol("map entry must be a [key, value] pair"));
                    }
                    (pair[0].clone(), pair[1].clone())
                }
                _ => return Err(CodecError::protocol("map entry must be a [key, value] pair")),
            };
            pairs.push((k, v));
        }
        Ok(Value::Map(pairs))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SetHandler;

impl SyncTransformer for SetHandler {
    fn key(&self) -> &str {
        "set"
    }

    fn test(&self, value: &Value) -> bool {
        matches!(value, Value::Set(_))
    }

    fn serialize(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::Set(items) => Ok(Value::array(items.clone())),
            other => Err(mismatch(self.key(), other)),
        }
    }

    fn deserialize(&self, payload: Value) -> Result<Value, CodecError> {
        match payload {
            Value::Array(items) => Ok(Value::Set(read_vec(&items).clone())),
            _ => Err(CodecError::protocol("set payload must be an array")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BigIntHandler;

impl SyncTransformer for BigIntHandler {
    fn key(&self) -> &str {
        "bigint"
    }

    fn primitive(&self) -> Option<PrimitiveKind> {
        Some(PrimitiveKind::BigInt)
    }

    fn test(&self, value: &Value) -> bool {
        matches!(value, Value::BigInt(_))
    }

    fn serialize(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::BigInt(v) => Ok(Value::String(v.to_string())),
            other => Err(mismatch(self.key(), other)),
        }
    }

    fn deserialize(&self, payload: Value) -> Result<Value, CodecError> {
        let text = payload
            .as_str()
            .ok_or_else(|| CodecError::protocol("bigint payload must be a string"))?;
        let parsed = text
            .parse::<i128>()
            .map_err(|e| CodecError::protocol(format!("invalid bigint '{}': {}", text, e)))?;
        Ok(Value::BigInt(parsed))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegexHandler;

impl SyncTransformer for RegexHandler {
    fn key(&self) -> &str {
        "regexp"
    }

    fn test(&self, value: &Value) -> bool {
        matches!(value, Value::Regex { .. })
    }

    fn serialize(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::Regex { source, flags } => {
                Ok(Value::String(format!("/{}/{}", source, flags)))
            }
            other => Err(mismatch(self.key(), other)),
        }
    }

    fn deserialize(&self, payload: Value) -> Result<Value, CodecError> {
        let text = payload
            .as_str()
            .ok_or_else(|| CodecError::protocol("regexp payload must be a string"))?;
        let stripped = text
            .strip_prefix('/')
            .ok_or_else(|| CodecError::protocol("regexp payload must start with '/'"))?;
        let split = stripped
            .rfind('/')
            .ok_or_else(|| CodecError::protocol("regexp payload is missing its closing '/'"))?;
        Ok(Value::Regex {
            source: stripped[..split].to_string(),
            flags: stripped[split + 1..].to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UrlHandler;

impl SyncTransformer for UrlHandler {
    fn key(&self) -> &str {
        "url"
    }

    fn test(&self, value: &Value) -> bool {
        matches!(value, Value::Url(_))
    }

    fn serialize(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::Url(u) => Ok(Value::String(u.clone())),
            other => Err(mismatch(self.key(), other)),
        }
    }

    fn deserialize(&self, payload: Value) -> Result<Value, CodecError> {
        match payload {
            Value::String(s) => Ok(Value::Url(s)),
            _ => Err(CodecError::protocol("url payload must be a string")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SymbolHandler;

impl SyncTransformer for SymbolHandler {
    fn key(&self) -> &str {
        "symbol"
    }

    fn test(&self, value: &Value) -> bool {
        matches!(value, Value::Symbol(_))
    }

    fn serialize(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::Symbol(s) => Ok(Value::String(s.clone())),
            other => Err(mismatch(self.key(), other)),
        }
    }

    fn deserialize(&self, payload: Value) -> Result<Value, CodecError> {
        match payload {
            Value::String(s) => Ok(Value::Symbol(s)),
            _ => Err(CodecError::protocol("symbol payload must be a string")),
        }
    }
}

/// Futures over the wire: one settlement event, then done. A rejection is
/// not protocol failure: it travels as the producer's error tail and
/// re-surfaces only at the consumer's reconstruction boundary.
#[derive(Debug, Clone, Copy)]
pub struct PromiseHandler;

impl AsyncTransformer for PromiseHandler {
    fn key(&self) -> &str {
        "promise"
    }

    fn test(&self, value: &Value) -> bool {
        matches!(value, Value::Future(_))
    }

    fn unfold(&self, value: Value) -> ProducerStream {
        match value {
            Value::Future(fut) => stream::once(fut)
                .flat_map(|settled| {
                    let events = match settled {
                        Ok(v) => vec![
                            ProducerEvent::Child(ChunkKey::field("ok"), v),
                            ProducerEvent::End(TailStatus::Ok, None),
                        ],
                        Err(e) => vec![ProducerEvent::End(TailStatus::Error, Some(e))],
                    };
                    stream::iter(events)
                })
                .boxed(),
            other => {
                let err = RemoteError::new("TypeError", mismatch(self.key(), &other).to_string());
                stream::once(ready(ProducerEvent::End(TailStatus::Error, Some(err)))).boxed()
            }
        }
    }

    fn fold(&self, mut deliveries: FoldStream) -> Value {
        Value::future(async move {
            match deliveries.next().await {
                Some(Ok((_key, value))) => Ok(value),
                Some(Err(err)) => Err(err),
                None => Err(RemoteError::interrupted()),
            }
        })
    }
}

/// Async sequences over the wire: one event per element, in source order.
#[derive(Debug, Clone, Copy)]
pub struct StreamHandler;

impl AsyncTransformer for StreamHandler {
    fn key(&self) -> &str {
        "stream"
    }

    fn test(&self, value: &Value) -> bool {
        matches!(value, Value::Stream(_))
    }

    fn unfold(&self, value: Value) -> ProducerStream {
        let Value::Stream(slot) = value else {
            let err = RemoteError::new("TypeError", mismatch(self.key(), &value).to_string());
            return stream::once(ready(ProducerEvent::End(TailStatus::Error, Some(err)))).boxed();
        };
        let source = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        match source {
            // already consumed by an earlier walk of the same graph
            None => {
                stream::once(ready(ProducerEvent::End(TailStatus::Incomplete, None))).boxed()
            }
            Some(src) => {
                let events = src
                    .enumerate()
                    .map(|(index, item)| match item {
                        Ok(v) => ProducerEvent::Child(ChunkKey::Index(index as u64), v),
                        Err(e) => ProducerEvent::End(TailStatus::Error, Some(e)),
                    })
                    .chain(stream::once(ready(ProducerEvent::End(TailStatus::Ok, None))));
                fuse_after_end(events)
            }
        }
    }

    fn fold(&self, deliveries: FoldStream) -> Value {
        Value::stream(deliveries.map(|item| item.map(|(_key, value)| value)))
    }
}
