// Top-level entry points tying the registry, walker, multiplexer and
// demultiplexer together.

use crate::demux::Demultiplexer;
use crate::error::CodecError;
use crate::frame::frame;
use crate::handler::HandlerRegistry;
use crate::ids::{IdAllocator, NonceProvider, UuidNonceProvider};
use crate::inline::{envelope, split_envelope, InlineDecoder, SyncEncoder};
use crate::multiplex::{multiplex, Multiplexed};
use crate::track::RefTracker;
use crate::value::Value;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::warn;

/// A configured codec. Cheap to clone; every call draws a fresh nonce and
/// id space, so one codec serves any number of concurrent calls.
#[derive(Clone)]
pub struct Codec {
    registry: Arc<HandlerRegistry>,
    nonces: Arc<dyn NonceProvider>,
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Cancels an in-flight `parse`. Dropping the handle without calling
/// `abort` leaves the parse draining to completion.
#[derive(Debug)]
pub struct AbortHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl AbortHandle {
    /// Stop feeding the document. Every value still pending settles with
    /// the abort error, distinguishable from a transport interruption.
    pub fn abort(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Codec {
    pub fn new(registry: HandlerRegistry) -> Self {
        Codec {
            registry: Arc::new(registry),
            nonces: Arc::new(UuidNonceProvider),
        }
    }

    /// Codec with the built-in handler set.
    pub fn with_builtins() -> Result<Self, CodecError> {
        Ok(Codec::new(HandlerRegistry::with_builtins()?))
    }

    pub fn with_nonce_provider(mut self, provider: impl NonceProvider + 'static) -> Self {
        self.nonces = Arc::new(provider);
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Encode a fully synchronous value as one JSON document with an empty
    /// chunk section. Futures and streams anywhere in the graph are an
    /// error on this path.
    pub fn serialize_sync(&self, value: &Value) -> Result<String, CodecError> {
        let nonce = self.nonces.nonce();
        let encoder = SyncEncoder {
            registry: self.registry.as_ref(),
            nonce: &nonce,
        };
        let mut tracker = RefTracker::new();
        let mut ids = IdAllocator::new();
        let json = encoder.encode(&mut tracker, &mut ids, value)?;
        let doc = serde_json::json!([envelope(&nonce, json), []]);
        Ok(doc.to_string())
    }

    /// Decode a synchronous document. The nonce is read back from the
    /// header envelope; the chunk section must be empty.
    pub fn deserialize_sync(&self, text: &str) -> Result<Value, CodecError> {
        let doc: JsonValue = serde_json::from_str(text)?;
        let parts = doc
            .as_array()
            .filter(|parts| parts.len() == 2)
            .ok_or_else(|| CodecError::protocol("document must be a [header, chunks] pair"))?;
        let (nonce, payload) = split_envelope(&parts[0])?;
        let empty = parts[1]
            .as_array()
            .map(|chunks| chunks.is_empty())
            .unwrap_or(false);
        if !empty {
            return Err(CodecError::protocol(
                "synchronous document must carry no chunks",
            ));
        }
        let decoder = InlineDecoder {
            registry: self.registry.as_ref(),
            nonce: &nonce,
        };
        decoder.decode(&mut HashMap::new(), payload)
    }

    /// Serialize for the streaming path: an immediate header plus the chunk
    /// stream completing it.
    pub fn multiplex(&self, value: &Value) -> Result<Multiplexed, CodecError> {
        multiplex(self.registry.clone(), self.nonces.nonce(), value)
    }

    /// Serialize a value as wire text fragments.
    pub fn serialize(&self, value: &Value) -> Result<BoxStream<'static, String>, CodecError> {
        Ok(frame(self.multiplex(value)?))
    }

    /// A demultiplexer bound to this codec's registry, for callers that
    /// drive the feed themselves.
    pub fn demultiplexer(&self) -> Demultiplexer {
        Demultiplexer::new(self.registry.clone())
    }

    /// Parse a fragment source. Returns as soon as the root settles; the
    /// rest of the document keeps draining on a background task so deferred
    /// values inside the root settle as their chunks arrive.
    pub async fn parse<S>(&self, source: S) -> Result<Value, CodecError>
    where
        S: Stream<Item = String> + Send + 'static,
    {
        let (root, _abort) = self.parse_abortable(source).await?;
        Ok(root)
    }

    /// Like `parse`, plus a handle that cancels the background drain.
    /// Values pending at the cut settle as aborted rather than interrupted.
    pub async fn parse_abortable<S>(&self, source: S) -> Result<(Value, AbortHandle), CodecError>
    where
        S: Stream<Item = String> + Send + 'static,
    {
        let mut demux = self.demultiplexer();
        let mut source = Box::pin(source);

        while !demux.root_ready() {
            match source.next().await {
                Some(fragment) => demux.feed(&fragment)?,
                None => {
                    demux.finish()?;
                    break;
                }
            }
        }

        let root = demux
            .take_root()
            .ok_or_else(|| CodecError::protocol("source ended before a header"))?;

        let (abort_tx, mut abort_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let mut abortable = true;
            loop {
                let fragment = if abortable {
                    tokio::select! {
                        cancelled = &mut abort_rx => {
                            if cancelled.is_ok() {
                                demux.abort();
                                return;
                            }
                            // handle dropped without aborting; keep draining
                            abortable = false;
                            continue;
                        }
                        fragment = source.next() => fragment,
                    }
                } else {
                    source.next().await
                };
                match fragment {
                    Some(fragment) => {
                        if let Err(err) = demux.feed(&fragment) {
                            warn!(error = %err, "malformed fragment, interrupting parse");
                            break;
                        }
                    }
                    None => break,
                }
            }
            let _ = demux.finish();
        });

        Ok((
            root.map_err(CodecError::from)?,
            AbortHandle { tx: Some(abort_tx) },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::ids::FixedNonceProvider;
    use futures::stream;

    fn codec() -> Codec {
        Codec::with_builtins()
            .unwrap()
            .with_nonce_provider(FixedNonceProvider("fixed".into()))
    }

    #[test]
    fn test_sync_round_trip() {
        let codec = codec();
        let value = Value::object(vec![
            ("n", Value::from(3i64)),
            ("items", Value::array(vec![Value::from("a"), Value::Null])),
            ("when", Value::Date(chrono::Utc::now())),
        ]);
        let text = codec.serialize_sync(&value).unwrap();
        let back = codec.deserialize_sync(&text).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_sync_rejects_async_values() {
        let codec = codec();
        let value = Value::object(vec![("p", Value::future(async { Ok(Value::Null) }))]);
        let err = codec.serialize_sync(&value).unwrap_err();
        assert!(matches!(err, CodecError::AsyncInSyncContext));
    }

    #[test]
    fn test_sync_scalar_documents() {
        let codec = codec();
        assert_eq!(
            codec.serialize_sync(&Value::Null).unwrap(),
            "[{\"json\":null,\"nonce\":\"fixed\"},[]]"
        );
        assert_eq!(
            codec
                .deserialize_sync("[{\"json\":\"plain\",\"nonce\":\"z\"},[]]")
                .unwrap(),
            Value::from("plain")
        );
    }

    #[test]
    fn test_deserialize_rejects_non_document_text() {
        let codec = codec();
        assert!(codec.deserialize_sync("42").is_err());
        assert!(codec
            .deserialize_sync("[{\"json\":1,\"nonce\":\"z\"},[[\"tail\",[1,\"z\",null],\"ok\"]]]")
            .is_err());
    }

    #[tokio::test]
    async fn test_streaming_round_trip() {
        let codec = codec();
        let value = Value::object(vec![
            ("n", Value::from(1i64)),
            ("p", Value::future(async { Ok(Value::from("later")) })),
        ]);
        let fragments = codec.serialize(&value).unwrap();
        let root = codec.parse(fragments).await.unwrap();

        assert_eq!(root.get("n").unwrap(), Value::from(1i64));
        let fut = root.get("p").unwrap().as_future().unwrap();
        assert_eq!(fut.await.unwrap(), Value::from("later"));
    }

    #[tokio::test]
    async fn test_parse_surfaces_root_error() {
        let codec = codec();
        let value = Value::future(async { Err::<Value, _>(RemoteError::new("Error", "no")) });
        let fragments = codec.serialize(&value).unwrap();
        // the root is the live future itself, so parse succeeds
        let root = codec.parse(fragments).await.unwrap();
        let err = root.as_future().unwrap().await.unwrap_err();
        assert_eq!(err.message, "no");
    }

    #[tokio::test]
    async fn test_parse_empty_source_is_interruption() {
        let codec = codec();
        let err = codec.parse(stream::empty::<String>()).await.unwrap_err();
        assert!(matches!(err, CodecError::Remote(e) if e.is_interruption()));
    }
}
