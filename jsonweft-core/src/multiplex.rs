// Serialization multiplexer: renders the synchronously-known shape of the
// value as the header, then races every active producer and flattens their
// events into one ordered chunk stream.
//
// Fairness and backpressure come from the race itself. Each producer has at
// most one outstanding poll, so no producer advances faster than the chunk
// stream is consumed, and a slow producer never blocks the others.

use crate::chunk::{Chunk, ChunkKey, TailStatus};
use crate::error::{CodecError, RemoteError};
use crate::handler::{Handler, HandlerRegistry, ProducerEvent, ProducerStream};
use crate::ids::{IdAllocator, NodeId, Nonce, Parent};
use crate::inline::{placeholder, SyncEncoder, TAG_ARR, TAG_OBJ};
use crate::track::RefTracker;
use crate::value::{read_map, read_vec, Value};
use futures::future::ready;
use futures::stream::{self, BoxStream, SelectAll, StreamExt};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Output of one serialization call: the header value plus the chunk stream
/// that completes it. A fully synchronous value yields an empty stream.
pub struct Multiplexed {
    pub nonce: Nonce,
    pub header: JsonValue,
    pub chunks: BoxStream<'static, Chunk>,
}

impl std::fmt::Debug for Multiplexed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexed")
            .field("nonce", &self.nonce)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

/// Serialize a value for the streaming path.
///
/// The header carries the value's synchronously-known shape: scalars raw,
/// sync-handler values as inline tuples, composites walked in place, and
/// every async-handled sub-value replaced by a typed placeholder naming the
/// producer that streams its content. Those producers are seeded here with
/// the bare nonce as their parent; the placeholder is their announcement,
/// so they emit no head chunk. Errors reachable without running any
/// producer (guards, unsupported kinds) surface here, before anything is
/// emitted.
pub fn multiplex(
    registry: Arc<HandlerRegistry>,
    nonce: Nonce,
    value: &Value,
) -> Result<Multiplexed, CodecError> {
    let mut state = MuxState::new(registry, nonce.clone());
    let header = state.encode_header(value)?;
    debug!(%nonce, header = %header, "multiplex started");

    let chunks = stream::unfold(state, |mut state| async move {
        state.next_chunk().await.map(|chunk| (chunk, state))
    })
    .boxed();

    Ok(Multiplexed {
        nonce,
        header,
        chunks,
    })
}

/// Whether an aggregate's children come from a handler's unfold or from a
/// structural walk. Scalar children under the former are labelled `body`,
/// under the latter `default`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProducerKind {
    Handler,
    Structural,
}

#[derive(Debug)]
struct AggregateMeta {
    parent: Parent,
    key: Option<ChunkKey>,
    kind: ProducerKind,
    /// Set when the producer is tailed; its stream self-terminates on the
    /// next poll so the race stops holding it.
    stop: Arc<AtomicBool>,
}

struct MuxState {
    registry: Arc<HandlerRegistry>,
    nonce: Nonce,
    ids: IdAllocator,
    race: SelectAll<BoxStream<'static, (NodeId, ProducerEvent)>>,
    active: HashSet<NodeId>,
    meta: HashMap<NodeId, AggregateMeta>,
    queue: VecDeque<Chunk>,
}

impl std::fmt::Debug for MuxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxState")
            .field("nonce", &self.nonce)
            .field("active", &self.active.len())
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl MuxState {
    fn new(registry: Arc<HandlerRegistry>, nonce: Nonce) -> Self {
        MuxState {
            registry,
            nonce,
            ids: IdAllocator::new(),
            race: SelectAll::new(),
            active: HashSet::new(),
            meta: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    /// The synchronous walk of the root. Unlike the strict sync path this
    /// keeps no reference tracker, so shared composites re-encode once per
    /// branch and a cyclic value recurses without bound.
    fn encode_header(&mut self, value: &Value) -> Result<JsonValue, CodecError> {
        match self.registry.resolve(value).cloned() {
            Some(Handler::Async(handler)) => {
                let id = self.ids.allocate();
                let tag = handler.key().to_string();
                self.register(
                    id,
                    Parent::Root,
                    None,
                    ProducerKind::Handler,
                    handler.unfold(value.clone()),
                );
                Ok(placeholder(&self.nonce, id, &tag))
            }
            Some(Handler::Sync(_)) => self.encode_inline(value),
            None => {
                self.registry.check_guards(value)?;
                match value {
                    Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
                        self.encode_inline(value)
                    }
                    Value::Array(items) => {
                        let id = self.ids.allocate();
                        // snapshot before recursing so no lock is held
                        let snapshot: Vec<Value> = read_vec(items).clone();
                        let mut encoded = Vec::with_capacity(snapshot.len());
                        for item in &snapshot {
                            encoded.push(self.encode_header(item)?);
                        }
                        Ok(json!([self.nonce.as_str(), TAG_ARR, id.as_u64(), encoded]))
                    }
                    Value::Object(map) => {
                        let id = self.ids.allocate();
                        let snapshot: Vec<(String, Value)> = read_map(map)
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect();
                        let mut encoded = JsonMap::new();
                        for (k, v) in &snapshot {
                            encoded.insert(k.clone(), self.encode_header(v)?);
                        }
                        Ok(json!([self.nonce.as_str(), TAG_OBJ, id.as_u64(), encoded]))
                    }
                    other => Err(CodecError::unsupported(other.kind_name())),
                }
            }
        }
    }

    async fn next_chunk(&mut self) -> Option<Chunk> {
        loop {
            if let Some(chunk) = self.queue.pop_front() {
                return Some(chunk);
            }
            let (id, event) = self.race.next().await?;
            self.handle(id, event);
        }
    }

    fn handle(&mut self, id: NodeId, event: ProducerEvent) {
        // late events from an already-tailed producer (its exhaustion
        // sentinel, or output after an error end) are dropped
        if !self.active.contains(&id) {
            trace!(%id, "dropping event from finished producer");
            return;
        }
        match event {
            ProducerEvent::Child(key, value) => {
                if let Err(err) = self.emit_child(id, key, &value) {
                    warn!(%id, error = %err, "child serialization failed, tailing aggregate");
                    let remote = RemoteError::new("SerializeError", err.to_string());
                    self.finish(id, TailStatus::Error, Some(remote));
                }
            }
            ProducerEvent::End(status, error) => self.finish(id, status, error),
        }
    }

    fn emit_child(
        &mut self,
        aggregate: NodeId,
        key: ChunkKey,
        value: &Value,
    ) -> Result<(), CodecError> {
        let parent = Parent::Node(aggregate);
        let parent_kind = self
            .meta
            .get(&aggregate)
            .map(|m| m.kind)
            .unwrap_or(ProducerKind::Structural);

        match self.registry.resolve(value).cloned() {
            Some(Handler::Async(handler)) => {
                self.spawn(
                    parent,
                    Some(key),
                    handler.key().to_string(),
                    handler.unfold(value.clone()),
                    ProducerKind::Handler,
                );
                Ok(())
            }
            Some(Handler::Sync(handler)) => {
                // leaf payloads are fully synchronous and self-contained
                let inner = handler.serialize(value)?;
                let json = self.encode_inline(&inner)?;
                let id = self.ids.allocate();
                self.queue
                    .push_back(Chunk::leaf(id, parent, Some(key), handler.key(), json));
                Ok(())
            }
            None => {
                self.registry.check_guards(value)?;
                match value {
                    Value::Array(_) | Value::Object(_) => {
                        self.spawn_structural(parent, Some(key), value);
                        Ok(())
                    }
                    Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
                        let json = self.encode_inline(value)?;
                        let id = self.ids.allocate();
                        let chunk = match parent_kind {
                            ProducerKind::Structural => Chunk::scalar(id, parent, Some(key), json),
                            ProducerKind::Handler => Chunk::element(id, parent, Some(key), json),
                        };
                        self.queue.push_back(chunk);
                        Ok(())
                    }
                    other => Err(CodecError::unsupported(other.kind_name())),
                }
            }
        }
    }

    /// Aggregate announced by a head chunk: children discovered inside a
    /// producer's output, as opposed to header-announced producers which
    /// `register` directly.
    fn spawn(
        &mut self,
        parent: Parent,
        key: Option<ChunkKey>,
        tag: String,
        producer: ProducerStream,
        kind: ProducerKind,
    ) -> NodeId {
        let id = self.ids.allocate();
        self.queue
            .push_back(Chunk::head(id, parent, key.clone(), tag));
        self.register(id, parent, key, kind, producer);
        id
    }

    fn register(
        &mut self,
        id: NodeId,
        parent: Parent,
        key: Option<ChunkKey>,
        kind: ProducerKind,
        producer: ProducerStream,
    ) {
        trace!(%id, "producer started");
        let stop = Arc::new(AtomicBool::new(false));
        self.active.insert(id);
        self.meta.insert(
            id,
            AggregateMeta {
                parent,
                key,
                kind,
                stop: stop.clone(),
            },
        );

        // exhaustion sentinel: a producer dying without an End event is
        // tailed as incomplete rather than hanging its aggregate
        let guarded = producer
            .chain(stream::once(ready(ProducerEvent::End(
                TailStatus::Incomplete,
                None,
            ))))
            .take_while(move |_| ready(!stop.load(Ordering::Relaxed)))
            .map(move |event| (id, event))
            .boxed();
        self.race.push(guarded);
    }

    /// Aggregate for a plain composite: its children are snapshotted up
    /// front and replayed in order, followed by an ok tail. The walk keeps
    /// no memory across composites, so values shared between branches
    /// re-encode independently on this path.
    fn spawn_structural(&mut self, parent: Parent, key: Option<ChunkKey>, value: &Value) -> NodeId {
        let (tag, children): (&str, Vec<(ChunkKey, Value)>) = match value {
            Value::Array(items) => (
                TAG_ARR,
                read_vec(items)
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (ChunkKey::Index(i as u64), v.clone()))
                    .collect(),
            ),
            Value::Object(map) => (
                TAG_OBJ,
                read_map(map)
                    .iter()
                    .map(|(k, v)| (ChunkKey::field(k.clone()), v.clone()))
                    .collect(),
            ),
            other => unreachable!("structural producer over a {}", other.kind_name()),
        };

        let producer = stream::iter(
            children
                .into_iter()
                .map(|(key, child)| ProducerEvent::Child(key, child)),
        )
        .chain(stream::once(ready(ProducerEvent::End(TailStatus::Ok, None))))
        .boxed();

        self.spawn(parent, key, tag.to_string(), producer, ProducerKind::Structural)
    }

    fn finish(&mut self, id: NodeId, status: TailStatus, error: Option<RemoteError>) {
        self.active.remove(&id);
        let Some(meta) = self.meta.remove(&id) else {
            return;
        };
        // the producer's stream terminates on its next poll, which lets
        // the race drop it even if it would keep yielding
        meta.stop.store(true, Ordering::Relaxed);
        trace!(%id, status = status.as_str(), "producer finished");
        self.queue.push_back(Chunk::tail(
            id,
            meta.parent,
            meta.key,
            status,
            error.map(|e| e.to_payload()),
        ));
    }

    fn encode_inline(&mut self, value: &Value) -> Result<JsonValue, CodecError> {
        let encoder = SyncEncoder {
            registry: self.registry.as_ref(),
            nonce: &self.nonce,
        };
        let mut tracker = RefTracker::new();
        encoder.encode(&mut tracker, &mut self.ids, value)
    }
}
