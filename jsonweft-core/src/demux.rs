// Deserialization demultiplexer: consumes wire fragments, reassembles
// records, and routes each chunk to the aggregate it belongs to.
//
// The header settles the root immediately: its synchronous shape decodes
// inline, and every typed placeholder becomes a live deferred value backed
// by a fold registered under the placeholder's id. Structural aggregates
// (composites discovered inside a producer's output) open later via head
// chunks and are only handed to their parent once their ok tail lands and
// all of their own structural children have settled.

use crate::chunk::{Chunk, ChunkBody, ChunkKey, TailStatus};
use crate::error::{CodecError, RemoteError};
use crate::frame::LineAssembler;
use crate::handler::{Handler, HandlerRegistry};
use crate::ids::{NodeId, Nonce, Parent};
use crate::inline::{split_envelope, InlineDecoder};
use crate::value::Value;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::stream::StreamExt;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, trace, warn};

type Delivery = Result<(ChunkKey, Value), RemoteError>;

/// Largest run of missing positions an array delivery may imply. A wire
/// index further ahead of the assembled prefix is rejected as malformed
/// rather than allocated.
const MAX_INDEX_GAP: usize = 4096;

/// Called once per aggregate left unsettled when the document is cut short.
pub type InterruptHook = Box<dyn Fn(&RemoteError) + Send + Sync>;

enum Body {
    Arr {
        parent: NodeId,
        key: ChunkKey,
        items: Vec<Value>,
    },
    Obj {
        parent: NodeId,
        key: ChunkKey,
        entries: IndexMap<String, Value>,
    },
    Fold(UnboundedSender<Delivery>),
}

struct Aggregate {
    body: Body,
    /// Structural children that have opened but not yet settled. The own
    /// tail may arrive while these are still streaming; finalization waits.
    pending_children: usize,
    tail: Option<(TailStatus, Option<JsonValue>)>,
    /// First error carried up from a structural child.
    failed: Option<RemoteError>,
}

enum RootState {
    Waiting,
    Ready(Result<Value, RemoteError>),
    Taken,
}

pub struct Demultiplexer {
    registry: Arc<HandlerRegistry>,
    assembler: LineAssembler,
    header_seen: bool,
    nonce: Option<Nonce>,
    aggregates: HashMap<NodeId, Aggregate>,
    materialized: HashMap<NodeId, Value>,
    root: RootState,
    finished: bool,
    on_interrupt: Option<InterruptHook>,
}

impl std::fmt::Debug for Demultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Demultiplexer")
            .field("header_seen", &self.header_seen)
            .field("open_aggregates", &self.aggregates.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Demultiplexer {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Demultiplexer {
            registry,
            assembler: LineAssembler::new(),
            header_seen: false,
            nonce: None,
            aggregates: HashMap::new(),
            materialized: HashMap::new(),
            root: RootState::Waiting,
            finished: false,
            on_interrupt: None,
        }
    }

    pub fn set_interrupt_hook(&mut self, hook: impl Fn(&RemoteError) + Send + Sync + 'static) {
        self.on_interrupt = Some(Box::new(hook));
    }

    /// Whether the root value has settled and not been taken yet.
    pub fn root_ready(&self) -> bool {
        matches!(self.root, RootState::Ready(_))
    }

    /// Take the settled root. Deferred values inside it keep settling as
    /// later fragments are fed.
    pub fn take_root(&mut self) -> Option<Result<Value, RemoteError>> {
        if !self.root_ready() {
            return None;
        }
        match std::mem::replace(&mut self.root, RootState::Taken) {
            RootState::Ready(root) => Some(root),
            _ => None,
        }
    }

    /// Consume a text fragment. Fragment boundaries are arbitrary; records
    /// are rebuilt from complete lines.
    pub fn feed(&mut self, fragment: &str) -> Result<(), CodecError> {
        if self.finished {
            trace!("fragment after finish ignored");
            return Ok(());
        }
        let lines = self.assembler.push(fragment);
        for line in lines {
            self.process_line(&line)?;
        }
        Ok(())
    }

    /// Signal clean end of input. Every aggregate still open is settled
    /// with an interruption error. Idempotent.
    pub fn finish(&mut self) -> Result<(), CodecError> {
        if self.finished {
            return Ok(());
        }
        if let Some(rest) = self.assembler.flush() {
            self.process_line(&rest)?;
        }
        self.finished = true;
        self.sweep(RemoteError::interrupted());
        Ok(())
    }

    /// Cancel the parse. Unsettled aggregates error as aborted; buffered
    /// text is discarded.
    pub fn abort(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.assembler.flush();
        self.sweep(RemoteError::aborted());
    }

    fn process_line(&mut self, line: &str) -> Result<(), CodecError> {
        let content = line.trim_start_matches(',').trim();
        if content.is_empty() || content.chars().all(|c| matches!(c, '[' | ']' | ',')) {
            return Ok(());
        }
        let json: JsonValue = serde_json::from_str(content)?;
        if self.header_seen {
            self.accept_chunk(&json)
        } else {
            self.accept_header(&json)
        }
    }

    /// Decode the `{json, nonce}` envelope. Every typed placeholder in the
    /// shape becomes a live value on the spot: the handler's fold over a
    /// deliveries channel registered under the placeholder's id.
    fn accept_header(&mut self, json: &JsonValue) -> Result<(), CodecError> {
        self.header_seen = true;
        let (nonce, payload) = split_envelope(json)?;
        let decoder = InlineDecoder {
            registry: self.registry.as_ref(),
            nonce: &nonce,
        };
        let registry = &self.registry;
        let aggregates = &mut self.aggregates;
        let mut on_placeholder = |id: NodeId, tag: &str| {
            if aggregates.contains_key(&id) {
                return Err(CodecError::protocol(format!(
                    "duplicate placeholder for node {}",
                    id
                )));
            }
            let handler = match registry.by_key(tag) {
                Some(Handler::Async(h)) => h.clone(),
                Some(Handler::Sync(_)) => {
                    return Err(CodecError::protocol(format!(
                        "sync handler '{}' cannot drive a deferred value",
                        tag
                    )))
                }
                None => {
                    return Err(CodecError::protocol(format!(
                        "no handler registered for wire key '{}'",
                        tag
                    )))
                }
            };
            let (tx, rx) = mpsc::unbounded();
            aggregates.insert(
                id,
                Aggregate {
                    body: Body::Fold(tx),
                    pending_children: 0,
                    tail: None,
                    failed: None,
                },
            );
            Ok(handler.fold(rx.boxed()))
        };
        let value = decoder.decode_with(&mut self.materialized, payload, &mut on_placeholder)?;
        debug!(%nonce, deferred = self.aggregates.len(), "header decoded");
        self.nonce = Some(nonce);
        self.root = RootState::Ready(Ok(value));
        Ok(())
    }

    fn accept_chunk(&mut self, json: &JsonValue) -> Result<(), CodecError> {
        let Some(nonce) = self.nonce.clone() else {
            return Err(CodecError::protocol("chunk received before a header"));
        };
        let chunk = Chunk::from_json(&nonce, json)?;
        trace!(id = %chunk.id, kind = chunk.kind_tag(), "chunk routed");
        match chunk.body {
            ChunkBody::Head { tag } => self.open_aggregate(chunk.id, chunk.parent, chunk.key, &tag),
            ChunkBody::Default { json } | ChunkBody::Body { json } => {
                let value = self.decode_payload(&nonce, &json)?;
                self.deliver(chunk.parent, chunk.key, value)
            }
            ChunkBody::Leaf { handler, json } => {
                let payload = self.decode_payload(&nonce, &json)?;
                let value = match self.registry.by_key(&handler) {
                    Some(Handler::Sync(h)) => h.deserialize(payload)?,
                    Some(Handler::Async(_)) => {
                        return Err(CodecError::protocol(format!(
                            "async handler '{}' cannot appear on a leaf record",
                            handler
                        )))
                    }
                    None => {
                        return Err(CodecError::protocol(format!(
                            "no handler registered for wire key '{}'",
                            handler
                        )))
                    }
                };
                self.deliver(chunk.parent, chunk.key, value)
            }
            ChunkBody::Ref { target } => {
                let value = self.materialized.get(&target).cloned().ok_or_else(|| {
                    CodecError::protocol(format!("reference to unknown node {}", target))
                })?;
                self.deliver(chunk.parent, chunk.key, value)
            }
            ChunkBody::Tail { status, error } => self.accept_tail(chunk.id, status, error),
        }
    }

    fn decode_payload(&mut self, nonce: &Nonce, json: &JsonValue) -> Result<Value, CodecError> {
        let decoder = InlineDecoder {
            registry: self.registry.as_ref(),
            nonce,
        };
        decoder.decode(&mut self.materialized, json)
    }

    fn open_aggregate(
        &mut self,
        id: NodeId,
        parent: Parent,
        key: Option<ChunkKey>,
        tag: &str,
    ) -> Result<(), CodecError> {
        if self.aggregates.contains_key(&id) || self.materialized.contains_key(&id) {
            return Err(CodecError::protocol(format!("duplicate head for node {}", id)));
        }
        let Parent::Node(pid) = parent else {
            return Err(CodecError::protocol(
                "nonce-parented aggregates are announced by the header, not by head records",
            ));
        };
        let key = key.ok_or_else(|| CodecError::protocol("head record requires a key"))?;

        match tag {
            "arr" | "obj" => {
                // a structural child holds its parent open until its own tail
                let parent_agg = self.aggregates.get_mut(&pid).ok_or_else(|| {
                    CodecError::protocol(format!("head addressed to unknown aggregate {}", pid))
                })?;
                parent_agg.pending_children += 1;
                let body = if tag == "arr" {
                    Body::Arr {
                        parent: pid,
                        key,
                        items: Vec::new(),
                    }
                } else {
                    Body::Obj {
                        parent: pid,
                        key,
                        entries: IndexMap::new(),
                    }
                };
                self.aggregates.insert(
                    id,
                    Aggregate {
                        body,
                        pending_children: 0,
                        tail: None,
                        failed: None,
                    },
                );
                Ok(())
            }
            handler_key => {
                let handler = match self.registry.by_key(handler_key) {
                    Some(Handler::Async(h)) => h.clone(),
                    Some(Handler::Sync(_)) => {
                        return Err(CodecError::protocol(format!(
                            "sync handler '{}' cannot drive an aggregate",
                            handler_key
                        )))
                    }
                    None => {
                        return Err(CodecError::protocol(format!(
                            "no handler registered for wire key '{}'",
                            handler_key
                        )))
                    }
                };
                let (tx, rx) = mpsc::unbounded();
                let live = handler.fold(rx.boxed());
                self.aggregates.insert(
                    id,
                    Aggregate {
                        body: Body::Fold(tx),
                        pending_children: 0,
                        tail: None,
                        failed: None,
                    },
                );
                // the fold is live now; its tail later settles the channel
                self.deliver_to(pid, key, live)
            }
        }
    }

    fn deliver(
        &mut self,
        parent: Parent,
        key: Option<ChunkKey>,
        value: Value,
    ) -> Result<(), CodecError> {
        match parent {
            Parent::Root => Err(CodecError::protocol(
                "only tails of header-announced producers may address the nonce parent",
            )),
            Parent::Node(pid) => {
                let key =
                    key.ok_or_else(|| CodecError::protocol("child chunk requires a key"))?;
                self.deliver_to(pid, key, value)
            }
        }
    }

    fn deliver_to(&mut self, pid: NodeId, key: ChunkKey, value: Value) -> Result<(), CodecError> {
        let aggregate = self.aggregates.get_mut(&pid).ok_or_else(|| {
            CodecError::protocol(format!("delivery to unknown aggregate {}", pid))
        })?;
        match (&mut aggregate.body, key) {
            (Body::Arr { items, .. }, ChunkKey::Index(index)) => {
                let index = index as usize;
                if index < items.len() {
                    items[index] = value;
                } else if index - items.len() > MAX_INDEX_GAP {
                    return Err(CodecError::protocol(format!(
                        "index {} leaves a gap of more than {} elements at node {}",
                        index, MAX_INDEX_GAP, pid
                    )));
                } else {
                    // gaps ahead of the delivered position fill with nulls
                    items.resize(index, Value::Null);
                    items.push(value);
                }
                Ok(())
            }
            (Body::Obj { entries, .. }, ChunkKey::Field(field)) => {
                entries.insert(field, value);
                Ok(())
            }
            (Body::Fold(tx), key) => {
                // receiver may already be dropped by the consumer
                let _ = tx.unbounded_send(Ok((key, value)));
                Ok(())
            }
            (Body::Arr { .. }, key) | (Body::Obj { .. }, key) => {
                Err(CodecError::protocol(format!(
                    "key {} does not fit the container at node {}",
                    key, pid
                )))
            }
        }
    }

    fn accept_tail(
        &mut self,
        id: NodeId,
        status: TailStatus,
        error: Option<JsonValue>,
    ) -> Result<(), CodecError> {
        let aggregate = self
            .aggregates
            .get_mut(&id)
            .ok_or_else(|| CodecError::protocol(format!("tail for unknown aggregate {}", id)))?;
        if aggregate.tail.is_some() {
            return Err(CodecError::protocol(format!("duplicate tail for node {}", id)));
        }
        aggregate.tail = Some((status, error));
        self.try_finalize(id)
    }

    fn try_finalize(&mut self, id: NodeId) -> Result<(), CodecError> {
        {
            let Some(aggregate) = self.aggregates.get(&id) else {
                return Ok(());
            };
            if aggregate.tail.is_none() || aggregate.pending_children > 0 {
                return Ok(());
            }
        }
        let Some(mut aggregate) = self.aggregates.remove(&id) else {
            return Ok(());
        };
        let Some((status, error)) = aggregate.tail.take() else {
            return Ok(());
        };

        let failure = match status {
            TailStatus::Ok => aggregate.failed.take(),
            TailStatus::Error => Some(
                error
                    .as_ref()
                    .map(RemoteError::from_payload)
                    .unwrap_or_else(|| RemoteError::new("Error", "remote error")),
            ),
            TailStatus::Incomplete => Some(RemoteError::incomplete()),
        };

        match aggregate.body {
            Body::Fold(tx) => {
                if let Some(err) = failure {
                    let _ = tx.unbounded_send(Err(err));
                }
                // dropping the sender closes the fold's deliveries cleanly
                Ok(())
            }
            Body::Arr { parent, key, items } => {
                self.settle_struct(id, parent, key, Value::array(items), failure)
            }
            Body::Obj {
                parent,
                key,
                entries,
            } => self.settle_struct(
                id,
                parent,
                key,
                Value::Object(Arc::new(RwLock::new(entries))),
                failure,
            ),
        }
    }

    fn settle_struct(
        &mut self,
        id: NodeId,
        parent: NodeId,
        key: ChunkKey,
        value: Value,
        failure: Option<RemoteError>,
    ) -> Result<(), CodecError> {
        match failure {
            None => {
                self.materialized.insert(id, value.clone());
                self.deliver_to(parent, key, value)?;
                self.child_settled(parent, None)
            }
            Some(err) => self.child_settled(parent, Some(err)),
        }
    }

    fn child_settled(
        &mut self,
        parent: NodeId,
        error: Option<RemoteError>,
    ) -> Result<(), CodecError> {
        {
            let aggregate = self.aggregates.get_mut(&parent).ok_or_else(|| {
                CodecError::protocol(format!("settled child of unknown aggregate {}", parent))
            })?;
            aggregate.pending_children = aggregate.pending_children.saturating_sub(1);
            if let Some(err) = error {
                match &mut aggregate.body {
                    // a failed element surfaces as an item of the fold
                    Body::Fold(tx) => {
                        let _ = tx.unbounded_send(Err(err));
                    }
                    _ => {
                        if aggregate.failed.is_none() {
                            aggregate.failed = Some(err);
                        }
                    }
                }
            }
        }
        self.try_finalize(parent)
    }

    fn sweep(&mut self, err: RemoteError) {
        let open: Vec<_> = self.aggregates.drain().collect();
        if !open.is_empty() {
            warn!(count = open.len(), kind = ?err.kind, "settling unfinished aggregates");
        }
        for (id, aggregate) in open {
            trace!(%id, "sweeping unfinished aggregate");
            if let Some(hook) = &self.on_interrupt {
                hook(&err);
            }
            if let Body::Fold(tx) = aggregate.body {
                let _ = tx.unbounded_send(Err(err.clone()));
            }
        }
        if matches!(self.root, RootState::Waiting) {
            if let Some(hook) = &self.on_interrupt {
                hook(&err);
            }
            self.root = RootState::Ready(Err(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn demux() -> Demultiplexer {
        Demultiplexer::new(Arc::new(HandlerRegistry::with_builtins().unwrap()))
    }

    fn feed_all(demux: &mut Demultiplexer, lines: &[&str]) {
        for line in lines {
            demux.feed(line).unwrap();
            demux.feed("\n").unwrap();
        }
    }

    #[test]
    fn test_scalar_header_settles_root() {
        let mut d = demux();
        d.feed("[\n{\"json\":42,\"nonce\":\"n\"}\n,[\n]\n]").unwrap();
        d.finish().unwrap();
        assert_eq!(d.take_root().unwrap().unwrap(), Value::from(42i64));
        assert!(d.take_root().is_none());
    }

    #[test]
    fn test_inline_tuple_header() {
        let mut d = demux();
        d.feed("[\n{\"json\":[\"n\",\"x\",\"bigint\",\"12\"],\"nonce\":\"n\"}\n,[\n]\n]")
            .unwrap();
        d.finish().unwrap();
        assert_eq!(d.take_root().unwrap().unwrap(), Value::BigInt(12));
    }

    #[tokio::test]
    async fn test_header_carries_sync_shape_with_live_placeholders() {
        let mut d = demux();
        feed_all(
            &mut d,
            &[
                "[",
                "{\"json\":[\"n\",\"obj\",1,{\"a\":1,\"p\":[\"n\",\"head\",2,\"promise\"]}],\"nonce\":\"n\"}",
                ",[",
            ],
        );
        // the synchronous field is readable before any chunk arrives
        let root = d.take_root().unwrap().unwrap();
        assert_eq!(root.get("a").unwrap(), Value::from(1i64));
        let fut = root.get("p").unwrap().as_future().unwrap();
        assert!(fut.clone().now_or_never().is_none());

        feed_all(
            &mut d,
            &[
                "[\"body\",[3,2,\"ok\"],\"done\"]",
                ",[\"tail\",[2,\"n\",null],\"ok\"]",
                "]",
                "]",
            ],
        );
        d.finish().unwrap();
        assert_eq!(fut.await.unwrap(), Value::from("done"));
    }

    #[tokio::test]
    async fn test_fold_root_is_live_at_header() {
        let mut d = demux();
        feed_all(
            &mut d,
            &["[", "{\"json\":[\"n\",\"head\",1,\"promise\"],\"nonce\":\"n\"}", ",["],
        );
        // the future exists before its settlement arrives
        let root = d.take_root().unwrap().unwrap();
        let fut = root.as_future().unwrap();

        feed_all(
            &mut d,
            &[
                "[\"body\",[2,1,\"ok\"],\"done\"]",
                ",[\"tail\",[1,\"n\",null],\"ok\"]",
                "]",
                "]",
            ],
        );
        d.finish().unwrap();
        assert_eq!(fut.await.unwrap(), Value::from("done"));
    }

    #[tokio::test]
    async fn test_error_tail_rejects_future() {
        let mut d = demux();
        feed_all(
            &mut d,
            &[
                "[",
                "{\"json\":[\"n\",\"head\",1,\"promise\"],\"nonce\":\"n\"}",
                ",[",
                "[\"tail\",[1,\"n\",null],\"error\",{\"name\":\"TypeError\",\"message\":\"bad\"}]",
            ],
        );
        let root = d.take_root().unwrap().unwrap();
        let err = root.as_future().unwrap().await.unwrap_err();
        assert_eq!(err.name, "TypeError");
        assert_eq!(err.message, "bad");
    }

    #[tokio::test]
    async fn test_stream_elements_deliver_incrementally() {
        let mut d = demux();
        feed_all(
            &mut d,
            &["[", "{\"json\":[\"n\",\"head\",1,\"stream\"],\"nonce\":\"n\"}", ",["],
        );
        let root = d.take_root().unwrap().unwrap();
        let mut items = root.take_stream().unwrap();

        feed_all(&mut d, &["[\"body\",[2,1,0],\"first\"]"]);
        assert_eq!(items.next().await.unwrap().unwrap(), Value::from("first"));

        feed_all(&mut d, &[",[\"body\",[3,1,1],\"second\"]", ",[\"tail\",[1,\"n\",null],\"ok\"]"]);
        assert_eq!(items.next().await.unwrap().unwrap(), Value::from("second"));
        assert!(items.next().await.is_none());
    }

    #[tokio::test]
    async fn test_ok_tail_waits_for_struct_children() {
        let mut d = demux();
        feed_all(
            &mut d,
            &[
                "[",
                "{\"json\":[\"n\",\"head\",1,\"promise\"],\"nonce\":\"n\"}",
                ",[",
                "[\"head\",[2,1,\"ok\"],\"obj\"]",
                ",[\"head\",[3,2,\"inner\"],\"arr\"]",
                ",[\"tail\",[2,1,\"ok\"],\"ok\"]",
            ],
        );
        let fut = d.take_root().unwrap().unwrap().as_future().unwrap();
        // the object's tail arrived but its child array is still open
        assert!(fut.clone().now_or_never().is_none());

        feed_all(
            &mut d,
            &[
                ",[\"default\",[4,3,0],9]",
                ",[\"tail\",[3,2,\"inner\"],\"ok\"]",
                ",[\"tail\",[1,\"n\",null],\"ok\"]",
            ],
        );
        let settled = fut.await.unwrap();
        assert_eq!(
            settled.get("inner").unwrap(),
            Value::array(vec![Value::from(9i64)])
        );
    }

    #[tokio::test]
    async fn test_child_error_fails_struct_parent() {
        let mut d = demux();
        feed_all(
            &mut d,
            &[
                "[",
                "{\"json\":[\"n\",\"head\",1,\"promise\"],\"nonce\":\"n\"}",
                ",[",
                "[\"head\",[2,1,\"ok\"],\"obj\"]",
                ",[\"head\",[3,2,\"inner\"],\"arr\"]",
                ",[\"tail\",[3,2,\"inner\"],\"error\",{\"name\":\"Error\",\"message\":\"broke\"}]",
                ",[\"tail\",[2,1,\"ok\"],\"ok\"]",
                ",[\"tail\",[1,\"n\",null],\"ok\"]",
            ],
        );
        let fut = d.take_root().unwrap().unwrap().as_future().unwrap();
        let err = fut.await.unwrap_err();
        assert_eq!(err.message, "broke");
    }

    #[tokio::test]
    async fn test_leaf_and_ref_chunks() {
        let mut d = demux();
        feed_all(
            &mut d,
            &[
                "[",
                "{\"json\":[\"n\",\"head\",1,\"promise\"],\"nonce\":\"n\"}",
                ",[",
                "[\"head\",[2,1,\"ok\"],\"obj\"]",
                ",[\"leaf\",[3,2,\"big\"],\"bigint\",\"33\"]",
                ",[\"head\",[4,2,\"shared\"],\"arr\"]",
                ",[\"default\",[5,4,0],true]",
                ",[\"tail\",[4,2,\"shared\"],\"ok\"]",
                ",[\"ref\",[6,2,\"again\"],4]",
                ",[\"tail\",[2,1,\"ok\"],\"ok\"]",
                ",[\"tail\",[1,\"n\",null],\"ok\"]",
            ],
        );
        let fut = d.take_root().unwrap().unwrap().as_future().unwrap();
        let settled = fut.await.unwrap();
        assert_eq!(settled.get("big").unwrap(), Value::BigInt(33));
        assert_eq!(settled.get("again").unwrap(), settled.get("shared").unwrap());
    }

    #[tokio::test]
    async fn test_finish_interrupts_pending_future() {
        let mut d = demux();
        feed_all(
            &mut d,
            &["[", "{\"json\":[\"n\",\"head\",1,\"promise\"],\"nonce\":\"n\"}", ",["],
        );
        let root = d.take_root().unwrap().unwrap();
        d.finish().unwrap();
        d.finish().unwrap();

        let err = root.as_future().unwrap().await.unwrap_err();
        assert!(err.is_interruption());
        assert!(!err.is_abort());
    }

    #[tokio::test]
    async fn test_abort_marks_pending_as_aborted() {
        let mut d = demux();
        feed_all(
            &mut d,
            &["[", "{\"json\":[\"n\",\"head\",1,\"stream\"],\"nonce\":\"n\"}", ",["],
        );
        let root = d.take_root().unwrap().unwrap();
        d.abort();

        let mut items = root.take_stream().unwrap();
        let err = items.next().await.unwrap().unwrap_err();
        assert!(err.is_abort());
        assert!(items.next().await.is_none());
    }

    #[test]
    fn test_finish_before_header_errors_root() {
        let mut d = demux();
        d.finish().unwrap();
        let err = d.take_root().unwrap().unwrap_err();
        assert!(err.is_interruption());
    }

    #[test]
    fn test_interrupt_hook_fires_per_unsettled_aggregate() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut d = demux();
        let seen = counter.clone();
        d.set_interrupt_hook(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        feed_all(
            &mut d,
            &[
                "[",
                "{\"json\":[\"n\",\"obj\",1,{\"a\":[\"n\",\"head\",2,\"promise\"],\"b\":[\"n\",\"head\",3,\"promise\"]}],\"nonce\":\"n\"}",
                ",[",
            ],
        );
        d.finish().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_wire_index_gap_is_capped() {
        let mut d = demux();
        feed_all(
            &mut d,
            &[
                "[",
                "{\"json\":[\"n\",\"head\",1,\"promise\"],\"nonce\":\"n\"}",
                ",[",
                "[\"head\",[2,1,\"ok\"],\"arr\"]",
            ],
        );
        // a far-ahead index would imply gigabytes of null padding
        assert!(d.feed(",[\"default\",[3,2,9999999999],1]\n").is_err());
    }

    #[test]
    fn test_protocol_violations_rejected() {
        // tail for a node that never opened
        let mut d = demux();
        feed_all(
            &mut d,
            &["[", "{\"json\":[\"n\",\"head\",1,\"promise\"],\"nonce\":\"n\"}", ",["],
        );
        assert!(d.feed("[\"tail\",[7,\"n\",null],\"ok\"]\n").is_err());

        // delivery after a header with no placeholders
        let mut d = demux();
        feed_all(&mut d, &["[", "{\"json\":42,\"nonce\":\"n\"}", ",["]);
        assert!(d.feed("[\"default\",[2,1,\"a\"],1]\n").is_err());

        // heads never address the nonce parent
        let mut d = demux();
        feed_all(
            &mut d,
            &["[", "{\"json\":[\"n\",\"head\",1,\"promise\"],\"nonce\":\"n\"}", ",["],
        );
        assert!(d.feed("[\"head\",[9,\"n\",null],\"obj\"]\n").is_err());

        // a header that is not the {json, nonce} envelope
        let mut d = demux();
        d.feed("[\n").unwrap();
        assert!(d.feed("[\"n\",\"head\",1,\"promise\"]\n").is_err());

        // an untagged placeholder
        let mut d = demux();
        d.feed("[\n").unwrap();
        assert!(d.feed("{\"json\":[\"n\",\"head\",1],\"nonce\":\"n\"}\n").is_err());

        // malformed json
        let mut d = demux();
        assert!(d.feed("{nope\n").is_err());
    }

    #[test]
    fn test_fragmentation_is_irrelevant() {
        let text = "[\n{\"json\":[\"n\",\"obj\",1,{\"a\":1}],\"nonce\":\"n\"}\n,[\n]\n]";
        for split in [1usize, 3, 7, text.len()] {
            let mut d = demux();
            for piece in text.as_bytes().chunks(split) {
                d.feed(std::str::from_utf8(piece).unwrap()).unwrap();
            }
            d.finish().unwrap();
            let root = d.take_root().unwrap().unwrap();
            assert_eq!(root, Value::object(vec![("a", Value::from(1i64))]));
        }
    }

    #[test]
    fn test_whole_document_parses_as_json() {
        // the line protocol concatenates to one document
        let text = "[\n{\"json\":[\"n\",\"head\",1,\"promise\"],\"nonce\":\"n\"}\n,[\n[\"body\",[2,1,\"ok\"],\"hi\"]\n,[\"tail\",[1,\"n\",null],\"ok\"]\n]\n]";
        let doc: JsonValue = serde_json::from_str(text).unwrap();
        assert_eq!(doc[0], json!({"json": ["n", "head", 1, "promise"], "nonce": "n"}));
        assert_eq!(doc[1].as_array().unwrap().len(), 2);
    }
}
