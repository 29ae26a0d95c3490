use crate::chunk::{ChunkKey, TailStatus};
use crate::error::{CodecError, RemoteError};
use crate::value::{PrimitiveKind, Value};
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// One step of a producer walking an aggregate value.
///
/// A well-behaved producer yields any number of `Child` events followed by
/// exactly one `End`. A producer stream that terminates without an `End` is
/// tailed as `Incomplete` by the multiplexer.
#[derive(Debug)]
pub enum ProducerEvent {
    Child(ChunkKey, Value),
    End(TailStatus, Option<RemoteError>),
}

pub type ProducerStream = BoxStream<'static, ProducerEvent>;

/// Consumer-side dual of a producer: the addressed sub-stream of deliveries
/// the demultiplexer routes to one aggregate. An `Err` item carries a
/// non-`Ok` tail; the stream closing cleanly is the `Ok` tail.
pub type FoldStream = BoxStream<'static, Result<(ChunkKey, Value), RemoteError>>;

/// Synchronous bidirectional type transformer.
///
/// `serialize` returns a simpler value the engine re-encodes inline; the
/// output must be fully synchronous (no futures or streams inside).
pub trait SyncTransformer: Send + Sync {
    /// Wire tag, unique across the registry.
    fn key(&self) -> &str;

    /// Primitive dispatch kind, if this handler is primitive-keyed.
    fn primitive(&self) -> Option<PrimitiveKind> {
        None
    }

    fn test(&self, value: &Value) -> bool;

    fn serialize(&self, value: &Value) -> Result<Value, CodecError>;

    fn deserialize(&self, payload: Value) -> Result<Value, CodecError>;
}

/// Asynchronous bidirectional type transformer: `unfold` turns the value
/// into an addressed event sequence, `fold` turns the delivered sequence
/// back into a live value.
pub trait AsyncTransformer: Send + Sync {
    fn key(&self) -> &str;

    fn test(&self, value: &Value) -> bool;

    fn unfold(&self, value: Value) -> ProducerStream;

    fn fold(&self, deliveries: FoldStream) -> Value;
}

/// Assertion hook run only for values no handler claims. Returning
/// `Ok(false)` rejects with a generated message naming the guard.
pub trait Guard: Send + Sync {
    fn name(&self) -> &str;

    fn allows(&self, value: &Value) -> Result<bool, CodecError>;
}

/// Closed set of handler kinds, resolved by explicit ordered dispatch.
#[derive(Clone)]
pub enum Handler {
    Sync(Arc<dyn SyncTransformer>),
    Async(Arc<dyn AsyncTransformer>),
}

impl Handler {
    pub fn key(&self) -> &str {
        match self {
            Handler::Sync(h) => h.key(),
            Handler::Async(h) => h.key(),
        }
    }

    pub fn test(&self, value: &Value) -> bool {
        match self {
            Handler::Sync(h) => h.test(value),
            Handler::Async(h) => h.test(value),
        }
    }

    fn primitive(&self) -> Option<PrimitiveKind> {
        match self {
            Handler::Sync(h) => h.primitive(),
            Handler::Async(_) => None,
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Sync(h) => write!(f, "Handler::Sync({})", h.key()),
            Handler::Async(h) => write!(f, "Handler::Async({})", h.key()),
        }
    }
}

/// Registered transformers, partitioned by dispatch strategy: primitive
/// lookup first, then custom testers in registration order.
pub struct HandlerRegistry {
    primitives: HashMap<PrimitiveKind, Handler>,
    custom: Vec<Handler>,
    by_key: HashMap<String, Handler>,
    guards: Vec<Arc<dyn Guard>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("primitives", &self.primitives.len())
            .field("custom", &self.custom.len())
            .field("guards", &self.guards.len())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Registry pre-loaded with the built-in handlers for dates, maps,
    /// sets, big integers, regexes, URLs, symbols, futures and streams.
    pub fn with_builtins() -> Result<Self, CodecError> {
        crate::builtin::install(RegistryBuilder::default()).build()
    }

    /// Resolve at most one applicable handler for a runtime value.
    pub fn resolve(&self, value: &Value) -> Option<&Handler> {
        if let Some(kind) = value.primitive_kind() {
            if let Some(handler) = self.primitives.get(&kind) {
                if handler.test(value) {
                    trace!(key = handler.key(), %kind, "resolved primitive handler");
                    return Some(handler);
                }
            }
        }
        let found = self.custom.iter().find(|h| h.test(value));
        if let Some(handler) = found {
            trace!(key = handler.key(), "resolved custom handler");
        }
        found
    }

    pub fn by_key(&self, key: &str) -> Option<&Handler> {
        self.by_key.get(key)
    }

    /// Run every guard against an unclaimed value.
    pub fn check_guards(&self, value: &Value) -> Result<(), CodecError> {
        for guard in &self.guards {
            if !guard.allows(value)? {
                return Err(CodecError::guard_rejected(
                    guard.name(),
                    format!("guard '{}' rejected a {}", guard.name(), value.kind_name()),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    handlers: Vec<Handler>,
    guards: Vec<Arc<dyn Guard>>,
}

impl std::fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("handlers", &self.handlers.len())
            .field("guards", &self.guards.len())
            .finish()
    }
}

impl RegistryBuilder {
    pub fn register_sync(mut self, handler: Arc<dyn SyncTransformer>) -> Self {
        self.handlers.push(Handler::Sync(handler));
        self
    }

    pub fn register_async(mut self, handler: Arc<dyn AsyncTransformer>) -> Self {
        self.handlers.push(Handler::Async(handler));
        self
    }

    pub fn guard(mut self, guard: Arc<dyn Guard>) -> Self {
        self.guards.push(guard);
        self
    }

    /// Partition handlers and validate uniqueness. Duplicate wire keys and
    /// duplicate primitive kinds are construction-time errors.
    pub fn build(self) -> Result<HandlerRegistry, CodecError> {
        let mut primitives = HashMap::new();
        let mut custom = Vec::new();
        let mut by_key = HashMap::new();

        for handler in self.handlers {
            let key = handler.key().to_string();
            if by_key.insert(key.clone(), handler.clone()).is_some() {
                return Err(CodecError::DuplicateHandler { key });
            }
            match handler.primitive() {
                Some(kind) => {
                    if primitives.insert(kind, handler).is_some() {
                        return Err(CodecError::DuplicatePrimitive { kind });
                    }
                }
                None => custom.push(handler),
            }
        }

        Ok(HandlerRegistry {
            primitives,
            custom,
            by_key,
            guards: self.guards,
        })
    }
}
