use crate::error::RemoteError;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{BoxStream, StreamExt};
use indexmap::IndexMap;
use serde_json::Number;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

/// Deferred value: awaitable any number of times, clonable across the graph.
pub type SharedFuture = Shared<BoxFuture<'static, Result<Value, RemoteError>>>;

/// Live sequence. The boxed source is taken exactly once by the first
/// producer that walks it; a second take closes with an incomplete tail.
pub type SharedStream = Arc<Mutex<Option<BoxStream<'static, Result<Value, RemoteError>>>>>;

pub type SharedVec = Arc<RwLock<Vec<Value>>>;
pub type SharedMap = Arc<RwLock<IndexMap<String, Value>>>;

/// Runtime primitive kind used for primitive-keyed handler dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Bool,
    Number,
    String,
    BigInt,
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PrimitiveKind::Bool => "bool",
            PrimitiveKind::Number => "number",
            PrimitiveKind::String => "string",
            PrimitiveKind::BigInt => "bigint",
        };
        write!(f, "{}", s)
    }
}

/// The native value the codec serializes.
///
/// Composites (`Array`, `Object`) carry identity through their `Arc`, which
/// is what the synchronous reference tracker keys on. Everything else is
/// either a scalar or a handler-covered leaf.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    BigInt(i128),
    Array(SharedVec),
    Object(SharedMap),
    Date(DateTime<Utc>),
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
    Regex { source: String, flags: String },
    Url(String),
    Symbol(String),
    Future(SharedFuture),
    Stream(SharedStream),
}

impl Value {
    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Arc::new(RwLock::new(items)))
    }

    pub fn object<K: Into<String>>(entries: Vec<(K, Value)>) -> Value {
        let map: IndexMap<String, Value> =
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Value::Object(Arc::new(RwLock::new(map)))
    }

    pub fn future<F>(fut: F) -> Value
    where
        F: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        Value::Future(fut.boxed().shared())
    }

    pub fn stream<S>(source: S) -> Value
    where
        S: futures::Stream<Item = Result<Value, RemoteError>> + Send + 'static,
    {
        Value::Stream(Arc::new(Mutex::new(Some(source.boxed()))))
    }

    pub fn primitive_kind(&self) -> Option<PrimitiveKind> {
        match self {
            Value::Bool(_) => Some(PrimitiveKind::Bool),
            Value::Number(_) => Some(PrimitiveKind::Number),
            Value::String(_) => Some(PrimitiveKind::String),
            Value::BigInt(_) => Some(PrimitiveKind::BigInt),
            _ => None,
        }
    }

    /// Pointer identity for reference tracking. Only composites have one.
    pub(crate) fn identity(&self) -> Option<usize> {
        match self {
            Value::Array(items) => Some(Arc::as_ptr(items) as *const () as usize),
            Value::Object(map) => Some(Arc::as_ptr(map) as *const () as usize),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::BigInt(_) => "bigint",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Date(_) => "date",
            Value::Map(_) => "map",
            Value::Set(_) => "set",
            Value::Regex { .. } => "regex",
            Value::Url(_) => "url",
            Value::Symbol(_) => "symbol",
            Value::Future(_) => "future",
            Value::Stream(_) => "stream",
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Value::Future(_) | Value::Stream(_))
    }

    /// Field lookup on an `Object`, cloning the child.
    pub fn get(&self, key: &str) -> Option<Value> {
        match self {
            Value::Object(map) => read_map(map).get(key).cloned(),
            _ => None,
        }
    }

    /// Index lookup on an `Array`, cloning the element.
    pub fn index(&self, idx: usize) -> Option<Value> {
        match self {
            Value::Array(items) => read_vec(items).get(idx).cloned(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_future(&self) -> Option<SharedFuture> {
        match self {
            Value::Future(f) => Some(f.clone()),
            _ => None,
        }
    }

    /// Takes the underlying stream out of a `Stream` value. Returns `None`
    /// for non-streams or when the source was already consumed.
    pub fn take_stream(&self) -> Option<BoxStream<'static, Result<Value, RemoteError>>> {
        match self {
            Value::Stream(slot) => slot.lock().unwrap_or_else(|e| e.into_inner()).take(),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(Number::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Number(Number::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// Lock helpers that survive poisoning: a panicked writer leaves the data
/// readable, and the codec never holds a lock across a suspension point.
pub(crate) fn read_vec(items: &SharedVec) -> std::sync::RwLockReadGuard<'_, Vec<Value>> {
    items.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn read_map(map: &SharedMap) -> std::sync::RwLockReadGuard<'_, IndexMap<String, Value>> {
    map.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write_vec(items: &SharedVec) -> std::sync::RwLockWriteGuard<'_, Vec<Value>> {
    items.write().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write_map(
    map: &SharedMap,
) -> std::sync::RwLockWriteGuard<'_, IndexMap<String, Value>> {
    map.write().unwrap_or_else(|e| e.into_inner())
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(v) => write!(f, "Bool({})", v),
            Value::Number(n) => write!(f, "Number({})", n),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::BigInt(v) => write!(f, "BigInt({})", v),
            Value::Array(items) => f.debug_tuple("Array").field(&*read_vec(items)).finish(),
            Value::Object(map) => {
                let guard = read_map(map);
                f.debug_map().entries(guard.iter()).finish()
            }
            Value::Date(dt) => write!(f, "Date({})", dt.to_rfc3339()),
            Value::Map(pairs) => f.debug_tuple("Map").field(pairs).finish(),
            Value::Set(items) => f.debug_tuple("Set").field(items).finish(),
            Value::Regex { source, flags } => write!(f, "Regex(/{}/{})", source, flags),
            Value::Url(u) => write!(f, "Url({:?})", u),
            Value::Symbol(s) => write!(f, "Symbol({:?})", s),
            Value::Future(_) => write!(f, "Future(..)"),
            Value::Stream(_) => write!(f, "Stream(..)"),
        }
    }
}

impl PartialEq for Value {
    /// Deep structural equality. Futures and streams compare by identity,
    /// since their contents are not observable synchronously.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                Arc::ptr_eq(a, b) || *read_vec(a) == *read_vec(b)
            }
            (Value::Object(a), Value::Object(b)) => {
                Arc::ptr_eq(a, b) || *read_map(a) == *read_map(b)
            }
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a == b,
            (
                Value::Regex { source: s1, flags: f1 },
                Value::Regex { source: s2, flags: f2 },
            ) => s1 == s2 && f1 == f2,
            (Value::Url(a), Value::Url(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Future(a), Value::Future(b)) => a.ptr_eq(b),
            (Value::Stream(a), Value::Stream(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn test_primitive_kinds() {
        assert_eq!(Value::from(true).primitive_kind(), Some(PrimitiveKind::Bool));
        assert_eq!(Value::from(1i64).primitive_kind(), Some(PrimitiveKind::Number));
        assert_eq!(Value::from("x").primitive_kind(), Some(PrimitiveKind::String));
        assert_eq!(Value::BigInt(1).primitive_kind(), Some(PrimitiveKind::BigInt));
        assert_eq!(Value::Null.primitive_kind(), None);
        assert_eq!(Value::array(vec![]).primitive_kind(), None);
    }

    #[test]
    fn test_deep_equality() {
        let a = Value::object(vec![("x", Value::from(1i64)), ("y", Value::from("s"))]);
        let b = Value::object(vec![("x", Value::from(1i64)), ("y", Value::from("s"))]);
        assert_eq!(a, b);

        let c = Value::object(vec![("x", Value::from(2i64))]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_identity_tracks_arc() {
        let obj = Value::object(vec![("n", Value::from(1i64))]);
        let alias = obj.clone();
        assert_eq!(obj.identity(), alias.identity());

        let other = Value::object(vec![("n", Value::from(1i64))]);
        assert_ne!(obj.identity(), other.identity());
        assert_eq!(Value::Null.identity(), None);
    }

    #[test]
    fn test_stream_taken_once() {
        let v = Value::stream(stream::iter(vec![Ok(Value::from(1i64))]));
        assert!(v.take_stream().is_some());
        assert!(v.take_stream().is_none());
    }

    #[tokio::test]
    async fn test_future_awaitable_many_times() {
        let v = Value::future(async { Ok(Value::from(7i64)) });
        let f1 = v.as_future().unwrap();
        let f2 = v.as_future().unwrap();
        assert_eq!(f1.await.unwrap(), Value::from(7i64));
        assert_eq!(f2.await.unwrap(), Value::from(7i64));
    }

    #[test]
    fn test_accessors() {
        let v = Value::object(vec![("a", Value::array(vec![Value::from(5i64)]))]);
        let arr = v.get("a").unwrap();
        assert_eq!(arr.index(0).unwrap().as_i64(), Some(5));
        assert!(v.get("missing").is_none());
    }
}
