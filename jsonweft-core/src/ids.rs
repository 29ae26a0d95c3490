use crate::error::CodecError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Per-call random token. Scopes node ids and disambiguates protocol tuples
/// from user arrays that merely look like them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Nonce(String);

impl Nonce {
    pub fn new(token: impl Into<String>) -> Self {
        Nonce(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of per-call nonces. The default implementation draws a v4 UUID;
/// tests substitute a fixed token to get deterministic documents.
pub trait NonceProvider: Send + Sync {
    fn nonce(&self) -> Nonce;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UuidNonceProvider;

impl NonceProvider for UuidNonceProvider {
    fn nonce(&self) -> Nonce {
        Nonce(uuid::Uuid::new_v4().simple().to_string())
    }
}

/// Fixed nonce, for deterministic tests.
#[derive(Debug, Clone)]
pub struct FixedNonceProvider(pub String);

impl NonceProvider for FixedNonceProvider {
    fn nonce(&self) -> Nonce {
        Nonce(self.0.clone())
    }
}

/// Address of one visited value within a single top-level call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    pub fn new(value: u64) -> Self {
        NodeId(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Monotonic id source, exclusively owned by one in-flight call.
/// Ids start at 1 and are never reused within a call.
#[derive(Debug)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    pub fn new() -> Self {
        IdAllocator { next: 1 }
    }

    pub fn allocate(&mut self) -> NodeId {
        let id = self.next;
        self.next += 1;
        NodeId(id)
    }

    pub fn peek_next(&self) -> u64 {
        self.next
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Parent slot of a chunk. `Root` encodes as the bare nonce string and is
/// carried only by the tails of header-announced producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parent {
    Root,
    Node(NodeId),
}

impl Parent {
    pub fn to_json(self, nonce: &Nonce) -> JsonValue {
        match self {
            Parent::Root => JsonValue::String(nonce.as_str().to_string()),
            Parent::Node(id) => JsonValue::from(id.as_u64()),
        }
    }

    pub fn from_json(nonce: &Nonce, value: &JsonValue) -> Result<Self, CodecError> {
        match value {
            JsonValue::String(s) if s == nonce.as_str() => Ok(Parent::Root),
            JsonValue::String(s) => Err(CodecError::protocol(format!(
                "parent string '{}' does not match the call nonce",
                s
            ))),
            JsonValue::Number(n) => n
                .as_u64()
                .map(|v| Parent::Node(NodeId::new(v)))
                .ok_or_else(|| CodecError::protocol("parent id must be a non-negative integer")),
            other => Err(CodecError::protocol(format!(
                "parent must be a node id or the nonce, got {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_monotonic() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.allocate().as_u64(), 1);
        assert_eq!(ids.allocate().as_u64(), 2);
        assert_eq!(ids.allocate().as_u64(), 3);
        assert_eq!(ids.peek_next(), 4);
    }

    #[test]
    fn test_uuid_nonces_differ() {
        let provider = UuidNonceProvider;
        assert_ne!(provider.nonce(), provider.nonce());
    }

    #[test]
    fn test_parent_round_trip() {
        let nonce = Nonce::new("abc123");

        let root = Parent::Root.to_json(&nonce);
        assert_eq!(root, JsonValue::String("abc123".into()));
        assert_eq!(Parent::from_json(&nonce, &root).unwrap(), Parent::Root);

        let node = Parent::Node(NodeId::new(7)).to_json(&nonce);
        assert_eq!(
            Parent::from_json(&nonce, &node).unwrap(),
            Parent::Node(NodeId::new(7))
        );
    }

    #[test]
    fn test_parent_rejects_foreign_string() {
        let nonce = Nonce::new("abc123");
        let result = Parent::from_json(&nonce, &JsonValue::String("other".into()));
        assert!(result.is_err());
    }

    #[test]
    fn test_node_id_serde_transparent() {
        let id = NodeId::new(42);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "42");
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
