// One discrete record of the streaming wire protocol.
//
// Every chunk encodes as a JSON array: [kindTag, [id, parentId, key], ...payload].
// Tails of producers announced by a header placeholder carry the bare nonce
// string in the parent slot; every other parent is a node id that was
// announced strictly earlier.

use crate::error::CodecError;
use crate::ids::{NodeId, Nonce, Parent};
use serde_json::{json, Value as JsonValue};
use std::fmt;

/// Key of a child under its parent: an array/stream index or an object field.
/// Nonce-parented tails carry no key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChunkKey {
    Index(u64),
    Field(String),
}

impl ChunkKey {
    pub fn field(name: impl Into<String>) -> Self {
        ChunkKey::Field(name.into())
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            ChunkKey::Index(i) => JsonValue::from(*i),
            ChunkKey::Field(s) => JsonValue::String(s.clone()),
        }
    }

    pub fn from_json(value: &JsonValue) -> Result<Option<Self>, CodecError> {
        match value {
            JsonValue::Null => Ok(None),
            JsonValue::Number(n) => n
                .as_u64()
                .map(|i| Some(ChunkKey::Index(i)))
                .ok_or_else(|| CodecError::protocol("chunk key index must be a non-negative integer")),
            JsonValue::String(s) => Ok(Some(ChunkKey::Field(s.clone()))),
            other => Err(CodecError::protocol(format!(
                "chunk key must be a string, an index, or null, got {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkKey::Index(i) => write!(f, "[{}]", i),
            ChunkKey::Field(s) => write!(f, ".{}", s),
        }
    }
}

/// How a producer finished. Carried on its tail record, decoupled from
/// "the producer is finished".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailStatus {
    Ok,
    Error,
    Incomplete,
}

impl TailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TailStatus::Ok => "ok",
            TailStatus::Error => "error",
            TailStatus::Incomplete => "incomplete",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CodecError> {
        match s {
            "ok" => Ok(TailStatus::Ok),
            "error" => Ok(TailStatus::Error),
            "incomplete" => Ok(TailStatus::Incomplete),
            other => Err(CodecError::protocol(format!(
                "unknown tail status '{}'",
                other
            ))),
        }
    }
}

/// Kind-specific payload of a chunk.
///
/// `Default` and `Body` both carry a raw JSON child and differ only in
/// label: `default` under a structural container, `body` under a
/// handler-driven one.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkBody {
    /// Starts an aggregate. The tag is an async handler key or a structural
    /// container tag (`"arr"` / `"obj"`).
    Head { tag: String },
    /// Raw JSON child of a structural producer.
    Default { json: JsonValue },
    /// Raw JSON element yielded by a handler-driven producer.
    Body { json: JsonValue },
    /// Child transformed by a synchronous handler.
    Leaf { handler: String, json: JsonValue },
    /// Terminates the aggregate addressed by this chunk's own id.
    Tail {
        status: TailStatus,
        error: Option<JsonValue>,
    },
    /// Reference to an already-materialized node. Only the synchronous
    /// walker emits these; a pure-async stream must not contain one.
    Ref { target: NodeId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: NodeId,
    pub parent: Parent,
    pub key: Option<ChunkKey>,
    pub body: ChunkBody,
}

impl Chunk {
    pub fn head(id: NodeId, parent: Parent, key: Option<ChunkKey>, tag: impl Into<String>) -> Self {
        Chunk {
            id,
            parent,
            key,
            body: ChunkBody::Head { tag: tag.into() },
        }
    }

    pub fn scalar(id: NodeId, parent: Parent, key: Option<ChunkKey>, json: JsonValue) -> Self {
        Chunk {
            id,
            parent,
            key,
            body: ChunkBody::Default { json },
        }
    }

    pub fn element(id: NodeId, parent: Parent, key: Option<ChunkKey>, json: JsonValue) -> Self {
        Chunk {
            id,
            parent,
            key,
            body: ChunkBody::Body { json },
        }
    }

    pub fn leaf(
        id: NodeId,
        parent: Parent,
        key: Option<ChunkKey>,
        handler: impl Into<String>,
        json: JsonValue,
    ) -> Self {
        Chunk {
            id,
            parent,
            key,
            body: ChunkBody::Leaf {
                handler: handler.into(),
                json,
            },
        }
    }

    pub fn tail(
        id: NodeId,
        parent: Parent,
        key: Option<ChunkKey>,
        status: TailStatus,
        error: Option<JsonValue>,
    ) -> Self {
        Chunk {
            id,
            parent,
            key,
            body: ChunkBody::Tail { status, error },
        }
    }

    pub fn reference(id: NodeId, parent: Parent, key: Option<ChunkKey>, target: NodeId) -> Self {
        Chunk {
            id,
            parent,
            key,
            body: ChunkBody::Ref { target },
        }
    }

    pub fn kind_tag(&self) -> &'static str {
        match self.body {
            ChunkBody::Head { .. } => "head",
            ChunkBody::Default { .. } => "default",
            ChunkBody::Body { .. } => "body",
            ChunkBody::Leaf { .. } => "leaf",
            ChunkBody::Tail { .. } => "tail",
            ChunkBody::Ref { .. } => "ref",
        }
    }

    fn ids_json(&self, nonce: &Nonce) -> JsonValue {
        json!([
            self.id.as_u64(),
            self.parent.to_json(nonce),
            self.key.as_ref().map(|k| k.to_json()).unwrap_or(JsonValue::Null),
        ])
    }

    pub fn to_json(&self, nonce: &Nonce) -> JsonValue {
        let ids = self.ids_json(nonce);
        match &self.body {
            ChunkBody::Head { tag } => json!(["head", ids, tag]),
            ChunkBody::Default { json } => json!(["default", ids, json]),
            ChunkBody::Body { json } => json!(["body", ids, json]),
            ChunkBody::Leaf { handler, json } => json!(["leaf", ids, handler, json]),
            ChunkBody::Tail { status, error } => match error {
                Some(payload) => json!(["tail", ids, status.as_str(), payload]),
                None => json!(["tail", ids, status.as_str()]),
            },
            ChunkBody::Ref { target } => json!(["ref", ids, target.as_u64()]),
        }
    }

    pub fn from_json(nonce: &Nonce, value: &JsonValue) -> Result<Self, CodecError> {
        let arr = value
            .as_array()
            .ok_or_else(|| CodecError::protocol("chunk record must be a JSON array"))?;
        if arr.len() < 3 {
            return Err(CodecError::protocol(format!(
                "chunk record has {} elements, expected at least 3",
                arr.len()
            )));
        }

        let kind = arr[0]
            .as_str()
            .ok_or_else(|| CodecError::protocol("chunk kind tag must be a string"))?;

        let ids = arr[1]
            .as_array()
            .filter(|ids| ids.len() == 3)
            .ok_or_else(|| CodecError::protocol("chunk ids must be [id, parentId, key]"))?;
        let id = ids[0]
            .as_u64()
            .map(NodeId::new)
            .ok_or_else(|| CodecError::protocol("chunk id must be a non-negative integer"))?;
        let parent = Parent::from_json(nonce, &ids[1])?;
        let key = ChunkKey::from_json(&ids[2])?;

        let body = match kind {
            "head" => {
                let tag = arr[2]
                    .as_str()
                    .ok_or_else(|| CodecError::protocol("head tag must be a string"))?;
                ChunkBody::Head { tag: tag.into() }
            }
            "default" => ChunkBody::Default {
                json: arr[2].clone(),
            },
            "body" => ChunkBody::Body {
                json: arr[2].clone(),
            },
            "leaf" => {
                if arr.len() < 4 {
                    return Err(CodecError::protocol("leaf record requires a payload"));
                }
                let handler = arr[2]
                    .as_str()
                    .ok_or_else(|| CodecError::protocol("leaf handler key must be a string"))?;
                ChunkBody::Leaf {
                    handler: handler.into(),
                    json: arr[3].clone(),
                }
            }
            "tail" => {
                let status = arr[2]
                    .as_str()
                    .ok_or_else(|| CodecError::protocol("tail status must be a string"))
                    .and_then(TailStatus::parse)?;
                ChunkBody::Tail {
                    status,
                    error: arr.get(3).cloned(),
                }
            }
            "ref" => {
                let target = arr[2]
                    .as_u64()
                    .map(NodeId::new)
                    .ok_or_else(|| CodecError::protocol("ref target must be a node id"))?;
                ChunkBody::Ref { target }
            }
            other => {
                return Err(CodecError::protocol(format!(
                    "unknown chunk kind '{}'",
                    other
                )))
            }
        };

        Ok(Chunk {
            id,
            parent,
            key,
            body,
        })
    }
}
