// Reference tracker for the synchronous walker.
//
// Keyed by composite identity (the Arc pointer), arena-style, with a
// lifetime bounded by one top-level call. The asynchronous path runs with
// no tracker at all: shared composites re-encode independently and a
// genuinely cyclic one re-encodes unboundedly. That asymmetry is the
// documented contract of the protocol.

use crate::error::CodecError;
use crate::ids::{IdAllocator, NodeId};
use crate::value::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Scalars and handler leaves: never tracked, always "new".
    Untracked,
    /// First visit; the id was just assigned.
    New(NodeId),
    /// Fully encoded earlier; encode a reference to this id.
    Seen(NodeId),
}

#[derive(Debug)]
struct Entry {
    id: NodeId,
    complete: bool,
}

#[derive(Debug, Default)]
pub struct RefTracker {
    entries: HashMap<usize, Entry>,
}

impl RefTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a visit. Revisiting a composite that is still being encoded
    /// (a value containing itself as a descendant) is a circular reference;
    /// revisiting a completed one yields its id for a reference record.
    pub fn visit(&mut self, value: &Value, ids: &mut IdAllocator) -> Result<Visit, CodecError> {
        let Some(identity) = value.identity() else {
            return Ok(Visit::Untracked);
        };
        if let Some(entry) = self.entries.get(&identity) {
            if entry.complete {
                return Ok(Visit::Seen(entry.id));
            }
            return Err(CodecError::CircularReference);
        }
        let id = ids.allocate();
        self.entries.insert(identity, Entry { id, complete: false });
        Ok(Visit::New(id))
    }

    /// Mark a composite as fully encoded, making later visits legal.
    pub fn complete(&mut self, value: &Value) {
        if let Some(identity) = value.identity() {
            if let Some(entry) = self.entries.get_mut(&identity) {
                entry.complete = true;
            }
        }
    }
}
