//! Streaming JSON serialization with pluggable type handlers.
//!
//! Values beyond plain JSON (dates, maps, big integers, futures, streams)
//! are covered by [`handler`]s: synchronous ones rewrite a value into a
//! simpler one inline, asynchronous ones unfold it into an addressed event
//! sequence and fold it back on the consumer side.
//!
//! Two paths share one wire grammar. The synchronous path
//! ([`Codec::serialize_sync`]) emits a single JSON text and supports shared
//! references. The streaming path ([`Codec::serialize`] / [`Codec::parse`])
//! emits an immediate header followed by chunk records, so a consumer holds
//! a live root value while futures and streams inside it are still settling.
//!
//! ```
//! use jsonweft_core::{Codec, Value};
//!
//! let codec = Codec::with_builtins().unwrap();
//! let value = Value::object(vec![
//!     ("id", Value::from(7i64)),
//!     ("tags", Value::array(vec![Value::from("a"), Value::from("b")])),
//! ]);
//! let text = codec.serialize_sync(&value).unwrap();
//! assert_eq!(codec.deserialize_sync(&text).unwrap(), value);
//! ```

pub mod builtin;
pub mod chunk;
pub mod codec;
pub mod demux;
pub mod error;
pub mod frame;
pub mod handler;
pub mod ids;
mod inline;
pub mod multiplex;
pub mod track;
pub mod value;

pub use chunk::{Chunk, ChunkBody, ChunkKey, TailStatus};
pub use codec::{AbortHandle, Codec};
pub use demux::Demultiplexer;
pub use error::{CodecError, RemoteError, RemoteErrorKind};
pub use frame::{frame, LineAssembler};
pub use handler::{
    AsyncTransformer, FoldStream, Guard, Handler, HandlerRegistry, ProducerEvent, ProducerStream,
    RegistryBuilder, SyncTransformer,
};
pub use ids::{FixedNonceProvider, NodeId, Nonce, NonceProvider, UuidNonceProvider};
pub use multiplex::{multiplex, Multiplexed};
pub use value::{PrimitiveKind, Value};
