//! Transport bindings for the jsonweft streaming codec.
//!
//! The codec deals in text fragments; this crate moves them. [`TextTransport`]
//! is the seam, [`channel`] provides an in-memory duplex link for tests and
//! same-process pipelines, and [`sse`] maps the wire onto server-sent events.

pub mod channel;
pub mod sse;
pub mod transport;

pub use channel::{pair, ChannelTransport};
pub use sse::{to_events, EventDecoder};
pub use transport::{into_fragments, pump, TextTransport, TransportError};
