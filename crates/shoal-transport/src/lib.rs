//! Shoal Transport - streaming object transport between targets
//!
//! A transport stream is a long-lived, unidirectional object pipeline
//! multiplexed over a single HTTP PUT body: framed headers, optional
//! stream-level lz4, idle-timeout teardown, and per-object completion
//! callbacks delivered in send order. The send side lives in [`stream`],
//! the receive side in [`recv`], and the process-wide idle timer in
//! [`collector`].

pub mod collector;
pub mod header;
pub mod recv;
pub mod stream;

pub use collector::Collector;
pub use header::{ObjAttrs, ObjHdr, LAST_MARKER, MAX_HEADER_SIZE, MAX_OBJNAME, TICK_MARKER};
pub use recv::{router, ObjBody, Receiver, RecvRegistry};
pub use stream::{Extra, Obj, ObjReader, ObjSentCb, Stream, StatsSnapshot};
