//! Byte containers backing the transport engine.
//!
//! [`ChunkBuffer`] re-assembles segments that arrived out of order into
//! the in-order byte stream a consumer expects, keyed by sequence
//! numbers. [`StreamBuffer`] is a plain block FIFO that decouples segment
//! payload boundaries from the sizes a reader asks for.

pub mod chunk;
pub mod stream;

pub use chunk::{Chunk, ChunkBuffer};
pub use stream::StreamBuffer;
