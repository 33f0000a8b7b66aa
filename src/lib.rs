//! A user-space TCP transport engine.
//!
//! This library implements the TCP state machine in ordinary code, with no
//! reliance on an operating-system TCP implementation. It is the transport
//! core of a software network stack: segments come in from whatever carries
//! IP datagrams for you, ordered bytes come out, and everything in
//! between — handshakes, teardown, retransmission, out-of-order
//! reassembly — happens here.
//!
//! ## Structure
//!
//! * [`wire`] holds the segment codec: field accessors over raw octet
//!   buffers, the compact [`wire::tcp::Repr`] representation, option
//!   parsing and the pseudo-header checksum.
//! * [`storage`] holds the byte containers: the sequence-positioned
//!   reassembly buffer ([`storage::ChunkBuffer`]) and the block FIFO used
//!   to decouple segment boundaries from reader demand
//!   ([`storage::StreamBuffer`]).
//! * [`layer::tcp`] holds the engine proper: the per-connection state
//!   machine, the retransmission queue, initial-sequence-number
//!   generation, and the [`layer::tcp::Endpoint`] demultiplexer that owns
//!   all connections of one stack instance.
//!
//! ## What this is not
//!
//! There is no congestion control, no selective-acknowledgement behavior
//! (the options are parsed, nothing more), no path-MTU discovery and no
//! urgent-data semantics beyond carrying the field. The engine aims at a
//! correct rendition of the protocol machine, not at production tuning.
//!
//! Network I/O is likewise out of scope: the embedder supplies a
//! [`layer::tcp::Network`] implementation for outbound segments and feeds
//! inbound ones to [`layer::tcp::Endpoint::handle_segment`]. Nothing in
//! this crate opens sockets, spawns threads, or sleeps; time enters only
//! through explicit [`std::time::Instant`] arguments to the polling entry
//! points.
#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod layer;
pub mod storage;
pub mod wire;
