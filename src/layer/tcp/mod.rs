//! The TCP layer.
//!
//! The layer is connection oriented, which sets it apart from everything
//! below it: most incoming events *require* soliciting an answer, such as
//! an ACK for received data, and an [`Endpoint`] therefore stores
//! per-connection state rather than mere configuration.
//!
//! ## Structure
//!
//! The [`Endpoint`] owns every connection of one stack instance: a table
//! of connection slots addressed by [`SlotKey`] handles, plus the two
//! demultiplexing maps — local port to listener for endpoints still
//! awaiting their first SYN, and full four-tuple ([`ConnectionId`]) for
//! everything already matched to a peer. A connection moves from the
//! first map to the second the moment its peer becomes known, so a busy
//! server port demultiplexes per-tuple and not per-port.
//!
//! [`Connection`] is the state machine itself, written as a plain value:
//! each entry point consumes an event (a decoded segment, an application
//! call, the passage of time) and returns signals — segments to transmit
//! and callbacks to fire — which the endpoint then applies. Retransmission
//! deadlines are data inside the connection and are acted on when
//! [`Endpoint::poll`] is called, so timer expiry flows through the same
//! serialization point as everything else instead of mutating connection
//! state from a foreign thread.
//!
//! ## Simplifications
//!
//! A number of simplifying assumptions are made deliberately:
//!
//! * The retransmission timeout is a fixed 200 ms; there is no RTT
//!   estimation and no exponential backoff. After ten transmissions of
//!   the same segment without acknowledgment the connection is abandoned
//!   through a local reset.
//! * The advertised window is the fixed value 8192. The peer's window is
//!   recorded but not enforced on transmit, and there is no congestion
//!   control.
//! * Selective-acknowledgement and timestamp options are decoded but do
//!   not influence behavior; of all options only the peer's
//!   maximum-segment-size is acted on, as the split size for outbound
//!   data.
//! * A listening connection accepts exactly one peer. Accepting more
//!   connections on the same port means listening again with a fresh
//!   connection, which is the concern of whatever socket facade sits on
//!   top of this layer.

use core::fmt;
use std::net::IpAddr;
use std::time::Duration;

mod connection;
mod endpoint;
mod siphash;
mod timer;


pub use connection::{Connection, State};
pub use endpoint::{ConnectionId, Endpoint, SlotKey};
pub use siphash::IsnGenerator;
pub use timer::PacketTimer;

/// The fixed retransmission timeout.
pub const RETRANSMISSION_TIMEOUT: Duration = Duration::from_millis(200);

/// How often an unacknowledged segment is transmitted before the
/// connection is abandoned.
pub const MAX_RETRANSMISSIONS: u32 = 10;

/// How long a connection lingers in TIME_WAIT before reaching CLOSED.
pub const CLOSING_TIMEOUT: Duration = Duration::from_secs(4);

/// The window advertised in every outbound segment.
pub const SEND_WINDOW: u16 = 8192;

/// The nominal receive window. Not enforced against the peer.
pub const RECV_WINDOW: u16 = 65535;

/// The maximum segment size announced in SYN and SYN+ACK segments.
pub const SYN_MSS: u16 = 1460;

/// The peer maximum segment size assumed when the option is absent
/// (RFC 1122).
pub const DEFAULT_MSS: u16 = 536;

/// The first port the allocator hands out.
pub const EPHEMERAL_BASE: u16 = 1024;

/// The error type of the TCP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The operation is not valid in the connection's current state, e.g.
    /// connecting a connection that is not listening or sending on one
    /// that is closed.
    InvalidState,
    /// No local address is known for reaching the requested remote.
    NoRoute,
    /// The requested local port already has a listener.
    PortInUse,
    /// The handle does not refer to a live connection.
    UnknownConnection,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidState => write!(f, "operation invalid in current connection state"),
            Error::NoRoute => write!(f, "no local address for destination"),
            Error::PortInUse => write!(f, "local port already in use"),
            Error::UnknownConnection => write!(f, "no such connection"),
        }
    }
}

impl std::error::Error for Error {}

/// The result type of the TCP layer.
pub type Result<T> = core::result::Result<T, Error>;

/// The network layer below, as this layer needs to see it.
///
/// Implementations deliver encoded segments toward a destination address
/// and answer the source-address question for destinations, i.e. which
/// local address an IP datagram to `dst` would carry. Inbound traffic
/// takes the opposite path: the network layer calls
/// [`Endpoint::handle_segment`] for every datagram already demultiplexed
/// to the TCP protocol number.
pub trait Network {
    /// Deliver one encoded segment from `src` to `dst`.
    fn send(&self, src: IpAddr, dst: IpAddr, segment: &[u8]);

    /// The local source address used to reach `dst`, or `None` when no
    /// route exists.
    fn local_addr(&self, dst: IpAddr) -> Option<IpAddr>;
}

/// The callbacks a connection owner receives.
///
/// One implementation is attached per connection. Callbacks are invoked
/// while the connection's lock is held: an implementation must hand work
/// off rather than call back into the [`Endpoint`] for the same
/// connection, or it will deadlock.
#[allow(unused_variables)]
pub trait ConnectionEvents: Send {
    /// The connection reached ESTABLISHED. Fires exactly once.
    fn connected(&mut self) {}

    /// In-order bytes became available.
    fn data_received(&mut self, data: &[u8]) {}

    /// The peer initiated a close; no further data will arrive.
    fn remote_close(&mut self) {}

    /// The connection reached CLOSED and its handle is dead.
    fn closed(&mut self) {}

    /// The connection was reset — by the peer, or locally after
    /// exhausting retransmissions.
    fn reset(&mut self) {}
}
