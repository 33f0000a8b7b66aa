//! The per-connection state machine.
//!
//! A [`Connection`] is a plain value. Each entry point — an application
//! call, a decoded inbound segment, or a poll of the clock — mutates the
//! connection and returns `Signals`: segments to put on the wire,
//! callbacks to fire, and demultiplexer updates. The owning endpoint
//! applies them; nothing here talks to the network or the application
//! directly, which keeps every protocol rule in one testable place.

use std::net::SocketAddr;
use std::time::Instant;

use log::{debug, trace, warn};

use crate::storage::{Chunk, ChunkBuffer};
use crate::wire::tcp::{Checksum, Flags, Repr, SeqNumber, Segment};

use super::endpoint::ConnectionId;
use super::siphash::IsnGenerator;
use super::timer::PacketTimer;
use super::{
    Error, Result, CLOSING_TIMEOUT, DEFAULT_MSS, MAX_RETRANSMISSIONS, SEND_WINDOW, SYN_MSS,
};

/// The state of the connection state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    /// Waiting for a connection request, or not yet opened.
    Listen,
    /// A connection request was sent, awaiting the matching reply.
    SynSent,
    /// A connection request was received and answered, awaiting the
    /// confirming acknowledgment.
    SynReceived,
    /// The connection is open; data flows in both directions.
    Established,
    /// We closed first; our FIN awaits acknowledgment.
    FinWait1,
    /// Our FIN was acknowledged; awaiting the peer's close.
    FinWait2,
    /// The peer closed its direction; ours remains open.
    CloseWait,
    /// Both sides sent FIN; ours is not yet acknowledged.
    Closing,
    /// The peer closed first and we answered with our FIN, awaiting its
    /// acknowledgment.
    LastAck,
    /// Fully closed, lingering until the closing timeout runs out.
    TimeWait,
    /// No connection. Terminal: a closed connection never leaves this
    /// state.
    Closed,
}

/// What a connection wants its endpoint to do.
#[derive(Debug, Default, PartialEq)]
pub(super) struct Signals {
    /// Segments to encode and hand to the network layer, in order.
    pub(super) sends: Vec<Segment>,
    /// Callbacks to fire on the connection's event listener, in order.
    pub(super) events: Vec<Event>,
    /// Move this connection from the port-keyed map to the tuple-keyed
    /// map; set when a listener learned its peer.
    pub(super) rebind: Option<ConnectionId>,
    /// Remove this connection from the demultiplexer entirely; set on
    /// the transition to [`State::Closed`].
    pub(super) unbind: bool,
}

impl Signals {
    pub(super) fn merge(&mut self, mut other: Signals) {
        self.sends.append(&mut other.sends);
        self.events.append(&mut other.events);
        if other.rebind.is_some() {
            self.rebind = other.rebind;
        }
        self.unbind |= other.unbind;
    }
}

/// One callback to deliver to the connection's listener.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum Event {
    /// The connection reached ESTABLISHED.
    Connected,
    /// In-order bytes became available.
    DataReceived(Vec<u8>),
    /// The peer initiated a close.
    RemoteClose,
    /// The connection reached CLOSED.
    Closed,
    /// The connection was reset, remotely or by local abandonment.
    Reset,
}

/// The send sequence space, `SND` in RFC 793 terms.
#[derive(Clone, Copy, Debug)]
struct SendSpace {
    /// The initial send sequence number, `ISS`.
    initial: SeqNumber,
    /// The oldest unacknowledged sequence number, `SND.UNA`.
    unacked: SeqNumber,
    /// The next sequence number to send, `SND.NXT`.
    next: SeqNumber,
}

/// The receive sequence space, `RCV` in RFC 793 terms.
///
/// Nothing is known about the peer's numbering until its SYN arrives,
/// hence the options.
#[derive(Clone, Copy, Debug, Default)]
struct RecvSpace {
    /// The initial receive sequence number, `IRS`.
    initial: Option<SeqNumber>,
    /// The next sequence number expected, `RCV.NXT`.
    next: Option<SeqNumber>,
    /// The sequence number carried by the peer's FIN, fixed at first
    /// observation.
    fin: Option<SeqNumber>,
}

/// A TCP connection.
///
/// Owns the sequence-number bookkeeping for both directions, the
/// retransmission queue, and the reassembly buffer. Starts in
/// [`State::Listen`] and is driven entirely through its endpoint.
#[derive(Debug)]
pub struct Connection {
    state: State,
    tuple: Option<ConnectionId>,
    send: SendSpace,
    recv: RecvSpace,
    /// The peer's advertised receive window. Recorded, not enforced.
    peer_window: u16,
    /// The peer's maximum segment size; outbound data is split at this.
    peer_mss: u16,
    /// Repeated ACKs at `SND.UNA` while data is in flight. Counted only;
    /// there is no fast retransmit.
    dup_acks: u32,
    retransmit: Vec<PacketTimer>,
    reassembly: Option<ChunkBuffer>,
    time_wait_until: Option<Instant>,
}

impl Connection {
    /// A fresh connection in [`State::Listen`].
    pub(super) fn new() -> Connection {
        Connection {
            state: State::Listen,
            tuple: None,
            send: SendSpace {
                initial: SeqNumber(0),
                unacked: SeqNumber(0),
                next: SeqNumber(0),
            },
            recv: RecvSpace::default(),
            peer_window: 0,
            peer_mss: DEFAULT_MSS,
            dup_acks: 0,
            retransmit: Vec::new(),
            reassembly: None,
            time_wait_until: None,
        }
    }

    /// The current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.state == State::Established
    }

    /// Whether the connection reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// The peer's maximum segment size, once its SYN was seen.
    pub fn peer_mss(&self) -> u16 {
        self.peer_mss
    }

    /// The four-tuple, once the peer is known.
    pub fn tuple(&self) -> Option<ConnectionId> {
        self.tuple
    }

    /// Actively open toward a remote endpoint.
    pub(super) fn connect(
        &mut self,
        tuple: ConnectionId,
        isn: &IsnGenerator,
        now: Instant,
    ) -> Result<Signals> {
        if self.state != State::Listen {
            debug!("connect in state {:?} rejected", self.state);
            return Err(Error::InvalidState);
        }
        self.tuple = Some(tuple);
        let initial = isn.get_isn(tuple, now);
        self.send = SendSpace {
            initial,
            unacked: initial,
            next: initial,
        };
        let mut signals = Signals::default();
        self.set_state(State::SynSent, now, &mut signals);
        self.send_syn(false, now, &mut signals);
        Ok(signals)
    }

    /// Send application data, split at the peer's maximum segment size.
    pub(super) fn send(&mut self, data: &[u8], now: Instant) -> Result<Signals> {
        if data.is_empty() {
            return Ok(Signals::default());
        }
        match self.state {
            State::Established | State::CloseWait => {}
            _ => {
                debug!("send in state {:?} rejected", self.state);
                return Err(Error::InvalidState);
            }
        }
        let mut signals = Signals::default();
        for piece in data.chunks(usize::from(self.peer_mss.max(1))) {
            let mut segment = self.make_segment(self.recv.next, piece.to_vec());
            segment.repr.flags.set_psh(true);
            self.send.next += piece.len();
            self.transmit(segment, now, &mut signals);
        }
        Ok(signals)
    }

    /// Close our direction of the connection.
    pub(super) fn close(&mut self, now: Instant) -> Result<Signals> {
        let mut signals = Signals::default();
        match self.state {
            State::Established | State::SynReceived => {
                self.set_state(State::FinWait1, now, &mut signals);
                self.send_fin(now, &mut signals);
            }
            // Nothing was ever sent; there is no one to tell.
            State::SynSent | State::Listen => {
                self.set_state(State::Closed, now, &mut signals);
            }
            State::CloseWait => {
                self.set_state(State::LastAck, now, &mut signals);
                self.send_fin(now, &mut signals);
            }
            _ => {
                debug!("close in state {:?} rejected", self.state);
                return Err(Error::InvalidState);
            }
        }
        Ok(signals)
    }

    /// Abandon the connection with a RST.
    pub(super) fn reset(&mut self, now: Instant) -> Signals {
        let mut signals = Signals::default();
        if self.tuple.is_some() {
            let mut segment = self.make_segment(None, Vec::new());
            segment.repr.flags.set_rst(true);
            self.set_state(State::TimeWait, now, &mut signals);
            debug!("SEND: {}", segment);
            signals.sends.push(segment);
        } else {
            // A listener without a peer has no one to reset.
            self.set_state(State::Closed, now, &mut signals);
        }
        signals
    }

    /// Process one inbound segment.
    pub(super) fn segment_arrives(
        &mut self,
        segment: &Segment,
        isn: &IsnGenerator,
        now: Instant,
    ) -> Signals {
        let mut signals = Signals::default();
        let repr = &segment.repr;
        trace!("RECV: {}", segment);

        // A listener learns its peer from the first segment.
        if self.tuple.is_none() || self.state == State::Listen {
            self.tuple = Some(ConnectionId {
                local: SocketAddr::new(segment.dst_addr, repr.dst_port),
                remote: SocketAddr::new(segment.src_addr, repr.src_port),
            });
        }

        if !repr.flags.exclusive() {
            warn!("invalid flags [{}]: discarded", repr.flags);
            return signals;
        }

        let seq = repr.seq_number;
        if let Some(initial) = self.recv.initial {
            if seq < initial {
                debug!(
                    "sequence number below initial ({} < {}): discarded",
                    seq, initial
                );
                return signals;
            }
        }

        if let Some(ack) = repr.ack_number {
            if ack < self.send.initial {
                debug!(
                    "ack number below initial ({} < {}): discarded",
                    ack, self.send.initial
                );
                return signals;
            }
            if ack > self.send.next {
                debug!(
                    "ack number beyond next ({} > {}): discarded",
                    ack, self.send.next
                );
                return signals;
            }
            if self.send.unacked < ack {
                // Retire every segment acknowledged in full.
                self.retransmit
                    .retain(|timer| !(timer.last_seq_number() < ack));
                self.send.unacked = ack;
                self.dup_acks = 0;
            } else if self.send.unacked == ack && self.send.unacked < self.send.next {
                self.dup_acks += 1;
                debug!("repeated ack ({}): {}", ack, self.dup_acks);
            }
            // Acknowledgment of our SYN+ACK completes the handshake.
            if self.state == State::SynReceived {
                self.set_state(State::Established, now, &mut signals);
            }
            // Acknowledgment of our FIN.
            if ack == self.send.next {
                match self.state {
                    State::FinWait1 => self.set_state(State::FinWait2, now, &mut signals),
                    State::LastAck => self.set_state(State::Closed, now, &mut signals),
                    State::Closing => self.set_state(State::TimeWait, now, &mut signals),
                    _ => {}
                }
            }
        }

        self.peer_window = repr.window_len;
        if repr.flags.syn() {
            if let Some(mss) = repr.max_seg_size {
                self.peer_mss = mss;
            }
        }

        if repr.flags.rst() {
            self.rst_arrives(seq, now, &mut signals);
        } else if repr.flags.syn() {
            self.syn_arrives(repr, isn, now, &mut signals);
        } else {
            self.data_arrives(segment, now, &mut signals);
        }
        signals
    }

    fn rst_arrives(&mut self, seq: SeqNumber, now: Instant, signals: &mut Signals) {
        if self.state == State::Listen {
            // A listener has no connection to reset.
            debug!("RST while listening: discarded");
            return;
        }
        if let Some(next) = self.recv.next {
            if seq < next {
                debug!("RST at stale sequence number ({} < {}): discarded", seq, next);
                return;
            }
        }
        if self.state != State::Closed {
            signals.events.push(Event::Reset);
            self.set_state(State::Closed, now, signals);
            self.push_ack(signals);
        }
    }

    fn syn_arrives(
        &mut self,
        repr: &Repr,
        isn: &IsnGenerator,
        now: Instant,
        signals: &mut Signals,
    ) {
        match self.state {
            State::Listen => {
                // Passive open: bind to this peer. Subsequent segments of
                // the connection demultiplex by tuple, not by port.
                let tuple = match self.tuple {
                    Some(tuple) => tuple,
                    None => unreachable!("tuple recorded on segment arrival"),
                };
                signals.rebind = Some(tuple);
                self.recv.initial = Some(repr.seq_number);
                self.recv.next = Some(repr.seq_number + 1);
                let initial = isn.get_isn(tuple, now);
                self.send = SendSpace {
                    initial,
                    unacked: initial,
                    next: initial,
                };
                self.set_state(State::SynReceived, now, signals);
                self.send_syn(true, now, signals);
            }
            // The peer did not get our answer yet; repeat it.
            State::SynReceived => self.send_syn(true, now, signals),
            State::SynSent => {
                self.recv.initial = Some(repr.seq_number);
                self.recv.next = Some(repr.seq_number + 1);
                if repr.ack_number.is_some() {
                    self.set_state(State::Established, now, signals);
                } else {
                    // Simultaneous open.
                    self.set_state(State::SynReceived, now, signals);
                }
                self.push_ack(signals);
            }
            State::Established => self.push_ack(signals),
            _ => {}
        }
    }

    fn data_arrives(&mut self, segment: &Segment, now: Instant, signals: &mut Signals) {
        let repr = &segment.repr;
        let len = segment.payload.len();
        if len > 0 {
            let initial = match self.recv.initial {
                Some(initial) => initial,
                None => {
                    debug!("payload before synchronization: discarded");
                    return;
                }
            };
            let buffer = self
                .reassembly
                .get_or_insert_with(|| ChunkBuffer::new(initial + 1));
            let pos = repr.seq_number + usize::from(repr.flags.syn());
            buffer.write(Chunk::new(pos, &segment.payload));
            trace!("reassembly: {}", buffer);
            let mut delivered = None;
            if buffer.available() > 0 {
                let data = buffer.read();
                if let Some(next) = self.recv.next.as_mut() {
                    *next += data.len();
                }
                delivered = Some(data);
            } else {
                debug!("out-of-sequence data at {} [{}]", repr.seq_number, len);
            }
            self.push_ack(signals);
            if self.state == State::Established {
                if let Some(data) = delivered {
                    signals.events.push(Event::DataReceived(data));
                }
            }
        }

        if repr.flags.fin() {
            let fin_seq = repr.seq_number + len;
            match self.recv.fin {
                None => {
                    // A FIN below data already received cannot be genuine.
                    let end = match (&self.reassembly, self.recv.next) {
                        (Some(buffer), _) => buffer.end(),
                        (None, Some(next)) => next,
                        (None, None) => fin_seq,
                    };
                    if fin_seq < end {
                        warn!(
                            "FIN below received data ({} < {}): discarded",
                            fin_seq, end
                        );
                        return;
                    }
                    self.recv.fin = Some(fin_seq);
                    debug!("FIN sequence number fixed: {}", fin_seq);
                }
                Some(fin) if fin != fin_seq => {
                    warn!(
                        "FIN at inconsistent sequence number ({} != {}): discarded",
                        fin_seq, fin
                    );
                    return;
                }
                Some(_) => {}
            }

            match self.state {
                State::Established => {
                    self.set_state(State::CloseWait, now, signals);
                    self.push_ack(signals);
                }
                State::FinWait1 => {
                    self.set_state(State::Closing, now, signals);
                    self.push_ack(signals);
                }
                State::FinWait2 => {
                    self.set_state(State::TimeWait, now, signals);
                    self.push_ack(signals);
                }
                State::CloseWait | State::Closing | State::TimeWait => self.push_ack(signals),
                _ => {}
            }
        }
    }

    /// Process timer expirations: retransmissions, abandonment, and the
    /// TIME_WAIT exit.
    pub(super) fn poll(&mut self, now: Instant) -> Signals {
        let mut signals = Signals::default();

        if self.state == State::TimeWait {
            if let Some(deadline) = self.time_wait_until {
                if deadline <= now {
                    self.time_wait_until = None;
                    self.set_state(State::Closed, now, &mut signals);
                    return signals;
                }
            }
        }

        let current_ack = self.ack_number();
        let mut abandoned = false;
        for timer in &mut self.retransmit {
            if !timer.is_due(now) {
                continue;
            }
            if timer.counter() < MAX_RETRANSMISSIONS {
                let segment = timer.segment_mut();
                // The ACK field reports our current receive progress, not
                // whatever it was at first transmission.
                if segment.repr.ack_number.is_some() {
                    if let Some(ack) = current_ack {
                        segment.repr.ack_number = Some(ack);
                    }
                }
                timer.start(now);
                debug!("retransmit (attempt {}): {}", timer.counter(), timer.segment());
                signals.sends.push(timer.segment().clone());
            } else {
                warn!("maximum number of retransmissions reached");
                abandoned = true;
                break;
            }
        }
        if abandoned {
            self.retransmit.clear();
            signals.events.push(Event::Reset);
            signals.merge(self.reset(now));
        }
        signals
    }

    /// The earliest instant at which [`poll`](#method.poll) has work.
    pub(super) fn next_deadline(&self) -> Option<Instant> {
        let timers = self
            .retransmit
            .iter()
            .filter_map(PacketTimer::deadline)
            .min();
        match (timers, self.time_wait_until) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// The acknowledgment number to report.
    ///
    /// Once the peer's FIN offset is fully delivered the value moves one
    /// past `RCV.NXT`, covering the FIN's position in sequence space.
    fn ack_number(&self) -> Option<SeqNumber> {
        let next = self.recv.next?;
        Some(match self.recv.fin {
            Some(fin) if fin == next => next + 1,
            _ => next,
        })
    }

    fn set_state(&mut self, state: State, now: Instant, signals: &mut Signals) {
        if self.state == state || self.state == State::Closed {
            trace!("state change to {:?} ignored in {:?}", state, self.state);
            return;
        }
        debug!("{:?} --> {:?}", self.state, state);
        self.state = state;
        match state {
            State::Established => signals.events.push(Event::Connected),
            State::Closed => {
                self.retransmit.clear();
                signals.unbind = true;
                signals.events.push(Event::Closed);
            }
            State::Closing | State::CloseWait => signals.events.push(Event::RemoteClose),
            State::TimeWait => self.time_wait_until = Some(now + CLOSING_TIMEOUT),
            _ => {}
        }
    }

    /// Queue a segment and track it for retransmission.
    fn transmit(&mut self, segment: Segment, now: Instant, signals: &mut Signals) {
        let mut timer = PacketTimer::new(segment.clone());
        timer.start(now);
        self.retransmit.push(timer);
        debug!("SEND: {}", segment);
        signals.sends.push(segment);
    }

    /// Queue a bare acknowledgment, not tracked for retransmission.
    fn push_ack(&self, signals: &mut Signals) {
        if let Some(ack) = self.ack_number() {
            let segment = self.make_segment(Some(ack), Vec::new());
            trace!("SEND: {}", segment);
            signals.sends.push(segment);
        }
    }

    fn send_syn(&mut self, with_ack: bool, now: Instant, signals: &mut Signals) {
        let ack = if with_ack { self.recv.next } else { None };
        let mut segment = self.make_segment(ack, Vec::new());
        segment.repr.seq_number = self.send.initial;
        segment.repr.flags.set_syn(true);
        segment.repr.max_seg_size = Some(SYN_MSS);
        self.send.next = self.send.initial + 1;
        self.transmit(segment, now, signals);
    }

    fn send_fin(&mut self, now: Instant, signals: &mut Signals) {
        let mut segment = self.make_segment(self.recv.next, Vec::new());
        segment.repr.flags.set_fin(true);
        self.send.next += 1;
        self.transmit(segment, now, signals);
    }

    fn make_segment(&self, ack: Option<SeqNumber>, payload: Vec<u8>) -> Segment {
        let tuple = match self.tuple {
            Some(tuple) => tuple,
            None => unreachable!("segment built before the peer is known"),
        };
        Segment {
            src_addr: tuple.local.ip(),
            dst_addr: tuple.remote.ip(),
            repr: Repr {
                src_port: tuple.local.port(),
                dst_port: tuple.remote.port(),
                flags: Flags::default(),
                seq_number: self.send.next,
                ack_number: ack,
                window_len: SEND_WINDOW,
                urgent: None,
                window_scale: None,
                max_seg_size: None,
                sack_permitted: false,
                sack_ranges: [None; 3],
                timestamps: None,
                payload_len: payload.len() as u16,
            },
            payload,
            checksum: Checksum::Correct,
        }
    }
}
