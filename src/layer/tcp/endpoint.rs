//! Connection demultiplexing and ownership.
//!
//! One [`Endpoint`] exists per stack instance and owns its connections,
//! its demultiplexing maps, and its port allocator — there is no
//! process-wide state, so several simulated hosts can coexist in one
//! process.
//!
//! Inbound segments are matched against the tuple-keyed map first; a SYN
//! without ACK may instead match a port-keyed listener. A segment
//! matching neither draws a synthesized RST when it is such an initial
//! SYN, and is dropped otherwise. Wrong-checksum segments are dropped
//! before any of this, with no RST.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use log::{debug, trace};

use crate::wire::tcp::{Checksum, Flags, Repr, SeqNumber, Segment};

use super::connection::{Connection, Event, Signals, State};
use super::siphash::IsnGenerator;
use super::{ConnectionEvents, Error, Network, Result, EPHEMERAL_BASE, SEND_WINDOW};

/// The 4-tuple identifying one connection.
///
/// Equality and hashing cover both endpoints; this is the key under which
/// an established connection is demultiplexed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    /// Our side of the connection.
    pub local: SocketAddr,
    /// The peer's side of the connection.
    pub remote: SocketAddr,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.local, self.remote)
    }
}

/// A handle to one connection owned by an [`Endpoint`].
///
/// Handles are generational: once the connection closes and its slot is
/// reused, old handles miss instead of touching the successor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotKey {
    index: u32,
    generation: u32,
}

/// A connection together with its listener, behind one lock.
struct ConnectionSlot {
    connection: Connection,
    events: Box<dyn ConnectionEvents>,
}

struct Slot {
    generation: u32,
    entry: Option<Arc<Mutex<ConnectionSlot>>>,
}

/// The demultiplexing maps and the port allocator, behind their own lock
/// so listener lookup never contends with a connection's processing.
struct Demux {
    /// Listeners awaiting their first SYN, by local port.
    syn_listeners: HashMap<u16, SlotKey>,
    /// Matched connections, by 4-tuple.
    conn_listeners: HashMap<ConnectionId, SlotKey>,
    next_port: u16,
}

impl Demux {
    fn free_port(&mut self) -> u16 {
        while self.syn_listeners.contains_key(&self.next_port) {
            self.next_port = self.next_port.checked_add(1).unwrap_or(EPHEMERAL_BASE);
        }
        let port = self.next_port;
        self.next_port = self.next_port.checked_add(1).unwrap_or(EPHEMERAL_BASE);
        port
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A connection that panicked mid-update is not worth poisoning the
    // whole endpoint for.
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

/// The TCP layer of one stack instance.
///
/// Owns every connection, dispatches inbound segments to them, allocates
/// local ports, and drives retransmission when [`poll`](#method.poll) is
/// called. All methods take `&self`; the endpoint can be shared between
/// the network layer's delivery thread, the application, and a timing
/// thread.
pub struct Endpoint<N> {
    network: N,
    isn: IsnGenerator,
    demux: Mutex<Demux>,
    table: Mutex<Vec<Slot>>,
}

impl<N: Network> Endpoint<N> {
    /// Create an endpoint delivering through `network`.
    pub fn new(network: N) -> Endpoint<N> {
        Endpoint {
            network,
            isn: IsnGenerator::from_std_hash(),
            demux: Mutex::new(Demux {
                syn_listeners: HashMap::new(),
                conn_listeners: HashMap::new(),
                next_port: EPHEMERAL_BASE,
            }),
            table: Mutex::new(Vec::new()),
        }
    }

    /// Open a connection that waits for a peer's SYN.
    ///
    /// With `port` given, that port is claimed (or
    /// [`Error::PortInUse`] reported); otherwise a free one is
    /// allocated. The listener accepts a single connection attempt;
    /// listen again for the next peer.
    pub fn listen(&self, port: Option<u16>, events: Box<dyn ConnectionEvents>) -> Result<SlotKey> {
        let mut demux = lock(&self.demux);
        let port = match port {
            Some(port) => {
                if demux.syn_listeners.contains_key(&port) {
                    return Err(Error::PortInUse);
                }
                port
            }
            None => demux.free_port(),
        };
        let (key, _) = self.insert(ConnectionSlot {
            connection: Connection::new(),
            events,
        });
        demux.syn_listeners.insert(port, key);
        debug!("listening on port {}", port);
        Ok(key)
    }

    /// Open a connection toward `remote` and send the initial SYN.
    ///
    /// The local address is whatever the network layer uses to reach the
    /// remote; the local port is allocated. The attached listener's
    /// `connected` callback reports the handshake's completion.
    pub fn connect(
        &self,
        remote: SocketAddr,
        events: Box<dyn ConnectionEvents>,
    ) -> Result<SlotKey> {
        let local_ip = self
            .network
            .local_addr(remote.ip())
            .ok_or(Error::NoRoute)?;
        let (key, entry, tuple) = {
            let mut demux = lock(&self.demux);
            let port = demux.free_port();
            let tuple = ConnectionId {
                local: SocketAddr::new(local_ip, port),
                remote,
            };
            let (key, entry) = self.insert(ConnectionSlot {
                connection: Connection::new(),
                events,
            });
            demux.conn_listeners.insert(tuple, key);
            (key, entry, tuple)
        };
        let aftermath = {
            let mut guard = lock(&entry);
            let signals = guard.connection.connect(tuple, &self.isn, Instant::now())?;
            self.dispatch(&mut guard, signals)
        };
        self.update_maps(key, aftermath);
        Ok(key)
    }

    /// Send application data on an established connection.
    pub fn send(&self, key: SlotKey, data: &[u8]) -> Result<()> {
        let entry = self.get(key).ok_or(Error::UnknownConnection)?;
        let aftermath = {
            let mut guard = lock(&entry);
            let signals = guard.connection.send(data, Instant::now())?;
            self.dispatch(&mut guard, signals)
        };
        self.update_maps(key, aftermath);
        Ok(())
    }

    /// Close our direction of the connection.
    pub fn close(&self, key: SlotKey) -> Result<()> {
        let entry = self.get(key).ok_or(Error::UnknownConnection)?;
        let aftermath = {
            let mut guard = lock(&entry);
            let signals = guard.connection.close(Instant::now())?;
            self.dispatch(&mut guard, signals)
        };
        self.update_maps(key, aftermath);
        Ok(())
    }

    /// Abandon the connection with a RST.
    pub fn reset(&self, key: SlotKey) -> Result<()> {
        let entry = self.get(key).ok_or(Error::UnknownConnection)?;
        let aftermath = {
            let mut guard = lock(&entry);
            let signals = guard.connection.reset(Instant::now());
            self.dispatch(&mut guard, signals)
        };
        self.update_maps(key, aftermath);
        Ok(())
    }

    /// The state of a connection, or `None` for a dead handle.
    pub fn state(&self, key: SlotKey) -> Option<State> {
        let entry = self.get(key)?;
        let state = lock(&entry).connection.state();
        Some(state)
    }

    /// Whether the connection is established.
    pub fn is_connected(&self, key: SlotKey) -> bool {
        matches!(self.state(key), Some(State::Established))
    }

    /// Whether the connection is closed (a dead handle counts as
    /// closed).
    pub fn is_closed(&self, key: SlotKey) -> bool {
        self.state(key).map_or(true, |state| state == State::Closed)
    }

    /// Process one inbound segment, already demultiplexed to the TCP
    /// protocol number by the network layer.
    pub fn handle_segment(&self, src_addr: IpAddr, dst_addr: IpAddr, bytes: &[u8]) {
        let segment = match Segment::parse(src_addr, dst_addr, bytes) {
            Ok(segment) => segment,
            Err(err) => {
                debug!("undecodable segment from {}: {}", src_addr, err);
                return;
            }
        };
        if segment.checksum == Checksum::Wrong {
            debug!("wrong checksum: discarded ({})", segment);
            return;
        }

        let id = ConnectionId {
            local: SocketAddr::new(dst_addr, segment.repr.dst_port),
            remote: SocketAddr::new(src_addr, segment.repr.src_port),
        };
        let is_initial_syn = segment.repr.flags.syn() && segment.repr.ack_number.is_none();
        let key = {
            let demux = lock(&self.demux);
            match demux.conn_listeners.get(&id) {
                Some(&key) => Some(key),
                None if is_initial_syn => demux.syn_listeners.get(&id.local.port()).copied(),
                None => None,
            }
        };
        let entry = key.and_then(|key| self.get(key));
        let (key, entry) = match (key, entry) {
            (Some(key), Some(entry)) => (key, entry),
            _ => {
                if is_initial_syn {
                    debug!("no listener for {}: answering with RST", id);
                    self.send_rst(&segment);
                } else {
                    trace!("no listener: discarded ({})", segment);
                }
                return;
            }
        };

        let aftermath = {
            let mut guard = lock(&entry);
            let signals = guard
                .connection
                .segment_arrives(&segment, &self.isn, Instant::now());
            self.dispatch(&mut guard, signals)
        };
        self.update_maps(key, aftermath);
    }

    /// Process every due retransmission and closing timeout.
    ///
    /// Returns the earliest instant at which calling again has work to
    /// do. The timing facility of the embedder is expected to call this
    /// from its own thread; per-connection locks are taken as needed.
    pub fn poll(&self, now: Instant) -> Option<Instant> {
        let entries: Vec<(SlotKey, Arc<Mutex<ConnectionSlot>>)> = {
            let table = lock(&self.table);
            table
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| {
                    slot.entry.clone().map(|entry| {
                        (
                            SlotKey {
                                index: index as u32,
                                generation: slot.generation,
                            },
                            entry,
                        )
                    })
                })
                .collect()
        };

        let mut next: Option<Instant> = None;
        for (key, entry) in entries {
            let (aftermath, deadline) = {
                let mut guard = lock(&entry);
                let signals = guard.connection.poll(now);
                let aftermath = self.dispatch(&mut guard, signals);
                (aftermath, guard.connection.next_deadline())
            };
            self.update_maps(key, aftermath);
            next = match (next, deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        next
    }

    /// Encode and transmit queued segments, fire callbacks, and report
    /// the demultiplexer updates left to do once the lock is released.
    fn dispatch(&self, entry: &mut ConnectionSlot, signals: Signals) -> Aftermath {
        for segment in &signals.sends {
            self.network
                .send(segment.src_addr, segment.dst_addr, &segment.emit());
        }
        for event in signals.events {
            match event {
                Event::Connected => entry.events.connected(),
                Event::DataReceived(data) => entry.events.data_received(&data),
                Event::RemoteClose => entry.events.remote_close(),
                Event::Closed => entry.events.closed(),
                Event::Reset => entry.events.reset(),
            }
        }
        Aftermath {
            rebind: signals.rebind,
            unbind: signals.unbind,
            tuple: entry.connection.tuple(),
        }
    }

    fn update_maps(&self, key: SlotKey, aftermath: Aftermath) {
        if let Some(tuple) = aftermath.rebind {
            let mut demux = lock(&self.demux);
            demux.syn_listeners.remove(&tuple.local.port());
            demux.conn_listeners.insert(tuple, key);
            debug!("rebound to {}", tuple);
        }
        if aftermath.unbind {
            {
                let mut demux = lock(&self.demux);
                if let Some(tuple) = aftermath.tuple {
                    if demux.conn_listeners.get(&tuple) == Some(&key) {
                        demux.conn_listeners.remove(&tuple);
                    }
                }
                demux.syn_listeners.retain(|_, k| *k != key);
            }
            self.remove(key);
        }
    }

    /// Answer an unmatched connection attempt with a reset.
    fn send_rst(&self, segment: &Segment) {
        let reply = Segment {
            src_addr: segment.dst_addr,
            dst_addr: segment.src_addr,
            repr: Repr {
                src_port: segment.repr.dst_port,
                dst_port: segment.repr.src_port,
                flags: {
                    let mut flags = Flags::default();
                    flags.set_rst(true);
                    flags
                },
                seq_number: SeqNumber(0),
                ack_number: None,
                window_len: SEND_WINDOW,
                urgent: None,
                window_scale: None,
                max_seg_size: None,
                sack_permitted: false,
                sack_ranges: [None; 3],
                timestamps: None,
                payload_len: 0,
            },
            payload: Vec::new(),
            checksum: Checksum::Correct,
        };
        self.network
            .send(reply.src_addr, reply.dst_addr, &reply.emit());
    }

    fn insert(&self, entry: ConnectionSlot) -> (SlotKey, Arc<Mutex<ConnectionSlot>>) {
        let mut table = lock(&self.table);
        let entry = Arc::new(Mutex::new(entry));
        for (index, slot) in table.iter_mut().enumerate() {
            if slot.entry.is_none() {
                slot.entry = Some(entry.clone());
                let key = SlotKey {
                    index: index as u32,
                    generation: slot.generation,
                };
                return (key, entry);
            }
        }
        table.push(Slot {
            generation: 0,
            entry: Some(entry.clone()),
        });
        let key = SlotKey {
            index: (table.len() - 1) as u32,
            generation: 0,
        };
        (key, entry)
    }

    fn get(&self, key: SlotKey) -> Option<Arc<Mutex<ConnectionSlot>>> {
        let table = lock(&self.table);
        let slot = table.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.entry.clone()
    }

    fn remove(&self, key: SlotKey) {
        let mut table = lock(&self.table);
        if let Some(slot) = table.get_mut(key.index as usize) {
            if slot.generation == key.generation && slot.entry.is_some() {
                slot.entry = None;
                slot.generation += 1;
            }
        }
    }
}

/// Demultiplexer updates deferred until the connection lock is dropped.
struct Aftermath {
    rebind: Option<ConnectionId>,
    unbind: bool,
    tuple: Option<ConnectionId>,
}
