//! Per-segment retransmission timers.

use std::time::Instant;

use crate::wire::tcp::{SeqNumber, Segment};

use super::RETRANSMISSION_TIMEOUT;

/// One outbound segment bound to a retransmission deadline.
///
/// A timer exists for every unacknowledged segment that occupies sequence
/// space (SYN, FIN, or payload). It is armed at first transmission,
/// re-armed with an incremented attempt counter on every retransmission,
/// and dropped when the segment's last sequence position is acknowledged
/// or the connection resets.
#[derive(Debug, Clone)]
pub struct PacketTimer {
    segment: Segment,
    counter: u32,
    deadline: Option<Instant>,
}

impl PacketTimer {
    /// Wrap a segment, not yet armed.
    pub fn new(segment: Segment) -> PacketTimer {
        PacketTimer {
            segment,
            counter: 0,
            deadline: None,
        }
    }

    /// Arm the timer for one retransmission timeout from `now`, counting
    /// the transmission that goes with it.
    pub fn start(&mut self, now: Instant) {
        self.deadline = Some(now + RETRANSMISSION_TIMEOUT);
        self.counter += 1;
    }

    /// Whether the deadline has passed.
    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(deadline) if deadline <= now)
    }

    /// The armed deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// How many times the segment has been transmitted.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// The tracked segment.
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// The tracked segment, for refreshing its ACK field before a resend.
    pub fn segment_mut(&mut self) -> &mut Segment {
        &mut self.segment
    }

    /// The last sequence position the segment occupies; the timer retires
    /// once the peer acknowledges past it.
    pub fn last_seq_number(&self) -> SeqNumber {
        self.segment.last_seq_number()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wire::tcp::{Checksum, Flags, Repr};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn syn_segment() -> Segment {
        Segment {
            src_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            repr: Repr {
                src_port: 1024,
                dst_port: 80,
                flags: {
                    let mut flags = Flags::default();
                    flags.set_syn(true);
                    flags
                },
                seq_number: SeqNumber(100),
                ack_number: None,
                window_len: 8192,
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
        }
    }

    #[test]
    fn arming_counts_transmissions() {
        let t0 = Instant::now();
        let mut timer = PacketTimer::new(syn_segment());
        assert_eq!(timer.counter(), 0);
        assert!(!timer.is_due(t0 + Duration::from_secs(10)));

        timer.start(t0);
        assert_eq!(timer.counter(), 1);
        assert!(!timer.is_due(t0));
        assert!(!timer.is_due(t0 + RETRANSMISSION_TIMEOUT - Duration::from_millis(1)));
        assert!(timer.is_due(t0 + RETRANSMISSION_TIMEOUT));

        timer.start(t0 + RETRANSMISSION_TIMEOUT);
        assert_eq!(timer.counter(), 2);
        assert!(!timer.is_due(t0 + RETRANSMISSION_TIMEOUT));
    }

    #[test]
    fn syn_occupies_one_sequence_position() {
        let timer = PacketTimer::new(syn_segment());
        assert_eq!(timer.last_seq_number(), SeqNumber(100));
    }
}
