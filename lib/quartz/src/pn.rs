//! Packet-number spaces.
//!
//! Three spaces (initial, handshake, application) track packet numbers independently in each
//! direction. The 0-RTT epoch shares the application space.

use crate::buffer::BufId;
use crate::diet::Diet;
use crate::frame;
use std::collections::BTreeMap;
use std::time::Instant;

/// AEAD key / crypto-stream selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Epoch {
    Init = 0,
    ZeroRtt = 1,
    Hshk = 2,
    Data = 3,
}

impl Epoch {
    pub const ALL: [Epoch; 4] = [Epoch::Init, Epoch::ZeroRtt, Epoch::Hshk, Epoch::Data];

    #[inline]
    pub fn space(self) -> Space {
        match self {
            Epoch::Init => Space::Init,
            Epoch::Hshk => Space::Hshk,
            Epoch::ZeroRtt | Epoch::Data => Space::Data,
        }
    }

    /// The crypto stream id for this epoch. Negative ids are reserved for crypto streams.
    #[inline]
    pub fn crypto_sid(self) -> i64 {
        -(self as i64 + 1)
    }

    pub fn from_crypto_sid(sid: i64) -> Option<Epoch> {
        match sid {
            -1 => Some(Epoch::Init),
            -2 => Some(Epoch::ZeroRtt),
            -3 => Some(Epoch::Hshk),
            -4 => Some(Epoch::Data),
            _ => None,
        }
    }
}

/// Packet-number space selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Space {
    Init = 0,
    Hshk = 1,
    Data = 2,
}

impl Space {
    pub const ALL: [Space; 3] = [Space::Init, Space::Hshk, Space::Data];
}

#[derive(Default)]
pub struct PnSpace {
    /// Packet numbers whose frames were successfully processed. Drives ACK generation and
    /// duplicate detection.
    pub recv: Diet,
    /// Numbers we have already seen acknowledged by the peer.
    pub acked: Diet,
    /// Outbound packets not yet acked, lost-and-discarded, or retransmit-replaced.
    pub sent_pkts: BTreeMap<u64, BufId>,

    pub lg_sent: Option<u64>,
    pub lg_recv: Option<u64>,
    pub lg_acked: Option<u64>,
    /// When the current largest received number arrived; feeds the encoded ACK delay.
    pub lg_recv_t: Option<Instant>,

    pub ect0_cnt: u64,
    pub ect1_cnt: u64,
    pub ce_cnt: u64,

    /// Frame types received since the last ACK we sent; ACK-only packets never arm the timer.
    pub rx_frames: u64,
}

impl PnSpace {
    pub fn new() -> PnSpace {
        PnSpace::default()
    }

    /// Next outbound packet number.
    #[inline]
    pub fn next_nr(&mut self) -> u64 {
        let nr = match self.lg_sent {
            Some(n) => n + 1,
            None => 0,
        };
        self.lg_sent = Some(nr);
        nr
    }

    /// Record a successfully processed inbound packet.
    pub fn on_recv(&mut self, nr: u64, now: Instant) {
        self.recv.insert(nr);
        if self.lg_recv.map_or(true, |lg| nr > lg) {
            self.lg_recv = Some(nr);
            self.lg_recv_t = Some(now);
        }
    }

    #[inline]
    pub fn is_dup(&self, nr: u64) -> bool {
        self.recv.contains(nr)
    }

    /// Something to acknowledge?
    #[inline]
    pub fn needs_ack(&self) -> bool {
        !self.recv.is_empty() && !frame::is_ack_only(self.rx_frames) && self.rx_frames != 0
    }

    /// Reset for a version-negotiation or retry restart. Version negotiation must continue the
    /// outbound initial packet-number sequence.
    pub fn reset(&mut self, preserve_lg_sent: bool) {
        let lg_sent = self.lg_sent;
        *self = PnSpace::default();
        if preserve_lg_sent {
            self.lg_sent = lg_sent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_epoch_space_mapping() {
        assert_eq!(Epoch::Init.space(), Space::Init);
        assert_eq!(Epoch::Hshk.space(), Space::Hshk);
        assert_eq!(Epoch::ZeroRtt.space(), Space::Data);
        assert_eq!(Epoch::Data.space(), Space::Data);
    }

    #[test]
    fn test_crypto_sid_roundtrip() {
        for e in Epoch::ALL.iter() {
            assert_eq!(Epoch::from_crypto_sid(e.crypto_sid()), Some(*e));
        }
        assert_eq!(Epoch::from_crypto_sid(0), None);
        assert_eq!(Epoch::from_crypto_sid(4), None);
    }

    #[test]
    fn test_next_nr_is_strictly_increasing() {
        let mut pn = PnSpace::new();
        assert_eq!(pn.next_nr(), 0);
        assert_eq!(pn.next_nr(), 1);
        assert_eq!(pn.next_nr(), 2);
        assert_eq!(pn.lg_sent, Some(2));
    }

    #[test]
    fn test_recv_tracks_largest_and_dups() {
        let mut pn = PnSpace::new();
        let now = Instant::now();

        pn.on_recv(5, now);
        pn.on_recv(3, now);
        assert_eq!(pn.lg_recv, Some(5));
        assert!(pn.is_dup(5));
        assert!(pn.is_dup(3));
        assert!(!pn.is_dup(4));
    }

    #[test]
    fn test_reset_preserves_lg_sent_for_vneg() {
        let mut pn = PnSpace::new();
        pn.next_nr();
        pn.next_nr();
        pn.on_recv(1, Instant::now());

        pn.reset(true);
        assert_eq!(pn.lg_sent, Some(1));
        assert!(pn.recv.is_empty());

        pn.reset(false);
        assert_eq!(pn.lg_sent, None);
    }
}
