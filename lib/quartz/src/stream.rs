//! Per-stream state: send queue with transmit cursors, in-order receive queue, out-of-order
//! holding tree and flow-control counters.
//!
//! Stream ids are signed: non-negative ids are wire streams (bit 0 = server-initiated, bit 1 =
//! unidirectional), negative ids are the per-epoch crypto streams that never appear on the wire.

use crate::buffer::BufId;
use crate::pn::Epoch;
use std::collections::{BTreeMap, VecDeque};

pub const STRM_FL_SRV: i64 = 0x1;
pub const STRM_FL_UNI: i64 = 0x2;

#[inline]
pub fn is_uni(sid: i64) -> bool {
    sid & STRM_FL_UNI != 0
}

#[inline]
pub fn is_srv_ini(sid: i64) -> bool {
    sid & STRM_FL_SRV != 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StrmState {
    Idle,
    Open,
    /// Peer sent FIN; we may still send.
    HalfClosedRemote,
    /// We sent FIN; peer may still send.
    HalfClosedLocal,
    Closed,
}

pub struct Stream {
    pub id: i64,
    pub state: StrmState,

    /// In-order data ready for delivery to the application.
    pub in_q: VecDeque<BufId>,
    /// Out-of-order frames keyed by stream offset. Never overlapping, never below `in_data_off`.
    pub in_ooo: BTreeMap<u64, BufId>,

    /// Send queue. Entries before `out_una` are acked, entries before `out_nxt` transmitted.
    pub out: Vec<BufId>,
    pub out_una: usize,
    pub out_nxt: usize,

    pub in_data: u64,
    /// Contiguous bytes delivered so far; also the next expected offset.
    pub in_data_off: u64,
    pub in_data_max: u64,
    pub new_in_data_max: u64,
    pub out_data: u64,
    /// Next offset to assign to queued data.
    pub out_off: u64,
    pub out_data_max: u64,

    pub blocked: bool,
    pub tx_max_stream_data: bool,
    /// A FIN still needs to go out on an otherwise empty queue.
    pub tx_fin: bool,
    pub fin_sent: bool,
}

impl Stream {
    pub fn new(id: i64) -> Stream {
        Stream {
            id,
            state: StrmState::Open,
            in_q: VecDeque::new(),
            in_ooo: BTreeMap::new(),
            out: Vec::new(),
            out_una: 0,
            out_nxt: 0,
            in_data: 0,
            in_data_off: 0,
            in_data_max: 0,
            new_in_data_max: 0,
            out_data: 0,
            out_off: 0,
            out_data_max: 0,
            blocked: false,
            tx_max_stream_data: false,
            tx_fin: false,
            fin_sent: false,
        }
    }

    #[inline]
    pub fn is_crypto(&self) -> bool {
        self.id < 0
    }

    #[inline]
    pub fn epoch(&self) -> Option<Epoch> {
        Epoch::from_crypto_sid(self.id)
    }

    /// Everything submitted has been transmitted and acknowledged.
    #[inline]
    pub fn out_fully_acked(&self) -> bool {
        self.out_una >= self.out.len()
    }

    #[inline]
    pub fn has_data_queued(&self) -> bool {
        self.out_nxt < self.out.len()
    }

    /// Control frames owed on this stream, independent of data.
    #[inline]
    pub fn needs_ctrl(&self) -> bool {
        self.tx_max_stream_data || self.tx_fin
    }

    pub fn to_state(&mut self, state: StrmState) {
        self.state = state;
    }

    /// Peer closed its direction; fold into our local close state.
    pub fn on_fin_rcvd(&mut self) {
        let next = if self.state <= StrmState::HalfClosedRemote {
            StrmState::HalfClosedRemote
        } else {
            StrmState::Closed
        };
        self.to_state(next);
    }

    /// Reset for a version-negotiation or retry restart: offsets return to zero and every
    /// queued buffer will be retransmitted from the start.
    pub fn reset(&mut self) {
        self.in_data = 0;
        self.in_data_off = 0;
        self.out_data = 0;
        self.out_off = 0;
        self.out_una = 0;
        self.out_nxt = 0;
        self.in_q.clear();
        self.in_ooo.clear();
    }
}
