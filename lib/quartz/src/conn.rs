//! The connection: state machine, RX and TX pipelines, stream management, migration and flow
//! control. One `Conn` owns its streams, packet-number spaces, recovery state and TLS
//! collaborator; engine-wide state (indices, pool, timers) is passed in as a context.

use crate::buffer::{BufId, DATA_OFFSET};
use crate::cid::{Cid, CidKey, CidSet, LOCAL_CID_LEN};
use crate::diet::Diet;
use crate::engine::{EngineCtx, Event};
use crate::frame;
use crate::pkt::{self, TxPkt, F_LH_0RTT, F_LH_HSHK, F_LH_INIT, F_SH, F_SH_KYPH, MAX_PKT_LEN, MIN_INI_LEN, MIN_PLAIN_LEN};
use crate::pn::{Epoch, PnSpace, Space};
use crate::recovery::{Recovery, K_REORDERING_THRESHOLD};
use crate::result::{QuicError, QuicResult, ERR_PROTOCOL_VIOLATION};
use crate::stream::{is_srv_ini, is_uni, StrmState, Stream, STRM_FL_SRV, STRM_FL_UNI};
use crate::timer::{ConnId, TimerKind};
use crate::tls::{Handshake, KeySet};
use crate::tp::{TransportParams, INIT_MAX_BIDI_STREAMS, INIT_MAX_UNI_STREAMS, INIT_STRM_DATA_BIDI, INIT_STRM_DATA_UNI, K_DELAYED_ACK_MSECS, K_MIGRATION_LOCKOUT_SECS};
use hashbrown::HashMap;
use lumen::crypto;
use lumen::logging::{self, Logger};
use lumen::time;
use std::net::SocketAddr;
use std::sync::mpsc::Sender;
use std::time::Duration;

/// QUIC versions supported, in order of preference.
pub const OK_VERS: [u32; 1] = [0xff00_0004];

/// Validity window of retry and new-session tokens.
pub const TOK_LIFETIME_SECS: u64 = 600;

#[inline]
pub fn vers_supported(vers: u32) -> bool {
    !is_rsvd_vers(vers) && OK_VERS.contains(&vers)
}

/// Reserved version patterns force negotiation and must never be selected.
#[inline]
pub fn is_rsvd_vers(vers: u32) -> bool {
    vers & 0x0f0f_0f0f == 0x0a0a_0a0a
}

/// Maximum usable stream payload per pool buffer, leaving room for headers, frame headers and
/// the AEAD tag within one packet.
pub const MAX_STRM_DATA_PER_BUF: usize = MAX_PKT_LEN - DATA_OFFSET;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Opng,
    Estb,
    ClsgQueued,
    Clsg,
    Drng,
    Clsd,
}

/// Replies posted back to blocked API calls.
#[derive(Debug)]
pub enum ApiReply {
    Connected(Option<ConnId>),
    Bound(usize),
    Accepted(ConnId),
    Stream(QuicResult<i64>),
    WriteDone(u16),
    ReadReady(i64, Vec<Vec<u8>>),
    Closed(u16),
}

/// Pending API calls waiting for a connection event.
#[derive(Default)]
pub struct ApiWaiters {
    pub connect: Option<Sender<ApiReply>>,
    pub read: Option<Sender<ApiReply>>,
    pub write: Option<(i64, Sender<ApiReply>)>,
    pub rsv_stream: Option<(bool, Sender<ApiReply>)>,
    pub close: Option<Sender<ApiReply>>,
}

pub struct Conn {
    pub id: ConnId,
    pub is_clnt: bool,
    pub state: ConnState,
    pub vers: u32,
    pub vers_initial: u32,

    pub scids: CidSet,
    pub dcids: CidSet,
    pub act_scid_seq: u64,
    pub act_dcid_seq: u64,
    pub odcid: Cid,
    pub max_cid_seq_out: u64,
    pub max_cid_seq_in: u64,

    /// All streams, crypto streams included (negative ids).
    pub streams: HashMap<i64, Stream>,
    pub closed_streams: Diet,
    pub next_sid_bidi: i64,
    pub next_sid_uni: i64,
    pub lg_sid_bidi: i64,
    pub lg_sid_uni: i64,

    /// Indexed by `Space as usize`.
    pub pn: [PnSpace; 3],
    pub rec: Recovery,
    pub tls: Box<dyn Handshake>,
    pub init_keys: Option<KeySet>,
    pub epoch_in: Epoch,
    pub epoch_out: Epoch,
    pub key_phase: bool,

    pub tp_in: TransportParams,
    pub tp_out: TransportParams,
    pub in_data: u64,
    pub out_data: u64,

    pub peer: SocketAddr,
    pub sport: u16,
    pub sock: usize,

    pub err_code: u16,
    pub err_frm: u8,
    pub err_reason: String,

    pub needs_tx: bool,
    pub had_rx: bool,
    pub have_new_data: bool,
    pub tx_ncid: bool,
    pub tx_retire_cid: bool,
    pub tx_max_data: bool,
    pub tx_max_sid_bidi: bool,
    pub tx_max_sid_uni: bool,
    pub sid_blocked_bidi: bool,
    pub sid_blocked_uni: bool,
    pub tx_path_chlg: bool,
    pub tx_path_resp: bool,
    pub do_migration: bool,
    pub do_key_flip: bool,
    pub blocked: bool,
    pub try_0rtt: bool,
    pub did_0rtt: bool,
    pub holds_sock: bool,
    pub in_c_ready: bool,
    pub tx_rtry: bool,
    pub tx_new_tok: bool,

    /// Retry token to echo in subsequent INITIALs (client) or mint (server).
    pub tok: Vec<u8>,
    pub new_tok: Vec<u8>,

    pub path_chlg_in: u64,
    pub path_chlg_out: u64,
    pub path_resp_in: u64,
    pub path_resp_out: u64,

    /// Per-space request to emit an ACK immediately, out of timer cadence.
    pub ack_now: [bool; 3],

    pub txq: Vec<TxPkt>,
    pub out_dgrams: Vec<(SocketAddr, Vec<u8>)>,

    pub api: ApiWaiters,
    pub log: Logger,
}

impl Conn {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ConnId,
        is_clnt: bool,
        vers: u32,
        dcid: Option<Cid>,
        scid: Option<Cid>,
        peer: SocketAddr,
        sport: u16,
        sock: usize,
        tls: Box<dyn Handshake>,
        tp_local: TransportParams,
        log: &Logger,
    ) -> Conn {
        let mut c = Conn {
            id,
            is_clnt,
            state: ConnState::Idle,
            vers,
            vers_initial: vers,
            scids: CidSet::new(),
            dcids: CidSet::new(),
            act_scid_seq: 0,
            act_dcid_seq: 0,
            odcid: Cid::empty(),
            max_cid_seq_out: 0,
            max_cid_seq_in: 0,
            streams: HashMap::new(),
            closed_streams: Diet::new(),
            next_sid_bidi: if is_clnt { 0 } else { STRM_FL_SRV },
            next_sid_uni: if is_clnt { STRM_FL_UNI } else { STRM_FL_UNI | STRM_FL_SRV },
            lg_sid_bidi: 0,
            lg_sid_uni: 0,
            pn: [PnSpace::new(), PnSpace::new(), PnSpace::new()],
            rec: Recovery::new(),
            tls,
            init_keys: None,
            epoch_in: Epoch::Init,
            epoch_out: Epoch::Init,
            key_phase: false,
            tp_in: tp_local,
            tp_out: TransportParams::unknown_peer(),
            in_data: 0,
            out_data: 0,
            peer,
            sport,
            sock,
            err_code: 0,
            err_frm: 0,
            err_reason: String::new(),
            needs_tx: false,
            had_rx: false,
            have_new_data: false,
            tx_ncid: false,
            tx_retire_cid: false,
            tx_max_data: false,
            tx_max_sid_bidi: false,
            tx_max_sid_uni: false,
            sid_blocked_bidi: false,
            sid_blocked_uni: false,
            tx_path_chlg: false,
            tx_path_resp: false,
            do_migration: true,
            do_key_flip: true,
            blocked: false,
            try_0rtt: false,
            did_0rtt: false,
            holds_sock: false,
            in_c_ready: false,
            tx_rtry: false,
            tx_new_tok: false,
            tok: Vec::new(),
            new_tok: Vec::new(),
            path_chlg_in: 0,
            path_chlg_out: 0,
            path_resp_in: 0,
            path_resp_out: 0,
            ack_now: [false; 3],
            txq: Vec::new(),
            out_dgrams: Vec::new(),
            api: ApiWaiters::default(),
            log: log.new(logging::o!("conn" => id)),
        };

        // initial dcid: clients invent a random one, servers adopt the client's scid
        if is_clnt {
            let ndcid = Cid::random(LOCAL_CID_LEN, 0);
            c.odcid = ndcid;
            c.dcids.insert(ndcid);
            c.init_keys = Some(crate::tls::initial_keys(&ndcid, true));
        } else if let Some(d) = dcid {
            c.dcids.insert(d);
        }

        // initial scid: clients invent one; servers start out under the client-chosen dcid
        let nscid = if is_clnt {
            Some(Cid::random(LOCAL_CID_LEN, 0))
        } else {
            scid
        };
        if let Some(s) = nscid {
            c.scids.insert(s);
        }

        for epoch in &Epoch::ALL {
            c.streams.insert(epoch.crypto_sid(), Stream::new(epoch.crypto_sid()));
        }

        c
    }

    #[inline]
    pub fn conn_type(&self) -> &'static str {
        if self.is_clnt {
            "clnt"
        } else {
            "serv"
        }
    }

    #[inline]
    pub fn scid(&self) -> &Cid {
        self.scids.get(self.act_scid_seq).expect("active scid present")
    }

    #[inline]
    pub fn dcid(&self) -> &Cid {
        self.dcids.get(self.act_dcid_seq).expect("active dcid present")
    }

    pub fn keys_for_epoch(&self, epoch: Epoch) -> Option<&KeySet> {
        match epoch {
            Epoch::Init => self.init_keys.as_ref(),
            _ => self.tls.keys(epoch),
        }
    }

    /// A control frame is owed at connection scope.
    pub fn needs_ctrl(&self) -> bool {
        self.tx_ncid
            || self.tx_retire_cid
            || self.tx_max_data
            || self.tx_max_sid_bidi
            || self.tx_max_sid_uni
            || self.sid_blocked_bidi
            || self.sid_blocked_uni
            || self.tx_path_chlg
            || self.tx_path_resp
            || self.tx_new_tok
            || self.blocked
    }

    pub fn to_state(&mut self, state: ConnState) {
        if self.state != state {
            logging::debug!(self.log, "conn state";
                            "context" => "state",
                            "role" => self.conn_type(),
                            "from" => ?self.state,
                            "to" => ?state);
            self.state = state;
        }
    }
}

// stream management
impl Conn {
    /// Highest stream id the relevant limit currently allows for `sid`'s class.
    pub fn max_sid(&self, sid: i64) -> i64 {
        let max = if is_srv_ini(sid) != self.is_clnt {
            // local class: peer's advertised limit
            if is_uni(sid) {
                self.tp_out.max_uni_streams
            } else {
                self.tp_out.max_bidi_streams
            }
        } else if is_uni(sid) {
            self.tp_in.max_uni_streams
        } else {
            self.tp_in.max_bidi_streams
        };

        if max == 0 {
            0
        } else {
            ((max - 1) << 2) | ((STRM_FL_SRV | STRM_FL_UNI) & sid)
        }
    }

    pub fn get_stream(&mut self, sid: i64) -> Option<&mut Stream> {
        self.streams.get_mut(&sid)
    }

    pub fn new_stream(&mut self, sid: i64) -> &mut Stream {
        debug_assert!(sid >= 0);
        let mut s = Stream::new(sid);

        // apply both directions' data limits
        s.in_data_max = if is_uni(sid) {
            self.tp_in.max_strm_data_uni
        } else if is_srv_ini(sid) == self.is_clnt {
            self.tp_in.max_strm_data_bidi_remote
        } else {
            self.tp_in.max_strm_data_bidi_local
        };
        s.out_data_max = if is_uni(sid) {
            self.tp_out.max_strm_data_uni
        } else if is_srv_ini(sid) == self.is_clnt {
            self.tp_out.max_strm_data_bidi_remote
        } else {
            self.tp_out.max_strm_data_bidi_local
        };
        s.blocked = (s.out_data_max as usize) < MAX_PKT_LEN;

        if is_uni(sid) {
            self.lg_sid_uni = self.lg_sid_uni.max(sid);
        } else {
            self.lg_sid_bidi = self.lg_sid_bidi.max(sid);
        }

        if is_srv_ini(sid) != self.is_clnt {
            // local stream, advance the allocator
            if is_uni(sid) {
                self.next_sid_uni += 4;
            } else {
                self.next_sid_bidi += 4;
            }
        }

        self.do_stream_id_fc(sid);
        self.streams.insert(sid, s);
        self.streams.get_mut(&sid).unwrap()
    }

    pub fn free_stream(&mut self, ctx: &mut EngineCtx, sid: i64) {
        if let Some(s) = self.streams.remove(&sid) {
            logging::debug!(self.log, "freeing stream"; "context" => "stream", "sid" => sid);
            for v in s.in_q.iter().chain(s.in_ooo.values()).chain(s.out.iter()) {
                ctx.pool.free(*v);
            }
            if sid >= 0 {
                self.closed_streams.insert(sid as u64);
            }
        }
    }

    pub fn track_bytes_in(&mut self, sid: i64, n: u64) {
        if sid >= 0 {
            // crypto streams don't count toward connection flow control
            self.in_data += n;
        }
        if let Some(s) = self.streams.get_mut(&sid) {
            s.in_data += n;
        }
    }

    pub fn track_bytes_out(&mut self, sid: i64, n: u64) {
        if sid >= 0 {
            self.out_data += n;
        }
        if let Some(s) = self.streams.get_mut(&sid) {
            s.out_data += n;
        }
    }

    /// Raise the advertised stream window when it runs low.
    pub fn do_stream_fc(&mut self, sid: i64) {
        if self.state != ConnState::Estb || sid < 0 {
            return;
        }

        let inc = if is_uni(sid) {
            INIT_STRM_DATA_UNI
        } else {
            INIT_STRM_DATA_BIDI
        };

        let s = match self.streams.get_mut(&sid) {
            Some(s) => s,
            None => return,
        };
        if s.in_data + 2 * MAX_PKT_LEN as u64 + inc > s.in_data_max {
            s.new_in_data_max = s.in_data_max + 2 * inc;
            s.tx_max_stream_data = true;
            self.needs_tx = true;
        }
    }

    /// Raise the advertised connection window when it runs low.
    pub fn do_conn_fc(&mut self) {
        if self.state == ConnState::Clsg || self.state == ConnState::Drng {
            return;
        }

        let inc = INIT_MAX_BIDI_STREAMS as u64 * INIT_STRM_DATA_BIDI;
        if self.in_data + 2 * MAX_PKT_LEN as u64 + inc > self.tp_in.max_data {
            self.tp_in.new_max_data = self.tp_in.max_data + 2 * inc;
            self.tx_max_data = true;
            self.needs_tx = true;
        }
    }

    /// Stream-id flow control: extend the peer's window when it nears the limit, or latch our
    /// own blocked state when we near the peer's.
    pub fn do_stream_id_fc(&mut self, sid: i64) {
        if is_srv_ini(sid) == self.is_clnt {
            // remote class
            if is_uni(sid) {
                if (sid >> 2) + 1 == self.tp_in.max_uni_streams {
                    self.tp_in.new_max_uni_streams = self.tp_in.max_uni_streams + INIT_MAX_UNI_STREAMS;
                    self.tx_max_sid_uni = true;
                }
            } else if (sid >> 2) + 1 == self.tp_in.max_bidi_streams {
                self.tp_in.new_max_bidi_streams = self.tp_in.max_bidi_streams + INIT_MAX_BIDI_STREAMS;
                self.tx_max_sid_bidi = true;
            }
        } else if is_uni(sid) {
            if (sid >> 2) + 1 == self.tp_out.max_uni_streams {
                self.sid_blocked_uni = true;
            }
        } else if (sid >> 2) + 1 == self.tp_out.max_bidi_streams {
            self.sid_blocked_bidi = true;
        }
    }

    /// Allocate a local stream of the requested direction, or record the blockage.
    pub fn rsv_stream(&mut self, bidi: bool) -> QuicResult<i64> {
        let sid = if bidi {
            self.next_sid_bidi
        } else {
            self.next_sid_uni
        };

        if sid > self.max_sid(sid) {
            if bidi {
                self.sid_blocked_bidi = true;
            } else {
                self.sid_blocked_uni = true;
            }
            self.needs_tx = true;
            return Err(QuicError::Need);
        }

        self.new_stream(sid);
        Ok(sid)
    }

    /// Hand the lowest ready stream's in-order data to the application, freeing the buffers.
    pub fn take_ready_data(&mut self, ctx: &mut EngineCtx) -> Option<(i64, Vec<Vec<u8>>)> {
        let mut sids: Vec<i64> = self.streams.keys().filter(|sid| **sid >= 0).copied().collect();
        sids.sort_unstable();

        for sid in sids {
            let bufs: Vec<BufId> = {
                let s = self.streams.get_mut(&sid).unwrap();
                if s.in_q.is_empty() {
                    continue;
                }
                s.in_q.drain(..).collect()
            };

            let mut data = Vec::with_capacity(bufs.len());
            for v in bufs {
                let (start, len) = {
                    let m = ctx.pool.meta(v);
                    (m.stream_data_start, m.stream_data_len)
                };
                data.push(ctx.pool.raw(v)[start..start + len].to_vec());
                ctx.pool.free(v);
            }
            return Some((sid, data));
        }

        self.have_new_data = false;
        None
    }

    /// Close a stream locally: a FIN goes out with the last queued data, or alone.
    pub fn close_stream(&mut self, sid: i64) {
        if let Some(s) = self.streams.get_mut(&sid) {
            let next = if s.state == StrmState::HalfClosedRemote {
                StrmState::Closed
            } else {
                StrmState::HalfClosedLocal
            };
            s.to_state(next);
            if !s.has_data_queued() {
                s.tx_fin = true;
            }
            self.needs_tx = true;
        }
    }
}

// state machine
impl Conn {
    /// Record an error and start closing. Only the first error wins.
    pub fn err_close<R: Into<String>>(&mut self, ctx: &mut EngineCtx, code: u16, frm: u8, reason: R) {
        if self.err_code != 0 {
            logging::warn!(self.log, "ignoring new err, first error wins";
                           "context" => "close",
                           "new_code" => code,
                           "code" => self.err_code,
                           "reason" => &self.err_reason);
            return;
        }

        let reason = reason.into();
        logging::error!(self.log, "connection error";
                        "context" => "close",
                        "code" => code,
                        "frame" => frm,
                        "reason" => &reason);

        self.err_code = code;
        self.err_frm = frm;
        self.err_reason = reason;
        self.enter_closing(ctx);
    }

    /// Transition into the closing/draining machinery.
    pub fn enter_closing(&mut self, ctx: &mut EngineCtx) {
        if self.state == ConnState::Clsg {
            return;
        }

        ctx.timers.cancel(TimerKind::LossDetection(self.id));
        ctx.timers.cancel(TimerKind::Idle(self.id));

        // flush ACKs still owed, except for 0-RTT and the current outgoing epoch (the CLOSE
        // packet will carry that one)
        for epoch in &Epoch::ALL {
            if *epoch == Epoch::ZeroRtt {
                continue;
            }
            let space = epoch.space();
            if self.state != ConnState::Drng
                && *epoch != self.epoch_out
                && ctx.timers.is_armed(TimerKind::Ack(self.id, space))
            {
                self.tx_ack(ctx, *epoch);
            }
            ctx.timers.cancel(TimerKind::Ack(self.id, space));
        }

        if (self.state == ConnState::Idle || self.state == ConnState::Opng) && self.err_code == 0 {
            // no need to go closing -> draining
            ctx.timers.set(TimerKind::Closing(self.id), ctx.now);
            return;
        }

        if !ctx.timers.is_armed(TimerKind::Closing(self.id)) {
            let dur = self.rec.drain_period();
            logging::debug!(self.log, "closing/draining alarm armed";
                            "context" => "close",
                            "dur" => ?dur);
            ctx.timers.set(TimerKind::Closing(self.id), ctx.now + dur);
        }

        if self.state != ConnState::Drng {
            self.needs_tx = true;
            self.to_state(ConnState::Clsg);
        }
    }

    /// The draining timer fired; wake all blocked API calls with the stored error.
    pub fn enter_closed(&mut self) {
        self.to_state(ConnState::Clsd);

        let err = self.err_code;
        if let Some(tx) = self.api.connect.take() {
            let _ = tx.send(ApiReply::Connected(None));
        }
        if let Some(tx) = self.api.read.take() {
            let _ = tx.send(ApiReply::Closed(err));
        }
        if let Some((_, tx)) = self.api.write.take() {
            let _ = tx.send(ApiReply::Closed(err));
        }
        if let Some((_, tx)) = self.api.rsv_stream.take() {
            let _ = tx.send(ApiReply::Closed(err));
        }
        if let Some(tx) = self.api.close.take() {
            let _ = tx.send(ApiReply::Closed(err));
        }
    }

    /// The idle timer fired.
    pub fn idle_alarm(&mut self, ctx: &mut EngineCtx) {
        logging::debug!(self.log, "idle timeout"; "context" => "timer");
        self.to_state(ConnState::Drng);
        self.enter_closing(ctx);
    }

    /// Restart after a version-negotiation or retry response.
    pub fn vneg_or_rtry_resp(&mut self, ctx: &mut EngineCtx, is_vneg: bool) {
        self.rec.init_rec();
        self.in_data = 0;
        self.out_data = 0;

        let sids: Vec<i64> = self.streams.keys().copied().collect();
        for sid in sids {
            let keep_data = sid >= 0
                || (self.try_0rtt
                    && (sid == Epoch::ZeroRtt.crypto_sid() || sid == Epoch::Data.crypto_sid()));
            let s = self.streams.get_mut(&sid).unwrap();
            let out: Vec<BufId> = s.out.drain(..).collect();
            let in_q: Vec<BufId> = s.in_q.drain(..).collect();
            let ooo: Vec<BufId> = s.in_ooo.values().copied().collect();
            s.in_ooo.clear();
            s.reset();

            for v in in_q.into_iter().chain(ooo) {
                ctx.pool.free(v);
            }
            if keep_data {
                // the queued payloads survive and will be retransmitted from offset zero;
                // their relative offsets are unchanged
                let mut total = 0u64;
                for v in out.iter() {
                    let m = ctx.pool.meta_mut(*v);
                    m.tx_len = 0;
                    m.is_acked = false;
                    m.is_lost = false;
                    m.is_rtx = false;
                    m.tx_t = None;
                    total += m.stream_data_len as u64;
                    if let Some(pair) = m.rtx.take() {
                        ctx.pool.meta_mut(pair).rtx = None;
                    }
                }
                let s = self.streams.get_mut(&sid).unwrap();
                s.out = out;
                s.out_off = total;
            } else {
                for v in out {
                    ctx.pool.free(v);
                }
            }
        }

        // drop sent-packet bookkeeping; stream queues own their buffers, the rest is freed
        for space in &Space::ALL {
            let sent: Vec<(u64, BufId)> = self.pn[*space as usize].sent_pkts.iter().map(|(n, v)| (*n, *v)).collect();
            for (_, v) in sent {
                if ctx.pool.meta(v).stream.is_none() || ctx.pool.meta(v).is_rtx {
                    ctx.pool.free(v);
                }
            }
            let preserve = is_vneg && *space == Space::Init;
            self.pn[*space as usize].reset(preserve);
        }

        self.tls.reset();
        self.epoch_in = Epoch::Init;
        self.epoch_out = Epoch::Init;

        if self.is_clnt {
            let flight = self.tls.initiate();
            self.enqueue_tls_output(ctx, flight);
        }
        self.needs_tx = true;
    }
}

// cid management
impl Conn {
    /// Replace the active source cid in place, keeping its sequence number. Used by the server
    /// to move off the client-chosen initial cid.
    pub fn update_act_scid(&mut self, ctx: &mut EngineCtx, ncid: Cid) {
        let old = *self.scid();
        logging::debug!(self.log, "handshake switch of scid";
                        "context" => "cid",
                        "new" => %ncid,
                        "old" => %old);

        ctx.conns_by_id.remove(&CidKey::from(&old));
        self.scids.remove(old.seq);

        let mut ncid = ncid;
        ncid.seq = old.seq;
        self.scids.insert(ncid);
        ctx.conns_by_id.insert(CidKey::from(&ncid), self.id);
    }

    /// Register an additional source cid and index it globally.
    pub fn add_scid(&mut self, ctx: &mut EngineCtx, cid: Cid) -> bool {
        if !self.scids.insert(cid) {
            return false;
        }
        ctx.conns_by_id.insert(CidKey::from(&cid), self.id);
        true
    }

    /// Adopt a destination cid learned during the handshake: same sequence number, new bytes.
    pub fn adopt_dcid(&mut self, cid: &Cid) {
        let seq = self.act_dcid_seq;
        if let Some(d) = self.dcids.get_mut(seq) {
            logging::debug!(self.log, "handshake switch of dcid";
                            "context" => "cid",
                            "new" => %cid,
                            "old" => %d);
            let mut ncid = *cid;
            ncid.seq = seq;
            self.dcids.remove(seq);
            self.dcids.insert(ncid);
        }
    }

    /// Accept an inbound packet addressed to a non-active source cid; only strictly newer cids
    /// may become active.
    pub fn switch_scid(&mut self, id: &Cid) -> bool {
        let scid = match self.scids.get_by_id(id) {
            Some(scid) => *scid,
            None => return false,
        };
        if scid.seq <= self.act_scid_seq {
            return false;
        }

        logging::info!(self.log, "migration to new scid";
                       "context" => "cid",
                       "scid" => %scid);
        self.act_scid_seq = scid.seq;
        true
    }

    /// Migrate to the next higher-sequence destination cid; the old one gets retired.
    pub fn use_next_dcid(&mut self) {
        let next_seq = match self.dcids.next_after(self.act_dcid_seq) {
            Some(d) => d.seq,
            None => return,
        };

        if let Some(old) = self.dcids.get_mut(self.act_dcid_seq) {
            old.retired = true;
        }
        logging::info!(self.log, "migration to new dcid";
                       "context" => "cid",
                       "seq" => next_seq);
        self.tx_retire_cid = true;
        self.act_dcid_seq = next_seq;
    }
}

// RX pipeline
impl Conn {
    /// Process one decrypted packet according to the connection state machine, then run the
    /// frame codec. Returns the (possibly replaced) payload buffer when the packet was
    /// processed, or None when it was dropped.
    pub fn rx_pkt(&mut self, ctx: &mut EngineCtx, v: BufId, raw: &[u8]) -> Option<BufId> {
        let hdr = ctx.pool.meta(v).hdr.clone();
        let space = pkt::epoch_for_pkt_type(hdr.ptype).space();
        let mut ok = false;
        let mut v = v;

        match self.state {
            ConnState::Idle => {
                self.vers = hdr.vers;

                if self.tx_rtry {
                    if hdr.ptype == F_LH_INIT && !hdr.tok.is_empty() {
                        if !self.verify_rtry_tok(&hdr) {
                            logging::error!(self.log, "retry token verification failed";
                                            "context" => "rx");
                            self.enter_closing(ctx);
                            ctx.pool.free(v);
                            return None;
                        }
                        self.tx_rtry = false;
                    } else {
                        logging::info!(self.log, "sending retry"; "context" => "rx");
                        self.make_rtry_tok();
                        self.needs_tx = true;
                        ctx.pool.free(v);
                        return None;
                    }
                }

                match frame::dec_frames(self, ctx, v) {
                    Ok(nv) => v = nv,
                    Err(e) => {
                        self.fold_close(ctx, e);
                        return None;
                    }
                }

                if !frame::has_frame(ctx.pool.meta(v).frames, frame::FRAM_TYPE_CRPT) {
                    logging::error!(self.log, "initial pkt w/o crypto frames"; "context" => "rx");
                    self.enter_closing(ctx);
                    if ctx.pool.meta(v).stream.is_none() {
                        ctx.pool.free(v);
                    }
                    return None;
                }

                self.to_state(ConnState::Opng);

                // this is a new server connection; pick a fresh random scid
                let nscid = Cid::random(LOCAL_CID_LEN, 0);
                self.update_act_scid(ctx, nscid);
                ok = true;
            }

            ConnState::Opng => {
                if hdr.is_vneg() {
                    if self.vers != self.vers_initial {
                        // we already reacted to an earlier vneg packet
                        logging::info!(self.log, "ignoring spurious vneg response"; "context" => "rx");
                        ctx.pool.free(v);
                        return None;
                    }
                    let vers = pkt::dec_vneg_vers(raw, &hdr);
                    let try_vers = self.pick_from_server_vers(&vers);
                    if try_vers == 0 {
                        logging::info!(self.log, "no vers in common with serv"; "context" => "rx");
                        self.enter_closing(ctx);
                        ctx.pool.free(v);
                        return None;
                    }
                    self.vneg_or_rtry_resp(ctx, true);
                    self.vers = try_vers;
                    logging::info!(self.log, "retrying with new version";
                                   "context" => "rx",
                                   "initial_vers" => self.vers_initial,
                                   "vers" => self.vers);
                    ctx.pool.free(v);
                    return None;
                }

                if hdr.vers != self.vers {
                    self.err_close(
                        ctx,
                        ERR_PROTOCOL_VIOLATION,
                        0,
                        format!("wrong vers 0x{:08x} in SH", hdr.vers),
                    );
                    ctx.pool.free(v);
                    return None;
                }

                if hdr.ptype == pkt::F_LH_RTRY {
                    if !self.tok.is_empty() {
                        self.err_close(ctx, ERR_PROTOCOL_VIOLATION, 0, "rx 2nd retry");
                        ctx.pool.free(v);
                        return None;
                    }
                    self.vneg_or_rtry_resp(ctx, false);
                    self.tok = hdr.tok.clone();
                    logging::info!(self.log, "handling serv stateless retry"; "context" => "rx");
                    ctx.pool.free(v);
                    return None;
                }

                match frame::dec_frames(self, ctx, v) {
                    Ok(nv) => {
                        v = nv;
                        ok = true;
                    }
                    Err(e) => {
                        self.fold_close(ctx, e);
                        return None;
                    }
                }
            }

            ConnState::Estb | ConnState::ClsgQueued | ConnState::Clsg | ConnState::Drng => {
                if hdr.is_vneg() {
                    logging::info!(self.log, "ignoring spurious vneg response"; "context" => "rx");
                    ctx.pool.free(v);
                    return None;
                }
                if !self.did_0rtt && hdr.ptype == F_LH_0RTT {
                    logging::info!(self.log, "ignoring 0-RTT pkt"; "context" => "rx");
                    ctx.pool.free(v);
                    return None;
                }
                match frame::dec_frames(self, ctx, v) {
                    Ok(nv) => {
                        v = nv;
                        ok = true;
                    }
                    Err(e) => {
                        self.fold_close(ctx, e);
                        return None;
                    }
                }
            }

            ConnState::Clsd => {
                logging::info!(self.log, "ignoring pkt for closed conn"; "context" => "rx");
            }
        }

        // arm the delayed-ACK timer unless the packet was ACK-only
        let frames = ctx.pool.meta(v).frames;
        if self.state != ConnState::Drng
            && self.state != ConnState::Clsd
            && !self.tx_rtry
            && !frame::is_ack_only(frames)
            && !ctx.timers.is_armed(TimerKind::Ack(self.id, space))
        {
            ctx.timers.set(
                TimerKind::Ack(self.id, space),
                ctx.now + Duration::from_millis(K_DELAYED_ACK_MSECS),
            );
        }

        if ok {
            self.rx_crypto(ctx);
            Some(v)
        } else {
            ctx.pool.free(v);
            None
        }
    }

    /// Drain reassembled crypto-stream bytes into the TLS collaborator and act on handshake
    /// progress.
    pub fn rx_crypto(&mut self, ctx: &mut EngineCtx) {
        for epoch in &Epoch::ALL {
            loop {
                let sid = epoch.crypto_sid();
                let v = match self.streams.get_mut(&sid).and_then(|s| s.in_q.pop_front()) {
                    Some(v) => v,
                    None => break,
                };

                let m = ctx.pool.meta(v);
                let (start, len) = (m.stream_data_start, m.stream_data_len);
                let bytes = ctx.pool.raw(v)[start..start + len].to_vec();
                ctx.pool.free(v);

                let out = match self.tls.io(*epoch, &bytes) {
                    Ok(out) => out,
                    Err(alert) => {
                        self.err_close(
                            ctx,
                            crate::result::err_tls(alert),
                            0,
                            format!("tls alert {}", alert),
                        );
                        return;
                    }
                };
                self.enqueue_tls_output(ctx, out);

                if self.tls.is_complete()
                    && (self.state == ConnState::Idle || self.state == ConnState::Opng)
                {
                    self.to_state(ConnState::Estb);
                    self.epoch_in = Epoch::Data;
                    self.epoch_out = Epoch::Data;
                    self.did_0rtt = self.try_0rtt && self.tls.zero_rtt_accepted();

                    // adopt the peer's transport parameters and re-apply stream limits
                    if let Some(tp) = self.tls.peer_params() {
                        self.tp_out = tp;
                        let mtu = MAX_PKT_LEN as u64;
                        for (sid, s) in self.streams.iter_mut() {
                            if *sid < 0 {
                                continue;
                            }
                            s.out_data_max = if is_uni(*sid) {
                                self.tp_out.max_strm_data_uni
                            } else if is_srv_ini(*sid) == self.is_clnt {
                                self.tp_out.max_strm_data_bidi_remote
                            } else {
                                self.tp_out.max_strm_data_bidi_local
                            };
                            s.blocked = s.out_data_max < mtu;
                        }
                    }

                    if self.is_clnt {
                        if let Some(tx) = self.api.connect.take() {
                            let _ = tx.send(ApiReply::Connected(Some(self.id)));
                        }
                    } else {
                        self.make_new_tok();
                        self.tx_new_tok = true;
                        self.needs_tx = true;
                        ctx.events.push(Event::Established(self.id));
                    }
                }
            }
        }
    }

    /// Queue crypto bytes the TLS collaborator wants on the wire.
    pub fn enqueue_tls_output(&mut self, ctx: &mut EngineCtx, out: crate::tls::TlsOutput) {
        for (epoch, bytes) in out.emit {
            self.enqueue_stream_data(ctx, epoch.crypto_sid(), &bytes);
            if epoch > self.epoch_out && self.state != ConnState::Estb {
                self.epoch_out = epoch;
            }
        }
    }

    /// Chunk payload bytes into pool buffers appended to the stream's send queue. Offsets are
    /// assigned in queue order.
    pub fn enqueue_stream_data(&mut self, ctx: &mut EngineCtx, sid: i64, data: &[u8]) {
        let mut off = match self.streams.get(&sid) {
            Some(s) => s.out_off,
            None => return,
        };

        let mut queued = Vec::new();
        for chunk in data.chunks(MAX_STRM_DATA_PER_BUF) {
            let v = match ctx.pool.alloc(DATA_OFFSET) {
                Some(v) => v,
                None => {
                    logging::warn!(self.log, "pool exhausted, dropping stream data";
                                   "context" => "tx",
                                   "sid" => sid);
                    break;
                }
            };
            ctx.pool.fill(v, chunk);
            let m = ctx.pool.meta_mut(v);
            m.stream = Some(sid);
            m.stream_off = off;
            m.stream_data_start = DATA_OFFSET;
            m.stream_data_len = chunk.len();
            off += chunk.len() as u64;
            queued.push(v);
        }

        if let Some(s) = self.streams.get_mut(&sid) {
            s.out_off = off;
            s.out.extend(queued);
        }
        self.needs_tx = true;
    }

    fn pick_from_server_vers(&self, offered: &[u32]) -> u32 {
        for ours in &OK_VERS {
            if is_rsvd_vers(*ours) {
                continue;
            }
            for theirs in offered {
                if is_rsvd_vers(*theirs) {
                    continue;
                }
                if ours == theirs {
                    return *theirs;
                }
            }
        }
        0
    }

    fn fold_close(&mut self, ctx: &mut EngineCtx, e: QuicError) {
        if let QuicError::Close { code, frame, reason } = e {
            self.err_close(ctx, code, frame, reason);
        }
    }

    /// Mint a retry/new-session token: an AEAD seal over the peer address and an expiry
    /// timestamp, under a key folded from the active scid's stateless reset token.
    pub fn make_rtry_tok(&mut self) {
        let addr = format!("{}", self.peer);
        let expires = time::unix_secs() + TOK_LIFETIME_SECS;

        let mut plain = addr.into_bytes();
        plain.extend_from_slice(&expires.to_be_bytes());

        let mut sealed = vec![0u8; plain.len() + crypto::TAG_LEN];
        crypto::seal(&mut sealed, &plain, &[], 0, 0, &self.tok_key());
        self.tok = sealed;
    }

    fn tok_key(&self) -> [u8; crypto::KEY_LEN] {
        let srt = self.scid().srt;
        let mut key = [0u8; crypto::KEY_LEN];
        key[..srt.len()].copy_from_slice(&srt);
        key
    }

    fn verify_rtry_tok(&self, hdr: &pkt::Hdr) -> bool {
        let addr = format!("{}", self.peer);
        if hdr.tok.len() != addr.len() + 8 + crypto::TAG_LEN {
            return false;
        }

        let mut plain = vec![0u8; hdr.tok.len() - crypto::TAG_LEN];
        if !crypto::open(&mut plain, &hdr.tok, &[], 0, 0, &self.tok_key()) {
            return false;
        }

        let (tok_addr, tok_exp) = plain.split_at(plain.len() - 8);
        let mut exp = [0u8; 8];
        exp.copy_from_slice(tok_exp);
        tok_addr == addr.as_bytes() && u64::from_be_bytes(exp) >= time::unix_secs()
    }

    fn make_new_tok(&mut self) {
        self.make_rtry_tok();
        self.new_tok = self.tok.clone();
        self.tok.clear();
    }
}

// ACK ingest support, called from the frame codec
impl Conn {
    /// A packet number was newly acknowledged. Updates bookkeeping, frees buffers that belong
    /// to no stream and completes a blocked write when its stream drains.
    pub fn on_pkt_acked(&mut self, ctx: &mut EngineCtx, space: Space, nr: u64, v: BufId) {
        self.pn[space as usize].sent_pkts.remove(&nr);
        self.pn[space as usize].acked.insert(nr);
        if self.pn[space as usize].lg_acked.map_or(true, |lg| nr > lg) {
            self.pn[space as usize].lg_acked = Some(nr);
        }

        let (tx_len, is_rtx, rtx_pair, stream, lg_acked_in_pkt) = {
            let m = ctx.pool.meta(v);
            (m.tx_len, m.is_rtx, m.rtx, m.stream, m.lg_acked)
        };

        self.rec.on_pkt_acked(tx_len);
        ctx.pool.meta_mut(v).is_acked = true;

        // an acked ACK prunes the receive ranges it covered
        if let Some(lg) = lg_acked_in_pkt {
            let pn = &mut self.pn[space as usize];
            let covered: Vec<(u64, u64)> = pn.recv.iter().filter(|(_, hi)| *hi <= lg).collect();
            for (lo, hi) in covered {
                for n in lo..=hi {
                    pn.recv.remove(n);
                }
            }
        }

        // either half of an RTX pair being acked makes the other transmission redundant
        if let Some(pair) = rtx_pair {
            let pair_nr = ctx.pool.meta(pair).hdr.nr;
            self.pn[space as usize].sent_pkts.remove(&pair_nr);
            self.pn[space as usize].acked.insert(pair_nr);
            if is_rtx {
                // v is the copy holding the old transmission; credit the original
                ctx.pool.meta_mut(pair).is_acked = true;
                ctx.pool.free(v);
            } else {
                ctx.pool.free(pair);
            }
        } else if is_rtx || stream.is_none() {
            // orphaned copy, ACK-only or pure control packet
            ctx.pool.free(v);
        }

        // advance the stream's unacked cursor and complete a pending write
        if let Some(sid) = stream {
            if let Some(s) = self.streams.get_mut(&sid) {
                while s.out_una < s.out.len() && ctx.pool.meta(s.out[s.out_una]).is_acked {
                    s.out_una += 1;
                }
            }
            self.maybe_complete_write(ctx, sid);
        }
    }

    pub fn maybe_complete_write(&mut self, ctx: &mut EngineCtx, sid: i64) {
        let done = self
            .streams
            .get(&sid)
            .map_or(false, |s| s.out_fully_acked());
        if !done {
            return;
        }

        if let Some(s) = self.streams.get_mut(&sid) {
            for v in s.out.drain(..) {
                ctx.pool.free(v);
            }
            s.out_una = 0;
            s.out_nxt = 0;
        }

        if let Some((wsid, tx)) = self.api.write.take() {
            if wsid == sid {
                let _ = tx.send(ApiReply::WriteDone(self.err_code));
            } else {
                self.api.write = Some((wsid, tx));
            }
        }
    }

    /// Time- and reordering-based loss detection over one space's sent packets.
    pub fn detect_lost(&mut self, ctx: &mut EngineCtx, space: Space) {
        let lg_acked = match self.pn[space as usize].lg_acked {
            Some(lg) => lg,
            None => return,
        };
        let loss_delay = self.rec.loss_delay();

        let sent: Vec<(u64, BufId)> = self.pn[space as usize]
            .sent_pkts
            .range(..lg_acked)
            .map(|(n, v)| (*n, *v))
            .collect();

        let mut newly_lost = false;
        for (nr, v) in sent {
            let (tx_t, stream, is_acked) = {
                let m = ctx.pool.meta(v);
                (m.tx_t, m.stream, m.is_acked)
            };
            if is_acked {
                continue;
            }

            let time_lost = tx_t.map_or(false, |t| ctx.now.saturating_duration_since(t) > loss_delay);
            let reorder_lost = nr + K_REORDERING_THRESHOLD <= lg_acked;
            if !time_lost && !reorder_lost {
                continue;
            }

            logging::debug!(self.log, "pkt declared lost";
                            "context" => "recovery",
                            "space" => ?space,
                            "nr" => nr);
            let tx_len = ctx.pool.meta(v).tx_len;
            self.rec.on_pkt_lost(tx_len, !newly_lost);
            newly_lost = true;
            self.pn[space as usize].sent_pkts.remove(&nr);

            if stream.is_some() && !ctx.pool.meta(v).is_rtx {
                // stream data: flag for retransmission, the buffer stays queued
                ctx.pool.meta_mut(v).is_lost = true;
                self.needs_tx = true;
            } else {
                // control packets re-emit from their pending flags; old rtx copies are dead
                ctx.pool.free(v);
            }
        }
    }
}

// TX pipeline
impl Conn {
    /// Run the TX pass: connection management, crypto streams by epoch, application streams,
    /// then an ACK-only packet if control frames are still owed.
    pub fn tx(&mut self, ctx: &mut EngineCtx, limit: u32) {
        if self.state == ConnState::Drng {
            return;
        }
        if self.state == ConnState::ClsgQueued {
            self.enter_closing(ctx);
        }

        if !self.blocked {
            self.do_conn_mgmt(ctx);

            if self.state != ConnState::Clsg {
                for epoch in &Epoch::ALL {
                    self.tx_stream(ctx, epoch.crypto_sid(), limit);
                    if !self.rec.has_wnd(MAX_PKT_LEN) {
                        break;
                    }
                }
            }

            if self.state != ConnState::Clsg && self.rec.has_wnd(MAX_PKT_LEN) {
                let mut sids: Vec<i64> = self.streams.keys().filter(|sid| **sid >= 0).copied().collect();
                sids.sort_unstable();
                for sid in sids {
                    self.tx_stream(ctx, sid, limit);
                    if !self.rec.has_wnd(MAX_PKT_LEN) {
                        break;
                    }
                }
            }

            if self.txq.is_empty() && (self.needs_ctrl() || self.state == ConnState::Clsg) {
                // need to send another frame, do it in an ACK
                self.tx_ack(ctx, self.epoch_in);
                return;
            }
        }

        if !self.txq.is_empty() {
            self.do_tx(ctx);
        }
    }

    fn do_conn_mgmt(&mut self, ctx: &mut EngineCtx) {
        if self.state == ConnState::Clsg || self.state == ConnState::Drng {
            return;
        }

        // refill stream-id windows
        if self.state == ConnState::Estb {
            self.do_stream_id_fc(self.lg_sid_uni);
            self.do_stream_id_fc(self.lg_sid_bidi);
        }

        if !self.tp_out.disable_migration && self.do_migration && self.state == ConnState::Estb {
            if self.is_clnt {
                // if higher-numbered destination cids are available, switch to the next
                if self.dcids.max_seq().map_or(false, |max| max > self.act_dcid_seq) {
                    self.use_next_dcid();
                    self.do_migration = false;
                    ctx.timers.set(
                        TimerKind::Migration(self.id),
                        ctx.now + Duration::from_secs(K_MIGRATION_LOCKOUT_SECS),
                    );
                }
            } else {
                // top the client up while it holds fewer than two of our cids
                self.tx_ncid = self.scids.count() < 2;
            }
        }
    }

    /// TX pass for one stream.
    pub fn tx_stream(&mut self, ctx: &mut EngineCtx, sid: i64, limit: u32) {
        let (has_data, needs_ctrl) = match self.streams.get(&sid) {
            Some(s) => {
                let has_data = !s.out.is_empty()
                    && !s.out_fully_acked()
                    && (s.has_data_queued()
                        || s.out[s.out_una..]
                            .iter()
                            .any(|v| ctx.pool.meta(*v).is_lost));
                (has_data, s.needs_ctrl())
            }
            None => return,
        };

        // during the handshake only crypto streams and explicit 0-RTT streams are serviced
        if (!has_data && !needs_ctrl)
            || (sid >= 0 && self.state != ConnState::Estb && !self.try_0rtt)
        {
            return;
        }

        let blocked = self.streams[&sid].blocked;
        if has_data && !blocked && self.rec.has_wnd(MAX_PKT_LEN) {
            self.tx_stream_data(ctx, sid, limit);
        } else if needs_ctrl {
            self.tx_stream_ctrl(ctx, sid);
        }
    }

    fn tx_stream_data(&mut self, ctx: &mut EngineCtx, sid: i64, limit: u32) {
        let mut encoded = 0u32;
        let mut idx = self.streams[&sid].out_una;

        while idx < self.streams[&sid].out.len() {
            let v = self.streams[&sid].out[idx];
            let (is_acked, tx_len, is_lost) = {
                let m = ctx.pool.meta(v);
                (m.is_acked, m.tx_len, m.is_lost)
            };

            if is_acked || (tx_len > 0 && !is_lost) {
                idx += 1;
                continue;
            }

            let rtx = is_lost;
            if rtx {
                self.rtx_pkt(ctx, sid, v);
            }

            if self.state == ConnState::Estb {
                let len = ctx.pool.meta(v).stream_data_len as u64;
                let mtu = MAX_PKT_LEN as u64;
                if sid >= 0 {
                    let s = &self.streams[&sid];
                    if s.out_data + len + mtu > s.out_data_max {
                        self.streams.get_mut(&sid).unwrap().blocked = true;
                    }
                }
                if self.out_data + len + mtu > self.tp_out.max_data {
                    self.blocked = true;
                }
            }

            if !self.enc_pkt(ctx, sid, rtx, true, v) {
                idx += 1;
                continue;
            }
            encoded += 1;

            if !rtx {
                let s = self.streams.get_mut(&sid).unwrap();
                s.out_nxt = s.out_nxt.max(idx + 1);
            }

            if !self.rec.has_wnd(MAX_PKT_LEN) && !self.blocked {
                logging::info!(self.log, "cwnd limit reached";
                               "context" => "tx",
                               "in_flight" => self.rec.in_flight,
                               "cwnd" => self.rec.cwnd);
                break;
            }
            if self.streams[&sid].blocked || self.blocked {
                break;
            }
            if limit > 0 && encoded == limit {
                logging::info!(self.log, "tx limit reached"; "context" => "tx", "limit" => limit);
                break;
            }
            idx += 1;
        }
    }

    fn tx_stream_ctrl(&mut self, ctx: &mut EngineCtx, sid: i64) {
        let v = match ctx.pool.alloc(DATA_OFFSET) {
            Some(v) => v,
            None => return,
        };

        let tx_fin = self.streams[&sid].tx_fin;
        if tx_fin {
            let fin_off = self.streams[&sid].out_off;
            let m = ctx.pool.meta_mut(v);
            m.stream = Some(sid);
            m.stream_off = fin_off;
            m.stream_data_start = DATA_OFFSET;
            m.stream_data_len = 0;
            m.fin = true;
            self.streams.get_mut(&sid).unwrap().out.push(v);
        }

        self.enc_pkt(ctx, sid, false, tx_fin, v);
        if tx_fin {
            self.streams.get_mut(&sid).unwrap().tx_fin = false;
        }
        self.do_tx(ctx);
    }

    /// Replace a lost packet: the original keeps the payload and will be re-encoded under a new
    /// number; a copy preserves the old transmission's metadata in the sent tree.
    fn rtx_pkt(&mut self, ctx: &mut EngineCtx, sid: i64, v: BufId) {
        debug_assert!(!ctx.pool.meta(v).is_rtx, "cannot RTX an RTX");

        let r = match ctx.pool.dup(v) {
            Some(r) => r,
            None => return,
        };
        ctx.pool.meta_mut(r).is_rtx = true;
        ctx.pool.link_rtx(v, r);

        let old_nr = ctx.pool.meta(v).hdr.nr;
        let space = pkt::epoch_for_pkt_type(ctx.pool.meta(v).hdr.ptype).space();
        // the original is reinserted under its new number when re-sent
        self.pn[space as usize].sent_pkts.remove(&old_nr);
        self.pn[space as usize].sent_pkts.insert(old_nr, r);

        let m = ctx.pool.meta_mut(v);
        m.is_lost = false;
        m.tx_len = 0;
        m.tx_t = None;

        logging::debug!(self.log, "rtx pkt";
                        "context" => "tx",
                        "sid" => sid,
                        "nr" => old_nr);
    }

    /// Tail-loss probe: retransmit the most recent application-space packet carrying stream or
    /// crypto data.
    pub fn tx_tlp(&mut self, ctx: &mut EngineCtx) {
        if !self.rec.has_wnd(MAX_PKT_LEN) {
            logging::info!(self.log, "out of window, cannot send TLP"; "context" => "tx");
            return;
        }

        let sent: Vec<BufId> = self.pn[Space::Data as usize]
            .sent_pkts
            .values()
            .rev()
            .copied()
            .collect();

        let mut pick = None;
        for v in sent {
            let m = ctx.pool.meta(v);
            if frame::has_frame(m.frames, frame::FRAM_TYPE_CRPT)
                || frame::has_frame(m.frames, frame::FRAM_TYPE_STRM)
            {
                let orig = if m.is_rtx { m.rtx } else { Some(v) };
                if let Some(orig) = orig {
                    if let Some(sid) = ctx.pool.meta(orig).stream {
                        pick = Some((sid, orig));
                        break;
                    }
                }
            }
        }

        let (sid, v) = match pick {
            Some(p) => p,
            None => {
                logging::info!(self.log, "cannot find pkt for TLP"; "context" => "tx");
                return;
            }
        };

        ctx.pool.meta_mut(v).is_lost = true;
        self.rtx_pkt(ctx, sid, v);
        self.enc_pkt(ctx, sid, true, true, v);
        self.do_tx(ctx);
    }

    /// Emit an ACK-only packet (possibly carrying owed control frames) in the given epoch.
    pub fn tx_ack(&mut self, ctx: &mut EngineCtx, epoch: Epoch) {
        let space = epoch.space();
        let needed = self.pn[space as usize].needs_ack()
            || self.ack_now[space as usize]
            || self.tx_rtry
            || self.state == ConnState::Clsg
            || self.needs_ctrl();
        if !needed {
            return;
        }

        let v = match ctx.pool.alloc(DATA_OFFSET) {
            Some(v) => v,
            None => return,
        };
        if !self.enc_pkt(ctx, epoch.crypto_sid(), false, false, v) {
            ctx.pool.free(v);
        }
        self.do_tx(ctx);
    }

    /// Coalesce and flush the packet queue into outbound datagrams.
    pub fn do_tx(&mut self, ctx: &mut EngineCtx) {
        let _ = ctx;
        self.needs_tx = false;
        if self.txq.is_empty() {
            return;
        }

        let txq = std::mem::replace(&mut self.txq, Vec::new());
        let peer = self.peer;
        for dgram in pkt::coalesce(txq) {
            self.out_dgrams.push((peer, dgram));
        }
    }

    /// Encode one packet for `sid` into the TX queue. Returns false when there was nothing to
    /// send or no keys for the epoch.
    pub fn enc_pkt(&mut self, ctx: &mut EngineCtx, sid: i64, rtx: bool, enc_data: bool, v: BufId) -> bool {
        let epoch = match Epoch::from_crypto_sid(sid) {
            Some(e) => e,
            None => {
                if self.state == ConnState::Estb || !self.try_0rtt {
                    Epoch::Data
                } else {
                    Epoch::ZeroRtt
                }
            }
        };

        let keys = match self.keys_for_epoch(epoch) {
            Some(k) => k.clone(),
            None => return false,
        };
        let space = epoch.space();

        let ptype = match epoch {
            Epoch::Init => F_LH_INIT,
            Epoch::ZeroRtt => F_LH_0RTT,
            Epoch::Hshk => F_LH_HSHK,
            Epoch::Data => F_SH,
        };

        // assemble the plaintext payload
        let mut plain = [0u8; MAX_PKT_LEN];
        let mut pos = 0usize;
        let mut frames_bits = 0u64;
        let mut lg_acked_enc = None;

        let closing = self.state == ConnState::Clsg || self.state == ConnState::ClsgQueued;

        if self.pn[space as usize].needs_ack() || self.ack_now[space as usize] {
            pos = frame::enc_ack_frame(self, ctx, space, &mut plain, pos, &mut frames_bits, &mut lg_acked_enc);
            self.ack_now[space as usize] = false;
        }

        if closing {
            pos = frame::enc_close_frame(self, &mut plain, pos, &mut frames_bits);
        } else if epoch == Epoch::Data || epoch == Epoch::ZeroRtt {
            // connection-level control frames ride in application packets
            if self.tx_max_data {
                pos = frame::enc_max_data_frame(self, &mut plain, pos, &mut frames_bits);
            }
            if self.tx_max_sid_bidi {
                pos = frame::enc_max_stream_id_frame(self, &mut plain, pos, &mut frames_bits, true);
            }
            if self.tx_max_sid_uni {
                pos = frame::enc_max_stream_id_frame(self, &mut plain, pos, &mut frames_bits, false);
            }
            if self.sid_blocked_bidi {
                self.sid_blocked_bidi = false;
                pos = frame::enc_stream_id_blocked_frame(self, &mut plain, pos, &mut frames_bits, true);
            }
            if self.sid_blocked_uni {
                self.sid_blocked_uni = false;
                pos = frame::enc_stream_id_blocked_frame(self, &mut plain, pos, &mut frames_bits, false);
            }
            if self.blocked {
                pos = frame::enc_blocked_frame(self, &mut plain, pos, &mut frames_bits);
            }
            if self.tx_ncid {
                pos = frame::enc_new_cid_frame(self, ctx, &mut plain, pos, &mut frames_bits);
            }
            if self.tx_retire_cid {
                pos = frame::enc_retire_cid_frames(self, &mut plain, pos, &mut frames_bits);
            }
            if self.tx_path_resp {
                pos = frame::enc_path_response_frame(self, &mut plain, pos, &mut frames_bits);
                self.tx_path_resp = false;
            }
            if self.tx_path_chlg {
                pos = frame::enc_path_challenge_frame(self, &mut plain, pos, &mut frames_bits);
            }
            if self.tx_new_tok {
                pos = frame::enc_new_token_frame(self, &mut plain, pos, &mut frames_bits);
                self.tx_new_tok = false;
            }
            if sid >= 0 {
                let (tx_msd, s_blocked) = {
                    let s = &self.streams[&sid];
                    (s.tx_max_stream_data, s.blocked)
                };
                if tx_msd {
                    pos = frame::enc_max_stream_data_frame(self, sid, &mut plain, pos, &mut frames_bits);
                }
                if s_blocked {
                    pos = frame::enc_stream_blocked_frame(self, sid, &mut plain, pos, &mut frames_bits);
                }
            }
        }

        if enc_data && !closing {
            let (dlen, fin_queued) = {
                let m = ctx.pool.meta(v);
                (m.stream_data_len, m.fin)
            };
            if dlen > 0 || fin_queued {
                pos = frame::enc_stream_or_crypto_frame(self, ctx, sid, v, rtx, &mut plain, pos, &mut frames_bits);
            }
        }

        if pos == 0 {
            return false;
        }

        let nr = self.pn[space as usize].next_nr();
        let nr_len = pkt::needed_pkt_nr_len(nr, self.pn[space as usize].lg_acked);

        // client INITIAL datagrams must reach the minimum size; all packets need enough
        // payload for the header-protection sample
        if ptype == F_LH_INIT && self.is_clnt {
            let hdr_guess = 1 + 4 + 1 + self.dcid().bytes().len() + self.scid().bytes().len()
                + 1 + self.tok.len() + 2 + nr_len + crypto::TAG_LEN;
            let target = MIN_INI_LEN.saturating_sub(hdr_guess);
            if pos < target {
                pos = frame::enc_padding_frame(&mut plain, pos, target - pos);
            }
        }
        if pos < MIN_PLAIN_LEN {
            pos = frame::enc_padding_frame(&mut plain, pos, MIN_PLAIN_LEN - pos);
        }

        // the key-phase bit flips at most once per migration-timer period
        if ptype == F_SH && self.do_key_flip && self.state == ConnState::Estb {
            self.key_phase = !self.key_phase;
            self.do_key_flip = false;
        }

        // header
        let length = nr_len + pos + crypto::TAG_LEN;
        let mut hdr_buf = [0u8; 64];
        let dcid = *self.dcid();
        let scid = *self.scid();
        let tok = if ptype == F_LH_INIT { self.tok.clone() } else { Vec::new() };
        let pn_pos = pkt::enc_pkt_hdr_beginning(&mut hdr_buf, ptype, self.vers, &dcid, &scid, &tok, length);
        if ptype == F_SH && self.key_phase {
            hdr_buf[0] |= F_SH_KYPH;
        }
        let hdr_end = pkt::enc_pkt_nr(&mut hdr_buf, pn_pos, nr, nr_len);

        let pkt_bytes = pkt::seal_pkt(&hdr_buf[..hdr_end], pn_pos, nr_len, &plain[..pos], nr, &keys);
        let tx_len = pkt_bytes.len();

        // record packet metadata and insert into the sent tree
        {
            let m = ctx.pool.meta_mut(v);
            m.hdr.flags = hdr_buf[0];
            m.hdr.ptype = ptype;
            m.hdr.vers = self.vers;
            m.hdr.nr = nr;
            m.hdr.nr_len = nr_len;
            m.frames |= frames_bits;
            m.tx_len = tx_len;
            m.tx_t = Some(ctx.now);
            m.lg_acked = lg_acked_enc;
            m.is_lost = false;
        }
        self.pn[space as usize].sent_pkts.insert(nr, v);

        let ack_eliciting = !frame::is_ack_only(frames_bits);
        self.rec.on_pkt_sent(tx_len, ack_eliciting);
        if ack_eliciting && !ctx.timers.is_armed(TimerKind::LossDetection(self.id)) {
            ctx.timers.set(TimerKind::LossDetection(self.id), ctx.now + self.rec.pto());
        }

        logging::trace!(self.log, "pkt encoded";
                        "context" => "tx",
                        "type" => ptype,
                        "nr" => nr,
                        "len" => tx_len,
                        "sid" => sid);

        self.txq.push(TxPkt {
            data: pkt_bytes,
            long: ptype != F_SH,
        });
        true
    }
}
