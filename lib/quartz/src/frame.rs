//! Frame codec: the multiplexer that parses heterogeneous frames out of a decrypted payload,
//! the per-type encoders, and the stream reassembly core driven by STREAM/CRYPTO frames.

use crate::buffer::BufId;
use crate::cid::{Cid, CidKey, LOCAL_CID_LEN, MAX_CID_LEN, MIN_CID_LEN, SRT_LEN};
use crate::conn::{ApiReply, Conn, ConnState};
use crate::engine::EngineCtx;
use crate::marshall::{dec_buf, dec_u16, dec_u64, dec_u8, dec_varint, enc_raw, enc_u16, enc_u64, enc_u8, enc_varint};
use crate::pkt::{epoch_for_pkt_type, F_LH_HSHK, F_LH_INIT};
use crate::pn::Space;
use crate::result::{QuicError, QuicResult, ERR_FLOW_CONTROL, ERR_FRAME_ENC, ERR_STREAM_ID};
use crate::stream::{is_srv_ini, is_uni, StrmState, STRM_FL_SRV, STRM_FL_UNI};
use crate::timer::TimerKind;
use crate::tp::DEF_ACK_DEL_EXP;
use lumen::logging;

pub const FRAM_TYPE_PAD: u8 = 0x00;
pub const FRAM_TYPE_RST_STRM: u8 = 0x01;
pub const FRAM_TYPE_CONN_CLSE: u8 = 0x02;
pub const FRAM_TYPE_APPL_CLSE: u8 = 0x03;
pub const FRAM_TYPE_MAX_DATA: u8 = 0x04;
pub const FRAM_TYPE_MAX_STRM_DATA: u8 = 0x05;
pub const FRAM_TYPE_MAX_SID: u8 = 0x06;
pub const FRAM_TYPE_PING: u8 = 0x07;
pub const FRAM_TYPE_BLCK: u8 = 0x08;
pub const FRAM_TYPE_STRM_BLCK: u8 = 0x09;
pub const FRAM_TYPE_SID_BLCK: u8 = 0x0a;
pub const FRAM_TYPE_NEW_CID: u8 = 0x0b;
pub const FRAM_TYPE_STOP_SEND: u8 = 0x0c;
pub const FRAM_TYPE_ACK: u8 = 0x0d;
pub const FRAM_TYPE_PATH_CHLG: u8 = 0x0e;
pub const FRAM_TYPE_PATH_RESP: u8 = 0x0f;
pub const FRAM_TYPE_STRM: u8 = 0x10;
pub const FRAM_TYPE_STRM_MAX: u8 = 0x17;
pub const FRAM_TYPE_CRPT: u8 = 0x18;
pub const FRAM_TYPE_NEW_TOKN: u8 = 0x19;
pub const FRAM_TYPE_ACK_ECN: u8 = 0x1a;
pub const FRAM_TYPE_RTIR_CID: u8 = 0x1b;

pub const F_STREAM_FIN: u8 = 0x01;
pub const F_STREAM_LEN: u8 = 0x02;
pub const F_STREAM_OFF: u8 = 0x04;

#[inline]
pub fn track(frames: &mut u64, t: u8) {
    *frames |= 1u64 << t;
}

#[inline]
pub fn has_frame(frames: u64, t: u8) -> bool {
    frames & (1u64 << t) != 0
}

/// True when the bitset holds nothing but ACK and PADDING.
#[inline]
pub fn is_ack_only(frames: u64) -> bool {
    frames != 0 && frames & !((1u64 << FRAM_TYPE_ACK) | (1u64 << FRAM_TYPE_PAD)) == 0
}

#[inline]
fn err_enc<R: Into<String>>(t: u8, reason: R) -> QuicError {
    QuicError::close(ERR_FRAME_ENC, t, reason)
}

fn chk<T>(r: QuicResult<T>, t: u8, what: &str) -> QuicResult<T> {
    r.map_err(|e| match e {
        QuicError::Need => err_enc(t, format!("dec {}", what)),
        other => other,
    })
}

/// Iterate the frames of a decrypted packet payload, dispatching by type. Returns the buffer id
/// holding the final stream view, which differs from the input when a packet carried more than
/// one data-bearing frame. On error the unowned working buffer is released; buffers already
/// handed to streams stay where they are (partial processing is never rolled back).
pub fn dec_frames(c: &mut Conn, ctx: &mut EngineCtx, v: BufId) -> QuicResult<BufId> {
    let mut v = v;
    match dec_frames_inner(c, ctx, &mut v) {
        Ok(()) => Ok(v),
        Err(e) => {
            if ctx.pool.meta(v).stream.is_none() {
                ctx.pool.free(v);
            }
            Err(e)
        }
    }
}

fn dec_frames_inner(c: &mut Conn, ctx: &mut EngineCtx, vv: &mut BufId) -> QuicResult<()> {
    let mut v = *vv;
    let payload: Vec<u8> = ctx.pool.buf(v).to_vec();
    let view_start = ctx.pool.view(v).0;
    let mut i = 0usize;
    let mut pad_start: Option<usize> = None;

    while i < payload.len() {
        let t = payload[i];

        if t == FRAM_TYPE_PAD {
            if pad_start.is_none() {
                pad_start = Some(i);
            }
            i += 1;
            if i == payload.len() {
                logging::debug!(c.log, "rx PADDING"; "len" => i - pad_start.unwrap());
                track(&mut ctx.pool.meta_mut(v).frames, FRAM_TYPE_PAD);
            }
            continue;
        }

        if let Some(ps) = pad_start.take() {
            // coalesce the preceding run of pad bytes into one event
            logging::debug!(c.log, "rx PADDING"; "len" => i - ps);
            track(&mut ctx.pool.meta_mut(v).frames, FRAM_TYPE_PAD);
        }

        if t == FRAM_TYPE_CRPT || (FRAM_TYPE_STRM..=FRAM_TYPE_STRM_MAX).contains(&t) {
            let had_data = {
                let m = ctx.pool.meta(v);
                (has_frame(m.frames, FRAM_TYPE_CRPT) || has_frame(m.frames, FRAM_TYPE_STRM))
                    && m.stream.is_some()
            };
            if had_data {
                // a previous stream or crypto frame in this packet already owns the buffer, so
                // track this one in a deep copy and narrow the original to its stream bytes
                logging::debug!(c.log, "addtl stream or crypto frame, copy"; "pos" => i);
                let vdup = ctx
                    .pool
                    .dup(v)
                    .ok_or_else(|| err_enc(t, "pool exhausted on frame copy"))?;
                let (ss, sl) = {
                    let m = ctx.pool.meta(v);
                    (m.stream_data_start, m.stream_data_len)
                };
                ctx.pool.set_view(v, ss, sl);
                v = vdup;
                *vv = vdup;
            }

            i = dec_stream_or_crypto_frame(c, ctx, v, &payload, i, view_start)?;
            track(
                &mut ctx.pool.meta_mut(v).frames,
                if t == FRAM_TYPE_CRPT {
                    FRAM_TYPE_CRPT
                } else {
                    FRAM_TYPE_STRM
                },
            );
            continue;
        }

        let tracked = if t == FRAM_TYPE_ACK_ECN { FRAM_TYPE_ACK } else { t };
        i = match t {
            FRAM_TYPE_ACK | FRAM_TYPE_ACK_ECN => dec_ack_frame(c, ctx, v, &payload, i)?,
            FRAM_TYPE_RST_STRM => dec_rst_stream_frame(c, &payload, i)?,
            FRAM_TYPE_CONN_CLSE | FRAM_TYPE_APPL_CLSE => dec_close_frame(c, ctx, &payload, i)?,
            FRAM_TYPE_PING => {
                logging::debug!(c.log, "rx PING");
                c.needs_tx = true;
                i + 1
            }
            FRAM_TYPE_MAX_STRM_DATA => dec_max_stream_data_frame(c, &payload, i)?,
            FRAM_TYPE_MAX_SID => dec_max_stream_id_frame(c, &payload, i)?,
            FRAM_TYPE_MAX_DATA => dec_max_data_frame(c, &payload, i)?,
            FRAM_TYPE_STRM_BLCK => dec_stream_blocked_frame(c, &payload, i)?,
            FRAM_TYPE_BLCK => dec_blocked_frame(c, &payload, i)?,
            FRAM_TYPE_SID_BLCK => dec_stream_id_blocked_frame(c, &payload, i)?,
            FRAM_TYPE_STOP_SEND => dec_stop_sending_frame(c, &payload, i)?,
            FRAM_TYPE_PATH_CHLG => dec_path_challenge_frame(c, &payload, i)?,
            FRAM_TYPE_PATH_RESP => dec_path_response_frame(c, &payload, i)?,
            FRAM_TYPE_NEW_CID => dec_new_cid_frame(c, &payload, i)?,
            FRAM_TYPE_NEW_TOKN => dec_new_token_frame(c, ctx, &payload, i)?,
            FRAM_TYPE_RTIR_CID => dec_retire_cid_frame(c, ctx, &payload, i)?,
            _ => {
                return Err(err_enc(
                    t,
                    format!("unknown frame type 0x{:02x} at pos {}", t, i),
                ))
            }
        };
        track(&mut ctx.pool.meta_mut(v).frames, tracked);
    }

    // narrow the final buffer to its stream bytes
    let (sds, sdl, has_stream) = {
        let m = ctx.pool.meta(v);
        (m.stream_data_start, m.stream_data_len, m.stream.is_some())
    };
    if has_stream && sds != 0 {
        ctx.pool.set_view(v, sds, sdl);
    }

    // track outstanding frame types in the packet-number space
    let frames = ctx.pool.meta(v).frames;
    let space = epoch_for_pkt_type(ctx.pool.meta(v).hdr.ptype).space();
    c.pn[space as usize].rx_frames |= frames;

    Ok(())
}

/// Reassembly core shared by STREAM and CRYPTO frames.
fn dec_stream_or_crypto_frame(
    c: &mut Conn,
    ctx: &mut EngineCtx,
    v: BufId,
    payload: &[u8],
    pos: usize,
    view_start: usize,
) -> QuicResult<usize> {
    let (t, mut i) = dec_u8(payload, pos)?;
    ctx.pool.meta_mut(v).stream_header_pos = view_start + pos;

    let ptype = ctx.pool.meta(v).hdr.ptype;
    let sid = if t == FRAM_TYPE_CRPT {
        epoch_for_pkt_type(ptype).crypto_sid()
    } else {
        let (raw_sid, p) = chk(dec_varint(payload, i), t, "sid")?;
        i = p;
        let sid = raw_sid as i64;
        let max = c.max_sid(sid);
        if sid > max {
            return Err(QuicError::close(
                ERR_STREAM_ID,
                t,
                format!("sid {} > max {}", sid, max),
            ));
        }
        sid
    };

    let off = if t == FRAM_TYPE_CRPT || t & F_STREAM_OFF != 0 {
        let (off, p) = chk(dec_varint(payload, i), t, "off")?;
        i = p;
        off
    } else {
        0
    };

    let len = if t == FRAM_TYPE_CRPT || t & F_STREAM_LEN != 0 {
        let (l, p) = chk(dec_varint(payload, i), t, "len")?;
        i = p;
        if l as usize > payload.len() - p {
            return Err(err_enc(t, "illegal strm len"));
        }
        l as usize
    } else {
        // stream data extends to the end of the packet
        payload.len() - i
    };

    let fin = t != FRAM_TYPE_CRPT && t & F_STREAM_FIN != 0;
    let frame_end = i + len;

    {
        let m = ctx.pool.meta_mut(v);
        m.stream_data_start = view_start + i;
        m.stream_data_len = len;
        m.stream_off = off;
        m.fin = fin;
    }

    let kind;
    let mut is_dup = false;

    if len == 0 && !fin {
        logging::warn!(c.log, "zero-len stream/crypto frame, ignoring"; "sid" => sid);
        ctx.pool.meta_mut(v).stream = None;
        return Ok(frame_end);
    }

    // find or create the stream
    if c.get_stream(sid).is_none() {
        if sid >= 0 && c.closed_streams.contains(sid as u64) {
            logging::info!(c.log, "ignoring frame for closed stream"; "sid" => sid);
            ctx.pool.meta_mut(v).stream = None;
            return Ok(frame_end);
        }
        if sid >= 0 && is_srv_ini(sid) == !c.is_clnt {
            // the peer may not open streams of our initiator class
            return Err(err_enc(t, format!("got sid {} but am {}", sid, c.conn_type())));
        }
        c.new_stream(sid);
    }
    ctx.pool.meta_mut(v).stream = Some(sid);

    let in_data_off = c.streams[&sid].in_data_off;
    let last_byte = off + (len as u64).saturating_sub(1);

    if in_data_off >= off && in_data_off <= last_byte {
        // best case: new in-order data
        kind = "seq";

        let mut deliver_len = len as u64;
        if in_data_off > off {
            // already-received data at the beginning of the frame, trim
            let diff = in_data_off - off;
            let m = ctx.pool.meta_mut(v);
            m.stream_off += diff;
            m.stream_data_start += diff as usize;
            m.stream_data_len -= diff as usize;
            deliver_len -= diff;
        }

        c.track_bytes_in(sid, deliver_len);
        {
            let s = c.streams.get_mut(&sid).unwrap();
            s.in_data_off += deliver_len;
            s.in_q.push_back(v);
        }

        // a filled hole may let held out-of-order data drain
        loop {
            let (p_off, p) = match c.streams[&sid].in_ooo.iter().next() {
                Some((o, b)) => (*o, *b),
                None => break,
            };
            let p_len = ctx.pool.meta(p).stream_data_len as u64;
            let s_off = c.streams[&sid].in_data_off;

            if p_off + p_len < s_off {
                logging::warn!(c.log, "drop stale held frame";
                               "off" => p_off, "len" => p_len);
                c.streams.get_mut(&sid).unwrap().in_ooo.remove(&p_off);
                ctx.pool.free(p);
                continue;
            }
            if p_off > s_off {
                break; // still a gap
            }

            if s_off > p_off {
                let diff = s_off - p_off;
                let m = ctx.pool.meta_mut(p);
                m.stream_off += diff;
                m.stream_data_start += diff as usize;
                m.stream_data_len -= diff as usize;
            }
            let p_deliver = ctx.pool.meta(p).stream_data_len as u64;
            let s = c.streams.get_mut(&sid).unwrap();
            s.in_ooo.remove(&p_off);
            s.in_q.push_back(p);
            s.in_data_off += p_deliver;
        }

        // act on a delivered FIN
        let fin_delivered = c.streams[&sid]
            .in_q
            .back()
            .map_or(false, |last| ctx.pool.meta(*last).fin);
        if fin_delivered {
            c.streams.get_mut(&sid).unwrap().on_fin_rcvd();
            // ACK the FIN immediately
            let space = epoch_for_pkt_type(ptype).space();
            c.ack_now[space as usize] = true;
            c.needs_tx = true;
            ctx.timers.cancel(TimerKind::Ack(c.id, space));
        }

        if t != FRAM_TYPE_CRPT {
            c.do_stream_fc(sid);
            c.do_conn_fc();
            c.have_new_data = true;
        }
    } else if off + len as u64 <= in_data_off {
        // complete duplicate
        kind = "dup";
        is_dup = true;
    } else {
        // out of order: reject anything overlapping already-held data
        kind = "ooo";
        let overlaps = c.streams[&sid].in_ooo.iter().any(|(p_off, p)| {
            let p_len = ctx.pool.meta(*p).stream_data_len as u64;
            *p_off <= last_byte && (p_off + p_len).saturating_sub(1) >= off
        });

        if overlaps {
            logging::error!(c.log, "overlapping held data, dropping";
                            "off" => off, "len" => len);
            is_dup = true;
        } else {
            c.track_bytes_in(sid, len as u64);
            c.streams.get_mut(&sid).unwrap().in_ooo.insert(off, v);
        }
    }

    logging::debug!(c.log, "rx stream/crypto frame";
                    "type" => t,
                    "sid" => sid,
                    "off" => off,
                    "len" => len,
                    "kind" => kind);

    // flow-control verdict is rendered even for duplicates
    if t != FRAM_TYPE_CRPT {
        let in_data_max = c.streams.get(&sid).map_or(0, |s| s.in_data_max);
        if off + len as u64 > in_data_max {
            return Err(QuicError::close(
                ERR_FLOW_CONTROL,
                0,
                format!("stream {} off {} > in_data_max {}", sid, off + len as u64, in_data_max),
            ));
        }
    }

    if is_dup {
        // tells the caller the buffer was not placed in any stream
        ctx.pool.meta_mut(v).stream = None;
    }

    Ok(frame_end)
}

fn dec_ack_frame(
    c: &mut Conn,
    ctx: &mut EngineCtx,
    v: BufId,
    payload: &[u8],
    pos: usize,
) -> QuicResult<usize> {
    let (t, i) = dec_u8(payload, pos)?;
    let (lg_ack, i) = chk(dec_varint(payload, i), t, "lg ack")?;
    let (ack_delay_raw, mut i) = chk(dec_varint(payload, i), t, "ack delay")?;

    if ack_delay_raw > u64::from(u32::max_value()) {
        return Err(err_enc(t, format!("ACK delay raw {}", ack_delay_raw)));
    }

    // initial and handshake packets always use the default ACK delay exponent
    let ptype = ctx.pool.meta(v).hdr.ptype;
    let ade = if ptype == F_LH_INIT || ptype == F_LH_HSHK {
        DEF_ACK_DEL_EXP
    } else {
        c.tp_out.ack_del_exp
    };
    let ack_delay_usec = ack_delay_raw << ade;
    let ack_delay = std::time::Duration::from_micros(ack_delay_usec);

    let space = epoch_for_pkt_type(ptype).space();

    let (num_blocks, p) = chk(dec_varint(payload, i), t, "block cnt")?;
    i = p;

    let mut lg_in_block = lg_ack;
    let mut sm_new_acked: Option<u64> = None;

    for n in (0..=num_blocks).rev() {
        let (block_len, p) = chk(dec_varint(payload, i), t, "block len")?;
        i = p;

        if block_len > lg_in_block {
            return Err(err_enc(
                t,
                format!("ACK block len {} > lg in block {}", block_len, lg_in_block),
            ));
        }
        let lo = lg_in_block - block_len;

        logging::debug!(c.log, "rx ACK block";
                        "space" => ?space,
                        "lo" => lo,
                        "hi" => lg_in_block,
                        "delay_usec" => ack_delay_usec);

        let mut ack = lg_in_block;
        loop {
            process_ack(c, ctx, space, ack, lg_ack, ack_delay, &mut sm_new_acked);
            if ack == lo {
                break;
            }
            ack -= 1;
        }

        if n > 0 {
            let (gap, p) = chk(dec_varint(payload, i), t, "gap")?;
            i = p;
            if lo < gap + 2 {
                return Err(err_enc(t, format!("ACK gap {}", gap)));
            }
            lg_in_block = lo - gap - 2;
        }
    }

    if t == FRAM_TYPE_ACK_ECN {
        let (ect0, p) = chk(dec_varint(payload, i), t, "ect0")?;
        let (ect1, p) = chk(dec_varint(payload, p), t, "ect1")?;
        let (ce, p) = chk(dec_varint(payload, p), t, "ce")?;
        i = p;
        logging::debug!(c.log, "rx ECN counts"; "ect0" => ect0, "ect1" => ect1, "ce" => ce);
    }

    c.rec.on_ack_received_2(sm_new_acked);
    c.detect_lost(ctx, space);

    // loss detection follows the still-outstanding packets
    if c.pn[space as usize].sent_pkts.is_empty() {
        ctx.timers.cancel(TimerKind::LossDetection(c.id));
    } else {
        ctx.timers.set(TimerKind::LossDetection(c.id), ctx.now + c.rec.pto());
    }

    Ok(i)
}

fn process_ack(
    c: &mut Conn,
    ctx: &mut EngineCtx,
    space: Space,
    ack: u64,
    lg_ack: u64,
    ack_delay: std::time::Duration,
    sm_new_acked: &mut Option<u64>,
) {
    let bufid = match c.pn[space as usize].sent_pkts.get(&ack) {
        Some(b) => *b,
        None => {
            if c.pn[space as usize].acked.contains(ack) {
                logging::warn!(c.log, "repeated ACK, ignoring"; "nr" => ack);
            } else {
                logging::error!(c.log, "got ACK for pkt never sent"; "nr" => ack);
            }
            return;
        }
    };

    if ctx.pool.meta(bufid).is_acked {
        logging::warn!(c.log, "repeated ACK, ignoring"; "nr" => ack);
        return;
    }

    if ack == lg_ack {
        // RTT sample comes only from the largest acked in the frame
        let tx_t = ctx.pool.meta(bufid).tx_t;
        c.rec.on_ack_received_1(tx_t, ack_delay, ctx.now);
    }

    if sm_new_acked.map_or(true, |sm| ack < sm) {
        *sm_new_acked = Some(ack);
    }

    c.on_pkt_acked(ctx, space, ack, bufid);
}

fn dec_close_frame(c: &mut Conn, ctx: &mut EngineCtx, payload: &[u8], pos: usize) -> QuicResult<usize> {
    let (t, i) = dec_u8(payload, pos)?;
    let (err_code, mut i) = chk(dec_u16(payload, i), t, "err code")?;

    let mut frame_type = 0;
    if t == FRAM_TYPE_CONN_CLSE {
        let (ft, p) = chk(dec_varint(payload, i), t, "frame type")?;
        frame_type = ft;
        i = p;
    }

    let (reas_len, mut i) = chk(dec_varint(payload, i), t, "reason len")?;
    if reas_len as usize > payload.len() - i {
        return Err(err_enc(t, format!("illegal reason len {}", reas_len)));
    }
    let mut reason = String::new();
    if reas_len > 0 {
        let (bytes, p) = chk(dec_buf(payload, i, reas_len as usize), t, "reason")?;
        reason = String::from_utf8_lossy(bytes).into_owned();
        i = p;
    }

    logging::info!(c.log, "rx CLOSE";
                   "app" => t == FRAM_TYPE_APPL_CLSE,
                   "err" => err_code,
                   "frame" => frame_type,
                   "reason" => &reason);

    if c.state != ConnState::ClsgQueued {
        if c.state != ConnState::Drng {
            c.to_state(ConnState::Drng);
            c.needs_tx = false;
            c.enter_closing(ctx);
        } else {
            ctx.timers.set(TimerKind::Closing(c.id), ctx.now);
        }
    }

    Ok(i)
}

fn dec_max_stream_data_frame(c: &mut Conn, payload: &[u8], pos: usize) -> QuicResult<usize> {
    const T: u8 = FRAM_TYPE_MAX_STRM_DATA;
    let (raw_sid, i) = chk(dec_varint(payload, pos + 1), T, "sid")?;
    let (max, i) = chk(dec_varint(payload, i), T, "max")?;
    let sid = raw_sid as i64;

    logging::debug!(c.log, "rx MAX_STREAM_DATA"; "sid" => sid, "max" => max);

    let raised = match c.streams.get_mut(&sid) {
        Some(s) => {
            if max > s.out_data_max {
                s.out_data_max = max;
                s.blocked = false;
                true
            } else {
                false
            }
        }
        None => return handle_unknown_strm(c, sid, T, i),
    };

    if raised {
        c.needs_tx = true;
    } else {
        logging::info!(c.log, "MAX_STREAM_DATA <= current value, ignoring";
                       "sid" => sid, "max" => max);
    }

    Ok(i)
}

fn dec_max_stream_id_frame(c: &mut Conn, payload: &[u8], pos: usize) -> QuicResult<usize> {
    const T: u8 = FRAM_TYPE_MAX_SID;
    let (raw_max, i) = chk(dec_varint(payload, pos + 1), T, "max sid")?;
    let max = raw_max as i64;

    if is_srv_ini(max) == c.is_clnt {
        return Err(err_enc(T, format!("illegal MAX_STREAM_ID for {}: {}", c.conn_type(), max)));
    }

    logging::debug!(c.log, "rx MAX_STREAM_ID"; "max" => max, "uni" => is_uni(max));

    let new_count = (max >> 2) + 1;
    let cur = if is_uni(max) {
        &mut c.tp_out.max_uni_streams
    } else {
        &mut c.tp_out.max_bidi_streams
    };

    if new_count > *cur {
        *cur = new_count;
        if is_uni(max) {
            c.sid_blocked_uni = false;
        } else {
            c.sid_blocked_bidi = false;
        }
        c.needs_tx = true;

        // a blocked stream reservation may now proceed
        if let Some((bidi, tx)) = c.api.rsv_stream.take() {
            if bidi != is_uni(max) {
                let res = c.rsv_stream(bidi);
                if res.is_ok() {
                    let _ = tx.send(ApiReply::Stream(res));
                } else {
                    c.api.rsv_stream = Some((bidi, tx));
                }
            } else {
                c.api.rsv_stream = Some((bidi, tx));
            }
        }
    } else {
        logging::info!(c.log, "max streams <= current value, ignoring";
                       "max" => new_count, "cur" => *cur);
    }

    Ok(i)
}

fn dec_max_data_frame(c: &mut Conn, payload: &[u8], pos: usize) -> QuicResult<usize> {
    const T: u8 = FRAM_TYPE_MAX_DATA;
    let (max, i) = chk(dec_varint(payload, pos + 1), T, "max")?;

    logging::debug!(c.log, "rx MAX_DATA"; "max" => max);

    if max > c.tp_out.max_data {
        c.tp_out.max_data = max;
        c.blocked = false;
        c.needs_tx = true;
    } else {
        logging::info!(c.log, "MAX_DATA <= current value, ignoring";
                       "max" => max, "cur" => c.tp_out.max_data);
    }

    Ok(i)
}

fn dec_stream_blocked_frame(c: &mut Conn, payload: &[u8], pos: usize) -> QuicResult<usize> {
    const T: u8 = FRAM_TYPE_STRM_BLCK;
    let (raw_sid, i) = chk(dec_varint(payload, pos + 1), T, "sid")?;
    let (off, i) = chk(dec_varint(payload, i), T, "off")?;
    let sid = raw_sid as i64;

    logging::debug!(c.log, "rx STREAM_BLOCKED"; "sid" => sid, "off" => off);

    if c.get_stream(sid).is_none() {
        return handle_unknown_strm(c, sid, T, i);
    }
    c.do_stream_fc(sid);
    Ok(i)
}

fn dec_blocked_frame(c: &mut Conn, payload: &[u8], pos: usize) -> QuicResult<usize> {
    const T: u8 = FRAM_TYPE_BLCK;
    let (off, i) = chk(dec_varint(payload, pos + 1), T, "off")?;
    logging::debug!(c.log, "rx BLOCKED"; "off" => off);
    c.do_conn_fc();
    Ok(i)
}

fn dec_stream_id_blocked_frame(c: &mut Conn, payload: &[u8], pos: usize) -> QuicResult<usize> {
    const T: u8 = FRAM_TYPE_SID_BLCK;
    let (raw_sid, i) = chk(dec_varint(payload, pos + 1), T, "sid")?;
    let sid = raw_sid as i64;

    logging::debug!(c.log, "rx STREAM_ID_BLOCKED"; "sid" => sid);

    let at_limit = if is_uni(sid) {
        (sid >> 2) + 1 == c.tp_in.max_uni_streams
    } else {
        (sid >> 2) + 1 == c.tp_in.max_bidi_streams
    };

    if at_limit {
        // let the peer open more streams
        if is_uni(sid) {
            c.tp_in.new_max_uni_streams = c.tp_in.max_uni_streams + 2;
            c.tx_max_sid_uni = true;
        } else {
            c.tp_in.new_max_bidi_streams = c.tp_in.max_bidi_streams + 2;
            c.tx_max_sid_bidi = true;
        }
        c.needs_tx = true;
    }

    Ok(i)
}

fn dec_stop_sending_frame(c: &mut Conn, payload: &[u8], pos: usize) -> QuicResult<usize> {
    const T: u8 = FRAM_TYPE_STOP_SEND;
    let (raw_sid, i) = chk(dec_varint(payload, pos + 1), T, "sid")?;
    let (err_code, i) = chk(dec_u16(payload, i), T, "err code")?;
    let sid = raw_sid as i64;

    logging::debug!(c.log, "rx STOP_SENDING"; "sid" => sid, "err" => err_code);

    if c.get_stream(sid).is_none() {
        return handle_unknown_strm(c, sid, T, i);
    }
    Ok(i)
}

fn dec_rst_stream_frame(c: &mut Conn, payload: &[u8], pos: usize) -> QuicResult<usize> {
    const T: u8 = FRAM_TYPE_RST_STRM;
    let (raw_sid, i) = chk(dec_varint(payload, pos + 1), T, "sid")?;
    let (err_code, i) = chk(dec_u16(payload, i), T, "err code")?;
    let (off, i) = chk(dec_varint(payload, i), T, "off")?;
    let sid = raw_sid as i64;

    logging::info!(c.log, "rx RST_STREAM"; "sid" => sid, "err" => err_code, "off" => off);

    match c.get_stream(sid) {
        Some(s) => s.to_state(StrmState::Closed),
        None => return handle_unknown_strm(c, sid, T, i),
    }
    Ok(i)
}

fn dec_path_challenge_frame(c: &mut Conn, payload: &[u8], pos: usize) -> QuicResult<usize> {
    const T: u8 = FRAM_TYPE_PATH_CHLG;
    let (data, i) = chk(dec_u64(payload, pos + 1), T, "path chlg")?;

    logging::debug!(c.log, "rx PATH_CHALLENGE"; "data" => data);

    c.path_chlg_in = data;
    c.path_resp_out = data;
    c.tx_path_resp = true;
    c.needs_tx = true;
    Ok(i)
}

fn dec_path_response_frame(c: &mut Conn, payload: &[u8], pos: usize) -> QuicResult<usize> {
    const T: u8 = FRAM_TYPE_PATH_RESP;
    let (data, i) = chk(dec_u64(payload, pos + 1), T, "path resp")?;

    logging::debug!(c.log, "rx PATH_RESPONSE"; "data" => data);

    c.path_resp_in = data;
    if c.path_resp_in == c.path_chlg_out {
        c.tx_path_chlg = false;
    }
    Ok(i)
}

fn dec_new_cid_frame(c: &mut Conn, payload: &[u8], pos: usize) -> QuicResult<usize> {
    const T: u8 = FRAM_TYPE_NEW_CID;
    let (len, i) = chk(dec_u8(payload, pos + 1), T, "cid len")?;

    if (len as usize) < MIN_CID_LEN || len as usize > MAX_CID_LEN {
        return Err(err_enc(T, format!("illegal cid len {}", len)));
    }

    let (seq, i) = chk(dec_varint(payload, i), T, "seq")?;
    let (id_bytes, i) = chk(dec_buf(payload, i, len as usize), T, "cid")?;
    let mut dcid = Cid::from_bytes(id_bytes);
    dcid.seq = seq;
    let (srt, i) = chk(dec_buf(payload, i, SRT_LEN), T, "reset tok")?;
    dcid.srt.copy_from_slice(srt);

    let dup = if seq > c.max_cid_seq_in {
        c.dcids.insert(dcid);
        c.max_cid_seq_in = seq;
        false
    } else {
        true
    };

    logging::debug!(c.log, "rx NEW_CONNECTION_ID";
                    "seq" => seq,
                    "len" => len,
                    "dcid" => %dcid,
                    "dup" => dup);

    Ok(i)
}

fn dec_retire_cid_frame(c: &mut Conn, ctx: &mut EngineCtx, payload: &[u8], pos: usize) -> QuicResult<usize> {
    const T: u8 = FRAM_TYPE_RTIR_CID;
    let (seq, i) = chk(dec_varint(payload, pos + 1), T, "seq")?;

    logging::debug!(c.log, "rx RETIRE_CONNECTION_ID"; "seq" => seq);

    let scid = match c.scids.get(seq) {
        Some(s) => *s,
        None => return Err(err_enc(T, format!("no cid seq {}", seq))),
    };

    if c.act_scid_seq == seq {
        let next_seq = match c.scids.next_after(seq) {
            Some(n) => n.seq,
            None => return Err(err_enc(T, "no next scid")),
        };
        c.act_scid_seq = next_seq;
    }

    c.scids.remove(seq);
    ctx.conns_by_id.remove(&CidKey::from(&scid));

    // rx of RETIRE_CONNECTION_ID means we should send more
    c.tx_ncid = true;
    Ok(i)
}

fn dec_new_token_frame(c: &mut Conn, ctx: &mut EngineCtx, payload: &[u8], pos: usize) -> QuicResult<usize> {
    const T: u8 = FRAM_TYPE_NEW_TOKN;
    let (tok_len, i) = chk(dec_varint(payload, pos + 1), T, "tok len")?;

    if tok_len as usize > payload.len() - i {
        return Err(err_enc(T, "illegal tok len"));
    }
    let (tok, i) = chk(dec_buf(payload, i, tok_len as usize), T, "tok")?;

    logging::debug!(c.log, "rx NEW_TOKEN"; "len" => tok_len);

    // kept for future 0-RTT resumption toward this peer
    ctx.tokens.insert(c.peer, tok.to_vec());
    Ok(i)
}

fn handle_unknown_strm(c: &mut Conn, sid: i64, t: u8, i: usize) -> QuicResult<usize> {
    if sid >= 0 && c.closed_streams.contains(sid as u64) {
        logging::info!(c.log, "ignoring frame for closed stream";
                       "type" => t, "sid" => sid);
        return Ok(i);
    }
    Err(err_enc(t, format!("unknown strm {}", sid)))
}

// encoders

pub fn enc_padding_frame(buf: &mut [u8], pos: usize, len: usize) -> usize {
    if len == 0 {
        return pos;
    }
    for b in buf[pos..pos + len].iter_mut() {
        *b = FRAM_TYPE_PAD;
    }
    pos + len
}

pub fn enc_ping_frame(buf: &mut [u8], pos: usize, frames: &mut u64) -> usize {
    track(frames, FRAM_TYPE_PING);
    enc_u8(buf, pos, FRAM_TYPE_PING)
}

/// Encode all received ranges of the space as an ACK (or ACK_ECN) frame, stop the space's ACK
/// timer and clear its received-frames bitset.
pub fn enc_ack_frame(
    c: &mut Conn,
    ctx: &mut EngineCtx,
    space: Space,
    buf: &mut [u8],
    pos: usize,
    frames: &mut u64,
    lg_acked: &mut Option<u64>,
) -> usize {
    let pn = &c.pn[space as usize];
    let lg_recv = match pn.recv.max() {
        Some(lg) => lg,
        None => return pos,
    };

    let enc_ecn = pn.ect0_cnt > 0 || pn.ect1_cnt > 0 || pn.ce_cnt > 0;
    let t = if enc_ecn { FRAM_TYPE_ACK_ECN } else { FRAM_TYPE_ACK };
    track(frames, FRAM_TYPE_ACK);

    let mut i = enc_u8(buf, pos, t);
    i = enc_varint(buf, i, lg_recv);
    *lg_acked = Some(lg_recv);

    // initial and handshake packets always use the default ACK delay exponent
    let ade = match space {
        Space::Init | Space::Hshk => DEF_ACK_DEL_EXP,
        Space::Data => c.tp_in.ack_del_exp,
    };
    let delay_usec = pn
        .lg_recv_t
        .map_or(0, |t0| ctx.now.saturating_duration_since(t0).as_micros() as u64);
    i = enc_varint(buf, i, delay_usec >> ade);

    let ranges: Vec<(u64, u64)> = pn.recv.iter().rev().collect();
    i = enc_varint(buf, i, ranges.len() as u64 - 1);

    let mut prev_lo: Option<u64> = None;
    for (lo, hi) in ranges {
        if let Some(plo) = prev_lo {
            let gap = plo - hi - 2;
            i = enc_varint(buf, i, gap);
        }
        i = enc_varint(buf, i, hi - lo);
        logging::debug!(c.log, "tx ACK block"; "space" => ?space, "lo" => lo, "hi" => hi);
        prev_lo = Some(lo);
    }

    if enc_ecn {
        i = enc_varint(buf, i, pn.ect0_cnt);
        i = enc_varint(buf, i, pn.ect1_cnt);
        i = enc_varint(buf, i, pn.ce_cnt);
    }

    ctx.timers.cancel(TimerKind::Ack(c.id, space));
    c.pn[space as usize].rx_frames = 0;

    i
}

/// Encode the stream (or crypto) frame header for `v`'s payload, then the payload itself.
/// Retransmissions re-encode without re-counting the bytes as sent.
pub fn enc_stream_or_crypto_frame(
    c: &mut Conn,
    ctx: &mut EngineCtx,
    sid: i64,
    v: BufId,
    rtx: bool,
    buf: &mut [u8],
    pos: usize,
    frames: &mut u64,
) -> usize {
    let crypto = sid < 0;
    let (off, dlen, sds) = {
        let m = ctx.pool.meta(v);
        (m.stream_off, m.stream_data_len, m.stream_data_start)
    };

    let fin = {
        let s = &c.streams[&sid];
        !crypto
            && (ctx.pool.meta(v).fin
                || (s.state == StrmState::HalfClosedLocal || s.state == StrmState::Closed)
                    && s.out.last() == Some(&v))
    };

    // the length is always explicit so padding may follow the frame
    let t = if crypto {
        FRAM_TYPE_CRPT
    } else {
        FRAM_TYPE_STRM
            | F_STREAM_LEN
            | if off > 0 { F_STREAM_OFF } else { 0 }
            | if fin { F_STREAM_FIN } else { 0 }
    };
    track(frames, if crypto { FRAM_TYPE_CRPT } else { FRAM_TYPE_STRM });

    let mut i = enc_u8(buf, pos, t);
    if !crypto {
        i = enc_varint(buf, i, sid as u64);
    }
    if crypto || off > 0 {
        i = enc_varint(buf, i, off);
    }
    i = enc_varint(buf, i, dlen as u64);

    let payload = ctx.pool.raw(v)[sds..sds + dlen].to_vec();
    i = enc_raw(buf, i, &payload);

    {
        let m = ctx.pool.meta_mut(v);
        m.fin = fin;
        m.stream = Some(sid);
    }

    if !rtx {
        c.track_bytes_out(sid, dlen as u64);
    }

    logging::debug!(c.log, "tx stream/crypto frame";
                    "type" => t,
                    "sid" => sid,
                    "off" => off,
                    "len" => dlen,
                    "fin" => fin);

    i
}

pub fn enc_close_frame(c: &mut Conn, buf: &mut [u8], pos: usize, frames: &mut u64) -> usize {
    let t = if c.err_code == 0 {
        FRAM_TYPE_APPL_CLSE
    } else {
        FRAM_TYPE_CONN_CLSE
    };
    track(frames, t);

    let mut i = enc_u8(buf, pos, t);
    i = enc_u16(buf, i, c.err_code);
    if t == FRAM_TYPE_CONN_CLSE {
        i = enc_varint(buf, i, u64::from(c.err_frm));
    }

    let reason = c.err_reason.as_bytes();
    i = enc_varint(buf, i, reason.len() as u64);
    i = enc_raw(buf, i, reason);

    logging::info!(c.log, "tx CLOSE";
                   "app" => t == FRAM_TYPE_APPL_CLSE,
                   "err" => c.err_code,
                   "reason" => &c.err_reason);
    i
}

pub fn enc_max_stream_data_frame(
    c: &mut Conn,
    sid: i64,
    buf: &mut [u8],
    pos: usize,
    frames: &mut u64,
) -> usize {
    track(frames, FRAM_TYPE_MAX_STRM_DATA);
    let s = c.streams.get_mut(&sid).expect("stream exists");

    let mut i = enc_u8(buf, pos, FRAM_TYPE_MAX_STRM_DATA);
    i = enc_varint(buf, i, sid as u64);
    i = enc_varint(buf, i, s.new_in_data_max);

    logging::debug!(c.log, "tx MAX_STREAM_DATA"; "sid" => sid, "max" => s.new_in_data_max);

    s.in_data_max = s.new_in_data_max;
    s.tx_max_stream_data = false;
    i
}

pub fn enc_max_data_frame(c: &mut Conn, buf: &mut [u8], pos: usize, frames: &mut u64) -> usize {
    track(frames, FRAM_TYPE_MAX_DATA);

    let mut i = enc_u8(buf, pos, FRAM_TYPE_MAX_DATA);
    i = enc_varint(buf, i, c.tp_in.new_max_data);

    logging::debug!(c.log, "tx MAX_DATA"; "max" => c.tp_in.new_max_data);

    c.tp_in.max_data = c.tp_in.new_max_data;
    c.tx_max_data = false;
    i
}

pub fn enc_max_stream_id_frame(
    c: &mut Conn,
    buf: &mut [u8],
    pos: usize,
    frames: &mut u64,
    bidi: bool,
) -> usize {
    track(frames, FRAM_TYPE_MAX_SID);

    let new_max = if bidi {
        c.tp_in.new_max_bidi_streams
    } else {
        c.tp_in.new_max_uni_streams
    };
    let max_sid = ((new_max - 1) << 2)
        | if bidi { 0 } else { STRM_FL_UNI }
        | if c.is_clnt { STRM_FL_SRV } else { 0 };

    let mut i = enc_u8(buf, pos, FRAM_TYPE_MAX_SID);
    i = enc_varint(buf, i, max_sid as u64);

    logging::debug!(c.log, "tx MAX_STREAM_ID"; "max" => max_sid);

    if bidi {
        c.tp_in.max_bidi_streams = new_max;
        c.tx_max_sid_bidi = false;
    } else {
        c.tp_in.max_uni_streams = new_max;
        c.tx_max_sid_uni = false;
    }
    i
}

pub fn enc_stream_blocked_frame(
    c: &mut Conn,
    sid: i64,
    buf: &mut [u8],
    pos: usize,
    frames: &mut u64,
) -> usize {
    track(frames, FRAM_TYPE_STRM_BLCK);
    let s = &c.streams[&sid];

    let mut i = enc_u8(buf, pos, FRAM_TYPE_STRM_BLCK);
    i = enc_varint(buf, i, sid as u64);
    i = enc_varint(buf, i, s.out_data);

    logging::debug!(c.log, "tx STREAM_BLOCKED"; "sid" => sid, "off" => s.out_data);
    i
}

pub fn enc_blocked_frame(c: &mut Conn, buf: &mut [u8], pos: usize, frames: &mut u64) -> usize {
    track(frames, FRAM_TYPE_BLCK);

    let mut i = enc_u8(buf, pos, FRAM_TYPE_BLCK);
    i = enc_varint(buf, i, c.tp_out.max_data);

    logging::debug!(c.log, "tx BLOCKED"; "off" => c.tp_out.max_data);
    i
}

pub fn enc_stream_id_blocked_frame(
    c: &mut Conn,
    buf: &mut [u8],
    pos: usize,
    frames: &mut u64,
    bidi: bool,
) -> usize {
    track(frames, FRAM_TYPE_SID_BLCK);

    let ms = (if bidi { c.next_sid_bidi } else { c.next_sid_uni }) - 4;
    let mut i = enc_u8(buf, pos, FRAM_TYPE_SID_BLCK);
    i = enc_varint(buf, i, ms as u64);

    logging::debug!(c.log, "tx STREAM_ID_BLOCKED"; "sid" => ms);
    i
}

pub fn enc_path_response_frame(c: &mut Conn, buf: &mut [u8], pos: usize, frames: &mut u64) -> usize {
    track(frames, FRAM_TYPE_PATH_RESP);

    let mut i = enc_u8(buf, pos, FRAM_TYPE_PATH_RESP);
    i = enc_u64(buf, i, c.path_resp_out);

    logging::debug!(c.log, "tx PATH_RESPONSE"; "data" => c.path_resp_out);
    i
}

pub fn enc_path_challenge_frame(c: &mut Conn, buf: &mut [u8], pos: usize, frames: &mut u64) -> usize {
    track(frames, FRAM_TYPE_PATH_CHLG);

    let mut i = enc_u8(buf, pos, FRAM_TYPE_PATH_CHLG);
    i = enc_u64(buf, i, c.path_chlg_out);

    logging::debug!(c.log, "tx PATH_CHALLENGE"; "data" => c.path_chlg_out);
    i
}

/// Mint a fresh source cid, register it, and announce it to the peer.
pub fn enc_new_cid_frame(
    c: &mut Conn,
    ctx: &mut EngineCtx,
    buf: &mut [u8],
    pos: usize,
    frames: &mut u64,
) -> usize {
    track(frames, FRAM_TYPE_NEW_CID);

    c.max_cid_seq_out += 1;
    let ncid = Cid::random(LOCAL_CID_LEN, c.max_cid_seq_out);
    c.add_scid(ctx, ncid);

    let mut i = enc_u8(buf, pos, FRAM_TYPE_NEW_CID);
    i = enc_u8(buf, i, ncid.len);
    i = enc_varint(buf, i, ncid.seq);
    i = enc_raw(buf, i, ncid.bytes());
    i = enc_raw(buf, i, &ncid.srt);

    logging::debug!(c.log, "tx NEW_CONNECTION_ID"; "seq" => ncid.seq, "cid" => %ncid);

    c.tx_ncid = false;
    i
}

pub fn enc_new_token_frame(c: &mut Conn, buf: &mut [u8], pos: usize, frames: &mut u64) -> usize {
    track(frames, FRAM_TYPE_NEW_TOKN);

    let mut i = enc_u8(buf, pos, FRAM_TYPE_NEW_TOKN);
    i = enc_varint(buf, i, c.new_tok.len() as u64);
    let tok = c.new_tok.clone();
    i = enc_raw(buf, i, &tok);

    logging::debug!(c.log, "tx NEW_TOKEN"; "len" => tok.len());
    i
}

/// Announce every retired destination cid and drop it from the set.
pub fn enc_retire_cid_frames(c: &mut Conn, buf: &mut [u8], pos: usize, frames: &mut u64) -> usize {
    let retired: Vec<u64> = c
        .dcids
        .iter()
        .filter(|d| d.retired)
        .map(|d| d.seq)
        .collect();

    let mut i = pos;
    for seq in retired {
        track(frames, FRAM_TYPE_RTIR_CID);
        i = enc_u8(buf, i, FRAM_TYPE_RTIR_CID);
        i = enc_varint(buf, i, seq);
        c.dcids.remove(seq);
        logging::debug!(c.log, "tx RETIRE_CONNECTION_ID"; "seq" => seq);
    }

    c.tx_retire_cid = false;
    i
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufId;
    use crate::conn::ConnState;
    use crate::engine::{Core, HandshakeFactory};
    use crate::pkt::{F_SH, MAX_PKT_LEN};
    use crate::pn::Space;
    use crate::result::{ErrorUtils, ERR_FLOW_CONTROL};
    use crate::stream::StrmState;
    use crate::tls::testing::StubHandshake;
    use crate::tp::Config;
    use std::time::Instant;

    fn harness() -> (Core, Conn) {
        let mut config = Config::default();
        config.nbufs = 64;
        let factory: HandshakeFactory = Box::new(|is_clnt| Box::new(StubHandshake::new(is_clnt, 1)));
        let core = Core::new(config, factory, &logging::discard());

        let mut c = Conn::new(
            0,
            false,
            0xff00_0004,
            None,
            None,
            "127.0.0.1:4433".parse().unwrap(),
            0,
            0,
            Box::new(StubHandshake::new(false, 1)),
            crate::tp::TransportParams::default(),
            &logging::discard(),
        );
        c.to_state(ConnState::Estb);
        c.tp_out = crate::tp::TransportParams::default();
        (core, c)
    }

    fn ctx_of(core: &mut Core) -> EngineCtx {
        EngineCtx {
            pool: &mut core.pool,
            timers: &mut core.timers,
            conns_by_id: &mut core.conns_by_id,
            conns_by_tuple: &mut core.conns_by_tuple,
            tokens: &mut core.tokens,
            events: &mut core.events,
            now: Instant::now(),
        }
    }

    fn mk_pkt(core: &mut Core, payload: &[u8]) -> BufId {
        let v = core.pool.alloc(0).unwrap();
        core.pool.fill(v, payload);
        core.pool.meta_mut(v).hdr.flags = F_SH;
        core.pool.meta_mut(v).hdr.ptype = F_SH;
        v
    }

    fn stream_frame(sid: u64, off: u64, data: &[u8], fin: bool) -> Vec<u8> {
        let mut buf = vec![0u8; 32 + data.len()];
        let t = FRAM_TYPE_STRM
            | F_STREAM_LEN
            | if off > 0 { F_STREAM_OFF } else { 0 }
            | if fin { F_STREAM_FIN } else { 0 };
        let mut i = enc_u8(&mut buf, 0, t);
        i = enc_varint(&mut buf, i, sid);
        if off > 0 {
            i = enc_varint(&mut buf, i, off);
        }
        i = enc_varint(&mut buf, i, data.len() as u64);
        i = enc_raw(&mut buf, i, data);
        buf.truncate(i);
        buf
    }

    #[test]
    fn test_stream_frame_delivers_in_order() {
        let (mut core, mut c) = harness();
        let v = mk_pkt(&mut core, &stream_frame(0, 0, b"hello", false));

        let mut ctx = ctx_of(&mut core);
        let v = dec_frames(&mut c, &mut ctx, v).unwrap();

        assert_eq!(ctx.pool.meta(v).stream, Some(0));
        let s = &c.streams[&0];
        assert_eq!(s.in_data_off, 5);
        assert_eq!(s.in_q.len(), 1);
        assert!(c.have_new_data);
        assert_eq!(c.in_data, 5);
    }

    #[test]
    fn test_duplicate_stream_frame_is_dropped() {
        let (mut core, mut c) = harness();

        let v = mk_pkt(&mut core, &stream_frame(0, 0, b"hello", false));
        let mut ctx = ctx_of(&mut core);
        dec_frames(&mut c, &mut ctx, v).unwrap();

        let v = mk_pkt(&mut core, &stream_frame(0, 0, b"hello", false));
        let mut ctx = ctx_of(&mut core);
        let v = dec_frames(&mut c, &mut ctx, v).unwrap();

        // the duplicate was not placed in any stream
        assert_eq!(ctx.pool.meta(v).stream, None);
        assert_eq!(c.streams[&0].in_data_off, 5);
        assert_eq!(c.streams[&0].in_q.len(), 1);
    }

    #[test]
    fn test_partial_overlap_is_trimmed() {
        let (mut core, mut c) = harness();

        let v = mk_pkt(&mut core, &stream_frame(0, 0, b"abcd", false));
        let mut ctx = ctx_of(&mut core);
        dec_frames(&mut c, &mut ctx, v).unwrap();

        // bytes 2..8 overlap the first four by two
        let v = mk_pkt(&mut core, &stream_frame(0, 2, b"cdefgh", false));
        let mut ctx = ctx_of(&mut core);
        let v = dec_frames(&mut c, &mut ctx, v).unwrap();

        assert_eq!(c.streams[&0].in_data_off, 8);
        let m = ctx.pool.meta(v);
        assert_eq!(m.stream_off, 4);
        assert_eq!(m.stream_data_len, 4);
    }

    #[test]
    fn test_zero_length_fin_closes_stream() {
        let (mut core, mut c) = harness();

        let mut buf = vec![0u8; 8];
        let t = FRAM_TYPE_STRM | F_STREAM_FIN;
        let mut i = enc_u8(&mut buf, 0, t);
        i = enc_varint(&mut buf, i, 0);
        buf.truncate(i);

        let v = mk_pkt(&mut core, &buf);
        let mut ctx = ctx_of(&mut core);
        dec_frames(&mut c, &mut ctx, v).unwrap();

        assert_eq!(c.streams[&0].state, StrmState::HalfClosedRemote);
        assert!(c.ack_now[Space::Data as usize]);
    }

    #[test]
    fn test_zero_length_without_fin_is_ignored() {
        let (mut core, mut c) = harness();

        let mut buf = vec![0u8; 8];
        let mut i = enc_u8(&mut buf, 0, FRAM_TYPE_STRM);
        i = enc_varint(&mut buf, i, 0);
        buf.truncate(i);

        let v = mk_pkt(&mut core, &buf);
        let mut ctx = ctx_of(&mut core);
        let v = dec_frames(&mut c, &mut ctx, v).unwrap();

        assert_eq!(ctx.pool.meta(v).stream, None);
        assert!(c.streams.get(&0).map_or(true, |s| s.in_data_off == 0));
    }

    #[test]
    fn test_stream_beyond_window_is_flow_control_error() {
        let (mut core, mut c) = harness();

        let far = c.tp_in.max_strm_data_bidi_local + 1;
        let v = mk_pkt(&mut core, &stream_frame(0, far, b"x", false));
        let mut ctx = ctx_of(&mut core);
        let err = dec_frames(&mut c, &mut ctx, v).unwrap_err();

        match err {
            QuicError::Close { code, .. } => assert_eq!(code, ERR_FLOW_CONTROL),
            other => panic!("expected flow control close, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_for_closed_stream_is_ignored() {
        let (mut core, mut c) = harness();
        c.closed_streams.insert(0);

        let v = mk_pkt(&mut core, &stream_frame(0, 0, b"late", false));
        let mut ctx = ctx_of(&mut core);
        let v = dec_frames(&mut c, &mut ctx, v).unwrap();

        assert_eq!(ctx.pool.meta(v).stream, None);
        assert!(c.streams.get(&0).is_none());
    }

    #[test]
    fn test_unknown_frame_type_errors() {
        let (mut core, mut c) = harness();

        let v = mk_pkt(&mut core, &[0x3f, 0, 0]);
        let mut ctx = ctx_of(&mut core);
        let err = dec_frames(&mut c, &mut ctx, v).unwrap_err();

        match err {
            QuicError::Close { code, frame, .. } => {
                assert_eq!(code, ERR_FRAME_ENC);
                assert_eq!(frame, 0x3f);
            }
            other => panic!("expected frame encoding close, got {:?}", other),
        }
    }

    #[test]
    fn test_max_stream_data_never_shrinks() {
        let (mut core, mut c) = harness();
        c.new_stream(0);
        c.streams.get_mut(&0).unwrap().out_data_max = 1000;
        c.streams.get_mut(&0).unwrap().blocked = true;

        let mut buf = vec![0u8; 16];
        let mut i = enc_u8(&mut buf, 0, FRAM_TYPE_MAX_STRM_DATA);
        i = enc_varint(&mut buf, i, 0);
        i = enc_varint(&mut buf, i, 500);
        buf.truncate(i);

        let v = mk_pkt(&mut core, &buf);
        let mut ctx = ctx_of(&mut core);
        dec_frames(&mut c, &mut ctx, v).unwrap();
        assert_eq!(c.streams[&0].out_data_max, 1000);
        assert!(c.streams[&0].blocked);

        let mut buf = vec![0u8; 16];
        let mut i = enc_u8(&mut buf, 0, FRAM_TYPE_MAX_STRM_DATA);
        i = enc_varint(&mut buf, i, 0);
        i = enc_varint(&mut buf, i, 2000);
        buf.truncate(i);

        let v = mk_pkt(&mut core, &buf);
        let mut ctx = ctx_of(&mut core);
        dec_frames(&mut c, &mut ctx, v).unwrap();
        assert_eq!(c.streams[&0].out_data_max, 2000);
        assert!(!c.streams[&0].blocked);
    }

    #[test]
    fn test_new_cid_sequence_dedup() {
        let (mut core, mut c) = harness();
        let before = c.dcids.count();

        let mut frame = vec![0u8; 64];
        let mut i = enc_u8(&mut frame, 0, FRAM_TYPE_NEW_CID);
        i = enc_u8(&mut frame, i, 8);
        i = enc_varint(&mut frame, i, 5);
        i = enc_raw(&mut frame, i, &[0xaa; 8]);
        i = enc_raw(&mut frame, i, &[0xbb; SRT_LEN]);
        frame.truncate(i);

        let v = mk_pkt(&mut core, &frame);
        let mut ctx = ctx_of(&mut core);
        dec_frames(&mut c, &mut ctx, v).unwrap();
        assert_eq!(c.dcids.count(), before + 1);
        assert_eq!(c.max_cid_seq_in, 5);

        // the same sequence again is a dup and changes nothing
        let v = mk_pkt(&mut core, &frame);
        let mut ctx = ctx_of(&mut core);
        dec_frames(&mut c, &mut ctx, v).unwrap();
        assert_eq!(c.dcids.count(), before + 1);
    }

    #[test]
    fn test_new_cid_rejects_bad_length() {
        let (mut core, mut c) = harness();

        let mut frame = vec![0u8; 64];
        let mut i = enc_u8(&mut frame, 0, FRAM_TYPE_NEW_CID);
        i = enc_u8(&mut frame, i, 3); // below the minimum of 4
        i = enc_varint(&mut frame, i, 1);
        frame.truncate(i);

        let v = mk_pkt(&mut core, &frame);
        let mut ctx = ctx_of(&mut core);
        assert!(dec_frames(&mut c, &mut ctx, v).has_failed());
    }

    #[test]
    fn test_ack_roundtrip_updates_recovery() {
        let (mut core, mut c) = harness();

        // six outstanding packets in the application space
        let mut ctx = ctx_of(&mut core);
        for nr in &[1u64, 2, 3, 7, 8, 9] {
            let v = ctx.pool.alloc(0).unwrap();
            let m = ctx.pool.meta_mut(v);
            m.hdr.nr = *nr;
            m.hdr.ptype = F_SH;
            m.tx_len = 100;
            m.tx_t = Some(ctx.now);
            c.pn[Space::Data as usize].sent_pkts.insert(*nr, v);
            c.rec.on_pkt_sent(100, true);
        }
        for nr in &[1u64, 2, 3, 7, 8, 9] {
            c.pn[Space::Data as usize].recv.insert(*nr);
        }
        // the peer view: encode an ACK of everything received
        let mut buf = [0u8; MAX_PKT_LEN];
        let mut frames = 0u64;
        let mut lg = None;
        let end = enc_ack_frame(&mut c, &mut ctx, Space::Data, &mut buf, 0, &mut frames, &mut lg);
        assert!(has_frame(frames, FRAM_TYPE_ACK));
        assert_eq!(lg, Some(9));
        c.pn[Space::Data as usize].recv.clear();

        let v = mk_pkt(&mut core, &buf[..end]);
        let mut ctx = ctx_of(&mut core);
        dec_frames(&mut c, &mut ctx, v).unwrap();

        let pn = &c.pn[Space::Data as usize];
        for nr in &[1u64, 2, 3, 7, 8, 9] {
            assert!(pn.acked.contains(*nr), "nr {} not acked", nr);
        }
        assert!(pn.sent_pkts.is_empty());
        assert_eq!(c.rec.in_flight, 0);
    }

    #[test]
    fn test_ack_block_longer_than_predecessor_errors() {
        let (mut core, mut c) = harness();

        let mut buf = [0u8; 32];
        let mut i = enc_u8(&mut buf, 0, FRAM_TYPE_ACK);
        i = enc_varint(&mut buf, i, 5); // largest
        i = enc_varint(&mut buf, i, 0); // delay
        i = enc_varint(&mut buf, i, 0); // block count
        i = enc_varint(&mut buf, i, 9); // first block longer than largest

        let v = mk_pkt(&mut core, &buf[..i]);
        let mut ctx = ctx_of(&mut core);
        assert!(dec_frames(&mut c, &mut ctx, v).has_failed());
    }

    #[test]
    fn test_padding_is_coalesced_and_tracked() {
        let (mut core, mut c) = harness();

        let mut payload = vec![0u8; 16]; // all PADDING
        payload.push(FRAM_TYPE_PING);

        let v = mk_pkt(&mut core, &payload);
        let mut ctx = ctx_of(&mut core);
        let v = dec_frames(&mut c, &mut ctx, v).unwrap();

        let frames = ctx.pool.meta(v).frames;
        assert!(has_frame(frames, FRAM_TYPE_PAD));
        assert!(has_frame(frames, FRAM_TYPE_PING));
        assert!(!is_ack_only(frames));
        assert!(c.needs_tx);
    }

    #[test]
    fn test_path_challenge_sets_response() {
        let (mut core, mut c) = harness();

        let mut buf = [0u8; 16];
        let mut i = enc_u8(&mut buf, 0, FRAM_TYPE_PATH_CHLG);
        i = enc_u64(&mut buf, i, 0xdead_beef_cafe_f00d);

        let v = mk_pkt(&mut core, &buf[..i]);
        let mut ctx = ctx_of(&mut core);
        dec_frames(&mut c, &mut ctx, v).unwrap();

        assert_eq!(c.path_resp_out, 0xdead_beef_cafe_f00d);
        assert!(c.tx_path_resp);

        // the matching response clears an outstanding challenge
        c.path_chlg_out = 0x1234;
        c.tx_path_chlg = true;
        let mut buf = [0u8; 16];
        let mut i = enc_u8(&mut buf, 0, FRAM_TYPE_PATH_RESP);
        i = enc_u64(&mut buf, i, 0x1234);

        let v = mk_pkt(&mut core, &buf[..i]);
        let mut ctx = ctx_of(&mut core);
        dec_frames(&mut c, &mut ctx, v).unwrap();
        assert!(!c.tx_path_chlg);
    }

    #[test]
    fn test_is_ack_only() {
        let mut frames = 0u64;
        assert!(!is_ack_only(frames));
        track(&mut frames, FRAM_TYPE_ACK);
        assert!(is_ack_only(frames));
        track(&mut frames, FRAM_TYPE_PAD);
        assert!(is_ack_only(frames));
        track(&mut frames, FRAM_TYPE_STRM);
        assert!(!is_ack_only(frames));
    }
}
