//! Fixed-capacity packet buffer pool with per-buffer metadata sidecars.
//!
//! Every buffer has a `PktMeta` record living at the same index, so queues, trees and
//! retransmit links can refer to a packet by a single `BufId`. The data region reserves a
//! persistent offset in front of stream payloads so packet headers and control frames can be
//! encoded without moving the payload bytes.

use crate::pkt::{Hdr, MAX_PKT_LEN};
use std::time::Instant;

pub type BufId = usize;

/// Room reserved in front of the payload for header and frame encoding.
pub const DATA_OFFSET: usize = 64;

pub const BUF_LEN: usize = DATA_OFFSET + MAX_PKT_LEN;

/// Per-buffer packet bookkeeping. Lives at the buffer's pool index.
#[derive(Debug, Clone, Default)]
pub struct PktMeta {
    pub hdr: Hdr,

    /// Bitset of frame types observed in (or encoded into) the packet.
    pub frames: u64,

    /// Stream this buffer's payload belongs to, if any.
    pub stream: Option<i64>,
    pub stream_off: u64,
    /// Absolute offset of the stream payload within the buffer data.
    pub stream_data_start: usize,
    pub stream_data_len: usize,
    pub stream_header_pos: usize,
    pub fin: bool,

    pub is_rtx: bool,
    pub is_acked: bool,
    pub is_lost: bool,

    /// Wire length of the packet this buffer was last transmitted as; zero means never sent.
    pub tx_len: usize,
    pub tx_t: Option<Instant>,
    /// Largest packet number acknowledged by an ACK frame carried in this packet.
    pub lg_acked: Option<u64>,

    /// Reciprocal retransmit link: original and copy point at each other.
    pub rtx: Option<BufId>,
}

struct Buf {
    data: Box<[u8; BUF_LEN]>,
    start: usize,
    len: usize,
}

/// The pool. Buffers and metadata are preallocated; allocation hands out an index into both.
pub struct Pool {
    bufs: Vec<Buf>,
    meta: Vec<PktMeta>,
    free: Vec<BufId>,
}

impl Pool {
    pub fn new(nbufs: usize) -> Pool {
        let mut bufs = Vec::with_capacity(nbufs);
        let mut meta = Vec::with_capacity(nbufs);
        let mut free = Vec::with_capacity(nbufs);

        for id in 0..nbufs {
            bufs.push(Buf {
                data: Box::new([0; BUF_LEN]),
                start: DATA_OFFSET,
                len: 0,
            });
            meta.push(PktMeta::default());
            free.push(nbufs - 1 - id);
        }

        Pool { bufs, meta, free }
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Allocate a buffer with its view starting at `off`. The metadata is reset; the data bytes
    /// are not cleared.
    pub fn alloc(&mut self, off: usize) -> Option<BufId> {
        let id = self.free.pop()?;
        let buf = &mut self.bufs[id];
        buf.start = off;
        buf.len = 0;
        self.meta[id] = PktMeta::default();
        Some(id)
    }

    /// Return a buffer to the pool. Freeing also severs an RTX pair.
    pub fn free(&mut self, id: BufId) {
        if let Some(other) = self.meta[id].rtx.take() {
            self.meta[other].rtx = None;
        }
        self.meta[id] = PktMeta::default();
        debug_assert!(!self.free.contains(&id), "double free of buffer {}", id);
        self.free.push(id);
    }

    /// Deep copy: data, view and metadata. The copy starts without an RTX link.
    pub fn dup(&mut self, id: BufId) -> Option<BufId> {
        let copy = self.free.pop()?;

        let (src, dst) = index_two(&mut self.bufs, id, copy);
        dst.data.copy_from_slice(&src.data[..]);
        dst.start = src.start;
        dst.len = src.len;

        self.meta[copy] = self.meta[id].clone();
        self.meta[copy].rtx = None;
        Some(copy)
    }

    /// Join two buffers as a retransmit pair.
    pub fn link_rtx(&mut self, a: BufId, b: BufId) {
        self.meta[a].rtx = Some(b);
        self.meta[b].rtx = Some(a);
    }

    #[inline]
    pub fn meta(&self, id: BufId) -> &PktMeta {
        &self.meta[id]
    }

    #[inline]
    pub fn meta_mut(&mut self, id: BufId) -> &mut PktMeta {
        &mut self.meta[id]
    }

    /// The buffer's current view.
    #[inline]
    pub fn buf(&self, id: BufId) -> &[u8] {
        let b = &self.bufs[id];
        &b.data[b.start..b.start + b.len]
    }

    #[inline]
    pub fn buf_mut(&mut self, id: BufId) -> &mut [u8] {
        let b = &mut self.bufs[id];
        &mut b.data[b.start..b.start + b.len]
    }

    /// The whole data region, ignoring the view. Used when encoding headers in front of payload.
    #[inline]
    pub fn raw_mut(&mut self, id: BufId) -> &mut [u8] {
        &mut self.bufs[id].data[..]
    }

    #[inline]
    pub fn raw(&self, id: BufId) -> &[u8] {
        &self.bufs[id].data[..]
    }

    #[inline]
    pub fn view(&self, id: BufId) -> (usize, usize) {
        let b = &self.bufs[id];
        (b.start, b.len)
    }

    /// Narrow or move the buffer view.
    pub fn set_view(&mut self, id: BufId, start: usize, len: usize) {
        debug_assert!(start + len <= BUF_LEN);
        let b = &mut self.bufs[id];
        b.start = start;
        b.len = len;
    }

    /// Copy `data` into the buffer at its view start and set the view length.
    pub fn fill(&mut self, id: BufId, data: &[u8]) {
        let b = &mut self.bufs[id];
        debug_assert!(b.start + data.len() <= BUF_LEN);
        b.data[b.start..b.start + data.len()].copy_from_slice(data);
        b.len = data.len();
    }

    /// Both the mutable view and the metadata, for callers that need to update them together.
    pub fn buf_and_meta_mut(&mut self, id: BufId) -> (&mut [u8], &mut PktMeta) {
        let b = &mut self.bufs[id];
        (&mut b.data[b.start..b.start + b.len], &mut self.meta[id])
    }
}

fn index_two<T>(items: &mut [T], a: usize, b: usize) -> (&mut T, &mut T) {
    debug_assert!(a != b);
    if a < b {
        let (left, right) = items.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = items.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_reuses_slots() {
        let mut pool = Pool::new(2);
        let a = pool.alloc(DATA_OFFSET).unwrap();
        let b = pool.alloc(DATA_OFFSET).unwrap();
        assert!(pool.alloc(DATA_OFFSET).is_none());

        pool.free(a);
        let c = pool.alloc(0).unwrap();
        assert_eq!(c, a);
        assert_eq!(pool.available(), 0);

        pool.free(b);
        pool.free(c);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_alloc_resets_meta_but_keeps_offset_semantics() {
        let mut pool = Pool::new(1);
        let id = pool.alloc(DATA_OFFSET).unwrap();
        pool.meta_mut(id).stream = Some(4);
        pool.meta_mut(id).is_lost = true;
        pool.free(id);

        let id = pool.alloc(DATA_OFFSET).unwrap();
        assert_eq!(pool.meta(id).stream, None);
        assert!(!pool.meta(id).is_lost);
        assert_eq!(pool.view(id), (DATA_OFFSET, 0));
    }

    #[test]
    fn test_fill_and_view() {
        let mut pool = Pool::new(1);
        let id = pool.alloc(DATA_OFFSET).unwrap();
        pool.fill(id, b"hello");
        assert_eq!(pool.buf(id), b"hello");

        // narrow the view to the payload tail
        let (start, _) = pool.view(id);
        pool.set_view(id, start + 1, 3);
        assert_eq!(pool.buf(id), b"ell");
    }

    #[test]
    fn test_rtx_links_are_reciprocal_and_severed_on_free() {
        let mut pool = Pool::new(2);
        let a = pool.alloc(DATA_OFFSET).unwrap();
        let b = pool.alloc(DATA_OFFSET).unwrap();

        pool.link_rtx(a, b);
        assert_eq!(pool.meta(a).rtx, Some(b));
        assert_eq!(pool.meta(b).rtx, Some(a));

        pool.free(a);
        assert_eq!(pool.meta(b).rtx, None);
    }

    #[test]
    fn test_dup_copies_data_and_meta() {
        let mut pool = Pool::new(2);
        let a = pool.alloc(DATA_OFFSET).unwrap();
        pool.fill(a, b"payload");
        pool.meta_mut(a).stream = Some(8);
        pool.meta_mut(a).stream_off = 100;

        let b = pool.dup(a).unwrap();
        assert_eq!(pool.buf(b), b"payload");
        assert_eq!(pool.meta(b).stream, Some(8));
        assert_eq!(pool.meta(b).stream_off, 100);
        assert_eq!(pool.meta(b).rtx, None);
    }
}
