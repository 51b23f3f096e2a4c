//! Connection identifiers and the per-connection ordered cid sets.
//!
//! Each side of a connection holds a set of source cids (identifiers the peer addresses us by)
//! and a set of destination cids (identifiers we address the peer by), both ordered by a 62-bit
//! sequence number. Source cids are additionally indexed by their raw bytes for inbound lookup.

use lumen::crypto;
use std::collections::BTreeMap;
use std::fmt;

use hashbrown::HashMap;

pub const MIN_CID_LEN: usize = 4;
pub const MAX_CID_LEN: usize = 18;
pub const SRT_LEN: usize = 16;

/// Length of locally generated cids, both roles. Short headers carry no cid length on the wire,
/// so the local length must be fixed and known.
pub const LOCAL_CID_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cid {
    pub len: u8,
    pub id: [u8; MAX_CID_LEN],
    pub seq: u64,
    /// Stateless reset token travelling with NEW_CONNECTION_ID.
    pub srt: [u8; SRT_LEN],
    pub retired: bool,
}

impl Cid {
    pub fn empty() -> Cid {
        Cid {
            len: 0,
            id: [0; MAX_CID_LEN],
            seq: 0,
            srt: [0; SRT_LEN],
            retired: false,
        }
    }

    /// A fresh random cid of the given length, with a random reset token.
    pub fn random(len: usize, seq: u64) -> Cid {
        let mut cid = Cid::empty();
        cid.len = len as u8;
        cid.seq = seq;
        crypto::rand_fill(&mut cid.id[..len]);
        crypto::rand_fill(&mut cid.srt);
        cid
    }

    pub fn from_bytes(bytes: &[u8]) -> Cid {
        let mut cid = Cid::empty();
        cid.len = bytes.len() as u8;
        cid.id[..bytes.len()].copy_from_slice(bytes);
        cid
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.id[..self.len as usize]
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when the id bytes match, regardless of sequence or token.
    #[inline]
    pub fn same_id(&self, other: &Cid) -> bool {
        self.bytes() == other.bytes()
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in self.bytes() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Hashable key over the raw id bytes, used by the global and per-connection id indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CidKey {
    len: u8,
    id: [u8; MAX_CID_LEN],
}

impl From<&Cid> for CidKey {
    fn from(cid: &Cid) -> CidKey {
        CidKey {
            len: cid.len,
            id: cid.id,
        }
    }
}

/// One direction's cid set: ordered by sequence number, with a byte index for lookups.
#[derive(Debug, Default)]
pub struct CidSet {
    by_seq: BTreeMap<u64, Cid>,
    by_id: HashMap<CidKey, u64>,
}

impl CidSet {
    pub fn new() -> CidSet {
        CidSet {
            by_seq: BTreeMap::new(),
            by_id: HashMap::new(),
        }
    }

    /// Insert a cid. Returns false (and changes nothing) when the sequence number is already
    /// present.
    pub fn insert(&mut self, cid: Cid) -> bool {
        if self.by_seq.contains_key(&cid.seq) {
            return false;
        }
        self.by_id.insert(CidKey::from(&cid), cid.seq);
        self.by_seq.insert(cid.seq, cid);
        true
    }

    pub fn remove(&mut self, seq: u64) -> Option<Cid> {
        let cid = self.by_seq.remove(&seq)?;
        self.by_id.remove(&CidKey::from(&cid));
        Some(cid)
    }

    #[inline]
    pub fn get(&self, seq: u64) -> Option<&Cid> {
        self.by_seq.get(&seq)
    }

    #[inline]
    pub fn get_mut(&mut self, seq: u64) -> Option<&mut Cid> {
        self.by_seq.get_mut(&seq)
    }

    pub fn get_by_id(&self, id: &Cid) -> Option<&Cid> {
        let seq = self.by_id.get(&CidKey::from(id))?;
        self.by_seq.get(seq)
    }

    /// Smallest sequence number strictly greater than `seq`.
    pub fn next_after(&self, seq: u64) -> Option<&Cid> {
        self.by_seq.range(seq + 1..).next().map(|(_, cid)| cid)
    }

    #[inline]
    pub fn max_seq(&self) -> Option<u64> {
        self.by_seq.keys().next_back().copied()
    }

    #[inline]
    pub fn min_seq(&self) -> Option<u64> {
        self.by_seq.keys().next().copied()
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.by_seq.len()
    }

    /// Number of cids the peer has not retired yet.
    pub fn count_unretired(&self) -> usize {
        self.by_seq.values().filter(|cid| !cid.retired).count()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &Cid> {
        self.by_seq.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(seq: u64, fill: u8) -> Cid {
        let mut c = Cid::from_bytes(&[fill; LOCAL_CID_LEN]);
        c.seq = seq;
        c
    }

    #[test]
    fn test_insert_rejects_duplicate_seq() {
        let mut set = CidSet::new();
        assert!(set.insert(cid(1, 0xaa)));
        assert!(!set.insert(cid(1, 0xbb)));
        assert_eq!(set.count(), 1);
        assert_eq!(set.get(1).unwrap().id[0], 0xaa);
    }

    #[test]
    fn test_lookup_by_id_bytes() {
        let mut set = CidSet::new();
        set.insert(cid(3, 0x11));
        set.insert(cid(7, 0x22));

        let probe = Cid::from_bytes(&[0x22; LOCAL_CID_LEN]);
        assert_eq!(set.get_by_id(&probe).unwrap().seq, 7);

        let missing = Cid::from_bytes(&[0x33; LOCAL_CID_LEN]);
        assert!(set.get_by_id(&missing).is_none());
    }

    #[test]
    fn test_next_after_and_max() {
        let mut set = CidSet::new();
        set.insert(cid(0, 1));
        set.insert(cid(2, 2));
        set.insert(cid(5, 3));

        assert_eq!(set.next_after(0).unwrap().seq, 2);
        assert_eq!(set.next_after(2).unwrap().seq, 5);
        assert!(set.next_after(5).is_none());
        assert_eq!(set.max_seq(), Some(5));
        assert_eq!(set.min_seq(), Some(0));
    }

    #[test]
    fn test_remove_unindexes() {
        let mut set = CidSet::new();
        set.insert(cid(1, 0x44));
        let removed = set.remove(1).unwrap();
        assert_eq!(removed.seq, 1);
        assert!(set.get_by_id(&removed).is_none());
        assert_eq!(set.count(), 0);
    }

    #[test]
    fn test_random_cid_shape() {
        let c = Cid::random(LOCAL_CID_LEN, 9);
        assert_eq!(c.bytes().len(), LOCAL_CID_LEN);
        assert_eq!(c.seq, 9);
        assert!(!c.is_empty());
    }
}
