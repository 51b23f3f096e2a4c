//! The TLS record-layer collaborator.
//!
//! The handshake itself is external: the connection feeds it bytes arriving on the crypto
//! streams and transmits whatever it wants to emit, per epoch. It is also the source of the
//! per-epoch AEAD key sets the packet codec consumes opaquely. Initial-epoch keys are not
//! secret; both sides derive them deterministically from the client's first destination cid.

use crate::cid::Cid;
use crate::pn::Epoch;
use crate::tp::TransportParams;
use lumen::crypto::{self, KEY_LEN};

/// One epoch's packet-protection material: AEAD keys plus header-protection keys, one pair per
/// direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySet {
    pub seal: [u8; KEY_LEN],
    pub seal_hp: [u8; KEY_LEN],
    pub open: [u8; KEY_LEN],
    pub open_hp: [u8; KEY_LEN],
}

/// Crypto bytes the handshake wants transmitted, per epoch, plus whether it advanced.
#[derive(Debug, Default)]
pub struct TlsOutput {
    pub emit: Vec<(Epoch, Vec<u8>)>,
    pub progressed: bool,
}

/// External TLS 1.3 record layer driving the three crypto streams.
pub trait Handshake: Send {
    /// Client-side first flight.
    fn initiate(&mut self) -> TlsOutput;

    /// Feed reassembled crypto-stream bytes for `epoch`. An `Err` carries the TLS alert code.
    fn io(&mut self, epoch: Epoch, data: &[u8]) -> Result<TlsOutput, u8>;

    /// Key material for an epoch, once the handshake has derived it.
    fn keys(&self, epoch: Epoch) -> Option<&KeySet>;

    fn is_complete(&self) -> bool;

    /// The peer's transport parameters, carried in the handshake's extension block. Available
    /// once the handshake completed.
    fn peer_params(&self) -> Option<TransportParams> {
        None
    }

    /// Whether the peer accepted 0-RTT.
    fn zero_rtt_accepted(&self) -> bool {
        false
    }

    /// Restart after version negotiation or retry.
    fn reset(&mut self);
}

fn expand(seed: &[u8], label: &[u8; 12]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    for (i, b) in seed.iter().enumerate() {
        key[i % KEY_LEN] ^= *b;
    }

    let mut out = [0u8; KEY_LEN];
    crypto::keystream(&mut out, &key, label, 0);
    out
}

/// Initial-epoch keys, derived from the client's original destination cid. The client seals
/// with the "client in" secret and opens with the "server in" secret; the server does the
/// reverse.
pub fn initial_keys(odcid: &Cid, is_clnt: bool) -> KeySet {
    let client = expand(odcid.bytes(), b"client in\0\0\0");
    let client_hp = expand(odcid.bytes(), b"client hp\0\0\0");
    let server = expand(odcid.bytes(), b"server in\0\0\0");
    let server_hp = expand(odcid.bytes(), b"server hp\0\0\0");

    if is_clnt {
        KeySet {
            seal: client,
            seal_hp: client_hp,
            open: server,
            open_hp: server_hp,
        }
    } else {
        KeySet {
            seal: server,
            seal_hp: server_hp,
            open: client,
            open_hp: client_hp,
        }
    }
}
