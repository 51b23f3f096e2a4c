//! A QUIC transport endpoint (draft-ietf-quic-transport-04 era, version 0xff000004) for both
//! client and server roles over UDP.
//!
//! The crate is organized around three pipelines: connection dispatch and state
//! ([`conn`]/[`engine`]), packet-number spaces with the frame codec and stream reassembly
//! ([`pn`]/[`frame`]/[`stream`]), and the TX path with retransmission, coalescing and
//! congestion awareness ([`conn`]/[`pkt`]). The TLS record layer, AEAD primitives and loss
//! recovery are collaborators behind the [`tls`], [`lumen::crypto`] and [`recovery`]
//! interfaces.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]

pub mod buffer;
pub mod cid;
pub mod conn;
pub mod diet;
pub mod engine;
pub mod frame;
pub mod io;
pub mod marshall;
pub mod pkt;
pub mod pn;
pub mod recovery;
pub mod result;
pub mod stream;
pub mod timer;
pub mod tls;
pub mod tp;

pub use crate::engine::Quic;
pub use crate::result::{QuicError, QuicResult};
pub use crate::tp::Config;
