//! Packet-protection primitives over libsodium's ChaCha20-Poly1305 IETF construction.
//!
//! Nonces never travel on the wire: both sides derive them from the packet's protection epoch
//! and packet number, so distinct epochs cannot reuse a nonce even when packet numbers restart
//! after a version-negotiation or retry round trip. The packet header is bound as additional
//! data, which makes any header tampering fail authentication.

use byteorder::{BigEndian, ByteOrder};
use ctor::ctor;
use libsodium_sys as sodium;

pub const KEY_LEN: usize = sodium::crypto_aead_chacha20poly1305_IETF_KEYBYTES as usize;
pub const TAG_LEN: usize = sodium::crypto_aead_chacha20poly1305_IETF_ABYTES as usize;
pub const NONCE_LEN: usize = sodium::crypto_aead_chacha20poly1305_IETF_NPUBBYTES as usize;

#[ctor]
fn init_sodium() {
    unsafe {
        if sodium::sodium_init() < 0 {
            panic!("libsodium failed to initialize")
        }
    }
}

/// Nonce for a protected packet: the epoch tag leads, the packet number fills the trailing
/// eight bytes big-endian.
fn pkt_nonce(epoch: u8, nr: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[0] = epoch;
    BigEndian::write_u64(&mut nonce[NONCE_LEN - 8..], nr);
    nonce
}

/// Seal a packet payload under an epoch key. `cipher` must hold the payload plus `TAG_LEN`
/// bytes of authentication tag; the header goes in as additional data. Packet sizing is the
/// caller's arithmetic, so a mismatched ciphertext length fails the seal rather than panicking.
pub fn seal(
    cipher: &mut [u8],
    plain: &[u8],
    header: &[u8],
    epoch: u8,
    nr: u64,
    key: &[u8; KEY_LEN],
) -> bool {
    if cipher.len() != plain.len() + TAG_LEN {
        return false;
    }

    let nonce = pkt_nonce(epoch, nr);
    unsafe {
        sodium::crypto_aead_chacha20poly1305_ietf_encrypt(
            cipher.as_mut_ptr(),
            std::ptr::null_mut(),
            plain.as_ptr(),
            plain.len() as u64,
            header.as_ptr(),
            header.len() as u64,
            std::ptr::null(),
            nonce.as_ptr(),
            key.as_ptr(),
        ) == 0
    }
}

/// Open a sealed payload. Fails when the key, epoch, packet number or header do not match the
/// sealing side, or when `plain` is not exactly `cipher` minus the tag.
pub fn open(
    plain: &mut [u8],
    cipher: &[u8],
    header: &[u8],
    epoch: u8,
    nr: u64,
    key: &[u8; KEY_LEN],
) -> bool {
    if cipher.len() != plain.len() + TAG_LEN {
        return false;
    }

    let nonce = pkt_nonce(epoch, nr);
    unsafe {
        sodium::crypto_aead_chacha20poly1305_ietf_decrypt(
            plain.as_mut_ptr(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            cipher.as_ptr(),
            cipher.len() as u64,
            header.as_ptr(),
            header.len() as u64,
            nonce.as_ptr(),
            key.as_ptr(),
        ) == 0
    }
}

/// Produces `out.len()` bytes of the ChaCha20 keystream for the given key, nonce and starting
/// block counter. Used for header-protection masks and deterministic key expansion.
pub fn keystream(out: &mut [u8], key: &[u8; KEY_LEN], nonce: &[u8; 12], counter: u32) {
    for b in out.iter_mut() {
        *b = 0;
    }

    unsafe {
        if sodium::crypto_stream_chacha20_ietf_xor_ic(
            out.as_mut_ptr(),
            out.as_ptr(),
            out.len() as u64,
            nonce.as_ptr(),
            counter,
            key.as_ptr(),
        ) != 0
        {
            panic!("keystream generation failed")
        }
    }
}

/// Fill a buffer with cryptographically secure random bytes.
pub fn rand_fill(out: &mut [u8]) {
    unsafe {
        sodium::randombytes_buf(out.as_mut_ptr() as *mut std::ffi::c_void, out.len());
    }
}

/// A uniformly random 64-bit value, for path challenges and similar probes.
pub fn rand_u64() -> u64 {
    let mut bytes = [0u8; 8];
    rand_fill(&mut bytes);
    BigEndian::read_u64(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_LEN] = [7; KEY_LEN];

    #[test]
    fn test_seal_open_roundtrip() {
        let header = [0x7f, 0xff, 0x00, 0x00, 0x04];
        let plain = b"frame bytes";

        let mut cipher = vec![0u8; plain.len() + TAG_LEN];
        assert!(seal(&mut cipher, plain, &header, 2, 42, &KEY));

        let mut opened = vec![0u8; plain.len()];
        assert!(open(&mut opened, &cipher, &header, 2, 42, &KEY));
        assert_eq!(&opened[..], &plain[..]);
    }

    #[test]
    fn test_open_rejects_wrong_pkt_nr() {
        let plain = b"payload";
        let mut cipher = vec![0u8; plain.len() + TAG_LEN];
        assert!(seal(&mut cipher, plain, &[], 0, 1, &KEY));

        let mut opened = vec![0u8; plain.len()];
        assert!(!open(&mut opened, &cipher, &[], 0, 2, &KEY));
    }

    #[test]
    fn test_open_rejects_wrong_epoch() {
        // the same packet number in a different epoch is a different nonce
        let plain = b"payload";
        let mut cipher = vec![0u8; plain.len() + TAG_LEN];
        assert!(seal(&mut cipher, plain, &[], 1, 5, &KEY));

        let mut opened = vec![0u8; plain.len()];
        assert!(!open(&mut opened, &cipher, &[], 3, 5, &KEY));
    }

    #[test]
    fn test_open_rejects_tampered_header() {
        let plain = b"payload";
        let mut cipher = vec![0u8; plain.len() + TAG_LEN];
        assert!(seal(&mut cipher, plain, &[0x30], 3, 9, &KEY));

        let mut opened = vec![0u8; plain.len()];
        assert!(!open(&mut opened, &cipher, &[0x31], 3, 9, &KEY));
    }

    #[test]
    fn test_size_mismatch_fails_cleanly() {
        let mut cipher = vec![0u8; 4]; // no room for the tag
        assert!(!seal(&mut cipher, b"data", &[], 0, 0, &KEY));

        let mut opened = vec![0u8; 4];
        assert!(!open(&mut opened, &cipher, &[], 0, 0, &KEY));
    }

    #[test]
    fn test_keystream_is_deterministic() {
        let nonce = [5u8; 12];

        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        keystream(&mut a, &KEY, &nonce, 1);
        keystream(&mut b, &KEY, &nonce, 1);

        assert_eq!(a, b);
        assert_ne!(a, [0u8; 16]);

        let mut c = [0u8; 16];
        keystream(&mut c, &KEY, &nonce, 2);
        assert_ne!(a, c);
    }

    #[test]
    fn test_rand_fill_and_u64() {
        let mut out = [0u8; 32];
        rand_fill(&mut out);
        assert_ne!(out, [0u8; 32]);

        assert_ne!(rand_u64(), rand_u64());
    }
}
