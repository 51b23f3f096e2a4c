//! UDP socket abstraction over the mio non-blocking sockets the event loop polls.

use crate::pkt::MAX_PKT_LEN;
use crate::result::QuicResult;
use mio::net::UdpSocket;
use std::net::SocketAddr;

pub struct Socket {
    sock: UdpSocket,
    port: u16,
    connected: Option<SocketAddr>,
}

impl Socket {
    /// Bind to the given local port; zero picks an ephemeral one.
    pub fn bind(port: u16) -> QuicResult<Socket> {
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse().expect("valid bind addr");
        let sock = UdpSocket::bind(&addr)?;
        let port = sock.local_addr()?.port();
        Ok(Socket {
            sock,
            port,
            connected: None,
        })
    }

    /// Bind an ephemeral port directed at a single peer.
    pub fn connect(peer: SocketAddr) -> QuicResult<Socket> {
        let mut sock = Socket::bind(0)?;
        sock.connected = Some(peer);
        Ok(sock)
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Connected sockets belong to a client connection; unconnected ones accept new peers.
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.is_some()
    }

    #[inline]
    pub fn mtu(&self) -> usize {
        MAX_PKT_LEN
    }

    /// Non-blocking receive; `Err(Need)` when the socket would block.
    pub fn recv(&self, buf: &mut [u8]) -> QuicResult<(usize, SocketAddr)> {
        let (len, peer) = self.sock.recv_from(buf)?;
        Ok((len, peer))
    }

    pub fn send(&self, peer: SocketAddr, data: &[u8]) -> QuicResult<usize> {
        let sent = self.sock.send_to(data, &peer)?;
        Ok(sent)
    }

    #[inline]
    pub fn raw(&self) -> &UdpSocket {
        &self.sock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::QuicError;

    #[test]
    fn test_bind_ephemeral() {
        let sock = Socket::bind(0).unwrap();
        assert_ne!(sock.port(), 0);
        assert!(!sock.is_connected());
        assert_eq!(sock.mtu(), MAX_PKT_LEN);
    }

    #[test]
    fn test_recv_would_block_is_need() {
        let sock = Socket::bind(0).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(sock.recv(&mut buf).unwrap_err(), QuicError::Need);
    }

    #[test]
    fn test_loopback_roundtrip() {
        let a = Socket::bind(0).unwrap();
        let b = Socket::bind(0).unwrap();
        let b_addr: SocketAddr = format!("127.0.0.1:{}", b.port()).parse().unwrap();

        a.send(b_addr, b"ping").unwrap();

        // non-blocking receive; allow the datagram a moment to arrive
        let mut buf = [0u8; 64];
        let mut got = None;
        for _ in 0..100 {
            match b.recv(&mut buf) {
                Ok((len, _)) => {
                    got = Some(len);
                    break;
                }
                Err(QuicError::Need) => std::thread::sleep(std::time::Duration::from_millis(1)),
                Err(e) => panic!("recv failed: {}", e),
            }
        }
        assert_eq!(got, Some(4));
        assert_eq!(&buf[..4], b"ping");
    }
}
