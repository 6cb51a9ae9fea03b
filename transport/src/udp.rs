//! Non-Blocking UDP Sockets
//!
//! Thin wrappers over `std::net::UdpSocket` exposing the two operations the
//! shards use: a poll-style receive that returns immediately when nothing is
//! queued, and a fire-and-forget send.

use std::io;
use std::net::UdpSocket;

use tracing::info;

use crate::TransportError;

/// Receiving socket for one port.
pub struct UdpServer {
    socket: UdpSocket,
}

impl UdpServer {
    /// Bind a non-blocking socket on `addr:port`.
    pub fn bind(addr: &str, port: u16) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind((addr, port))?;
        socket.set_nonblocking(true)?;
        info!("udp server listening on {addr}:{port}");
        Ok(UdpServer { socket })
    }

    /// Try to receive one datagram. Returns `Ok(None)` when the queue is
    /// empty so callers can move on to the next socket without blocking.
    pub fn recv_nonblocking(&self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        match self.socket.recv(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Sending socket, optionally connected to a fixed peer.
pub struct UdpClient {
    socket: UdpSocket,
}

impl UdpClient {
    /// Unconnected client on an ephemeral port.
    pub fn new() -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        Ok(UdpClient { socket })
    }

    /// Client connected to `addr:port`; use [`UdpClient::send`].
    pub fn connect(addr: &str, port: u16) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect((addr, port))?;
        Ok(UdpClient { socket })
    }

    /// Send on a connected socket.
    pub fn send(&self, buf: &[u8]) -> Result<(), TransportError> {
        self.socket.send(buf)?;
        Ok(())
    }

    /// Send to an explicit destination.
    pub fn send_to(&self, addr: &str, port: u16, buf: &[u8]) -> Result<(), TransportError> {
        self.socket.send_to(buf, (addr, port))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recv_nonblocking_empty() {
        let server = UdpServer::bind("127.0.0.1", 0).unwrap();
        let mut buf = [0u8; 64];
        assert!(matches!(server.recv_nonblocking(&mut buf), Ok(None)));
    }

    #[test]
    fn test_loopback_send_recv() {
        let server = UdpServer::bind("127.0.0.1", 0).unwrap();
        let port = server.socket.local_addr().unwrap().port();
        let client = UdpClient::new().unwrap();
        client.send_to("127.0.0.1", port, b"ping").unwrap();

        let mut buf = [0u8; 64];
        let mut got = None;
        for _ in 0..1000 {
            if let Some(n) = server.recv_nonblocking(&mut buf).unwrap() {
                got = Some(n);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(got, Some(4));
        assert_eq!(&buf[..4], b"ping");
    }
}
