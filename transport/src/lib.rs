//! Datagram Transport
//!
//! Non-blocking UDP servers and clients plus the fixed-length wire packet
//! codec. The engine's shards poll [`UdpServer::recv_nonblocking`] and never
//! block; all packets are exactly `Config::packet_length()` bytes.

pub mod packet;
pub mod udp;

use thiserror::Error;

pub use packet::PacketHeader;
pub use udp::{UdpClient, UdpServer};

/// Transport-layer errors. Any of these on the RX path drains the engine.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("truncated packet: got {got} bytes, want {want}")]
    Truncated { got: usize, want: usize },
}
