//! Wire Packet Codec
//!
//! One packet carries one antenna's time-domain samples for one OFDM
//! symbol: a 16-byte header of four little-endian u32 fields followed by
//! interleaved int16 I/Q samples.

use common::config::PACKET_HEADER_LEN;

use crate::TransportError;

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub frame_id: u32,
    pub symbol_id: u32,
    pub cell_id: u32,
    pub ant_id: u32,
}

impl PacketHeader {
    pub fn new(frame_id: u32, symbol_id: u32, cell_id: u32, ant_id: u32) -> Self {
        PacketHeader {
            frame_id,
            symbol_id,
            cell_id,
            ant_id,
        }
    }

    /// Serialize into the first [`PACKET_HEADER_LEN`] bytes of `buf`.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.frame_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.symbol_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.cell_id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.ant_id.to_le_bytes());
    }

    /// Parse from the start of `buf`.
    pub fn read_from(buf: &[u8]) -> Result<Self, TransportError> {
        if buf.len() < PACKET_HEADER_LEN {
            return Err(TransportError::Truncated {
                got: buf.len(),
                want: PACKET_HEADER_LEN,
            });
        }
        let word = |i: usize| u32::from_le_bytes(buf[i..i + 4].try_into().unwrap());
        Ok(PacketHeader {
            frame_id: word(0),
            symbol_id: word(4),
            cell_id: word(8),
            ant_id: word(12),
        })
    }
}

/// Payload bytes of a received packet.
pub fn payload(buf: &[u8]) -> &[u8] {
    &buf[PACKET_HEADER_LEN..]
}

/// Mutable payload window of a packet under construction.
pub fn payload_mut(buf: &mut [u8]) -> &mut [u8] {
    &mut buf[PACKET_HEADER_LEN..]
}

/// Reinterpret a packet payload as int16 I/Q samples.
pub fn payload_samples(buf: &[u8]) -> Vec<i16> {
    payload(buf)
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Write int16 I/Q samples into a packet payload.
pub fn write_samples(buf: &mut [u8], samples: &[i16]) {
    let dst = payload_mut(buf);
    for (chunk, s) in dst.chunks_exact_mut(2).zip(samples) {
        chunk.copy_from_slice(&s.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let hdr = PacketHeader::new(42, 7, 0, 15);
        let mut buf = [0u8; 32];
        hdr.write_to(&mut buf);
        assert_eq!(PacketHeader::read_from(&buf).unwrap(), hdr);
    }

    #[test]
    fn test_header_little_endian() {
        let hdr = PacketHeader::new(0x0102_0304, 1, 0, 0);
        let mut buf = [0u8; PACKET_HEADER_LEN];
        hdr.write_to(&mut buf);
        assert_eq!(&buf[0..4], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_truncated_header_rejected() {
        let buf = [0u8; 8];
        assert!(PacketHeader::read_from(&buf).is_err());
    }

    #[test]
    fn test_sample_roundtrip() {
        let mut buf = vec![0u8; PACKET_HEADER_LEN + 8];
        write_samples(&mut buf, &[1, -2, 32767, -32768]);
        assert_eq!(payload_samples(&buf), vec![1, -2, 32767, -32768]);
    }
}
