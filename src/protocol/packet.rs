use tracing::trace;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::constant::MAX_PAYLOAD_LENGTH;
use crate::error::{Error, Result};

/// MySQL packet header (zero-copy)
///
/// Layout matches MySQL wire protocol:
/// - length: 3 bytes (little-endian, payload length)
/// - sequence_id: 1 byte
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, IntoBytes)]
pub struct PacketHeader {
    pub length: [u8; 3],
    pub sequence_id: u8,
}

impl PacketHeader {
    pub fn encode(length: usize, sequence_id: u8) -> Self {
        let len = u32::to_le_bytes(length as u32);
        Self {
            length: [len[0], len[1], len[2]],
            sequence_id,
        }
    }

    pub fn length(&self) -> usize {
        u32::from_le_bytes([self.length[0], self.length[1], self.length[2], 0]) as usize
    }
}

/// One complete protocol packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Vec<u8>,
}

/// Reassembles packets from a byte stream that arrives in arbitrary chunks.
///
/// Payloads of `0xFFFFFF` bytes announce a continuation packet. Continuations
/// are not reassembled; such a packet is reported as a protocol error.
#[derive(Debug, Default)]
pub struct PacketFramer {
    buffer: Vec<u8>,
    /// Start of the first unconsumed byte in `buffer`
    pos: usize,
    /// Sequence id expected on the next packet
    next_sequence_id: u8,
}

impl PacketFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the transport
    pub fn extend(&mut self, data: &[u8]) {
        if self.pos > 0 && self.pos == self.buffer.len() {
            self.buffer.clear();
            self.pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes buffered but not yet framed
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.pos
    }

    /// Sequence id the next packet (from either peer) should carry
    pub fn next_sequence_id(&self) -> u8 {
        self.next_sequence_id
    }

    pub fn set_next_sequence_id(&mut self, sequence_id: u8) {
        self.next_sequence_id = sequence_id;
    }

    /// Slice the next complete packet off the buffer, if one is available
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        let data = &self.buffer[self.pos..];
        let Ok((header, rest)) = PacketHeader::ref_from_prefix(data) else {
            return Ok(None);
        };

        let length = header.length();
        let sequence_id = header.sequence_id;
        if length == MAX_PAYLOAD_LENGTH {
            return Err(Error::ProtocolError(
                "packets of 16 MiB or more are not supported".to_string(),
            ));
        }
        if rest.len() < length {
            return Ok(None);
        }

        let payload = rest[..length].to_vec();
        self.pos += 4 + length;
        if self.pos > self.buffer.len() / 2 {
            self.buffer.drain(..self.pos);
            self.pos = 0;
        }

        if sequence_id != self.next_sequence_id {
            trace!(
                expected = self.next_sequence_id,
                got = sequence_id,
                "packet sequence mismatch"
            );
        }
        self.next_sequence_id = sequence_id.wrapping_add(1);

        Ok(Some(Packet {
            sequence_id,
            payload,
        }))
    }
}

/// Append a framed packet (header + payload) to `out`
pub fn write_packet(out: &mut Vec<u8>, sequence_id: u8, payload: &[u8]) -> Result<()> {
    if payload.len() >= MAX_PAYLOAD_LENGTH {
        return Err(Error::UsageError(
            "command payloads of 16 MiB or more are not supported".to_string(),
        ));
    }
    out.extend_from_slice(PacketHeader::encode(payload.len(), sequence_id).as_bytes());
    out.extend_from_slice(payload);
    Ok(())
}
