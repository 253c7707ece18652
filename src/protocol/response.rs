use crate::constant::ServerStatusFlags;
use crate::error::{Error, Result};
use crate::protocol::primitive::*;

/// Packet type detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Ok,
    Err,
    Eof,
    /// Column count, column definition, or row data
    Data,
}

/// Classify a response packet by its first byte and length.
///
/// - `0xFF` is always ERR: neither a length-encoded integer nor a NULL marker starts with it.
/// - `0x00` is OK only where a command may finish without a result set (`ok_allowed`).
///   Elsewhere it is a binary row header or a column definition.
/// - `0xFE` is EOF when the payload is shorter than 9 bytes. Longer payloads are row data
///   whose first column starts with the 8-byte length-encoded integer marker.
pub fn detect_packet_type(payload: &[u8], ok_allowed: bool) -> Result<PacketType> {
    match payload.first() {
        None => Err(Error::InvalidPacket),
        Some(0xFF) => Ok(PacketType::Err),
        Some(0xFE) if payload.len() < 9 => Ok(PacketType::Eof),
        Some(0x00) if ok_allowed => Ok(PacketType::Ok),
        Some(_) => Ok(PacketType::Data),
    }
}

/// OK packet payload (also used for the status carried by EOF packets)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPayload {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: ServerStatusFlags,
    pub warnings: u16,
    pub info: String,
}

impl OkPayload {
    /// Parse an OK packet (header `0x00`, or `0xFE` for the deprecate-EOF variant)
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (header, data) = read_int_1(payload)?;
        if header != 0x00 && header != 0xFE {
            return Err(Error::InvalidPacket);
        }

        let (affected_rows, rest) = read_int_lenenc(data)?;
        let (last_insert_id, rest) = read_int_lenenc(rest)?;

        // Pre-4.1 servers stop here
        if rest.is_empty() {
            return Ok(Self {
                affected_rows,
                last_insert_id,
                ..Default::default()
            });
        }

        let (status_flags, rest) = read_int_2(rest)?;
        let (warnings, rest) = read_int_2(rest)?;

        Ok(OkPayload {
            affected_rows,
            last_insert_id,
            status_flags: ServerStatusFlags::from_bits_truncate(status_flags),
            warnings,
            info: String::from_utf8_lossy(rest).into_owned(),
        })
    }

    /// Convert the classic EOF packet (`0xFE`, warnings, status) into an OK payload
    pub fn from_eof(payload: &[u8]) -> Result<Self> {
        let eof = read_eof_packet(payload)?;
        Ok(OkPayload {
            status_flags: eof.status_flags,
            warnings: eof.warnings,
            ..Default::default()
        })
    }
}

/// ERR packet before parsing
#[derive(Debug)]
pub struct ErrPayloadBytes<'a>(pub &'a [u8]);

/// ERR packet response
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("ERROR {} ({}): {}", self.error_code, self.sql_state, self.message)]
pub struct ErrPayload {
    pub error_code: u16,
    pub sql_state: String,
    pub message: String,
}

impl TryFrom<ErrPayloadBytes<'_>> for ErrPayload {
    type Error = Error;

    fn try_from(bytes: ErrPayloadBytes<'_>) -> Result<Self> {
        let payload = bytes.0;
        let (header, data) = read_int_1(payload)?;
        if header != 0xFF {
            return Err(Error::InvalidPacket);
        }

        let (error_code, data) = read_int_2(data)?;

        // SQL state marker '#'
        let (sql_state, rest) = match data.split_first() {
            Some((b'#', rest)) => {
                let (state_bytes, rest) = read_string_fix(rest, 5)?;
                (String::from_utf8_lossy(state_bytes).into_owned(), rest)
            }
            _ => (String::new(), data),
        };

        let message = String::from_utf8_lossy(rest).into_owned();

        Ok(ErrPayload {
            error_code,
            sql_state,
            message,
        })
    }
}

/// EOF packet response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: ServerStatusFlags,
}

/// Read EOF packet (header byte 0xFE, length < 9)
pub fn read_eof_packet(payload: &[u8]) -> Result<EofPacket> {
    let (header, data) = read_int_1(payload)?;
    if header != 0xFE {
        return Err(Error::InvalidPacket);
    }

    // Pre-4.1 EOF is a lone 0xFE
    if data.is_empty() {
        return Ok(EofPacket {
            warnings: 0,
            status_flags: ServerStatusFlags::empty(),
        });
    }

    let (warnings, rest) = read_int_2(data)?;
    let (status_flags, _rest) = read_int_2(rest)?;
    Ok(EofPacket {
        warnings,
        status_flags: ServerStatusFlags::from_bits_truncate(status_flags),
    })
}
