/// MySQL Binary Protocol Value Types
use std::io::Write as _;

use crate::col::FieldDescription;
use crate::constant::ColumnType;
use crate::error::{Error, Result};
use crate::protocol::primitive::*;
use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE};
use zerocopy::{FromBytes, Immutable, KnownLayout};

#[derive(Debug, Clone, Copy)]
pub enum Value<'a> {
    /// NULL value
    Null,
    /// Signed integer (TINYINT, SMALLINT, MEDIUMINT, INT, BIGINT, YEAR)
    SignedInt(i64),
    /// Unsigned integer
    UnsignedInt(u64),
    /// FLOAT - 4-byte floating point
    Float(f32),
    /// DOUBLE - 8-byte floating point
    Double(f64),
    /// DATE/DATETIME/TIMESTAMP - 0 bytes (0000-00-00 00:00:00)
    Timestamp0,
    /// DATE/DATETIME/TIMESTAMP - 4 bytes (ymd)
    Timestamp4(&'a Timestamp4),
    /// DATE/DATETIME/TIMESTAMP - 7 bytes (ymd + hms)
    Timestamp7(&'a Timestamp7),
    /// DATE/DATETIME/TIMESTAMP - 11 bytes (ymd + hms + microseconds)
    Timestamp11(&'a Timestamp11),
    /// TIME - 0 bytes (00:00:00)
    Time0,
    /// TIME - 8 bytes (without microseconds)
    Time8(&'a Time8),
    /// TIME - 12 bytes (with microseconds)
    Time12(&'a Time12),
    /// BLOB, GEOMETRY, STRING, VARCHAR, VAR_STRING, DECIMAL, ..
    Byte(&'a [u8]),
}

fn fixed<'a, T: FromBytes + KnownLayout + Immutable>(data: &'a [u8]) -> Result<(&'a T, &'a [u8])> {
    T::ref_from_prefix(data).map_err(|_| Error::UnexpectedEof)
}

impl<'a> Value<'a> {
    /// Parse a single binary protocol value based on the column's declared type and flags
    ///
    /// Returns the parsed value and the remaining bytes
    pub fn parse(field: &FieldDescription, data: &'a [u8]) -> Result<(Self, &'a [u8])> {
        let is_unsigned = field.is_unsigned();

        match field.column_type {
            ColumnType::MYSQL_TYPE_NULL => Ok((Value::Null, data)),

            // Integer types
            ColumnType::MYSQL_TYPE_TINY => {
                let (val, rest) = read_int_1(data)?;
                let value = if is_unsigned {
                    Value::UnsignedInt(u64::from(val))
                } else {
                    Value::SignedInt(i64::from(val as i8))
                };
                Ok((value, rest))
            }

            ColumnType::MYSQL_TYPE_SHORT | ColumnType::MYSQL_TYPE_YEAR => {
                let (val, rest) = read_int_2(data)?;
                let value = if is_unsigned {
                    Value::UnsignedInt(u64::from(val))
                } else {
                    Value::SignedInt(i64::from(val as i16))
                };
                Ok((value, rest))
            }

            // MEDIUMINT travels as 4 bytes
            ColumnType::MYSQL_TYPE_INT24 | ColumnType::MYSQL_TYPE_LONG => {
                let (val, rest) = read_int_4(data)?;
                let value = if is_unsigned {
                    Value::UnsignedInt(u64::from(val))
                } else {
                    Value::SignedInt(i64::from(val as i32))
                };
                Ok((value, rest))
            }

            ColumnType::MYSQL_TYPE_LONGLONG => {
                let (val, rest) = read_int_8(data)?;
                let value = if is_unsigned {
                    Value::UnsignedInt(val)
                } else {
                    Value::SignedInt(val as i64)
                };
                Ok((value, rest))
            }

            // Floating point types
            ColumnType::MYSQL_TYPE_FLOAT => {
                let (val, rest) = read_int_4(data)?;
                Ok((Value::Float(f32::from_bits(val)), rest))
            }

            ColumnType::MYSQL_TYPE_DOUBLE => {
                let (val, rest) = read_int_8(data)?;
                Ok((Value::Double(f64::from_bits(val)), rest))
            }

            ColumnType::MYSQL_TYPE_DATE
            | ColumnType::MYSQL_TYPE_DATETIME
            | ColumnType::MYSQL_TYPE_TIMESTAMP => {
                let (len, rest) = read_int_1(data)?;
                match len {
                    0 => Ok((Value::Timestamp0, rest)),
                    4 => {
                        let (ts, rest) = fixed(rest)?;
                        Ok((Value::Timestamp4(ts), rest))
                    }
                    7 => {
                        let (ts, rest) = fixed(rest)?;
                        Ok((Value::Timestamp7(ts), rest))
                    }
                    11 => {
                        let (ts, rest) = fixed(rest)?;
                        Ok((Value::Timestamp11(ts), rest))
                    }
                    _ => Err(Error::ProtocolError(format!(
                        "invalid timestamp length: {len}"
                    ))),
                }
            }

            ColumnType::MYSQL_TYPE_TIME => {
                let (len, rest) = read_int_1(data)?;
                match len {
                    0 => Ok((Value::Time0, rest)),
                    8 => {
                        let (time, rest) = fixed(rest)?;
                        Ok((Value::Time8(time), rest))
                    }
                    12 => {
                        let (time, rest) = fixed(rest)?;
                        Ok((Value::Time12(time), rest))
                    }
                    _ => Err(Error::ProtocolError(format!("invalid time length: {len}"))),
                }
            }

            // String and BLOB types, plus the server-internal temporal variants
            ColumnType::MYSQL_TYPE_VARCHAR
            | ColumnType::MYSQL_TYPE_VAR_STRING
            | ColumnType::MYSQL_TYPE_STRING
            | ColumnType::MYSQL_TYPE_BLOB
            | ColumnType::MYSQL_TYPE_TINY_BLOB
            | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
            | ColumnType::MYSQL_TYPE_LONG_BLOB
            | ColumnType::MYSQL_TYPE_GEOMETRY
            | ColumnType::MYSQL_TYPE_JSON
            | ColumnType::MYSQL_TYPE_DECIMAL
            | ColumnType::MYSQL_TYPE_NEWDECIMAL
            | ColumnType::MYSQL_TYPE_ENUM
            | ColumnType::MYSQL_TYPE_SET
            | ColumnType::MYSQL_TYPE_BIT
            | ColumnType::MYSQL_TYPE_NEWDATE
            | ColumnType::MYSQL_TYPE_TIMESTAMP2
            | ColumnType::MYSQL_TYPE_DATETIME2
            | ColumnType::MYSQL_TYPE_TIME2
            | ColumnType::MYSQL_TYPE_TYPED_ARRAY => {
                let (bytes, rest) = read_string_lenenc(data)?;
                Ok((Value::Byte(bytes), rest))
            }
        }
    }

    /// The textual representation, as the text protocol would have sent it. `None` for NULL.
    pub fn to_text(&self) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        // Writes into a Vec cannot fail
        let _ = match self {
            Value::Null => return None,
            Value::SignedInt(v) => write!(out, "{v}"),
            Value::UnsignedInt(v) => write!(out, "{v}"),
            Value::Float(v) => write!(out, "{v}"),
            Value::Double(v) => write!(out, "{v}"),
            Value::Timestamp0 => write!(out, "0000-00-00 00:00:00"),
            Value::Timestamp4(ts) => write!(out, "{:04}-{:02}-{:02}", ts.year(), ts.month, ts.day),
            Value::Timestamp7(ts) => write!(
                out,
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                ts.year(),
                ts.month,
                ts.day,
                ts.hour,
                ts.minute,
                ts.second
            ),
            Value::Timestamp11(ts) => write!(
                out,
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
                ts.year(),
                ts.month,
                ts.day,
                ts.hour,
                ts.minute,
                ts.second,
                ts.microsecond()
            ),
            Value::Time0 => write!(out, "00:00:00"),
            Value::Time8(t) => write!(
                out,
                "{}{:02}:{:02}:{:02}",
                if t.is_negative() { "-" } else { "" },
                t.hours(),
                t.minute,
                t.second
            ),
            Value::Time12(t) => write!(
                out,
                "{}{:02}:{:02}:{:02}.{:06}",
                if t.is_negative() { "-" } else { "" },
                t.hours(),
                t.minute,
                t.second,
                t.microsecond()
            ),
            Value::Byte(bytes) => {
                out.extend_from_slice(bytes);
                Ok(())
            }
        };
        Some(out)
    }
}

// ============================================================================
// Temporal Types
// ============================================================================

/// TIMESTAMP - 4 bytes (DATE/DATETIME/TIMESTAMP with date only)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
pub struct Timestamp4 {
    pub year: U16LE,
    pub month: u8,
    pub day: u8,
}

impl Timestamp4 {
    pub fn year(&self) -> u16 {
        self.year.get()
    }
}

/// TIMESTAMP - 7 bytes (DATE/DATETIME/TIMESTAMP without microseconds)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
pub struct Timestamp7 {
    pub year: U16LE,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl Timestamp7 {
    pub fn year(&self) -> u16 {
        self.year.get()
    }
}

/// TIMESTAMP - 11 bytes (DATE/DATETIME/TIMESTAMP with microseconds)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
pub struct Timestamp11 {
    pub year: U16LE,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub microsecond: U32LE,
}

impl Timestamp11 {
    pub fn year(&self) -> u16 {
        self.year.get()
    }

    pub fn microsecond(&self) -> u32 {
        self.microsecond.get()
    }
}

/// TIME - 8 bytes
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
pub struct Time8 {
    pub is_negative: u8,
    pub days: U32LE,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl Time8 {
    pub fn is_negative(&self) -> bool {
        self.is_negative != 0
    }

    /// Days folded into hours
    pub fn hours(&self) -> u64 {
        u64::from(self.days.get()) * 24 + u64::from(self.hour)
    }
}

/// TIME - 12 bytes
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
pub struct Time12 {
    pub is_negative: u8,
    pub days: U32LE,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub microsecond: U32LE,
}

impl Time12 {
    pub fn is_negative(&self) -> bool {
        self.is_negative != 0
    }

    /// Days folded into hours
    pub fn hours(&self) -> u64 {
        u64::from(self.days.get()) * 24 + u64::from(self.hour)
    }

    pub fn microsecond(&self) -> u32 {
        self.microsecond.get()
    }
}

// ============================================================================
// NULL Bitmap
// ============================================================================

/// NULL bitmap of a binary protocol row or of COM_STMT_EXECUTE parameters
#[derive(Debug, Clone, Copy)]
pub struct NullBitmap<'a> {
    bitmap: &'a [u8],
    offset: usize,
}

impl<'a> NullBitmap<'a> {
    /// Bitmap of a binary result row: bits start at position 2
    pub fn for_result_set(bitmap: &'a [u8]) -> Self {
        Self { bitmap, offset: 2 }
    }

    /// Bitmap of statement parameters: bits start at position 0
    pub fn for_parameters(bitmap: &'a [u8]) -> Self {
        Self { bitmap, offset: 0 }
    }

    /// Bytes needed for `num_columns` result columns
    pub fn result_set_len(num_columns: usize) -> usize {
        (num_columns + 7 + 2) >> 3
    }

    /// Bytes needed for `num_params` parameters
    pub fn parameters_len(num_params: usize) -> usize {
        (num_params + 7) >> 3
    }

    pub fn is_null(&self, idx: usize) -> bool {
        let bit_pos = idx + self.offset;
        let byte_pos = bit_pos >> 3;
        let bit_offset = bit_pos & 7;

        self.bitmap
            .get(byte_pos)
            .is_some_and(|byte| byte & (1 << bit_offset) != 0)
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bitmap
    }
}
