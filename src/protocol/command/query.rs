use crate::constant::CommandByte;
use crate::error::{Error, Result};
use crate::protocol::primitive::*;

/// Write COM_QUERY command
pub fn write_query(out: &mut Vec<u8>, sql: &str) {
    write_int_1(out, CommandByte::Query as u8);
    out.extend_from_slice(sql.as_bytes());
}

/// Read the column count that opens a result set
pub fn read_column_count(payload: &[u8]) -> Result<usize> {
    let (column_count, _rest) = read_int_lenenc(payload)?;
    usize::try_from(column_count).map_err(|_| Error::InvalidPacket)
}

/// Read a text protocol row: one length-encoded string per column, `0xFB` for NULL
pub fn read_text_row(payload: &[u8], num_columns: usize) -> Result<Vec<Option<Vec<u8>>>> {
    let mut values = Vec::with_capacity(num_columns);
    let mut data = payload;
    for _ in 0..num_columns {
        if let Some(rest) = data.strip_prefix(&[0xFB]) {
            values.push(None);
            data = rest;
        } else {
            let (value, rest) = read_string_lenenc(data)?;
            values.push(Some(value.to_vec()));
            data = rest;
        }
    }
    if !data.is_empty() {
        return Err(Error::ProtocolError(format!(
            "{} trailing bytes after text row",
            data.len()
        )));
    }
    Ok(values)
}
