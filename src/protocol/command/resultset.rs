use crate::col::FieldDescription;
use crate::error::{Error, Result};
use crate::protocol::primitive::*;
use crate::protocol::value::{NullBitmap, Value};

/// Read a binary protocol row, rendering every value in its textual form
///
/// Layout: `0x00` header, NULL bitmap of `(n + 7 + 2) / 8` bytes, then the non-NULL values.
pub fn read_binary_row(payload: &[u8], fields: &[FieldDescription]) -> Result<Vec<Option<Vec<u8>>>> {
    let (header, data) = read_int_1(payload)?;
    if header != 0x00 {
        return Err(Error::ProtocolError(format!(
            "binary row header 0x{header:02X}"
        )));
    }

    let (null_bitmap, mut data) = read_string_fix(data, NullBitmap::result_set_len(fields.len()))?;
    let null_bitmap = NullBitmap::for_result_set(null_bitmap);

    let mut values = Vec::with_capacity(fields.len());
    for (idx, field) in fields.iter().enumerate() {
        if null_bitmap.is_null(idx) {
            values.push(None);
            continue;
        }
        let (value, rest) = Value::parse(field, data)?;
        values.push(value.to_text());
        data = rest;
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::col::tests::column_definition;
    use crate::constant::{ColumnFlags, ColumnType};
    use pretty_assertions::assert_eq;

    fn fields(types: &[ColumnType]) -> Vec<FieldDescription> {
        types
            .iter()
            .map(|&ty| {
                FieldDescription::parse(&column_definition("c", ty, ColumnFlags::empty(), 45))
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_read_binary_row() {
        let fields = fields(&[
            ColumnType::MYSQL_TYPE_LONGLONG,
            ColumnType::MYSQL_TYPE_VAR_STRING,
            ColumnType::MYSQL_TYPE_DOUBLE,
        ]);
        // column 1 is NULL: bit 3
        let mut payload = vec![0x00, 0b0000_1000];
        payload.extend_from_slice(&30i64.to_le_bytes());
        payload.extend_from_slice(&2.5f64.to_le_bytes());

        let row = read_binary_row(&payload, &fields).unwrap();
        assert_eq!(row, vec![Some(b"30".to_vec()), None, Some(b"2.5".to_vec())]);
    }

    #[test]
    fn test_read_binary_row_bitmap_two_bytes() {
        let fields = fields(&[ColumnType::MYSQL_TYPE_TINY; 7]);
        // column 6 is NULL: bit 8, the first bit of the second byte
        let payload = [0x00, 0x00, 0x01, 1, 2, 3, 4, 5, 6];
        let row = read_binary_row(&payload, &fields).unwrap();
        assert_eq!(row.len(), 7);
        assert_eq!(row[5], Some(b"6".to_vec()));
        assert_eq!(row[6], None);
    }

    #[test]
    fn test_read_binary_row_errors() {
        let fields = fields(&[ColumnType::MYSQL_TYPE_LONG]);
        assert!(read_binary_row(&[0x01, 0x00, 1, 0, 0, 0], &fields).is_err());
        assert!(read_binary_row(&[0x00, 0x00, 1, 0], &fields).is_err());
    }
}
