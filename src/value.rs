use crate::col::FieldDescription;
use crate::constant::ColumnType;
use crate::error::{Error, Result};
use crate::protocol::r#trait::param::Param;

/// A column value converted by its declared type
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    /// Signed integer columns (TINYINT .. BIGINT, YEAR)
    Int(i64),
    /// Integer columns with the UNSIGNED flag
    UInt(u64),
    /// FLOAT and DOUBLE
    Float(f64),
    /// Character data, DECIMAL and temporal columns in their textual form
    Text(String),
    /// Binary-collated strings, BLOBs, BIT and GEOMETRY
    Bytes(Vec<u8>),
}

impl Value {
    /// Convert a raw value (as delivered by either row protocol) using the field's declared type
    pub fn from_raw(field: &FieldDescription, raw: Option<&[u8]>) -> Result<Self> {
        let Some(raw) = raw else {
            return Ok(Value::Null);
        };

        match field.column_type {
            ColumnType::MYSQL_TYPE_NULL => Ok(Value::Null),

            ty if ty.is_integer() => {
                let text = ascii(field, raw)?;
                if field.is_unsigned() {
                    text.parse().map(Value::UInt).map_err(|_| bad_value(field, raw))
                } else {
                    text.parse().map(Value::Int).map_err(|_| bad_value(field, raw))
                }
            }

            ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE => ascii(field, raw)?
                .parse()
                .map(Value::Float)
                .map_err(|_| bad_value(field, raw)),

            ColumnType::MYSQL_TYPE_BIT | ColumnType::MYSQL_TYPE_GEOMETRY => {
                Ok(Value::Bytes(raw.to_vec()))
            }

            ColumnType::MYSQL_TYPE_VARCHAR
            | ColumnType::MYSQL_TYPE_VAR_STRING
            | ColumnType::MYSQL_TYPE_STRING
            | ColumnType::MYSQL_TYPE_TINY_BLOB
            | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
            | ColumnType::MYSQL_TYPE_LONG_BLOB
            | ColumnType::MYSQL_TYPE_BLOB
                if field.is_binary() =>
            {
                Ok(Value::Bytes(raw.to_vec()))
            }

            _ => match simdutf8::basic::from_utf8(raw) {
                Ok(text) => Ok(Value::Text(text.to_owned())),
                Err(_) => Ok(Value::Bytes(raw.to_vec())),
            },
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

fn ascii<'a>(field: &FieldDescription, raw: &'a [u8]) -> Result<&'a str> {
    simdutf8::basic::from_utf8(raw).map_err(|_| bad_value(field, raw))
}

fn bad_value(field: &FieldDescription, raw: &[u8]) -> Error {
    Error::UsageError(format!(
        "column `{}` holds {:?}, not a valid {:?}",
        field.name,
        String::from_utf8_lossy(raw),
        field.column_type
    ))
}

impl Param for Value {
    fn is_null(&self) -> bool {
        Value::is_null(self)
    }

    fn encode_value(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => {}
            Value::Int(v) => v.encode_value(out),
            Value::UInt(v) => v.encode_value(out),
            Value::Float(v) => v.encode_value(out),
            Value::Text(v) => v.encode_value(out),
            Value::Bytes(v) => v.encode_value(out),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::UInt(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}
