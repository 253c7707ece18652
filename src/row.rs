use std::sync::Arc;

use crate::col::FieldDescription;
use crate::error::{Error, Result};
use crate::value::Value;

/// One result row: the result's column metadata plus each column's raw value.
///
/// Values are kept in their textual form regardless of the row protocol, so both
/// text (`query`) and binary (`execute`) rows read the same way.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    fields: Arc<[FieldDescription]>,
    values: Vec<Option<Vec<u8>>>,
}

/// Column lookup by position or by name
pub trait ColumnIndex {
    fn index(&self, fields: &[FieldDescription]) -> Result<usize>;
}

impl ColumnIndex for usize {
    fn index(&self, fields: &[FieldDescription]) -> Result<usize> {
        if *self < fields.len() {
            Ok(*self)
        } else {
            Err(Error::UsageError(format!(
                "column index {self} out of range for {} columns",
                fields.len()
            )))
        }
    }
}

impl ColumnIndex for &str {
    fn index(&self, fields: &[FieldDescription]) -> Result<usize> {
        fields
            .iter()
            .position(|field| field.name == *self)
            .ok_or_else(|| Error::UsageError(format!("unknown column `{self}`")))
    }
}

impl Row {
    pub fn new(fields: Arc<[FieldDescription]>, values: Vec<Option<Vec<u8>>>) -> Self {
        Self { fields, values }
    }

    pub fn fields(&self) -> &[FieldDescription] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_null(&self, idx: impl ColumnIndex) -> Result<bool> {
        Ok(self.raw(idx)?.1.is_none())
    }

    fn raw(&self, idx: impl ColumnIndex) -> Result<(&FieldDescription, Option<&[u8]>)> {
        let idx = idx.index(&self.fields)?;
        let raw = self.values.get(idx).and_then(|value| value.as_deref());
        Ok((&self.fields[idx], raw))
    }

    fn required<T>(&self, idx: impl ColumnIndex, value: Option<T>) -> Result<T> {
        value.ok_or_else(|| {
            let name = idx
                .index(&self.fields)
                .map(|idx| self.fields[idx].name.as_str())
                .unwrap_or_default();
            Error::UsageError(format!("column `{name}` is NULL"))
        })
    }

    /// The value converted by the column's declared type
    pub fn get(&self, idx: impl ColumnIndex) -> Result<Value> {
        let (field, raw) = self.raw(idx)?;
        Value::from_raw(field, raw)
    }

    /// Every column, converted by declared type
    pub fn values(&self) -> Result<Vec<Value>> {
        self.fields
            .iter()
            .zip(&self.values)
            .map(|(field, raw)| Value::from_raw(field, raw.as_deref()))
            .collect()
    }

    pub fn get_bytes_opt(&self, idx: impl ColumnIndex) -> Result<Option<&[u8]>> {
        Ok(self.raw(idx)?.1)
    }

    pub fn get_bytes(&self, idx: impl ColumnIndex + Copy) -> Result<&[u8]> {
        self.required(idx, self.get_bytes_opt(idx)?)
    }

    pub fn get_str_opt(&self, idx: impl ColumnIndex) -> Result<Option<&str>> {
        let (field, raw) = self.raw(idx)?;
        raw.map(|raw| {
            simdutf8::basic::from_utf8(raw).map_err(|_| {
                Error::UsageError(format!("column `{}` is not valid UTF-8", field.name))
            })
        })
        .transpose()
    }

    pub fn get_str(&self, idx: impl ColumnIndex + Copy) -> Result<&str> {
        self.required(idx, self.get_str_opt(idx)?)
    }

    pub fn get_i64_opt(&self, idx: impl ColumnIndex) -> Result<Option<i64>> {
        self.parse_opt(idx)
    }

    pub fn get_i64(&self, idx: impl ColumnIndex + Copy) -> Result<i64> {
        self.required(idx, self.get_i64_opt(idx)?)
    }

    pub fn get_u64_opt(&self, idx: impl ColumnIndex) -> Result<Option<u64>> {
        self.parse_opt(idx)
    }

    pub fn get_u64(&self, idx: impl ColumnIndex + Copy) -> Result<u64> {
        self.required(idx, self.get_u64_opt(idx)?)
    }

    pub fn get_f64_opt(&self, idx: impl ColumnIndex) -> Result<Option<f64>> {
        self.parse_opt(idx)
    }

    pub fn get_f64(&self, idx: impl ColumnIndex + Copy) -> Result<f64> {
        self.required(idx, self.get_f64_opt(idx)?)
    }

    /// Integer columns read as `value != 0`
    pub fn get_bool_opt(&self, idx: impl ColumnIndex) -> Result<Option<bool>> {
        Ok(self.parse_opt::<i64>(idx)?.map(|value| value != 0))
    }

    pub fn get_bool(&self, idx: impl ColumnIndex + Copy) -> Result<bool> {
        self.required(idx, self.get_bool_opt(idx)?)
    }

    fn parse_opt<T: std::str::FromStr>(&self, idx: impl ColumnIndex) -> Result<Option<T>> {
        let (field, raw) = self.raw(idx)?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        simdutf8::basic::from_utf8(raw)
            .ok()
            .and_then(|text| text.parse().ok())
            .map(Some)
            .ok_or_else(|| {
                Error::UsageError(format!(
                    "column `{}` holds {:?}, not a {}",
                    field.name,
                    String::from_utf8_lossy(raw),
                    std::any::type_name::<T>()
                ))
            })
    }
}
