use crate::constant::{BINARY_CHARSET, ColumnFlags, ColumnType};
use crate::error::Result;
use crate::protocol::command::{ColumnDefinition, ColumnDefinitionBytes};

/// Column metadata of a result set or of a prepared statement's parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub catalog: String,
    pub schema: String,
    pub table: String,
    pub org_table: String,
    pub name: String,
    pub org_name: String,
    pub charset: u16,
    pub column_length: u32,
    pub column_type: ColumnType,
    pub flags: ColumnFlags,
    pub decimals: u8,
}

impl FieldDescription {
    /// Decode a column definition packet
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let def = ColumnDefinition::try_from(ColumnDefinitionBytes(payload))?;
        Self::try_from(&def)
    }

    pub fn is_unsigned(&self) -> bool {
        self.flags.contains(ColumnFlags::UNSIGNED_FLAG)
    }

    pub fn is_nullable(&self) -> bool {
        !self.flags.contains(ColumnFlags::NOT_NULL_FLAG)
    }

    /// Binary collation: string columns carry raw bytes
    pub fn is_binary(&self) -> bool {
        self.charset == BINARY_CHARSET
    }
}

impl TryFrom<&ColumnDefinition<'_>> for FieldDescription {
    type Error = crate::error::Error;

    fn try_from(def: &ColumnDefinition<'_>) -> Result<Self> {
        Ok(Self {
            catalog: to_string(def.catalog),
            schema: to_string(def.schema),
            table: to_string(def.table_alias),
            org_table: to_string(def.table_original),
            name: to_string(def.name_alias),
            org_name: to_string(def.name_original),
            charset: def.tail.charset(),
            column_length: def.tail.column_length(),
            column_type: def.tail.column_type()?,
            flags: def.tail.flags(),
            decimals: def.tail.decimals(),
        })
    }
}

fn to_string(bytes: &[u8]) -> String {
    match simdutf8::basic::from_utf8(bytes) {
        Ok(s) => s.to_owned(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}
