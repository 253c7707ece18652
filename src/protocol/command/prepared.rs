use crate::constant::CommandByte;
use crate::error::{Error, Result};
use crate::protocol::primitive::*;
use crate::protocol::r#trait::params::Params;
use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE};
use zerocopy::{FromBytes, Immutable, KnownLayout};

/// Prepared statement OK response (zero-copy)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
pub struct PrepareOk {
    statement_id: U32LE,
    num_columns: U16LE,
    num_params: U16LE,
    _reserved: u8,
    warning_count: U16LE,
}

impl PrepareOk {
    /// Get the statement ID
    pub fn statement_id(&self) -> u32 {
        self.statement_id.get()
    }

    /// Get the number of columns in the result set
    pub fn num_columns(&self) -> u16 {
        self.num_columns.get()
    }

    /// Get the number of parameters in the prepared statement
    pub fn num_params(&self) -> u16 {
        self.num_params.get()
    }

    pub fn warning_count(&self) -> u16 {
        self.warning_count.get()
    }
}

/// Write COM_STMT_PREPARE command
pub fn write_prepare(out: &mut Vec<u8>, sql: &str) {
    write_int_1(out, CommandByte::StmtPrepare as u8);
    out.extend_from_slice(sql.as_bytes());
}

/// Read COM_STMT_PREPARE_OK
pub fn read_prepare_ok(payload: &[u8]) -> Result<&PrepareOk> {
    let (status, data) = read_int_1(payload)?;
    if status != 0x00 {
        return Err(Error::ProtocolError(format!(
            "COM_STMT_PREPARE_OK status 0x{status:02X}"
        )));
    }
    let (prepare_ok, _rest) = PrepareOk::ref_from_prefix(data).map_err(|_| Error::UnexpectedEof)?;
    Ok(prepare_ok)
}

/// Write COM_STMT_EXECUTE command
///
/// The argument count must equal the statement's parameter count.
pub fn write_execute<P: Params + ?Sized>(
    out: &mut Vec<u8>,
    statement_id: u32,
    num_params: usize,
    params: &P,
) -> Result<()> {
    if params.len() != num_params {
        return Err(Error::UsageError(format!(
            "statement expects {num_params} parameters, got {}",
            params.len()
        )));
    }

    write_int_1(out, CommandByte::StmtExecute as u8);
    write_int_4(out, statement_id);

    // flags (1 byte) - CURSOR_TYPE_NO_CURSOR
    write_int_1(out, 0x00);

    // iteration count (4 bytes) - always 1
    write_int_4(out, 1);

    if num_params > 0 {
        params.write_null_bitmap(out);

        // new-params-bound-flag (1 byte)
        write_int_1(out, 0x01);
        params.write_types(out);
        params.write_values(out);
    }
    Ok(())
}

/// Write COM_STMT_CLOSE command
pub fn write_close_statement(out: &mut Vec<u8>, statement_id: u32) {
    write_int_1(out, CommandByte::StmtClose as u8);
    write_int_4(out, statement_id);
}
