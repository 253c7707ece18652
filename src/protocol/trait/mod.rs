pub mod param;
pub mod params;


use std::sync::Arc;

use crate::col::FieldDescription;
use crate::error::Error;
use crate::protocol::response::OkPayload;
use crate::row::Row;

/// Event callbacks for one command's result, text or binary protocol alike
///
/// The session calls `resultset_start` at most once, then `row` for every row,
/// then exactly one of `resultset_end` or `fail`.
pub trait ResultSetHandler: Send {
    /// Column metadata is complete. Not called for commands that answer with a bare OK.
    fn resultset_start(&mut self, fields: Arc<[FieldDescription]>);
    fn row(&mut self, row: Row);
    /// Terminal OK or end-of-rows EOF
    fn resultset_end(&mut self, ok: OkPayload);
    fn fail(&mut self, err: Error);
}
