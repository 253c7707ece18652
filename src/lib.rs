//! Event-driven MySQL/MariaDB client.
//!
//! Commands issued on a [`Conn`] are written immediately and answered strictly
//! in submission order. Each query or statement execution returns a
//! [`ResultSet`] that can be read in full, mapped row by row, or streamed.

pub mod col;
pub mod constant;
pub mod error;
mod opts;
pub mod protocol;
pub mod result;
pub mod row;
pub mod session;
pub mod tokio;
pub mod value;

pub use col::FieldDescription;
pub use error::{Error, Result};
pub use opts::Opts;
pub use protocol::response::OkPayload;
pub use result::{ResultSet, ResultStatus, RowStream};
pub use row::{ColumnIndex, Row};
pub use session::{ConnEvent, EventHandler, ServerInfo};
pub use crate::tokio::{Conn, PreparedStatement};
pub use value::Value;
