use tokio::sync::mpsc;
use tracing::warn;

use crate::col::FieldDescription;
use crate::error::{Error, Result};
use crate::protocol::r#trait::params::Params;
use crate::result::ResultSet;
use crate::session::{Command, StatementInfo};

use super::conn::execute;

/// A server-side prepared statement.
///
/// Holds only a weak handle to its connection: a statement never keeps the
/// connection open on its own.
#[derive(Debug)]
pub struct PreparedStatement {
    sender: mpsc::WeakUnboundedSender<Command>,
    info: StatementInfo,
    closed: bool,
}

impl PreparedStatement {
    pub(crate) fn new(sender: mpsc::WeakUnboundedSender<Command>, info: StatementInfo) -> Self {
        Self {
            sender,
            info,
            closed: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.info.id
    }

    /// Parameter metadata, one entry per `?`
    pub fn params(&self) -> &[FieldDescription] {
        &self.info.params
    }

    pub fn columns(&self) -> &[FieldDescription] {
        &self.info.columns
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn info(&self) -> &StatementInfo {
        &self.info
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::UsageError(format!(
                "statement {} is closed",
                self.info.id
            )));
        }
        Ok(())
    }

    /// Execute with `params` bound in order. Their count must match [`Self::params`].
    pub fn execute<P: Params>(&self, params: P) -> Result<ResultSet> {
        self.check_open()?;
        let sender = self.sender.upgrade().ok_or(Error::ConnectionLost)?;
        execute(&sender, &self.info, &params)
    }

    /// Deallocate the statement on the server. Closing twice only warns.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            warn!(statement_id = self.info.id, "statement already closed");
            return Ok(());
        }
        self.closed = true;

        let Some(sender) = self.sender.upgrade() else {
            // The server dropped the statement along with the connection
            return Ok(());
        };
        sender
            .send(Command::close_statement(self.info.id))
            .map_err(|mpsc::error::SendError(command)| {
                command.fail(Error::ConnectionLost);
                Error::ConnectionLost
            })
    }
}
