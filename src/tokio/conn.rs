use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::instrument;

use crate::constant::CapabilityFlags;
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::command::prepared::write_execute;
use crate::protocol::connection::HandshakeConfig;
use crate::protocol::response::OkPayload;
use crate::protocol::r#trait::params::Params;
use crate::result::ResultSet;
use crate::session::{Command, ServerInfo, Session, StatementInfo};

use super::driver;
use super::statement::PreparedStatement;
use super::stream::Stream;

/// Handle to one server connection.
///
/// Cloning is cheap; every clone feeds the same command queue, so commands
/// issued from several tasks are pipelined and answered in submission order.
#[derive(Debug, Clone)]
pub struct Conn {
    sender: mpsc::UnboundedSender<Command>,
    info: Arc<ServerInfo>,
}

impl Conn {
    /// Connect and authenticate
    pub async fn new<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts: Opts = opts.try_into()?;
        let stream = Stream::connect(&opts).await?;
        Self::with_stream(stream, &opts).await
    }

    /// Authenticate over an already connected transport
    #[instrument(skip_all, fields(user = %opts.user))]
    pub async fn with_stream<S>(stream: S, opts: &Opts) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let config = HandshakeConfig {
            username: opts.user.clone(),
            password: opts.password.clone(),
            database: opts.db.clone(),
            capabilities: opts.capabilities,
        };
        let (session, ready) = Session::new(config, opts.event_handler.clone());
        let (sender, commands) = mpsc::unbounded_channel();
        tokio::spawn(driver::run(stream, session, commands));

        let info = ready.await.unwrap_or(Err(Error::ConnectionLost))?;
        Ok(Self { sender, info })
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn server_version(&self) -> &str {
        &self.info.server_version
    }

    pub fn connection_id(&self) -> u32 {
        self.info.connection_id
    }

    pub fn capability_flags(&self) -> CapabilityFlags {
        self.info.capabilities
    }

    pub fn is_mariadb(&self) -> bool {
        self.info.is_mariadb()
    }

    /// The driver has stopped; every new command fails with `ConnectionLost`
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub(crate) fn submit(&self, command: Command) {
        if let Err(mpsc::error::SendError(command)) = self.sender.send(command) {
            command.fail(Error::ConnectionLost);
        }
    }

    /// Send a text-protocol query. Rows are read through the returned [`ResultSet`].
    pub fn query(&self, sql: &str) -> ResultSet {
        let (result, sink) = ResultSet::channel();
        self.submit(Command::query(sql, Box::new(sink)));
        result
    }

    /// Run a query and discard its rows
    pub async fn query_drop(&self, sql: &str) -> Result<OkPayload> {
        self.query(sql).finish().await
    }

    pub async fn prepare(&self, sql: &str) -> Result<PreparedStatement> {
        let (tx, rx) = oneshot::channel();
        self.submit(Command::prepare(sql, tx));
        let info = rx.await.unwrap_or(Err(Error::ConnectionLost))?;
        Ok(PreparedStatement::new(self.sender.downgrade(), info))
    }

    /// Execute a prepared statement with `params` bound in order
    pub fn exec<P: Params>(&self, statement: &PreparedStatement, params: P) -> Result<ResultSet> {
        statement.check_open()?;
        execute(&self.sender, statement.info(), &params)
    }

    pub async fn ping(&self) -> Result<()> {
        let (mut result, sink) = ResultSet::channel();
        self.submit(Command::ping(Box::new(sink)));
        result.finish().await?;
        Ok(())
    }

    /// Send COM_QUIT once every earlier command has been written.
    ///
    /// Results of those commands still arrive; anything submitted afterwards
    /// fails with `ConnectionLost`.
    pub fn close(&self) {
        self.submit(Command::quit());
    }
}

pub(crate) fn execute<P: Params + ?Sized>(
    sender: &mpsc::UnboundedSender<Command>,
    info: &StatementInfo,
    params: &P,
) -> Result<ResultSet> {
    let mut payload = Vec::new();
    write_execute(&mut payload, info.id, info.params.len(), params)?;

    let (result, sink) = ResultSet::channel();
    if let Err(mpsc::error::SendError(command)) =
        sender.send(Command::execute(payload, Box::new(sink)))
    {
        command.fail(Error::ConnectionLost);
    }
    Ok(result)
}
