//! Sans-io connection core.
//!
//! A [`Session`] owns everything the protocol needs except the transport: the
//! packet framer, the handshake state machine, and the FIFO of in-flight
//! commands. The driver feeds it bytes with [`Session::receive`], hands it
//! commands with [`Session::submit`], and writes whatever
//! [`Session::take_outgoing`] returns.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::col::FieldDescription;
use crate::constant::{CapabilityFlags, ServerStatusFlags};
use crate::error::{Error, Result};
use crate::protocol::command::prepared::{read_prepare_ok, write_close_statement, write_prepare};
use crate::protocol::command::query::{read_column_count, read_text_row, write_query};
use crate::protocol::command::resultset::read_binary_row;
use crate::protocol::command::utility::{write_ping, write_quit};
use crate::protocol::connection::{Handshake, HandshakeConfig, HandshakeResult, InitialHandshake};
use crate::protocol::packet::{Packet, PacketFramer, write_packet};
use crate::protocol::response::{ErrPayloadBytes, OkPayload, PacketType, detect_packet_type};
use crate::protocol::r#trait::ResultSetHandler;
use crate::row::Row;

/// Server metadata gathered during the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub server_version: String,
    pub connection_id: u32,
    /// Capabilities announced in the greeting
    pub server_capabilities: CapabilityFlags,
    /// `client & server` capabilities in effect for this connection
    pub capabilities: CapabilityFlags,
    pub charset: u8,
    pub status_flags: ServerStatusFlags,
}

impl ServerInfo {
    pub fn is_mariadb(&self) -> bool {
        self.server_version.contains("MariaDB") || !self.server_capabilities.is_mysql()
    }
}

/// Connection lifecycle events
#[derive(Debug)]
pub enum ConnEvent {
    Authenticated(Arc<ServerInfo>),
    /// A connection-level error that no pending future could take
    Error(Error),
    Disconnected,
}

/// Single registered receiver of [`ConnEvent`]s
#[derive(Clone)]
pub struct EventHandler(Arc<dyn Fn(ConnEvent) + Send + Sync>);

impl EventHandler {
    pub fn new(handler: impl Fn(ConnEvent) + Send + Sync + 'static) -> Self {
        Self(Arc::new(handler))
    }

    fn emit(&self, event: ConnEvent) {
        (self.0)(event);
    }
}

impl std::fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EventHandler")
    }
}

/// A prepared statement as described by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementInfo {
    pub id: u32,
    pub params: Vec<FieldDescription>,
    pub columns: Vec<FieldDescription>,
}

pub type ReadySender = oneshot::Sender<Result<Arc<ServerInfo>>>;
pub type PrepareSender = oneshot::Sender<Result<StatementInfo>>;

enum OpKind {
    /// Text protocol result (COM_QUERY, COM_PING)
    Query(Box<dyn ResultSetHandler>),
    Prepare(Option<PrepareSender>),
    /// Binary protocol result (COM_STMT_EXECUTE)
    Execute(Box<dyn ResultSetHandler>),
}

/// One in-flight command, owned by the queue until its terminal packet
pub struct PendingOp {
    kind: OpKind,
    expected_params: usize,
    expected_columns: usize,
    /// Column definition packets seen, including ones that failed to decode
    definitions_seen: usize,
    params: Vec<FieldDescription>,
    columns: Vec<FieldDescription>,
    fields: Option<Arc<[FieldDescription]>>,
    eof_seen: usize,
    error_seen: bool,
    statement_id: u32,
}

impl std::fmt::Debug for PendingOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            OpKind::Query(_) => "query",
            OpKind::Prepare(_) => "prepare",
            OpKind::Execute(_) => "execute",
        };
        f.debug_struct("PendingOp")
            .field("kind", &kind)
            .field("expected_params", &self.expected_params)
            .field("expected_columns", &self.expected_columns)
            .field("definitions_seen", &self.definitions_seen)
            .field("eof_seen", &self.eof_seen)
            .field("error_seen", &self.error_seen)
            .finish_non_exhaustive()
    }
}

impl PendingOp {
    fn new(kind: OpKind) -> Self {
        Self {
            kind,
            expected_params: 0,
            expected_columns: 0,
            definitions_seen: 0,
            params: Vec::new(),
            columns: Vec::new(),
            fields: None,
            eof_seen: 0,
            error_seen: false,
            statement_id: 0,
        }
    }

    fn is_prepare(&self) -> bool {
        matches!(self.kind, OpKind::Prepare(_))
    }

    /// Settle with an error. Only the first failure reaches the caller.
    fn fail(&mut self, err: Error) {
        if self.error_seen {
            return;
        }
        self.error_seen = true;
        match &mut self.kind {
            OpKind::Query(handler) | OpKind::Execute(handler) => handler.fail(err),
            OpKind::Prepare(sender) => {
                if let Some(sender) = sender.take() {
                    let _ = sender.send(Err(err));
                }
            }
        }
    }

    fn complete(&mut self, ok: OkPayload) {
        if self.error_seen {
            return;
        }
        match &mut self.kind {
            OpKind::Query(handler) | OpKind::Execute(handler) => handler.resultset_end(ok),
            OpKind::Prepare(sender) => {
                if let Some(sender) = sender.take() {
                    let _ = sender.send(Ok(StatementInfo {
                        id: self.statement_id,
                        params: std::mem::take(&mut self.params),
                        columns: std::mem::take(&mut self.columns),
                    }));
                }
            }
        }
    }

    /// Prepare is done once every definition and every group's EOF has arrived
    fn prepare_done(&self) -> bool {
        let expected_eofs =
            usize::from(self.expected_params > 0) + usize::from(self.expected_columns > 0);
        self.definitions_seen == self.expected_params + self.expected_columns
            && self.eof_seen == expected_eofs
    }
}

/// A command ready to be written, with the queue entry that will receive its response
pub struct Command {
    payload: Vec<u8>,
    op: Option<PendingOp>,
    quit: bool,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("command_byte", &self.payload.first())
            .field("len", &self.payload.len())
            .field("op", &self.op)
            .finish()
    }
}

impl Command {
    pub fn query(sql: &str, handler: Box<dyn ResultSetHandler>) -> Self {
        let mut payload = Vec::with_capacity(sql.len() + 1);
        write_query(&mut payload, sql);
        Self::with_op(payload, OpKind::Query(handler))
    }

    pub fn prepare(sql: &str, sender: PrepareSender) -> Self {
        let mut payload = Vec::with_capacity(sql.len() + 1);
        write_prepare(&mut payload, sql);
        Self::with_op(payload, OpKind::Prepare(Some(sender)))
    }

    /// `payload` is a complete COM_STMT_EXECUTE
    pub fn execute(payload: Vec<u8>, handler: Box<dyn ResultSetHandler>) -> Self {
        Self::with_op(payload, OpKind::Execute(handler))
    }

    /// Answered by a bare OK
    pub fn ping(handler: Box<dyn ResultSetHandler>) -> Self {
        let mut payload = Vec::with_capacity(1);
        write_ping(&mut payload);
        Self::with_op(payload, OpKind::Query(handler))
    }

    /// COM_STMT_CLOSE has no response and is never queued
    pub fn close_statement(statement_id: u32) -> Self {
        let mut payload = Vec::with_capacity(5);
        write_close_statement(&mut payload, statement_id);
        Self {
            payload,
            op: None,
            quit: false,
        }
    }

    pub fn quit() -> Self {
        let mut payload = Vec::with_capacity(1);
        write_quit(&mut payload);
        Self {
            payload,
            op: None,
            quit: true,
        }
    }

    fn with_op(payload: Vec<u8>, kind: OpKind) -> Self {
        Self {
            payload,
            op: Some(PendingOp::new(kind)),
            quit: false,
        }
    }

    /// Settle the command without sending it
    pub fn fail(self, err: Error) {
        if let Some(mut op) = self.op {
            op.fail(err);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultPhase {
    Idle,
    ColumnDefinitions,
    Rows,
}

#[derive(Debug)]
enum ConnState {
    Handshaking(Handshake),
    Ready,
    /// COM_QUIT sent; responses to earlier commands may still arrive
    Closing,
    Disconnected,
}

/// Protocol state of one connection, without I/O
pub struct Session {
    framer: PacketFramer,
    state: ConnState,
    greeting: Option<InitialHandshake>,
    server_info: Option<Arc<ServerInfo>>,
    queue: VecDeque<PendingOp>,
    phase: ResultPhase,
    outgoing: Vec<u8>,
    ready: Option<ReadySender>,
    event_handler: Option<EventHandler>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("queue", &self.queue)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// The receiver resolves once authentication succeeds, or with the error that ended it
    pub fn new(
        config: HandshakeConfig,
        event_handler: Option<EventHandler>,
    ) -> (Self, oneshot::Receiver<Result<Arc<ServerInfo>>>) {
        let (ready, ready_rx) = oneshot::channel();
        let session = Self {
            framer: PacketFramer::new(),
            state: ConnState::Handshaking(Handshake::new(config)),
            greeting: None,
            server_info: None,
            queue: VecDeque::new(),
            phase: ResultPhase::Idle,
            outgoing: Vec::new(),
            ready: Some(ready),
            event_handler,
        };
        (session, ready_rx)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, ConnState::Ready)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self.state, ConnState::Disconnected)
    }

    /// COM_QUIT has been written
    pub fn is_closing(&self) -> bool {
        matches!(self.state, ConnState::Closing)
    }

    /// Commands waiting for a response
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn server_info(&self) -> Option<&Arc<ServerInfo>> {
        self.server_info.as_ref()
    }

    /// Bytes to write to the transport
    pub fn take_outgoing(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outgoing)
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Write a command and queue its response handler
    pub fn submit(&mut self, command: Command) {
        match self.state {
            ConnState::Ready => {}
            ConnState::Handshaking(_) => {
                command.fail(Error::UsageError("connection is not ready".to_string()));
                return;
            }
            ConnState::Closing | ConnState::Disconnected => {
                command.fail(Error::ConnectionLost);
                return;
            }
        }

        if let Err(err) = write_packet(&mut self.outgoing, 0, &command.payload) {
            command.fail(err);
            return;
        }
        trace!(command = ?command, "command written");

        if command.quit {
            debug!("closing connection");
            self.state = ConnState::Closing;
        }
        if let Some(op) = command.op {
            if self.queue.is_empty() {
                self.framer.set_next_sequence_id(1);
            }
            self.queue.push_back(op);
        }
    }

    /// Feed bytes read from the transport.
    ///
    /// A connection-fatal error goes to the pending ready future, else to the
    /// in-flight command, else to the event handler; only when none of them can
    /// take it is it returned here. The session is disconnected afterwards.
    pub fn receive(&mut self, data: &[u8]) -> Result<()> {
        if self.is_disconnected() {
            return Ok(());
        }
        self.framer.extend(data);

        loop {
            let packet = match self.framer.next_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => return Ok(()),
                Err(err) => return self.fatal(err),
            };
            trace!(
                sequence_id = packet.sequence_id,
                len = packet.payload.len(),
                "packet"
            );

            let result = match self.state {
                ConnState::Handshaking(_) => self.on_handshake_packet(&packet),
                ConnState::Ready | ConnState::Closing => self.on_command_packet(&packet.payload),
                ConnState::Disconnected => return Ok(()),
            };
            if let Err(err) = result {
                return self.fatal(err);
            }
        }
    }

    /// The transport is gone: settle every outstanding future with `ConnectionLost`
    pub fn disconnect(&mut self) {
        if self.is_disconnected() {
            return;
        }
        debug!(pending = self.queue.len(), "disconnected");
        self.state = ConnState::Disconnected;

        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(Error::ConnectionLost));
        }
        for mut op in self.queue.drain(..) {
            op.fail(Error::ConnectionLost);
        }
        self.phase = ResultPhase::Idle;

        if let Some(handler) = &self.event_handler {
            handler.emit(ConnEvent::Disconnected);
        }
    }

    fn fatal(&mut self, err: Error) -> Result<()> {
        let mut err = err;
        if let Some(ready) = self.ready.take() {
            match ready.send(Err(err)) {
                Err(Err(returned)) => err = returned,
                _ => {
                    self.disconnect();
                    return Ok(());
                }
            }
        }

        let unrouted = match self.queue.pop_front() {
            Some(mut op) if !op.error_seen => {
                op.fail(err);
                None
            }
            _ => match &self.event_handler {
                Some(handler) => {
                    handler.emit(ConnEvent::Error(err));
                    None
                }
                None => Some(err),
            },
        };

        self.disconnect();
        match unrouted {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn write(&mut self, payload: &[u8]) -> Result<()> {
        let sequence_id = self.framer.next_sequence_id();
        write_packet(&mut self.outgoing, sequence_id, payload)?;
        self.framer.set_next_sequence_id(sequence_id.wrapping_add(1));
        Ok(())
    }

    // ========================================================================
    // Handshake
    // ========================================================================

    fn on_handshake_packet(&mut self, packet: &Packet) -> Result<()> {
        let ConnState::Handshaking(handshake) = &mut self.state else {
            return Ok(());
        };

        match handshake.drive(&packet.payload)? {
            HandshakeResult::InitialHandshake {
                handshake_response,
                initial_handshake,
            } => {
                self.greeting = Some(initial_handshake);
                self.write(&handshake_response)
            }
            HandshakeResult::Write(payload) => self.write(&payload),
            HandshakeResult::Read => Ok(()),
            HandshakeResult::Connected {
                capability_flags,
                ok,
            } => {
                self.on_connected(capability_flags, ok);
                Ok(())
            }
        }
    }

    fn on_connected(&mut self, capabilities: CapabilityFlags, ok: OkPayload) {
        let greeting = self.greeting.take();
        let info = Arc::new(match greeting {
            Some(greeting) => ServerInfo {
                server_version: greeting.server_version,
                connection_id: greeting.connection_id,
                server_capabilities: greeting.capability_flags,
                capabilities,
                charset: greeting.charset,
                status_flags: ok.status_flags,
            },
            None => ServerInfo {
                server_version: String::new(),
                connection_id: 0,
                server_capabilities: CapabilityFlags::empty(),
                capabilities,
                charset: 0,
                status_flags: ok.status_flags,
            },
        });
        debug!(
            server_version = %info.server_version,
            connection_id = info.connection_id,
            "authenticated"
        );

        self.state = ConnState::Ready;
        self.server_info = Some(Arc::clone(&info));
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Ok(Arc::clone(&info)));
        }
        if let Some(handler) = &self.event_handler {
            handler.emit(ConnEvent::Authenticated(info));
        }
    }

    // ========================================================================
    // Command responses
    // ========================================================================

    fn on_command_packet(&mut self, payload: &[u8]) -> Result<()> {
        let phase = self.phase;
        let Some(op) = self.queue.front_mut() else {
            warn!(len = payload.len(), "packet received with no command in flight");
            return Err(Error::ProtocolError(
                "packet received with no command in flight".to_string(),
            ));
        };

        let ok_allowed = phase == ResultPhase::Idle && !op.is_prepare();
        match (detect_packet_type(payload, ok_allowed)?, phase) {
            (PacketType::Err, _) => {
                op.fail(ErrPayloadBytes(payload).into());
                self.finish_op();
            }

            (PacketType::Ok, _) => {
                let ok = OkPayload::parse(payload)?;
                op.complete(ok);
                self.finish_op();
            }

            (PacketType::Data, ResultPhase::Idle) => {
                if op.is_prepare() {
                    let prepare_ok = read_prepare_ok(payload)?;
                    op.statement_id = prepare_ok.statement_id();
                    op.expected_params = usize::from(prepare_ok.num_params());
                    op.expected_columns = usize::from(prepare_ok.num_columns());
                    if op.prepare_done() {
                        op.complete(OkPayload::default());
                        self.finish_op();
                    } else {
                        self.phase = ResultPhase::ColumnDefinitions;
                    }
                } else {
                    op.expected_columns = read_column_count(payload)?;
                    self.phase = ResultPhase::ColumnDefinitions;
                }
            }

            (PacketType::Data, ResultPhase::ColumnDefinitions) => {
                if op.definitions_seen >= op.expected_params + op.expected_columns {
                    return Err(Error::ProtocolError(
                        "more column definitions than announced".to_string(),
                    ));
                }
                let is_param = op.definitions_seen < op.expected_params;
                op.definitions_seen += 1;
                match FieldDescription::parse(payload) {
                    Ok(field) if is_param => op.params.push(field),
                    Ok(field) => op.columns.push(field),
                    Err(err) => op.fail(err),
                }
                if op.is_prepare() && op.prepare_done() {
                    op.complete(OkPayload::default());
                    self.finish_op();
                }
            }

            (PacketType::Eof, ResultPhase::ColumnDefinitions) => {
                op.eof_seen += 1;
                if op.is_prepare() {
                    if op.prepare_done() {
                        op.complete(OkPayload::default());
                        self.finish_op();
                    }
                } else if op.definitions_seen == op.expected_columns {
                    let fields: Arc<[FieldDescription]> = std::mem::take(&mut op.columns).into();
                    op.fields = Some(Arc::clone(&fields));
                    if !op.error_seen {
                        match &mut op.kind {
                            OpKind::Query(handler) | OpKind::Execute(handler) => {
                                handler.resultset_start(fields);
                            }
                            OpKind::Prepare(_) => {}
                        }
                    }
                    self.phase = ResultPhase::Rows;
                } else {
                    return Err(Error::ProtocolError(format!(
                        "EOF after {} of {} column definitions",
                        op.definitions_seen, op.expected_columns
                    )));
                }
            }

            (PacketType::Data, ResultPhase::Rows) => {
                let fields = op.fields.clone().unwrap_or_else(|| Arc::from(Vec::new()));
                let values = match &op.kind {
                    OpKind::Execute(_) => read_binary_row(payload, &fields),
                    OpKind::Query(_) | OpKind::Prepare(_) => read_text_row(payload, fields.len()),
                };
                match values {
                    Ok(values) if !op.error_seen => match &mut op.kind {
                        OpKind::Query(handler) | OpKind::Execute(handler) => {
                            handler.row(Row::new(fields, values));
                        }
                        OpKind::Prepare(_) => {}
                    },
                    Ok(_) => {}
                    // Keep draining rows until EOF so the stream stays in sync
                    Err(err) => op.fail(err),
                }
            }

            (PacketType::Eof, ResultPhase::Rows) => {
                let ok = OkPayload::from_eof(payload)?;
                op.complete(ok);
                self.finish_op();
            }

            (PacketType::Eof, ResultPhase::Idle) => {
                return Err(Error::ProtocolError(
                    "EOF packet before any result set".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Pop the head op after its terminal packet
    fn finish_op(&mut self) {
        self.queue.pop_front();
        self.phase = ResultPhase::Idle;
        self.framer.set_next_sequence_id(1);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::col::tests::column_definition;
    use crate::constant::{CLIENT_CAPABILITIES, ColumnFlags, ColumnType, UTF8MB4_GENERAL_CI};
    use crate::protocol::primitive::*;
    use crate::result::{ResultSet, ResultStatus};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    const SCRAMBLE: &[u8; 20] = b"01234567890123456789";

    /// Scripted server output
    #[derive(Default)]
    pub(crate) struct Script {
        pub(crate) bytes: Vec<u8>,
        seq: u8,
    }

    impl Script {
        pub(crate) fn packet(&mut self, payload: &[u8]) -> &mut Self {
            write_packet(&mut self.bytes, self.seq, payload).unwrap();
            self.seq = self.seq.wrapping_add(1);
            self
        }

        /// Start a new response: sequence restarts at 1
        pub(crate) fn response(&mut self) -> &mut Self {
            self.seq = 1;
            self
        }

        pub(crate) fn greeting(&mut self, plugin: &str) -> &mut Self {
            let caps = CLIENT_CAPABILITIES | CapabilityFlags::CLIENT_CONNECT_WITH_DB;
            let mut out = vec![10];
            write_string_null(&mut out, "8.0.36");
            write_int_4(&mut out, 7);
            out.extend_from_slice(&SCRAMBLE[..8]);
            out.push(0);
            write_int_2(&mut out, caps.bits() as u16);
            out.push(UTF8MB4_GENERAL_CI);
            write_int_2(&mut out, 2);
            write_int_2(&mut out, (caps.bits() >> 16) as u16);
            out.push(21);
            out.extend_from_slice(&[0; 10]);
            out.extend_from_slice(&SCRAMBLE[8..]);
            out.push(0);
            write_string_null(&mut out, plugin);
            self.seq = 0;
            self.packet(&out)
        }

        pub(crate) fn ok(&mut self, affected_rows: u64, last_insert_id: u64) -> &mut Self {
            let mut out = vec![0x00];
            write_int_lenenc(&mut out, affected_rows);
            write_int_lenenc(&mut out, last_insert_id);
            write_int_2(&mut out, 2);
            write_int_2(&mut out, 0);
            self.packet(&out)
        }

        pub(crate) fn err(&mut self, code: u16, state: &str, message: &str) -> &mut Self {
            let mut out = vec![0xff];
            write_int_2(&mut out, code);
            out.push(b'#');
            out.extend_from_slice(state.as_bytes());
            out.extend_from_slice(message.as_bytes());
            self.packet(&out)
        }

        pub(crate) fn eof(&mut self) -> &mut Self {
            self.packet(&[0xfe, 0x00, 0x00, 0x02, 0x00])
        }

        pub(crate) fn columns(&mut self, columns: &[(&str, ColumnType)]) -> &mut Self {
            let mut count = Vec::new();
            write_int_lenenc(&mut count, columns.len() as u64);
            self.packet(&count);
            self.definitions(columns).eof()
        }

        pub(crate) fn definitions(&mut self, columns: &[(&str, ColumnType)]) -> &mut Self {
            for (name, ty) in columns {
                self.packet(&column_definition(name, *ty, ColumnFlags::empty(), 45));
            }
            self
        }

        pub(crate) fn text_row(&mut self, values: &[Option<&str>]) -> &mut Self {
            let mut out = Vec::new();
            for value in values {
                match value {
                    Some(value) => write_string_lenenc(&mut out, value),
                    None => out.push(0xfb),
                }
            }
            self.packet(&out)
        }

        pub(crate) fn prepare_ok(&mut self, id: u32, columns: u16, params: u16) -> &mut Self {
            let mut out = vec![0x00];
            write_int_4(&mut out, id);
            write_int_2(&mut out, columns);
            write_int_2(&mut out, params);
            out.push(0);
            write_int_2(&mut out, 0);
            self.packet(&out)
        }

        pub(crate) fn take(&mut self) -> Vec<u8> {
            std::mem::take(&mut self.bytes)
        }
    }

    pub(crate) fn config() -> HandshakeConfig {
        HandshakeConfig {
            username: "test".to_string(),
            password: "1234".to_string(),
            database: Some("test".to_string()),
            capabilities: CLIENT_CAPABILITIES,
        }
    }

    /// A session that completed authentication
    fn ready_session() -> Session {
        let (mut session, mut ready) = Session::new(config(), None);
        let mut script = Script::default();
        script.greeting("mysql_native_password");
        session.receive(&script.take()).unwrap();
        assert!(session.has_outgoing());
        session.take_outgoing();
        script.seq = 2;
        script.ok(0, 0);
        session.receive(&script.take()).unwrap();
        assert!(session.is_ready());
        assert!(ready.try_recv().unwrap().is_ok());
        session
    }

    fn query(session: &mut Session, sql: &str) -> ResultSet {
        let (result, sink) = ResultSet::channel();
        session.submit(Command::query(sql, Box::new(sink)));
        result
    }

    fn prepare(session: &mut Session, sql: &str) -> oneshot::Receiver<Result<StatementInfo>> {
        let (tx, rx) = oneshot::channel();
        session.submit(Command::prepare(sql, tx));
        rx
    }

    fn select_response() -> Vec<u8> {
        let mut script = Script::default();
        script
            .response()
            .columns(&[
                ("result", ColumnType::MYSQL_TYPE_LONGLONG),
                ("name", ColumnType::MYSQL_TYPE_VAR_STRING),
            ])
            .text_row(&[Some("2"), Some("a")])
            .text_row(&[Some("3"), None])
            .eof();
        script.take()
    }

    #[test]
    fn test_handshake_and_ready() {
        let session = ready_session();
        let info = session.server_info().unwrap();
        assert_eq!(info.server_version, "8.0.36");
        assert_eq!(info.connection_id, 7);
        assert!(!info.is_mariadb());
        assert!(info.capabilities.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB));
    }

    #[test]
    fn test_handshake_response_sequence() {
        let (mut session, _ready) = Session::new(config(), None);
        let mut script = Script::default();
        script.greeting("mysql_native_password");
        session.receive(&script.take()).unwrap();
        let out = session.take_outgoing();
        // sequence = greeting sequence + 1
        assert_eq!(out[3], 1);
        let caps = CLIENT_CAPABILITIES | CapabilityFlags::CLIENT_CONNECT_WITH_DB;
        assert_eq!(out[4..8], caps.bits().to_le_bytes());
    }

    #[test]
    fn test_handshake_error_rejects_ready() {
        let (mut session, mut ready) = Session::new(config(), None);
        let mut script = Script::default();
        script.greeting("mysql_native_password");
        script.err(1045, "28000", "Access denied");
        session.receive(&script.take()).unwrap();

        let err = ready.try_recv().unwrap().unwrap_err();
        assert_eq!(err.server_error_code(), Some(1045));
        assert!(session.is_disconnected());
    }

    #[test]
    fn test_handshake_error_goes_to_event_handler() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let handler = EventHandler::new(move |event| {
            sink.lock().unwrap().push(format!("{event:?}"));
        });
        let (mut session, ready) = Session::new(config(), Some(handler));
        drop(ready);

        let mut script = Script::default();
        script.packet(&[9, b'x']);
        assert!(session.receive(&script.take()).is_ok());

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].starts_with("Error(ProtocolError"));
        assert_eq!(events[1], "Disconnected");
    }

    #[test]
    fn test_handshake_error_returned_without_receivers() {
        let (mut session, ready) = Session::new(config(), None);
        drop(ready);
        let mut script = Script::default();
        script.packet(&[9, b'x']);
        let err = session.receive(&script.take()).unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_submit_before_ready() {
        let (mut session, _ready) = Session::new(config(), None);
        let mut result = query(&mut session, "SELECT 1");
        assert!(!session.has_outgoing());
        assert_eq!(result.status(), ResultStatus::Errored);
        assert!(matches!(
            block_on(result.array()),
            Err(Error::UsageError(_))
        ));
    }

    #[test]
    fn test_query_rows() {
        let mut session = ready_session();
        let mut result = query(&mut session, "SELECT 1+1 AS result");
        assert_eq!(session.take_outgoing(), b"\x15\x00\x00\x00\x03SELECT 1+1 AS result");

        session.receive(&select_response()).unwrap();
        assert_eq!(session.pending(), 0);
        let rows = block_on(result.array()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get_i64("result").unwrap(), 2);
        assert_eq!(rows[1].get_str_opt("name").unwrap(), None);
    }

    #[test]
    fn test_byte_at_a_time_matches_all_at_once() {
        let mut whole = ready_session();
        let mut expected = query(&mut whole, "SELECT");
        whole.receive(&select_response()).unwrap();

        let mut split = ready_session();
        let mut actual = query(&mut split, "SELECT");
        for byte in select_response() {
            split.receive(&[byte]).unwrap();
        }

        assert_eq!(
            block_on(actual.array()).unwrap(),
            block_on(expected.array()).unwrap()
        );
    }

    #[test]
    fn test_fifo_order() {
        let mut session = ready_session();
        let mut results: Vec<ResultSet> = (0..5)
            .map(|i| query(&mut session, &format!("INSERT {i}")))
            .collect();
        assert_eq!(session.pending(), 5);

        let mut script = Script::default();
        for i in 0..5 {
            script.response().ok(1, i + 1);
        }
        session.receive(&script.take()).unwrap();

        for (i, result) in results.iter_mut().enumerate() {
            block_on(result.finish()).unwrap();
            assert_eq!(result.last_insert_id(), Some(i as u64 + 1));
            assert_eq!(result.affected_rows(), Some(1));
        }
    }

    #[test]
    fn test_error_is_isolated_to_its_command() {
        let mut session = ready_session();
        let mut missing = query(&mut session, "SELECT * FROM missing");
        let mut ok = query(&mut session, "SELECT 1+1 AS result");

        let mut script = Script::default();
        script
            .response()
            .err(1146, "42S02", "Table 'test.missing' doesn't exist");
        session.receive(&script.take()).unwrap();
        session.receive(&select_response()).unwrap();

        let err = block_on(missing.array()).unwrap_err();
        assert_eq!(err.server_error_code(), Some(1146));
        assert_eq!(block_on(ok.array()).unwrap().len(), 2);
        assert!(session.is_ready());
    }

    #[test]
    fn test_error_after_columns() {
        let mut session = ready_session();
        let mut result = query(&mut session, "SELECT");
        let mut script = Script::default();
        script
            .response()
            .columns(&[("a", ColumnType::MYSQL_TYPE_VAR_STRING)])
            .text_row(&[Some("x")])
            .err(1317, "70100", "Query execution was interrupted");
        session.receive(&script.take()).unwrap();
        assert_eq!(session.pending(), 0);

        let err = block_on(result.array()).unwrap_err();
        assert_eq!(err.server_error_code(), Some(1317));
    }

    #[test]
    fn test_large_first_column_is_row_data() {
        let mut session = ready_session();
        let mut result = query(&mut session, "SELECT REPEAT('x', 300)");
        let value = "x".repeat(300);

        let mut script = Script::default();
        script
            .response()
            .columns(&[("v", ColumnType::MYSQL_TYPE_VAR_STRING)]);
        // lenenc with 0xFE prefix: 9-byte header, so not an EOF
        let mut row = vec![0xfe];
        row.extend_from_slice(&300u64.to_le_bytes());
        row.extend_from_slice(value.as_bytes());
        script.packet(&row).eof();
        session.receive(&script.take()).unwrap();

        let rows = block_on(result.array()).unwrap();
        assert_eq!(rows[0].get_str(0).unwrap(), value);
    }

    #[test]
    fn test_prepare_with_params_and_columns() {
        let mut session = ready_session();
        let mut rx = prepare(&mut session, "SELECT ? + ? AS sum");
        assert_eq!(session.take_outgoing(), b"\x14\x00\x00\x00\x16SELECT ? + ? AS sum");

        let mut script = Script::default();
        script
            .response()
            .prepare_ok(1, 1, 2)
            .definitions(&[
                ("?", ColumnType::MYSQL_TYPE_VAR_STRING),
                ("?", ColumnType::MYSQL_TYPE_VAR_STRING),
            ])
            .eof()
            .definitions(&[("sum", ColumnType::MYSQL_TYPE_DOUBLE)]);
        session.receive(&script.take()).unwrap();
        // the final EOF is still outstanding
        assert!(rx.try_recv().is_err());
        assert_eq!(session.pending(), 1);

        script.eof();
        session.receive(&script.take()).unwrap();
        let info = rx.try_recv().unwrap().unwrap();
        assert_eq!(info.id, 1);
        assert_eq!(info.params.len(), 2);
        assert_eq!(info.columns.len(), 1);
        assert_eq!(info.columns[0].name, "sum");
        assert_eq!(session.pending(), 0);
    }

    #[test]
    fn test_prepare_without_params_or_columns() {
        let mut session = ready_session();
        let mut rx = prepare(&mut session, "DO 1");
        let mut script = Script::default();
        script.response().prepare_ok(9, 0, 0);
        session.receive(&script.take()).unwrap();

        let info = rx.try_recv().unwrap().unwrap();
        assert_eq!(info.id, 9);
        assert!(info.params.is_empty());
        assert!(info.columns.is_empty());
    }

    #[test]
    fn test_prepare_params_only() {
        let mut session = ready_session();
        let mut rx = prepare(&mut session, "INSERT INTO t VALUES (?)");
        let mut script = Script::default();
        script
            .response()
            .prepare_ok(3, 0, 1)
            .definitions(&[("?", ColumnType::MYSQL_TYPE_VAR_STRING)])
            .eof();
        session.receive(&script.take()).unwrap();

        let info = rx.try_recv().unwrap().unwrap();
        assert_eq!(info.params.len(), 1);
        assert!(info.columns.is_empty());
    }

    #[test]
    fn test_prepare_error() {
        let mut session = ready_session();
        let mut rx = prepare(&mut session, "SELEKT");
        let mut script = Script::default();
        script.response().err(1064, "42000", "You have an error in your SQL syntax");
        session.receive(&script.take()).unwrap();

        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.server_error_code(), Some(1064));
    }

    #[test]
    fn test_execute_binary_rows() {
        let mut session = ready_session();
        let (mut result, sink) = ResultSet::channel();
        session.submit(Command::execute(vec![0x17, 1, 0, 0, 0, 0, 1, 0, 0, 0], Box::new(sink)));

        let mut script = Script::default();
        script
            .response()
            .columns(&[("sum", ColumnType::MYSQL_TYPE_LONGLONG)]);
        let mut row = vec![0x00, 0x00];
        row.extend_from_slice(&30i64.to_le_bytes());
        script.packet(&row);
        // a NULL value: bit 2
        script.packet(&[0x00, 0b100]).eof();
        session.receive(&script.take()).unwrap();

        let rows = block_on(result.array()).unwrap();
        assert_eq!(rows[0].get_i64("sum").unwrap(), 30);
        assert!(rows[1].is_null(0).unwrap());
    }

    #[test]
    fn test_execute_ok_starting_with_zero() {
        let mut session = ready_session();
        let (mut result, sink) = ResultSet::channel();
        session.submit(Command::execute(vec![0x17, 1, 0, 0, 0, 0, 1, 0, 0, 0], Box::new(sink)));
        let mut script = Script::default();
        script.response().ok(1, 1);
        session.receive(&script.take()).unwrap();

        let ok = block_on(result.finish()).unwrap();
        assert_eq!(ok.affected_rows, 1);
    }

    #[test]
    fn test_row_decode_error_fails_once_and_drains() {
        let mut session = ready_session();
        let mut bad = query(&mut session, "SELECT");
        let mut next = query(&mut session, "SELECT 1");

        let mut script = Script::default();
        script
            .response()
            .columns(&[("a", ColumnType::MYSQL_TYPE_VAR_STRING)])
            .packet(&[0x05, b'a'])
            .packet(&[0x07])
            .text_row(&[Some("ok")])
            .eof();
        session.receive(&script.take()).unwrap();
        session.receive(&select_response()).unwrap();

        assert!(block_on(bad.array()).unwrap_err().is_protocol_error());
        assert_eq!(block_on(next.array()).unwrap().len(), 2);
    }

    #[test]
    fn test_ping_and_close_statement() {
        let mut session = ready_session();
        let (mut result, sink) = ResultSet::channel();
        session.submit(Command::ping(Box::new(sink)));
        session.submit(Command::close_statement(4));
        assert_eq!(
            session.take_outgoing(),
            [1, 0, 0, 0, 0x0e, 5, 0, 0, 0, 0x19, 4, 0, 0, 0]
        );
        // COM_STMT_CLOSE is not queued
        assert_eq!(session.pending(), 1);

        let mut script = Script::default();
        script.response().ok(0, 0);
        session.receive(&script.take()).unwrap();
        assert!(block_on(result.finish()).is_ok());
    }

    #[test]
    fn test_disconnect_settles_everything_once() {
        let events = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&events);
        let handler = EventHandler::new(move |event| {
            if matches!(event, ConnEvent::Disconnected) {
                *counter.lock().unwrap() += 1;
            }
        });
        let (mut session, _ready) = Session::new(config(), Some(handler));
        let mut script = Script::default();
        script.greeting("mysql_native_password");
        session.receive(&script.take()).unwrap();
        script.seq = 2;
        script.ok(0, 0);
        session.receive(&script.take()).unwrap();

        let mut a = query(&mut session, "SELECT 1");
        let mut rx = prepare(&mut session, "SELECT ?");
        session.disconnect();
        session.disconnect();

        assert!(matches!(
            block_on(a.array()),
            Err(Error::ConnectionLost)
        ));
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::ConnectionLost)));
        assert_eq!(*events.lock().unwrap(), 1);

        let mut late = query(&mut session, "SELECT 2");
        assert!(matches!(
            block_on(late.array()),
            Err(Error::ConnectionLost)
        ));
    }

    #[test]
    fn test_disconnect_before_ready() {
        let (mut session, mut ready) = Session::new(config(), None);
        session.disconnect();
        assert!(matches!(ready.try_recv().unwrap(), Err(Error::ConnectionLost)));
    }

    #[test]
    fn test_unexpected_packet_is_fatal() {
        let mut session = ready_session();
        let mut script = Script::default();
        script.response().ok(0, 0);
        let err = session.receive(&script.take()).unwrap_err();
        assert!(err.is_protocol_error());
        assert!(session.is_disconnected());
    }

    #[test]
    fn test_quit_closes_queue() {
        let mut session = ready_session();
        let mut pending = query(&mut session, "SELECT 1");
        session.submit(Command::quit());
        assert!(session.is_closing());

        let mut after = query(&mut session, "SELECT 2");
        assert!(matches!(
            block_on(after.array()),
            Err(Error::ConnectionLost)
        ));

        // responses to earlier commands still arrive
        session.receive(&select_response()).unwrap();
        assert_eq!(block_on(pending.array()).unwrap().len(), 2);
    }

    /// Run a future whose result is already settled
    pub(crate) fn block_on<F: std::future::Future>(future: F) -> F::Output {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(future)
    }
}
