//! End-to-end tests against a scripted server over an in-memory duplex stream

use std::sync::{Arc, Mutex};

use mysql_fifo::constant::{CLIENT_CAPABILITIES, CapabilityFlags, ColumnType};
use mysql_fifo::error::Error;
use mysql_fifo::{Conn, ConnEvent, Opts};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const SCRAMBLE: &[u8; 20] = b"abcdefghijklmnopqrst";

struct MockServer {
    stream: DuplexStream,
}

impl MockServer {
    async fn read_packet(&mut self) -> Option<(u8, Vec<u8>)> {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await.ok()?;
        let len = usize::from(header[0]) | usize::from(header[1]) << 8 | usize::from(header[2]) << 16;
        let mut payload = vec![0; len];
        self.stream.read_exact(&mut payload).await.ok()?;
        Some((header[3], payload))
    }

    async fn command(&mut self) -> Vec<u8> {
        let (seq, payload) = self.read_packet().await.unwrap();
        assert_eq!(seq, 0);
        payload
    }

    async fn send(&mut self, seq: u8, payload: &[u8]) {
        let len = payload.len() as u32;
        let mut packet = len.to_le_bytes()[..3].to_vec();
        packet.push(seq);
        packet.extend_from_slice(payload);
        self.stream.write_all(&packet).await.unwrap();
    }

    /// Send packets numbered from 1, as a command response
    async fn respond(&mut self, packets: &[Vec<u8>]) {
        for (i, packet) in packets.iter().enumerate() {
            self.send(i as u8 + 1, packet).await;
        }
    }

    async fn handshake(&mut self) {
        self.send(0, &greeting()).await;
        let (seq, response) = self.read_packet().await.unwrap();
        assert_eq!(seq, 1);
        let caps = u32::from_le_bytes(response[..4].try_into().unwrap());
        assert!(caps & CapabilityFlags::CLIENT_PROTOCOL_41.bits() != 0);
        self.send(2, &ok(0, 0)).await;
    }
}

fn lenenc_str(out: &mut Vec<u8>, s: &[u8]) {
    out.push(s.len() as u8);
    out.extend_from_slice(s);
}

fn greeting() -> Vec<u8> {
    let caps = (CLIENT_CAPABILITIES | CapabilityFlags::CLIENT_CONNECT_WITH_DB).bits();
    let mut out = vec![10];
    out.extend_from_slice(b"10.11.6-MariaDB\0");
    out.extend_from_slice(&42u32.to_le_bytes());
    out.extend_from_slice(&SCRAMBLE[..8]);
    out.push(0);
    out.extend_from_slice(&(caps as u16).to_le_bytes());
    out.push(45);
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
    out.push(21);
    out.extend_from_slice(&[0; 10]);
    out.extend_from_slice(&SCRAMBLE[8..]);
    out.push(0);
    out.extend_from_slice(b"mysql_native_password\0");
    out
}

fn ok(affected_rows: u8, last_insert_id: u8) -> Vec<u8> {
    vec![0x00, affected_rows, last_insert_id, 0x02, 0x00, 0x00, 0x00]
}

fn eof() -> Vec<u8> {
    vec![0xfe, 0x00, 0x00, 0x02, 0x00]
}

fn err(code: u16, state: &str, message: &str) -> Vec<u8> {
    let mut out = vec![0xff];
    out.extend_from_slice(&code.to_le_bytes());
    out.push(b'#');
    out.extend_from_slice(state.as_bytes());
    out.extend_from_slice(message.as_bytes());
    out
}

fn column(name: &str, column_type: ColumnType) -> Vec<u8> {
    let mut out = Vec::new();
    for field in ["def", "test", "", "", name, ""] {
        lenenc_str(&mut out, field.as_bytes());
    }
    out.push(0x0c);
    out.extend_from_slice(&45u16.to_le_bytes());
    out.extend_from_slice(&20u32.to_le_bytes());
    out.push(column_type as u8);
    out.extend_from_slice(&[0, 0, 0, 0, 0]);
    out
}

fn text_row(values: &[Option<&str>]) -> Vec<u8> {
    let mut out = Vec::new();
    for value in values {
        match value {
            Some(value) => lenenc_str(&mut out, value.as_bytes()),
            None => out.push(0xfb),
        }
    }
    out
}

fn opts() -> Opts {
    Opts {
        user: "test".to_string(),
        password: "1234".to_string(),
        db: Some("test".to_string()),
        ..Opts::default()
    }
}

async fn connect() -> (Conn, MockServer) {
    connect_with(opts()).await
}

async fn connect_with(opts: Opts) -> (Conn, MockServer) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
    let (client, server) = tokio::io::duplex(64 * 1024);
    let mut server = MockServer { stream: server };
    let (conn, ()) = tokio::join!(Conn::with_stream(client, &opts), server.handshake());
    (conn.unwrap(), server)
}

#[tokio::test]
async fn test_connect_reports_server_info() {
    let (conn, _server) = connect().await;
    assert_eq!(conn.server_version(), "10.11.6-MariaDB");
    assert_eq!(conn.connection_id(), 42);
    assert!(conn.is_mariadb());
    assert!(
        conn.capability_flags()
            .contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB)
    );
}

#[tokio::test]
async fn test_query_array() {
    let (conn, mut server) = connect().await;
    let mut result = conn.query("SELECT 1+1 AS result");

    assert_eq!(server.command().await, b"\x03SELECT 1+1 AS result");
    server
        .respond(&[
            vec![0x01],
            column("result", ColumnType::MYSQL_TYPE_LONGLONG),
            eof(),
            text_row(&[Some("2")]),
            eof(),
        ])
        .await;

    let rows = result.array().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_i64("result").unwrap(), 2);
    assert_eq!(result.fields().unwrap()[0].name, "result");
}

#[tokio::test]
async fn test_pipelined_queries_resolve_in_order() {
    let (conn, mut server) = connect().await;
    let mut results: Vec<_> = (1..=3)
        .map(|i| conn.query(&format!("INSERT INTO t VALUES ({i})")))
        .collect();

    for i in 1..=3u8 {
        let command = server.command().await;
        assert_eq!(command, format!("\x03INSERT INTO t VALUES ({i})").into_bytes());
    }
    for i in 1..=3u8 {
        server.respond(&[ok(1, i)]).await;
    }

    for (i, result) in results.iter_mut().enumerate() {
        let ok = result.finish().await.unwrap();
        assert_eq!(ok.last_insert_id, i as u64 + 1);
        assert_eq!(result.affected_rows(), Some(1));
    }
}

#[tokio::test]
async fn test_server_error_only_fails_its_command() {
    let (conn, mut server) = connect().await;
    let mut missing = conn.query("SELECT * FROM missing");
    let mut syntax = conn.query("SELEKT * FORM users");
    let mut fine = conn.query("SELECT 'x' AS v");

    for _ in 0..3 {
        server.command().await;
    }
    server
        .respond(&[err(1146, "42S02", "Table 'test.missing' doesn't exist")])
        .await;
    server
        .respond(&[err(1064, "42000", "You have an error in your SQL syntax")])
        .await;
    server
        .respond(&[
            vec![0x01],
            column("v", ColumnType::MYSQL_TYPE_VAR_STRING),
            eof(),
            text_row(&[Some("x")]),
            eof(),
        ])
        .await;

    let err = missing.array().await.unwrap_err();
    assert_eq!(err.server_error_code(), Some(1146));
    assert!(!err.is_fatal());
    assert_eq!(syntax.array().await.unwrap_err().server_error_code(), Some(1064));
    assert_eq!(fine.array().await.unwrap()[0].get_str("v").unwrap(), "x");
}

#[tokio::test]
async fn test_rows_stream_and_map() {
    let (conn, mut server) = connect().await;
    let mut streamed = conn.query("SELECT n FROM t");
    let mut mapped = conn.query("SELECT n FROM t");

    let response = [
        vec![0x01],
        column("n", ColumnType::MYSQL_TYPE_LONG),
        eof(),
        text_row(&[Some("1")]),
        text_row(&[None]),
        text_row(&[Some("3")]),
        eof(),
    ];
    server.command().await;
    server.command().await;
    server.respond(&response).await;
    server.respond(&response).await;

    let mut rows = streamed.rows().unwrap();
    let mut seen = Vec::new();
    while let Some(row) = rows.next().await {
        seen.push(row.unwrap().get_i64_opt("n").unwrap());
    }
    assert_eq!(seen, vec![Some(1), None, Some(3)]);

    let nulls = mapped
        .map(|row| row.is_null(0).unwrap())
        .await
        .unwrap();
    assert_eq!(nulls, vec![false, true, false]);
}

#[tokio::test]
async fn test_prepare_and_execute() {
    let (conn, mut server) = connect().await;
    let prepare = tokio::spawn({
        let conn = conn.clone();
        async move { conn.prepare("SELECT ? + ? AS sum").await }
    });

    assert_eq!(server.command().await, b"\x16SELECT ? + ? AS sum");
    let mut prepare_ok = vec![0x00];
    prepare_ok.extend_from_slice(&5u32.to_le_bytes());
    prepare_ok.extend_from_slice(&1u16.to_le_bytes());
    prepare_ok.extend_from_slice(&2u16.to_le_bytes());
    prepare_ok.extend_from_slice(&[0, 0, 0]);
    server
        .respond(&[
            prepare_ok,
            column("?", ColumnType::MYSQL_TYPE_VAR_STRING),
            column("?", ColumnType::MYSQL_TYPE_VAR_STRING),
            eof(),
            column("sum", ColumnType::MYSQL_TYPE_LONGLONG),
            eof(),
        ])
        .await;

    let statement = prepare.await.unwrap().unwrap();
    assert_eq!(statement.id(), 5);
    assert_eq!(statement.params().len(), 2);
    assert_eq!(statement.columns()[0].name, "sum");

    let wrong = statement.execute((1,));
    assert!(matches!(wrong, Err(Error::UsageError(_))));

    let mut result = statement.execute((10, 20)).unwrap();
    assert_eq!(
        server.command().await,
        [
            0x17, 5, 0, 0, 0, 0x00, 1, 0, 0, 0, // id, flags, iterations
            0x00, 0x01, // null bitmap, new params bound
            0xfd, 0x00, 0xfd, 0x00, // types
            2, b'1', b'0', 2, b'2', b'0',
        ]
    );

    let mut row = vec![0x00, 0x00];
    row.extend_from_slice(&30i64.to_le_bytes());
    server
        .respond(&[
            vec![0x01],
            column("sum", ColumnType::MYSQL_TYPE_LONGLONG),
            eof(),
            row,
            eof(),
        ])
        .await;
    let rows = result.array().await.unwrap();
    assert_eq!(rows[0].get_i64("sum").unwrap(), 30);
}

#[tokio::test]
async fn test_statement_close_is_sent_once() {
    let (conn, mut server) = connect().await;
    let prepare = tokio::spawn({
        let conn = conn.clone();
        async move { conn.prepare("DO 1").await }
    });
    server.command().await;
    let mut prepare_ok = vec![0x00];
    prepare_ok.extend_from_slice(&8u32.to_le_bytes());
    prepare_ok.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0]);
    server.respond(&[prepare_ok]).await;

    let mut statement = prepare.await.unwrap().unwrap();
    statement.close().unwrap();
    statement.close().unwrap();
    assert!(statement.is_closed());
    assert!(matches!(statement.execute(()), Err(Error::UsageError(_))));

    let ping = tokio::spawn({
        let conn = conn.clone();
        async move { conn.ping().await }
    });
    assert_eq!(server.command().await, [0x19, 8, 0, 0, 0]);
    // the next command is the ping, not a second close
    assert_eq!(server.command().await, [0x0e]);
    server.respond(&[ok(0, 0)]).await;
    ping.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_handshake_error() {
    let (client, server) = tokio::io::duplex(4096);
    let mut server = MockServer { stream: server };
    let server_task = async {
        server.send(0, &greeting()).await;
        server.read_packet().await.unwrap();
        server
            .send(2, &err(1045, "28000", "Access denied for user 'test'"))
            .await;
    };

    let opts = opts();
    let (conn, ()) = tokio::join!(Conn::with_stream(client, &opts), server_task);
    let err = conn.unwrap_err();
    assert_eq!(err.server_error_code(), Some(1045));
}

#[tokio::test]
async fn test_connection_lost_settles_pending() {
    let (conn, mut server) = connect().await;
    let mut pending = conn.query("SELECT SLEEP(10)");
    server.command().await;
    drop(server);

    assert!(matches!(pending.array().await, Err(Error::ConnectionLost)));

    let mut late = conn.query("SELECT 1");
    assert!(matches!(late.array().await, Err(Error::ConnectionLost)));
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_unexpected_packet_closes_connection() {
    let (conn, mut server) = connect().await;
    let mut result = conn.query("SELECT 1");
    server.command().await;
    server.respond(&[eof()]).await;

    let err = result.array().await.unwrap_err();
    assert!(err.is_protocol_error());
    assert!(!err.is_fatal());
    assert!(conn.is_closed());
    assert!(matches!(
        conn.query("SELECT 2").array().await,
        Err(Error::ConnectionLost)
    ));
}

#[tokio::test]
async fn test_events_and_quit_on_drop() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let opts = opts().with_event_handler(move |event| {
        let name = match event {
            ConnEvent::Authenticated(_) => "authenticated",
            ConnEvent::Error(_) => "error",
            ConnEvent::Disconnected => "disconnected",
        };
        sink.lock().unwrap().push(name);
    });

    let (conn, mut server) = connect_with(opts).await;
    drop(conn);

    assert_eq!(server.command().await, [0x01]);
    assert!(server.read_packet().await.is_none());

    // the driver settles after the transport closes
    for _ in 0..100 {
        if events.lock().unwrap().len() == 2 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(*events.lock().unwrap(), vec!["authenticated", "disconnected"]);
}

#[tokio::test]
async fn test_explicit_close_keeps_earlier_results() {
    let (conn, mut server) = connect().await;
    let mut before = conn.query("SELECT 1");
    conn.close();
    let mut after = conn.query("SELECT 2");

    assert_eq!(server.command().await, b"\x03SELECT 1");
    assert_eq!(server.command().await, [0x01]);
    server.respond(&[ok(0, 0)]).await;

    assert!(before.finish().await.is_ok());
    assert!(matches!(after.array().await, Err(Error::ConnectionLost)));
}
