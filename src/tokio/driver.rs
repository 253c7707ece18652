use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::session::{Command, Session};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Owns the transport and the session until the connection ends.
///
/// Reads are fed to the session as they arrive; outgoing bytes go to a separate
/// writer task so a long pipeline never blocks reading. Once every `Conn`
/// handle is dropped and the queue drains, COM_QUIT is sent.
#[instrument(skip_all)]
pub(crate) async fn run<S>(
    stream: S,
    mut session: Session,
    mut commands: mpsc::UnboundedReceiver<Command>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let mut writer_task = tokio::spawn(write_loop(writer, out_rx));
    let mut writer_done = false;

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut accepting = true;

    loop {
        if session.has_outgoing() && out_tx.send(session.take_outgoing()).is_err() {
            break;
        }
        if session.is_disconnected() {
            break;
        }
        if session.pending() == 0 {
            if session.is_closing() {
                break;
            }
            if !accepting {
                if session.is_ready() {
                    session.submit(Command::quit());
                    continue;
                }
                break;
            }
        }

        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("server closed the connection");
                    break;
                }
                Ok(n) => {
                    if let Err(err) = session.receive(&buf[..n]) {
                        warn!(error = %err, "connection failed");
                    }
                }
                Err(err) => {
                    warn!(error = %err, "read failed");
                    break;
                }
            },
            command = commands.recv(), if accepting => match command {
                Some(command) => session.submit(command),
                None => {
                    debug!(pending = session.pending(), "all handles dropped");
                    accepting = false;
                }
            },
            _ = &mut writer_task, if !writer_done => {
                writer_done = true;
                break;
            }
        }
    }

    session.disconnect();
    commands.close();
    while let Ok(command) = commands.try_recv() {
        session.submit(command);
    }
    drop(out_tx);
    if !writer_done {
        let _ = writer_task.await;
    }
}

async fn write_loop<W>(mut writer: W, mut out: mpsc::UnboundedReceiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = out.recv().await {
        if let Err(err) = writer.write_all(&bytes).await {
            warn!(error = %err, "write failed");
            return;
        }
        if !out.is_empty() {
            continue;
        }
        if let Err(err) = writer.flush().await {
            warn!(error = %err, "flush failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}
