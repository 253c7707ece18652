//! Result sets handed to callers.
//!
//! The session pushes packets into a [`ResultSink`]; the caller pulls them from
//! the paired [`ResultSet`] in one of three ways: all rows at once
//! ([`ResultSet::array`]), mapped as they arrive ([`ResultSet::map`]), or one at
//! a time ([`ResultSet::rows`]).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::col::FieldDescription;
use crate::error::{Error, Result};
use crate::protocol::r#trait::ResultSetHandler;
use crate::protocol::response::OkPayload;
use crate::row::Row;

/// Progress of a result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// Waiting for the first response packet
    NotStarted,
    /// Column definitions received, rows may follow
    Started,
    Completed,
    Errored,
}

impl ResultStatus {
    pub fn is_settled(self) -> bool {
        matches!(self, ResultStatus::Completed | ResultStatus::Errored)
    }
}

#[derive(Debug)]
struct ResultState {
    status: ResultStatus,
    fields: Option<Arc<[FieldDescription]>>,
    rows: VecDeque<Row>,
    ok: Option<OkPayload>,
    error: Option<Error>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<ResultState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ResultState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut ResultState)) {
        {
            let mut state = self.lock();
            if state.status.is_settled() {
                return;
            }
            f(&mut state);
        }
        self.notify.notify_one();
    }
}

/// Producer half, owned by the command queue
#[derive(Debug)]
pub struct ResultSink {
    shared: Arc<Shared>,
}

impl ResultSetHandler for ResultSink {
    fn resultset_start(&mut self, fields: Arc<[FieldDescription]>) {
        self.shared.update(|state| {
            state.fields = Some(fields);
            state.status = ResultStatus::Started;
        });
    }

    fn row(&mut self, row: Row) {
        self.shared.update(|state| state.rows.push_back(row));
    }

    fn resultset_end(&mut self, ok: OkPayload) {
        self.shared.update(|state| {
            state.ok = Some(ok);
            state.status = ResultStatus::Completed;
        });
    }

    fn fail(&mut self, err: Error) {
        // Rows already buffered stay readable ahead of the error
        self.shared.update(|state| {
            state.error = Some(err);
            state.status = ResultStatus::Errored;
        });
    }
}

impl Drop for ResultSink {
    fn drop(&mut self) {
        // Never leave a consumer waiting on a sink that can no longer settle
        self.fail(Error::ConnectionLost);
    }
}

/// The response to one query or statement execution
#[derive(Debug)]
pub struct ResultSet {
    shared: Arc<Shared>,
    consumed: bool,
}

impl ResultSet {
    /// A result and the sink that fills it
    pub fn channel() -> (ResultSet, ResultSink) {
        let shared = Arc::new(Shared {
            state: Mutex::new(ResultState {
                status: ResultStatus::NotStarted,
                fields: None,
                rows: VecDeque::new(),
                ok: None,
                error: None,
            }),
            notify: Notify::new(),
        });
        (
            ResultSet {
                shared: Arc::clone(&shared),
                consumed: false,
            },
            ResultSink { shared },
        )
    }

    pub fn status(&self) -> ResultStatus {
        self.shared.lock().status
    }

    /// Column metadata, once the server has sent it
    pub fn fields(&self) -> Option<Arc<[FieldDescription]>> {
        self.shared.lock().fields.clone()
    }

    /// The terminating OK or EOF, once completed
    pub fn ok_payload(&self) -> Option<OkPayload> {
        self.shared.lock().ok.clone()
    }

    pub fn affected_rows(&self) -> Option<u64> {
        self.shared.lock().ok.as_ref().map(|ok| ok.affected_rows)
    }

    pub fn last_insert_id(&self) -> Option<u64> {
        self.shared.lock().ok.as_ref().map(|ok| ok.last_insert_id)
    }

    fn consume(&mut self) -> Result<()> {
        if self.consumed {
            return Err(Error::UsageError(
                "result has already been consumed".to_string(),
            ));
        }
        self.consumed = true;
        Ok(())
    }

    /// Every row, once the result completes
    pub async fn array(&mut self) -> Result<Vec<Row>> {
        self.consume()?;
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.lock();
                match state.status {
                    ResultStatus::Completed => return Ok(state.rows.drain(..).collect()),
                    ResultStatus::Errored => return Err(take_error(&mut state)),
                    ResultStatus::NotStarted | ResultStatus::Started => {}
                }
            }
            notified.await;
        }
    }

    /// Apply `f` to each row as it arrives.
    ///
    /// A later error discards the mapped values and is returned instead.
    pub async fn map<T>(&mut self, mut f: impl FnMut(Row) -> T) -> Result<Vec<T>> {
        let mut rows = self.rows()?;
        let mut mapped = Vec::new();
        while let Some(row) = rows.next().await {
            mapped.push(f(row?));
        }
        Ok(mapped)
    }

    /// Pull rows one at a time
    pub fn rows(&mut self) -> Result<RowStream> {
        self.consume()?;
        Ok(RowStream {
            shared: Arc::clone(&self.shared),
            done: false,
        })
    }

    /// Wait for completion, discarding any rows
    pub async fn finish(&mut self) -> Result<OkPayload> {
        let mut rows = self.rows()?;
        while let Some(row) = rows.next().await {
            row?;
        }
        Ok(self.ok_payload().unwrap_or_default())
    }
}

fn take_error(state: &mut ResultState) -> Error {
    state.error.take().unwrap_or(Error::ConnectionLost)
}

/// Lazy row iteration over a [`ResultSet`]
#[derive(Debug)]
pub struct RowStream {
    shared: Arc<Shared>,
    done: bool,
}

impl RowStream {
    /// The next row, `None` after the last one.
    ///
    /// Rows buffered before a failure are yielded first. The error is yielded
    /// once, after which the stream ends.
    pub async fn next(&mut self) -> Option<Result<Row>> {
        loop {
            if self.done {
                return None;
            }
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.lock();
                if let Some(row) = state.rows.pop_front() {
                    return Some(Ok(row));
                }
                match state.status {
                    ResultStatus::Completed => {
                        self.done = true;
                        return None;
                    }
                    ResultStatus::Errored => {
                        self.done = true;
                        return Some(Err(take_error(&mut state)));
                    }
                    ResultStatus::NotStarted | ResultStatus::Started => {}
                }
            }
            notified.await;
        }
    }
}
