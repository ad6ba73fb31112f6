//! Query submission and the asynchronous completion state machine.

use tracing::debug;

use super::connection::{log_query, AsyncStatus, Connection};
use super::cursor::Cursor;
use super::wire::Flush;
use crate::error::{Error, Result};

/// How a command is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Block until the command completes and fetch its result.
    Sync,
    /// Send the command and return; completion is driven by polling.
    Async,
}

/// Successful outcome of [`Cursor::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Executed {
    /// Synchronous command completed and fetched.
    Completed,
    /// Asynchronous command submitted.
    Submitted,
}

/// What an asynchronous command is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Ok,
    Read,
    Write,
}

/// Whether a complete result has been assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyState {
    Ready,
    Busy,
}

impl Connection {
    /// Run `query` for `cursor`, opening a transaction first when needed.
    pub(crate) fn execute(
        &self,
        cursor: &mut Cursor,
        query: &str,
        mode: ExecMode,
    ) -> Result<Executed> {
        // any outstanding asynchronous command blocks a new one, even from its owner
        let ex = self.reserve("execute", None)?;
        cursor.reset();

        if let Some(err) = ex.locked(|s| s.resolve_critical(true)) {
            return Err(err);
        }
        ex.locked(|s| s.check_session())?;
        ex.begin()?;

        match mode {
            ExecMode::Sync => {
                let result = ex.exec(query)?;
                cursor.pending = Some(result);
                ex.fetch(cursor)?;
                cursor.mark = ex.locked(|s| s.mark);
                Ok(Executed::Completed)
            }
            ExecMode::Async => {
                debug!(query = log_query(query), "submitting asynchronously");
                let owner = cursor.id;
                cursor.mark = ex.locked(|s| {
                    let sent = s
                        .session
                        .set_nonblocking(true)
                        .and_then(|_| s.session.send_query(query));
                    let flushed = match sent {
                        Ok(()) => s.flush_locked(),
                        Err(e) => Err(s.wire_failure(e)),
                    };
                    s.async_status = match flushed {
                        Ok(Flush::Done) => AsyncStatus::Read,
                        Ok(Flush::Pending) => AsyncStatus::Write,
                        Err(err) => {
                            s.restore_blocking();
                            return Err(err);
                        }
                    };
                    s.async_owner = Some(owner);
                    Ok(s.mark)
                })?;
                Ok(Executed::Submitted)
            }
        }
    }

    /// Advance the asynchronous command owned by `cursor`.
    ///
    /// Once the backend has answered, the last result of the submission is
    /// fetched into the cursor and the connection is free again.
    pub fn poll(&self, cursor: &mut Cursor) -> Result<PollState> {
        let ex = self.acquire(|s| s.check_open())?;

        let (owner, status) = ex.locked(|s| (s.async_owner, s.async_status));
        match owner {
            None => return Ok(PollState::Ok),
            Some(id) if id != cursor.id => {
                return Err(Error::programming(
                    "poll with a cursor that doesn't own the asynchronous query",
                ))
            }
            Some(_) => {}
        }

        if status == AsyncStatus::Write {
            return match ex.locked(|s| s.flush_locked()) {
                Ok(Flush::Pending) => Ok(PollState::Write),
                Ok(Flush::Done) => {
                    ex.locked(|s| s.async_status = AsyncStatus::Read);
                    Ok(PollState::Read)
                }
                Err(err) => Err(ex.locked(|s| s.abandon_async(err))),
            };
        }

        match ex.locked(|s| s.is_busy_locked()) {
            Ok(true) => return Ok(PollState::Read),
            Ok(false) => {}
            Err(err) => return Err(ex.locked(|s| s.abandon_async(err))),
        }

        let result = ex.locked(|s| {
            s.async_owner = None;
            s.async_status = AsyncStatus::Done;
            let last = s.last_result();
            s.restore_blocking();
            last
        })?;
        debug!("asynchronous command complete");
        cursor.pending = result;
        ex.fetch(cursor)?;
        Ok(PollState::Ok)
    }

    /// Consume available input without blocking.
    pub fn poll_busy(&self) -> Result<BusyState> {
        let ex = self.acquire(|s| s.check_open())?;
        let busy = ex.locked(|s| {
            let busy = s.is_busy_locked();
            s.harvest();
            busy
        })?;
        Ok(if busy { BusyState::Busy } else { BusyState::Ready })
    }

    /// Push buffered outbound bytes to the socket.
    pub fn flush_pending(&self) -> Result<Flush> {
        let ex = self.acquire(|s| s.check_open())?;
        ex.locked(|s| {
            let flushed = s.flush_locked();
            s.harvest();
            flushed
        })
    }
}
