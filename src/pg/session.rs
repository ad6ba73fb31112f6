//! Protocol-3 session over an established byte stream.
//!
//! This module provides [`PgSession`], the [`WireSession`] used in production:
//! - Buffered framing of frontend and backend messages
//! - Result assembly for the simple query protocol
//! - COPY IN / COPY OUT, including libpq's line-based emulation
//!
//! Startup and authentication are not handled here: the stream must already
//! be past ReadyForQuery when it is handed over.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace};

use super::protocol::*;
use super::wire::*;

// ============================================================================
// Socket
// ============================================================================

/// A bidirectional byte stream carrying the session.
pub trait Socket: Read + Write + Send {
    fn set_nonblocking(&mut self, _nonblocking: bool) -> io::Result<()> {
        Ok(())
    }

    fn raw_socket(&self) -> Option<RawSocket> {
        None
    }
}

impl Socket for TcpStream {
    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }

    #[cfg(unix)]
    fn raw_socket(&self) -> Option<RawSocket> {
        use std::os::unix::io::AsRawFd;
        Some(self.as_raw_fd() as RawSocket)
    }
}

#[cfg(unix)]
impl Socket for std::os::unix::net::UnixStream {
    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_nonblocking(self, nonblocking)
    }

    fn raw_socket(&self) -> Option<RawSocket> {
        use std::os::unix::io::AsRawFd;
        Some(self.as_raw_fd() as RawSocket)
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Busy,
    CopyIn,
    CopyOut,
}

/// A protocol-3 backend session.
pub struct PgSession<S: Socket> {
    stream: S,
    read_buffer: BytesMut,
    write_buffer: BytesMut,
    state: State,
    nonblocking: bool,
    bad: bool,
    last_error: String,
    /// Completed results not yet returned by `get_result`
    ready: VecDeque<QueryResult>,
    /// Row set being assembled
    fields: Option<SharedColumns>,
    rows: Vec<Vec<Option<Bytes>>>,
    /// COPY OUT frames not yet returned by `get_copy_data`
    copy_rows: VecDeque<CopyChunk>,
    /// Unread tail of the current COPY OUT frame, for `get_line`
    line_rest: Bytes,
    notices: Vec<String>,
    notifies: Vec<Notification>,
    parameters: HashMap<String, String>,
    transaction_status: TransactionStatus,
}

impl<S: Socket> PgSession<S> {
    /// Wrap a stream that has completed the startup handshake.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buffer: BytesMut::with_capacity(32768),
            write_buffer: BytesMut::with_capacity(8192),
            state: State::Idle,
            nonblocking: false,
            bad: false,
            last_error: String::new(),
            ready: VecDeque::new(),
            fields: None,
            rows: Vec::new(),
            copy_rows: VecDeque::new(),
            line_rest: Bytes::new(),
            notices: Vec::new(),
            notifies: Vec::new(),
            parameters: HashMap::new(),
            transaction_status: TransactionStatus::Idle,
        }
    }

    /// Last transaction status reported by the backend.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Server parameter reported through ParameterStatus.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(|s| s.as_str())
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    fn ensure_open(&self) -> WireResult<()> {
        if self.bad {
            Err(WireError::Closed)
        } else {
            Ok(())
        }
    }

    fn fail(&mut self, message: &str) {
        debug!(error = message, "session marked bad");
        self.bad = true;
        self.last_error = format!("{}\n", message);
    }

    /// Run `f` with the stream in blocking mode.
    fn blocking<T>(&mut self, f: impl FnOnce(&mut Self) -> WireResult<T>) -> WireResult<T> {
        if !self.nonblocking {
            return f(self);
        }
        self.stream.set_nonblocking(false)?;
        let out = f(self);
        self.stream.set_nonblocking(true)?;
        out
    }

    fn buffer_message<M: FrontendMessage>(&mut self, msg: &M) {
        let encoded = msg.encode();
        self.write_buffer.extend_from_slice(&encoded);
    }

    fn flush_all(&mut self) -> WireResult<()> {
        self.blocking(|s| s.flush().map(|_| ()))
    }

    /// Read once from the stream. Returns 0 when a non-blocking read would block.
    fn read_more(&mut self) -> WireResult<usize> {
        let mut buf = [0u8; 8192];
        match self.stream.read(&mut buf) {
            Ok(0) => {
                self.fail("server closed the connection unexpectedly");
                Err(WireError::Closed)
            }
            Ok(n) => {
                trace!(bytes = n, "read from backend");
                self.read_buffer.extend_from_slice(&buf[..n]);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => {
                self.fail(&format!("could not receive data from server: {}", e));
                Err(WireError::Io(e))
            }
        }
    }

    /// Decode and handle every complete frame in the read buffer.
    fn process_buffered(&mut self) -> WireResult<()> {
        loop {
            let total_len = match BackendMessage::frame_len(&self.read_buffer) {
                Ok(Some(len)) => len,
                Ok(None) => break,
                Err(e) => {
                    self.fail(&e.to_string());
                    return Err(e);
                }
            };
            if self.read_buffer.len() < total_len {
                break;
            }
            let mut frame = self.read_buffer.split_to(total_len).freeze();
            let msg = match BackendMessage::decode(&mut frame) {
                Ok(msg) => msg,
                Err(e) => {
                    self.fail(&e.to_string());
                    return Err(e);
                }
            };
            self.handle_message(msg);
        }
        Ok(())
    }

    fn handle_message(&mut self, msg: BackendMessage) {
        match msg {
            BackendMessage::RowDescription { fields } => {
                self.fields = Some(Arc::new(fields));
                self.rows.clear();
            }
            BackendMessage::DataRow { values } => {
                self.rows.push(values);
            }
            BackendMessage::CommandComplete { tag } => {
                let result = match self.fields.take() {
                    Some(fields) => {
                        let binary = !fields.is_empty()
                            && fields.iter().all(|f| f.format == Format::Binary);
                        QueryResult::Tuples {
                            tag,
                            fields,
                            rows: std::mem::take(&mut self.rows),
                            binary,
                        }
                    }
                    None => QueryResult::command(tag),
                };
                self.ready.push_back(result);
            }
            BackendMessage::EmptyQueryResponse => {
                self.ready.push_back(QueryResult::Empty);
            }
            BackendMessage::ErrorResponse { fields } => {
                let err = ServerError::from_fields(&fields);
                self.last_error = err.formatted();
                self.fields = None;
                self.rows.clear();
                if matches!(self.state, State::CopyIn | State::CopyOut) {
                    self.state = State::Busy;
                }
                self.ready.push_back(QueryResult::Error(err));
            }
            BackendMessage::CopyInResponse {
                format,
                column_formats,
            } => {
                self.state = State::CopyIn;
                self.ready.push_back(QueryResult::CopyIn {
                    format,
                    columns: column_formats.len(),
                });
            }
            BackendMessage::CopyOutResponse {
                format,
                column_formats,
            } => {
                self.state = State::CopyOut;
                self.ready.push_back(QueryResult::CopyOut {
                    format,
                    columns: column_formats.len(),
                });
            }
            BackendMessage::CopyData { data } => {
                self.copy_rows.push_back(CopyChunk::Data(data));
            }
            BackendMessage::CopyDone => {
                self.copy_rows.push_back(CopyChunk::Done);
                self.state = State::Busy;
            }
            BackendMessage::ReadyForQuery { status } => {
                self.transaction_status = status;
                self.state = State::Idle;
            }
            BackendMessage::NoticeResponse { fields } => {
                self.notices.push(ServerError::from_fields(&fields).formatted());
            }
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                self.notifies.push(Notification {
                    pid: process_id,
                    channel,
                    payload,
                });
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.parameters.insert(name, value);
            }
            BackendMessage::BackendKeyData { .. } => {}
        }
    }
}

impl<S: Socket> WireSession for PgSession<S> {
    fn status(&self) -> SessionStatus {
        if self.bad {
            SessionStatus::Bad
        } else {
            SessionStatus::Ok
        }
    }

    fn error_message(&self) -> String {
        self.last_error.clone()
    }

    fn protocol_version(&self) -> u8 {
        PROTOCOL_MAJOR
    }

    fn exec(&mut self, query: &str) -> WireResult<QueryResult> {
        self.ensure_open()?;

        // discard whatever the previous submission left behind
        match self.state {
            State::CopyIn => self.put_copy_end(Some("COPY terminated by new query"))?,
            State::CopyOut => {
                return Err(WireError::Rejected(
                    "COPY OUT state must be terminated first".to_string(),
                ))
            }
            State::Idle | State::Busy => {}
        }
        while self.get_result()?.is_some() {}

        self.send_query(query)?;
        self.flush_all()?;

        let mut first_error = None;
        let mut last = None;
        while let Some(result) = self.get_result()? {
            match result {
                QueryResult::CopyIn { .. } | QueryResult::CopyOut { .. } => return Ok(result),
                QueryResult::Error(_) if first_error.is_none() => first_error = Some(result),
                QueryResult::Error(_) => {}
                _ => last = Some(result),
            }
        }

        first_error
            .or(last)
            .ok_or_else(|| WireError::Protocol("no result received".to_string()))
    }

    fn send_query(&mut self, query: &str) -> WireResult<()> {
        self.ensure_open()?;
        if self.state != State::Idle || !self.ready.is_empty() {
            self.last_error = "another command is already in progress\n".to_string();
            return Err(WireError::Rejected(
                "another command is already in progress".to_string(),
            ));
        }
        self.buffer_message(&QueryMessage { query });
        self.state = State::Busy;
        Ok(())
    }

    fn flush(&mut self) -> WireResult<Flush> {
        self.ensure_open()?;
        while !self.write_buffer.is_empty() {
            match self.stream.write(&self.write_buffer) {
                Ok(0) => {
                    self.fail("server closed the connection unexpectedly");
                    return Err(WireError::Closed);
                }
                Ok(n) => self.write_buffer.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Pending),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.fail(&format!("could not send data to server: {}", e));
                    return Err(WireError::Io(e));
                }
            }
        }
        match self.stream.flush() {
            Ok(()) => Ok(Flush::Done),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Flush::Pending),
            Err(e) => {
                self.fail(&format!("could not send data to server: {}", e));
                Err(WireError::Io(e))
            }
        }
    }

    fn consume_input(&mut self) -> WireResult<()> {
        self.ensure_open()?;
        self.process_buffered()?;
        if self.nonblocking {
            while self.read_more()? > 0 {}
        } else if self.is_busy() {
            self.read_more()?;
        }
        self.process_buffered()
    }

    fn is_busy(&self) -> bool {
        self.state == State::Busy && self.ready.is_empty()
    }

    fn get_result(&mut self) -> WireResult<Option<QueryResult>> {
        self.ensure_open()?;
        self.process_buffered()?;
        while self.is_busy() {
            self.blocking(|s| s.read_more())?;
            self.process_buffered()?;
        }
        Ok(self.ready.pop_front())
    }

    fn put_copy_data(&mut self, data: &[u8]) -> WireResult<()> {
        self.ensure_open()?;
        if self.state != State::CopyIn {
            return Err(WireError::Rejected("no COPY in progress".to_string()));
        }
        trace!(bytes = data.len(), "copy data out");
        self.buffer_message(&CopyDataMessage { data });
        if self.write_buffer.len() >= 8192 {
            self.flush_all()?;
        }
        Ok(())
    }

    fn put_copy_end(&mut self, error: Option<&str>) -> WireResult<()> {
        self.ensure_open()?;
        if self.state != State::CopyIn {
            return Err(WireError::Rejected("no COPY in progress".to_string()));
        }
        match error {
            Some(reason) => self.buffer_message(&CopyFailMessage { reason }),
            None => self.buffer_message(&CopyDoneMessage),
        }
        self.state = State::Busy;
        self.flush_all()
    }

    fn get_copy_data(&mut self) -> WireResult<CopyChunk> {
        self.ensure_open()?;
        loop {
            self.process_buffered()?;
            if let Some(chunk) = self.copy_rows.pop_front() {
                return Ok(chunk);
            }
            if self.state != State::CopyOut {
                // an error result ended the stream; it is returned by get_result
                return Ok(CopyChunk::Done);
            }
            self.blocking(|s| s.read_more())?;
        }
    }

    fn put_line(&mut self, line: &str) -> WireResult<()> {
        self.put_copy_data(line.as_bytes())
    }

    fn get_line(&mut self, max: usize) -> WireResult<Line> {
        if self.line_rest.is_empty() {
            match self.get_copy_data()? {
                CopyChunk::Data(data) => self.line_rest = data,
                CopyChunk::Done => return Ok(Line::Complete("\\.".to_string())),
            }
        }

        let limit = max.saturating_sub(1).max(1);
        let newline = self
            .line_rest
            .iter()
            .take(limit)
            .position(|&b| b == b'\n');
        match newline {
            Some(pos) => {
                let line = self.line_rest.split_to(pos);
                self.line_rest.advance(1);
                Ok(Line::Complete(String::from_utf8_lossy(&line).into_owned()))
            }
            None => {
                let take = limit.min(self.line_rest.len());
                let part = self.line_rest.split_to(take);
                Ok(Line::Partial(String::from_utf8_lossy(&part).into_owned()))
            }
        }
    }

    fn end_copy(&mut self) -> WireResult<()> {
        self.ensure_open()?;
        self.line_rest.clear();
        if self.state == State::CopyIn {
            self.buffer_message(&CopyDoneMessage);
            self.state = State::Busy;
        }
        self.flush_all()
    }

    fn take_notices(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notices)
    }

    fn take_notifies(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifies)
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> WireResult<()> {
        if self.nonblocking != nonblocking {
            self.stream.set_nonblocking(nonblocking)?;
            self.nonblocking = nonblocking;
        }
        Ok(())
    }

    fn descriptor(&self) -> Option<RawSocket> {
        self.stream.raw_socket()
    }

    fn finish(&mut self) {
        if !self.bad {
            self.buffer_message(&TerminateMessage);
            let _ = self.flush_all();
        }
        self.bad = true;
        self.last_error = "connection closed\n".to_string();
    }
}
