//! Transport primitives the execution core rides on.
//!
//! A [`WireSession`] is one established backend session exposing the
//! libpq-shaped operations the core needs: blocking exec, non-blocking
//! send/flush/consume, and the COPY sub-protocols of both protocol generations.
//! Framing lives below this trait (see [`super::session::PgSession`]).

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use super::protocol::{FieldDescription, Format};

/// Column descriptions shared between a result and the cursor reading it.
pub type SharedColumns = Arc<Vec<FieldDescription>>;

/// OS-level descriptor of the session socket, handed to wait hooks.
pub type RawSocket = i64;

/// Transport-level failure. The core always reports these as operational errors.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server closed the connection unexpectedly")]
    Closed,

    /// The session refused the call in its current state.
    #[error("{0}")]
    Rejected(String),
}

pub type WireResult<T> = Result<T, WireError>;

/// Health of the underlying session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Ok,
    Bad,
}

/// Outcome of pushing buffered outbound bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    Done,
    /// Some bytes are still queued; wait for the socket to become writable.
    Pending,
}

/// One read from a protocol-3 COPY OUT stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyChunk {
    Data(Bytes),
    Done,
}

/// One read from an old-style line-based COPY OUT stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// A full line, newline stripped.
    Complete(String),
    /// The buffer filled up before the newline; more of the same line follows.
    Partial(String),
}

/// Asynchronous notification received from LISTEN/NOTIFY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub pid: i32,
    pub channel: String,
    pub payload: String,
}

/// Structured error reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerError {
    pub severity: String,
    pub sqlstate: Option<String>,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl ServerError {
    /// Build from ErrorResponse/NoticeResponse fields.
    pub fn from_fields(fields: &HashMap<u8, String>) -> Self {
        Self {
            severity: fields
                .get(&b'V')
                .or_else(|| fields.get(&b'S'))
                .cloned()
                .unwrap_or_default(),
            sqlstate: fields.get(&b'C').cloned().filter(|c| !c.is_empty()),
            message: fields.get(&b'M').cloned().unwrap_or_default(),
            detail: fields.get(&b'D').cloned(),
            hint: fields.get(&b'H').cloned(),
        }
    }

    /// The message as libpq formats it: `"SEVERITY:  text\n"` plus detail and hint lines.
    pub fn formatted(&self) -> String {
        let mut out = String::new();
        if !self.severity.is_empty() {
            out.push_str(&self.severity);
            out.push_str(":  ");
        }
        out.push_str(&self.message);
        out.push('\n');
        if let Some(detail) = &self.detail {
            out.push_str("DETAIL:  ");
            out.push_str(detail);
            out.push('\n');
        }
        if let Some(hint) = &self.hint {
            out.push_str("HINT:  ");
            out.push_str(hint);
            out.push('\n');
        }
        out
    }
}

/// One backend response to a submitted command.
#[derive(Debug, Clone)]
pub enum QueryResult {
    /// Command completed without returning rows.
    Command { tag: String, oid: Option<u32> },
    /// Command returned a row set.
    Tuples {
        tag: String,
        fields: SharedColumns,
        rows: Vec<Vec<Option<Bytes>>>,
        binary: bool,
    },
    /// Backend awaits COPY FROM STDIN data.
    CopyIn { format: Format, columns: usize },
    /// Backend is sending COPY TO STDOUT data.
    CopyOut { format: Format, columns: usize },
    /// The query string was empty.
    Empty,
    Error(ServerError),
}

impl QueryResult {
    /// Build a command result, extracting the inserted OID from an INSERT tag.
    pub fn command(tag: String) -> Self {
        let oid = tag
            .strip_prefix("INSERT ")
            .and_then(|rest| rest.split(' ').next())
            .and_then(|oid| oid.parse::<u32>().ok())
            .filter(|&oid| oid != 0);
        QueryResult::Command { tag, oid }
    }

    /// Status name, for logging.
    pub fn status_name(&self) -> &'static str {
        match self {
            QueryResult::Command { .. } => "COMMAND_OK",
            QueryResult::Tuples { .. } => "TUPLES_OK",
            QueryResult::CopyIn { .. } => "COPY_IN",
            QueryResult::CopyOut { .. } => "COPY_OUT",
            QueryResult::Empty => "EMPTY_QUERY",
            QueryResult::Error(_) => "FATAL_ERROR",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, QueryResult::Error(_))
    }

    /// Whether the command ran to completion (the result of an exec-command call).
    pub fn is_command_ok(&self) -> bool {
        matches!(self, QueryResult::Command { .. } | QueryResult::Tuples { .. })
    }

    pub fn command_tag(&self) -> Option<&str> {
        match self {
            QueryResult::Command { tag, .. } | QueryResult::Tuples { tag, .. } => Some(tag),
            _ => None,
        }
    }

    /// Affected-row count text, empty when the command reports none.
    pub fn cmd_tuples(&self) -> &str {
        self.command_tag().map(cmd_tuples).unwrap_or("")
    }

    pub fn oid_value(&self) -> Option<u32> {
        match self {
            QueryResult::Command { oid, .. } => *oid,
            _ => None,
        }
    }

    /// Error text for an error result, formatted as libpq does.
    pub fn error_message(&self) -> Option<String> {
        match self {
            QueryResult::Error(err) => Some(err.formatted()),
            _ => None,
        }
    }

    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            QueryResult::Error(err) => err.sqlstate.as_deref(),
            _ => None,
        }
    }
}

/// Row-count part of a command tag, or `""` when the tag carries none.
pub fn cmd_tuples(tag: &str) -> &str {
    const COUNTED: [&str; 6] = ["DELETE ", "UPDATE ", "SELECT ", "MOVE ", "FETCH ", "COPY "];

    let rest = if let Some(rest) = tag.strip_prefix("INSERT ") {
        match rest.find(' ') {
            Some(pos) => &rest[pos + 1..],
            None => return "",
        }
    } else if let Some(rest) = tag.strip_prefix("MERGE ") {
        rest
    } else {
        match COUNTED.iter().find_map(|p| tag.strip_prefix(p)) {
            Some(rest) => rest,
            None => return "",
        }
    };

    if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
        rest
    } else {
        ""
    }
}

/// An established backend session.
///
/// Every method is called with the owning connection's mutex held; none may
/// call back into caller-visible code.
pub trait WireSession: Send {
    fn status(&self) -> SessionStatus;

    /// Last transport-level error message, empty if none.
    fn error_message(&self) -> String;

    /// Major protocol generation (2 or 3).
    fn protocol_version(&self) -> u8;

    /// Submit `query` and block until every result has arrived.
    ///
    /// Returns the first error result if any, else the last result. Stops early
    /// when the backend enters a COPY state.
    fn exec(&mut self, query: &str) -> WireResult<QueryResult>;

    /// Queue `query` without waiting for results.
    fn send_query(&mut self, query: &str) -> WireResult<()>;

    fn flush(&mut self) -> WireResult<Flush>;

    /// Read whatever input is available without blocking.
    fn consume_input(&mut self) -> WireResult<()>;

    /// Whether `get_result` would block.
    fn is_busy(&self) -> bool;

    /// Next result of the current submission, `None` once all were returned.
    fn get_result(&mut self) -> WireResult<Option<QueryResult>>;

    fn put_copy_data(&mut self, data: &[u8]) -> WireResult<()>;

    /// End a COPY FROM STDIN, or abort it with `error` as the reason.
    fn put_copy_end(&mut self, error: Option<&str>) -> WireResult<()>;

    /// Next chunk of a COPY TO STDOUT. An error is a hard failure of the stream.
    fn get_copy_data(&mut self) -> WireResult<CopyChunk>;

    fn put_line(&mut self, line: &str) -> WireResult<()>;

    /// Read at most `max - 1` bytes of the current COPY OUT line.
    fn get_line(&mut self, max: usize) -> WireResult<Line>;

    /// Synchronize after an old-style COPY.
    fn end_copy(&mut self) -> WireResult<()>;

    fn take_notices(&mut self) -> Vec<String>;

    fn take_notifies(&mut self) -> Vec<Notification>;

    fn set_nonblocking(&mut self, nonblocking: bool) -> WireResult<()>;

    fn descriptor(&self) -> Option<RawSocket>;

    /// Close the session. Further calls report a bad status.
    fn finish(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_tuples() {
        assert_eq!(cmd_tuples("INSERT 0 3"), "3");
        assert_eq!(cmd_tuples("DELETE 10"), "10");
        assert_eq!(cmd_tuples("UPDATE 0"), "0");
        assert_eq!(cmd_tuples("SELECT 2"), "2");
        assert_eq!(cmd_tuples("COPY 7"), "7");
        assert_eq!(cmd_tuples("MERGE 1"), "1");
        assert_eq!(cmd_tuples("CREATE TABLE"), "");
        assert_eq!(cmd_tuples("INSERT 0"), "");
        assert_eq!(cmd_tuples("BEGIN"), "");
    }

    #[test]
    fn test_insert_oid() {
        assert_eq!(QueryResult::command("INSERT 16384 1".into()).oid_value(), Some(16384));
        assert_eq!(QueryResult::command("INSERT 0 5".into()).oid_value(), None);
        assert_eq!(QueryResult::command("UPDATE 2".into()).oid_value(), None);
    }

    #[test]
    fn test_server_error_formatting() {
        let mut fields = HashMap::new();
        fields.insert(b'S', "ERROR".to_string());
        fields.insert(b'C', "23505".to_string());
        fields.insert(b'M', "duplicate key value".to_string());
        fields.insert(b'D', "Key (id)=(1) already exists.".to_string());
        let err = ServerError::from_fields(&fields);

        assert_eq!(err.sqlstate.as_deref(), Some("23505"));
        assert_eq!(
            err.formatted(),
            "ERROR:  duplicate key value\nDETAIL:  Key (id)=(1) already exists.\n"
        );
    }
}
