//! Client-side cursor: result buffer, row decoding and COPY helpers.

use std::io::{BufRead, Write};
use std::sync::Arc;

use smallvec::SmallVec;

use super::connection::{next_cursor_id, Connection, CursorId};
use super::execute::{ExecMode, Executed, PollState};
use super::fetch::ColumnDescriptor;
use super::wire::QueryResult;
use crate::error::{Error, Result};
use crate::typecast::{CastScope, Converter, Value};

/// Where COPY data comes from or goes to.
pub enum CopyTarget {
    /// Source for COPY FROM STDIN.
    From(Box<dyn BufRead + Send>),
    /// Sink for COPY TO STDOUT.
    To(Box<dyn Write + Send>),
}

/// A decoded row.
pub type Row = Vec<Value>;

/// A cursor bound to one connection.
pub struct Cursor {
    pub(crate) id: CursorId,
    conn: Arc<Connection>,
    pub(crate) pending: Option<QueryResult>,
    /// Row set kept after a fetch; rows are decoded lazily from it.
    pub(crate) result: Option<QueryResult>,
    pub(crate) rowcount: i64,
    pub(crate) lastoid: Option<u32>,
    pub(crate) description: Option<Vec<ColumnDescriptor>>,
    pub(crate) casts: SmallVec<[Converter; 16]>,
    pub(crate) status_message: Option<String>,
    pub(crate) copy: Option<CopyTarget>,
    pub(crate) copy_size: usize,
    pub(crate) string_types: CastScope,
    pub(crate) mark: u64,
    row_number: usize,
    closed: bool,
}

impl Connection {
    /// Open a new cursor on this connection.
    pub fn cursor(self: &Arc<Self>) -> Cursor {
        Cursor::new(Arc::clone(self))
    }
}

impl Cursor {
    pub fn new(conn: Arc<Connection>) -> Self {
        let copy_size = conn.config.copy_chunk_size;
        Self {
            id: next_cursor_id(),
            conn,
            pending: None,
            result: None,
            rowcount: -1,
            lastoid: None,
            description: None,
            casts: SmallVec::new(),
            status_message: None,
            copy: None,
            copy_size,
            string_types: CastScope::new(),
            mark: 0,
            row_number: 0,
            closed: false,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Forget everything about the previous command.
    pub(crate) fn reset(&mut self) {
        self.pending = None;
        self.rowcount = -1;
        self.lastoid = None;
        self.status_message = None;
        self.clear_result();
    }

    /// Release the retained row set.
    pub(crate) fn clear_result(&mut self) {
        self.result = None;
        self.description = None;
        self.casts.clear();
        self.row_number = 0;
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::interface("cursor already closed"))
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Run `query` and fetch its result.
    pub fn execute(&mut self, query: &str) -> Result<Executed> {
        self.check_open()?;
        let conn = Arc::clone(&self.conn);
        conn.execute(self, query, ExecMode::Sync)
    }

    /// Submit `query` without waiting; drive it with [`Cursor::poll`].
    pub fn execute_async(&mut self, query: &str) -> Result<Executed> {
        self.check_open()?;
        let conn = Arc::clone(&self.conn);
        conn.execute(self, query, ExecMode::Async)
    }

    /// Advance this cursor's asynchronous command.
    pub fn poll(&mut self) -> Result<PollState> {
        let conn = Arc::clone(&self.conn);
        conn.poll(self)
    }

    /// Run a COPY statement against `target`.
    pub fn copy_expert(&mut self, query: &str, target: CopyTarget) -> Result<()> {
        self.check_open()?;
        self.copy = Some(target);
        let outcome = self.execute(query);
        self.copy = None;
        outcome.map(|_| ())
    }

    /// COPY `table` FROM STDIN, reading rows from `source`.
    pub fn copy_from(
        &mut self,
        source: impl BufRead + Send + 'static,
        table: &str,
        sep: &str,
        null: &str,
        columns: Option<&[&str]>,
    ) -> Result<()> {
        let query = format!(
            "COPY {}{} FROM stdin WITH DELIMITER AS {} NULL AS {}",
            table,
            column_list(columns),
            self.conn.escaper.escape(sep),
            self.conn.escaper.escape(null)
        );
        self.copy_expert(&query, CopyTarget::From(Box::new(source)))
    }

    /// COPY `table` TO STDOUT, writing rows to `sink`.
    pub fn copy_to(
        &mut self,
        sink: impl Write + Send + 'static,
        table: &str,
        sep: &str,
        null: &str,
        columns: Option<&[&str]>,
    ) -> Result<()> {
        let query = format!(
            "COPY {}{} TO stdout WITH DELIMITER AS {} NULL AS {}",
            table,
            column_list(columns),
            self.conn.escaper.escape(sep),
            self.conn.escaper.escape(null)
        );
        self.copy_expert(&query, CopyTarget::To(Box::new(sink)))
    }

    /// Chunk size used when reading a COPY FROM source.
    pub fn set_copy_size(&mut self, size: usize) {
        self.copy_size = size.max(1);
    }

    // ========================================================================
    // Rows
    // ========================================================================

    fn rows(&self) -> Result<&[Vec<Option<bytes::Bytes>>]> {
        match &self.result {
            Some(QueryResult::Tuples { rows, .. }) => Ok(rows),
            _ => Err(Error::programming("no results to fetch")),
        }
    }

    fn decode(&self, row: &[Option<bytes::Bytes>]) -> Result<Row> {
        row.iter()
            .zip(self.casts.iter())
            .map(|(cell, cast)| cast.cast(cell.as_deref()))
            .collect()
    }

    /// Next row, or `None` once the row set is exhausted.
    pub fn fetch_one(&mut self) -> Result<Option<Row>> {
        self.check_open()?;
        let rows = self.rows()?;
        let Some(row) = rows.get(self.row_number) else {
            return Ok(None);
        };
        let decoded = self.decode(row)?;
        self.row_number += 1;
        Ok(Some(decoded))
    }

    /// Every remaining row.
    pub fn fetch_all(&mut self) -> Result<Vec<Row>> {
        self.check_open()?;
        let rows = self.rows()?;
        let out = rows[self.row_number.min(rows.len())..]
            .iter()
            .map(|row| self.decode(row))
            .collect::<Result<Vec<_>>>()?;
        self.row_number += out.len();
        Ok(out)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Rows affected or returned by the last command, -1 when unknown.
    pub fn rowcount(&self) -> i64 {
        self.rowcount
    }

    /// OID of the row inserted by the last command, if any.
    pub fn lastrowid(&self) -> Option<u32> {
        self.lastoid
    }

    /// Command tag of the last command, e.g. `"INSERT 0 1"`.
    pub fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }

    pub fn description(&self) -> Option<&[ColumnDescriptor]> {
        self.description.as_deref()
    }

    pub fn row_number(&self) -> usize {
        self.row_number
    }

    /// Override the converter for this cursor's columns.
    pub fn register_cast(&mut self, caster: Converter) {
        self.string_types.register(caster);
    }

    /// Whether a transaction boundary was crossed since the last command.
    pub fn is_stale(&self) -> bool {
        self.conn.mark() != self.mark
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.reset();
    }

    /// Closed explicitly or through its connection.
    pub fn is_closed(&self) -> bool {
        self.closed || self.conn.is_closed()
    }
}

fn column_list(columns: Option<&[&str]>) -> String {
    match columns {
        Some(cols) if !cols.is_empty() => format!(" ({})", cols.join(",")),
        _ => String::new(),
    }
}
