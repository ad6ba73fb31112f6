//! Connection state and the per-connection lock discipline.
//!
//! Two locks cooperate here:
//! - the caller's global interpreter lock ([`InterpreterLock`]), released for
//!   every blocking wire call and every wait on the connection mutex;
//! - the connection mutex guarding [`ConnState`], held only for the duration of
//!   individual wire calls.
//!
//! Whole operations (begin + query + fetch, a COPY, a commit) are serialized by
//! a reservation taken on top of the mutex. A reservation lets an operation drop
//! the mutex around caller-visible code (the wait hook, copy sources and sinks,
//! notice handlers) without another caller slipping a command in between.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::debug;

use super::escape::{Escaper, StandardEscaper};
use super::wait::{Interest, WaitHook};
use super::wire::*;
use super::xid::Xid;
use crate::config::CoreConfig;
use crate::error::{classify, Error, Result};
use crate::interp::{allow_threads, InterpreterLock, NoInterpreterLock};
use crate::typecast::{CastScope, Converter};

/// Identity of a cursor, used to track the owner of an asynchronous command.
pub type CursorId = u64;

static NEXT_CURSOR_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_cursor_id() -> CursorId {
    NEXT_CURSOR_ID.fetch_add(1, Ordering::Relaxed)
}

/// Longest query prefix written to logs.
const LOG_QUERY_LEN: usize = 200;

pub(crate) fn log_query(query: &str) -> &str {
    match query.char_indices().nth(LOG_QUERY_LEN) {
        Some((pos, _)) => &query[..pos],
        None => query,
    }
}

// ============================================================================
// State
// ============================================================================

/// Transaction status of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Ready,
    Begin,
    /// A two-phase transaction was prepared and awaits COMMIT/ROLLBACK PREPARED.
    Prepared,
    Closed,
}

/// Whether the session is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedState {
    Open,
    Closed,
    /// The session broke underneath us; the connection still needs `close`.
    Broken,
}

/// Transaction isolation level; `Autocommit` issues no BEGIN at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    Autocommit,
    #[default]
    ReadCommitted,
    Serializable,
}

impl IsolationLevel {
    pub fn from_level(level: i32) -> Result<Self> {
        match level {
            0 => Ok(IsolationLevel::Autocommit),
            1 => Ok(IsolationLevel::ReadCommitted),
            2 => Ok(IsolationLevel::Serializable),
            _ => Err(Error::programming("isolation level must be between 0 and 2")),
        }
    }

    pub fn as_level(self) -> i32 {
        match self {
            IsolationLevel::Autocommit => 0,
            IsolationLevel::ReadCommitted => 1,
            IsolationLevel::Serializable => 2,
        }
    }

    /// Command opening a transaction at this level.
    pub fn begin_command(self) -> Option<&'static str> {
        match self {
            IsolationLevel::Autocommit => None,
            IsolationLevel::ReadCommitted => {
                Some("BEGIN; SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            }
            IsolationLevel::Serializable => {
                Some("BEGIN; SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            }
        }
    }
}

/// Progress of the outstanding asynchronous command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncStatus {
    None,
    /// Query bytes still queued for the socket.
    Write,
    /// Query sent, results pending.
    Read,
    Done,
}

/// Everything guarded by the connection mutex.
pub struct ConnState {
    pub(crate) session: Box<dyn WireSession>,
    pub(crate) status: ConnStatus,
    pub(crate) closed: ClosedState,
    pub(crate) isolation_level: IsolationLevel,
    /// Level restored by a reset.
    pub(crate) default_isolation: IsolationLevel,
    pub(crate) mark: u64,
    pub(crate) critical: Option<String>,
    pub(crate) async_status: AsyncStatus,
    pub(crate) async_owner: Option<CursorId>,
    pub(crate) tpc_xid: Option<Xid>,
    busy: bool,
    pending_notices: Vec<String>,
    pending_notifies: Vec<Notification>,
}

impl ConnState {
    fn new(session: Box<dyn WireSession>, isolation_level: IsolationLevel) -> Self {
        Self {
            session,
            status: ConnStatus::Ready,
            closed: ClosedState::Open,
            isolation_level,
            default_isolation: isolation_level,
            mark: 0,
            critical: None,
            async_status: AsyncStatus::None,
            async_owner: None,
            tpc_xid: None,
            busy: false,
            pending_notices: Vec::new(),
            pending_notifies: Vec::new(),
        }
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed == ClosedState::Open {
            Ok(())
        } else {
            Err(Error::interface("connection already closed"))
        }
    }

    /// Store a connection-poisoning message.
    ///
    /// `None` takes the session's last error message; an empty message clears
    /// the flag. Never raises by itself.
    pub(crate) fn mark_critical(&mut self, msg: Option<String>) {
        let msg = msg.unwrap_or_else(|| self.session.error_message());
        if msg.is_empty() {
            self.critical = None;
        } else {
            debug!(message = %msg.trim_end(), "connection marked critical");
            self.critical = Some(msg);
        }
    }

    /// Turn a pending critical condition into an operational error, clearing it.
    ///
    /// Returns `None` when no critical condition is set, so a second call after
    /// a resolution is a no-op.
    pub(crate) fn resolve_critical(&mut self, close: bool) -> Option<Error> {
        let msg = self.critical.take()?;
        debug!(close, message = %msg.trim_end(), "resolving critical condition");
        let err = Error::backend(crate::error::ErrorKind::Operational, &msg, None);
        if close {
            self.close_locked();
        }
        Some(err)
    }

    /// Build the error for a failed backend interaction.
    ///
    /// The message comes from `result` when it is an error result, otherwise
    /// from the session. A broken session marks the connection as needing
    /// cleanup.
    pub(crate) fn raise(&mut self, result: Option<&QueryResult>) -> Error {
        if self.session.status() == SessionStatus::Bad && self.closed == ClosedState::Open {
            self.closed = ClosedState::Broken;
        }

        let (mut message, code) = match result {
            Some(QueryResult::Error(err)) => (err.formatted(), err.sqlstate.clone()),
            _ => (String::new(), None),
        };
        if message.is_empty() {
            message = self.session.error_message();
        }
        if message.is_empty() {
            return Error::interface("no error message available");
        }

        // SQLSTATE is only trusted from protocol 3 sessions
        let code = code.filter(|_| self.session.protocol_version() >= 3);
        let kind = classify(code.as_deref(), &message);
        debug!(%kind, code = ?code, "backend error");
        Error::backend(kind, &message, code.as_deref())
    }

    /// Error for a transport failure: always operational.
    pub(crate) fn wire_failure(&mut self, err: WireError) -> Error {
        if self.session.status() == SessionStatus::Bad && self.closed == ClosedState::Open {
            self.closed = ClosedState::Broken;
        }
        let msg = self.session.error_message();
        let msg = if msg.trim().is_empty() {
            err.to_string()
        } else {
            msg.trim_end().to_string()
        };
        debug!(error = %msg, "transport failure");
        Error::operational(msg)
    }

    /// Fail unless the session is healthy.
    pub(crate) fn check_session(&self) -> Result<()> {
        if self.session.status() == SessionStatus::Ok {
            Ok(())
        } else {
            Err(Error::operational(self.session.error_message().trim_end()))
        }
    }

    /// Move notices and notifications out of the session.
    ///
    /// On protocol 2 a backend error during COPY only shows up as an `ERROR`
    /// notice, so such a notice poisons the connection.
    pub(crate) fn harvest(&mut self) {
        let notices = self.session.take_notices();
        if self.session.protocol_version() < 3 {
            if let Some(err) = notices.iter().find(|n| n.starts_with("ERROR")) {
                self.mark_critical(Some(err.clone()));
            }
        }
        self.pending_notices.extend(notices);
        let notifies = self.session.take_notifies();
        self.pending_notifies.extend(notifies);
    }

    /// Consume input and report whether a result is still being assembled.
    ///
    /// Leaves notices in place; the fetch that follows collects them.
    pub(crate) fn is_busy_locked(&mut self) -> Result<bool> {
        match self.session.consume_input() {
            Ok(()) => Ok(self.session.is_busy()),
            Err(e) => Err(self.wire_failure(e)),
        }
    }

    pub(crate) fn flush_locked(&mut self) -> Result<Flush> {
        self.session.flush().map_err(|e| self.wire_failure(e))
    }

    /// Put the session back in blocking mode.
    pub(crate) fn restore_blocking(&mut self) {
        if let Err(e) = self.session.set_nonblocking(false) {
            debug!(error = %e, "could not restore blocking mode");
        }
    }

    /// Drop the asynchronous command after a transport failure.
    pub(crate) fn abandon_async(&mut self, err: Error) -> Error {
        debug!(error = %err, "asynchronous command failed");
        self.async_owner = None;
        self.async_status = AsyncStatus::Done;
        self.restore_blocking();
        err
    }

    /// Collect every result of the current submission, keeping the last one.
    pub(crate) fn last_result(&mut self) -> Result<Option<QueryResult>> {
        let mut last = None;
        loop {
            match self.session.get_result() {
                Ok(Some(result)) => last = Some(result),
                Ok(None) => return Ok(last),
                Err(e) => return Err(self.wire_failure(e)),
            }
        }
    }

    /// Drain any outstanding asynchronous results and forget the owner.
    pub(crate) fn clear_async_locked(&mut self) {
        if self.async_owner.is_none() {
            return;
        }
        while let Ok(Some(result)) = self.session.get_result() {
            debug!(status = result.status_name(), "discarding asynchronous result");
        }
        self.async_owner = None;
        self.async_status = AsyncStatus::None;
    }

    pub(crate) fn close_locked(&mut self) {
        if self.closed == ClosedState::Closed {
            return;
        }
        debug!("closing connection");
        self.clear_async_locked();
        self.session.finish();
        self.closed = ClosedState::Closed;
        self.status = ConnStatus::Closed;
    }
}

// ============================================================================
// Notices
// ============================================================================

/// Receives notices and notifications once the connection lock is released.
pub trait NoticeHandler: Send + Sync {
    fn notice(&self, message: &str);

    fn notify(&self, _notification: &Notification) {}
}

// ============================================================================
// Connection
// ============================================================================

/// A backend connection shared by its cursors.
pub struct Connection {
    inner: Mutex<ConnState>,
    released: Condvar,
    interp: Arc<dyn InterpreterLock>,
    wait: Option<Arc<dyn WaitHook>>,
    pub(crate) casts: RwLock<CastScope>,
    notices: Mutex<VecDeque<String>>,
    notifies: Mutex<VecDeque<Notification>>,
    notice_handler: Option<Arc<dyn NoticeHandler>>,
    pub(crate) config: CoreConfig,
    pub(crate) escaper: Arc<dyn Escaper>,
}

/// Builder for [`Connection`].
pub struct ConnectionBuilder {
    session: Box<dyn WireSession>,
    interp: Arc<dyn InterpreterLock>,
    wait: Option<Arc<dyn WaitHook>>,
    notice_handler: Option<Arc<dyn NoticeHandler>>,
    config: CoreConfig,
    escaper: Arc<dyn Escaper>,
    isolation_level: IsolationLevel,
}

impl ConnectionBuilder {
    pub fn interpreter_lock(mut self, lock: Arc<dyn InterpreterLock>) -> Self {
        self.interp = lock;
        self
    }

    /// Install a cooperative wait hook.
    pub fn wait_hook(mut self, hook: Arc<dyn WaitHook>) -> Self {
        self.wait = Some(hook);
        self
    }

    pub fn notice_handler(mut self, handler: Arc<dyn NoticeHandler>) -> Self {
        self.notice_handler = Some(handler);
        self
    }

    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn escaper(mut self, escaper: Arc<dyn Escaper>) -> Self {
        self.escaper = escaper;
        self
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    pub fn build(self) -> Arc<Connection> {
        Arc::new(Connection {
            inner: Mutex::new(ConnState::new(self.session, self.isolation_level)),
            released: Condvar::new(),
            interp: self.interp,
            wait: self.wait,
            casts: RwLock::new(CastScope::new()),
            notices: Mutex::new(VecDeque::new()),
            notifies: Mutex::new(VecDeque::new()),
            notice_handler: self.notice_handler,
            config: self.config,
            escaper: self.escaper,
        })
    }
}

impl Connection {
    /// Start building a connection around an established session.
    pub fn builder(session: impl WireSession + 'static) -> ConnectionBuilder {
        ConnectionBuilder {
            session: Box::new(session),
            interp: Arc::new(NoInterpreterLock),
            wait: None,
            notice_handler: None,
            config: CoreConfig::default(),
            escaper: Arc::new(StandardEscaper),
            isolation_level: IsolationLevel::default(),
        }
    }

    /// A connection with default settings.
    pub fn new(session: impl WireSession + 'static) -> Arc<Self> {
        Self::builder(session).build()
    }

    /// Run `f` on the locked state, with the global lock released meanwhile.
    pub fn with_lock<T, F>(&self, f: F) -> T
    where
        T: Send,
        F: FnOnce(&mut ConnState) -> T + Send,
    {
        allow_threads(&*self.interp, || {
            let mut state = self.inner.lock();
            f(&mut state)
        })
    }

    pub(crate) fn interp(&self) -> &dyn InterpreterLock {
        &*self.interp
    }

    /// Reserve the connection for one whole operation.
    ///
    /// Fails if the connection is closed, or if a cursor other than `owner` has
    /// an asynchronous command in flight.
    pub(crate) fn reserve(
        &self,
        op: &'static str,
        owner: Option<CursorId>,
    ) -> Result<Exclusive<'_>> {
        self.acquire(move |state| {
            state.check_open()?;
            match state.async_owner {
                Some(current) if Some(current) != owner => Err(Error::programming(format!(
                    "{} cannot be used while an asynchronous query is underway",
                    op
                ))),
                _ => Ok(()),
            }
        })
    }

    pub(crate) fn acquire<C>(&self, check: C) -> Result<Exclusive<'_>>
    where
        C: FnOnce(&ConnState) -> Result<()> + Send,
    {
        allow_threads(&*self.interp, || {
            let mut state = self.inner.lock();
            while state.busy {
                self.released.wait(&mut state);
            }
            check(&*state)?;
            state.busy = true;
            Ok(())
        })?;
        Ok(Exclusive { conn: self })
    }

    fn deliver(&self, notices: Vec<String>, notifies: Vec<Notification>) {
        if !notices.is_empty() {
            let mut history = self.notices.lock();
            for notice in &notices {
                history.push_back(notice.clone());
                while history.len() > self.config.max_notices {
                    history.pop_front();
                }
            }
        }
        if !notifies.is_empty() {
            self.notifies.lock().extend(notifies.iter().cloned());
        }
        if let Some(handler) = &self.notice_handler {
            for notice in &notices {
                handler.notice(notice);
            }
            for notification in &notifies {
                handler.notify(notification);
            }
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn status(&self) -> ConnStatus {
        self.with_lock(|s| s.status)
    }

    pub fn closed(&self) -> ClosedState {
        self.with_lock(|s| s.closed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed() != ClosedState::Open
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.with_lock(|s| s.isolation_level)
    }

    /// Counter bumped on every transaction boundary.
    pub fn mark(&self) -> u64 {
        self.with_lock(|s| s.mark)
    }

    pub fn async_status(&self) -> AsyncStatus {
        self.with_lock(|s| s.async_status)
    }

    /// Whether an asynchronous command is outstanding.
    pub fn is_executing(&self) -> bool {
        self.with_lock(|s| s.async_owner.is_some())
    }

    pub fn critical(&self) -> Option<String> {
        self.with_lock(|s| s.critical.clone())
    }

    /// Flag the connection as poisoned (see [`ConnState::mark_critical`]).
    pub fn mark_critical(&self, msg: Option<String>) {
        self.with_lock(|s| s.mark_critical(msg))
    }

    /// Surface and clear a pending critical condition.
    pub fn resolve_critical(&self, close: bool) -> Option<Error> {
        self.with_lock(|s| s.resolve_critical(close))
    }

    pub fn tpc_xid(&self) -> Option<Xid> {
        self.with_lock(|s| s.tpc_xid.clone())
    }

    pub fn protocol_version(&self) -> u8 {
        self.with_lock(|s| s.session.protocol_version())
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Most recent notices, oldest first.
    pub fn notices(&self) -> Vec<String> {
        self.notices.lock().iter().cloned().collect()
    }

    /// Notifications received so far, emptying the queue.
    pub fn take_notifies(&self) -> Vec<Notification> {
        self.notifies.lock().drain(..).collect()
    }

    /// Register a converter for every cursor of this connection.
    pub fn register_cast(&self, caster: Converter) {
        self.casts.write().register(caster);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Close the session, discarding any outstanding asynchronous results.
    pub fn close(&self) {
        if let Ok(ex) = self.acquire(|_| Ok(())) {
            ex.locked(|s| s.close_locked());
        }
    }

    /// Wait for and discard the results of the outstanding asynchronous command.
    pub fn clear_async(&self) -> Result<()> {
        let ex = self.acquire(|s| s.check_open())?;
        ex.locked(|s| s.clear_async_locked());
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.inner.get_mut().close_locked();
    }
}

// ============================================================================
// Reservation
// ============================================================================

/// A reserved connection. Released (and pending notices delivered) on drop.
pub(crate) struct Exclusive<'a> {
    conn: &'a Connection,
}

impl Exclusive<'_> {
    pub(crate) fn connection(&self) -> &Connection {
        self.conn
    }

    /// One mutex section.
    pub(crate) fn locked<T, F>(&self, f: F) -> T
    where
        T: Send,
        F: FnOnce(&mut ConnState) -> T + Send,
    {
        self.conn.with_lock(f)
    }

    /// Run `query` to completion, through the wait hook when one is installed.
    pub(crate) fn exec(&self, query: &str) -> Result<QueryResult> {
        debug!(query = log_query(query), "executing");
        match &self.conn.wait {
            None => self.locked(|s| {
                let result = s.session.exec(query).map_err(|e| s.wire_failure(e));
                s.harvest();
                result
            }),
            Some(hook) => self.exec_green(&**hook, query),
        }
    }

    /// Run a command that returns no rows, raising on any other outcome.
    pub(crate) fn exec_command(&self, query: &str) -> Result<()> {
        let result = self.exec(query)?;
        match result {
            QueryResult::Command { .. } => Ok(()),
            other => Err(self.locked(|s| s.raise(Some(&other)))),
        }
    }

    /// send, flush and consume with the hook called between mutex sections.
    fn exec_green(&self, hook: &dyn WaitHook, query: &str) -> Result<QueryResult> {
        let fd = self.locked(|s| {
            let sent = s
                .session
                .set_nonblocking(true)
                .and_then(|_| s.session.send_query(query));
            match sent {
                Ok(()) => Ok(s.session.descriptor()),
                Err(e) => {
                    let err = s.wire_failure(e);
                    s.restore_blocking();
                    Err(err)
                }
            }
        })?;

        if let Err(err) = self.drive(hook, fd) {
            self.locked(|s| s.restore_blocking());
            return Err(err);
        }

        self.locked(|s| {
            let last = s.last_result();
            s.restore_blocking();
            s.harvest();
            match last? {
                Some(result) => Ok(result),
                None => Err(Error::operational("no result received from the backend")),
            }
        })
    }

    /// Flush the query, then consume input until the result is complete.
    fn drive(&self, hook: &dyn WaitHook, fd: Option<RawSocket>) -> Result<()> {
        while self.locked(|s| s.flush_locked())? == Flush::Pending {
            self.wait(hook, fd, Interest::Write)?;
        }
        while self.locked(|s| s.is_busy_locked())? {
            self.wait(hook, fd, Interest::Read)?;
        }
        Ok(())
    }

    fn wait(&self, hook: &dyn WaitHook, fd: Option<RawSocket>, interest: Interest) -> Result<()> {
        hook.wait(fd, interest).map_err(|err| {
            // the session is mid-command: it cannot be reused
            self.locked(|s| {
                s.session.finish();
                s.closed = ClosedState::Broken;
            });
            err
        })
    }
}

impl Drop for Exclusive<'_> {
    fn drop(&mut self) {
        let (notices, notifies) = self.conn.with_lock(|state| {
            state.busy = false;
            (
                std::mem::take(&mut state.pending_notices),
                std::mem::take(&mut state.pending_notifies),
            )
        });
        self.conn.released.notify_one();
        self.conn.deliver(notices, notifies);
    }
}
