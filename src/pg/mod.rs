//! PostgreSQL query-execution core.
//!
//! Architecture:
//! - `protocol`: wire protocol 3 message encoding/decoding
//! - `wire`: transport primitives consumed by the core (`WireSession`)
//! - `session`: `WireSession` over an established byte stream
//! - `connection`: connection state, locking, critical conditions, error raising
//! - `transaction`: BEGIN/COMMIT/ROLLBACK/RESET and two-phase commit
//! - `execute`: synchronous and asynchronous submission, polling
//! - `fetch`: result classification and column metadata
//! - `copy`: COPY streaming for both protocol generations
//! - `cursor`: client-side result handle

pub mod protocol;
pub mod wire;
pub mod session;
pub mod connection;
pub mod transaction;
pub mod execute;
pub mod fetch;
pub mod copy;
pub mod cursor;
pub mod xid;
pub mod escape;
pub mod wait;


pub use connection::{
    AsyncStatus, ClosedState, ConnStatus, Connection, ConnectionBuilder, IsolationLevel,
    NoticeHandler,
};
pub use cursor::{CopyTarget, Cursor, Row};
pub use escape::{Escaper, StandardEscaper};
pub use execute::{BusyState, ExecMode, Executed, PollState};
pub use fetch::{ColumnDescriptor, Fetched};
pub use session::{PgSession, Socket};
pub use wait::{Interest, WaitHook, YieldWait};
pub use wire::{
    CopyChunk, Flush, Line, Notification, QueryResult, ServerError, SessionStatus, WireError,
    WireResult, WireSession,
};
pub use xid::Xid;
