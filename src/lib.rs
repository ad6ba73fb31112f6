//! pqpath - query-execution core of a PostgreSQL client.
//!
//! Drives one backend connection through command submission, result
//! retrieval, COPY streaming and transaction bracketing, classifying backend
//! failures into the DB-API error taxonomy.

pub mod config;
pub mod error;
pub mod interp;
pub mod pg;
pub mod typecast;

#[cfg(feature = "python")]
mod python;

pub use config::CoreConfig;
pub use error::{classify, strip_severity, Error, ErrorKind, Result};
pub use interp::{allow_threads, InterpreterLock, NoInterpreterLock};
pub use pg::{Connection, Cursor};
pub use typecast::{resolve_cast, CastScope, Converter, Oid, Typecaster, Value};

#[cfg(feature = "python")]
pub use python::GilLock;
