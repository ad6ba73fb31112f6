//! Error taxonomy and backend error classification.
//!
//! Every failure surfaced by the driver is one [`Error`] carrying a kind, the
//! human-readable message (severity prefix stripped), the raw backend message
//! and, when the backend sent one, the SQLSTATE code.

use std::fmt;
use std::io;

use thiserror::Error;

/// Classified error kinds, following the DB-API exception hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Misuse of the client interface (closed connection, no message available).
    Interface,
    /// Generic backend error that matched no specific class.
    Database,
    NotSupported,
    Programming,
    Data,
    Integrity,
    Internal,
    Operational,
    /// Serialization failure or deadlock; the transaction may be retried.
    TransactionRollback,
    /// Statement canceled by the backend (SQLSTATE 57014).
    QueryCanceled,
    /// A caller-supplied copy source or sink failed.
    Io,
}

impl ErrorKind {
    /// Whether this kind is an operational error (including its sub-kinds).
    pub fn is_operational(self) -> bool {
        matches!(
            self,
            ErrorKind::Operational | ErrorKind::TransactionRollback | ErrorKind::QueryCanceled
        )
    }

    /// Whether this kind was reported by the backend (as opposed to the client).
    pub fn is_database(self) -> bool {
        !matches!(self, ErrorKind::Interface | ErrorKind::Io)
    }

    /// Only transaction rollbacks are worth retrying; the driver never does it itself.
    pub fn is_retryable(self) -> bool {
        self == ErrorKind::TransactionRollback
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Interface => "InterfaceError",
            ErrorKind::Database => "DatabaseError",
            ErrorKind::NotSupported => "NotSupportedError",
            ErrorKind::Programming => "ProgrammingError",
            ErrorKind::Data => "DataError",
            ErrorKind::Integrity => "IntegrityError",
            ErrorKind::Internal => "InternalError",
            ErrorKind::Operational => "OperationalError",
            ErrorKind::TransactionRollback => "TransactionRollbackError",
            ErrorKind::QueryCanceled => "QueryCanceledError",
            ErrorKind::Io => "IOError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A classified driver error.
#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    pgerror: Option<String>,
    pgcode: Option<String>,
    #[source]
    source: Option<io::Error>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            pgerror: None,
            pgcode: None,
            source: None,
        }
    }

    /// Build an error from a raw backend message, keeping the raw text for diagnostics.
    pub fn backend(kind: ErrorKind, raw: &str, pgcode: Option<&str>) -> Self {
        Self {
            kind,
            message: strip_severity(raw).trim_end_matches('\n').to_string(),
            pgerror: Some(raw.to_string()),
            pgcode: pgcode.map(str::to_string),
            source: None,
        }
    }

    pub fn operational(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Operational, message)
    }

    pub fn programming(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Programming, message)
    }

    pub fn interface(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Interface, message)
    }

    /// Wrap a failure of a caller-supplied copy source or sink.
    pub fn io(context: &str, err: io::Error) -> Self {
        Self {
            kind: ErrorKind::Io,
            message: format!("{}: {}", context, err),
            pgerror: None,
            pgcode: None,
            source: Some(err),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Message with the severity prefix removed.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Raw backend message, as received.
    pub fn pgerror(&self) -> Option<&str> {
        self.pgerror.as_deref()
    }

    /// SQLSTATE code, when the backend reported one.
    pub fn pgcode(&self) -> Option<&str> {
        self.pgcode.as_deref()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

const SEVERITY_PREFIXES: [&str; 3] = ["ERROR:  ", "FATAL:  ", "PANIC:  "];

/// Strip off the severity from a backend error message.
///
/// Only messages strictly longer than the 8-byte prefix are stripped.
pub fn strip_severity(msg: &str) -> &str {
    if msg.len() > 8 {
        for prefix in SEVERITY_PREFIXES {
            if let Some(rest) = msg.strip_prefix(prefix) {
                return rest;
            }
        }
    }
    msg
}

/// Map a SQLSTATE code to an error kind by its two-character class.
///
/// See the PostgreSQL error codes appendix for the class list.
pub fn kind_from_sqlstate(sqlstate: &str) -> ErrorKind {
    if sqlstate == "57014" {
        return ErrorKind::QueryCanceled;
    }
    let class = sqlstate.get(..2).unwrap_or("");
    match class {
        // Feature Not Supported
        "0A" => ErrorKind::NotSupported,
        // Cardinality Violation
        "21" => ErrorKind::Programming,
        "22" => ErrorKind::Data,
        "23" => ErrorKind::Integrity,
        // Invalid Cursor State, Invalid Transaction State
        "24" | "25" => ErrorKind::Internal,
        // Invalid SQL Statement Name, Triggered Data Change, Invalid Authorization
        "26" | "27" | "28" => ErrorKind::Operational,
        // Dependent Privilege Descriptors, Invalid Transaction Termination, SQL Routine
        "2B" | "2D" | "2F" => ErrorKind::Internal,
        // Invalid Cursor Name
        "34" => ErrorKind::Operational,
        // External Routine, External Routine Invocation, Savepoint
        "38" | "39" | "3B" => ErrorKind::Internal,
        // Invalid Catalog Name, Invalid Schema Name
        "3D" | "3F" => ErrorKind::Programming,
        "40" => ErrorKind::TransactionRollback,
        // Syntax Error or Access Rule Violation, WITH CHECK OPTION Violation
        "42" | "44" => ErrorKind::Programming,
        // Insufficient Resources, Program Limit, Prerequisite State, Operator
        // Intervention, System Error
        "53" | "54" | "55" | "57" | "58" => ErrorKind::Operational,
        // Configuration File, PL/pgSQL, Internal Error
        "F0" | "P0" | "XX" => ErrorKind::Internal,
        _ => ErrorKind::Database,
    }
}

/// Guess the error kind from the message text alone.
///
/// Only used for the older protocol generation, which carries no SQLSTATE.
/// The phrases are the ones old backends emit and must not be changed.
pub fn kind_from_message(message: &str) -> ErrorKind {
    let msg = strip_severity(message);
    if msg.starts_with("Cannot insert a duplicate key")
        || msg.starts_with("ExecAppend: Fail to add null")
        || msg.contains("referential integrity violation")
    {
        ErrorKind::Integrity
    } else if msg.contains("could not serialize") || msg.contains("deadlock detected") {
        ErrorKind::TransactionRollback
    } else {
        ErrorKind::Programming
    }
}

/// Classify a backend failure: by SQLSTATE when available, else by message text.
pub fn classify(sqlstate: Option<&str>, message: &str) -> ErrorKind {
    match sqlstate {
        Some(code) if !code.is_empty() => kind_from_sqlstate(code),
        _ => kind_from_message(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_classes() {
        let table = [
            ("0A000", ErrorKind::NotSupported),
            ("21000", ErrorKind::Programming),
            ("22012", ErrorKind::Data),
            ("23505", ErrorKind::Integrity),
            ("24000", ErrorKind::Internal),
            ("25P02", ErrorKind::Internal),
            ("26000", ErrorKind::Operational),
            ("27000", ErrorKind::Operational),
            ("28P01", ErrorKind::Operational),
            ("2BP01", ErrorKind::Internal),
            ("2D000", ErrorKind::Internal),
            ("2F005", ErrorKind::Internal),
            ("34000", ErrorKind::Operational),
            ("38001", ErrorKind::Internal),
            ("39004", ErrorKind::Internal),
            ("3B001", ErrorKind::Internal),
            ("3D000", ErrorKind::Programming),
            ("3F000", ErrorKind::Programming),
            ("40001", ErrorKind::TransactionRollback),
            ("40P01", ErrorKind::TransactionRollback),
            ("42P01", ErrorKind::Programming),
            ("44000", ErrorKind::Programming),
            ("53100", ErrorKind::Operational),
            ("54001", ErrorKind::Operational),
            ("55P03", ErrorKind::Operational),
            ("57P01", ErrorKind::Operational),
            ("58030", ErrorKind::Operational),
            ("F0000", ErrorKind::Internal),
            ("P0001", ErrorKind::Internal),
            ("XX000", ErrorKind::Internal),
        ];
        for (code, kind) in table {
            assert_eq!(kind_from_sqlstate(code), kind, "sqlstate {}", code);
        }
    }

    #[test]
    fn test_query_canceled_is_not_operational_class() {
        assert_eq!(kind_from_sqlstate("57014"), ErrorKind::QueryCanceled);
        assert_eq!(kind_from_sqlstate("57000"), ErrorKind::Operational);
        assert!(ErrorKind::QueryCanceled.is_operational());
    }

    #[test]
    fn test_unmatched_sqlstate_is_database() {
        assert_eq!(kind_from_sqlstate("01000"), ErrorKind::Database);
        assert_eq!(kind_from_sqlstate("50000"), ErrorKind::Database);
        assert_eq!(kind_from_sqlstate("HV000"), ErrorKind::Database);
        assert_eq!(kind_from_sqlstate("2"), ErrorKind::Database);
    }

    #[test]
    fn test_strip_severity() {
        assert_eq!(strip_severity("ERROR:  relation does not exist"), "relation does not exist");
        assert_eq!(strip_severity("FATAL:  terminating connection"), "terminating connection");
        assert_eq!(strip_severity("PANIC:  oops"), "oops");
        assert_eq!(strip_severity("WARNING:  x"), "WARNING:  x");
        // exactly the prefix length is left alone
        assert_eq!(strip_severity("ERROR:  "), "ERROR:  ");
        assert_eq!(strip_severity("ERROR:"), "ERROR:");
    }

    #[test]
    fn test_message_fallback() {
        assert_eq!(
            classify(None, "ERROR:  Cannot insert a duplicate key into unique index"),
            ErrorKind::Integrity
        );
        assert_eq!(
            classify(None, "ERROR:  ExecAppend: Fail to add null value in not null attribute"),
            ErrorKind::Integrity
        );
        assert_eq!(
            classify(None, "ERROR:  <unnamed> referential integrity violation"),
            ErrorKind::Integrity
        );
        assert_eq!(
            classify(None, "ERROR:  could not serialize access"),
            ErrorKind::TransactionRollback
        );
        assert_eq!(classify(None, "ERROR:  deadlock detected"), ErrorKind::TransactionRollback);
        assert_eq!(classify(None, "ERROR:  syntax error"), ErrorKind::Programming);
        assert_eq!(classify(Some(""), "ERROR:  syntax error"), ErrorKind::Programming);
    }

    #[test]
    fn test_sqlstate_wins_over_message() {
        assert_eq!(classify(Some("22P02"), "ERROR:  deadlock detected"), ErrorKind::Data);
    }

    #[test]
    fn test_backend_error_keeps_raw_message() {
        let err = Error::backend(
            ErrorKind::Programming,
            "ERROR:  syntax error at end",
            Some("42601"),
        );
        assert_eq!(err.message(), "syntax error at end");
        assert_eq!(err.pgerror(), Some("ERROR:  syntax error at end"));
        assert_eq!(err.pgcode(), Some("42601"));
        assert_eq!(err.to_string(), "ProgrammingError: syntax error at end");
    }

    #[test]
    fn test_io_error_has_source() {
        use std::error::Error as _;
        let err = Error::io("copy source", io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.source().is_some());
        assert!(!err.kind().is_database());
    }
}
