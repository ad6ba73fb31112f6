//! Python binding layer: GIL release and the DB-API exception hierarchy.

use pyo3::create_exception;
use pyo3::exceptions::{PyException, PyOSError};
use pyo3::prelude::*;

use crate::error::{self, ErrorKind};
use crate::interp::InterpreterLock;

create_exception!(_pqpath, Error, PyException);
create_exception!(_pqpath, InterfaceError, Error);
create_exception!(_pqpath, DatabaseError, Error);
create_exception!(_pqpath, DataError, DatabaseError);
create_exception!(_pqpath, OperationalError, DatabaseError);
create_exception!(_pqpath, IntegrityError, DatabaseError);
create_exception!(_pqpath, InternalError, DatabaseError);
create_exception!(_pqpath, ProgrammingError, DatabaseError);
create_exception!(_pqpath, NotSupportedError, DatabaseError);
create_exception!(_pqpath, QueryCanceledError, OperationalError);
create_exception!(_pqpath, TransactionRollbackError, OperationalError);

/// Releases the GIL around blocking sections.
#[derive(Debug, Default, Clone, Copy)]
pub struct GilLock;

impl InterpreterLock for GilLock {
    fn unlocked(&self, f: &mut (dyn FnMut() + Send)) {
        Python::with_gil(|py| py.allow_threads(|| f()))
    }
}

impl From<error::Error> for PyErr {
    fn from(err: error::Error) -> PyErr {
        let msg = err.message().to_string();
        let py_err = match err.kind() {
            ErrorKind::Interface => InterfaceError::new_err(msg),
            ErrorKind::Database => DatabaseError::new_err(msg),
            ErrorKind::NotSupported => NotSupportedError::new_err(msg),
            ErrorKind::Programming => ProgrammingError::new_err(msg),
            ErrorKind::Data => DataError::new_err(msg),
            ErrorKind::Integrity => IntegrityError::new_err(msg),
            ErrorKind::Internal => InternalError::new_err(msg),
            ErrorKind::Operational => OperationalError::new_err(msg),
            ErrorKind::TransactionRollback => TransactionRollbackError::new_err(msg),
            ErrorKind::QueryCanceled => QueryCanceledError::new_err(msg),
            ErrorKind::Io => PyOSError::new_err(msg),
        };
        Python::with_gil(|py| {
            let value = py_err.value(py);
            let _ = value.setattr("pgerror", err.pgerror());
            let _ = value.setattr("pgcode", err.pgcode());
        });
        py_err
    }
}

/// Name of the exception a backend failure maps to.
#[pyfunction]
#[pyo3(signature = (message, sqlstate=None))]
fn classify(message: &str, sqlstate: Option<&str>) -> &'static str {
    error::classify(sqlstate, message).name()
}

/// Remove a leading `ERROR:  `, `FATAL:  ` or `PANIC:  ` prefix.
#[pyfunction]
fn strip_severity(message: &str) -> String {
    error::strip_severity(message).to_string()
}

/// Raise the exception a backend failure maps to.
#[pyfunction]
#[pyo3(signature = (message, sqlstate=None))]
fn raise_backend_error(message: &str, sqlstate: Option<&str>) -> PyResult<()> {
    let kind = error::classify(sqlstate, message);
    Err(error::Error::backend(kind, message, sqlstate).into())
}

/// pqpath - query-execution core of a PostgreSQL client
#[pymodule]
fn _pqpath(m: &Bound<'_, PyModule>) -> PyResult<()> {
    let py = m.py();
    m.add_function(wrap_pyfunction!(classify, m)?)?;
    m.add_function(wrap_pyfunction!(strip_severity, m)?)?;
    m.add_function(wrap_pyfunction!(raise_backend_error, m)?)?;

    m.add("Error", py.get_type::<Error>())?;
    m.add("InterfaceError", py.get_type::<InterfaceError>())?;
    m.add("DatabaseError", py.get_type::<DatabaseError>())?;
    m.add("DataError", py.get_type::<DataError>())?;
    m.add("OperationalError", py.get_type::<OperationalError>())?;
    m.add("IntegrityError", py.get_type::<IntegrityError>())?;
    m.add("InternalError", py.get_type::<InternalError>())?;
    m.add("ProgrammingError", py.get_type::<ProgrammingError>())?;
    m.add("NotSupportedError", py.get_type::<NotSupportedError>())?;
    m.add("QueryCanceledError", py.get_type::<QueryCanceledError>())?;
    m.add("TransactionRollbackError", py.get_type::<TransactionRollbackError>())?;
    Ok(())
}
