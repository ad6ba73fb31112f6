//! Transaction bracketing: BEGIN/COMMIT/ROLLBACK, session reset and two-phase
//! commit.
//!
//! Every command here goes through [`Exclusive::exec_command`], never through
//! the row-returning path.

use tracing::debug;

use super::connection::{ConnStatus, Connection, Exclusive, IsolationLevel};
use super::wire::QueryResult;
use super::xid::Xid;
use crate::error::{Error, Result};

const RESET_COMMANDS: [&str; 2] = ["RESET ALL", "SET SESSION AUTHORIZATION DEFAULT"];

const RECOVER_QUERY: &str = "SELECT gid, prepared, owner, database FROM pg_prepared_xacts";

// ============================================================================
// Locked primitives
// ============================================================================

impl Exclusive<'_> {
    /// Open a transaction unless in autocommit or already inside one.
    pub(crate) fn begin(&self) -> Result<()> {
        let command = self.locked(|s| match s.status {
            ConnStatus::Ready => s.isolation_level.begin_command(),
            _ => None,
        });
        let Some(command) = command else {
            return Ok(());
        };

        self.exec_command(command)?;
        self.locked(|s| s.status = ConnStatus::Begin);
        debug!("transaction started");
        Ok(())
    }

    /// COMMIT the open transaction.
    ///
    /// The backend ends the transaction whatever the outcome, so the status
    /// returns to ready even when the command fails.
    pub(crate) fn commit(&self) -> Result<()> {
        self.end_transaction("COMMIT")
    }

    /// ROLLBACK the open transaction, returning to ready whatever the outcome.
    pub(crate) fn abort(&self) -> Result<()> {
        self.end_transaction("ROLLBACK")
    }

    fn end_transaction(&self, command: &'static str) -> Result<()> {
        let open = self.locked(|s| {
            if s.status == ConnStatus::Begin {
                s.mark += 1;
                true
            } else {
                false
            }
        });
        if !open {
            return Ok(());
        }

        let result = self.exec_command(command);
        self.locked(|s| s.status = ConnStatus::Ready);
        debug!(command, ok = result.is_ok(), "transaction ended");
        result
    }

    /// Abort any open transaction and reset every session setting.
    pub(crate) fn reset(&self) -> Result<()> {
        let open = self.locked(|s| {
            s.mark += 1;
            s.isolation_level != IsolationLevel::Autocommit && s.status == ConnStatus::Begin
        });
        if open {
            self.exec_command("ABORT")?;
        }
        for command in RESET_COMMANDS {
            self.exec_command(command)?;
        }

        self.locked(|s| {
            s.status = ConnStatus::Ready;
            s.isolation_level = s.default_isolation;
            s.tpc_xid = None;
        });
        debug!("session reset");
        Ok(())
    }

    /// Run `"<command> <quoted tid>;"`.
    pub(crate) fn tpc_command(&self, command: &str, tid: &str) -> Result<()> {
        let quoted = self.connection().escaper.escape(tid);
        self.exec_command(&format!("{} {};", command, quoted))
    }
}

// ============================================================================
// Public surface
// ============================================================================

impl Connection {
    /// Commit the current transaction.
    pub fn commit(&self) -> Result<()> {
        let ex = self.reserve("commit", None)?;
        self.refuse_during_tpc(&ex, "commit")?;
        ex.commit()
    }

    /// Roll back the current transaction.
    pub fn rollback(&self) -> Result<()> {
        let ex = self.reserve("rollback", None)?;
        self.refuse_during_tpc(&ex, "rollback")?;
        ex.abort()
    }

    /// Return the session to its initial state.
    pub fn reset(&self) -> Result<()> {
        let ex = self.reserve("reset", None)?;
        ex.reset()
    }

    /// Change the isolation level, aborting any open transaction first.
    pub fn set_isolation_level(&self, level: IsolationLevel) -> Result<()> {
        let ex = self.reserve("set_isolation_level", None)?;
        self.refuse_during_tpc(&ex, "set_isolation_level")?;
        let result = ex.abort();
        ex.locked(|s| s.isolation_level = level);
        result
    }

    fn refuse_during_tpc(&self, ex: &Exclusive<'_>, op: &str) -> Result<()> {
        if ex.locked(|s| s.tpc_xid.is_some()) {
            Err(Error::programming(format!(
                "{} cannot be used during a two-phase transaction",
                op
            )))
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Two-phase commit
    // ========================================================================

    /// Start a two-phase transaction identified by `xid`.
    pub fn tpc_begin(&self, xid: Xid) -> Result<()> {
        let ex = self.reserve("tpc_begin", None)?;
        ex.locked(|s| {
            if s.status != ConnStatus::Ready {
                return Err(Error::programming(
                    "tpc_begin must be called outside a transaction",
                ));
            }
            if s.isolation_level == IsolationLevel::Autocommit {
                return Err(Error::programming(
                    "tpc_begin can't be called in autocommit mode",
                ));
            }
            Ok(())
        })?;

        ex.begin()?;
        debug!(xid = %xid, "two-phase transaction started");
        ex.locked(|s| s.tpc_xid = Some(xid));
        Ok(())
    }

    /// First phase: PREPARE TRANSACTION.
    pub fn tpc_prepare(&self) -> Result<()> {
        let ex = self.reserve("tpc_prepare", None)?;
        let tid = ex.locked(|s| match (&s.tpc_xid, s.status) {
            (Some(xid), ConnStatus::Begin) => Ok(xid.to_tid()),
            (None, _) => Err(Error::programming(
                "tpc_prepare must be called inside a two-phase transaction",
            )),
            (Some(_), _) => Err(Error::programming(
                "tpc_prepare must be called with the transaction still open",
            )),
        })?;

        ex.tpc_command("PREPARE TRANSACTION", &tid)?;
        ex.locked(|s| {
            s.mark += 1;
            s.status = ConnStatus::Prepared;
        });
        Ok(())
    }

    /// Commit the current two-phase transaction, or the prepared one named by `xid`.
    ///
    /// Without `xid`, a transaction that was never prepared is committed in
    /// one phase.
    pub fn tpc_commit(&self, xid: Option<Xid>) -> Result<()> {
        self.tpc_finish("tpc_commit", "COMMIT", "COMMIT PREPARED", xid)
    }

    /// Roll back the current two-phase transaction, or the prepared one named by `xid`.
    pub fn tpc_rollback(&self, xid: Option<Xid>) -> Result<()> {
        self.tpc_finish("tpc_rollback", "ROLLBACK", "ROLLBACK PREPARED", xid)
    }

    fn tpc_finish(
        &self,
        op: &'static str,
        one_phase: &'static str,
        prepared: &'static str,
        xid: Option<Xid>,
    ) -> Result<()> {
        let ex = self.reserve(op, None)?;

        match xid {
            Some(xid) => {
                if ex.locked(|s| s.status) != ConnStatus::Ready {
                    return Err(Error::programming(format!(
                        "{} with an xid must be called outside a transaction",
                        op
                    )));
                }
                ex.tpc_command(prepared, &xid.to_tid())?;
            }
            None => {
                let (status, tid) =
                    ex.locked(|s| (s.status, s.tpc_xid.as_ref().map(Xid::to_tid)));
                let Some(tid) = tid else {
                    return Err(Error::programming(format!(
                        "{} with no parameter must be called in a two-phase transaction",
                        op
                    )));
                };
                match status {
                    ConnStatus::Begin => ex.exec_command(one_phase)?,
                    ConnStatus::Prepared => ex.tpc_command(prepared, &tid)?,
                    _ => {
                        return Err(Error::programming(format!(
                            "unexpected state in {}",
                            op
                        )))
                    }
                }
            }
        }

        ex.locked(|s| {
            s.mark += 1;
            s.status = ConnStatus::Ready;
            s.tpc_xid = None;
        });
        debug!(op, "two-phase transaction finished");
        Ok(())
    }

    /// List the prepared transactions known to the backend.
    ///
    /// Leaves the transaction status untouched.
    pub fn tpc_recover(&self) -> Result<Vec<Xid>> {
        let ex = self.reserve("tpc_recover", None)?;
        let result = ex.exec(RECOVER_QUERY)?;
        let QueryResult::Tuples { rows, .. } = &result else {
            return Err(ex.locked(|s| s.raise(Some(&result))));
        };

        let text = |cell: &Option<bytes::Bytes>| {
            cell.as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
        };
        Ok(rows
            .iter()
            .map(|row| {
                let gid = row.first().and_then(text).unwrap_or_default();
                let mut xid = Xid::from_string(&gid);
                xid.prepared = row.get(1).and_then(text);
                xid.owner = row.get(2).and_then(text);
                xid.database = row.get(3).and_then(text);
                xid
            })
            .collect())
    }
}
