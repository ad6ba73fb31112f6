//! Two-phase commit transaction identifiers.
//!
//! An XA-style xid `(format_id, gtrid, bqual)` is stored on the backend as the
//! transaction id `"<format_id>_<base64 gtrid>_<base64 bqual>"`. Ids not in that
//! form (created by other clients) are kept verbatim as an unparsed xid.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{Error, Result};

const MAX_FORMAT_ID: i32 = 0x7fff_ffff;
const MAX_PART_LEN: usize = 64;

/// A two-phase commit transaction identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xid {
    format_id: Option<i32>,
    gtrid: String,
    bqual: Option<String>,
    /// Set on xids returned by recovery.
    pub prepared: Option<String>,
    pub owner: Option<String>,
    pub database: Option<String>,
}

impl Xid {
    /// Build an XA-style xid, validating its components.
    pub fn new(format_id: i32, gtrid: impl Into<String>, bqual: impl Into<String>) -> Result<Self> {
        let gtrid = gtrid.into();
        let bqual = bqual.into();
        if !(0..=MAX_FORMAT_ID).contains(&format_id) {
            return Err(Error::programming(
                "format_id must be a non-negative 32-bit integer",
            ));
        }
        if gtrid.len() > MAX_PART_LEN {
            return Err(Error::programming("gtrid must be a string no longer than 64 characters"));
        }
        if bqual.len() > MAX_PART_LEN {
            return Err(Error::programming("bqual must be a string no longer than 64 characters"));
        }
        Ok(Self {
            format_id: Some(format_id),
            gtrid,
            bqual: Some(bqual),
            prepared: None,
            owner: None,
            database: None,
        })
    }

    /// An xid holding a raw transaction id that is not in XA form.
    pub fn unparsed(tid: impl Into<String>) -> Self {
        Self {
            format_id: None,
            gtrid: tid.into(),
            bqual: None,
            prepared: None,
            owner: None,
            database: None,
        }
    }

    /// Parse a backend transaction id, falling back to an unparsed xid.
    pub fn from_string(tid: &str) -> Self {
        Self::parse_xa(tid).unwrap_or_else(|| Self::unparsed(tid))
    }

    fn parse_xa(tid: &str) -> Option<Self> {
        let mut parts = tid.splitn(3, '_');
        let fid = parts.next()?;
        let gtrid = parts.next()?;
        let bqual = parts.next()?;
        if fid.is_empty() || !fid.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let fid: i32 = fid.parse().ok()?;
        let gtrid = String::from_utf8(STANDARD.decode(gtrid).ok()?).ok()?;
        let bqual = String::from_utf8(STANDARD.decode(bqual).ok()?).ok()?;
        Xid::new(fid, gtrid, bqual).ok()
    }

    pub fn format_id(&self) -> Option<i32> {
        self.format_id
    }

    pub fn gtrid(&self) -> &str {
        &self.gtrid
    }

    pub fn bqual(&self) -> Option<&str> {
        self.bqual.as_deref()
    }

    /// The transaction id sent to the backend.
    pub fn to_tid(&self) -> String {
        match (self.format_id, &self.bqual) {
            (Some(fid), Some(bqual)) => format!(
                "{}_{}_{}",
                fid,
                STANDARD.encode(self.gtrid.as_bytes()),
                STANDARD.encode(bqual.as_bytes())
            ),
            _ => self.gtrid.clone(),
        }
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_tid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encoding() {
        let xid = Xid::new(42, "gtrid", "bqual").unwrap();
        assert_eq!(xid.to_tid(), "42_Z3RyaWQ=_YnF1YWw=");
    }

    #[test]
    fn test_from_string() {
        let x = Xid::from_string("42_Z3RyaWQ=_YnF1YWw=");
        assert_eq!(x.format_id(), Some(42));
        assert_eq!(x.gtrid(), "gtrid");
        assert_eq!(x.bqual(), Some("bqual"));
        assert_eq!(x.to_string(), "42_Z3RyaWQ=_YnF1YWw=");
    }

    #[test]
    fn test_from_string_unparsed() {
        let x = Xid::from_string("99_xxx_yyy");
        assert_eq!(x.format_id(), None);
        assert_eq!(x.gtrid(), "99_xxx_yyy");
        assert_eq!(x.bqual(), None);
        assert_eq!(x.to_string(), "99_xxx_yyy");

        assert_eq!(Xid::from_string("transaction-id").gtrid(), "transaction-id");
    }

    #[test]
    fn test_limits() {
        assert!(Xid::new(0x7fff_ffff, "a", "b").is_ok());
        assert!(Xid::new(-1, "a", "b").is_err());
        assert!(Xid::new(1, "x".repeat(64), "b").is_ok());
        assert!(Xid::new(1, "x".repeat(65), "b").is_err());
        assert!(Xid::new(1, "a", "y".repeat(65)).is_err());
    }
}
