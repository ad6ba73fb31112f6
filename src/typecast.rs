//! Type casting: turning wire-format column bytes into values.
//!
//! Converters are registered per type OID in a [`CastScope`]. Lookups walk an
//! ordered list of scopes (cursor, then connection) before the process-wide
//! scope and finally the textual default.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::{Error, ErrorKind, Result};

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(pub i32);

impl Oid {
    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const OID_TYPE: Oid = Oid(26);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const UNKNOWN: Oid = Oid(705);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const NUMERIC: Oid = Oid(1700);

    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME | Oid::UNKNOWN
        )
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8 | Oid::OID_TYPE)
    }

    pub fn is_float(self) -> bool {
        matches!(self, Oid::FLOAT4 | Oid::FLOAT8)
    }
}

// ============================================================================
// Values
// ============================================================================

/// A decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Arbitrary-precision numeric kept in its textual form.
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }
}

// ============================================================================
// Typecasters
// ============================================================================

type CastFn = dyn Fn(&[u8]) -> Result<Value> + Send + Sync;

/// A named converter for one or more type OIDs.
pub struct Typecaster {
    name: String,
    oids: Vec<Oid>,
    cast: Arc<CastFn>,
}

/// Shared handle to a typecaster, as resolved per column.
pub type Converter = Arc<Typecaster>;

impl Typecaster {
    pub fn new<F>(name: impl Into<String>, oids: Vec<Oid>, cast: F) -> Self
    where
        F: Fn(&[u8]) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            oids,
            cast: Arc::new(cast),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn oids(&self) -> &[Oid] {
        &self.oids
    }

    /// Convert one cell. SQL NULL never reaches the cast function.
    pub fn cast(&self, data: Option<&[u8]>) -> Result<Value> {
        match data {
            None => Ok(Value::Null),
            Some(bytes) => (self.cast)(bytes),
        }
    }
}

impl fmt::Debug for Typecaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Typecaster")
            .field("name", &self.name)
            .field("oids", &self.oids)
            .finish()
    }
}

fn utf8(data: &[u8], type_name: &str) -> Result<String> {
    std::str::from_utf8(data)
        .map(str::to_owned)
        .map_err(|e| Error::new(ErrorKind::Data, format!("invalid {} value: {}", type_name, e)))
}

fn cast_text(data: &[u8]) -> Result<Value> {
    Ok(Value::Text(String::from_utf8_lossy(data).into_owned()))
}

fn cast_bool(data: &[u8]) -> Result<Value> {
    match data {
        b"t" | b"true" => Ok(Value::Bool(true)),
        b"f" | b"false" => Ok(Value::Bool(false)),
        _ => Err(Error::new(
            ErrorKind::Data,
            format!("invalid boolean value: {}", String::from_utf8_lossy(data)),
        )),
    }
}

fn cast_int(data: &[u8]) -> Result<Value> {
    let text = utf8(data, "integer")?;
    text.trim()
        .parse::<i64>()
        .map(Value::Int)
        .map_err(|e| Error::new(ErrorKind::Data, format!("invalid integer {:?}: {}", text, e)))
}

fn cast_float(data: &[u8]) -> Result<Value> {
    let text = utf8(data, "float")?;
    text.trim()
        .parse::<f64>()
        .map(Value::Float)
        .map_err(|e| Error::new(ErrorKind::Data, format!("invalid float {:?}: {}", text, e)))
}

fn cast_numeric(data: &[u8]) -> Result<Value> {
    utf8(data, "numeric").map(Value::Decimal)
}

/// Decode bytea in either the hex (`\x...`) or the escape output format.
fn cast_bytea(data: &[u8]) -> Result<Value> {
    if let Some(hex) = data.strip_prefix(b"\\x") {
        if hex.len() % 2 != 0 {
            return Err(Error::new(ErrorKind::Data, "odd length hex bytea"));
        }
        let mut out = Vec::with_capacity(hex.len() / 2);
        for pair in hex.chunks(2) {
            let hi = hex_digit(pair[0])?;
            let lo = hex_digit(pair[1])?;
            out.push((hi << 4) | lo);
        }
        return Ok(Value::Bytes(out));
    }

    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] != b'\\' {
            out.push(data[i]);
            i += 1;
        } else if data.get(i + 1) == Some(&b'\\') {
            out.push(b'\\');
            i += 2;
        } else if i + 3 < data.len()
            && data[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let octal = (data[i + 1] - b'0') as u32 * 64
                + (data[i + 2] - b'0') as u32 * 8
                + (data[i + 3] - b'0') as u32;
            let byte = u8::try_from(octal)
                .map_err(|_| Error::new(ErrorKind::Data, "octal escape out of range in bytea"))?;
            out.push(byte);
            i += 4;
        } else {
            return Err(Error::new(ErrorKind::Data, "invalid escape in bytea"));
        }
    }
    Ok(Value::Bytes(out))
}

fn hex_digit(b: u8) -> Result<u8> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(Error::new(ErrorKind::Data, "invalid hex digit in bytea")),
    }
}

/// Generic textual default, used when no scope knows the OID.
pub static DEFAULT_CAST: Lazy<Converter> =
    Lazy::new(|| Arc::new(Typecaster::new("STRING", vec![], cast_text)));

/// Generic binary default (bytea).
pub static BINARY_CAST: Lazy<Converter> =
    Lazy::new(|| Arc::new(Typecaster::new("BINARY", vec![Oid::BYTEA], cast_bytea)));

/// Whether `conv` is the generic binary default.
pub fn is_binary_default(conv: &Converter) -> bool {
    Arc::ptr_eq(conv, &*BINARY_CAST)
}

// ============================================================================
// Cast scopes
// ============================================================================

/// One layer of OID → converter overrides.
#[derive(Debug, Default, Clone)]
pub struct CastScope {
    casts: HashMap<Oid, Converter>,
}

impl CastScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope holding the built-in converters.
    pub fn with_defaults() -> Self {
        let mut scope = Self::new();
        scope.register(Arc::new(Typecaster::new("BOOLEAN", vec![Oid::BOOL], cast_bool)));
        scope.register(Arc::new(Typecaster::new(
            "INTEGER",
            vec![Oid::INT2, Oid::INT4, Oid::INT8, Oid::OID_TYPE],
            cast_int,
        )));
        scope.register(Arc::new(Typecaster::new(
            "FLOAT",
            vec![Oid::FLOAT4, Oid::FLOAT8],
            cast_float,
        )));
        scope.register(Arc::new(Typecaster::new("DECIMAL", vec![Oid::NUMERIC], cast_numeric)));
        scope.register(Arc::new(Typecaster::new(
            "UNICODE",
            vec![Oid::TEXT, Oid::VARCHAR, Oid::BPCHAR, Oid::CHAR, Oid::NAME, Oid::UNKNOWN],
            cast_text,
        )));
        scope.register(Converter::clone(&BINARY_CAST));
        scope
    }

    /// Register `caster` for each of its OIDs, replacing previous entries.
    pub fn register(&mut self, caster: Converter) {
        for oid in caster.oids().to_vec() {
            self.casts.insert(oid, caster.clone());
        }
    }

    pub fn remove(&mut self, oid: Oid) -> Option<Converter> {
        self.casts.remove(&oid)
    }

    pub fn get(&self, oid: Oid) -> Option<&Converter> {
        self.casts.get(&oid)
    }

    pub fn len(&self) -> usize {
        self.casts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.casts.is_empty()
    }
}

static GLOBAL_CASTS: Lazy<RwLock<CastScope>> =
    Lazy::new(|| RwLock::new(CastScope::with_defaults()));

/// Register a converter in the process-wide scope.
pub fn register_global(caster: Converter) {
    GLOBAL_CASTS.write().register(caster);
}

/// Find the converter for `oid`.
///
/// `scopes` are searched in order (absent layers are skipped), then the
/// process-wide scope, then [`DEFAULT_CAST`].
pub fn resolve_cast(oid: Oid, scopes: &[Option<&CastScope>]) -> Converter {
    for scope in scopes.iter().flatten() {
        if let Some(conv) = scope.get(oid) {
            return conv.clone();
        }
    }
    GLOBAL_CASTS
        .read()
        .get(oid)
        .cloned()
        .unwrap_or_else(|| Converter::clone(&DEFAULT_CAST))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_oid_classification() {
        assert!(Oid::TEXT.is_text_like());
        assert!(Oid::VARCHAR.is_text_like());
        assert!(!Oid::INT4.is_text_like());
        assert!(Oid::INT8.is_integer());
        assert!(Oid::FLOAT4.is_float());
        assert!(!Oid::NUMERIC.is_float());
    }

    #[test]
    fn test_builtin_casts() {
        let int = resolve_cast(Oid::INT4, &[]);
        assert_eq!(int.cast(Some(b"-42")).unwrap(), Value::Int(-42));
        assert_eq!(int.cast(None).unwrap(), Value::Null);

        let b = resolve_cast(Oid::BOOL, &[]);
        assert_eq!(b.cast(Some(b"t")).unwrap(), Value::Bool(true));
        assert_eq!(b.cast(Some(b"f")).unwrap(), Value::Bool(false));

        let f = resolve_cast(Oid::FLOAT8, &[]);
        assert_eq!(f.cast(Some(b"1.5")).unwrap(), Value::Float(1.5));

        let n = resolve_cast(Oid::NUMERIC, &[]);
        assert_eq!(
            n.cast(Some(b"12.340")).unwrap(),
            Value::Decimal("12.340".to_string())
        );
    }

    #[test]
    fn test_bad_integer_is_data_error() {
        let int = resolve_cast(Oid::INT8, &[]);
        let err = int.cast(Some(b"twelve")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Data);
    }

    #[test]
    fn test_bytea_formats() {
        let conv = resolve_cast(Oid::BYTEA, &[]);
        assert!(is_binary_default(&conv));
        assert_eq!(
            conv.cast(Some(b"\\x41ff")).unwrap(),
            Value::Bytes(vec![0x41, 0xff])
        );
        assert_eq!(
            conv.cast(Some(b"a\\\\b\\001")).unwrap(),
            Value::Bytes(vec![b'a', b'\\', b'b', 1])
        );
        assert!(conv.cast(Some(b"\\x4")).is_err());
    }

    #[test]
    fn test_bytea_octal_escape_above_byte_range() {
        let conv = resolve_cast(Oid::BYTEA, &[]);
        assert_eq!(conv.cast(Some(b"\\377")).unwrap(), Value::Bytes(vec![0xff]));
        let err = conv.cast(Some(b"\\400")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Data);
        assert!(conv.cast(Some(b"\\777")).is_err());
    }

    #[test]
    fn test_unknown_oid_falls_back_to_default() {
        let conv = resolve_cast(Oid(999_999), &[]);
        assert_eq!(conv.name(), "STRING");
        assert_eq!(conv.cast(Some(b"abc")).unwrap(), Value::Text("abc".to_string()));
    }

    #[test]
    fn test_scope_priority() {
        let mut cursor_scope = CastScope::new();
        cursor_scope.register(Arc::new(Typecaster::new("CURSOR_INT", vec![Oid::INT4], |_| {
            Ok(Value::Int(1))
        })));
        let mut conn_scope = CastScope::new();
        conn_scope.register(Arc::new(Typecaster::new(
            "CONN_INT",
            vec![Oid::INT4, Oid::INT8],
            |_| Ok(Value::Int(2)),
        )));

        let scopes = [Some(&cursor_scope), Some(&conn_scope)];
        assert_eq!(resolve_cast(Oid::INT4, &scopes).name(), "CURSOR_INT");
        assert_eq!(resolve_cast(Oid::INT8, &scopes).name(), "CONN_INT");
        assert_eq!(resolve_cast(Oid::INT2, &scopes).name(), "INTEGER");

        // missing cursor layer is skipped
        assert_eq!(resolve_cast(Oid::INT4, &[None, Some(&conn_scope)]).name(), "CONN_INT");
    }
}
