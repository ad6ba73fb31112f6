//! Result classification and column metadata.

use smallvec::SmallVec;
use tracing::debug;

use super::connection::Exclusive;
use super::cursor::Cursor;
use super::protocol::FieldDescription;
use super::wire::QueryResult;
use crate::error::{Error, Result};
use crate::typecast::{is_binary_default, resolve_cast, Converter, Oid, DEFAULT_CAST};

/// Width of the varlena header included in a type modifier.
const VARHDRSZ: i32 = 4;

/// What a fetch found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetched {
    /// No result was pending.
    NoResult,
    Command,
    Tuples,
    Copy,
}

/// Metadata of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub type_code: Oid,
    /// Widest cell in the result, when display sizes are enabled.
    pub display_size: Option<i32>,
    pub internal_size: i32,
    pub precision: Option<i32>,
    pub scale: Option<i32>,
    /// Never known from a result alone.
    pub null_ok: Option<bool>,
}

impl ColumnDescriptor {
    /// Describe `field`, decoding numeric precision and scale from its type modifier.
    pub fn from_field(field: &FieldDescription, display_size: Option<i32>) -> Self {
        let mut fmod = field.type_modifier;
        if fmod > 0 {
            fmod -= VARHDRSZ;
        }
        let numeric = field.type_oid == Oid::NUMERIC;
        let fsize = i32::from(field.type_size);

        let internal_size = match (fsize, numeric) {
            (-1, true) => (fmod >> 16) & 0xFFFF,
            (-1, false) => fmod,
            _ => fsize,
        };
        let (precision, scale) = if numeric {
            (Some((fmod >> 16) & 0xFFFF), Some(fmod & 0xFFFF))
        } else {
            (None, None)
        };

        Self {
            name: field.name.clone(),
            type_code: field.type_oid,
            display_size,
            internal_size,
            precision,
            scale,
            null_ok: None,
        }
    }
}

impl Exclusive<'_> {
    /// Consume the cursor's pending result.
    ///
    /// A critical condition raised while handling it wins over the outcome,
    /// closing the connection if the handling itself failed.
    pub(crate) fn fetch(&self, cursor: &mut Cursor) -> Result<Fetched> {
        cursor.clear_result();
        let Some(result) = cursor.pending.take() else {
            return Ok(Fetched::NoResult);
        };
        debug!(status = result.status_name(), "fetching result");
        cursor.status_message = result.command_tag().map(str::to_owned);

        let outcome = match result {
            QueryResult::Command { .. } => {
                cursor.rowcount = result.cmd_tuples().parse().unwrap_or(-1);
                cursor.lastoid = result.oid_value();
                Ok(Fetched::Command)
            }
            QueryResult::CopyOut { .. } => {
                cursor.rowcount = -1;
                self.copy_out(cursor).map(|_| Fetched::Copy)
            }
            QueryResult::CopyIn { .. } => {
                cursor.rowcount = -1;
                self.copy_in(cursor).map(|_| Fetched::Copy)
            }
            QueryResult::Tuples { .. } => {
                self.describe(cursor, &result);
                cursor.result = Some(result);
                Ok(Fetched::Tuples)
            }
            QueryResult::Empty => Err(Error::programming("can't execute an empty query")),
            QueryResult::Error(_) => Err(self.locked(|s| s.raise(Some(&result)))),
        };

        let failed = outcome.is_err();
        let critical = self.locked(|s| {
            s.harvest();
            s.resolve_critical(failed)
        });
        match critical {
            Some(err) => Err(err),
            None => outcome,
        }
    }

    /// Build column descriptors and per-column converters for a row set.
    fn describe(&self, cursor: &mut Cursor, result: &QueryResult) {
        let QueryResult::Tuples {
            fields,
            rows,
            binary,
            ..
        } = result
        else {
            return;
        };
        cursor.rowcount = rows.len() as i64;

        let conn = self.connection();
        let scan_sizes = conn.config.display_size && !rows.is_empty();
        let conn_casts = conn.casts.read();

        let mut description = Vec::with_capacity(fields.len());
        let mut casts: SmallVec<[Converter; 16]> = SmallVec::with_capacity(fields.len());
        for (i, field) in fields.iter().enumerate() {
            let mut cast = resolve_cast(
                field.type_oid,
                &[Some(&cursor.string_types), Some(&*conn_casts)],
            );
            if *binary && is_binary_default(&cast) {
                cast = Converter::clone(&DEFAULT_CAST);
            }
            casts.push(cast);

            let display_size = scan_sizes.then(|| {
                rows.iter()
                    .map(|row| {
                        row.get(i)
                            .and_then(Option::as_ref)
                            .map_or(0, |v| v.len() as i32)
                    })
                    .max()
                    .unwrap_or(0)
            });
            description.push(ColumnDescriptor::from_field(field, display_size));
        }

        cursor.description = Some(description);
        cursor.casts = casts;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::protocol::Format;
    use pretty_assertions::assert_eq;

    fn field(name: &str, oid: Oid, size: i16, modifier: i32) -> FieldDescription {
        FieldDescription {
            name: name.to_string(),
            table_oid: 0,
            column_attr: 0,
            type_oid: oid,
            type_size: size,
            type_modifier: modifier,
            format: Format::Text,
        }
    }

    #[test]
    fn test_numeric_precision_and_scale() {
        // numeric(10, 2)
        let modifier = ((10 << 16) | 2) + VARHDRSZ;
        let col = ColumnDescriptor::from_field(&field("price", Oid::NUMERIC, -1, modifier), None);
        assert_eq!(col.precision, Some(10));
        assert_eq!(col.scale, Some(2));
        assert_eq!(col.internal_size, 10);
        assert_eq!(col.null_ok, None);
    }

    #[test]
    fn test_varchar_internal_size() {
        let col = ColumnDescriptor::from_field(
            &field("name", Oid::VARCHAR, -1, 32 + VARHDRSZ),
            Some(7),
        );
        assert_eq!(col.internal_size, 32);
        assert_eq!(col.display_size, Some(7));
        assert_eq!(col.precision, None);
    }

    #[test]
    fn test_fixed_size_and_unset_modifier() {
        let col = ColumnDescriptor::from_field(&field("id", Oid::INT4, 4, -1), None);
        assert_eq!(col.internal_size, 4);

        let col = ColumnDescriptor::from_field(&field("n", Oid::NUMERIC, -1, -1), None);
        assert_eq!(col.internal_size, 0xFFFF);
        assert_eq!(col.precision, Some(0xFFFF));
        assert_eq!(col.scale, Some(0xFFFF));
    }
}
