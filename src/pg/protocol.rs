//! PostgreSQL wire protocol message encoding and decoding.
//!
//! Only the simple-query and COPY sub-protocols of protocol 3.0 are covered;
//! startup and authentication happen before a stream is handed to the driver.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::wire::{WireError, WireResult};
use crate::typecast::Oid;

// ============================================================================
// Protocol Constants
// ============================================================================

/// Protocol generation spoken by this codec.
pub const PROTOCOL_MAJOR: u8 = 3;

/// Largest backend frame accepted, matching the server's own allocation limit.
pub const MAX_FRAME_LEN: usize = 0x3fff_ffff;

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

impl From<i16> for Format {
    fn from(code: i16) -> Self {
        if code == 0 {
            Format::Text
        } else {
            Format::Binary
        }
    }
}

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages
pub trait FrontendMessage {
    fn encode(&self) -> BytesMut;
}

fn header(tag: u8, body_len: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(5 + body_len);
    buf.put_u8(tag);
    buf.put_i32(4 + body_len as i32);
    buf
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage<'a> {
    pub query: &'a str,
}

impl FrontendMessage for QueryMessage<'_> {
    fn encode(&self) -> BytesMut {
        let mut buf = header(b'Q', self.query.len() + 1);
        buf.put_slice(self.query.as_bytes());
        buf.put_u8(0);
        buf
    }
}

/// CopyData message ('d'), one chunk of a COPY FROM STDIN stream
#[derive(Debug, Clone)]
pub struct CopyDataMessage<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for CopyDataMessage<'_> {
    fn encode(&self) -> BytesMut {
        let mut buf = header(b'd', self.data.len());
        buf.put_slice(self.data);
        buf
    }
}

/// CopyDone message ('c')
#[derive(Debug, Clone, Copy)]
pub struct CopyDoneMessage;

impl FrontendMessage for CopyDoneMessage {
    fn encode(&self) -> BytesMut {
        header(b'c', 0)
    }
}

/// CopyFail message ('f'), aborts a COPY FROM STDIN with a reason
#[derive(Debug, Clone)]
pub struct CopyFailMessage<'a> {
    pub reason: &'a str,
}

impl FrontendMessage for CopyFailMessage<'_> {
    fn encode(&self) -> BytesMut {
        let mut buf = header(b'f', self.reason.len() + 1);
        buf.put_slice(self.reason.as_bytes());
        buf.put_u8(0);
        buf
    }
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self) -> BytesMut {
        header(b'X', 0)
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Query responses
    RowDescription {
        fields: Vec<FieldDescription>,
    },
    DataRow {
        values: Vec<Option<Bytes>>,
    },
    CommandComplete {
        tag: String,
    },
    EmptyQueryResponse,

    // COPY sub-protocol
    CopyInResponse {
        format: Format,
        column_formats: Vec<Format>,
    },
    CopyOutResponse {
        format: Format,
        column_formats: Vec<Format>,
    },
    CopyData {
        data: Bytes,
    },
    CopyDone,

    // Status
    ReadyForQuery {
        status: TransactionStatus,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },

    // Errors and notices
    ErrorResponse {
        fields: HashMap<u8, String>,
    },
    NoticeResponse {
        fields: HashMap<u8, String>,
    },

    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
}

impl BackendMessage {
    /// Total frame length (tag + length field + body) of the message at the
    /// start of `buf`, if its header is complete.
    pub fn frame_len(buf: &[u8]) -> WireResult<Option<usize>> {
        if buf.len() < 5 {
            return Ok(None);
        }
        let length = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        match usize::try_from(length) {
            Ok(length) if (4..=MAX_FRAME_LEN).contains(&length) => Ok(Some(1 + length)),
            _ => Err(WireError::Protocol(format!("Invalid message length: {}", length))),
        }
    }

    /// Decode a backend message from bytes.
    ///
    /// The input buffer should start with the message type byte.
    pub fn decode(buf: &mut Bytes) -> WireResult<Self> {
        if buf.remaining() < 5 {
            return Err(WireError::Protocol("Incomplete message header".to_string()));
        }

        let msg_type = buf.get_u8();
        let len = buf.get_i32();
        if len < 4 {
            return Err(WireError::Protocol(format!("Invalid message length: {}", len)));
        }
        let len = len as usize;

        if buf.remaining() < len - 4 {
            return Err(WireError::Protocol("Incomplete message body".to_string()));
        }

        let body = buf.split_to(len - 4);

        match msg_type {
            b'T' => Self::decode_row_description(body),
            b'D' => Self::decode_data_row(body),
            b'C' => Self::decode_command_complete(body),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'G' => {
                let (format, column_formats) = decode_copy_response(body)?;
                Ok(BackendMessage::CopyInResponse {
                    format,
                    column_formats,
                })
            }
            b'H' => {
                let (format, column_formats) = decode_copy_response(body)?;
                Ok(BackendMessage::CopyOutResponse {
                    format,
                    column_formats,
                })
            }
            b'd' => Ok(BackendMessage::CopyData { data: body }),
            b'c' => Ok(BackendMessage::CopyDone),
            b'Z' => Self::decode_ready_for_query(body),
            b'E' => Ok(BackendMessage::ErrorResponse {
                fields: read_error_fields(body)?,
            }),
            b'N' => Ok(BackendMessage::NoticeResponse {
                fields: read_error_fields(body)?,
            }),
            b'S' => Self::decode_parameter_status(body),
            b'K' => Self::decode_backend_key_data(body),
            b'A' => Self::decode_notification_response(body),
            _ => Err(WireError::Protocol(format!(
                "Unknown message type: {}",
                msg_type as char
            ))),
        }
    }

    fn decode_row_description(mut body: Bytes) -> WireResult<Self> {
        let num_fields = get_i16(&mut body)? as usize;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let name = read_cstring(&mut body)?;
            if body.remaining() < 18 {
                return Err(WireError::Protocol("Truncated field description".to_string()));
            }
            let table_oid = body.get_i32();
            let column_attr = body.get_i16();
            let type_oid = Oid::from_i32(body.get_i32());
            let type_size = body.get_i16();
            let type_modifier = body.get_i32();
            let format = Format::from(body.get_i16());

            fields.push(FieldDescription {
                name,
                table_oid,
                column_attr,
                type_oid,
                type_size,
                type_modifier,
                format,
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(mut body: Bytes) -> WireResult<Self> {
        let num_cols = get_i16(&mut body)? as usize;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            if body.remaining() < 4 {
                return Err(WireError::Protocol("Truncated data row".to_string()));
            }
            let len = body.get_i32();
            if len < 0 {
                values.push(None);
            } else if body.remaining() < len as usize {
                return Err(WireError::Protocol("Truncated column value".to_string()));
            } else {
                values.push(Some(body.split_to(len as usize)));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_command_complete(mut body: Bytes) -> WireResult<Self> {
        let tag = read_cstring(&mut body)?;
        Ok(BackendMessage::CommandComplete { tag })
    }

    fn decode_ready_for_query(mut body: Bytes) -> WireResult<Self> {
        if body.remaining() < 1 {
            return Err(WireError::Protocol("Empty ReadyForQuery".to_string()));
        }
        let status = TransactionStatus::from(body.get_u8());
        Ok(BackendMessage::ReadyForQuery { status })
    }

    fn decode_parameter_status(mut body: Bytes) -> WireResult<Self> {
        let name = read_cstring(&mut body)?;
        let value = read_cstring(&mut body)?;
        Ok(BackendMessage::ParameterStatus { name, value })
    }

    fn decode_backend_key_data(mut body: Bytes) -> WireResult<Self> {
        if body.remaining() < 8 {
            return Err(WireError::Protocol("Truncated BackendKeyData".to_string()));
        }
        let process_id = body.get_i32();
        let secret_key = body.get_i32();
        Ok(BackendMessage::BackendKeyData {
            process_id,
            secret_key,
        })
    }

    fn decode_notification_response(mut body: Bytes) -> WireResult<Self> {
        if body.remaining() < 4 {
            return Err(WireError::Protocol("Truncated notification".to_string()));
        }
        let process_id = body.get_i32();
        let channel = read_cstring(&mut body)?;
        let payload = read_cstring(&mut body)?;

        Ok(BackendMessage::NotificationResponse {
            process_id,
            channel,
            payload,
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn get_i16(buf: &mut Bytes) -> WireResult<i16> {
    if buf.remaining() < 2 {
        return Err(WireError::Protocol("Truncated message".to_string()));
    }
    Ok(buf.get_i16())
}

fn decode_copy_response(mut body: Bytes) -> WireResult<(Format, Vec<Format>)> {
    if body.remaining() < 1 {
        return Err(WireError::Protocol("Truncated copy response".to_string()));
    }
    let format = Format::from(body.get_u8() as i16);
    let ncols = get_i16(&mut body)? as usize;
    let mut column_formats = Vec::with_capacity(ncols);
    for _ in 0..ncols {
        column_formats.push(Format::from(get_i16(&mut body)?));
    }
    Ok((format, column_formats))
}

/// Read a null-terminated string from the buffer.
fn read_cstring(buf: &mut Bytes) -> WireResult<String> {
    let end = match buf.iter().position(|&b| b == 0) {
        Some(end) => end,
        None => {
            return Err(WireError::Protocol(
                "Missing null terminator in string".to_string(),
            ))
        }
    };

    let s = std::str::from_utf8(&buf[..end])
        .map(|s| s.to_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(&buf[..end]).into_owned());

    buf.advance(end + 1);
    Ok(s)
}

/// Read error/notice response fields
fn read_error_fields(mut body: Bytes) -> WireResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while body.remaining() > 0 {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        let value = read_cstring(&mut body)?;
        fields.insert(field_type, value);
    }

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_message_structure() {
        let encoded = QueryMessage { query: "SELECT 1" }.encode();

        assert_eq!(encoded[0], b'Q');
        let len = i32::from_be_bytes([encoded[1], encoded[2], encoded[3], encoded[4]]);
        assert_eq!(len as usize, encoded.len() - 1);
    }

    #[test]
    fn test_copy_done_is_fixed() {
        assert_eq!(&CopyDoneMessage.encode()[..], &[b'c', 0, 0, 0, 4]);
        assert_eq!(&TerminateMessage.encode()[..], &[b'X', 0, 0, 0, 4]);
    }

    #[test]
    fn test_frame_len() {
        assert_eq!(BackendMessage::frame_len(&[b'Z', 0, 0]).unwrap(), None);
        assert_eq!(
            BackendMessage::frame_len(&[b'Z', 0, 0, 0, 5, b'I']).unwrap(),
            Some(6)
        );
    }

    #[test]
    fn test_frame_len_rejects_negative_length() {
        match BackendMessage::frame_len(&[b'Z', 0xff, 0xff, 0xff, 0xff]) {
            Err(WireError::Protocol(msg)) => assert_eq!(msg, "Invalid message length: -1"),
            other => panic!("Should reject a negative length, got {:?}", other),
        }
        assert!(BackendMessage::frame_len(&[b'Z', 0, 0, 0, 3]).is_err());
    }

    #[test]
    fn test_frame_len_rejects_oversized_length() {
        let err = BackendMessage::frame_len(&[b'D', 0x7f, 0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, WireError::Protocol(_)));
        assert_eq!(
            BackendMessage::frame_len(&[b'D', 0x3f, 0xff, 0xff, 0xff]).unwrap(),
            Some(MAX_FRAME_LEN + 1)
        );
    }
}
