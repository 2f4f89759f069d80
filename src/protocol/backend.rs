use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::codec::{get_cstring, get_nullable_bytes, put_cstring, put_frame};
use crate::protocol::{ErrorFieldCode, FormatCode, ProtocolError};

/// Messages sent by the backend (server) to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    /// 'R' - Authentication response (AuthenticationOk)
    AuthenticationOk,
    /// 'K' - Backend key data for cancel requests
    BackendKeyData { process_id: i32, secret_key: i32 },
    /// 'S' - Parameter status notification
    ParameterStatus { name: String, value: String },
    /// 'Z' - Ready for query
    ReadyForQuery { status: TransactionStatus },
    /// 'T' - Row description
    RowDescription { fields: Vec<FieldDescription> },
    /// 'D' - Data row; `None` is SQL NULL
    DataRow { values: Vec<Option<Bytes>> },
    /// 'C' - Command complete
    CommandComplete { tag: String },
    /// 'E' - Error response
    ErrorResponse { fields: Vec<ErrorField> },
}

impl BackendMessage {
    /// Creates an ErrorResponse with severity ERROR.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        BackendMessage::ErrorResponse {
            fields: vec![
                ErrorField::new(ErrorFieldCode::Severity, "ERROR"),
                ErrorField::new(ErrorFieldCode::SeverityNonLocalized, "ERROR"),
                ErrorField::new(ErrorFieldCode::SqlState, code),
                ErrorField::new(ErrorFieldCode::Message, message),
            ],
        }
    }

    /// Name of the frame kind, as used in the protocol documentation.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendMessage::AuthenticationOk => "AuthenticationOk",
            BackendMessage::BackendKeyData { .. } => "BackendKeyData",
            BackendMessage::ParameterStatus { .. } => "ParameterStatus",
            BackendMessage::ReadyForQuery { .. } => "ReadyForQuery",
            BackendMessage::RowDescription { .. } => "RowDescription",
            BackendMessage::DataRow { .. } => "DataRow",
            BackendMessage::CommandComplete { .. } => "CommandComplete",
            BackendMessage::ErrorResponse { .. } => "ErrorResponse",
        }
    }

    /// Looks up a field of an ErrorResponse.
    pub fn error_field(&self, code: ErrorFieldCode) -> Option<&str> {
        match self {
            BackendMessage::ErrorResponse { fields } => fields
                .iter()
                .find(|f| f.code == code.as_u8())
                .map(|f| f.value.as_str()),
            _ => None,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            BackendMessage::AuthenticationOk => put_frame(dst, Some(b'R'), |dst| {
                dst.put_i32(0); // auth type 0 = Ok
            }),
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => put_frame(dst, Some(b'K'), |dst| {
                dst.put_i32(*process_id);
                dst.put_i32(*secret_key);
            }),
            BackendMessage::ParameterStatus { name, value } => {
                put_frame(dst, Some(b'S'), |dst| {
                    put_cstring(dst, name);
                    put_cstring(dst, value);
                })
            }
            BackendMessage::ReadyForQuery { status } => put_frame(dst, Some(b'Z'), |dst| {
                dst.put_u8(status.as_byte());
            }),
            BackendMessage::RowDescription { fields } => put_frame(dst, Some(b'T'), |dst| {
                dst.put_i16(fields.len() as i16);
                for field in fields {
                    put_cstring(dst, &field.name);
                    dst.put_i32(field.table_oid);
                    dst.put_i16(field.column_id);
                    dst.put_i32(field.type_oid);
                    dst.put_i16(field.type_size);
                    dst.put_i32(field.type_modifier);
                    dst.put_i16(field.format.as_i16());
                }
            }),
            BackendMessage::DataRow { values } => put_frame(dst, Some(b'D'), |dst| {
                dst.put_i16(values.len() as i16);
                for value in values {
                    match value {
                        Some(bytes) => {
                            dst.put_i32(bytes.len() as i32);
                            dst.put_slice(bytes);
                        }
                        None => dst.put_i32(-1),
                    }
                }
            }),
            BackendMessage::CommandComplete { tag } => put_frame(dst, Some(b'C'), |dst| {
                put_cstring(dst, tag);
            }),
            BackendMessage::ErrorResponse { fields } => put_frame(dst, Some(b'E'), |dst| {
                for field in fields {
                    dst.put_u8(field.code);
                    put_cstring(dst, &field.value);
                }
                dst.put_u8(0); // terminator
            }),
        }
    }

    /// Decodes a backend message.
    /// The buffer should contain the message body (type and length already consumed).
    pub(crate) fn decode(tag: u8, src: &mut BytesMut) -> Result<Self, ProtocolError> {
        match tag {
            b'R' => {
                ensure_remaining!(src, 4);
                match src.get_i32() {
                    0 => Ok(BackendMessage::AuthenticationOk),
                    _ => Err(ProtocolError::InvalidMessage),
                }
            }
            b'K' => {
                ensure_remaining!(src, 8);
                Ok(BackendMessage::BackendKeyData {
                    process_id: src.get_i32(),
                    secret_key: src.get_i32(),
                })
            }
            b'S' => Ok(BackendMessage::ParameterStatus {
                name: get_cstring(src)?,
                value: get_cstring(src)?,
            }),
            b'Z' => {
                ensure_remaining!(src, 1);
                let status =
                    TransactionStatus::from_byte(src.get_u8()).ok_or(ProtocolError::InvalidMessage)?;
                Ok(BackendMessage::ReadyForQuery { status })
            }
            b'T' => {
                ensure_remaining!(src, 2);
                let count = src.get_i16().max(0) as usize;
                let mut fields = Vec::with_capacity(count);
                for _ in 0..count {
                    let name = get_cstring(src)?;
                    ensure_remaining!(src, 18);
                    fields.push(FieldDescription {
                        name,
                        table_oid: src.get_i32(),
                        column_id: src.get_i16(),
                        type_oid: src.get_i32(),
                        type_size: src.get_i16(),
                        type_modifier: src.get_i32(),
                        format: FormatCode::try_from(src.get_i16())
                            .map_err(|_| ProtocolError::InvalidMessage)?,
                    });
                }
                Ok(BackendMessage::RowDescription { fields })
            }
            b'D' => {
                ensure_remaining!(src, 2);
                let count = src.get_i16().max(0) as usize;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(get_nullable_bytes(src)?);
                }
                Ok(BackendMessage::DataRow { values })
            }
            b'C' => Ok(BackendMessage::CommandComplete {
                tag: get_cstring(src)?,
            }),
            b'E' => {
                let mut fields = Vec::new();
                loop {
                    ensure_remaining!(src, 1);
                    let code = src.get_u8();
                    if code == 0 {
                        break;
                    }
                    fields.push(ErrorField {
                        code,
                        value: get_cstring(src)?,
                    });
                }
                Ok(BackendMessage::ErrorResponse { fields })
            }
            _ => Err(ProtocolError::UnknownMessageType(tag)),
        }
    }
}

/// Transaction status indicator for ReadyForQuery message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// 'I' - Idle (not in a transaction block)
    Idle,
    /// 'T' - In a transaction block
    InTransaction,
    /// 'E' - In a failed transaction block
    Failed,
}

impl TransactionStatus {
    fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'I' => Some(TransactionStatus::Idle),
            b'T' => Some(TransactionStatus::InTransaction),
            b'E' => Some(TransactionStatus::Failed),
            _ => None,
        }
    }
}

/// One column of a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    /// Attribute number of the column within `table_oid`
    pub column_id: i16,
    pub type_oid: i32,
    /// `pg_type.typlen`; negative for variable-width types
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: FormatCode,
}

/// Error/Notice field codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorField {
    pub code: u8,
    pub value: String,
}

impl ErrorField {
    pub fn new(code: ErrorFieldCode, value: impl Into<String>) -> Self {
        Self {
            code: code.as_u8(),
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(msg: &BackendMessage) -> BytesMut {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        buf
    }

    fn decode(mut buf: BytesMut) -> BackendMessage {
        let tag = buf.get_u8();
        buf.advance(4);
        BackendMessage::decode(tag, &mut buf).unwrap()
    }

    #[test]
    fn test_write_authentication_ok() {
        let buf = encode(&BackendMessage::AuthenticationOk);
        assert_eq!(buf, [b'R', 0, 0, 0, 8, 0, 0, 0, 0][..]);
    }

    #[test]
    fn test_write_ready_for_query() {
        let buf = encode(&BackendMessage::ReadyForQuery {
            status: TransactionStatus::Idle,
        });
        assert_eq!(buf, [b'Z', 0, 0, 0, 5, b'I'][..]);
    }

    #[test]
    fn test_write_backend_key_data() {
        let buf = encode(&BackendMessage::BackendKeyData {
            process_id: 0,
            secret_key: 0,
        });
        assert_eq!(buf, [b'K', 0, 0, 0, 12, 0, 0, 0, 0, 0, 0, 0, 0][..]);
    }

    #[test]
    fn test_write_parameter_status() {
        let buf = encode(&BackendMessage::ParameterStatus {
            name: "server_version".to_string(),
            value: "16.0".to_string(),
        });
        // 'S' + length(4) + "server_version\0" + "16.0\0"
        // length = 4 + 15 ("server_version\0") + 5 ("16.0\0") = 24
        assert_eq!(buf[0], b'S');
        assert_eq!(&buf[1..5], &[0, 0, 0, 24]);
        assert_eq!(&buf[5..], b"server_version\x0016.0\0");
    }

    #[test]
    fn test_write_row_description() {
        let msg = BackendMessage::RowDescription {
            fields: vec![FieldDescription {
                name: "id".to_string(),
                table_oid: 17131,
                column_id: 1,
                type_oid: 20,
                type_size: 8,
                type_modifier: -1,
                format: FormatCode::Text,
            }],
        };
        let buf = encode(&msg);
        // length = 4 + 2 (count) + 3 ("id\0") + 18 (fixed field attributes) = 27
        assert_eq!(&buf[..7], &[b'T', 0, 0, 0, 27, 0, 1]);
        assert_eq!(buf.len(), 28);
        assert_eq!(decode(buf), msg);
    }

    #[test]
    fn test_write_data_row_with_null() {
        let msg = BackendMessage::DataRow {
            values: vec![Some(Bytes::from_static(b"1")), None],
        };
        let buf = encode(&msg);
        assert_eq!(
            buf,
            [b'D', 0, 0, 0, 15, 0, 2, 0, 0, 0, 1, b'1', 0xFF, 0xFF, 0xFF, 0xFF][..]
        );
        assert_eq!(decode(buf), msg);
    }

    #[test]
    fn test_write_error_response() {
        let msg = BackendMessage::error("42P01", "relation \"x\" does not exist");
        let buf = encode(&msg);
        assert_eq!(buf[0], b'E');
        assert_eq!(buf[buf.len() - 1], 0);

        let decoded = decode(buf);
        assert_eq!(decoded.error_field(ErrorFieldCode::Severity), Some("ERROR"));
        assert_eq!(decoded.error_field(ErrorFieldCode::SqlState), Some("42P01"));
        assert_eq!(
            decoded.error_field(ErrorFieldCode::Message),
            Some("relation \"x\" does not exist")
        );
    }

    #[test]
    fn test_read_invalid_transaction_status() {
        let mut buf = BytesMut::from(&[b'?'][..]);
        assert!(matches!(
            BackendMessage::decode(b'Z', &mut buf),
            Err(ProtocolError::InvalidMessage)
        ));
    }

    #[test]
    fn test_read_truncated_row_description() {
        let mut buf = BytesMut::from(&[0, 1, b'i', b'd', 0, 0, 0][..]);
        assert!(matches!(
            BackendMessage::decode(b'T', &mut buf),
            Err(ProtocolError::InvalidMessage)
        ));
    }
}
