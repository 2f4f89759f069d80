use std::collections::BTreeMap;
use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

use crate::protocol::ProtocolError;
use crate::protocol::codec::{get_cstring, put_cstring, put_frame};

/// Protocol version 3.0, the only version the emulator speaks.
pub const PROTOCOL_VERSION: i32 = 3 << 16; // 196608

/// SSLRequest magic number
const SSL_REQUEST_CODE: i32 = (1234 << 16) | 5679; // 80877103

/// Untagged packet that opens every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupMessage {
    pub protocol_version: i32,
    pub parameters: BTreeMap<String, String>,
}

impl StartupMessage {
    /// Startup packet for `user`, optionally naming a database.
    pub fn new(user: &str, database: Option<&str>) -> Self {
        let mut parameters = BTreeMap::new();
        parameters.insert("user".to_string(), user.to_string());
        if let Some(database) = database {
            parameters.insert("database".to_string(), database.to_string());
        }
        Self {
            protocol_version: PROTOCOL_VERSION,
            parameters,
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Returns true when `self`, used as a pattern, matches `actual`.
    ///
    /// The protocol version and every parameter named in the pattern must be
    /// equal. Parameters the pattern does not name are ignored, since clients
    /// add their own (`client_encoding`, `application_name`, ...).
    pub fn matches(&self, actual: &StartupMessage) -> bool {
        self.protocol_version == actual.protocol_version
            && self
                .parameters
                .iter()
                .all(|(name, value)| actual.parameter(name) == Some(value.as_str()))
    }

    fn decode(protocol_version: i32, src: &mut BytesMut) -> Result<Self, ProtocolError> {
        let mut parameters = BTreeMap::new();

        loop {
            if src.is_empty() {
                break;
            }

            // Empty name signals end of parameters
            let name = get_cstring(src)?;
            if name.is_empty() {
                break;
            }

            let value = get_cstring(src)?;
            parameters.insert(name, value);
        }

        if !parameters.contains_key("user") {
            return Err(ProtocolError::MissingParameter("user"));
        }

        Ok(Self {
            protocol_version,
            parameters,
        })
    }
}

/// Messages sent by the frontend (client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    /// Untagged startup packet
    Startup(StartupMessage),
    /// Untagged SSLRequest; only decoded so a TLS-negotiating client fails loudly
    SslRequest,
    /// 'Q' - Simple query
    Query(String),
    /// 'X' - Termination
    Terminate,
}

impl FrontendMessage {
    /// Name of the frame kind, as used in the protocol documentation.
    pub fn kind(&self) -> &'static str {
        match self {
            FrontendMessage::Startup(_) => "StartupMessage",
            FrontendMessage::SslRequest => "SSLRequest",
            FrontendMessage::Query(_) => "Query",
            FrontendMessage::Terminate => "Terminate",
        }
    }

    /// Returns true when `self`, used as a pattern, matches `actual`.
    pub fn matches(&self, actual: &FrontendMessage) -> bool {
        match (self, actual) {
            (FrontendMessage::Startup(pattern), FrontendMessage::Startup(actual)) => {
                pattern.matches(actual)
            }
            (pattern, actual) => pattern == actual,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            FrontendMessage::Startup(startup) => put_frame(dst, None, |dst| {
                dst.put_i32(startup.protocol_version);
                for (name, value) in &startup.parameters {
                    put_cstring(dst, name);
                    put_cstring(dst, value);
                }
                dst.put_u8(0);
            }),
            FrontendMessage::SslRequest => put_frame(dst, None, |dst| {
                dst.put_i32(SSL_REQUEST_CODE);
            }),
            FrontendMessage::Query(query) => put_frame(dst, Some(b'Q'), |dst| {
                put_cstring(dst, query);
            }),
            FrontendMessage::Terminate => put_frame(dst, Some(b'X'), |_| {}),
        }
    }

    /// Decodes an untagged startup-phase packet.
    /// The buffer should contain the packet body (length already consumed).
    pub(crate) fn decode_startup(src: &mut BytesMut) -> Result<Self, ProtocolError> {
        ensure_remaining!(src, 4);
        let code = src.get_i32();

        match code {
            SSL_REQUEST_CODE => Ok(FrontendMessage::SslRequest),
            version if (version >> 16) == 3 => {
                StartupMessage::decode(version, src).map(FrontendMessage::Startup)
            }
            _ => Err(ProtocolError::UnsupportedProtocolVersion(code)),
        }
    }

    /// Decodes a tagged query-phase message.
    /// The buffer should contain the message body (type and length already consumed).
    pub(crate) fn decode(tag: u8, src: &mut BytesMut) -> Result<Self, ProtocolError> {
        match tag {
            b'Q' => Ok(FrontendMessage::Query(get_cstring(src)?)),
            b'X' => Ok(FrontendMessage::Terminate),
            _ => Err(ProtocolError::UnknownMessageType(tag)),
        }
    }
}

impl fmt::Display for FrontendMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrontendMessage::Startup(startup) => {
                write!(
                    f,
                    "StartupMessage(version={}.{}",
                    startup.protocol_version >> 16,
                    startup.protocol_version & 0xFFFF
                )?;
                for (name, value) in &startup.parameters {
                    write!(f, ", {}={:?}", name, value)?;
                }
                write!(f, ")")
            }
            FrontendMessage::Query(query) => write!(f, "Query({:?})", query),
            other => f.write_str(other.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerCodec;
    use tokio_util::codec::Decoder;

    /// Helper to create a startup message with given code and body
    fn make_startup_message(code: i32, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        let len = 4 + 4 + body.len(); // length + code + body
        buf.put_i32(len as i32);
        buf.put_i32(code);
        buf.extend_from_slice(body);
        buf
    }

    /// Helper to decode the first message of a connection from bytes
    fn decode_startup_message(buf: &[u8]) -> Result<Option<FrontendMessage>, ProtocolError> {
        let mut codec = ServerCodec::new();
        let mut bytes = BytesMut::from(buf);
        codec.decode(&mut bytes)
    }

    /// Helper to decode a query-phase FrontendMessage from bytes
    fn decode_frontend_message(buf: &[u8]) -> Result<FrontendMessage, ProtocolError> {
        let mut bytes = BytesMut::from(buf);
        let tag = bytes.get_u8();
        bytes.advance(4);
        FrontendMessage::decode(tag, &mut bytes)
    }

    #[test]
    fn test_read_startup_message() {
        let mut body = Vec::new();
        body.extend_from_slice(b"user\0postgres\0");
        body.extend_from_slice(b"database\0testdb\0");
        body.extend_from_slice(b"client_encoding\0UTF8\0");
        body.push(0); // terminator

        let buf = make_startup_message(PROTOCOL_VERSION, &body);
        let msg = decode_startup_message(&buf).unwrap();

        let Some(FrontendMessage::Startup(startup)) = msg else {
            panic!("expected Startup message, got {msg:?}")
        };

        assert_eq!(startup.protocol_version, PROTOCOL_VERSION);
        assert_eq!(startup.parameter("user"), Some("postgres"));
        assert_eq!(startup.parameter("database"), Some("testdb"));
        assert_eq!(startup.parameter("client_encoding"), Some("UTF8"));
    }

    #[test]
    fn test_read_startup_message_missing_user() {
        let mut body = Vec::new();
        body.extend_from_slice(b"database\0testdb\0");
        body.push(0); // terminator

        let buf = make_startup_message(PROTOCOL_VERSION, &body);
        let result = decode_startup_message(&buf);

        assert!(matches!(
            result,
            Err(ProtocolError::MissingParameter("user"))
        ));
    }

    #[test]
    fn test_read_unsupported_protocol_version() {
        let buf = make_startup_message(2 << 16, b"user\0postgres\0\0");
        assert!(matches!(
            decode_startup_message(&buf),
            Err(ProtocolError::UnsupportedProtocolVersion(v)) if v == 2 << 16
        ));
    }

    #[test]
    fn test_read_ssl_request() {
        let buf = make_startup_message(SSL_REQUEST_CODE, &[]);
        let msg = decode_startup_message(&buf).unwrap();
        assert_eq!(msg, Some(FrontendMessage::SslRequest));
    }

    #[test]
    fn test_read_unknown_message_type() {
        let mut buf = Vec::new();
        buf.push(b'P'); // Parse is not supported
        buf.put_i32(4);

        let result = decode_frontend_message(&buf);
        assert!(matches!(
            result,
            Err(ProtocolError::UnknownMessageType(b'P'))
        ));
    }

    #[test]
    fn test_encode_query_message() {
        let mut buf = BytesMut::new();
        FrontendMessage::Query("SELECT 1".to_string()).encode(&mut buf);
        assert_eq!(buf, b"Q\0\0\0\x0dSELECT 1\0"[..]);

        let msg = decode_frontend_message(&buf).unwrap();
        assert_eq!(msg, FrontendMessage::Query("SELECT 1".to_string()));
    }

    #[test]
    fn test_encode_terminate_message() {
        let mut buf = BytesMut::new();
        FrontendMessage::Terminate.encode(&mut buf);
        assert_eq!(buf, [b'X', 0, 0, 0, 4][..]);
    }

    #[test]
    fn test_startup_pattern_ignores_extra_parameters() {
        let pattern = StartupMessage::new("postgres", Some("postgres"));
        let mut actual = pattern.clone();
        actual
            .parameters
            .insert("client_encoding".to_string(), "UTF8".to_string());

        assert!(pattern.matches(&actual));
        assert!(!actual.matches(&pattern));
    }

    #[test]
    fn test_startup_pattern_requires_named_parameters() {
        let pattern = StartupMessage::new("postgres", Some("postgres"));
        let actual = StartupMessage::new("postgres", Some("other"));
        assert!(!pattern.matches(&actual));
    }

    #[test]
    fn test_display_names_query_text() {
        let msg = FrontendMessage::Query("SELECT 1".to_string());
        assert_eq!(msg.to_string(), "Query(\"SELECT 1\")");
        assert_eq!(FrontendMessage::Terminate.to_string(), "Terminate");
    }
}
