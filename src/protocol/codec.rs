use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::{BackendMessage, FrontendMessage, ProtocolError};

/// Maximum message size in bytes (16 MB).
/// PostgreSQL uses up to 1 GB, but 16 MB is plenty for scripted sessions.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Read a null-terminated string from a BytesMut buffer.
/// Returns an error if there's not enough data (no null terminator found).
/// Returns the string (without the null terminator) if successful.
///
/// This function will search for a null byte within the buffer up to a maximum
/// length to prevent unbounded memory consumption from malicious input.
pub fn get_cstring(src: &mut BytesMut) -> Result<String, ProtocolError> {
    const MAX_CSTRING_LENGTH: usize = 64 * 1024; // 64KB limit

    let Some(null_pos) = src.iter().take(MAX_CSTRING_LENGTH).position(|&b| b == 0) else {
        return Err(ProtocolError::InvalidMessage);
    };

    let bytes = src.split_to(null_pos);
    src.advance(1);
    Ok(String::from_utf8(bytes.to_vec())?)
}

/// Read a nullable byte array from a BytesMut buffer.
/// Returns None if the value is SQL NULL (length = -1).
///
/// Wire format: Int32 length (-1 for NULL, >= 0 for data), followed by data bytes if length >= 0
pub fn get_nullable_bytes(src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
    ensure_remaining!(src, 4);

    let len = src.get_i32();
    if len < 0 {
        return Ok(None);
    }

    let len = len as usize;
    ensure_remaining!(src, len);
    Ok(Some(src.split_to(len).freeze()))
}

/// Write a null-terminated string to a BytesMut buffer.
pub fn put_cstring(dst: &mut BytesMut, s: &str) {
    dst.put_slice(s.as_bytes());
    dst.put_u8(0);
}

/// Write a length-prefixed frame. The Int32 length covers itself and the body
/// but not the tag byte; the startup packet is the only untagged frame.
pub fn put_frame(dst: &mut BytesMut, tag: Option<u8>, body: impl FnOnce(&mut BytesMut)) {
    if let Some(tag) = tag {
        dst.put_u8(tag);
    }
    let start = dst.len();
    dst.put_i32(0);
    body(dst);
    let len = (dst.len() - start) as i32;
    dst[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

/// Splits one complete tagged frame off `src`.
/// Returns `Ok(None)` until the whole frame has been buffered.
fn split_tagged(
    src: &mut BytesMut,
    max_message_size: usize,
) -> Result<Option<(u8, BytesMut)>, ProtocolError> {
    // Need at least 5 bytes (type + length)
    if src.len() < 5 {
        return Ok(None);
    }

    // Peek at the length (bytes 1-4, don't consume yet)
    let len = i32::from_be_bytes([src[1], src[2], src[3], src[4]]);
    if len < 4 {
        return Err(ProtocolError::InvalidMessage);
    }
    let len = len as usize;
    if len > max_message_size {
        return Err(ProtocolError::MessageTooLarge(len));
    }

    // Total message size = 1 (type byte) + length
    if src.len() < 1 + len {
        src.reserve(1 + len - src.len());
        return Ok(None);
    }

    let mut frame = src.split_to(1 + len);
    let tag = frame.get_u8();
    frame.advance(4);
    Ok(Some((tag, frame)))
}

/// Codec for the emulator side of a connection.
/// Decodes FrontendMessage (in frontend.rs) and encodes BackendMessage (in backend.rs).
///
/// The first frame of a connection is the untagged startup packet; once a
/// StartupMessage has been decoded the codec switches to tagged frames.
/// An SSLRequest keeps the codec in the startup phase, as a real server does.
#[derive(Debug)]
pub struct ServerCodec {
    max_message_size: usize,
    startup_done: bool,
}

impl ServerCodec {
    /// Creates a new ServerCodec with the default maximum message size.
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            startup_done: false,
        }
    }

    fn decode_startup(&mut self, src: &mut BytesMut) -> Result<Option<FrontendMessage>, ProtocolError> {
        // Need at least 8 bytes (length + code)
        if src.len() < 8 {
            return Ok(None);
        }

        let len = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if len < 8 {
            return Err(ProtocolError::InvalidMessage);
        }
        let len = len as usize;
        if len > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge(len));
        }

        if src.len() < len {
            return Ok(None);
        }

        let mut body = src.split_to(len);
        body.advance(4);
        let message = FrontendMessage::decode_startup(&mut body)?;
        if matches!(message, FrontendMessage::Startup(_)) {
            self.startup_done = true;
        }
        Ok(Some(message))
    }
}

impl Default for ServerCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ServerCodec {
    type Item = FrontendMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !self.startup_done {
            return self.decode_startup(src);
        }
        match split_tagged(src, self.max_message_size)? {
            Some((tag, mut body)) => FrontendMessage::decode(tag, &mut body).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<&BackendMessage> for ServerCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &BackendMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

/// Codec for the client side of a connection, used to drive the emulator
/// frame by frame. Encodes FrontendMessage and decodes BackendMessage.
#[derive(Debug)]
pub struct ClientCodec {
    max_message_size: usize,
}

impl ClientCodec {
    /// Creates a new ClientCodec with the default maximum message size.
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Default for ClientCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ClientCodec {
    type Item = BackendMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match split_tagged(src, self.max_message_size)? {
            Some((tag, mut body)) => BackendMessage::decode(tag, &mut body).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<FrontendMessage> for ClientCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: FrontendMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{StartupMessage, TransactionStatus};

    #[test]
    fn test_get_cstring() {
        let mut buf = BytesMut::from(&b"hello\0world"[..]);
        assert_eq!(get_cstring(&mut buf).unwrap(), "hello".to_string());
        assert_eq!(buf, b"world"[..]);
    }

    #[test]
    fn test_get_cstring_incomplete() {
        let mut buf = BytesMut::from(&b"hello"[..]);
        assert!(get_cstring(&mut buf).is_err());
    }

    #[test]
    fn test_get_cstring_invalid_utf8() {
        let mut buf = BytesMut::from(&[0xFF, 0xFE, 0][..]);
        assert!(matches!(
            get_cstring(&mut buf),
            Err(ProtocolError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn test_get_nullable_bytes_null() {
        let mut buf = BytesMut::from(&[0xFF, 0xFF, 0xFF, 0xFF][..]); // -1
        assert_eq!(get_nullable_bytes(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_get_nullable_bytes_data() {
        let mut buf = BytesMut::from(&[0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o'][..]);
        assert_eq!(
            get_nullable_bytes(&mut buf).unwrap(),
            Some(Bytes::from_static(b"hello"))
        );
    }

    #[test]
    fn test_get_nullable_bytes_incomplete() {
        let mut buf = BytesMut::from(&[0, 0, 0, 10, b'h', b'i'][..]); // Says 10 bytes, only 2 available
        assert!(get_nullable_bytes(&mut buf).is_err());
    }

    #[test]
    fn test_put_cstring() {
        let mut buf = BytesMut::new();
        put_cstring(&mut buf, "test");
        assert_eq!(buf, b"test\0"[..]);
    }

    #[test]
    fn test_put_frame_patches_length() {
        let mut buf = BytesMut::new();
        put_frame(&mut buf, Some(b'C'), |dst| put_cstring(dst, "SELECT 1"));
        assert_eq!(buf, b"C\0\0\0\x0dSELECT 1\0"[..]);
    }

    #[test]
    fn test_server_codec_switches_to_tagged_after_startup() {
        let mut codec = ServerCodec::new();
        let mut buf = BytesMut::new();
        FrontendMessage::Startup(StartupMessage::new("postgres", None)).encode(&mut buf);
        FrontendMessage::Query("SELECT 1".to_string()).encode(&mut buf);

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, FrontendMessage::Startup(_)));

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second, FrontendMessage::Query("SELECT 1".to_string()));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_server_codec_waits_for_complete_frame() {
        let mut codec = ServerCodec::new();
        let mut full = BytesMut::new();
        FrontendMessage::Startup(StartupMessage::new("postgres", Some("postgres")))
            .encode(&mut full);

        let mut partial = full.split_to(10);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(full);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_server_codec_rejects_oversized_frame() {
        let mut codec = ServerCodec::with_max_message_size(64);
        let mut buf = BytesMut::new();
        buf.put_i32(1024);
        buf.put_i32(3 << 16);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::MessageTooLarge(1024))
        ));
    }

    #[test]
    fn test_server_codec_stays_in_startup_after_ssl_request() {
        let mut codec = ServerCodec::new();
        let mut buf = BytesMut::new();
        FrontendMessage::SslRequest.encode(&mut buf);
        FrontendMessage::Startup(StartupMessage::new("postgres", None)).encode(&mut buf);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(FrontendMessage::SslRequest)
        );
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(FrontendMessage::Startup(_))
        ));
    }

    #[test]
    fn test_client_codec_decodes_backend_frames() {
        let mut server = ServerCodec::new();
        let mut client = ClientCodec::new();
        let mut buf = BytesMut::new();
        server
            .encode(&BackendMessage::AuthenticationOk, &mut buf)
            .unwrap();
        server
            .encode(
                &BackendMessage::ReadyForQuery {
                    status: TransactionStatus::Idle,
                },
                &mut buf,
            )
            .unwrap();

        assert_eq!(
            client.decode(&mut buf).unwrap(),
            Some(BackendMessage::AuthenticationOk)
        );
        assert_eq!(
            client.decode(&mut buf).unwrap(),
            Some(BackendMessage::ReadyForQuery {
                status: TransactionStatus::Idle
            })
        );
        assert_eq!(client.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_client_codec_rejects_oversized_frame() {
        let mut codec = ClientCodec::with_max_message_size(16);
        let mut buf = BytesMut::new();
        BackendMessage::CommandComplete {
            tag: "SELECT 1000000".to_string(),
        }
        .encode(&mut buf);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::MessageTooLarge(19))
        ));
    }

    #[test]
    fn test_client_codec_rejects_short_length() {
        let mut codec = ClientCodec::new();
        let mut buf = BytesMut::from(&[b'Z', 0, 0, 0, 2][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::InvalidMessage)
        ));
    }
}
