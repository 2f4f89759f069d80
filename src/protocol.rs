//! PostgreSQL wire protocol frames understood by the emulator.
//!
//! Only the subset needed to script a Simple Query session is implemented:
//! the startup handshake, `Query`, the row-returning replies, error
//! responses and `Terminate`. Both directions are encoded and decoded so the
//! same types serve the emulator and the raw test client.
//!
//! ## Architecture
//!
//! ```text
//! +----------+                           +----------+
//! |  Client  |  --- FrontendMessage -->  | Emulator |
//! |          |  <-- BackendMessage  ---  | (script) |
//! +----------+                           +----------+
//!        ^                                     ^
//!        |  ClientCodec           ServerCodec  |
//!        +-------------------------------------+
//! ```
//!
//! ## Terminology
//!
//! - **FrontendMessage**: Messages from client to server (Startup, Query, Terminate)
//! - **BackendMessage**: Messages from server to client (RowDescription, DataRow, etc.)
//! - **Codec**: Framing and serialization for the wire protocol

/// Ensures that the buffer has at least `n` bytes remaining.
/// Returns `ProtocolError::InvalidMessage` if not enough bytes are available.
macro_rules! ensure_remaining {
    ($buf:expr, $n:expr) => {
        if $buf.len() < $n {
            return Err($crate::protocol::ProtocolError::InvalidMessage);
        }
    };
}

pub mod backend;
pub mod codec;
pub mod error;
pub mod frontend;
pub mod types;

pub use backend::{BackendMessage, ErrorField, FieldDescription, TransactionStatus};
pub use codec::{ClientCodec, DEFAULT_MAX_MESSAGE_SIZE, ServerCodec};
pub use error::ProtocolError;
pub use frontend::{FrontendMessage, PROTOCOL_VERSION, StartupMessage};
pub use types::{ErrorFieldCode, FormatCode, type_oid};
