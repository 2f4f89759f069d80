use std::collections::BTreeMap;
use std::time::Duration;

use crate::protocol::DEFAULT_MAX_MESSAGE_SIZE;
use crate::transport::DEFAULT_BUFFER_SIZE;

/// How long a connected client has to run through the whole script.
pub const DEFAULT_DEADLINE: Duration = Duration::from_millis(450);

/// How long the session waits for a client to connect.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Parameter statuses reported by a stock PostgreSQL 14 server.
const DEFAULT_STATUS: [(&str, &str); 12] = [
    ("application_name", ""),
    ("client_encoding", "UTF8"),
    ("DateStyle", "ISO, MDY"),
    ("default_transaction_read_only", "off"),
    ("in_hot_standby", "off"),
    ("integer_datetimes", "on"),
    ("IntervalStyle", "postgres"),
    ("is_superuser", "on"),
    ("server_encoding", "UTF8"),
    ("server_version", "14.3 (Debian 14.3-1.pgdg110+1)"),
    ("standard_conforming_strings", "on"),
    ("TimeZone", "UTC"),
];

/// Returns the default parameter statuses sent during the handshake.
pub fn default_status() -> BTreeMap<String, String> {
    DEFAULT_STATUS
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

/// Tunables of a mock session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub deadline: Duration,
    pub accept_timeout: Duration,
    /// Capacity of each direction of the in-memory connection
    pub buffer_size: usize,
    pub max_message_size: usize,
    /// Sent in BackendKeyData
    pub process_id: i32,
    pub secret_key: i32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_DEADLINE,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            process_id: 0,
            secret_key: 0,
        }
    }
}

impl SessionOptions {
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn accept_timeout(mut self, accept_timeout: Duration) -> Self {
        self.accept_timeout = accept_timeout;
        self
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn backend_key(mut self, process_id: i32, secret_key: i32) -> Self {
        self.process_id = process_id;
        self.secret_key = secret_key;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status() {
        let status = default_status();
        assert_eq!(status.len(), 12);
        assert_eq!(status["TimeZone"], "UTC");
        assert_eq!(status["application_name"], "");
        assert!(!status.contains_key("session_authorization"));
    }

    #[test]
    fn test_options_setters() {
        let options = SessionOptions::default()
            .deadline(Duration::from_millis(50))
            .backend_key(7, 42);
        assert_eq!(options.deadline, Duration::from_millis(50));
        assert_eq!(options.accept_timeout, DEFAULT_ACCEPT_TIMEOUT);
        assert_eq!((options.process_id, options.secret_key), (7, 42));
    }
}
