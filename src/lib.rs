//! Scripted PostgreSQL backend for client tests.
//!
//! A [`MockSession`] listens on an in-memory transport, intercepts a client's
//! connection configuration and replays a script of expected frontend
//! messages and canned backend replies.

pub mod client;
pub mod mapper;
pub mod protocol;
pub mod script;
pub mod session;
pub mod transport;

pub use client::{Client, ClientConfig, ClientError, QueryMode};
pub use mapper::TypeMapper;
pub use script::{Script, Step};
pub use session::{MockSession, SessionError, SessionOptions};
