//! Scripted mock sessions.
//!
//! A [`MockSession`] owns an in-memory listener and a script. It starts a
//! background task on construction which accepts exactly one connection and
//! replays the script against it.
//!
//! ## Lifecycle
//!
//! ```text
//! MockSession::new() --> intercept(&mut config) --> query()/reply()...
//!        |                                                |
//!        v                                                v
//!  background task: accept --> seal script --> run under deadline
//!                                                         |
//!                              close() <-- Result --------+
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! # async fn demo() {
//! use pgmock::{ClientConfig, MockSession};
//! use serde_json::json;
//!
//! let mut config: ClientConfig = "user=postgres dbname=postgres".parse().unwrap();
//! let mut mock = MockSession::new();
//! mock.intercept(&mut config)
//!     .query("SELECT 1")
//!     .reply("SELECT 1", [json!({"?column?": 1})]);
//!
//! let client = config.connect().await.unwrap();
//! client.simple_query("SELECT 1").await.unwrap();
//! client.close().await;
//!
//! mock.close().await;
//! # }
//! ```

mod config;
mod error;

pub use config::{DEFAULT_ACCEPT_TIMEOUT, DEFAULT_DEADLINE, SessionOptions, default_status};
pub use error::SessionError;

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_postgres::config::SslMode;
use tokio_util::codec::Framed;
use tracing::{info, warn};

use crate::client::{ClientConfig, QueryMode};
use crate::mapper::TypeMapper;
use crate::protocol::{
    BackendMessage, FieldDescription, FormatCode, FrontendMessage, ServerCodec, StartupMessage,
    TransactionStatus,
};
use crate::script::{Script, Step};
use crate::transport::{self, Listener};

/// Status key overridden with the connecting user.
const SESSION_AUTHORIZATION: &str = "session_authorization";

/// User sent by an intercepted client that has none configured.
const DEFAULT_USER: &str = "postgres";

/// One reply row: column name to value.
pub type Row = serde_json::Map<String, Value>;

/// Script shared with the background task. `None` once the task has taken it.
type ScriptSlot = Arc<Mutex<Option<Script>>>;

/// A scripted PostgreSQL backend for one client connection.
///
/// Builder methods panic when misused: appending steps before the handshake
/// is installed, installing it twice, or appending after the client has
/// connected. These are mistakes in the test, not runtime conditions.
pub struct MockSession {
    listener: Listener,
    status: BTreeMap<String, String>,
    mapper: TypeMapper,
    options: SessionOptions,
    script: ScriptSlot,
    handshake_installed: bool,
    handle: Option<JoinHandle<Result<(), SessionError>>>,
}

impl MockSession {
    /// Creates a session reporting the default parameter statuses.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        Self::with_status(Vec::<(String, String)>::new())
    }

    /// Creates a session whose parameter statuses are the defaults merged with `overrides`.
    pub fn with_status<K, V>(overrides: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self::with_options(overrides, SessionOptions::default())
    }

    pub fn with_options<K, V>(
        overrides: impl IntoIterator<Item = (K, V)>,
        options: SessionOptions,
    ) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut status = default_status();
        status.extend(
            overrides
                .into_iter()
                .map(|(name, value)| (name.into(), value.into())),
        );
        Self::spawn(status, options)
    }

    /// Creates a session reporting exactly `status`, without the defaults.
    ///
    /// `session_authorization` is still added by the handshake.
    pub fn with_exact_status<K, V>(status: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let status = status
            .into_iter()
            .map(|(name, value)| (name.into(), value.into()))
            .collect();
        Self::spawn(status, SessionOptions::default())
    }

    fn spawn(status: BTreeMap<String, String>, options: SessionOptions) -> Self {
        let listener = transport::listen(options.buffer_size);
        let script: ScriptSlot = Arc::new(Mutex::new(Some(Script::new())));
        let handle = tokio::spawn(serve(listener.clone(), script.clone(), options.clone()));

        Self {
            listener,
            status,
            mapper: TypeMapper::default(),
            options,
            script,
            handshake_installed: false,
            handle: Some(handle),
        }
    }

    /// Replaces the type mapper used to build reply rows.
    pub fn with_mapper(mut self, mapper: TypeMapper) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    pub fn status(&self) -> &BTreeMap<String, String> {
        &self.status
    }

    /// Points `config` at this session.
    ///
    /// Installs a dialer for the in-memory listener, disables TLS, forces the
    /// simple query protocol and installs the startup handshake for the
    /// configured user and database. Defaults the user to `postgres`.
    pub fn intercept(&mut self, config: &mut ClientConfig) -> &mut Self {
        let listener = self.listener.clone();
        config.set_dialer(move || {
            let conn = listener.dial();
            async move { conn }
        });
        config.postgres.ssl_mode(SslMode::Disable);
        config.query_mode = QueryMode::Simple;

        if config.postgres.get_user().is_none() {
            config.postgres.user(DEFAULT_USER);
        }
        let user = config
            .postgres
            .get_user()
            .unwrap_or(DEFAULT_USER)
            .to_string();
        let database = config.postgres.get_dbname().map(str::to_string);
        self.handshake(&user, database.as_deref())
    }

    /// Puts the startup handshake at the front of the script.
    ///
    /// Expects a StartupMessage for `user` (and `database`, if given), then
    /// replies with AuthenticationOk, every parameter status, BackendKeyData
    /// and ReadyForQuery.
    pub fn handshake(&mut self, user: &str, database: Option<&str>) -> &mut Self {
        assert!(
            !self.handshake_installed,
            "the startup handshake is already installed"
        );
        self.status
            .insert(SESSION_AUTHORIZATION.to_string(), user.to_string());

        let mut steps = vec![
            Step::Expect(FrontendMessage::Startup(StartupMessage::new(user, database))),
            Step::Send(BackendMessage::AuthenticationOk),
        ];
        steps.extend(self.status.iter().map(|(name, value)| {
            Step::Send(BackendMessage::ParameterStatus {
                name: name.clone(),
                value: value.clone(),
            })
        }));
        steps.push(Step::Send(BackendMessage::BackendKeyData {
            process_id: self.options.process_id,
            secret_key: self.options.secret_key,
        }));
        steps.push(Step::Send(ready_for_query()));

        self.with_script(|script| script.prepend(steps));
        self.handshake_installed = true;
        self
    }

    /// Expects a simple query with exactly this SQL text.
    pub fn query(&mut self, sql: &str) -> &mut Self {
        self.append([Step::Expect(FrontendMessage::Query(sql.to_string()))])
    }

    /// Replies with a result set followed by CommandComplete and ReadyForQuery.
    ///
    /// Column names and types come from the first row. A first-row column
    /// whose value has no wire type, or fails to encode, is dropped from the
    /// description and from every row. In later rows a missing key, a null or
    /// a value that fails to encode is sent as NULL. No RowDescription is
    /// sent when `rows` is empty.
    ///
    /// # Panics
    ///
    /// Panics if a row is not a JSON object.
    pub fn reply(&mut self, tag: &str, rows: impl IntoIterator<Item = Value>) -> &mut Self {
        let rows: Vec<Row> = rows.into_iter().map(into_row).collect();

        let mut steps = Vec::with_capacity(rows.len() + 3);
        if let Some(first) = rows.first() {
            let fields = self.describe_row(first);
            let data_rows: Vec<_> = rows
                .iter()
                .map(|row| {
                    Step::Send(BackendMessage::DataRow {
                        values: self.encode_row(&fields, row),
                    })
                })
                .collect();
            steps.push(Step::Send(BackendMessage::RowDescription { fields }));
            steps.extend(data_rows);
        }
        steps.push(Step::Send(BackendMessage::CommandComplete {
            tag: tag.to_string(),
        }));
        steps.push(Step::Send(ready_for_query()));
        self.append(steps)
    }

    /// Replies with an ERROR-severity ErrorResponse followed by ReadyForQuery.
    pub fn reply_error(&mut self, code: &str, message: &str) -> &mut Self {
        self.append([
            Step::Send(BackendMessage::error(code, message)),
            Step::Send(ready_for_query()),
        ])
    }

    /// Waits for the session to end and returns its result.
    pub async fn finish(mut self) -> Result<(), SessionError> {
        let result = match self.handle.take() {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(SessionError::Aborted(e.to_string())),
            },
            None => Err(SessionError::Aborted("session already finished".to_string())),
        };
        self.listener.close();
        result
    }

    /// Waits for the session to end.
    ///
    /// # Panics
    ///
    /// Panics with the session error if the client did not follow the script.
    pub async fn close(self) {
        if let Err(e) = self.finish().await {
            panic!("mock session failed: {e}");
        }
    }

    /// Columns of a result set, taken from its first row.
    ///
    /// The columns do not belong to a table, so the table OID and attribute
    /// number are both 0. Type sizes are those of `pg_type` (`bool` is 1).
    fn describe_row(&self, row: &Row) -> Vec<FieldDescription> {
        row.iter()
            .filter_map(|(name, value)| {
                let Some(field) = self.mapper.describe(value) else {
                    warn!(column = %name, %value, "dropping column without a wire type");
                    return None;
                };
                if let Err(e) = self.mapper.encode(value) {
                    warn!(column = %name, error = %e, "dropping column that failed to encode");
                    return None;
                }
                Some(FieldDescription {
                    name: name.clone(),
                    table_oid: 0,
                    column_id: 0,
                    type_oid: field.data_type.oid,
                    type_size: field.data_type.size,
                    type_modifier: -1,
                    format: FormatCode::Text,
                })
            })
            .collect()
    }

    fn encode_row(&self, fields: &[FieldDescription], row: &Row) -> Vec<Option<bytes::Bytes>> {
        fields
            .iter()
            .map(|field| match row.get(&field.name) {
                None | Some(Value::Null) => None,
                Some(value) => match self.mapper.encode(value) {
                    Ok(text) => Some(text),
                    Err(e) => {
                        warn!(column = %field.name, error = %e, "sending NULL for value that failed to encode");
                        None
                    }
                },
            })
            .collect()
    }

    fn append(&mut self, steps: impl IntoIterator<Item = Step>) -> &mut Self {
        assert!(
            self.handshake_installed,
            "call intercept() or handshake() before appending query steps"
        );
        self.with_script(|script| {
            for step in steps {
                script.push(step);
            }
        });
        self
    }

    fn with_script(&self, f: impl FnOnce(&mut Script)) {
        let mut slot = self.script.lock();
        let Some(script) = slot.as_mut() else {
            panic!("the client already connected; the script can no longer change");
        };
        f(script);
    }
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.listener.close();
    }
}

/// Background task: accepts one connection and runs the script against it.
async fn serve(
    listener: Listener,
    script: ScriptSlot,
    options: SessionOptions,
) -> Result<(), SessionError> {
    let result = run_session(&listener, &script, &options).await;
    match &result {
        Ok(()) => info!("mock session finished"),
        Err(e) => warn!(error = %e, "mock session failed"),
    }
    result
}

async fn run_session(
    listener: &Listener,
    script: &ScriptSlot,
    options: &SessionOptions,
) -> Result<(), SessionError> {
    let conn = match tokio::time::timeout(options.accept_timeout, listener.accept()).await {
        Ok(conn) => conn?,
        Err(_) => return Err(SessionError::NoClient(options.accept_timeout)),
    };

    let mut script = script.lock().take().unwrap_or_default();
    script.expect(FrontendMessage::Terminate);
    info!(steps = script.len(), "client connected");

    let mut framed = Framed::new(
        conn,
        ServerCodec::with_max_message_size(options.max_message_size),
    );
    match tokio::time::timeout(options.deadline, script.run(&mut framed)).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::Timeout(options.deadline)),
    }
}

fn ready_for_query() -> BackendMessage {
    BackendMessage::ReadyForQuery {
        status: TransactionStatus::Idle,
    }
}

fn into_row(value: Value) -> Row {
    match value {
        Value::Object(row) => row,
        other => panic!("reply rows must be JSON objects, got {other}"),
    }
}
