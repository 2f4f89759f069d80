//! Connection configuration hook for `tokio-postgres` clients.
//!
//! [`ClientConfig`] is the value a [`MockSession`](crate::MockSession)
//! intercepts: a regular `tokio_postgres::Config` plus an optional custom
//! dialer and the preferred query protocol.

use std::fmt;
use std::future::Future;
use std::io;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_postgres::config::SslMode;
use tokio_postgres::{NoTls, SimpleQueryMessage};
use tracing::{debug, warn};

use crate::transport::Socket;

/// Opens the byte stream a client connects over, replacing the TCP dialer.
pub type Dialer = Arc<dyn Fn() -> BoxFuture<'static, io::Result<Box<dyn Socket>>> + Send + Sync>;

/// Errors returned while connecting a client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("dial failed: {0}")]
    Dial(#[source] io::Error),
    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),
}

/// Query protocol a [`Client`] uses for [`Client::query_text`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryMode {
    /// Parse/Bind/Execute round trips
    #[default]
    Extended,
    /// One `Query` message per statement
    Simple,
}

/// Client connection configuration.
#[derive(Clone)]
pub struct ClientConfig {
    pub postgres: tokio_postgres::Config,
    pub query_mode: QueryMode,
    dialer: Option<Dialer>,
}

impl ClientConfig {
    pub fn new(postgres: tokio_postgres::Config) -> Self {
        Self {
            postgres,
            query_mode: QueryMode::default(),
            dialer: None,
        }
    }

    /// Connects through `dial` instead of the configured hosts.
    pub fn set_dialer<F, Fut, S>(&mut self, dial: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<S>> + Send + 'static,
        S: Socket,
    {
        let dialer: Dialer = Arc::new(move || {
            let conn = dial();
            async move { Ok::<_, io::Error>(Box::new(conn.await?) as Box<dyn Socket>) }.boxed()
        });
        self.dialer = Some(dialer);
        self
    }

    pub fn has_dialer(&self) -> bool {
        self.dialer.is_some()
    }

    pub fn tls_disabled(&self) -> bool {
        matches!(self.postgres.get_ssl_mode(), SslMode::Disable)
    }

    /// Connects and spawns the task driving the connection.
    ///
    /// Uses the custom dialer when one is installed, otherwise plain TCP to
    /// the configured hosts. TLS is never negotiated.
    pub async fn connect(&self) -> Result<Client, ClientError> {
        let (client, connection) = match &self.dialer {
            Some(dial) => {
                let socket = dial().await.map_err(ClientError::Dial)?;
                let (client, connection) = self.postgres.connect_raw(socket, NoTls).await?;
                (client, spawn_connection(connection))
            }
            None => {
                let (client, connection) = self.postgres.connect(NoTls).await?;
                (client, spawn_connection(connection))
            }
        };
        debug!(mode = ?self.query_mode, "client connected");

        Ok(Client {
            inner: client,
            connection,
            query_mode: self.query_mode,
        })
    }
}

impl FromStr for ClientConfig {
    type Err = tokio_postgres::Error;

    /// Parses a libpq-style connection string or URL.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self::new)
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("postgres", &self.postgres)
            .field("query_mode", &self.query_mode)
            .field("dialer", &self.dialer.as_ref().map(|_| "custom"))
            .finish()
    }
}

fn spawn_connection<F>(connection: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), tokio_postgres::Error>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "connection closed with error");
        }
    })
}

/// A connected `tokio_postgres::Client` and the task driving its connection.
///
/// Derefs to the inner client, whose `query`, `execute` and `prepare` always
/// use the extended protocol regardless of [`QueryMode`]. Only
/// [`Client::query_text`] and `simple_query` follow an intercepted session's
/// simple protocol.
pub struct Client {
    inner: tokio_postgres::Client,
    connection: JoinHandle<()>,
    query_mode: QueryMode,
}

impl Client {
    pub fn query_mode(&self) -> QueryMode {
        self.query_mode
    }

    /// Runs `sql` with the configured protocol and returns every column of
    /// every row as text.
    ///
    /// In extended mode every column must be a text-compatible type
    /// (`text`, `varchar`, ...); any other column fails with a conversion
    /// error. A mock session only speaks the simple protocol, so an
    /// extended-mode query fails both the query and the session.
    pub async fn query_text(
        &self,
        sql: &str,
    ) -> Result<Vec<Vec<Option<String>>>, tokio_postgres::Error> {
        match self.query_mode {
            QueryMode::Simple => {
                let messages = self.inner.simple_query(sql).await?;
                Ok(messages
                    .iter()
                    .filter_map(|message| match message {
                        SimpleQueryMessage::Row(row) => Some(
                            (0..row.len())
                                .map(|i| row.get(i).map(str::to_string))
                                .collect(),
                        ),
                        _ => None,
                    })
                    .collect())
            }
            QueryMode::Extended => {
                let rows = self.inner.query(sql, &[]).await?;
                rows.iter()
                    .map(|row| {
                        (0..row.len())
                            .map(|i| row.try_get::<_, Option<String>>(i))
                            .collect::<Result<Vec<_>, _>>()
                    })
                    .collect()
            }
        }
    }

    /// Closes the connection, waiting until Terminate has been sent.
    pub async fn close(self) {
        drop(self.inner);
        if let Err(e) = self.connection.await {
            warn!(error = %e, "connection task failed");
        }
    }
}

impl Deref for Client {
    type Target = tokio_postgres::Client;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
