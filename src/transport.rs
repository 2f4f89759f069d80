//! In-memory listener handing out full-duplex connections.
//!
//! Each `dial` creates a `tokio::io::duplex` pair, keeps the client half and
//! queues the server half for `accept`. No sockets or ports are involved.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Default capacity of each direction of a connection (1 MB).
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// A byte stream a client can speak the wire protocol over.
pub trait Socket: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Socket for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Listener side of the in-memory transport. Clones share the same queue.
#[derive(Debug, Clone)]
pub struct Listener {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    buffer_size: usize,
    incoming_tx: mpsc::UnboundedSender<DuplexStream>,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    closed: CancellationToken,
}

/// Opens a listener whose connections buffer up to `buffer_size` bytes per direction.
pub fn listen(buffer_size: usize) -> Listener {
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    Listener {
        shared: Arc::new(Shared {
            buffer_size,
            incoming_tx,
            incoming_rx: Mutex::new(incoming_rx),
            closed: CancellationToken::new(),
        }),
    }
}

impl Listener {
    /// Waits for the next dialed connection.
    ///
    /// Fails once the listener is closed. Only one `accept` may be pending at
    /// a time; a concurrent call fails immediately.
    pub async fn accept(&self) -> io::Result<DuplexStream> {
        let Ok(mut incoming) = self.shared.incoming_rx.try_lock() else {
            return Err(io::Error::other("concurrent accept on in-memory listener"));
        };

        tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => Err(closed()),
            conn = incoming.recv() => conn.ok_or_else(closed),
        }
    }

    /// Opens a new connection and returns its client half.
    pub fn dial(&self) -> io::Result<DuplexStream> {
        if self.is_closed() {
            return Err(refused());
        }
        let (client, server) = tokio::io::duplex(self.shared.buffer_size);
        self.shared.incoming_tx.send(server).map_err(|_| refused())?;
        Ok(client)
    }

    /// Closes the listener, failing any pending `accept`.
    /// Established connections are unaffected.
    pub fn close(&self) {
        self.shared.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "in-memory listener closed")
}

fn refused() -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionRefused,
        "in-memory listener closed",
    )
}
