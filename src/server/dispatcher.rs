//! Listening socket and per-connection session spawning.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(unix)]
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

use super::SessionCounter;
use super::session::{Session, SessionLimits};
use crate::broker::BrokerHandle;
use crate::error::{Error, Result};

/// Pause after a failed accept so a persistent error does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Where the broker listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A TCP address.
    Tcp(SocketAddr),
    /// A Unix domain socket path.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// A bound listening socket.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

impl Listener {
    /// Bind `endpoint`.
    ///
    /// A socket file left behind by a previous run is replaced; one that
    /// still accepts connections is reported as in use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the address cannot be bound.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|e| Error::io(format!("binding {endpoint}"), e))?;
                Ok(Self::Tcp(listener))
            },
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                remove_stale_socket(path).await?;
                let listener = UnixListener::bind(path)
                    .map_err(|e| Error::io(format!("binding {endpoint}"), e))?;
                Ok(Self::Unix(listener, path.clone()))
            },
        }
    }

    /// The endpoint actually bound (resolves port 0).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the socket address cannot be read.
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        match self {
            Self::Tcp(listener) => listener
                .local_addr()
                .map(Endpoint::Tcp)
                .map_err(|e| Error::io("reading local address", e)),
            #[cfg(unix)]
            Self::Unix(_, path) => Ok(Endpoint::Unix(path.clone())),
        }
    }

    /// Accept one connection and start a session for it.
    async fn accept_into(&self, spawner: &SessionSpawner) -> std::io::Result<()> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                let id = spawner.spawn(stream);
                tracing::debug!(session = id, %peer, "Incoming connection");
            },
            #[cfg(unix)]
            Self::Unix(listener, _) => {
                let (stream, _) = listener.accept().await?;
                let id = spawner.spawn(stream);
                tracing::debug!(session = id, "Incoming connection");
            },
        }
        Ok(())
    }

    /// Remove the socket file, if this is a Unix listener.
    fn remove_socket_file(&self) {
        match self {
            Self::Tcp(_) => {},
            #[cfg(unix)]
            Self::Unix(_, path) => match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed socket file"),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove socket file");
                },
            },
        }
    }
}

#[cfg(unix)]
async fn remove_stale_socket(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if UnixStream::connect(path).await.is_ok() {
        return Err(Error::io(
            format!("binding {}", path.display()),
            std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "another process is listening on this socket",
            ),
        ));
    }
    tracing::debug!(path = %path.display(), "Removing stale socket file");
    std::fs::remove_file(path).map_err(|e| Error::io(format!("removing {}", path.display()), e))
}

/// Everything a new session needs.
struct SessionSpawner {
    broker: BrokerHandle,
    stop: watch::Receiver<bool>,
    sessions: SessionCounter,
    limits: SessionLimits,
    next_id: AtomicU64,
}

impl SessionSpawner {
    fn spawn<S>(&self, stream: S) -> u64
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        let guard = self.sessions.enter();
        let session = Session::new(
            id,
            stream,
            self.broker.clone(),
            self.stop.clone(),
            self.limits,
        );
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = session.run().await {
                tracing::debug!(session = id, error = %e, "Session ended");
            }
        });
        id
    }
}

/// Accepts connections and runs one session per connection.
pub struct Dispatcher {
    listener: Listener,
    spawner: SessionSpawner,
    stop: watch::Sender<bool>,
}

impl Dispatcher {
    /// Create a dispatcher over a bound listener.
    pub fn new(
        listener: Listener,
        broker: BrokerHandle,
        sessions: SessionCounter,
        limits: SessionLimits,
    ) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        Self {
            listener,
            spawner: SessionSpawner {
                broker,
                stop: stop_rx,
                sessions,
                limits,
                next_id: AtomicU64::new(0),
            },
            stop,
        }
    }

    /// The endpoint being served.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the socket address cannot be read.
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        self.listener.local_endpoint()
    }

    /// Accept connections until `shutdown` completes, then tell every
    /// session to close and remove the socket file.
    pub async fn serve<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = self.listener.accept_into(&self.spawner) => {
                    if let Err(e) = accepted {
                        // No connection took place.
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        self.stop.send_replace(true);
        self.listener.remove_socket_file();
        tracing::debug!(open = self.spawner.sessions.current(), "Stopped accepting connections");
    }
}
