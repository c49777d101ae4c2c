//! Network front end for the broker.
//!
//! [`Server`] opens the store, starts the broker task and binds the listener.
//! [`Server::run_until`] then accepts clients until the supplied shutdown
//! future completes, and finishes with a final flush of the store.

pub mod control;
pub mod dispatcher;
pub mod session;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::task::JoinHandle;

use crate::broker::{Broker, BrokerHandle, QueueStore, StoreConfig};
use crate::error::{Error, Result};

pub use control::{ControlChannel, ControlCommand, ControlExit};
pub use dispatcher::{Dispatcher, Endpoint, Listener};
pub use session::{
    DEFAULT_MAX_LINE_BYTES, DEFAULT_MAX_PENDING_LINES, Session, SessionLimits, SessionState,
};

/// Number of connected sessions, shared between the dispatcher and `stats`.
#[derive(Clone, Debug, Default)]
pub struct SessionCounter(Arc<AtomicUsize>);

impl SessionCounter {
    /// Count one session until the returned guard is dropped.
    pub fn enter(&self) -> SessionGuard {
        self.0.fetch_add(1, Ordering::Relaxed);
        SessionGuard(Arc::clone(&self.0))
    }

    /// Sessions currently connected.
    pub fn current(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Keeps a session counted while alive.
#[derive(Debug)]
pub struct SessionGuard(Arc<AtomicUsize>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Everything needed to start a broker server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub endpoint: Endpoint,
    pub store: StoreConfig,
    pub max_line_bytes: usize,
    pub max_pending_lines: usize,
}

impl ServerConfig {
    /// Serve `endpoint` with an in-memory store and default limits.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            store: StoreConfig::memory(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            max_pending_lines: DEFAULT_MAX_PENDING_LINES,
        }
    }

    /// Use `store` for persistence.
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_line_bytes: self.max_line_bytes,
            max_pending_lines: self.max_pending_lines,
        }
    }
}

/// A running broker with a bound listener.
pub struct Server {
    dispatcher: Dispatcher,
    broker: BrokerHandle,
    task: JoinHandle<Result<()>>,
    sessions: SessionCounter,
}

impl Server {
    /// Open the store, start the broker task and bind the listener.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unusable session limit,
    /// [`Error::Storage`] if the store cannot be opened and [`Error::Io`] if
    /// the endpoint cannot be bound.
    pub async fn start(config: &ServerConfig) -> Result<Self> {
        if config.max_line_bytes == 0 {
            return Err(Error::Config("max_line_bytes must be at least 1".into()));
        }
        if config.max_pending_lines == 0 {
            return Err(Error::Config("max_pending_lines must be at least 1".into()));
        }

        let store = QueueStore::open(&config.store)?;
        tracing::info!(count = store.count(), db = ?config.store.path, "Opened queue store");

        let listener = match Listener::bind(&config.endpoint).await {
            Ok(listener) => listener,
            Err(e) => {
                store.close()?;
                return Err(e);
            },
        };

        let (broker, task) = BrokerHandle::spawn(Broker::new(store));
        let sessions = SessionCounter::default();
        let dispatcher =
            Dispatcher::new(listener, broker.clone(), sessions.clone(), config.session_limits());
        tracing::info!(endpoint = %dispatcher.local_endpoint()?, "Listening");

        Ok(Self {
            dispatcher,
            broker,
            task,
            sessions,
        })
    }

    /// Handle for issuing requests to the broker directly.
    pub fn broker(&self) -> &BrokerHandle {
        &self.broker
    }

    /// Counter of connected sessions.
    pub fn sessions(&self) -> &SessionCounter {
        &self.sessions
    }

    /// The endpoint actually bound.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the socket address cannot be read.
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        self.dispatcher.local_endpoint()
    }

    /// Serve clients until `shutdown` completes or the broker task stops.
    ///
    /// On the way out sessions are told to close, the store gets its final
    /// commit and a Unix socket file is removed.
    ///
    /// # Errors
    ///
    /// Returns the storage error that stopped the broker, or
    /// [`Error::BrokerGone`] if it stopped for any other reason.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Self {
            dispatcher,
            broker,
            mut task,
            sessions: _,
        } = self;

        let mut stopped = None;
        let stop = async {
            tokio::select! {
                () = shutdown => {},
                joined = &mut task => stopped = Some(joined),
            }
        };
        dispatcher.serve(stop).await;

        if let Some(joined) = stopped {
            join_broker(joined)?;
            tracing::error!("Broker task stopped unexpectedly");
            return Err(Error::BrokerGone);
        }

        let flushed = broker.shutdown().await;
        join_broker(task.await)?;
        flushed?;
        tracing::info!("Shutdown complete");
        Ok(())
    }
}

fn join_broker(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(|e| {
        tracing::error!(error = %e, "Broker task panicked");
        Error::BrokerGone
    })?
}
