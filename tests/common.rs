//! Shared harness for integration tests: a broker served on an ephemeral
//! TCP port or a temporary Unix socket.
#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use jsonq::broker::{BrokerHandle, StoreConfig};
use jsonq::client::QueueClient;
use jsonq::protocol::Item;
use jsonq::server::{Endpoint, Server, ServerConfig, SessionCounter};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub fn item(text: &str) -> Item {
    Item::parse(text).expect("valid JSON")
}

pub struct TestBrokerBuilder {
    store: StoreConfig,
    unix_socket: bool,
    max_line_bytes: Option<usize>,
    max_pending_lines: Option<usize>,
}

impl TestBrokerBuilder {
    /// Persist to `path`, committing on every mutation.
    pub fn db(mut self, path: impl Into<PathBuf>) -> Self {
        self.store = StoreConfig::file(path).with_commit_interval(Duration::ZERO);
        self
    }

    pub fn unix_socket(mut self) -> Self {
        self.unix_socket = true;
        self
    }

    pub fn max_line_bytes(mut self, n: usize) -> Self {
        self.max_line_bytes = Some(n);
        self
    }

    pub fn max_pending_lines(mut self, n: usize) -> Self {
        self.max_pending_lines = Some(n);
        self
    }

    pub async fn start(self) -> jsonq::Result<TestBroker> {
        let dir = tempfile::tempdir().map_err(|e| jsonq::Error::io("creating temp dir", e))?;
        let endpoint = if self.unix_socket {
            unix_endpoint(&dir)
        } else {
            Endpoint::Tcp("127.0.0.1:0".parse().expect("valid address"))
        };

        let mut config = ServerConfig::new(endpoint).with_store(self.store);
        if let Some(n) = self.max_line_bytes {
            config.max_line_bytes = n;
        }
        if let Some(n) = self.max_pending_lines {
            config.max_pending_lines = n;
        }

        let server = Server::start(&config).await?;
        let endpoint = server.local_endpoint()?;
        let broker = server.broker().clone();
        let sessions = server.sessions().clone();

        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = stopped.await;
        }));

        Ok(TestBroker {
            endpoint,
            broker,
            sessions,
            stop: Some(stop),
            task,
            _dir: dir,
        })
    }
}

#[cfg(unix)]
fn unix_endpoint(dir: &TempDir) -> Endpoint {
    Endpoint::Unix(dir.path().join("jsonq.sock"))
}

#[cfg(not(unix))]
fn unix_endpoint(_dir: &TempDir) -> Endpoint {
    panic!("Unix sockets are not available on this platform")
}

/// A running broker plus everything needed to talk to it.
pub struct TestBroker {
    pub endpoint: Endpoint,
    pub broker: BrokerHandle,
    pub sessions: SessionCounter,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<jsonq::Result<()>>,
    _dir: TempDir,
}

impl TestBroker {
    pub fn builder() -> TestBrokerBuilder {
        TestBrokerBuilder {
            store: StoreConfig::memory(),
            unix_socket: false,
            max_line_bytes: None,
            max_pending_lines: None,
        }
    }

    pub async fn client(&self) -> QueueClient {
        QueueClient::connect(&self.endpoint)
            .await
            .expect("Failed to connect to test broker")
    }

    /// Wait until exactly `n` live waiters are registered.
    pub async fn wait_for_waiters(&self, n: usize) {
        self.wait_until(|stats| stats.waiters == n).await;
    }

    /// Wait until `n` sessions are connected.
    pub async fn wait_for_sessions(&self, n: usize) {
        let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
        while self.sessions.current() != n {
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {n} sessions, have {}",
                self.sessions.current()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn wait_until(&self, done: impl Fn(&jsonq::broker::BrokerStats) -> bool) {
        let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
        loop {
            let stats = self.broker.stats().await.expect("broker running");
            if done(&stats) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached, last stats {stats:?}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Shut the server down and return how the broker ended.
    pub async fn stop(mut self) -> jsonq::Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(TEST_TIMEOUT, &mut self.task)
            .await
            .expect("server did not stop in time")
            .expect("server task panicked")
    }
}
