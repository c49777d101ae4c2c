//! Async client for the jsonq line protocol.
//!
//! One [`QueueClient`] wraps one connection. Requests are written in order and
//! each call reads the single response line it expects, so a client must not
//! be shared between tasks; open one per task instead.
//!
//! ```rust,no_run
//! use jsonq::client::QueueClient;
//! use jsonq::protocol::Item;
//! use jsonq::server::Endpoint;
//!
//! # async fn demo() -> jsonq::Result<()> {
//! let endpoint = Endpoint::Tcp("127.0.0.1:8765".parse().unwrap());
//! let mut client = QueueClient::connect(&endpoint).await?;
//! client.push(&Item::parse(r#"["spam", 1]"#)?).await?;
//! let item = client.pop().await?;
//! assert_eq!(item.as_str(), r#"["spam",1]"#);
//! # Ok(())
//! # }
//! ```

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::error::{Error, Result};
use crate::protocol::{Command, Item, MESSAGE_TERMINATOR, Response};
use crate::server::Endpoint;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A connection to a jsonq broker.
pub struct QueueClient {
    reader: BufReader<BoxedReader>,
    writer: BoxedWriter,
    line: String,
}

impl QueueClient {
    /// Connect to a broker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the connection cannot be established.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        tracing::debug!(%endpoint, "Connecting");
        match endpoint {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|e| Error::io(format!("connecting to {endpoint}"), e))?;
                let _ = stream.set_nodelay(true);
                Ok(Self::from_stream(stream))
            },
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .map_err(|e| Error::io(format!("connecting to {endpoint}"), e))?;
                Ok(Self::from_stream(stream))
            },
        }
    }

    /// Speak the protocol over an already connected stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(Box::new(read)),
            writer: Box::new(write),
            line: String::new(),
        }
    }

    /// Push an item and wait for the acknowledgment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the broker rejected the item and
    /// [`Error::Io`] if the connection failed.
    pub async fn push(&mut self, item: &Item) -> Result<()> {
        self.send(&Command::Push(item.clone())).await?;
        match self.read_response().await?.as_str() {
            "ok" => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Push an item without waiting for anything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the request could not be written.
    pub async fn push_no_ack(&mut self, item: &Item) -> Result<()> {
        self.send(&Command::PushNoAck(item.clone())).await
    }

    /// Pop the oldest item, waiting until one is available.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on an error response and [`Error::Io`] if
    /// the connection failed.
    pub async fn pop(&mut self) -> Result<Item> {
        self.send(&Command::Pop).await?;
        let line = self.read_response().await?;
        Item::parse(&line)
    }

    /// Number of items stored in the broker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on an unexpected response and
    /// [`Error::Io`] if the connection failed.
    pub async fn count(&mut self) -> Result<u64> {
        self.send(&Command::Count).await?;
        let line = self.read_response().await?;
        line.parse().map_err(|_| unexpected(&line))
    }

    /// Write a raw request line. A missing terminator is added.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the request could not be written.
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        let mut buf = line.to_string();
        if !buf.ends_with(MESSAGE_TERMINATOR) {
            buf.push(MESSAGE_TERMINATOR);
        }
        self.write(buf.as_bytes()).await
    }

    /// Read one response line, turning `error "..."` into [`Error::Protocol`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for an error response and [`Error::Io`]
    /// if the connection failed or closed.
    pub async fn read_response(&mut self) -> Result<String> {
        self.line.clear();
        let read = self
            .reader
            .read_line(&mut self.line)
            .await
            .map_err(|e| Error::io("reading response", e))?;
        if read == 0 || !self.line.ends_with(MESSAGE_TERMINATOR) {
            return Err(Error::io(
                "reading response",
                io::Error::new(io::ErrorKind::UnexpectedEof, "broker closed the connection"),
            ));
        }

        let line = self.line.trim_end_matches(['\r', '\n']);
        if let Some(message) = Response::decode_error(line) {
            return Err(Error::Protocol(message));
        }
        Ok(line.to_string())
    }

    async fn send(&mut self, command: &Command) -> Result<()> {
        tracing::trace!(?command, "Sending");
        self.write(command.encode().as_bytes()).await
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let write = async {
            self.writer.write_all(bytes).await?;
            self.writer.flush().await
        };
        write.await.map_err(|e| Error::io("writing request", e))
    }
}

fn unexpected(line: &str) -> Error {
    Error::protocol(format!("unexpected response {line:?}"))
}
