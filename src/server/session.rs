//! One client conversation.
//!
//! A session reads `\n`-terminated lines, dispatches each to the broker in
//! order, and writes one response line per command (none for
//! `push_no_ack`). A `pop` against an empty queue parks the session until
//! its waiter is satisfied; lines that arrive meanwhile are buffered and
//! handled afterwards. A peer that overflows that buffer is disconnected.

use std::collections::VecDeque;
use std::io;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tokio::sync::{oneshot, watch};

use crate::broker::{BrokerHandle, Pop, Ticket};
use crate::error::{Error, Result};
use crate::protocol::{Command, Item, Response};

/// Default limit for a single request line.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Default number of lines buffered while a `pop` waits.
pub const DEFAULT_MAX_PENDING_LINES: usize = 1024;

/// Per-connection input caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_line_bytes: usize,
    pub max_pending_lines: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            max_pending_lines: DEFAULT_MAX_PENDING_LINES,
        }
    }
}

/// Where a session is in its conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accumulating input until a line terminator.
    Reading,
    /// Handling one command.
    Dispatching,
    /// Parked on the wait list.
    Waiting,
    /// Finished; the connection is being torn down.
    Closed,
}

/// What the dispatcher should do after a command.
enum Flow {
    Continue,
    Wait {
        ticket: Ticket,
        delivery: oneshot::Receiver<Item>,
    },
}

/// Protocol state for one connection.
pub struct Session<S> {
    id: u64,
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    partial: Vec<u8>,
    pending: VecDeque<Vec<u8>>,
    broker: BrokerHandle,
    shutdown: watch::Receiver<bool>,
    limits: SessionLimits,
    state: SessionState,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap an accepted connection.
    pub fn new(
        id: u64,
        stream: S,
        broker: BrokerHandle,
        shutdown: watch::Receiver<bool>,
        limits: SessionLimits,
    ) -> Self {
        let (read, writer) = tokio::io::split(stream);
        Self {
            id,
            reader: BufReader::new(read),
            writer,
            partial: Vec::new(),
            pending: VecDeque::new(),
            broker,
            shutdown,
            limits,
            state: SessionState::Reading,
        }
    }

    /// Serve the connection until the peer leaves or the broker shuts down.
    ///
    /// Connection failures end the session quietly; only a stopped broker
    /// is reported as an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BrokerGone`] if the broker task stopped mid-conversation.
    pub async fn run(mut self) -> Result<()> {
        tracing::debug!(session = self.id, "Session opened");
        let result = self.serve().await;
        self.transition(SessionState::Closed);

        match result {
            Ok(()) => Ok(()),
            Err(Error::Io { context, source }) => {
                tracing::debug!(session = self.id, %context, error = %source, "Connection failed");
                Ok(())
            },
            Err(e) => Err(e),
        }
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            let line = match self.pending.pop_front() {
                Some(line) => line,
                None => {
                    self.transition(SessionState::Reading);
                    tokio::select! {
                        _ = self.shutdown.changed() => return Ok(()),
                        line = next_line(&mut self.reader, &mut self.partial, self.limits.max_line_bytes) => {
                            match line.map_err(|e| Error::io("reading request", e))? {
                                Some(line) => line,
                                None => {
                                    tracing::debug!(session = self.id, "Peer closed connection");
                                    return Ok(());
                                },
                            }
                        },
                    }
                },
            };

            self.transition(SessionState::Dispatching);
            match self.dispatch(line).await? {
                Flow::Continue => {},
                Flow::Wait { ticket, delivery } => {
                    if !self.wait(ticket, delivery).await? {
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn dispatch(&mut self, line: Vec<u8>) -> Result<Flow> {
        let command = match String::from_utf8(line) {
            Ok(text) => Command::parse(&text),
            Err(_) => Err(Error::protocol("Message is not valid UTF-8")),
        };

        let command = match command {
            Ok(command) => command,
            Err(e) => {
                tracing::debug!(session = self.id, error = %e, "Rejected message");
                self.respond(&Response::from(&e)).await?;
                return Ok(Flow::Continue);
            },
        };

        tracing::trace!(session = self.id, ?command, "Dispatching");
        match command {
            Command::Push(item) => {
                self.broker.push(item).await?;
                self.respond(&Response::Ok).await?;
            },
            Command::PushNoAck(item) => self.broker.push_no_ack(item).await?,
            Command::Pop => match self.broker.pop().await? {
                Pop::Ready(item) => self.respond(&Response::Item(item)).await?,
                Pop::Waiting { ticket, delivery } => {
                    tracing::debug!(session = self.id, %ticket, "Waiting for an item");
                    return Ok(Flow::Wait { ticket, delivery });
                },
            },
            Command::Count => {
                let count = self.broker.count().await?;
                self.respond(&Response::Count(count)).await?;
            },
        }
        Ok(Flow::Continue)
    }

    /// Park until the waiter is satisfied. Returns `false` if the session
    /// should close instead.
    async fn wait(&mut self, ticket: Ticket, mut delivery: oneshot::Receiver<Item>) -> Result<bool> {
        self.transition(SessionState::Waiting);

        loop {
            tokio::select! {
                item = &mut delivery => {
                    // The sender only goes away without a value when the broker stops.
                    let item = item.map_err(|_| Error::BrokerGone)?;
                    tracing::debug!(session = self.id, %ticket, "Waiter satisfied");
                    self.respond(&Response::Item(item)).await?;
                    return Ok(true);
                },
                _ = self.shutdown.changed() => {
                    self.abandon(ticket, delivery).await;
                    return Ok(false);
                },
                line = next_line(&mut self.reader, &mut self.partial, self.limits.max_line_bytes) => {
                    match line {
                        Ok(Some(line)) if self.pending.len() < self.limits.max_pending_lines => {
                            self.pending.push_back(line);
                        },
                        Ok(Some(_)) => {
                            tracing::warn!(
                                session = self.id,
                                %ticket,
                                limit = self.limits.max_pending_lines,
                                "Too many lines while waiting, closing connection"
                            );
                            self.abandon(ticket, delivery).await;
                            return Ok(false);
                        },
                        Ok(None) | Err(_) => {
                            tracing::debug!(session = self.id, %ticket, "Peer left while waiting");
                            self.abandon(ticket, delivery).await;
                            return Ok(false);
                        },
                    }
                },
            }
        }
    }

    /// Withdraw from the wait list before the connection goes away.
    async fn abandon(&mut self, ticket: Ticket, mut delivery: oneshot::Receiver<Item>) {
        // Closing first makes any later handoff attempt fail back to the broker.
        delivery.close();
        self.broker.cancel(ticket).await;

        if !self.pending.is_empty() {
            tracing::debug!(
                session = self.id,
                discarded = self.pending.len(),
                "Discarding buffered commands"
            );
        }

        // An item handed over just before we closed is still ours to send.
        // If that write fails the item is lost: delivery is at-most-once and
        // the item is not returned to the queue.
        if let Ok(item) = delivery.try_recv()
            && let Err(e) = self.respond(&Response::Item(item.clone())).await
        {
            tracing::warn!(session = self.id, %item, error = %e, "Item undeliverable");
        }
    }

    async fn respond(&mut self, response: &Response) -> Result<()> {
        self.writer
            .write_all(response.encode().as_bytes())
            .await
            .map_err(|e| Error::io("writing response", e))
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            tracing::trace!(session = self.id, from = ?self.state, to = ?next, "Session state");
            self.state = next;
        }
    }
}

/// Read one `\n`-terminated line into `partial`, returning it without the
/// terminator.
///
/// Bytes of an unfinished line stay in `partial`, so the future can be
/// dropped and polled again later without losing input. Returns `None` at
/// end of input; an unterminated tail is discarded.
async fn next_line<R>(
    reader: &mut BufReader<R>,
    partial: &mut Vec<u8>,
    max_line_bytes: usize,
) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let budget = (max_line_bytes + 1).saturating_sub(partial.len()) as u64;
    let read = (&mut *reader).take(budget).read_until(b'\n', partial).await?;

    if partial.last() == Some(&b'\n') {
        let mut line = std::mem::take(partial);
        line.pop();
        return Ok(Some(line));
    }

    if partial.len() > max_line_bytes {
        partial.clear();
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("request line exceeds {max_line_bytes} bytes"),
        ));
    }

    // Inner end of input; `read` is non-zero only for an unterminated tail.
    if read > 0 {
        tracing::trace!(bytes = partial.len(), "Discarding unterminated input");
    }
    partial.clear();
    Ok(None)
}
