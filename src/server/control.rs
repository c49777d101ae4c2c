//! Administrative command stream.
//!
//! Reads whitespace-separated commands line by line (stdin in the binary)
//! and writes free-text diagnostics (stderr in the binary). Bad input is
//! reported and otherwise ignored; only `exit` or the end of input stops it.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use super::SessionCounter;
use crate::broker::{BrokerHandle, Purge};
use crate::error::{Error, Result};
use crate::logging::TraceSwitch;

const HELP: &str = "commands: exit | purge [n] | echo <text> | count | stats | debug [on|off] | help";

/// A parsed control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Shut the broker down.
    Exit,
    /// Remove the oldest items.
    Purge(Purge),
    /// Print the text back.
    Echo(String),
    /// Report the number of stored items.
    Count,
    /// Report queue, waiter and session counters.
    Stats,
    /// Turn verbose tracing on or off.
    Debug(bool),
    /// List commands.
    Help,
}

impl ControlCommand {
    /// Parse one control line. Blank lines yield `None`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Admin`] for unknown commands or bad arguments.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim_end_matches(['\r', '\n']);
        let trimmed = line.trim_start();
        let Some(word) = trimmed.split_whitespace().next() else {
            return Ok(None);
        };
        let rest = trimmed[word.len()..].trim_start();
        let args: Vec<&str> = rest.split_whitespace().collect();

        let command = match (word.to_ascii_lowercase().as_str(), args.as_slice()) {
            ("exit", []) => Self::Exit,
            ("purge", []) => Self::Purge(Purge::All),
            ("purge", [n]) => {
                let n = n.parse::<u64>().map_err(|_| {
                    Error::admin(format!("purge expects a non-negative integer, got {n:?}"))
                })?;
                Self::Purge(Purge::Oldest(n))
            },
            ("echo", _) => Self::Echo(rest.to_string()),
            ("count", []) => Self::Count,
            ("stats", []) => Self::Stats,
            ("debug", []) => Self::Debug(true),
            ("debug", [flag]) => match flag.to_ascii_lowercase().as_str() {
                "on" => Self::Debug(true),
                "off" => Self::Debug(false),
                _ => return Err(Error::admin(format!("debug expects on|off, got {flag:?}"))),
            },
            ("help", []) => Self::Help,
            ("exit" | "purge" | "count" | "stats" | "debug" | "help", _) => {
                return Err(Error::admin(format!("wrong arguments for {word:?}; {HELP}")));
            },
            _ => return Err(Error::admin(format!("unknown command {word:?}; {HELP}"))),
        };
        Ok(Some(command))
    }
}

/// Why the control channel stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlExit {
    /// An explicit `exit` command.
    Exit,
    /// The control input reached end of file.
    InputClosed,
}

/// The administrative command loop.
pub struct ControlChannel<R, W> {
    input: R,
    output: W,
    broker: BrokerHandle,
    trace: Arc<dyn TraceSwitch>,
    sessions: SessionCounter,
}

impl<R, W> ControlChannel<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Create a control channel over the given streams.
    pub fn new(
        input: R,
        output: W,
        broker: BrokerHandle,
        trace: Arc<dyn TraceSwitch>,
        sessions: SessionCounter,
    ) -> Self {
        Self {
            input,
            output,
            broker,
            trace,
            sessions,
        }
    }

    /// Process commands until `exit` or end of input.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BrokerGone`] if the broker stopped, or an IO error if
    /// the control streams fail.
    pub async fn run(mut self) -> Result<ControlExit> {
        let mut raw = Vec::new();
        loop {
            raw.clear();
            let read = self
                .input
                .read_until(b'\n', &mut raw)
                .await
                .map_err(|e| Error::io("reading control input", e))?;
            if read == 0 {
                self.say("control input closed, shutting down").await?;
                return Ok(ControlExit::InputClosed);
            }

            let parsed = match std::str::from_utf8(&raw) {
                Ok(line) => ControlCommand::parse(line),
                Err(_) => Err(Error::admin("control input is not valid UTF-8")),
            };
            match parsed {
                Ok(None) => {},
                Ok(Some(ControlCommand::Exit)) => {
                    self.say("exiting").await?;
                    return Ok(ControlExit::Exit);
                },
                Ok(Some(command)) => self.execute(command).await?,
                Err(e) => {
                    tracing::debug!(error = %e, "Rejected control command");
                    self.say(&format!("error: {e}")).await?;
                },
            }
        }
    }

    async fn execute(&mut self, command: ControlCommand) -> Result<()> {
        match command {
            ControlCommand::Exit => Ok(()),
            ControlCommand::Purge(n) => {
                let removed = self.broker.purge(n).await?;
                tracing::info!(?n, removed, "Purged queue");
                self.say(&format!("purged {removed} item(s)")).await
            },
            ControlCommand::Echo(text) => self.say(&text).await,
            ControlCommand::Count => {
                let count = self.broker.count().await?;
                self.say(&count.to_string()).await
            },
            ControlCommand::Stats => {
                let stats = self.broker.stats().await?;
                let message = format!(
                    "count={} waiters={} wait_slots={} sessions={}",
                    stats.count,
                    stats.waiters,
                    stats.wait_slots,
                    self.sessions.current()
                );
                self.say(&message).await
            },
            ControlCommand::Debug(on) => {
                let state = if on { "on" } else { "off" };
                if self.trace.is_verbose() == on {
                    return self.say(&format!("debug already {state} (no change)")).await;
                }
                match self.trace.set_verbose(on) {
                    Ok(()) => self.say(&format!("debug {state}")).await,
                    Err(e) => self.say(&format!("error: {e}")).await,
                }
            },
            ControlCommand::Help => self.say(HELP).await,
        }
    }

    async fn say(&mut self, message: &str) -> Result<()> {
        let write = async {
            self.output.write_all(message.as_bytes()).await?;
            self.output.write_all(b"\n").await?;
            self.output.flush().await
        };
        write.await.map_err(|e| Error::io("writing control output", e))
    }
}
