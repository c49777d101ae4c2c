//! Line protocol: message grammar, JSON items and response encoding.
//!
//! Every message is a single `\n`-terminated line of the form
//! `<command> [<json payload>]`. Commands are case-insensitive bare words;
//! payloads are validated and re-encoded compactly before anything else
//! sees them.

use std::fmt;

use crate::error::{Error, Result};

/// Line terminator for requests and responses.
pub const MESSAGE_TERMINATOR: char = '\n';

/// An opaque JSON value in compact encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item(String);

impl Item {
    /// Validate `text` as JSON and normalize it to compact encoding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if `text` is not valid JSON.
    pub fn parse(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| Error::protocol(format!("Invalid JSON payload: {e}")))?;
        Ok(Self(value.to_string()))
    }

    /// Wrap text that was validated before it was stored.
    pub(crate) fn from_stored(json: String) -> Self {
        Self(json)
    }

    /// The compact JSON text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode into any deserializable type.
    ///
    /// # Errors
    ///
    /// Returns an error if the item does not match `T`.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.0)
    }

    /// Consume the item, returning its JSON text.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Enqueue an item and acknowledge with `ok`.
    Push(Item),
    /// Enqueue an item without acknowledgment.
    PushNoAck(Item),
    /// Dequeue the oldest item, waiting if the queue is empty.
    Pop,
    /// Report the number of queued items.
    Count,
}

impl Command {
    /// Parse one line (without its terminator).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the line does not match the grammar,
    /// the payload is not valid JSON, the command is unknown, or the payload
    /// is missing for `push` or present for `pop`/`count`.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (word, payload) = match line.find(char::is_whitespace) {
            Some(at) => (&line[..at], Some(line[at..].trim_start())),
            None => (line, None),
        };

        if word.is_empty() || !word.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::protocol(
                "Message does not match the grammar: <command> [<json payload>]",
            ));
        }

        let command = word.to_ascii_lowercase();
        let item = payload.map(Item::parse).transpose()?;

        match (command.as_str(), item) {
            ("push", Some(item)) => Ok(Self::Push(item)),
            ("push_no_ack", Some(item)) => Ok(Self::PushNoAck(item)),
            ("push" | "push_no_ack", None) => Err(Error::protocol(format!(
                "Command \"{command}\" requires a JSON payload"
            ))),
            ("pop", None) => Ok(Self::Pop),
            ("count", None) => Ok(Self::Count),
            ("pop" | "count", Some(_)) => Err(Error::protocol(format!(
                "Command \"{command}\" does not take a payload"
            ))),
            _ => Err(Error::protocol(format!("Unknown command \"{command}\""))),
        }
    }

    /// Wire form of this command, including the terminator.
    pub fn encode(&self) -> String {
        match self {
            Self::Push(item) => format!("push {item}{MESSAGE_TERMINATOR}"),
            Self::PushNoAck(item) => format!("push_no_ack {item}{MESSAGE_TERMINATOR}"),
            Self::Pop => format!("pop{MESSAGE_TERMINATOR}"),
            Self::Count => format!("count{MESSAGE_TERMINATOR}"),
        }
    }
}

/// A response line sent back to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Acknowledges a `push`.
    Ok,
    /// An item for `pop`.
    Item(Item),
    /// Result of `count`.
    Count(u64),
    /// A protocol error with a human-readable message.
    Error(String),
}

impl Response {
    /// Wire form of this response, including the terminator.
    pub fn encode(&self) -> String {
        match self {
            Self::Ok => format!("ok{MESSAGE_TERMINATOR}"),
            Self::Item(item) => format!("{item}{MESSAGE_TERMINATOR}"),
            Self::Count(n) => format!("{n}{MESSAGE_TERMINATOR}"),
            Self::Error(message) => {
                let quoted = serde_json::Value::String(message.clone());
                format!("error {quoted}{MESSAGE_TERMINATOR}")
            },
        }
    }

    /// Decode the message of an `error "<json-string>"` line.
    ///
    /// Returns `None` if `line` is not an error response.
    pub fn decode_error(line: &str) -> Option<String> {
        let quoted = line.strip_prefix("error ")?;
        serde_json::from_str::<String>(quoted.trim()).ok()
    }
}

impl From<&Error> for Response {
    fn from(err: &Error) -> Self {
        Self::Error(err.to_string())
    }
}
