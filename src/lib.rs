//! jsonq: a durable JSON message queue broker.
//!
//! Clients push JSON items onto a single FIFO queue over a line protocol and
//! other clients pop them, blocking until an item is available. Items live in
//! SQLite, so they survive restarts; an operator drives purges, diagnostics
//! and shutdown through a separate control channel.
//!
//! - [`broker`] - queue store, wait list and the task that owns them
//! - [`protocol`] - request grammar and response encoding
//! - [`server`] - sessions, control channel and the connection dispatcher
//! - [`client`] - async client for the line protocol
//! - [`config`] - TOML configuration and validation
//! - [`logging`] - tracing setup and the runtime verbosity switch

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod server;

pub use error::{Error, Result};
