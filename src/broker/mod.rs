//! Durable FIFO broker engine.
//!
//! Combines a SQLite-backed queue with a wait list of blocked consumers.
//! A push goes straight to the oldest blocked consumer when there is one and
//! only touches storage otherwise; a pop against an empty queue registers a
//! waiter instead of failing.
//!
//! # Examples
//!
//! ```rust
//! use jsonq::broker::{Broker, BrokerHandle, Pop, QueueStore, StoreConfig};
//! use jsonq::protocol::Item;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let store = QueueStore::open(&StoreConfig::memory())?;
//! let (broker, task) = BrokerHandle::spawn(Broker::new(store));
//!
//! // Nobody is waiting, so the item is stored.
//! broker.push(Item::parse(r#"{"job": 1}"#)?).await?;
//! assert_eq!(broker.count().await?, 1);
//!
//! match broker.pop().await? {
//!     Pop::Ready(item) => assert_eq!(item.as_str(), r#"{"job":1}"#),
//!     Pop::Waiting { .. } => unreachable!(),
//! }
//!
//! broker.shutdown().await?;
//! task.await??;
//! # Ok(())
//! # }
//! ```

mod actor;
mod service;
pub mod store;
mod types;
pub mod wait_list;

// Re-export public API
pub use actor::BrokerHandle;
pub use service::Broker;
pub use store::{Purge, QueueStore, StoreConfig};
pub use types::{BrokerStats, Handoff, Pop};
pub use wait_list::{Ticket, WaitList};

#[cfg(test)]
mod tests;
