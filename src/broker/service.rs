//! The broker: single owner of the durable queue and the wait list.

use tokio::sync::oneshot;

use super::store::{Purge, QueueStore};
use super::types::{BrokerStats, Handoff, Pop};
use super::wait_list::{Ticket, WaitList};
use crate::error::Result;
use crate::protocol::Item;

/// Matches pushes against blocked consumers and the durable queue.
///
/// Every method runs to completion without awaiting, so a caller that owns
/// the broker exclusively always observes consistent state.
#[derive(Debug)]
pub struct Broker {
    store: QueueStore,
    waiters: WaitList<oneshot::Sender<Item>>,
}

impl Broker {
    /// Create a broker over an opened store.
    pub fn new(store: QueueStore) -> Self {
        Self {
            store,
            waiters: WaitList::new(),
        }
    }

    /// Give `item` to the oldest live waiter, or store it if nobody waits.
    ///
    /// A waiter whose receiving side has already gone away is skipped, so
    /// the item is never lost to a closed connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`](crate::Error::Storage) if the item had to be
    /// stored and the write failed.
    pub fn push(&mut self, mut item: Item) -> Result<Handoff> {
        while let Some(waiter) = self.waiters.match_next() {
            match waiter.send(item) {
                Ok(()) => {
                    tracing::trace!("Handed item to waiting consumer");
                    return Ok(Handoff::Delivered);
                },
                Err(returned) => {
                    tracing::debug!("Skipped waiter whose consumer already left");
                    item = returned;
                },
            }
        }

        self.store.push(&item)?;
        Ok(Handoff::Stored)
    }

    /// Pop the oldest stored item, or register a waiter if the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`](crate::Error::Storage) if reading the queue fails.
    pub fn pop(&mut self) -> Result<Pop> {
        if !self.store.is_empty() {
            return self.store.pop().map(Pop::Ready);
        }

        let (tx, delivery) = oneshot::channel();
        let ticket = self.waiters.enqueue(tx);
        tracing::trace!(%ticket, "Registered waiter");
        Ok(Pop::Waiting { ticket, delivery })
    }

    /// Withdraw a waiter. Safe to call for tickets already matched.
    pub fn cancel(&mut self, ticket: Ticket) -> bool {
        let cancelled = self.waiters.tombstone(ticket);
        if cancelled {
            tracing::trace!(%ticket, "Cancelled waiter");
        }
        cancelled
    }

    /// Number of stored items.
    pub fn count(&self) -> u64 {
        self.store.count()
    }

    /// Remove up to `n` of the oldest stored items.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`](crate::Error::Storage) if the delete fails.
    pub fn purge(&mut self, n: Purge) -> Result<u64> {
        self.store.purge(n)
    }

    /// Current counters.
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            count: self.store.count(),
            waiters: self.waiters.live_len(),
            wait_slots: self.waiters.slots(),
        }
    }

    /// Flush and close the store. Pending waiters see their channel close.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`](crate::Error::Storage) if the final commit fails.
    pub fn close(self) -> Result<()> {
        self.store.close()
    }
}
