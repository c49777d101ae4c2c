//! Core types for the broker.
//!
//! Contains operation outcomes and the request messages exchanged with the
//! broker task.

use tokio::sync::oneshot;

use super::store::Purge;
use super::wait_list::Ticket;
use crate::error::Result;
use crate::protocol::Item;

/// Capacity of the request channel feeding the broker task.
pub(crate) const REQUEST_CHANNEL_CAPACITY: usize = 1024;

/// Where a pushed item ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// Handed straight to a blocked consumer; never stored.
    Delivered,
    /// Appended to the durable queue.
    Stored,
}

/// Outcome of a pop.
#[derive(Debug)]
pub enum Pop {
    /// The oldest stored item.
    Ready(Item),
    /// The queue was empty; the item will arrive on `delivery`.
    ///
    /// If the consumer goes away it must cancel `ticket`.
    Waiting {
        ticket: Ticket,
        delivery: oneshot::Receiver<Item>,
    },
}

/// Point-in-time broker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BrokerStats {
    /// Items in the durable queue.
    pub count: u64,
    /// Consumers blocked on `pop`.
    pub waiters: usize,
    /// Wait list slots, tombstones included.
    pub wait_slots: usize,
}

/// Messages handled by the broker task, one at a time and in arrival order.
#[derive(Debug)]
pub(crate) enum Request {
    Push {
        item: Item,
        reply: Option<oneshot::Sender<Result<Handoff>>>,
    },
    Pop {
        reply: oneshot::Sender<Result<Pop>>,
    },
    Cancel {
        ticket: Ticket,
    },
    Count {
        reply: oneshot::Sender<Result<u64>>,
    },
    Purge {
        n: Purge,
        reply: oneshot::Sender<Result<u64>>,
    },
    Stats {
        reply: oneshot::Sender<Result<BrokerStats>>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<()>>,
    },
}
