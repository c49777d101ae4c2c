//! FIFO of blocked consumers with O(1) cancellation.
//!
//! Slots are kept in a ring buffer. Every enqueued waiter gets a [`Ticket`]
//! equal to its absolute position since the list was created, so the slot of
//! a ticket is `ticket - front` where `front` is the ticket of the oldest
//! slot still in the buffer. Cancelling a waiter only clears its slot; dead
//! slots are reclaimed when [`WaitList::match_next`] walks over them.

use std::collections::VecDeque;

/// Position of a waiter in the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(u64);

impl Ticket {
    /// Raw ticket number, for logging.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Waiters in arrival order. `None` slots are tombstones.
#[derive(Debug)]
pub struct WaitList<W> {
    slots: VecDeque<Option<W>>,
    front: u64,
    live: usize,
}

impl<W> Default for WaitList<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> WaitList<W> {
    /// Create an empty wait list.
    pub fn new() -> Self {
        Self {
            slots: VecDeque::new(),
            front: 0,
            live: 0,
        }
    }

    /// Append a waiter at the tail.
    pub fn enqueue(&mut self, waiter: W) -> Ticket {
        let ticket = Ticket(self.front + self.slots.len() as u64);
        self.slots.push_back(Some(waiter));
        self.live += 1;
        ticket
    }

    /// Remove and return the oldest live waiter, dropping any tombstones in
    /// front of it.
    pub fn match_next(&mut self) -> Option<W> {
        while let Some(slot) = self.slots.pop_front() {
            self.front += 1;
            if let Some(waiter) = slot {
                self.live -= 1;
                return Some(waiter);
            }
        }
        None
    }

    /// Mark the waiter holding `ticket` as dead.
    ///
    /// Returns `false` if the ticket was already matched or tombstoned.
    pub fn tombstone(&mut self, ticket: Ticket) -> bool {
        let Some(index) = ticket.0.checked_sub(self.front) else {
            return false;
        };
        let Ok(index) = usize::try_from(index) else {
            return false;
        };

        match self.slots.get_mut(index) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                self.live -= 1;
                true
            },
            _ => false,
        }
    }

    /// Number of waiters that can still be matched.
    pub fn live_len(&self) -> usize {
        self.live
    }

    /// Physical slot count, tombstones included.
    pub fn slots(&self) -> usize {
        self.slots.len()
    }

    /// Whether no live waiter remains.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_matches_in_arrival_order() {
        let mut list = WaitList::new();
        list.enqueue("c1");
        list.enqueue("c2");
        list.enqueue("c3");

        assert_eq!(list.match_next(), Some("c1"));
        assert_eq!(list.match_next(), Some("c2"));
        assert_eq!(list.match_next(), Some("c3"));
        assert_eq!(list.match_next(), None);
    }

    #[test]
    fn test_tombstone_skips_dead_waiter() {
        let mut list = WaitList::new();
        let _a = list.enqueue('a');
        let b = list.enqueue('b');
        let _c = list.enqueue('c');

        assert!(list.tombstone(b));
        assert_eq!(list.live_len(), 2);
        assert_eq!(list.slots(), 3);

        assert_eq!(list.match_next(), Some('a'));
        assert_eq!(list.match_next(), Some('c'));
        assert_eq!(list.slots(), 0);
        assert!(list.is_empty());
    }

    #[test]
    fn test_tombstone_is_idempotent() {
        let mut list = WaitList::new();
        let t = list.enqueue(1);
        assert!(list.tombstone(t));
        assert!(!list.tombstone(t));
        assert_eq!(list.live_len(), 0);
        assert_eq!(list.match_next(), None);
    }

    #[test]
    fn test_tombstone_after_match_is_noop() {
        let mut list = WaitList::new();
        let t1 = list.enqueue(1);
        let t2 = list.enqueue(2);
        assert_eq!(list.match_next(), Some(1));

        assert!(!list.tombstone(t1));
        assert_eq!(list.live_len(), 1);
        assert!(list.tombstone(t2));
    }

    #[test]
    fn test_tickets_keep_increasing_after_drain() {
        let mut list = WaitList::new();
        let t1 = list.enqueue(());
        list.match_next();
        let t2 = list.enqueue(());
        assert!(t2 > t1);
        assert!(!list.tombstone(Ticket(t2.get() + 1)));
        assert!(list.tombstone(t2));
    }

    proptest! {
        #[test]
        fn prop_live_waiters_match_in_order(cancel in proptest::collection::vec(any::<bool>(), 0..64)) {
            let mut list = WaitList::new();
            let tickets: Vec<_> = (0..cancel.len()).map(|i| list.enqueue(i)).collect();
            for (ticket, dead) in tickets.iter().zip(&cancel) {
                if *dead {
                    prop_assert!(list.tombstone(*ticket));
                }
            }

            let expected: Vec<usize> = (0..cancel.len()).filter(|i| !cancel[*i]).collect();
            prop_assert_eq!(list.live_len(), expected.len());

            let mut matched = Vec::new();
            while let Some(w) = list.match_next() {
                matched.push(w);
            }
            prop_assert_eq!(matched, expected);
            prop_assert_eq!(list.slots(), 0);
        }
    }
}
