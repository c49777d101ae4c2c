//! The broker task and its cloneable handle.
//!
//! One task owns the [`Broker`]; sessions and the control channel talk to it
//! only through [`BrokerHandle`]. Requests are handled strictly one after
//! another, so no handler ever observes a half-applied mutation.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::service::Broker;
use super::store::Purge;
use super::types::{BrokerStats, Handoff, Pop, REQUEST_CHANNEL_CAPACITY, Request};
use super::wait_list::Ticket;
use crate::error::{Error, Result};
use crate::protocol::Item;

/// Handle for sending requests to the broker task.
#[derive(Clone, Debug)]
pub struct BrokerHandle {
    tx: mpsc::Sender<Request>,
}

impl BrokerHandle {
    /// Spawn the broker task on the current runtime.
    ///
    /// The task resolves to `Ok(())` after a clean shutdown (or once every
    /// handle is dropped) and to the storage error that stopped it otherwise.
    pub fn spawn(broker: Broker) -> (Self, JoinHandle<Result<()>>) {
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let task = tokio::spawn(run(broker, rx));
        (Self { tx }, task)
    }

    /// Push an item and wait until it is delivered or stored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BrokerGone`] if the broker task has stopped.
    pub async fn push(&self, item: Item) -> Result<Handoff> {
        self.call(|reply| Request::Push {
            item,
            reply: Some(reply),
        })
        .await
    }

    /// Queue a push without waiting for its outcome.
    ///
    /// Ordering relative to later requests from the same handle is kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BrokerGone`] if the broker task has stopped.
    pub async fn push_no_ack(&self, item: Item) -> Result<()> {
        self.send(Request::Push { item, reply: None }).await
    }

    /// Pop an item, or register as a waiter if the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BrokerGone`] if the broker task has stopped.
    pub async fn pop(&self) -> Result<Pop> {
        self.call(|reply| Request::Pop { reply }).await
    }

    /// Withdraw a waiter registered by [`BrokerHandle::pop`].
    ///
    /// Idempotent. Does nothing if the broker task has already stopped.
    pub async fn cancel(&self, ticket: Ticket) {
        let _ = self.send(Request::Cancel { ticket }).await;
    }

    /// Number of stored items.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BrokerGone`] if the broker task has stopped.
    pub async fn count(&self) -> Result<u64> {
        self.call(|reply| Request::Count { reply }).await
    }

    /// Remove up to `n` of the oldest stored items.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BrokerGone`] if the broker task has stopped.
    pub async fn purge(&self, n: Purge) -> Result<u64> {
        self.call(|reply| Request::Purge { n, reply }).await
    }

    /// Current broker counters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BrokerGone`] if the broker task has stopped.
    pub async fn stats(&self) -> Result<BrokerStats> {
        self.call(|reply| Request::Stats { reply }).await
    }

    /// Flush and close the store, then stop the broker task.
    ///
    /// Requests queued after this one are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BrokerGone`] if the task had already stopped, or the
    /// storage error from the final commit.
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| Request::Shutdown { reply }).await
    }

    async fn send(&self, request: Request) -> Result<()> {
        self.tx.send(request).await.map_err(|_| Error::BrokerGone)
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Request,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| Error::BrokerGone)?
    }
}

/// Handle requests until shutdown, the last handle is dropped, or storage fails.
async fn run(mut broker: Broker, mut rx: mpsc::Receiver<Request>) -> Result<()> {
    tracing::debug!(count = broker.count(), "Broker task started");

    while let Some(request) = rx.recv().await {
        let request = match request {
            Request::Shutdown { reply } => {
                rx.close();
                let result = broker.close();
                tracing::info!("Broker stopped");
                return match result {
                    Ok(()) => {
                        let _ = reply.send(Ok(()));
                        Ok(())
                    },
                    Err(e) => {
                        tracing::error!(error = %e, "Final commit failed");
                        let _ = reply.send(Err(Error::BrokerGone));
                        Err(e)
                    },
                };
            },
            other => other,
        };

        if let Err(e) = handle(&mut broker, request) {
            tracing::error!(error = %e, "Storage failure, stopping broker");
            return Err(e);
        }
    }

    tracing::debug!("All broker handles dropped");
    broker.close()
}

fn handle(broker: &mut Broker, request: Request) -> Result<()> {
    match request {
        Request::Push { item, reply } => match reply {
            Some(reply) => settle(reply, broker.push(item)),
            None => broker.push(item).map(drop),
        },
        Request::Pop { reply } => settle(reply, broker.pop()),
        Request::Cancel { ticket } => {
            broker.cancel(ticket);
            Ok(())
        },
        Request::Count { reply } => settle(reply, Ok(broker.count())),
        Request::Purge { n, reply } => settle(reply, broker.purge(n)),
        Request::Stats { reply } => settle(reply, Ok(broker.stats())),
        // Handled by the run loop.
        Request::Shutdown { reply } => settle(reply, Ok(())),
    }
}

/// Send `result` to the requester, keeping fatal errors for the run loop.
fn settle<T>(reply: oneshot::Sender<Result<T>>, result: Result<T>) -> Result<()> {
    match result {
        Err(e) if e.is_fatal() => {
            let _ = reply.send(Err(Error::BrokerGone));
            Err(e)
        },
        other => {
            let _ = reply.send(other);
            Ok(())
        },
    }
}
