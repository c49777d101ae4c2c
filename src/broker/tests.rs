//! Tests for the broker engine.

use super::*;
use crate::error::Error;
use crate::protocol::Item;
use anyhow::Result;
use std::time::Duration;
use tokio::time::timeout;

fn item(text: &str) -> Item {
    Item::parse(text).unwrap()
}

fn broker() -> Result<Broker> {
    Ok(Broker::new(QueueStore::open(&StoreConfig::memory())?))
}

fn expect_waiting(pop: Pop) -> (Ticket, tokio::sync::oneshot::Receiver<Item>) {
    match pop {
        Pop::Waiting { ticket, delivery } => (ticket, delivery),
        Pop::Ready(item) => panic!("expected to wait, got {item}"),
    }
}

#[test]
fn test_push_without_waiters_is_stored() -> Result<()> {
    let mut broker = broker()?;
    assert_eq!(broker.push(item("1"))?, Handoff::Stored);
    assert_eq!(broker.push(item("2"))?, Handoff::Stored);
    assert_eq!(broker.count(), 2);

    match broker.pop()? {
        Pop::Ready(popped) => assert_eq!(popped.as_str(), "1"),
        Pop::Waiting { .. } => panic!("queue was not empty"),
    }
    assert_eq!(broker.count(), 1);
    Ok(())
}

#[test]
fn test_direct_handoff_bypasses_store() -> Result<()> {
    let mut broker = broker()?;
    let (_ticket, mut delivery) = expect_waiting(broker.pop()?);

    assert_eq!(broker.push(item(r#"{"x":1}"#))?, Handoff::Delivered);
    assert_eq!(delivery.try_recv()?.as_str(), r#"{"x":1}"#);
    assert_eq!(broker.count(), 0);
    Ok(())
}

#[test]
fn test_waiters_served_in_arrival_order() -> Result<()> {
    let mut broker = broker()?;
    let (_, mut c1) = expect_waiting(broker.pop()?);
    let (_, mut c2) = expect_waiting(broker.pop()?);
    let (_, mut c3) = expect_waiting(broker.pop()?);

    broker.push(item("\"first\""))?;
    broker.push(item("\"second\""))?;
    broker.push(item("\"third\""))?;

    assert_eq!(c1.try_recv()?.as_str(), "\"first\"");
    assert_eq!(c2.try_recv()?.as_str(), "\"second\"");
    assert_eq!(c3.try_recv()?.as_str(), "\"third\"");
    assert_eq!(broker.count(), 0);
    Ok(())
}

#[test]
fn test_cancelled_waiter_does_not_receive() -> Result<()> {
    let mut broker = broker()?;
    let (ticket, delivery) = expect_waiting(broker.pop()?);
    assert!(broker.cancel(ticket));
    drop(delivery);

    assert_eq!(broker.push(item("1"))?, Handoff::Stored);
    assert_eq!(broker.count(), 1);
    assert!(!broker.cancel(ticket));
    Ok(())
}

#[test]
fn test_dropped_receiver_without_cancel_falls_through() -> Result<()> {
    let mut broker = broker()?;
    let (_, gone) = expect_waiting(broker.pop()?);
    let (_, mut alive) = expect_waiting(broker.pop()?);
    drop(gone);

    assert_eq!(broker.push(item("42"))?, Handoff::Delivered);
    assert_eq!(alive.try_recv()?.as_str(), "42");

    let (_, gone) = expect_waiting(broker.pop()?);
    drop(gone);
    assert_eq!(broker.push(item("43"))?, Handoff::Stored);
    assert_eq!(broker.count(), 1);
    Ok(())
}

#[test]
fn test_stats_track_tombstones() -> Result<()> {
    let mut broker = broker()?;
    let (t1, _d1) = expect_waiting(broker.pop()?);
    let (_t2, _d2) = expect_waiting(broker.pop()?);
    broker.cancel(t1);

    let stats = broker.stats();
    assert_eq!(stats.count, 0);
    assert_eq!(stats.waiters, 1);
    assert_eq!(stats.wait_slots, 2);
    Ok(())
}

#[tokio::test]
async fn test_handle_push_pop_count() -> Result<()> {
    let (handle, task) = BrokerHandle::spawn(broker()?);

    handle.push(item("[1]")).await?;
    handle.push_no_ack(item("[2]")).await?;
    assert_eq!(handle.count().await?, 2);

    match handle.pop().await? {
        Pop::Ready(popped) => assert_eq!(popped.as_str(), "[1]"),
        Pop::Waiting { .. } => panic!("queue was not empty"),
    }

    handle.shutdown().await?;
    task.await??;
    Ok(())
}

#[tokio::test]
async fn test_handle_waiter_resolved_by_push() -> Result<()> {
    let (handle, task) = BrokerHandle::spawn(broker()?);

    let (_ticket, delivery) = expect_waiting(handle.pop().await?);
    assert_eq!(handle.push(item("\"hello\"")).await?, Handoff::Delivered);

    let received = timeout(Duration::from_millis(500), delivery).await??;
    assert_eq!(received.as_str(), "\"hello\"");
    assert_eq!(handle.count().await?, 0);

    handle.shutdown().await?;
    task.await??;
    Ok(())
}

#[tokio::test]
async fn test_handle_purge_and_stats() -> Result<()> {
    let (handle, task) = BrokerHandle::spawn(broker()?);
    for i in 0..5 {
        handle.push(item(&i.to_string())).await?;
    }

    assert_eq!(handle.purge(Purge::Oldest(3)).await?, 3);
    assert_eq!(handle.stats().await?.count, 2);
    assert_eq!(handle.purge(Purge::All).await?, 2);
    assert_eq!(handle.purge(Purge::All).await?, 0);

    handle.shutdown().await?;
    task.await??;
    Ok(())
}

#[tokio::test]
async fn test_requests_after_shutdown_fail() -> Result<()> {
    let (handle, task) = BrokerHandle::spawn(broker()?);
    handle.shutdown().await?;
    task.await??;

    assert!(matches!(handle.count().await, Err(Error::BrokerGone)));
    assert!(matches!(handle.shutdown().await, Err(Error::BrokerGone)));
    // Cancelling against a stopped broker is silently ignored.
    let ticket = WaitList::new().enqueue(());
    handle.cancel(ticket).await;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_closes_pending_waiters() -> Result<()> {
    let (handle, task) = BrokerHandle::spawn(broker()?);
    let (_ticket, delivery) = expect_waiting(handle.pop().await?);

    handle.shutdown().await?;
    task.await??;
    assert!(delivery.await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_dropping_every_handle_flushes_store() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = StoreConfig::file(dir.path().join("queue.db"))
        .with_commit_interval(Duration::from_secs(3600));

    let (handle, task) = BrokerHandle::spawn(Broker::new(QueueStore::open(&config)?));
    handle.push(item("\"kept\"")).await?;
    drop(handle);
    task.await??;

    let store = QueueStore::open(&config)?;
    assert_eq!(store.count(), 1);
    Ok(())
}
