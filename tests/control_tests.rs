//! Control channel tests against a running broker.

#[path = "common.rs"]
mod common;

use std::sync::Arc;

use common::{TestBroker, item};
use jsonq::logging::{FlagSwitch, TraceSwitch};
use jsonq::server::{ControlChannel, ControlExit};

async fn run_control(broker: &TestBroker, script: &str, trace: Arc<FlagSwitch>) -> (ControlExit, Vec<String>) {
    let mut output = Vec::new();
    let channel = ControlChannel::new(
        script.as_bytes(),
        &mut output,
        broker.broker.clone(),
        trace,
        broker.sessions.clone(),
    );
    let exit = channel.run().await.unwrap();
    let text = String::from_utf8(output).unwrap();
    (exit, text.lines().map(str::to_string).collect())
}

#[tokio::test]
async fn test_purge_removes_oldest_items() {
    let broker = TestBroker::builder().start().await.unwrap();
    let mut client = broker.client().await;
    for i in 1..=5 {
        client.push(&item(&i.to_string())).await.unwrap();
    }

    let trace = Arc::new(FlagSwitch::default());
    let (exit, lines) = run_control(&broker, "purge 3\ncount\nexit\n", trace).await;
    assert_eq!(exit, ControlExit::Exit);
    assert_eq!(lines, ["purged 3 item(s)", "2", "exiting"]);

    // The two newest remain, still in order.
    assert_eq!(client.pop().await.unwrap().as_str(), "4");
    assert_eq!(client.pop().await.unwrap().as_str(), "5");

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_purge_all_and_empty() {
    let broker = TestBroker::builder().start().await.unwrap();
    let mut client = broker.client().await;
    for i in 0..5 {
        client.push(&item(&i.to_string())).await.unwrap();
    }

    let trace = Arc::new(FlagSwitch::default());
    let (_, lines) = run_control(&broker, "purge\npurge\npurge 10\n", trace).await;
    assert_eq!(lines[0], "purged 5 item(s)");
    assert_eq!(lines[1], "purged 0 item(s)");
    assert_eq!(lines[2], "purged 0 item(s)");
    assert_eq!(client.count().await.unwrap(), 0);

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_bad_control_input_keeps_channel_open() {
    let broker = TestBroker::builder().start().await.unwrap();

    let trace = Arc::new(FlagSwitch::default());
    let (exit, lines) = run_control(
        &broker,
        "\nshutdown now\npurge -2\necho   still  here\ndebug\nhelp\n",
        trace.clone(),
    )
    .await;

    assert_eq!(exit, ControlExit::InputClosed);
    assert!(lines[0].starts_with("error: unknown command \"shutdown\""));
    assert!(lines[1].starts_with("error: purge expects a non-negative integer"));
    assert_eq!(lines[2], "still  here");
    assert_eq!(lines[3], "debug on");
    assert!(lines[4].starts_with("commands:"));
    assert!(trace.is_verbose());

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_stats_include_waiters_and_sessions() {
    let broker = TestBroker::builder().start().await.unwrap();
    let mut consumer = broker.client().await;
    consumer.send_line("pop").await.unwrap();
    broker.wait_for_waiters(1).await;

    let trace = Arc::new(FlagSwitch::default());
    let (_, lines) = run_control(&broker, "stats\n", trace).await;
    assert_eq!(lines[0], "count=0 waiters=1 wait_slots=1 sessions=1");

    drop(consumer);
    broker.stop().await.unwrap();
}
