#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use transit_rpc::RpcError;
use transit_rpc::server::{Dispatcher, PatternRegistry};

/// Handlers shared by the transport tests.
pub struct Fixture {
    pub dispatcher: Dispatcher,
    /// Values produced so far by the endless `ticks` stream.
    pub ticks: Arc<AtomicUsize>,
    /// Payloads received by the `notify` event handler.
    pub events: mpsc::UnboundedReceiver<Value>,
}

pub fn fixture() -> Fixture {
    let ticks = Arc::new(AtomicUsize::new(0));
    let (event_tx, events) = mpsc::unbounded_channel();
    let mut registry = PatternRegistry::new();

    registry.add_handler(json!({ "cmd": "sum" }), |numbers: Vec<i64>| async move {
        Ok::<_, RpcError>(numbers.into_iter().sum::<i64>())
    });

    registry.add_handler(json!({ "cmd": "echo" }), |value: Value| async move {
        Ok::<_, RpcError>(value)
    });

    registry.add_handler(json!({ "service": "math", "cmd": "double" }), |n: i64| async move {
        Ok::<_, RpcError>(n * 2)
    });

    registry.add_handler(json!({ "cmd": "slow_echo" }), |value: Value| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<_, RpcError>(value)
    });

    registry.add_stream_handler(json!({ "cmd": "count" }), |n: u64| {
        futures::stream::iter((1..=n).map(Ok::<_, RpcError>))
    });

    // Yields one string of `n` bytes per requested size.
    registry.add_stream_handler(json!({ "cmd": "blobs" }), |sizes: Vec<usize>| {
        futures::stream::iter(sizes.into_iter().map(|n| Ok::<_, RpcError>("x".repeat(n))))
    });

    let counter = Arc::clone(&ticks);
    registry.add_stream_handler("ticks", move |_: Value| {
        let counter = Arc::clone(&counter);
        futures::stream::iter(0..).then(move |i: u64| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RpcError>(i)
            }
        })
    });

    registry.add_handler("fail", |_: Value| async {
        Err::<Value, _>(RpcError::handler(json!({ "reason": "refused" })))
    });

    registry.add_event_handler("notify", move |value: Value| {
        let event_tx = event_tx.clone();
        async move {
            let _ = event_tx.send(value);
            Ok(())
        }
    });

    Fixture {
        dispatcher: Dispatcher::new(registry),
        ticks,
        events,
    }
}

/// Wait until `ticks` stops advancing.
pub async fn settled(ticks: &AtomicUsize) -> usize {
    let mut last = ticks.load(Ordering::SeqCst);
    loop {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let now = ticks.load(Ordering::SeqCst);
        if now == last {
            return now;
        }
        last = now;
    }
}
