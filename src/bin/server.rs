use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;
use transit_rpc::server::{Dispatcher, PatternRegistry, Server};
use transit_rpc::transport::tcp::{TcpServer, TcpServerConfig};
use transit_rpc::RpcError;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let addr = std::env::var("TRANSIT_ADDR").unwrap_or_else(|_| "127.0.0.1:3000".to_string());

    let mut registry = PatternRegistry::new();

    registry.add_handler(json!({ "cmd": "sum" }), |numbers: Vec<i64>| async move {
        Ok::<_, RpcError>(numbers.into_iter().sum::<i64>())
    });

    // Counts up to `n`, one value every 100ms.
    registry.add_stream_handler(json!({ "cmd": "count" }), |n: u64| {
        futures::stream::iter(1..=n).then(|i| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, RpcError>(i)
        })
    });

    registry.add_event_handler("notify", |flag: bool| async move {
        info!(flag, "Notification received");
        Ok(())
    });

    let server = TcpServer::bind(
        TcpServerConfig::builder().addr(addr).build(),
        Dispatcher::new(registry),
    )
    .await?;
    info!(address = %server.local_addr(), "Serving sum, count and notify");

    tokio::select! {
        result = server.listen() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            server.close().await;
        }
    }

    Ok(())
}
