use anyhow::Result;
use futures::StreamExt;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use transit_rpc::ClientProxy;
use transit_rpc::transport::tcp::{TcpClientConfig, TcpTransport};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let addr = std::env::var("TRANSIT_ADDR").unwrap_or_else(|_| "127.0.0.1:3000".to_string());

    let client = ClientProxy::new(TcpTransport::new(
        TcpClientConfig::builder().addr(addr).build(),
    ));

    let total = client
        .send(json!({ "cmd": "sum" }), [1, 2, 3, 4, 5])
        .first()
        .await?;
    info!(%total, "sum");

    let mut counts = client.send(json!({ "cmd": "count" }), 5);
    while let Some(value) = counts.next().await {
        let value = value?;
        info!(%value, "count");
    }

    match client.send("missing", json!(null)).first().await {
        Ok(value) => warn!(%value, "Unexpected reply"),
        Err(e) => info!(error = %e, "No handler, as expected"),
    }

    client.emit("notify", true).await?;
    info!("notify sent");

    client.close().await;
    Ok(())
}
