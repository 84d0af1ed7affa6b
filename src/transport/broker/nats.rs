use async_nats::Client;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::info;

use crate::error::RpcError;
use crate::transport::broker::{Broker, BrokerSubscription};

/// A [`Broker`] over NATS core publish/subscribe.
#[derive(Debug, Clone)]
pub struct NatsBroker {
    client: Client,
}

impl NatsBroker {
    /// Connect to one or more comma-separated NATS server addresses.
    pub async fn connect(servers: &str) -> Result<Self, RpcError> {
        let client = async_nats::connect(servers).await.map_err(RpcError::nats)?;
        info!(servers = %servers, "Connected to NATS broker");
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), RpcError> {
        self.client
            .publish(channel.to_string(), payload)
            .await
            .map_err(RpcError::nats)
    }

    async fn subscribe(&self, channel: &str) -> Result<BrokerSubscription, RpcError> {
        let subscriber = self
            .client
            .subscribe(channel.to_string())
            .await
            .map_err(RpcError::nats)?;

        // The flush round-trip guarantees the server has registered the interest.
        self.client.flush().await.map_err(RpcError::nats)?;

        Ok(subscriber.map(|message| message.payload).boxed())
    }
}
