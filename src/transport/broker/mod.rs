//! Publish/subscribe broker transport.
//!
//! There is no duplex connection. The server subscribes `{key}_ack` for every registered
//! pattern; a client subscribes `{key}_{id}_res`, waits for the broker to confirm the
//! subscription, and only then publishes its request to `{key}_ack`. Replies for the call
//! arrive on the response channel. Events are published to `{key}_ack` without an id.
//!
//! ```ignore
//! let broker = MemoryBroker::new();
//!
//! let server = BrokerServer::new(broker.clone(), Dispatcher::new(registry));
//! tokio::spawn(async move { server.listen().await });
//!
//! let client = ClientProxy::new(BrokerTransport::new(broker));
//! let total = client.send(json!({ "cmd": "sum" }), [1, 2, 3]).first().await?;
//! ```

mod client;
mod memory;
mod nats;
mod server;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::RpcError;
use crate::pattern::PatternKey;

pub use client::BrokerTransport;
pub use memory::MemoryBroker;
pub use nats::NatsBroker;
pub use server::BrokerServer;

/// Payloads received on one channel. Dropping it unsubscribes.
pub type BrokerSubscription = BoxStream<'static, Bytes>;

/// A publish/subscribe broker handle.
#[async_trait]
pub trait Broker: Clone + Send + Sync + 'static {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), RpcError>;

    /// Subscribe to `channel`. Resolves only once the broker has confirmed the
    /// subscription, so nothing published afterwards can be missed.
    async fn subscribe(&self, channel: &str) -> Result<BrokerSubscription, RpcError>;
}

/// Channel a server listens on for requests and events addressed to `key`.
pub fn ack_channel(key: &PatternKey) -> String {
    format!("{key}_ack")
}

/// Channel carrying the replies of call `id` on `key`.
pub fn response_channel(key: &PatternKey, id: &str) -> String {
    format!("{key}_{id}_res")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::Pattern;
    use serde_json::json;

    #[test]
    fn test_channel_names() {
        let key = Pattern::from("sum").key().clone();
        assert_eq!(ack_channel(&key), "sum_ack");
        assert_eq!(response_channel(&key, "42"), "sum_42_res");
    }

    #[test]
    fn test_channel_names_use_canonical_key() {
        let a = Pattern::new(json!({ "b": 2, "a": 1 }));
        let b = Pattern::new(json!({ "a": 1, "b": 2 }));
        assert_eq!(ack_channel(a.key()), ack_channel(b.key()));
        assert_eq!(ack_channel(a.key()), r#"{"a":1,"b":2}_ack"#);
    }
}
