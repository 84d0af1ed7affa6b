use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::RpcError;
use crate::transport::broker::{Broker, BrokerSubscription};

type Subscribers = Vec<mpsc::UnboundedSender<Bytes>>;

/// An in-process broker. Clones share the same channels.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    channels: Arc<DashMap<String, Subscribers, ahash::RandomState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, |subscribers| {
            subscribers.iter().filter(|tx| !tx.is_closed()).count()
        })
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), RpcError> {
        let emptied = match self.channels.get_mut(channel) {
            Some(mut subscribers) => {
                subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
                subscribers.is_empty()
            }
            None => false,
        };

        if emptied {
            self.channels
                .remove_if(channel, |_, subscribers| subscribers.is_empty());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BrokerSubscription, RpcError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.entry(channel.to_string()).or_default().push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_every_subscriber() {
        let broker = MemoryBroker::new();
        let mut a = broker.subscribe("news").await.unwrap();
        let mut b = broker.subscribe("news").await.unwrap();

        broker.publish("news", Bytes::from_static(b"hi")).await.unwrap();

        assert_eq!(a.next().await.unwrap().as_ref(), b"hi");
        assert_eq!(b.next().await.unwrap().as_ref(), b"hi");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let broker = MemoryBroker::new();
        broker.publish("void", Bytes::from_static(b"x")).await.unwrap();

        let mut late = broker.subscribe("void").await.unwrap();
        broker.publish("void", Bytes::from_static(b"y")).await.unwrap();
        assert_eq!(late.next().await.unwrap().as_ref(), b"y");
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let broker = MemoryBroker::new();
        let sub = broker.subscribe("c").await.unwrap();
        assert_eq!(broker.subscriber_count("c"), 1);

        drop(sub);
        assert_eq!(broker.subscriber_count("c"), 0);

        broker.publish("c", Bytes::new()).await.unwrap();
        assert!(broker.channels.get("c").is_none());
    }
}
