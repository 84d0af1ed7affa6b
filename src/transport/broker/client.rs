use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use crate::client::ClientTransport;
use crate::error::RpcError;
use crate::packet::{PacketWithId, ReadPacket};
use crate::stream::{Cleanup, ResponseFunnel};
use crate::transport::broker::{Broker, ack_channel, response_channel};
use crate::transport::pending::PendingCalls;

/// Client transport over a publish/subscribe [`Broker`].
pub struct BrokerTransport<B> {
    broker: B,
    connected: AtomicBool,
    pending: PendingCalls,
}

impl<B: Broker> BrokerTransport<B> {
    pub fn new(broker: B) -> Self {
        Self {
            broker,
            connected: AtomicBool::new(false),
            pending: PendingCalls::default(),
        }
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Calls whose response channel is still subscribed.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl<B: Broker> ClientTransport for BrokerTransport<B> {
    async fn connect(&self) -> Result<(), RpcError> {
        // The broker handle arrives connected; there is no per-proxy socket.
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!("Broker transport ready");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(
        &self,
        packet: PacketWithId,
        funnel: ResponseFunnel,
    ) -> Result<Cleanup, RpcError> {
        let key = packet.packet.pattern.key().clone();
        let body = Bytes::from(serde_json::to_vec(&packet)?);

        let channel = response_channel(&key, &packet.id);
        let replies = self.broker.subscribe(&channel).await?;
        debug!(channel = %channel, "Subscribed to response channel");

        // Dropped on failure, which unsubscribes again.
        let cleanup = self.pending.track(packet.id, funnel, replies);
        self.broker.publish(&ack_channel(&key), body).await?;
        Ok(cleanup)
    }

    async fn dispatch_event(&self, packet: ReadPacket) -> Result<(), RpcError> {
        let body = Bytes::from(serde_json::to_vec(&packet)?);
        self.broker
            .publish(&ack_channel(packet.pattern.key()), body)
            .await
    }

    async fn close(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }

        self.pending.fail_all(|| RpcError::Closed);
        info!("Broker transport closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Record, WritePacket};
    use crate::transport::broker::MemoryBroker;
    use futures::StreamExt;
    use serde_json::json;

    fn call(pattern: &str) -> PacketWithId {
        ReadPacket::new(pattern, Record::new(json!(1))).with_id()
    }

    #[tokio::test]
    async fn test_subscribes_before_publishing_request() {
        let broker = MemoryBroker::new();
        let mut requests = broker.subscribe("sum_ack").await.unwrap();
        let transport = BrokerTransport::new(broker.clone());
        transport.connect().await.unwrap();

        let packet = call("sum");
        let channel = response_channel(packet.packet.pattern.key(), &packet.id);
        let (funnel, _rx) = ResponseFunnel::channel();
        let _cleanup = transport.publish(packet, funnel).await.unwrap();

        // By the time the request is visible, the reply channel already has a listener.
        let request = requests.next().await.unwrap();
        assert!(!request.is_empty());
        assert_eq!(broker.subscriber_count(&channel), 1);
    }

    #[tokio::test]
    async fn test_foreign_ids_are_ignored() {
        let broker = MemoryBroker::new();
        let transport = BrokerTransport::new(broker.clone());
        transport.connect().await.unwrap();

        let packet = call("sum");
        let id = packet.id.clone();
        let channel = response_channel(packet.packet.pattern.key(), &id);
        let (funnel, mut rx) = ResponseFunnel::channel();
        let _cleanup = transport.publish(packet, funnel).await.unwrap();

        let stray = serde_json::to_vec(&WritePacket::data("someone-else", json!(0))).unwrap();
        broker.publish(&channel, stray.into()).await.unwrap();
        let mine = serde_json::to_vec(&WritePacket::data(&id, json!(7))).unwrap();
        broker.publish(&channel, mine.into()).await.unwrap();

        let reply = rx.recv().await.unwrap().unwrap();
        assert_eq!(reply, WritePacket::data(&id, json!(7)));
    }

    #[tokio::test]
    async fn test_cleanup_unsubscribes() {
        let broker = MemoryBroker::new();
        let transport = BrokerTransport::new(broker.clone());
        transport.connect().await.unwrap();

        let packet = call("sum");
        let channel = response_channel(packet.packet.pattern.key(), &packet.id);
        let (funnel, _rx) = ResponseFunnel::channel();
        let mut cleanup = transport.publish(packet, funnel).await.unwrap();

        cleanup.run();
        cleanup.run();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(transport.pending_calls(), 0);
        assert_eq!(broker.subscriber_count(&channel), 0);
    }

    #[tokio::test]
    async fn test_close_fails_pending_calls() {
        let transport = BrokerTransport::new(MemoryBroker::new());
        transport.connect().await.unwrap();

        let (funnel, mut rx) = ResponseFunnel::channel();
        let _cleanup = transport.publish(call("slow"), funnel).await.unwrap();

        transport.close().await;
        transport.close().await;

        assert!(matches!(rx.recv().await, Some(Err(RpcError::Closed))));
        assert!(!transport.is_connected());
    }
}
