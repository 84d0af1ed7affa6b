use std::sync::{Mutex, PoisonError};

use async_nats::connection::State;
use async_nats::{Client, ConnectOptions, Event};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::client::ClientTransport;
use crate::error::RpcError;
use crate::packet::{PacketWithId, ReadPacket};
use crate::stream::{Cleanup, ResponseFunnel};
use crate::transport::nats::config::NatsClientConfig;
use crate::transport::nats::headers::{merge_headers, to_header_map};
use crate::transport::pending::PendingCalls;

/// Client transport over NATS subjects.
///
/// Each request gets its own reply inbox. Replies carry the request id as well, and only
/// replies matching it are delivered. When the NATS connection drops, every call in
/// flight fails with [`RpcError::Connection`]; replies are never resumed after the
/// client reconnects.
pub struct NatsTransport {
    config: NatsClientConfig,
    client: Mutex<Option<Client>>,
    pending: PendingCalls,
}

impl NatsTransport {
    pub fn new(config: NatsClientConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
            pending: PendingCalls::default(),
        }
    }

    pub fn config(&self) -> &NatsClientConfig {
        &self.config
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    fn client(&self) -> Result<Client, RpcError> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| RpcError::Connection(format!("not connected to {}", self.config.servers)))
    }

    fn encode(&self, packet: &ReadPacket, body: Vec<u8>) -> (String, async_nats::HeaderMap, Bytes) {
        let subject = self.config.subject(packet.pattern.key());
        let headers = to_header_map(&merge_headers(&self.config.headers, &packet.headers));
        (subject, headers, Bytes::from(body))
    }
}

#[async_trait]
impl ClientTransport for NatsTransport {
    async fn connect(&self) -> Result<(), RpcError> {
        if self.is_connected() {
            return Ok(());
        }

        let servers = self.config.servers.clone();
        let pending = self.pending.clone();
        let client = self
            .config
            .reconnect
            .run(&servers, || {
                let servers = servers.clone();
                let pending = pending.clone();
                async move {
                    ConnectOptions::new()
                        .event_callback(move |event| {
                            let pending = pending.clone();
                            async move { on_event(&pending, event) }
                        })
                        .connect(servers.as_str())
                        .await
                        .map_err(|e| RpcError::Connection(format!("failed to connect to {servers}: {e}")))
                }
            })
            .await?;

        *self.client.lock().unwrap_or_else(PoisonError::into_inner) = Some(client);
        info!(servers = %servers, "Connected to NATS");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|client| !matches!(client.connection_state(), State::Disconnected))
    }

    async fn publish(
        &self,
        packet: PacketWithId,
        funnel: ResponseFunnel,
    ) -> Result<Cleanup, RpcError> {
        let client = self.client()?;
        let body = serde_json::to_vec(&packet)?;
        let (subject, headers, body) = self.encode(&packet.packet, body);

        let inbox = client.new_inbox();
        let replies = client
            .subscribe(inbox.clone())
            .await
            .map_err(RpcError::nats)?
            .map(|message| message.payload)
            .boxed();

        // Dropped on failure, which unsubscribes the inbox.
        let cleanup = self.pending.track(packet.id, funnel, replies);
        debug!(subject = %subject, inbox = %inbox, "Publishing request");
        client
            .publish_with_reply_and_headers(subject, inbox, headers, body)
            .await
            .map_err(RpcError::nats)?;

        Ok(cleanup)
    }

    async fn dispatch_event(&self, packet: ReadPacket) -> Result<(), RpcError> {
        let client = self.client()?;
        let body = serde_json::to_vec(&packet)?;
        let (subject, headers, body) = self.encode(&packet, body);

        client
            .publish_with_headers(subject, headers, body)
            .await
            .map_err(RpcError::nats)?;
        client.flush().await.map_err(RpcError::nats)
    }

    async fn close(&self) {
        let Some(client) = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        self.pending.fail_all(|| RpcError::Closed);
        // Push out anything still buffered; the connection closes once the last handle drops.
        let _ = client.flush().await;
        info!(servers = %self.config.servers, "NATS connection closed");
    }
}

/// Calls in flight when the connection drops are abandoned, even if the client reconnects.
fn on_event(pending: &PendingCalls, event: Event) {
    match event {
        Event::Disconnected => {
            warn!(calls = pending.len(), "NATS connection lost");
            pending.fail_all(|| RpcError::Connection("NATS connection lost".to_string()));
        }
        Event::Connected => info!("NATS connection established"),
        other => debug!(event = %other, "NATS event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Record;
    use serde_json::json;

    #[test]
    fn test_encode_merges_headers_and_derives_subject() {
        let mut configured = crate::packet::Headers::new();
        configured.insert("tenant".to_string(), "default".to_string());
        configured.insert("trace".to_string(), "off".to_string());

        let transport = NatsTransport::new(
            NatsClientConfig::builder()
                .subject_prefix("svc".to_string())
                .headers(configured)
                .build(),
        );

        let packet = ReadPacket::new(
            json!({ "cmd": "sum" }),
            Record::new(json!([1, 2])).header("tenant", "acme"),
        );
        let (subject, headers, body) = transport.encode(&packet, b"{}".to_vec());

        assert_eq!(subject, r#"svc.{"cmd":"sum"}"#);
        assert_eq!(
            crate::transport::nats::headers::from_header_map(&headers),
            [("tenant", "acme"), ("trace", "off")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        );
        assert_eq!(body.as_ref(), b"{}");
    }

    #[tokio::test]
    async fn test_disconnect_fails_calls_in_flight() {
        let pending = PendingCalls::default();
        let (funnel, mut rx) = ResponseFunnel::channel();
        let _cleanup = pending.track("a".to_string(), funnel, futures::stream::pending().boxed());

        on_event(&pending, Event::Connected);
        assert_eq!(pending.len(), 1);

        on_event(&pending, Event::Disconnected);
        assert!(matches!(rx.recv().await, Some(Err(RpcError::Connection(_)))));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_unconnected_calls_fail() {
        let transport = NatsTransport::new(NatsClientConfig::builder().build());
        let (funnel, _rx) = ResponseFunnel::channel();
        let packet = ReadPacket::new("x", Record::default());

        assert!(matches!(
            transport.publish(packet.clone().with_id(), funnel).await,
            Err(RpcError::Connection(_))
        ));
        assert!(matches!(
            transport.dispatch_event(packet).await,
            Err(RpcError::Connection(_))
        ));
        transport.close().await;
    }
}
