use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::select_all;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RpcError;
use crate::packet::PacketWithId;
use crate::server::{Dispatcher, Server};
use crate::transport::broker::{Broker, ack_channel, response_channel};

/// Serves every registered pattern from its `{key}_ack` channel.
pub struct BrokerServer<B> {
    broker: B,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
}

impl<B: Broker> BrokerServer<B> {
    pub fn new(broker: B, dispatcher: Dispatcher) -> Self {
        Self {
            broker,
            dispatcher,
            shutdown: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl<B: Broker> Server for BrokerServer<B> {
    async fn listen(&self) -> Result<(), RpcError> {
        if self.shutdown.is_cancelled() {
            return Err(RpcError::Closed);
        }

        let mut subscriptions = Vec::with_capacity(self.dispatcher.registry().len());
        for key in self.dispatcher.registry().patterns() {
            let channel = ack_channel(key);
            subscriptions.push(self.broker.subscribe(&channel).await?);
            debug!(channel = %channel, "Subscribed to pattern channel");
        }
        info!(patterns = subscriptions.len(), "Broker server listening");

        if subscriptions.is_empty() {
            warn!("No patterns registered, nothing to serve");
            self.shutdown.cancelled().await;
            return Ok(());
        }

        let mut inbound = select_all(subscriptions);
        let mut calls = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                payload = inbound.next() => match payload {
                    Some(payload) => self.handle(payload, &mut calls),
                    None => {
                        warn!("All pattern subscriptions ended");
                        break;
                    }
                },

                Some(_) = calls.join_next(), if !calls.is_empty() => {}
            }
        }

        calls.shutdown().await;
        info!("Broker server stopped");
        Ok(())
    }

    async fn close(&self) {
        self.shutdown.cancel();
    }
}

impl<B: Broker> BrokerServer<B> {
    fn handle(&self, payload: Bytes, calls: &mut JoinSet<()>) {
        let inbound = match self.dispatcher.decode(&payload) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(error = %e, "Skipping malformed message");
                return;
            }
        };

        let dispatcher = self.dispatcher.clone();
        match inbound.into_request() {
            Ok(request) => {
                let broker = self.broker.clone();
                calls.spawn(reply(broker, dispatcher, request));
            }
            Err(event) => {
                calls.spawn(async move { dispatcher.dispatch_event(event).await });
            }
        }
    }
}

async fn reply<B: Broker>(broker: B, dispatcher: Dispatcher, request: PacketWithId) {
    let channel = response_channel(request.packet.pattern.key(), &request.id);
    let mut replies = dispatcher.dispatch(request);

    while let Some(reply) = replies.next().await {
        let body = match serde_json::to_vec(&reply) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                warn!(channel = %channel, error = %e, "Failed to encode reply");
                return;
            }
        };
        if let Err(e) = broker.publish(&channel, body).await {
            warn!(channel = %channel, error = %e, "Failed to publish reply");
            return;
        }
    }
}
