use std::sync::{Mutex, PoisonError};

use async_nats::{Client, Message, Subscriber};
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
use crate::transport::nats::config::NatsServerConfig;
use crate::transport::nats::headers::from_header_map;

/// Serves every registered pattern on its NATS subject.
pub struct NatsServer {
    config: NatsServerConfig,
    dispatcher: Dispatcher,
    client: Mutex<Option<Client>>,
    shutdown: CancellationToken,
}

impl NatsServer {
    pub fn new(config: NatsServerConfig, dispatcher: Dispatcher) -> Self {
        Self {
            config,
            dispatcher,
            client: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    async fn subscribe(&self, client: &Client, subject: String) -> Result<Subscriber, RpcError> {
        let subscriber = match &self.config.queue_group {
            Some(group) => client.queue_subscribe(subject, group.clone()).await,
            None => client.subscribe(subject).await,
        };
        subscriber.map_err(RpcError::nats)
    }
}

#[async_trait]
impl Server for NatsServer {
    async fn listen(&self) -> Result<(), RpcError> {
        if self.shutdown.is_cancelled() {
            return Err(RpcError::Closed);
        }

        let client = async_nats::connect(self.config.servers.as_str())
            .await
            .map_err(RpcError::nats)?;
        *self.client.lock().unwrap_or_else(PoisonError::into_inner) = Some(client.clone());

        let mut subscribers = Vec::with_capacity(self.dispatcher.registry().len());
        for key in self.dispatcher.registry().patterns() {
            let subject = self.config.subject(key);
            debug!(subject = %subject, "Subscribing");
            subscribers.push(self.subscribe(&client, subject).await?);
        }
        client.flush().await.map_err(RpcError::nats)?;
        info!(
            servers = %self.config.servers,
            patterns = subscribers.len(),
            "NATS server listening"
        );

        if subscribers.is_empty() {
            warn!("No patterns registered, nothing to serve");
            self.shutdown.cancelled().await;
            return Ok(());
        }

        let mut inbound = select_all(subscribers);
        let mut calls = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                message = inbound.next() => match message {
                    Some(message) => self.handle(&client, message, &mut calls),
                    None => {
                        warn!("All subscriptions ended");
                        break;
                    }
                },

                Some(_) = calls.join_next(), if !calls.is_empty() => {}
            }
        }

        calls.shutdown().await;
        let _ = client.flush().await;
        info!("NATS server stopped");
        Ok(())
    }

    async fn close(&self) {
        self.shutdown.cancel();
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl NatsServer {
    fn handle(&self, client: &Client, message: Message, calls: &mut JoinSet<()>) {
        let mut inbound = match self.dispatcher.decode(&message.payload) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(subject = %message.subject, error = %e, "Skipping malformed message");
                return;
            }
        };
        if let Some(headers) = &message.headers {
            inbound.packet.headers = from_header_map(headers);
        }

        let dispatcher = self.dispatcher.clone();
        match (inbound.into_request(), message.reply) {
            (Ok(request), Some(reply_to)) => {
                calls.spawn(reply(client.clone(), reply_to.to_string(), dispatcher, request));
            }
            (Ok(request), None) => {
                warn!(id = %request.id, "Request without reply subject, dropping");
            }
            (Err(event), _) => {
                calls.spawn(async move { dispatcher.dispatch_event(event).await });
            }
        }
    }
}

async fn reply(client: Client, reply_to: String, dispatcher: Dispatcher, request: PacketWithId) {
    let mut replies = dispatcher.dispatch(request);

    while let Some(reply) = replies.next().await {
        let body = match serde_json::to_vec(&reply) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                warn!(error = %e, "Failed to encode reply");
                return;
            }
        };
        if let Err(e) = client.publish(reply_to.clone(), body).await {
            warn!(reply_to = %reply_to, error = %e, "Failed to publish reply");
            return;
        }
    }
}
