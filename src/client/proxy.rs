use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::client::transport::ClientTransport;
use crate::error::RpcError;
use crate::packet::{PacketWithId, ReadPacket, Record};
use crate::pattern::Pattern;
use crate::stream::{Cleanup, ReplyStream, ResponseFunnel, drain_funnel};

/// Transport-agnostic client for pattern-addressed requests and events.
///
/// The proxy connects lazily on the first call and shares one connection between every
/// call made through it (and through its clones).
///
/// # Example
///
/// ```ignore
/// use transit_rpc::client::ClientProxy;
/// use transit_rpc::transport::tcp::{TcpClientConfig, TcpTransport};
///
/// let client = ClientProxy::new(TcpTransport::new(TcpClientConfig::builder().build()));
///
/// let total = client.send(json!({ "cmd": "sum" }), [1, 2, 3, 4, 5]).first().await?;
/// client.emit("notify", true).await?;
/// ```
pub struct ClientProxy<T> {
    inner: Arc<ProxyInner<T>>,
}

struct ProxyInner<T> {
    transport: Arc<T>,
    connecting: Mutex<()>,
}

impl<T> Clone for ClientProxy<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ClientTransport> ProxyInner<T> {
    /// Connect unless already connected. Concurrent callers wait on the same attempt.
    async fn ensure_connected(&self) -> Result<(), RpcError> {
        if self.transport.is_connected() {
            return Ok(());
        }

        let _attempt = self.connecting.lock().await;
        if self.transport.is_connected() {
            return Ok(());
        }

        self.transport.connect().await
    }
}

impl<T: ClientTransport> ClientProxy<T> {
    pub fn new(transport: T) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                transport: Arc::new(transport),
                connecting: Mutex::new(()),
            }),
        }
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Connect eagerly instead of on the first call.
    pub async fn connect(&self) -> Result<(), RpcError> {
        self.inner.ensure_connected().await
    }

    /// Send a request and stream back its replies.
    ///
    /// Serialization and connection failures are reported through the returned stream.
    pub fn send<D: Serialize>(&self, pattern: impl Into<Pattern>, data: D) -> ReplyStream {
        match serde_json::to_value(data) {
            Ok(data) => self.send_record(pattern, Record::new(data)),
            Err(e) => ReplyStream::failed(e.into()),
        }
    }

    /// Send a request with transport headers.
    pub fn send_record(&self, pattern: impl Into<Pattern>, record: Record) -> ReplyStream {
        let packet = ReadPacket::new(pattern, record).with_id();
        self.correlate(packet, |transport, packet, funnel| async move {
            transport.publish(packet, funnel).await
        })
    }

    /// Fire an event. No reply is awaited; only transport delivery is reported.
    pub async fn emit<D: Serialize>(
        &self,
        pattern: impl Into<Pattern>,
        data: D,
    ) -> Result<(), RpcError> {
        let data = serde_json::to_value(data)?;
        self.emit_record(pattern, Record::new(data)).await
    }

    pub async fn emit_record(
        &self,
        pattern: impl Into<Pattern>,
        record: Record,
    ) -> Result<(), RpcError> {
        let packet = ReadPacket::new(pattern, record);
        self.inner.ensure_connected().await?;
        debug!(pattern = %packet.pattern, "Emitting event");
        self.inner.transport.dispatch_event(packet).await
    }

    /// Release the connection. The next call connects again.
    pub async fn close(&self) {
        self.inner.transport.close().await;
    }

    /// Build the cold reply stream for one call, publishing it with `publish` on first poll.
    pub(crate) fn correlate<F, Fut>(&self, packet: PacketWithId, publish: F) -> ReplyStream
    where
        F: FnOnce(Arc<T>, PacketWithId, ResponseFunnel) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Cleanup, RpcError>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);

        ReplyStream::new(async_stream::stream! {
            match inner.ensure_connected().await {
                Err(err) => yield Err(err),
                Ok(()) => {
                    debug!(pattern = %packet.packet.pattern, id = %packet.id, "Publishing request");
                    let (funnel, rx) = ResponseFunnel::channel();

                    match publish(Arc::clone(&inner.transport), packet, funnel).await {
                        Err(err) => yield Err(err),
                        Ok(cleanup) => {
                            let mut replies = Box::pin(drain_funnel(rx, cleanup));
                            while let Some(reply) = replies.next().await {
                                yield reply;
                            }
                        }
                    }
                }
            }
        })
    }
}
