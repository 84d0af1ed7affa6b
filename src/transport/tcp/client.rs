use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::client::ClientTransport;
use crate::error::RpcError;
use crate::packet::{PacketWithId, ReadPacket, WritePacket};
use crate::stream::{Cleanup, ResponseFunnel};
use crate::transport::tcp::codec::{FrameCodec, encode_body};
use crate::transport::tcp::config::TcpClientConfig;

type FunnelMap = DashMap<String, ResponseFunnel, ahash::RandomState>;
type FrameSink = SplitSink<Framed<TcpStream, FrameCodec>, Bytes>;
type FrameSource = SplitStream<Framed<TcpStream, FrameCodec>>;

/// A frame queued for the writer task, with an optional write acknowledgement.
struct Outgoing {
    body: Bytes,
    written: Option<oneshot::Sender<Result<(), RpcError>>>,
}

/// Calls awaiting replies on one socket.
#[derive(Default)]
struct Calls {
    funnels: FunnelMap,
    /// Set once the socket is torn down; no call may be registered afterwards.
    closed: AtomicBool,
}

impl Calls {
    /// Track a call. Fails when the socket was torn down, possibly while registering.
    fn register(&self, id: &str, funnel: ResponseFunnel) -> Result<(), RpcError> {
        self.funnels.insert(id.to_string(), funnel);
        if self.closed.load(Ordering::SeqCst) && self.funnels.remove(id).is_some() {
            return Err(RpcError::Connection("connection lost".to_string()));
        }
        Ok(())
    }

    /// Refuse new calls and fail every pending one.
    fn shut(&self, err: impl Fn() -> RpcError) {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<String> = self.funnels.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, funnel)) = self.funnels.remove(&id) {
                funnel.fail(err());
            }
        }
    }
}

/// One live socket. Calls published on it are correlated in its own funnel map, so a
/// dying connection only ever fails its own calls.
struct TcpConnection {
    epoch: u64,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    calls: Arc<Calls>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

#[derive(Default)]
struct Shared {
    connection: Mutex<Option<Arc<TcpConnection>>>,
    epoch: AtomicU64,
}

impl Shared {
    fn current(&self) -> Option<Arc<TcpConnection>> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop the connection if it is still the one identified by `epoch`.
    fn invalidate(&self, epoch: u64) -> Option<Arc<TcpConnection>> {
        let mut slot = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(conn) if conn.epoch == epoch => slot.take(),
            _ => None,
        }
    }

    fn take(&self) -> Option<Arc<TcpConnection>> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Client transport over one length-framed TCP socket.
///
/// Every concurrent call shares the socket and is correlated by its packet id. When the
/// socket fails, all calls pending on it receive [`RpcError::Connection`] and the next
/// call opens a fresh socket.
pub struct TcpTransport {
    config: TcpClientConfig,
    shared: Arc<Shared>,
}

impl TcpTransport {
    pub fn new(config: TcpClientConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn config(&self) -> &TcpClientConfig {
        &self.config
    }

    fn connection(&self) -> Result<Arc<TcpConnection>, RpcError> {
        self.shared
            .current()
            .ok_or_else(|| RpcError::Connection(format!("not connected to {}", self.config.addr)))
    }

    /// Number of calls awaiting replies on the current socket.
    pub fn pending_calls(&self) -> usize {
        self.shared.current().map_or(0, |conn| conn.calls.funnels.len())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(conn) = self.shared.take() {
            conn.reader.abort();
            conn.writer.abort();
        }
    }
}

#[async_trait]
impl ClientTransport for TcpTransport {
    async fn connect(&self) -> Result<(), RpcError> {
        if self.is_connected() {
            return Ok(());
        }

        let addr = self.config.addr.clone();
        let stream = self
            .config
            .reconnect
            .run(&addr, || {
                let addr = addr.clone();
                async move {
                    TcpStream::connect(addr.as_str()).await.map_err(|e| {
                        RpcError::Connection(format!("failed to connect to {addr}: {e}"))
                    })
                }
            })
            .await?;
        stream.set_nodelay(true)?;

        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let framed = Framed::new(stream, FrameCodec::new(self.config.max_frame_size));
        let (sink, source) = framed.split();
        let (outgoing, queue) = mpsc::unbounded_channel();
        let calls = Arc::new(Calls::default());

        let writer = tokio::spawn(write_frames(sink, queue));
        let reader = tokio::spawn(read_replies(
            source,
            Arc::clone(&calls),
            Arc::clone(&self.shared),
            epoch,
        ));

        let connection = Arc::new(TcpConnection {
            epoch,
            outgoing,
            calls,
            reader,
            writer,
        });
        *self
            .shared
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(connection);

        info!(addr = %addr, epoch, "Connected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared
            .current()
            .is_some_and(|conn| !conn.outgoing.is_closed() && !conn.reader.is_finished())
    }

    async fn publish(
        &self,
        packet: PacketWithId,
        funnel: ResponseFunnel,
    ) -> Result<Cleanup, RpcError> {
        let conn = self.connection()?;
        let id = packet.id.clone();
        let body = encode_body(&packet)?;

        conn.calls.register(&id, funnel)?;
        let queued = conn.outgoing.send(Outgoing {
            body,
            written: None,
        });
        if queued.is_err() {
            conn.calls.funnels.remove(&id);
            return Err(RpcError::Connection("connection lost".to_string()));
        }

        let calls = Arc::clone(&conn.calls);
        Ok(Cleanup::new(move || {
            calls.funnels.remove(&id);
        }))
    }

    async fn dispatch_event(&self, packet: ReadPacket) -> Result<(), RpcError> {
        let conn = self.connection()?;
        let (written, ack) = oneshot::channel();
        conn.outgoing
            .send(Outgoing {
                body: encode_body(&packet)?,
                written: Some(written),
            })
            .map_err(|_| RpcError::Connection("connection lost".to_string()))?;

        ack.await
            .map_err(|_| RpcError::Connection("connection lost".to_string()))?
    }

    async fn close(&self) {
        let Some(conn) = self.shared.take() else {
            return;
        };

        conn.reader.abort();
        conn.writer.abort();
        conn.calls.shut(|| RpcError::Closed);
        info!(addr = %self.config.addr, "Connection closed");
    }
}

async fn write_frames(mut sink: FrameSink, mut queue: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(Outgoing { body, written }) = queue.recv().await {
        let result = sink.send(body).await;
        let failed = result.is_err();

        match (result, written) {
            (Ok(()), Some(ack)) => {
                let _ = ack.send(Ok(()));
            }
            (Err(e), Some(ack)) => {
                let _ = ack.send(Err(RpcError::Io(e)));
            }
            (Err(e), None) => warn!(error = %e, "Failed to write frame"),
            (Ok(()), None) => {}
        }

        if failed {
            break;
        }
    }
}

async fn read_replies(
    mut source: FrameSource,
    calls: Arc<Calls>,
    shared: Arc<Shared>,
    epoch: u64,
) {
    let reason = loop {
        match source.next().await {
            Some(Ok(frame)) => route_reply(&calls.funnels, &frame),
            Some(Err(e)) => break format!("read failed: {e}"),
            None => break "connection closed by peer".to_string(),
        }
    };

    warn!(epoch, reason = %reason, "Connection lost");
    if let Some(conn) = shared.invalidate(epoch) {
        conn.writer.abort();
    }
    calls.shut(|| RpcError::Connection(reason.clone()));
}

fn route_reply(funnels: &FunnelMap, frame: &[u8]) {
    let reply: WritePacket = match serde_json::from_slice(frame) {
        Ok(reply) => reply,
        Err(e) => {
            warn!(error = %e, "Malformed reply frame");
            return;
        }
    };

    let Some(id) = reply.id.clone() else {
        debug!("Reply without id, dropping");
        return;
    };

    if reply.is_terminal() {
        if let Some((_, funnel)) = funnels.remove(&id) {
            funnel.deliver(reply);
        }
    } else if let Some(funnel) = funnels.get(&id) {
        funnel.deliver(reply);
    } else {
        // Already unsubscribed.
        debug!(id = %id, "Reply for unknown call, dropping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_route_reply_matches_exact_id() {
        let funnels = FunnelMap::default();
        let (a, mut rx_a) = ResponseFunnel::channel();
        let (b, mut rx_b) = ResponseFunnel::channel();
        funnels.insert("a".into(), a);
        funnels.insert("b".into(), b);

        let body = serde_json::to_vec(&WritePacket::data("b", json!(2))).unwrap();
        route_reply(&funnels, &body);

        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap().unwrap(), WritePacket::data("b", json!(2)));
    }

    #[tokio::test]
    async fn test_terminal_reply_removes_funnel() {
        let funnels = FunnelMap::default();
        let (a, mut rx) = ResponseFunnel::channel();
        funnels.insert("a".into(), a);

        route_reply(&funnels, &serde_json::to_vec(&WritePacket::disposed("a")).unwrap());
        assert!(funnels.is_empty());
        assert!(rx.try_recv().unwrap().unwrap().is_disposed);

        // Late replies for a finished call are dropped silently.
        route_reply(&funnels, &serde_json::to_vec(&WritePacket::data("a", json!(1))).unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_register_after_teardown_fails() {
        let calls = Calls::default();
        let (pending, mut pending_rx) = ResponseFunnel::channel();
        calls.register("a", pending).unwrap();

        calls.shut(|| RpcError::Connection("read failed".to_string()));
        assert!(matches!(
            pending_rx.try_recv().unwrap(),
            Err(RpcError::Connection(_))
        ));

        let (late, _late_rx) = ResponseFunnel::channel();
        assert!(matches!(
            calls.register("b", late),
            Err(RpcError::Connection(_))
        ));
        assert!(calls.funnels.is_empty());
    }

    #[tokio::test]
    async fn test_unconnected_publish_fails() {
        let transport = TcpTransport::new(TcpClientConfig::builder().build());
        let (funnel, _rx) = ResponseFunnel::channel();
        let packet = ReadPacket::new("x", crate::packet::Record::default()).with_id();

        assert!(matches!(
            transport.publish(packet, funnel).await,
            Err(RpcError::Connection(_))
        ));
        transport.close().await;
        transport.close().await;
    }
}
