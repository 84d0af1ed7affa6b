use std::net::SocketAddr;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::error::RpcError;
use crate::packet::{ReadPacket, Reply as ReplyKind};
use crate::server::{Dispatcher, Server};
use crate::transit_proto::transit_server::{Transit, TransitServer};
use crate::transit_proto::{Delivered, Envelope, Reply};
use crate::transport::grpc::config::GrpcServerConfig;
use crate::transport::grpc::envelope::{decode_envelope, encode_reply};

fn to_status(err: RpcError) -> Status {
    match err {
        RpcError::MalformedFrame(message) => Status::invalid_argument(message),
        other => Status::internal(other.to_string()),
    }
}

fn decode(request: Request<Envelope>) -> Result<ReadPacket, Status> {
    decode_envelope(request.into_inner()).map_err(to_status)
}

/// The generated `Transit` service backed by a [`Dispatcher`].
pub struct TransitService {
    dispatcher: Dispatcher,
    stream_buffer: usize,
}

impl TransitService {
    pub fn new(dispatcher: Dispatcher, stream_buffer: usize) -> Self {
        Self {
            dispatcher,
            stream_buffer: stream_buffer.max(1),
        }
    }
}

#[tonic::async_trait]
impl Transit for TransitService {
    async fn invoke(&self, request: Request<Envelope>) -> Result<Response<Reply>, Status> {
        let packet = decode(request)?.with_id();
        debug!(pattern = %packet.packet.pattern, id = %packet.id, "Unary call");

        // Only the first reply matters; dropping the rest stops the handler.
        let mut replies = self.dispatcher.dispatch(packet);
        let reply = match replies.next().await.map(|reply| reply.into_reply()) {
            Some(ReplyKind::Data(value)) | Some(ReplyKind::Disposed(Some(value))) => {
                encode_reply(&value).map_err(to_status)?
            }
            Some(ReplyKind::Error(err)) => return Err(RpcError::wire_to_status(&err)),
            Some(ReplyKind::Disposed(None)) | None => Reply::default(),
        };

        Ok(Response::new(reply))
    }

    type InvokeStreamStream = ReceiverStream<Result<Reply, Status>>;

    async fn invoke_stream(
        &self,
        request: Request<Envelope>,
    ) -> Result<Response<Self::InvokeStreamStream>, Status> {
        let packet = decode(request)?.with_id();
        let id = packet.id.clone();
        debug!(pattern = %packet.packet.pattern, id = %id, "Streaming call");

        let (tx, rx) = mpsc::channel(self.stream_buffer);
        let mut replies = self.dispatcher.dispatch(packet);

        tokio::spawn(async move {
            while let Some(reply) = replies.next().await {
                let item = match reply.into_reply() {
                    ReplyKind::Data(value) | ReplyKind::Disposed(Some(value)) => {
                        encode_reply(&value).map_err(to_status)
                    }
                    ReplyKind::Error(err) => Err(RpcError::wire_to_status(&err)),
                    ReplyKind::Disposed(None) => break,
                };

                // Waits while the client is not reading. The handler is not polled meanwhile.
                if tx.send(item).await.is_err() {
                    debug!(id = %id, "Client cancelled stream");
                    return;
                }
            }
            debug!(id = %id, "Stream complete");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn emit(&self, request: Request<Envelope>) -> Result<Response<Delivered>, Status> {
        let event = decode(request)?;
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move { dispatcher.dispatch_event(event).await });

        Ok(Response::new(Delivered {}))
    }
}

/// gRPC server exposing the `Transit` service.
pub struct GrpcServer {
    config: GrpcServerConfig,
    dispatcher: Dispatcher,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl GrpcServer {
    pub async fn bind(config: GrpcServerConfig, dispatcher: Dispatcher) -> Result<Self, RpcError> {
        let listener = TcpListener::bind(config.addr.as_str()).await?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            config,
            dispatcher,
            listener: Mutex::new(Some(listener)),
            local_addr,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Server for GrpcServer {
    async fn listen(&self) -> Result<(), RpcError> {
        let Some(listener) = self.listener.lock().await.take() else {
            return Err(RpcError::Connection("server already listening or closed".to_string()));
        };

        let service = TransitService::new(self.dispatcher.clone(), self.config.stream_buffer);
        let shutdown = self.shutdown.clone();

        info!(address = %self.local_addr, "gRPC server starting");
        tonic::transport::Server::builder()
            .add_service(TransitServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown.cancelled().await
            })
            .await?;

        info!(address = %self.local_addr, "gRPC server stopped");
        Ok(())
    }

    async fn close(&self) {
        self.shutdown.cancel();
        self.listener.lock().await.take();
    }
}
