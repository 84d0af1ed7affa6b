use std::collections::HashSet;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::RpcError;
use crate::packet::WritePacket;
use crate::server::{Dispatcher, Server};
use crate::transport::tcp::codec::{FrameCodec, encode_body};
use crate::transport::tcp::config::TcpServerConfig;

/// Length-framed TCP server. Runs one dispatch loop per accepted connection.
pub struct TcpServer {
    config: TcpServerConfig,
    dispatcher: Dispatcher,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl TcpServer {
    /// Bind the listening socket. Connections are accepted once [`Server::listen`] runs.
    pub async fn bind(config: TcpServerConfig, dispatcher: Dispatcher) -> Result<Self, RpcError> {
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
impl Server for TcpServer {
    async fn listen(&self) -> Result<(), RpcError> {
        let Some(listener) = self.listener.lock().await.take() else {
            return Err(RpcError::Connection("server already listening or closed".to_string()));
        };

        info!(addr = %self.local_addr, "TCP server listening");
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Accepted connection");
                        connections.spawn(serve_connection(
                            stream,
                            peer,
                            self.dispatcher.clone(),
                            self.config.max_frame_size,
                        ));
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },

                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        // Stop accepting before tearing down live connections.
        drop(listener);
        connections.shutdown().await;
        info!(addr = %self.local_addr, "TCP server stopped");
        Ok(())
    }

    async fn close(&self) {
        self.shutdown.cancel();
        // Release the socket even if `listen` never ran.
        self.listener.lock().await.take();
    }
}

/// Encode a reply, failing with [`RpcError::FrameTooLarge`] when it exceeds the frame limit.
fn fit_reply(reply: &WritePacket, max_frame_size: usize) -> Result<Bytes, RpcError> {
    let body = encode_body(reply)?;
    if body.len() > max_frame_size {
        return Err(RpcError::FrameTooLarge {
            size: body.len(),
            max: max_frame_size,
        });
    }
    Ok(body)
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Dispatcher,
    max_frame_size: usize,
) {
    let codec = FrameCodec::new(max_frame_size);
    let max_frame_size = codec.max_frame_size();
    let (mut sink, mut frames) = Framed::new(stream, codec).split();
    let (replies, mut outbox) = mpsc::unbounded_channel::<WritePacket>();

    // Replies from concurrent calls are interleaved onto the socket by a single writer.
    let writer = tokio::spawn(async move {
        // Calls whose reply was replaced by an error; their remaining replies are dropped.
        let mut truncated: HashSet<String, ahash::RandomState> = HashSet::default();

        while let Some(reply) = outbox.recv().await {
            let id = reply.id.clone().unwrap_or_default();
            if truncated.contains(&id) {
                if reply.is_terminal() {
                    truncated.remove(&id);
                }
                continue;
            }

            let body = match fit_reply(&reply, max_frame_size) {
                Ok(body) => body,
                Err(e) => {
                    warn!(id = %id, error = %e, "Reply does not fit in a frame, sending error");
                    if !reply.is_terminal() {
                        truncated.insert(id.clone());
                    }
                    let fallback = WritePacket::error(id.clone(), e.to_wire());
                    match fit_reply(&fallback, max_frame_size) {
                        Ok(body) => body,
                        Err(e) => {
                            error!(id = %id, error = %e, "Failed to encode error reply");
                            continue;
                        }
                    }
                }
            };
            if let Err(e) = sink.send(body).await {
                warn!(error = %e, "Failed to write reply");
                break;
            }
        }
    });

    let mut calls = JoinSet::new();

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(frame)) => match dispatcher.decode(&frame) {
                    Ok(inbound) => match inbound.into_request() {
                        Ok(request) => {
                            let dispatcher = dispatcher.clone();
                            let replies = replies.clone();
                            calls.spawn(async move {
                                let mut out = dispatcher.dispatch(request);
                                while let Some(reply) = out.next().await {
                                    if replies.send(reply).is_err() {
                                        break;
                                    }
                                }
                            });
                        }
                        Err(event) => {
                            let dispatcher = dispatcher.clone();
                            calls.spawn(async move { dispatcher.dispatch_event(event).await });
                        }
                    },
                    Err(e) => warn!(peer = %peer, error = %e, "Skipping malformed frame"),
                },
                Some(Err(e)) => {
                    warn!(peer = %peer, error = %e, "Connection read failed");
                    break;
                }
                None => {
                    debug!(peer = %peer, "Connection closed by client");
                    break;
                }
            },

            Some(_) = calls.join_next(), if !calls.is_empty() => {}
        }
    }

    calls.shutdown().await;
    drop(replies);
    let _ = writer.await;
}
