use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue};
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use crate::client::{ClientProxy, ClientTransport};
use crate::error::RpcError;
use crate::packet::{Headers, PacketWithId, ReadPacket, Record, WritePacket};
use crate::pattern::Pattern;
use crate::stream::{Cleanup, ReplyStream, ResponseFunnel};
use crate::transit_proto::Envelope;
use crate::transit_proto::transit_client::TransitClient;
use crate::transport::grpc::call::StreamingCall;
use crate::transport::grpc::config::GrpcClientConfig;
use crate::transport::grpc::envelope::{decode_reply, encode_envelope};

/// A call in flight, cancelled through its token.
struct InFlight {
    funnel: ResponseFunnel,
    cancel: CancellationToken,
}

type InFlightMap = DashMap<String, InFlight, ahash::RandomState>;

/// Client transport over the `Transit` gRPC service.
///
/// [`ClientProxy::send`] uses the server-streaming `InvokeStream` method;
/// [`ClientProxy::send_unary`] uses `Invoke`.
pub struct GrpcTransport {
    config: GrpcClientConfig,
    client: Mutex<Option<TransitClient<Channel>>>,
    in_flight: Arc<InFlightMap>,
}

impl GrpcTransport {
    pub fn new(config: GrpcClientConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
            in_flight: Arc::new(DashMap::default()),
        }
    }

    pub fn config(&self) -> &GrpcClientConfig {
        &self.config
    }

    pub fn pending_calls(&self) -> usize {
        self.in_flight.len()
    }

    fn client(&self) -> Result<TransitClient<Channel>, RpcError> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| RpcError::Connection(format!("not connected to {}", self.config.endpoint)))
    }

    fn register(&self, id: &str, funnel: &ResponseFunnel) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.in_flight.insert(
            id.to_string(),
            InFlight {
                funnel: funnel.clone(),
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    /// Call `Invoke`: one reply, wrapped into the same funnel protocol as streaming calls.
    pub async fn publish_unary(
        &self,
        packet: PacketWithId,
        funnel: ResponseFunnel,
    ) -> Result<Cleanup, RpcError> {
        let mut client = self.client()?;
        let request = grpc_request(encode_envelope(&packet.packet)?, &packet.packet.headers);
        let id = packet.id;
        let cancel = self.register(&id, &funnel);

        let in_flight = Arc::clone(&self.in_flight);
        let call_id = id.clone();
        let call_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = call_cancel.cancelled() => {}
                result = client.invoke(request) => {
                    let reply = match result {
                        Ok(response) => decode_reply(response.get_ref()).map(|value| WritePacket {
                            id: Some(call_id.clone()),
                            response: value,
                            is_disposed: true,
                            ..WritePacket::default()
                        }),
                        Err(status) => Err(RpcError::from_status(&status)),
                    };
                    match reply {
                        Ok(reply) => funnel.deliver(reply),
                        Err(err) => funnel.fail(err),
                    };
                }
            }
            in_flight.remove(&call_id);
        });

        let in_flight = Arc::clone(&self.in_flight);
        Ok(Cleanup::new(move || {
            in_flight.remove(&id);
            cancel.cancel();
        }))
    }
}

fn grpc_request(envelope: Envelope, headers: &Headers) -> Request<Envelope> {
    let mut request = Request::new(envelope);
    for (name, value) in headers {
        let key = AsciiMetadataKey::from_bytes(name.to_ascii_lowercase().as_bytes());
        let value = AsciiMetadataValue::try_from(value.as_str());
        match (key, value) {
            (Ok(key), Ok(value)) => {
                request.metadata_mut().insert(key, value);
            }
            _ => warn!(header = %name, "Header is not valid gRPC metadata, skipping"),
        }
    }
    request
}

#[async_trait]
impl ClientTransport for GrpcTransport {
    async fn connect(&self) -> Result<(), RpcError> {
        if self.is_connected() {
            return Ok(());
        }

        let endpoint = Endpoint::from_shared(self.config.endpoint.clone())
            .map_err(|e| RpcError::Connection(format!("invalid endpoint: {e}")))?;
        let channel = self
            .config
            .reconnect
            .run(&self.config.endpoint, || {
                let endpoint = endpoint.clone();
                async move { endpoint.connect().await.map_err(RpcError::from) }
            })
            .await?;

        *self.client.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(TransitClient::new(channel));
        info!(endpoint = %self.config.endpoint, "Connected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    async fn publish(
        &self,
        packet: PacketWithId,
        funnel: ResponseFunnel,
    ) -> Result<Cleanup, RpcError> {
        let mut client = self.client()?;
        let request = grpc_request(encode_envelope(&packet.packet)?, &packet.packet.headers);
        let id = packet.id;
        let cancel = self.register(&id, &funnel);
        let call = Arc::new(Mutex::new(StreamingCall::new()));

        let in_flight = Arc::clone(&self.in_flight);
        let call_id = id.clone();
        let call_cancel = cancel.clone();
        let state = Arc::clone(&call);
        tokio::spawn(async move {
            stream_replies(&mut client, request, &call_id, &funnel, &state, &call_cancel).await;
            in_flight.remove(&call_id);
        });

        let in_flight = Arc::clone(&self.in_flight);
        Ok(Cleanup::new(move || {
            in_flight.remove(&id);
            let issue = call.lock().unwrap_or_else(PoisonError::into_inner).cancel();
            if issue {
                debug!(id = %id, "Cancelling streaming call");
                cancel.cancel();
            }
        }))
    }

    async fn dispatch_event(&self, packet: ReadPacket) -> Result<(), RpcError> {
        let mut client = self.client()?;
        let request = grpc_request(encode_envelope(&packet)?, &packet.headers);
        client
            .emit(request)
            .await
            .map_err(|status| RpcError::from_status(&status))?;
        Ok(())
    }

    async fn close(&self) {
        let Some(_client) = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let ids: Vec<String> = self.in_flight.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, call)) = self.in_flight.remove(&id) {
                call.cancel.cancel();
                call.funnel.fail(RpcError::Closed);
            }
        }
        info!(endpoint = %self.config.endpoint, "Connection closed");
    }
}

/// Drive one `InvokeStream` call, feeding its events through the call state machine.
async fn stream_replies(
    client: &mut TransitClient<Channel>,
    request: Request<Envelope>,
    id: &str,
    funnel: &ResponseFunnel,
    call: &Mutex<StreamingCall>,
    cancel: &CancellationToken,
) {
    let lock = || call.lock().unwrap_or_else(PoisonError::into_inner);
    lock().start();

    let fail = |err: RpcError| {
        if let Some(err) = lock().on_error(err) {
            funnel.fail(err);
        }
    };

    let response = tokio::select! {
        _ = cancel.cancelled() => return,
        response = client.invoke_stream(request) => response,
    };
    let mut replies = match response {
        Ok(response) => response.into_inner(),
        Err(status) => return fail(RpcError::from_status(&status)),
    };

    loop {
        // Dropping `replies` resets the HTTP/2 stream, which cancels the call server-side.
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            message = replies.message() => message,
        };

        match message {
            Ok(Some(reply)) => match decode_reply(&reply) {
                Ok(value) => {
                    if lock().on_data() {
                        funnel.deliver(WritePacket::data(id, value.unwrap_or_default()));
                    }
                }
                Err(err) => return fail(err),
            },
            Ok(None) => {
                if lock().on_end() {
                    funnel.deliver(WritePacket::disposed(id));
                }
                return;
            }
            Err(status) => return fail(RpcError::from_status(&status)),
        }
    }
}

impl ClientProxy<GrpcTransport> {
    /// Send a request through the unary `Invoke` method. Yields at most one value.
    pub fn send_unary<D: Serialize>(&self, pattern: impl Into<Pattern>, data: D) -> ReplyStream {
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(e) => return ReplyStream::failed(e.into()),
        };

        let packet = ReadPacket::new(pattern, Record::new(data)).with_id();
        self.correlate(packet, |transport, packet, funnel| async move {
            transport.publish_unary(packet, funnel).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_become_metadata() {
        let mut headers = Headers::new();
        headers.insert("X-Tenant".to_string(), "acme".to_string());
        headers.insert("bad header".to_string(), "x".to_string());

        let request = grpc_request(Envelope::default(), &headers);
        assert_eq!(request.metadata().get("x-tenant").unwrap().to_str().unwrap(), "acme");
        assert_eq!(request.metadata().len(), 1);
    }

    #[tokio::test]
    async fn test_unconnected_publish_fails() {
        let transport = GrpcTransport::new(GrpcClientConfig::builder().build());
        let (funnel, _rx) = ResponseFunnel::channel();
        let packet = ReadPacket::new("x", Record::default()).with_id();

        assert!(matches!(
            transport.publish(packet, funnel).await,
            Err(RpcError::Connection(_))
        ));
        transport.close().await;
        transport.close().await;
    }
}
