use bon::Builder;

use crate::client::ReconnectPolicy;

/// Configuration for the gRPC client transport.
#[derive(Debug, Clone, Builder)]
pub struct GrpcClientConfig {
    /// Server URI (e.g., "http://127.0.0.1:50051").
    #[builder(default = "http://127.0.0.1:50051".to_string())]
    pub endpoint: String,

    /// Retry policy for establishing the channel.
    #[builder(default)]
    pub reconnect: ReconnectPolicy,
}

/// Configuration for the gRPC server.
#[derive(Debug, Clone, Builder)]
pub struct GrpcServerConfig {
    /// Address to bind. Port 0 picks a free port.
    #[builder(default = "127.0.0.1:50051".to_string())]
    pub addr: String,

    /// Replies buffered per streaming call before the handler is paused.
    #[builder(default = 16)]
    pub stream_buffer: usize,
}
