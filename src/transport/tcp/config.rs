use bon::Builder;

use crate::client::ReconnectPolicy;
use crate::transport::tcp::codec::DEFAULT_MAX_FRAME_SIZE;

/// Configuration for the TCP client transport.
#[derive(Debug, Clone, Builder)]
pub struct TcpClientConfig {
    /// Server address (e.g., "127.0.0.1:3000").
    #[builder(default = "127.0.0.1:3000".to_string())]
    pub addr: String,

    /// Largest frame body accepted or sent.
    #[builder(default = DEFAULT_MAX_FRAME_SIZE)]
    pub max_frame_size: usize,

    /// Retry policy for establishing the socket.
    #[builder(default)]
    pub reconnect: ReconnectPolicy,
}

/// Configuration for the TCP server.
#[derive(Debug, Clone, Builder)]
pub struct TcpServerConfig {
    /// Address to bind. Port 0 picks a free port.
    #[builder(default = "127.0.0.1:3000".to_string())]
    pub addr: String,

    /// Largest frame body accepted or sent.
    #[builder(default = DEFAULT_MAX_FRAME_SIZE)]
    pub max_frame_size: usize,
}
