//! Length-framed socket transport.
//!
//! One duplex TCP connection per client carries every concurrent call. Each frame is a
//! 4-byte big-endian length followed by a UTF-8 JSON packet; replies are matched to
//! calls by their `id`.

mod client;
mod codec;
mod config;
mod server;

pub use client::TcpTransport;
pub use codec::{DEFAULT_MAX_FRAME_SIZE, FrameCodec, LENGTH_PREFIX_SIZE};
pub use config::{TcpClientConfig, TcpServerConfig};
pub use server::TcpServer;
