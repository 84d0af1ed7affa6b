//! # transit-rpc
//!
//! Transport-agnostic request/response and event messaging addressed by patterns.
//!
//! Application code registers handlers under structural patterns (`"notify"`,
//! `{"cmd": "sum"}`) on the server side and calls them through a [`ClientProxy`]
//! without knowing which wire protocol carries the call. Four transports are provided:
//!
//! - [`transport::tcp`]: length-prefixed JSON frames over one duplex socket.
//! - [`transport::broker`]: a publish/subscribe broker with derived reply channels.
//! - [`transport::nats`]: subject-addressed NATS requests with reply inboxes and headers.
//! - [`transport::grpc`]: a tonic service with unary and server-streaming calls.
//!
//! Every call yields a [`ReplyStream`]: zero or more values ended by a disposal signal,
//! or a single terminal error.

pub mod client;
pub mod error;
pub mod packet;
pub mod pattern;
pub mod server;
pub mod stream;
pub mod transport;

pub mod transit_proto {
    include!(concat!(env!("OUT_DIR"), "/transit.rs"));
}

pub use client::{ClientProxy, ClientTransport, ReconnectPolicy};
pub use error::RpcError;
pub use packet::{Headers, NO_MESSAGE_HANDLER, PacketWithId, ReadPacket, Record, WritePacket};
pub use pattern::{Pattern, PatternKey};
pub use server::{Dispatcher, Handler, PatternRegistry, Server};
pub use stream::{Cleanup, ReplyStream, ResponseFunnel};
