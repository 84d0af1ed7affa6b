//! gRPC transport built on the `Transit` service in `proto/transit.proto`.
//!
//! Patterns and payloads travel as JSON inside the protobuf envelope. Requests use the
//! server-streaming `InvokeStream` method: each reply value is one stream message and
//! the end of the stream is the disposal signal. The server writes replies through a
//! bounded channel, so a slow reader pauses the handler instead of buffering without
//! limit. A handler error ends the call with a status carrying the error value.

mod call;
mod client;
mod config;
mod envelope;
mod server;

pub use call::{CallState, StreamingCall};
pub use client::GrpcTransport;
pub use config::{GrpcClientConfig, GrpcServerConfig};
pub use server::{GrpcServer, TransitService};
