//! Subject-addressed NATS transport.
//!
//! Requests go to `{prefix}.{pattern}` with a fresh reply inbox; replies are published to
//! that inbox and also carry the request id. Static headers from the client config are
//! attached to every message, and per-call [`Record`](crate::packet::Record) headers
//! override them key by key.

mod client;
mod config;
mod headers;
mod server;

pub use client::NatsTransport;
pub use config::{NatsClientConfig, NatsServerConfig};
pub use headers::merge_headers;
pub use server::NatsServer;
