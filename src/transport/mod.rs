//! Transport adapters.
//!
//! Each adapter pairs a [`ClientTransport`](crate::client::ClientTransport) with a
//! [`Server`](crate::server::Server) that feeds the same wire format into a
//! [`Dispatcher`](crate::server::Dispatcher).

pub mod broker;
pub mod grpc;
pub mod nats;
pub mod tcp;

mod pending;
