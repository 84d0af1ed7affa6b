//! Server-side types: handler registration and pattern dispatch.
//!
//! The wiring layer builds a [`PatternRegistry`] by pushing bound handler functions
//! into it, then hands it to a [`Dispatcher`]. Each transport server owns a dispatcher
//! and runs one dispatch loop per connection or per subscription.
//!
//! ```ignore
//! use transit_rpc::server::{Dispatcher, PatternRegistry, Server};
//! use transit_rpc::transport::tcp::{TcpServer, TcpServerConfig};
//!
//! let mut registry = PatternRegistry::new();
//! registry.add_handler(json!({ "cmd": "sum" }), |numbers: Vec<i64>| async move {
//!     Ok::<_, RpcError>(numbers.into_iter().sum::<i64>())
//! });
//!
//! let server = TcpServer::bind(TcpServerConfig::builder().build(), Dispatcher::new(registry)).await?;
//! server.listen().await?;
//! ```

mod dispatcher;
mod error;
mod handler;
mod registry;

use async_trait::async_trait;

use crate::error::RpcError;

pub use dispatcher::{Dispatcher, ReplyPackets};
pub use error::PatternConflict;
pub use handler::{Handler, HandlerKind, HandlerStream};
pub use registry::PatternRegistry;

/// A transport server driving a [`Dispatcher`].
#[async_trait]
pub trait Server: Send + Sync {
    /// Serve until [`close`](Server::close) is called or the transport fails.
    async fn listen(&self) -> Result<(), RpcError>;

    /// Stop serving and release every listener. Calling it again does nothing.
    async fn close(&self);
}
