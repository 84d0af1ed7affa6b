//! Client-side types for transit-rpc.
//!
//! A [`ClientProxy`] wraps one [`ClientTransport`] adapter and turns pattern + payload
//! calls into cold, cancelable [`ReplyStream`](crate::stream::ReplyStream)s.
//!
//! # Example
//!
//! ```ignore
//! use futures::StreamExt;
//! use transit_rpc::client::ClientProxy;
//! use transit_rpc::transport::tcp::{TcpClientConfig, TcpTransport};
//!
//! let config = TcpClientConfig::builder().addr("127.0.0.1:3000".to_string()).build();
//! let client = ClientProxy::new(TcpTransport::new(config));
//!
//! let mut replies = client.send(json!({ "cmd": "count" }), 3);
//! while let Some(value) = replies.next().await {
//!     println!("{}", value?);
//! }
//! ```

mod proxy;
mod reconnect;
mod transport;

pub use proxy::ClientProxy;
pub use reconnect::ReconnectPolicy;
pub use transport::ClientTransport;
