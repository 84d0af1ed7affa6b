use async_trait::async_trait;

use crate::error::RpcError;
use crate::packet::{PacketWithId, ReadPacket};
use crate::stream::{Cleanup, ResponseFunnel};

/// The adapter half of a [`ClientProxy`](crate::client::ClientProxy).
///
/// The proxy owns the call lifecycle; an adapter only knows how to reach the other side
/// and how to route replies back into the funnel of the call they belong to.
#[async_trait]
pub trait ClientTransport: Send + Sync + 'static {
    /// Establish the connection. Calling it while connected does nothing.
    async fn connect(&self) -> Result<(), RpcError>;

    fn is_connected(&self) -> bool;

    /// Send a request and route its correlated replies into `funnel`.
    ///
    /// The returned [`Cleanup`] releases every piece of correlation state for the call
    /// (funnel entry, broker subscription, in-flight RPC). Replies arriving after it ran
    /// are dropped.
    async fn publish(&self, packet: PacketWithId, funnel: ResponseFunnel)
    -> Result<Cleanup, RpcError>;

    /// Send an event. Resolves once the transport has accepted it.
    async fn dispatch_event(&self, packet: ReadPacket) -> Result<(), RpcError>;

    /// Release the connection. Calls still in flight end with [`RpcError::Closed`].
    async fn close(&self);
}
