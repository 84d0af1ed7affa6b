//! The cancelable multi-value sequence used for every call, on every transport.
//!
//! An adapter receives a [`ResponseFunnel`] when a call is published and pushes raw
//! reply packets into it. The proxy turns the other end into a [`ReplyStream`] of
//! values. Dropping the stream before disposal runs the adapter's [`Cleanup`].

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::RpcError;
use crate::packet::{Reply, WritePacket};

pub type FunnelItem = Result<WritePacket, RpcError>;

/// The adapter-facing end of a call.
#[derive(Clone)]
pub struct ResponseFunnel {
    tx: mpsc::UnboundedSender<FunnelItem>,
}

impl ResponseFunnel {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FunnelItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver a reply. Returns `false` once the caller has gone away.
    pub fn deliver(&self, reply: WritePacket) -> bool {
        self.tx.send(Ok(reply)).is_ok()
    }

    /// Terminate the call with a transport-level error.
    pub fn fail(&self, err: RpcError) -> bool {
        self.tx.send(Err(err)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for ResponseFunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFunnel")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Releases the correlation state of one call. Runs at most once, at the latest on drop.
pub struct Cleanup(Option<Box<dyn FnOnce() + Send>>);

impl Cleanup {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub fn noop() -> Self {
        Self(None)
    }

    pub fn run(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Cleanup").field(&self.0.is_some()).finish()
    }
}

/// A lazy, cancelable sequence of reply values.
///
/// Nothing is sent until the stream is first polled. Dropping it cancels the call.
pub struct ReplyStream {
    inner: BoxStream<'static, Result<Value, RpcError>>,
}

impl ReplyStream {
    pub fn new(stream: impl Stream<Item = Result<Value, RpcError>> + Send + 'static) -> Self {
        Self {
            inner: stream.boxed(),
        }
    }

    /// A stream that yields `err` and ends.
    pub fn failed(err: RpcError) -> Self {
        Self::new(futures::stream::once(async move { Err(err) }))
    }

    /// Resolve to the first value and cancel the rest of the call.
    pub async fn first(mut self) -> Result<Value, RpcError> {
        match self.inner.next().await {
            Some(result) => result,
            None => Err(RpcError::NoReply),
        }
    }

    /// Collect every value until disposal.
    pub async fn collect_all(mut self) -> Result<Vec<Value>, RpcError> {
        let mut values = Vec::new();
        while let Some(value) = self.inner.next().await {
            values.push(value?);
        }
        Ok(values)
    }
}

impl Stream for ReplyStream {
    type Item = Result<Value, RpcError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl fmt::Debug for ReplyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReplyStream")
    }
}

/// Map the raw replies of one call into values, holding `cleanup` until the call ends.
pub(crate) fn drain_funnel(
    mut rx: mpsc::UnboundedReceiver<FunnelItem>,
    cleanup: Cleanup,
) -> impl Stream<Item = Result<Value, RpcError>> + Send + 'static {
    async_stream::stream! {
        let _cleanup = cleanup;
        let mut finished = false;

        while let Some(item) = rx.recv().await {
            match item.map(WritePacket::into_reply) {
                Ok(Reply::Data(value)) => yield Ok(value),
                Ok(Reply::Disposed(last)) => {
                    if let Some(value) = last {
                        yield Ok(value);
                    }
                    finished = true;
                    break;
                }
                Ok(Reply::Error(err)) => {
                    finished = true;
                    yield Err(RpcError::from_wire(err));
                    break;
                }
                Err(err) => {
                    finished = true;
                    yield Err(err);
                    break;
                }
            }
        }

        if !finished {
            yield Err(RpcError::Connection("reply channel closed before disposal".to_string()));
        }
    }
}
