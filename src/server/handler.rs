use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::{FutureExt, Stream, StreamExt, TryStreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::RpcError;

/// The normalized output of a handler: zero or more values, or an error.
pub type HandlerStream = BoxStream<'static, Result<Value, RpcError>>;

type ErasedHandler = dyn Fn(Value) -> HandlerStream + Send + Sync;

/// Whether a handler answers requests or only consumes events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Request,
    Event,
}

/// A bound handler function, as supplied by the wiring layer.
///
/// Every flavor is erased to `payload -> HandlerStream`, so the dispatcher only ever
/// deals with one shape regardless of whether the handler returned a single value,
/// a future, or a lazy sequence.
#[derive(Clone)]
pub struct Handler {
    kind: HandlerKind,
    call: Arc<ErasedHandler>,
}

impl Handler {
    /// Wrap an already-erased handler function.
    pub fn from_fn<F>(kind: HandlerKind, f: F) -> Self
    where
        F: Fn(Value) -> HandlerStream + Send + Sync + 'static,
    {
        Self {
            kind,
            call: Arc::new(f),
        }
    }

    /// A request handler producing exactly one value.
    pub fn unary<Req, Resp, F, Fut>(f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    {
        Self::from_fn(HandlerKind::Request, move |data| match decode::<Req>(data) {
            Ok(req) => f(req)
                .map(|result| result.and_then(encode))
                .into_stream()
                .boxed(),
            Err(err) => stream::once(async move { Err::<Value, _>(err) }).boxed(),
        })
    }

    /// A request handler producing a lazy, possibly infinite, sequence of values.
    pub fn stream<Req, Resp, F, S>(f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Resp, RpcError>> + Send + 'static,
    {
        Self::from_fn(HandlerKind::Request, move |data| match decode::<Req>(data) {
            Ok(req) => f(req).and_then(|resp| async move { encode(resp) }).boxed(),
            Err(err) => stream::once(async move { Err::<Value, _>(err) }).boxed(),
        })
    }

    /// An event handler. It produces no values; only its errors are observable.
    pub fn event<Req, F, Fut>(f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        Self::from_fn(HandlerKind::Event, move |data| match decode::<Req>(data) {
            Ok(req) => f(req)
                .into_stream()
                .filter_map(|result| async move { result.err().map(Err::<Value, RpcError>) })
                .boxed(),
            Err(err) => stream::once(async move { Err::<Value, _>(err) }).boxed(),
        })
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    /// Invoke the handler. Nothing runs until the returned stream is polled.
    pub fn invoke(&self, data: Value) -> HandlerStream {
        (self.call)(data)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler").field("kind", &self.kind).finish()
    }
}

fn decode<Req: DeserializeOwned>(data: Value) -> Result<Req, RpcError> {
    serde_json::from_value(data)
        .map_err(|e| RpcError::handler(format!("invalid payload: {e}")))
}

fn encode<Resp: Serialize>(resp: Resp) -> Result<Value, RpcError> {
    serde_json::to_value(resp).map_err(RpcError::from)
}
