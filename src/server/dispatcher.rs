use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::packet::{InboundPacket, NO_MESSAGE_HANDLER, PacketWithId, ReadPacket, WritePacket};
use crate::server::handler::HandlerKind;
use crate::server::registry::PatternRegistry;

/// The replies produced for one request, in wire order.
pub type ReplyPackets = BoxStream<'static, WritePacket>;

/// Matches decoded packets to registered handlers and turns their output into replies.
///
/// Cheap to clone; every connection or subscription loop holds its own copy.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<PatternRegistry>,
}

impl Dispatcher {
    pub fn new(registry: PatternRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &PatternRegistry {
        &self.registry
    }

    /// Decode one frame body.
    pub fn decode(&self, frame: &[u8]) -> Result<InboundPacket, RpcError> {
        serde_json::from_slice(frame).map_err(|e| RpcError::MalformedFrame(e.to_string()))
    }

    /// Produce the replies for a request.
    ///
    /// An unknown pattern yields a single no-match error. Otherwise every handler value
    /// becomes a data reply and the sequence ends with exactly one disposal reply, unless
    /// the handler fails, in which case its error reply is the last one. Dropping the
    /// returned stream stops consuming the handler's output.
    pub fn dispatch(&self, request: PacketWithId) -> ReplyPackets {
        let PacketWithId { packet, id } = request;
        let key = packet.pattern.key().clone();

        let Some(handler) = self.registry.lookup(&key) else {
            warn!(pattern = %key, id = %id, "No matching message handler");
            let reply = WritePacket::error(id, Value::String(NO_MESSAGE_HANDLER.to_string()));
            return stream::once(async move { reply }).boxed();
        };

        if handler.kind() == HandlerKind::Event {
            warn!(pattern = %key, id = %id, "Request for an event handler, replying with disposal only");
        } else {
            debug!(pattern = %key, id = %id, "Dispatching request");
        }
        let mut output = handler.invoke(packet.data);

        async_stream::stream! {
            let mut failed = false;

            while let Some(item) = output.next().await {
                match item {
                    Ok(value) => yield WritePacket::data(id.clone(), value),
                    Err(err) => {
                        debug!(pattern = %key, id = %id, error = %err, "Handler failed");
                        failed = true;
                        yield WritePacket::error(id.clone(), err.to_wire());
                        break;
                    }
                }
            }

            if !failed {
                yield WritePacket::disposed(id);
            }
        }
        .boxed()
    }

    /// Run an event handler to completion. Events never produce replies.
    pub async fn dispatch_event(&self, event: ReadPacket) {
        let key = event.pattern.key().clone();

        let Some(handler) = self.registry.lookup(&key) else {
            warn!(pattern = %key, "No event handler for pattern, dropping event");
            return;
        };

        if handler.kind() == HandlerKind::Request {
            debug!(pattern = %key, "Event for a request handler, discarding its values");
        } else {
            debug!(pattern = %key, "Dispatching event");
        }
        let mut output = handler.invoke(event.data);
        while let Some(item) = output.next().await {
            if let Err(err) = item {
                warn!(pattern = %key, error = %err, "Event handler failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Record;
    use crate::server::handler::Handler;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(pattern: Value, data: Value) -> PacketWithId {
        ReadPacket::new(pattern, Record::new(data)).with_id()
    }

    async fn replies(dispatcher: &Dispatcher, request: PacketWithId) -> Vec<WritePacket> {
        dispatcher.dispatch(request).collect().await
    }

    #[tokio::test]
    async fn test_sum_example() {
        let mut registry = PatternRegistry::new();
        registry.add_handler(json!({ "cmd": "sum" }), |numbers: Vec<i64>| async move {
            Ok::<_, RpcError>(numbers.into_iter().sum::<i64>())
        });
        let dispatcher = Dispatcher::new(registry);

        let req = request(json!({ "cmd": "sum" }), json!([1, 2, 3, 4, 5]));
        let id = req.id.clone();
        let out = replies(&dispatcher, req).await;

        assert_eq!(out, vec![WritePacket::data(&id, json!(15)), WritePacket::disposed(&id)]);
    }

    #[tokio::test]
    async fn test_handler_invoked_once_with_payload() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let other_calls = Arc::new(AtomicUsize::new(0));

        let mut registry = PatternRegistry::new();
        let sink = Arc::clone(&seen);
        registry.add_handler("target", move |data: Value| {
            sink.lock().unwrap().push(data);
            async { Ok::<_, RpcError>(()) }
        });
        let counter = Arc::clone(&other_calls);
        registry.add_handler("other", move |_: Value| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, RpcError>(()) }
        });
        let dispatcher = Dispatcher::new(registry);

        replies(&dispatcher, request(json!("target"), json!({ "x": 1 }))).await;

        assert_eq!(*seen.lock().unwrap(), vec![json!({ "x": 1 })]);
        assert_eq!(other_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stream_of_n_then_disposal() {
        let mut registry = PatternRegistry::new();
        registry.add_stream_handler("count", |n: u32| {
            stream::iter((0..n).map(Ok::<_, RpcError>))
        });
        let dispatcher = Dispatcher::new(registry);

        let req = request(json!("count"), json!(4));
        let id = req.id.clone();
        let out = replies(&dispatcher, req).await;

        assert_eq!(out.len(), 5);
        for (i, reply) in out.iter().take(4).enumerate() {
            assert_eq!(reply, &WritePacket::data(&id, json!(i)));
        }
        assert_eq!(out[4], WritePacket::disposed(&id));
    }

    #[tokio::test]
    async fn test_zero_values_still_dispose() {
        let mut registry = PatternRegistry::new();
        registry.add_stream_handler("empty", |_: Value| stream::empty::<Result<u8, RpcError>>());
        let dispatcher = Dispatcher::new(registry);

        let req = request(json!("empty"), Value::Null);
        let id = req.id.clone();
        assert_eq!(replies(&dispatcher, req).await, vec![WritePacket::disposed(&id)]);
    }

    #[tokio::test]
    async fn test_failure_is_one_error_without_disposal() {
        let mut registry = PatternRegistry::new();
        registry.add_handler("fail", |_: Value| async {
            Err::<(), _>(RpcError::handler("boom"))
        });
        let dispatcher = Dispatcher::new(registry);

        let req = request(json!("fail"), Value::Null);
        let id = req.id.clone();
        assert_eq!(
            replies(&dispatcher, req).await,
            vec![WritePacket::error(&id, json!("boom"))]
        );
    }

    #[tokio::test]
    async fn test_failure_mid_stream_stops_replies() {
        let mut registry = PatternRegistry::new();
        registry.add_stream_handler("flaky", |_: Value| {
            stream::iter(vec![Ok(1), Err(RpcError::handler("broke")), Ok(3)])
        });
        let dispatcher = Dispatcher::new(registry);

        let req = request(json!("flaky"), Value::Null);
        let id = req.id.clone();
        assert_eq!(
            replies(&dispatcher, req).await,
            vec![WritePacket::data(&id, json!(1)), WritePacket::error(&id, json!("broke"))]
        );
    }

    #[tokio::test]
    async fn test_no_match_yields_one_error() {
        let dispatcher = Dispatcher::new(PatternRegistry::new());

        let req = request(json!({ "cmd": "missing" }), Value::Null);
        let id = req.id.clone();
        assert_eq!(
            replies(&dispatcher, req).await,
            vec![WritePacket::error(&id, json!(NO_MESSAGE_HANDLER))]
        );
    }

    #[tokio::test]
    async fn test_event_runs_handler_without_replies() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = PatternRegistry::new();
        let counter = Arc::clone(&calls);
        registry.add(
            "notify",
            Handler::event(move |_: bool| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            }),
        );
        let dispatcher = Dispatcher::new(registry);

        dispatcher
            .dispatch_event(ReadPacket::new("notify", Record::new(true)))
            .await;
        dispatcher
            .dispatch_event(ReadPacket::new("unknown", Record::new(true)))
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_request_for_event_handler_only_disposes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = PatternRegistry::new();
        let counter = Arc::clone(&calls);
        registry.add_event_handler("notify", move |_: bool| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });
        let dispatcher = Dispatcher::new(registry);
        assert_eq!(
            dispatcher.registry().lookup(&"notify".into()).unwrap().kind(),
            HandlerKind::Event
        );

        let req = request(json!("notify"), json!(true));
        let id = req.id.clone();
        assert_eq!(replies(&dispatcher, req).await, vec![WritePacket::disposed(&id)]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let dispatcher = Dispatcher::new(PatternRegistry::new());
        assert!(matches!(
            dispatcher.decode(b"{not json"),
            Err(RpcError::MalformedFrame(_))
        ));
        assert!(dispatcher.decode(br#"{"pattern":"ok","data":1}"#).is_ok());
    }
}
