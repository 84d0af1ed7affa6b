use std::collections::HashMap;
use std::future::Future;

use futures::Stream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::error::RpcError;
use crate::pattern::{Pattern, PatternKey};
use crate::server::error::PatternConflict;
use crate::server::handler::Handler;

/// Canonical pattern key to handler map, owned by one server instance.
#[derive(Debug, Clone, Default)]
pub struct PatternRegistry {
    handlers: HashMap<PatternKey, Handler, ahash::RandomState>,
}

impl PatternRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `pattern`.
    ///
    /// A second registration under the same canonical key replaces the first.
    pub fn add(&mut self, pattern: impl Into<Pattern>, handler: Handler) {
        let pattern = pattern.into();
        let key = pattern.key().clone();

        if self.handlers.insert(key.clone(), handler).is_some() {
            warn!(pattern = %key, "Replaced existing handler for pattern");
        } else {
            info!(pattern = %key, "Registered handler");
        }
    }

    /// Register `handler` under `pattern`, refusing to replace an existing one.
    pub fn try_add(
        &mut self,
        pattern: impl Into<Pattern>,
        handler: Handler,
    ) -> Result<(), PatternConflict> {
        let pattern = pattern.into();
        if self.handlers.contains_key(pattern.key()) {
            return Err(PatternConflict {
                pattern: pattern.key().clone(),
            });
        }
        self.add(pattern, handler);
        Ok(())
    }

    pub fn add_handler<Req, Resp, F, Fut>(&mut self, pattern: impl Into<Pattern>, f: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    {
        self.add(pattern, Handler::unary(f));
    }

    pub fn add_stream_handler<Req, Resp, F, S>(&mut self, pattern: impl Into<Pattern>, f: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Resp, RpcError>> + Send + 'static,
    {
        self.add(pattern, Handler::stream(f));
    }

    pub fn add_event_handler<Req, F, Fut>(&mut self, pattern: impl Into<Pattern>, f: F)
    where
        Req: DeserializeOwned + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        self.add(pattern, Handler::event(f));
    }

    pub fn lookup(&self, key: &PatternKey) -> Option<&Handler> {
        self.handlers.get(key)
    }

    /// Every registered pattern and its handler.
    pub fn handlers(&self) -> &HashMap<PatternKey, Handler, ahash::RandomState> {
        &self.handlers
    }

    pub fn patterns(&self) -> impl Iterator<Item = &PatternKey> {
        self.handlers.keys()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::{Value, json};

    fn constant(value: i64) -> Handler {
        Handler::unary(move |_: Value| async move { Ok::<_, RpcError>(value) })
    }

    async fn call(registry: &PatternRegistry, pattern: Value) -> Option<Value> {
        let handler = registry.lookup(Pattern::new(pattern).key())?;
        handler.invoke(Value::Null).next().await?.ok()
    }

    #[tokio::test]
    async fn test_lookup_is_order_insensitive() {
        let mut registry = PatternRegistry::new();
        registry.add(json!({ "a": 1, "b": 2 }), constant(1));

        assert_eq!(call(&registry, json!({ "b": 2, "a": 1 })).await, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_unknown_key_misses() {
        let mut registry = PatternRegistry::new();
        registry.add("known", constant(1));
        assert!(registry.lookup(Pattern::from("unknown").key()).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_overwrites() {
        let mut registry = PatternRegistry::new();
        registry.add("dup", constant(1));
        registry.add("dup", constant(2));

        assert_eq!(registry.len(), 1);
        assert_eq!(call(&registry, json!("dup")).await, Some(json!(2)));
    }

    #[test]
    fn test_try_add_rejects_duplicates() {
        let mut registry = PatternRegistry::new();
        registry.try_add("dup", constant(1)).unwrap();

        let err = registry.try_add("dup", constant(2)).unwrap_err();
        assert_eq!(err.pattern.as_str(), "dup");
    }

    #[test]
    fn test_registries_are_independent() {
        let mut first = PatternRegistry::new();
        let second = PatternRegistry::new();
        first.add("only-here", constant(1));

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }
}
