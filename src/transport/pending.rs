//! Calls awaiting replies on a per-call subscription (broker response channel, NATS inbox).

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::packet::WritePacket;
use crate::stream::{Cleanup, ResponseFunnel};

struct PendingCall {
    funnel: ResponseFunnel,
    reader: AbortHandle,
}

/// In-flight calls, each with a task reading its reply subscription.
#[derive(Clone, Default)]
pub(crate) struct PendingCalls {
    calls: Arc<DashMap<String, PendingCall, ahash::RandomState>>,
}

impl PendingCalls {
    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }

    /// Route replies carrying `id` from `replies` into `funnel` until a terminal one arrives.
    ///
    /// The returned cleanup aborts the reader, which drops the subscription.
    pub(crate) fn track(
        &self,
        id: String,
        funnel: ResponseFunnel,
        mut replies: BoxStream<'static, Bytes>,
    ) -> Cleanup {
        let reader_funnel = funnel.clone();
        let reader_id = id.clone();
        let calls = self.clone();

        let reader = tokio::spawn(async move {
            let mut finished = false;

            while let Some(payload) = replies.next().await {
                let reply: WritePacket = match serde_json::from_slice(&payload) {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(id = %reader_id, error = %e, "Malformed reply, skipping");
                        continue;
                    }
                };

                if !reply.belongs_to(&reader_id) {
                    debug!(id = %reader_id, "Reply for another call, dropping");
                    continue;
                }

                let terminal = reply.is_terminal();
                if !reader_funnel.deliver(reply) || terminal {
                    finished = true;
                    break;
                }
            }

            if !finished {
                reader_funnel.fail(RpcError::Connection("reply subscription ended".to_string()));
            }
            calls.calls.remove(&reader_id);
        });

        self.calls.insert(
            id.clone(),
            PendingCall {
                funnel,
                reader: reader.abort_handle(),
            },
        );

        let calls = self.clone();
        Cleanup::new(move || calls.release(&id))
    }

    pub(crate) fn release(&self, id: &str) {
        if let Some((_, call)) = self.calls.remove(id) {
            call.reader.abort();
        }
    }

    /// Abort every reader and end each call with `err`.
    pub(crate) fn fail_all(&self, err: impl Fn() -> RpcError) {
        let ids: Vec<String> = self.calls.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, call)) = self.calls.remove(&id) {
                call.reader.abort();
                call.funnel.fail(err());
            }
        }
    }
}
