use bon::Builder;

use crate::client::ReconnectPolicy;
use crate::packet::Headers;
use crate::pattern::PatternKey;

/// Configuration for the NATS client transport.
#[derive(Debug, Clone, Builder)]
pub struct NatsClientConfig {
    /// Comma-separated server addresses.
    #[builder(default = "nats://127.0.0.1:4222".to_string())]
    pub servers: String,

    /// Prefix prepended to every subject as `{prefix}.{pattern}`.
    /// No prefix is applied if not specified.
    pub subject_prefix: Option<String>,

    /// Headers attached to every request and event. Per-call headers win on conflicts.
    #[builder(default)]
    pub headers: Headers,

    /// Retry policy for the initial connection.
    #[builder(default)]
    pub reconnect: ReconnectPolicy,
}

impl NatsClientConfig {
    /// Subject a pattern is published on.
    pub fn subject(&self, key: &PatternKey) -> String {
        subject_for(self.subject_prefix.as_deref(), key)
    }
}

/// Configuration for the NATS server.
#[derive(Debug, Clone, Builder)]
pub struct NatsServerConfig {
    /// Comma-separated server addresses.
    #[builder(default = "nats://127.0.0.1:4222".to_string())]
    pub servers: String,

    /// Prefix prepended to every subject as `{prefix}.{pattern}`.
    pub subject_prefix: Option<String>,

    /// Queue group shared by server instances, so each request is served once.
    pub queue_group: Option<String>,
}

impl NatsServerConfig {
    /// Subject a pattern is served on.
    pub fn subject(&self, key: &PatternKey) -> String {
        subject_for(self.subject_prefix.as_deref(), key)
    }
}

fn subject_for(prefix: Option<&str>, key: &PatternKey) -> String {
    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}.{key}"),
        _ => key.to_string(),
    }
}
