//! The wire envelope shared by every transport.
//!
//! Requests travel as `{pattern, data, id}`; events omit `id`. Replies travel as
//! `{id, err, response, isDisposed}`. A call receives zero or more data replies followed
//! by exactly one disposal reply, or a single error reply which is itself terminal.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::pattern::Pattern;

/// Error text sent when no handler matches a pattern.
pub const NO_MESSAGE_HANDLER: &str =
    "There is no matching message handler defined in the remote service.";

/// Transport headers attached to an outbound packet.
pub type Headers = BTreeMap<String, String>;

/// A request or event as seen by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadPacket {
    pub pattern: Pattern,
    #[serde(default)]
    pub data: Value,
    /// Headers travel out of band, on transports that support them.
    #[serde(skip)]
    pub headers: Headers,
}

impl ReadPacket {
    pub fn new(pattern: impl Into<Pattern>, record: Record) -> Self {
        Self {
            pattern: pattern.into(),
            data: record.data,
            headers: record.headers,
        }
    }

    /// Assign a fresh correlation id.
    pub fn with_id(self) -> PacketWithId {
        PacketWithId {
            packet: self,
            id: Uuid::new_v4().to_string(),
        }
    }
}

/// A request carrying the correlation id its replies will echo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketWithId {
    #[serde(flatten)]
    pub packet: ReadPacket,
    pub id: String,
}

/// Anything decoded off the wire: a request when `id` is present, an event otherwise.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundPacket {
    #[serde(flatten)]
    pub packet: ReadPacket,
    #[serde(default)]
    pub id: Option<String>,
}

impl InboundPacket {
    pub fn into_request(self) -> Result<PacketWithId, ReadPacket> {
        match self.id {
            Some(id) => Ok(PacketWithId {
                packet: self.packet,
                id,
            }),
            None => Err(self.packet),
        }
    }
}

/// An outbound payload plus optional transport headers.
#[derive(Debug, Clone, Default)]
pub struct Record {
    pub data: Value,
    pub headers: Headers,
}

impl Record {
    pub fn new(data: impl Into<Value>) -> Self {
        Self {
            data: data.into(),
            headers: Headers::new(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// A reply to a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WritePacket {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_disposed: bool,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// What a reply means to the caller waiting on it.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// One value; more may follow.
    Data(Value),
    /// Terminal error.
    Error(Value),
    /// Terminal disposal, optionally carrying a last value.
    Disposed(Option<Value>),
}

impl WritePacket {
    pub fn data(id: impl Into<String>, response: Value) -> Self {
        Self {
            id: Some(id.into()),
            response: Some(response),
            ..Self::default()
        }
    }

    pub fn error(id: impl Into<String>, err: Value) -> Self {
        Self {
            id: Some(id.into()),
            err: Some(err),
            ..Self::default()
        }
    }

    pub fn disposed(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            is_disposed: true,
            ..Self::default()
        }
    }

    /// Whether no further replies follow this one.
    pub fn is_terminal(&self) -> bool {
        self.err.is_some() || self.is_disposed
    }

    pub fn belongs_to(&self, id: &str) -> bool {
        self.id.as_deref() == Some(id)
    }

    pub fn into_reply(self) -> Reply {
        match (self.err, self.is_disposed) {
            (Some(err), _) => Reply::Error(err),
            (None, true) => Reply::Disposed(self.response),
            // A JSON `null` response decodes as an absent one.
            (None, false) => Reply::Data(self.response.unwrap_or(Value::Null)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let packet = ReadPacket::new(json!({ "cmd": "sum" }), Record::new(json!([1, 2, 3])))
            .with_id();
        let wire: Value = serde_json::to_value(&packet).unwrap();
        assert_eq!(wire["pattern"], json!({ "cmd": "sum" }));
        assert_eq!(wire["data"], json!([1, 2, 3]));
        assert_eq!(wire["id"], json!(packet.id));
        assert!(wire.get("headers").is_none());
    }

    #[test]
    fn test_inbound_without_id_is_event() {
        let inbound: InboundPacket =
            serde_json::from_str(r#"{"pattern":"notify","data":true}"#).unwrap();
        let event = inbound.into_request().unwrap_err();
        assert_eq!(event.pattern.key().as_str(), "notify");
        assert_eq!(event.data, json!(true));
    }

    #[test]
    fn test_inbound_with_id_is_request() {
        let inbound: InboundPacket =
            serde_json::from_str(r#"{"pattern":{"cmd":"sum"},"data":[1],"id":"abc"}"#).unwrap();
        let request = inbound.into_request().unwrap();
        assert_eq!(request.id, "abc");
    }

    #[test]
    fn test_missing_data_defaults_to_null() {
        let inbound: InboundPacket = serde_json::from_str(r#"{"pattern":"ping"}"#).unwrap();
        assert_eq!(inbound.packet.data, Value::Null);
    }

    #[test]
    fn test_disposal_wire_shape() {
        let wire = serde_json::to_value(WritePacket::disposed("1")).unwrap();
        assert_eq!(wire, json!({ "id": "1", "isDisposed": true }));
    }

    #[test]
    fn test_reply_classification() {
        assert_eq!(
            WritePacket::data("1", json!(15)).into_reply(),
            Reply::Data(json!(15))
        );
        assert_eq!(
            WritePacket::error("1", json!("boom")).into_reply(),
            Reply::Error(json!("boom"))
        );
        assert_eq!(WritePacket::disposed("1").into_reply(), Reply::Disposed(None));

        let null_reply: WritePacket = serde_json::from_str(r#"{"id":"1","response":null}"#).unwrap();
        assert_eq!(null_reply.into_reply(), Reply::Data(Value::Null));
    }

    #[test]
    fn test_error_is_terminal() {
        assert!(WritePacket::error("1", json!("x")).is_terminal());
        assert!(WritePacket::disposed("1").is_terminal());
        assert!(!WritePacket::data("1", json!(1)).is_terminal());
    }
}
