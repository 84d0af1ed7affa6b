use serde_json::Value;

use crate::error::RpcError;
use crate::packet::{ReadPacket, Record};
use crate::pattern::Pattern;
use crate::transit_proto::{Envelope, Reply};

pub fn encode_envelope(packet: &ReadPacket) -> Result<Envelope, RpcError> {
    Ok(Envelope {
        pattern: serde_json::to_string(packet.pattern.value())?,
        data: serde_json::to_vec(&packet.data)?,
    })
}

pub fn decode_envelope(envelope: Envelope) -> Result<ReadPacket, RpcError> {
    let pattern: Value = serde_json::from_str(&envelope.pattern)
        .map_err(|e| RpcError::MalformedFrame(format!("invalid pattern: {e}")))?;
    let data = if envelope.data.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&envelope.data)
            .map_err(|e| RpcError::MalformedFrame(format!("invalid data: {e}")))?
    };

    Ok(ReadPacket::new(Pattern::new(pattern), Record::new(data)))
}

pub fn encode_reply(value: &Value) -> Result<Reply, RpcError> {
    Ok(Reply {
        response: serde_json::to_vec(value)?,
    })
}

/// `None` when the reply carries no value.
pub fn decode_reply(reply: &Reply) -> Result<Option<Value>, RpcError> {
    if reply.response.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&reply.response)?))
}
