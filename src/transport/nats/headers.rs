use async_nats::HeaderMap;

use crate::packet::Headers;

/// Combine configured headers with per-call headers. Per-call values win.
pub fn merge_headers(configured: &Headers, caller: &Headers) -> Headers {
    let mut merged = configured.clone();
    merged.extend(caller.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

pub fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(name.as_str(), value.as_str());
    }
    map
}

/// Read headers off a message. Only the first value of a repeated header is kept.
pub fn from_header_map(map: &HeaderMap) -> Headers {
    map.iter()
        .filter_map(|(name, values)| {
            values
                .first()
                .map(|value| (name.to_string(), value.as_str().to_string()))
        })
        .collect()
}
