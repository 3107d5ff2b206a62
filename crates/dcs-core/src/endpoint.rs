//! Frames of the per-endpoint HTTP bridge side channel.
//!
//! These sockets are not part of the command protocol: the web front-end
//! writes one request-description frame followed by exactly `contentLength`
//! raw body bytes, then reads one response-description frame followed by
//! its body. Requests on one endpoint are strictly serial.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::command::HttpEndpointType;

/// Request description written by the front-end on the side channel, and
/// relayed to the registering connection (with the body inlined) as an
/// `HttpEndpointRequest` push frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestHeader {
    pub method: HttpEndpointType,
    pub path: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub query: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub content_length: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponseHeader {
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub content_length: usize,
}

/// Bridge request pushed over the owning IPC connection. The body travels
/// inline as text; endpoint uploads are G-code and configuration files, so
/// non-UTF-8 bytes are replaced rather than rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpEndpointRequest {
    pub method: HttpEndpointType,
    pub namespace: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub query: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
}

/// Bridge response frame written by the endpoint owner on its IPC
/// connection. Answers are matched to requests in FIFO order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpEndpointResponse {
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
}

/// File name of the dedicated socket for an endpoint tuple, of the form
/// `<namespace>-<method>-<hash>.sock`.
pub fn endpoint_socket_name(method: HttpEndpointType, namespace: &str, path: &str) -> String {
    let mut hash: u32 = 2_166_136_261;
    for byte in namespace
        .bytes()
        .chain([b'/'])
        .chain(path.bytes())
        .chain([b'/'])
        .chain(method.as_str().bytes())
    {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16_777_619);
    }
    format!("{namespace}-{}-{hash:08x}.sock", method.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_names_are_stable_and_distinct_per_tuple() {
        let a = endpoint_socket_name(HttpEndpointType::GET, "fans", "status");
        let b = endpoint_socket_name(HttpEndpointType::POST, "fans", "status");
        let c = endpoint_socket_name(HttpEndpointType::GET, "fans", "status");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert!(a.starts_with("fans-GET-"));
        assert!(a.ends_with(".sock"));
    }

    #[test]
    fn request_header_defaults() {
        let header: HttpRequestHeader =
            serde_json::from_str(r#"{"method":"GET","path":"status"}"#).expect("decode");
        assert_eq!(header.content_length, 0);
        assert!(header.query.is_empty());
    }
}
