use std::collections::BTreeMap;

use bytes::Bytes;

use crate::head::{HttpRequestHead, HttpResponseHead};

/// Marks a message as carried on an HTTP/2 stream; the value is the
/// stream identifier.
pub const PROPERTY_H2_STREAM: &str = "h2.stream";
/// Set by a sending collaborator when the upstream connection closed
/// while producing the response.
pub const PROPERTY_SENDER_CLOSED: &str = "sender.connection.closed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Bool(bool),
    Number(u64),
    Text(String),
}

/// One request/response exchange, with a string-keyed side channel for
/// cross-handler annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpMessage {
    pub request: HttpRequestHead,
    pub request_body: Bytes,
    pub response: Option<HttpResponseHead>,
    pub response_body: Bytes,
    properties: BTreeMap<String, PropertyValue>,
}

impl HttpMessage {
    pub fn new(request: HttpRequestHead, request_body: Bytes) -> Self {
        Self {
            request,
            request_body,
            response: None,
            response_body: Bytes::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn set_response(&mut self, response: HttpResponseHead) {
        self.response = Some(response);
    }

    pub fn set_response_body(&mut self, body: impl Into<Bytes>) {
        self.response_body = body.into();
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: PropertyValue) {
        self.properties.insert(key.into(), value);
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    pub fn has_property(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    pub fn bool_property(&self, key: &str) -> bool {
        matches!(self.properties.get(key), Some(PropertyValue::Bool(true)))
    }
}
