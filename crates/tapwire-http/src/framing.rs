use crate::head::{HttpRequestHead, HttpResponseHead, HttpVersion};
use crate::message::{HttpMessage, PROPERTY_H2_STREAM, PROPERTY_SENDER_CLOSED};

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

pub fn request_body_framing(request: &HttpRequestHead) -> BodyFraming {
    if request.has_header_token("Transfer-Encoding", "chunked") {
        return BodyFraming::Chunked;
    }
    match request
        .header("Content-Length")
        .and_then(|value| value.trim().parse::<u64>().ok())
    {
        Some(0) | None => BodyFraming::None,
        Some(length) => BodyFraming::ContentLength(length),
    }
}

pub fn response_body_framing(response: &HttpResponseHead) -> BodyFraming {
    if response.is_chunked() {
        return BodyFraming::Chunked;
    }
    match response.content_length() {
        Some(length) => BodyFraming::ContentLength(length),
        None => BodyFraming::CloseDelimited,
    }
}

/// Whether the client connection must be closed once this exchange is
/// written out.
///
/// CONNECT exchanges and HTTP/2 stream messages never force a close
/// here; otherwise either side asking for `Connection: close`, an
/// HTTP/1.0 response without `keep-alive`, a sender-closed annotation
/// without determinable response length, or a non-empty body with no
/// framing all do.
pub fn should_close_after(message: &HttpMessage) -> bool {
    if message.request.is_connect() {
        return false;
    }
    if message.has_property(PROPERTY_H2_STREAM) {
        return false;
    }
    if message.request.has_header_token("Connection", "close") {
        return true;
    }

    let Some(response) = &message.response else {
        return true;
    };
    if response.has_header_token("Connection", "close") {
        return true;
    }
    if response.version == HttpVersion::Http10
        && !response.has_header_token("Connection", "keep-alive")
    {
        return true;
    }
    if message.bool_property(PROPERTY_SENDER_CLOSED) && response.content_length().is_none() {
        return true;
    }
    if !message.response_body.is_empty()
        && response.content_length().is_none()
        && !response.is_chunked()
    {
        return true;
    }

    false
}
