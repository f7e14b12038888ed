mod framing;
mod h2;
mod head;
mod message;

pub use framing::{request_body_framing, response_body_framing, should_close_after, BodyFraming};
pub use h2::{
    decode_settings_payload, match_preface, validate_h2c_upgrade, Http2Setting, PrefaceMatch,
    UpgradeError, CLIENT_PREFACE, UPGRADE_HOP_HEADERS,
};
pub use head::{
    parse_authority, parse_request_head, parse_response_head, Authority, HeadParseError,
    HttpRequestHead, HttpResponseHead, HttpVersion,
};
pub use message::{HttpMessage, PropertyValue, PROPERTY_H2_STREAM, PROPERTY_SENDER_CLOSED};
