use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use thiserror::Error;

use crate::head::HttpRequestHead;

/// The fixed client connection preface that opens a cleartext HTTP/2
/// connection.
pub const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Hop-by-hop headers that become obsolete once an h2c upgrade is
/// accepted.
pub const UPGRADE_HOP_HEADERS: [&str; 4] = [
    "Connection",
    "Proxy-Connection",
    "Upgrade",
    "HTTP2-Settings",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefaceMatch {
    NeedMoreBytes,
    Matched,
    Mismatch,
}

/// Compares buffered bytes against the client preface as they arrive;
/// a mismatch at any position is final.
pub fn match_preface(bytes: &[u8]) -> PrefaceMatch {
    let compared = bytes.len().min(CLIENT_PREFACE.len());
    if bytes[..compared] != CLIENT_PREFACE[..compared] {
        return PrefaceMatch::Mismatch;
    }
    if bytes.len() >= CLIENT_PREFACE.len() {
        return PrefaceMatch::Matched;
    }
    PrefaceMatch::NeedMoreBytes
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http2Setting {
    pub identifier: u16,
    pub value: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpgradeError {
    #[error("request does not upgrade to h2c")]
    NotAnUpgrade,
    #[error("Connection header must name exactly Upgrade and HTTP2-Settings")]
    ConnectionHeaderMismatch,
    #[error("expected exactly one HTTP2-Settings header, found {0}")]
    SettingsHeaderCount(usize),
    #[error("HTTP2-Settings payload is not valid base64url")]
    SettingsNotBase64,
    #[error("HTTP2-Settings payload length {0} is not a multiple of six")]
    SettingsLength(usize),
}

/// Decodes a base64url `HTTP2-Settings` payload into (identifier, value)
/// pairs.
pub fn decode_settings_payload(payload: &str) -> Result<Vec<Http2Setting>, UpgradeError> {
    let decoded = URL_SAFE_NO_PAD
        .decode(payload.trim())
        .map_err(|_| UpgradeError::SettingsNotBase64)?;
    if decoded.len() % 6 != 0 {
        return Err(UpgradeError::SettingsLength(decoded.len()));
    }

    let settings = decoded
        .chunks_exact(6)
        .map(|chunk| Http2Setting {
            identifier: u16::from_be_bytes([chunk[0], chunk[1]]),
            value: u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]),
        })
        .collect();
    Ok(settings)
}

/// Validates an `Upgrade: h2c` request and returns the decoded settings.
///
/// The `Connection` header must list exactly `Upgrade` and
/// `HTTP2-Settings`, in either order, and exactly one `HTTP2-Settings`
/// header must be present. Any failure means the request is handled as
/// plain HTTP/1.1.
pub fn validate_h2c_upgrade(request: &HttpRequestHead) -> Result<Vec<Http2Setting>, UpgradeError> {
    if !request.has_header_token("Upgrade", "h2c") {
        return Err(UpgradeError::NotAnUpgrade);
    }

    let mut connection_tokens: Vec<String> = request
        .header_values("Connection")
        .iter()
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();
    connection_tokens.sort();
    if connection_tokens != ["http2-settings", "upgrade"] {
        return Err(UpgradeError::ConnectionHeaderMismatch);
    }

    let settings_headers = request.header_values("HTTP2-Settings");
    if settings_headers.len() != 1 {
        return Err(UpgradeError::SettingsHeaderCount(settings_headers.len()));
    }

    decode_settings_payload(settings_headers[0])
}
