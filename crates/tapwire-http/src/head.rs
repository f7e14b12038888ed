use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeadParseError {
    #[error("head bytes were not valid UTF-8")]
    NotUtf8,
    #[error("request line is missing")]
    MissingRequestLine,
    #[error("malformed request line: {0}")]
    MalformedRequestLine(String),
    #[error("malformed status line: {0}")]
    MalformedStatusLine(String),
    #[error("unsupported HTTP version: {0}")]
    UnsupportedVersion(String),
    #[error("malformed header field: {0}")]
    MalformedHeader(String),
    #[error("invalid status code: {0}")]
    InvalidStatusCode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }

    fn parse(text: &str) -> Result<Self, HeadParseError> {
        match text {
            "HTTP/1.0" => Ok(Self::Http10),
            "HTTP/1.1" => Ok(Self::Http11),
            other => Err(HeadParseError::UnsupportedVersion(other.to_string())),
        }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved request target: host plus an always-present port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parses `host`, `host:port`, or `[v6addr]:port`, filling in
/// `default_port` when none is present.
pub fn parse_authority(text: &str, default_port: u16) -> Option<Authority> {
    if text.is_empty() {
        return None;
    }

    if let Some(rest) = text.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        if host.is_empty() {
            return None;
        }
        let port = match after.strip_prefix(':') {
            Some(port_text) => port_text.parse::<u16>().ok()?,
            None if after.is_empty() => default_port,
            None => return None,
        };
        return Some(Authority {
            host: host.to_string(),
            port,
        });
    }

    match text.rsplit_once(':') {
        // A second colon means a bare IPv6 literal, not host:port.
        Some((host, port_text)) if !host.contains(':') => {
            if host.is_empty() {
                return None;
            }
            let port = port_text.parse::<u16>().ok()?;
            Some(Authority {
                host: host.to_string(),
                port,
            })
        }
        Some(_) => Some(Authority {
            host: text.to_string(),
            port: default_port,
        }),
        None => Some(Authority {
            host: text.to_string(),
            port: default_port,
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequestHead {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponseHead {
    pub version: HttpVersion,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

pub fn parse_request_head(raw: &[u8]) -> Result<HttpRequestHead, HeadParseError> {
    let text = std::str::from_utf8(raw).map_err(|_| HeadParseError::NotUtf8)?;
    let mut lines = text.trim_end_matches("\r\n").split("\r\n");
    let request_line = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or(HeadParseError::MissingRequestLine)?;

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| HeadParseError::MalformedRequestLine(request_line.to_string()))?;
    let target = parts
        .next()
        .ok_or_else(|| HeadParseError::MalformedRequestLine(request_line.to_string()))?;
    let version_text = parts
        .next()
        .ok_or_else(|| HeadParseError::MalformedRequestLine(request_line.to_string()))?;
    if parts.next().is_some() {
        return Err(HeadParseError::MalformedRequestLine(
            request_line.to_string(),
        ));
    }

    Ok(HttpRequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: HttpVersion::parse(version_text)?,
        headers: parse_header_lines(lines)?,
    })
}

pub fn parse_response_head(raw: &[u8]) -> Result<HttpResponseHead, HeadParseError> {
    let text = std::str::from_utf8(raw).map_err(|_| HeadParseError::NotUtf8)?;
    let mut lines = text.trim_end_matches("\r\n").split("\r\n");
    let status_line = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| HeadParseError::MalformedStatusLine(String::new()))?;

    let mut parts = status_line.splitn(3, ' ');
    let version_text = parts
        .next()
        .ok_or_else(|| HeadParseError::MalformedStatusLine(status_line.to_string()))?;
    let status_text = parts
        .next()
        .ok_or_else(|| HeadParseError::MalformedStatusLine(status_line.to_string()))?;
    let reason = parts.next().unwrap_or("").to_string();

    let status = status_text
        .parse::<u16>()
        .map_err(|_| HeadParseError::InvalidStatusCode(status_text.to_string()))?;

    Ok(HttpResponseHead {
        version: HttpVersion::parse(version_text)?,
        status,
        reason,
        headers: parse_header_lines(lines)?,
    })
}

fn parse_header_lines<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<Vec<(String, String)>, HeadParseError> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HeadParseError::MalformedHeader(line.to_string()))?;
        if name.is_empty() || name.contains(' ') {
            return Err(HeadParseError::MalformedHeader(line.to_string()));
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header_name, _)| header_name.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn header_values<'a>(headers: &'a [(String, String)], name: &str) -> Vec<&'a str> {
    headers
        .iter()
        .filter(|(header_name, _)| header_name.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
        .collect()
}

fn has_header_token(headers: &[(String, String)], name: &str, token: &str) -> bool {
    header_values(headers, name).iter().any(|value| {
        value
            .split(',')
            .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
    })
}

impl HttpRequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.headers, name)
    }

    pub fn header_values(&self, name: &str) -> Vec<&str> {
        header_values(&self.headers, name)
    }

    pub fn has_header_token(&self, name: &str, token: &str) -> bool {
        has_header_token(&self.headers, name, token)
    }

    pub fn remove_headers(&mut self, name: &str) {
        self.headers
            .retain(|(header_name, _)| !header_name.eq_ignore_ascii_case(name));
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// The request's target authority. CONNECT uses the authority-form
    /// target, absolute-form targets carry their own host and scheme
    /// default, and origin-form requests fall back to the `Host` header
    /// with `default_port`.
    pub fn authority(&self, default_port: u16) -> Option<Authority> {
        if self.is_connect() {
            return parse_authority(&self.target, 443);
        }

        for (scheme, scheme_port) in [("http://", 80), ("https://", 443)] {
            if let Some(rest) = self.target.strip_prefix(scheme) {
                let end = rest.find(['/', '?']).unwrap_or(rest.len());
                return parse_authority(&rest[..end], scheme_port);
            }
        }

        parse_authority(self.header("Host")?, default_port)
    }
}

impl HttpResponseHead {
    pub fn new(version: HttpVersion, status: u16, reason: impl Into<String>) -> Self {
        Self {
            version,
            status,
            reason: reason.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.headers, name)
    }

    pub fn has_header_token(&self, name: &str, token: &str) -> bool {
        has_header_token(&self.headers, name, token)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("Content-Length")
            .and_then(|value| value.trim().parse::<u64>().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.has_header_token("Transfer-Encoding", "chunked")
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(self.version.as_str());
        out.push(' ');
        out.push_str(&self.status.to_string());
        if !self.reason.is_empty() {
            out.push(' ');
            out.push_str(&self.reason);
        }
        out.push_str("\r\n");
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_origin_form_request_head() {
        let head = parse_request_head(b"GET /data HTTP/1.1\r\nHost: example.org\r\n\r\n")
            .expect("request head");
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/data");
        assert_eq!(head.version, HttpVersion::Http11);
        assert_eq!(head.header("host"), Some("example.org"));
    }

    #[test]
    fn rejects_request_line_with_missing_fields() {
        let error = parse_request_head(b"MalformedRequest HTTP/1.1\r\n\r\n").unwrap_err();
        assert!(matches!(error, HeadParseError::MalformedRequestLine(_)));
    }

    #[test]
    fn rejects_unknown_http_version() {
        let error = parse_request_head(b"GET / HTTP/3\r\n\r\n").unwrap_err();
        assert!(matches!(error, HeadParseError::UnsupportedVersion(_)));
    }

    #[test]
    fn connect_authority_defaults_to_port_443() {
        let head = parse_request_head(b"CONNECT example.org HTTP/1.1\r\n\r\n").expect("head");
        let authority = head.authority(80).expect("authority");
        assert_eq!(authority.host, "example.org");
        assert_eq!(authority.port, 443);
    }

    #[test]
    fn absolute_form_authority_uses_scheme_default_port() {
        let head =
            parse_request_head(b"GET http://example.org/index HTTP/1.1\r\n\r\n").expect("head");
        let authority = head.authority(8080).expect("authority");
        assert_eq!(authority.host, "example.org");
        assert_eq!(authority.port, 80);
    }

    #[test]
    fn origin_form_authority_comes_from_host_header() {
        let head = parse_request_head(b"GET / HTTP/1.1\r\nHost: 127.0.0.1:8080\r\n\r\n")
            .expect("head");
        let authority = head.authority(80).expect("authority");
        assert_eq!(authority.host, "127.0.0.1");
        assert_eq!(authority.port, 8080);
    }

    #[test]
    fn parses_bracketed_ipv6_authority() {
        let authority = parse_authority("[::1]:8443", 80).expect("authority");
        assert_eq!(authority.host, "::1");
        assert_eq!(authority.port, 8443);
    }

    #[test]
    fn bare_ipv6_literal_keeps_default_port() {
        let authority = parse_authority("2001:db8::1", 443).expect("authority");
        assert_eq!(authority.host, "2001:db8::1");
        assert_eq!(authority.port, 443);
    }

    #[test]
    fn response_head_serializes_status_zero_without_reason() {
        let head = HttpResponseHead::new(HttpVersion::Http10, 0, "");
        assert_eq!(head.to_bytes(), b"HTTP/1.0 0\r\n\r\n");
    }

    #[test]
    fn response_head_round_trips_reason_and_headers() {
        let head = parse_response_head(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n")
            .expect("response head");
        assert_eq!(head.status, 200);
        assert_eq!(head.reason, "OK");
        assert!(head.has_header_token("Connection", "close"));
        assert_eq!(head.to_bytes(), b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n");
    }

    #[test]
    fn header_token_matching_is_case_insensitive_and_list_aware() {
        let head = parse_response_head(
            b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade, HTTP2-Settings\r\n\r\n",
        )
        .expect("response head");
        assert!(head.has_header_token("connection", "upgrade"));
        assert!(head.has_header_token("Connection", "http2-settings"));
        assert!(!head.has_header_token("Connection", "close"));
    }
}
