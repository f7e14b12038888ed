use std::io;
use std::time::Duration;

use tapwire_http::HeadParseError;
use tapwire_tls::{is_untrusted_by_client, CertificateError};
use thiserror::Error;
use uuid::Uuid;

/// Any failure that ends a connection's pipeline. Every fatal path
/// funnels through [`log_classified`] so each connection is logged and
/// closed exactly once.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("idle read timeout after {0:?}")]
    IdleTimeout(Duration),
    #[error("malformed message head: {0}")]
    MalformedHead(#[from] HeadParseError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(#[from] CertificateError),
    #[error("pass-through upstream connect failed: {0}")]
    UpstreamConnect(String),
    #[error("pipeline failure: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Debug,
    Warn,
    Error,
}

impl PipelineError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::IdleTimeout(_) => Severity::Debug,
            Self::MalformedHead(_) => Severity::Warn,
            // Routine on abrupt peer disconnects.
            Self::Io(_) => Severity::Debug,
            Self::TlsHandshake(detail) => {
                if is_untrusted_by_client(detail) {
                    Severity::Debug
                } else {
                    Severity::Warn
                }
            }
            Self::CertificateGeneration(_) => Severity::Warn,
            Self::UpstreamConnect(_) => Severity::Debug,
            Self::Internal(_) => Severity::Error,
        }
    }
}

pub fn log_classified(connection_id: Uuid, error: &PipelineError) {
    match error.severity() {
        Severity::Debug => {
            tracing::debug!(%connection_id, %error, "closing connection");
        }
        Severity::Warn => {
            tracing::warn!(%connection_id, %error, "closing connection");
        }
        Severity::Error => {
            tracing::error!(%connection_id, %error, "closing connection");
        }
    }
}
