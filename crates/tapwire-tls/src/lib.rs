use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bytes of a TLS record header needed before the sniffer can decide.
pub const MIN_SNIFF_BYTES: usize = 5;

pub const APPLICATION_PROTOCOL_HTTP_1_1: &str = "http/1.1";
pub const APPLICATION_PROTOCOL_HTTP_2: &str = "h2";

const MAX_TLS_RECORD_LEN: usize = 16 * 1024 + 2048;

/// Classifies the leading bytes of a connection as the start of a TLS
/// exchange. Returns `None` while fewer than [`MIN_SNIFF_BYTES`] are
/// buffered; the decision is final once made.
pub fn is_tls_handshake(bytes: &[u8]) -> Option<bool> {
    if bytes.len() < MIN_SNIFF_BYTES {
        return None;
    }

    // TLS record layer: content type 20-23, major version 3, non-empty
    // record no longer than a maximum-size ciphertext.
    let record_len = usize::from(u16::from_be_bytes([bytes[3], bytes[4]]));
    if (20..=23).contains(&bytes[0])
        && bytes[1] == 3
        && bytes[2] <= 4
        && record_len > 0
        && record_len <= MAX_TLS_RECORD_LEN
    {
        return Some(true);
    }

    // SSLv2-framed ClientHello, still sent by some legacy stacks.
    if bytes[0] & 0x80 != 0 && bytes[2] == 1 {
        return Some(true);
    }

    Some(false)
}

/// Keyword check for handshake failures caused by the client not
/// trusting the proxy's root certificate, a routine and non-actionable
/// condition.
pub fn is_untrusted_by_client(detail: &str) -> bool {
    let lower = detail.to_ascii_lowercase();
    [
        "unknown ca",
        "unknown_ca",
        "unknown issuer",
        "unknownissuer",
        "bad certificate",
        "certificate unknown",
        "self signed",
        "self-signed",
        "unknown authority",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tls12 => "TLSv1.2",
            Self::Tls13 => "TLSv1.3",
        }
    }

    fn as_rustls(self) -> &'static rustls::SupportedProtocolVersion {
        match self {
            Self::Tls12 => &rustls::version::TLS12,
            Self::Tls13 => &rustls::version::TLS13,
        }
    }
}

/// Immutable TLS termination settings carried by every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub protocol_versions: Vec<TlsVersion>,
    pub alpn_enabled: bool,
    pub application_protocols: Vec<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            protocol_versions: vec![TlsVersion::Tls13, TlsVersion::Tls12],
            alpn_enabled: false,
            application_protocols: Vec::new(),
        }
    }
}

impl TlsConfig {
    pub fn validate(&self) -> Result<(), CertificateError> {
        if self.protocol_versions.is_empty() {
            return Err(CertificateError::InvalidConfiguration(
                "protocol_versions must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
    #[error("TLS config build failed: {0}")]
    ConfigBuild(#[from] rustls::Error),
    #[error("invalid TLS configuration: {0}")]
    InvalidConfiguration(String),
    #[error("certificate cache lock poisoned")]
    LockPoisoned,
}

/// Certificate chain and private key for one server name.
#[derive(Debug)]
pub struct CertificateMaterial {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// Issues certificate material for a server name announced via SNI, or
/// for the fallback authority when the client did not announce one.
pub trait CertificateService: Send + Sync {
    fn certificate_for(
        &self,
        local_addr: SocketAddr,
        authority: &str,
    ) -> Result<CertificateMaterial, CertificateError>;
}

/// Builds the rustls server config for a terminating handshake,
/// restricted to the connection's enabled protocol versions and, when
/// ALPN is enabled, offering its application protocols.
pub fn build_server_config(
    material: CertificateMaterial,
    config: &TlsConfig,
) -> Result<Arc<ServerConfig>, CertificateError> {
    config.validate()?;
    let versions: Vec<&'static rustls::SupportedProtocolVersion> = config
        .protocol_versions
        .iter()
        .map(|version| version.as_rustls())
        .collect();

    let mut server_config = ServerConfig::builder_with_protocol_versions(&versions)
        .with_no_client_auth()
        .with_single_cert(material.cert_chain, material.key)?;
    if config.alpn_enabled {
        server_config.alpn_protocols = config
            .application_protocols
            .iter()
            .map(|protocol| protocol.as_bytes().to_vec())
            .collect();
    }
    Ok(Arc::new(server_config))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaConfig {
    pub common_name: String,
    pub organization: String,
    pub leaf_cache_capacity: usize,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            common_name: "tapwire Local CA".to_string(),
            organization: "tapwire".to_string(),
            leaf_cache_capacity: 1024,
        }
    }
}

struct CachedLeaf {
    cert_chain: Vec<CertificateDer<'static>>,
    key_der: Vec<u8>,
}

struct LeafCache {
    leaves: HashMap<String, CachedLeaf>,
    lru: VecDeque<String>,
}

/// In-memory certificate authority that signs leaf certificates on
/// demand, with a bounded per-host cache.
pub struct LocalCertificateAuthority {
    config: CaConfig,
    issuer: Issuer<'static, KeyPair>,
    ca_cert_der: CertificateDer<'static>,
    ca_cert_pem: String,
    cache: Mutex<LeafCache>,
}

impl LocalCertificateAuthority {
    pub fn new(config: CaConfig) -> Result<Self, CertificateError> {
        let ca_key = KeyPair::generate()?;
        let ca_params = build_ca_params(&config);
        let ca_cert = ca_params.self_signed(&ca_key)?;
        let ca_cert_pem = ca_cert.pem();
        let ca_cert_der = ca_cert.der().clone();
        let issuer = Issuer::new(ca_params, ca_key);

        Ok(Self {
            config,
            issuer,
            ca_cert_der,
            ca_cert_pem,
            cache: Mutex::new(LeafCache {
                leaves: HashMap::new(),
                lru: VecDeque::new(),
            }),
        })
    }

    pub fn ca_certificate_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    pub fn ca_certificate_der(&self) -> &CertificateDer<'static> {
        &self.ca_cert_der
    }

    fn issue_leaf(&self, host: &str) -> Result<CachedLeaf, CertificateError> {
        let leaf_params = build_leaf_params(host)?;
        let leaf_key = KeyPair::generate()?;
        let leaf_cert = leaf_params.signed_by(&leaf_key, &self.issuer)?;

        Ok(CachedLeaf {
            cert_chain: vec![leaf_cert.der().clone(), self.ca_cert_der.clone()],
            key_der: leaf_key.serialize_der(),
        })
    }
}

impl CertificateService for LocalCertificateAuthority {
    fn certificate_for(
        &self,
        _local_addr: SocketAddr,
        authority: &str,
    ) -> Result<CertificateMaterial, CertificateError> {
        let normalized = normalize_host(authority);
        let mut cache = self.cache.lock().map_err(|_| CertificateError::LockPoisoned)?;

        if let Some(cached) = cache.leaves.get(&normalized) {
            let material = material_from(cached);
            touch_lru(&mut cache.lru, &normalized);
            return Ok(material);
        }

        let leaf = self.issue_leaf(&normalized)?;
        let material = material_from(&leaf);

        if self.config.leaf_cache_capacity > 0 {
            if cache.leaves.len() >= self.config.leaf_cache_capacity {
                if let Some(oldest) = cache.lru.pop_front() {
                    cache.leaves.remove(&oldest);
                }
            }
            cache.leaves.insert(normalized.clone(), leaf);
            touch_lru(&mut cache.lru, &normalized);
        }

        Ok(material)
    }
}

fn material_from(cached: &CachedLeaf) -> CertificateMaterial {
    CertificateMaterial {
        cert_chain: cached.cert_chain.clone(),
        key: PrivateKeyDer::from(PrivatePkcs8KeyDer::from(cached.key_der.clone())),
    }
}

fn build_ca_params(config: &CaConfig) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, config.common_name.clone());
    distinguished_name.push(DnType::OrganizationName, config.organization.clone());
    params.distinguished_name = distinguished_name;
    params
}

fn build_leaf_params(host: &str) -> Result<CertificateParams, CertificateError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.use_authority_key_identifier_extension = true;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, host.to_string());
    params.distinguished_name = distinguished_name;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params
            .subject_alt_names
            .push(SanType::DnsName(host.try_into()?));
    }

    Ok(params)
}

fn normalize_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

fn touch_lru(lru: &mut VecDeque<String>, key: &str) {
    if let Some(position) = lru.iter().position(|entry| entry == key) {
        lru.remove(position);
    }
    lru.push_back(key.to_string());
}
