use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tapwire_http::{Authority, HttpRequestHead};

/// Read-mostly server configuration shared by every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host names that always denote this proxy, regardless of port.
    pub aliases: Vec<String>,
    /// Whether the listener is bound to a wildcard address.
    pub any_local_address: bool,
    /// Addresses of local network interfaces, consulted for recursion
    /// checks when bound to a wildcard address.
    pub local_interface_addresses: Vec<IpAddr>,
    pub behind_nat: bool,
    pub public_address: Option<IpAddr>,
    /// Authority patterns whose messages are dispatched with the
    /// excluded flag set.
    pub excluded_authorities: Vec<String>,
    pub pass_through: PassThroughConfig,
    pub timeouts: TimeoutConfig,
    pub max_head_bytes: usize,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassThroughConfig {
    pub enabled: bool,
    /// Authority host patterns, exact (`api.example.com`) or wildcard
    /// (`*.example.com`).
    pub authorities: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub idle_read_ms: u64,
    pub upstream_connect_ms: u64,
    pub relay_idle_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            aliases: Vec::new(),
            any_local_address: false,
            local_interface_addresses: Vec::new(),
            behind_nat: false,
            public_address: None,
            excluded_authorities: Vec::new(),
            pass_through: PassThroughConfig::default(),
            timeouts: TimeoutConfig::default(),
            max_head_bytes: 64 * 1024,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Default for PassThroughConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            authorities: Vec::new(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            idle_read_ms: 30_000,
            upstream_connect_ms: 10_000,
            relay_idle_ms: 30_000,
        }
    }
}

impl TimeoutConfig {
    pub fn idle_read(&self) -> Duration {
        Duration::from_millis(self.idle_read_ms.max(1))
    }

    pub fn upstream_connect(&self) -> Duration {
        Duration::from_millis(self.upstream_connect_ms.max(1))
    }

    pub fn relay_idle(&self) -> Duration {
        Duration::from_millis(self.relay_idle_ms.max(1))
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_head_bytes == 0 {
            return Err("max_head_bytes must be greater than zero".to_string());
        }
        if self.max_body_bytes == 0 {
            return Err("max_body_bytes must be greater than zero".to_string());
        }
        if self.behind_nat && self.public_address.is_none() {
            return Err("public_address must be set when behind_nat is enabled".to_string());
        }
        Ok(())
    }

    pub fn is_alias(&self, host: &str) -> bool {
        self.aliases
            .iter()
            .any(|alias| alias.eq_ignore_ascii_case(host))
    }

    pub fn is_any_local_address(&self) -> bool {
        self.any_local_address
    }

    pub fn is_behind_nat(&self) -> bool {
        self.behind_nat
    }

    pub fn is_local_interface_address(&self, address: IpAddr) -> bool {
        self.local_interface_addresses.contains(&address)
    }

    pub fn is_excluded(&self, request: &HttpRequestHead) -> bool {
        let Some(authority) = request.authority(80) else {
            return false;
        };
        self.excluded_authorities
            .iter()
            .any(|pattern| host_pattern_matches(pattern, &authority.host))
    }

    pub fn pass_through_matches(&self, authority: &Authority) -> bool {
        self.pass_through.enabled
            && self
                .pass_through
                .authorities
                .iter()
                .any(|pattern| host_pattern_matches(pattern, &authority.host))
    }
}

/// Matches a host against an exact name or a `*.suffix` wildcard. The
/// wildcard also matches the bare suffix itself.
pub(crate) fn host_pattern_matches(pattern: &str, host: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        let host = host.to_ascii_lowercase();
        let suffix = suffix.to_ascii_lowercase();
        return host == suffix || host.ends_with(&format!(".{suffix}"));
    }
    pattern.eq_ignore_ascii_case(host)
}
