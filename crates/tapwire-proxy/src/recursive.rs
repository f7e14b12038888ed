use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};

use tapwire_http::HttpRequestHead;

use crate::connection::ConnectionState;

/// Whether this request is addressed to the proxy itself and would loop
/// if forwarded.
///
/// A request is recursive when its host matches a configured server
/// alias (any port), or when its target port equals the connection's
/// listening port and the target host resolves to an address the server
/// is bound to. CONNECT requests are only ever flagged by the alias
/// rule: their authority names the tunnel target, not necessarily the
/// proxy. Resolution failures are treated as not recursive so an
/// unknown host never trips loop prevention.
pub fn is_recursive(state: &ConnectionState, request: &HttpRequestHead) -> bool {
    let default_port = if state.is_tls_upgraded() { 443 } else { 80 };
    let Some(authority) = request.authority(default_port) else {
        return false;
    };

    if state.server_config().is_alias(&authority.host) {
        return true;
    }
    if request.is_connect() {
        return false;
    }
    if authority.port != state.local_addr().port() {
        return false;
    }

    let addresses = match resolve_host(&authority.host, authority.port) {
        Ok(addresses) => addresses,
        Err(error) => {
            tracing::debug!(
                host = %authority.host,
                %error,
                "host resolution failed during recursion check"
            );
            return false;
        }
    };

    addresses
        .into_iter()
        .any(|address| matches_bound_address(state, address))
}

fn resolve_host(host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
    if let Ok(address) = host.parse::<IpAddr>() {
        return Ok(vec![address]);
    }
    Ok((host, port)
        .to_socket_addrs()?
        .map(|socket_addr| socket_addr.ip())
        .collect())
}

fn matches_bound_address(state: &ConnectionState, address: IpAddr) -> bool {
    let config = state.server_config();
    if !config.is_any_local_address() {
        return address == state.local_addr().ip();
    }

    address.is_loopback()
        || address.is_unspecified()
        || is_site_local(address)
        || config.is_local_interface_address(address)
        || (config.is_behind_nat() && config.public_address == Some(address))
}

fn is_site_local(address: IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => is_site_local_v4(v4),
        IpAddr::V6(v6) => is_site_local_v6(v6),
    }
}

fn is_site_local_v4(address: Ipv4Addr) -> bool {
    address.is_private() || address.is_link_local()
}

fn is_site_local_v6(address: Ipv6Addr) -> bool {
    // Unique-local fc00::/7 or link-local fe80::/10.
    let segments = address.segments();
    (segments[0] & 0xfe00) == 0xfc00 || (segments[0] & 0xffc0) == 0xfe80
}
