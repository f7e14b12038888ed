use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tapwire_tls::TlsConfig;
use uuid::Uuid;

use crate::config::ServerConfig;

/// Per-connection attribute bag, shared by every stage on the
/// connection. The boolean flags are monotonic: once set they stay set
/// for the connection's lifetime.
#[derive(Debug)]
pub struct ConnectionState {
    id: Uuid,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    server_config: Arc<ServerConfig>,
    tls_config: TlsConfig,
    tls_upgraded: AtomicBool,
    pass_through: OnceLock<bool>,
    processing_message: AtomicBool,
}

impl ConnectionState {
    pub fn new(
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        server_config: Arc<ServerConfig>,
        tls_config: TlsConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            local_addr,
            peer_addr,
            server_config,
            tls_config,
            tls_upgraded: AtomicBool::new(false),
            pass_through: OnceLock::new(),
            processing_message: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn server_config(&self) -> &ServerConfig {
        &self.server_config
    }

    pub fn tls_config(&self) -> &TlsConfig {
        &self.tls_config
    }

    pub fn mark_tls_upgraded(&self) {
        self.tls_upgraded.store(true, Ordering::SeqCst);
    }

    pub fn is_tls_upgraded(&self) -> bool {
        self.tls_upgraded.load(Ordering::SeqCst)
    }

    /// Records the pass-through decision; only the first call takes
    /// effect.
    pub fn choose_pass_through(&self, chosen: bool) {
        let _ = self.pass_through.set(chosen);
    }

    /// `None` until the first CONNECT request decided.
    pub fn pass_through_chosen(&self) -> Option<bool> {
        self.pass_through.get().copied()
    }

    pub(crate) fn set_processing(&self, processing: bool) {
        self.processing_message.store(processing, Ordering::SeqCst);
    }

    pub fn is_processing_message(&self) -> bool {
        self.processing_message.load(Ordering::SeqCst)
    }
}
