//! Construction-time configuration, generalizing the mutable globals the
//! source kept at file scope (`isHost`, `localPort`) into one explicit
//! struct with atomic cells for the fields the UI mutates live.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;

pub const CLIENT_LISTEN_PORT: u16 = 8888;

/// Shared, cheaply cloneable handle to the engine's live role/port state.
#[derive(Clone)]
pub struct RoleConfig {
    is_host: std::sync::Arc<AtomicBool>,
    local_port: std::sync::Arc<AtomicU16>,
}

impl RoleConfig {
    pub fn new(is_host: bool, local_port: u16) -> Self {
        Self {
            is_host: std::sync::Arc::new(AtomicBool::new(is_host)),
            local_port: std::sync::Arc::new(AtomicU16::new(local_port)),
        }
    }

    pub fn is_host(&self) -> bool {
        self.is_host.load(Ordering::Relaxed)
    }

    pub fn set_is_host(&self, value: bool) {
        self.is_host.store(value, Ordering::Relaxed);
    }

    /// 0 means "no local service configured"; dialing is skipped.
    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::Relaxed)
    }

    pub fn set_local_port(&self, port: u16) {
        self.local_port.store(port, Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub struct EngineConfig {
    pub role: RoleConfig,
    pub client_listen_port: u16,
    pub dial_timeout: Duration,
    /// Upper bound on blobs drained from the overlay per pump iteration.
    pub overlay_batch_size: usize,
}

impl EngineConfig {
    pub fn new(is_host: bool, local_port: u16) -> Self {
        Self {
            role: RoleConfig::new(is_host, local_port),
            client_listen_port: CLIENT_LISTEN_PORT,
            dial_timeout: Duration::from_secs(5),
            overlay_batch_size: 10,
        }
    }
}
