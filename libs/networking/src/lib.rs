//! Networking utilities for the relay.
//!
//! This library provides host port management for function instances:
//! - Ephemeral TCP port reservation on the local host
//! - Hold-until-use reservations that narrow the allocate-then-bind window
//!
//! A port is only free until someone else binds it. `PortReservation` keeps the
//! OS listener open until the caller is about to hand the port to the container
//! runtime, so the window between release and the runtime's own bind is as short
//! as the single create request.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener};

use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Binding the probe listener failed.
    #[error("failed to bind ephemeral listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The OS did not report the assigned address.
    #[error("failed to read assigned local address: {0}")]
    LocalAddr(#[source] std::io::Error),
}

// ============================================================================
// Port reservations
// ============================================================================

/// An OS-assigned port whose listener is still open.
///
/// Nothing else on the host can bind the port while the reservation is alive.
/// Call [`PortReservation::release`] right before issuing the request that makes
/// another party bind it.
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
    listener: TcpListener,
}

impl PortReservation {
    /// The reserved port number.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Close the listener and hand the port over to the caller.
    pub fn release(self) -> u16 {
        drop(self.listener);
        self.port
    }
}

/// Source of host ports for new instances.
pub trait PortAllocator: Send + Sync {
    /// Reserve an unused port, keeping it bound until released.
    fn reserve(&self) -> Result<PortReservation, NetworkError>;

    /// Allocate an unused port and release it immediately.
    ///
    /// The returned port is free at the time of return only; another process may
    /// claim it before it is used.
    fn allocate(&self) -> Result<u16, NetworkError> {
        self.reserve().map(PortReservation::release)
    }
}

/// Allocator backed by the OS ephemeral port range (bind to port 0).
#[derive(Debug, Clone)]
pub struct EphemeralPortAllocator {
    bind_ip: Ipv4Addr,
}

impl EphemeralPortAllocator {
    /// Allocate ports on all interfaces, matching the runtime's `0.0.0.0` host binding.
    pub fn new() -> Self {
        Self {
            bind_ip: Ipv4Addr::UNSPECIFIED,
        }
    }

    /// Allocate ports on a specific local address.
    pub fn with_bind_ip(bind_ip: Ipv4Addr) -> Self {
        Self { bind_ip }
    }
}

impl Default for EphemeralPortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PortAllocator for EphemeralPortAllocator {
    fn reserve(&self) -> Result<PortReservation, NetworkError> {
        let addr = SocketAddr::V4(SocketAddrV4::new(self.bind_ip, 0));
        let listener = TcpListener::bind(addr).map_err(|source| NetworkError::Bind { addr, source })?;
        let port = listener
            .local_addr()
            .map_err(NetworkError::LocalAddr)?
            .port();

        Ok(PortReservation { port, listener })
    }
}
