//! Per-module server port allocation

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{HarnessError, HarnessResult};

/// First port handed out when no base is configured.
pub const DEFAULT_BASE_PORT: u16 = 8000;

/// Hands each module run its own server port.
///
/// The counter only moves forward and is shared by every module run that
/// holds the allocator, so concurrent runs never see the same port.
#[derive(Debug)]
pub struct PortAllocator {
    next: AtomicU32,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        Self {
            next: AtomicU32::new(u32::from(base)),
        }
    }

    /// Take the next port.
    pub fn allocate(&self) -> HarnessResult<u16> {
        let port = self.next.fetch_add(1, Ordering::SeqCst);
        u16::try_from(port).map_err(|_| HarnessError::PortsExhausted)
    }

    /// The port the next call to [`allocate`](Self::allocate) would return.
    pub fn peek(&self) -> u32 {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_PORT)
    }
}

/// Ask the OS for a currently unused local port.
pub fn find_free_port() -> HarnessResult<u16> {
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}
