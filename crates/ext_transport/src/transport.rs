//! Transport trait and remote addresses

use std::fmt;

use crate::error::Result;

/// Opaque address in the engine's memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RemoteAddr(pub u64);

impl RemoteAddr {
    pub const NULL: Self = Self(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` further on
    pub fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }

    /// Address of a host pointer in a shared address space
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Copies bytes to and from engine-owned memory
pub trait MemoryTransport: Send + Sync {
    /// Whether remote addresses are host pointers
    fn shares_address_space(&self) -> bool;

    /// Fill `buf` from `addr`
    fn read_into(&self, addr: RemoteAddr, buf: &mut [u8]) -> Result<()>;

    /// Copy `bytes` to `addr`
    fn write(&self, addr: RemoteAddr, bytes: &[u8]) -> Result<()>;

    /// Allocate `size` remote bytes aligned to `align`
    fn alloc(&self, size: usize, align: usize) -> Result<RemoteAddr>;

    /// Release an allocation made by [`MemoryTransport::alloc`]
    fn free(&self, addr: RemoteAddr) -> Result<()>;

    /// Read `len` bytes from `addr`
    fn read(&self, addr: RemoteAddr, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(addr, &mut buf)?;
        Ok(buf)
    }
}
