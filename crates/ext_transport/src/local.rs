//! Shared-address-space transport

use std::alloc::{self, Layout};
use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{Result, TransportError};
use crate::transport::{MemoryTransport, RemoteAddr};

/// Transport for an engine living in the host's address space.
///
/// Addresses are plain pointers and every copy is a direct memory copy.
pub struct LocalTransport {
    allocations: Mutex<HashMap<u64, Layout>>,
}

impl LocalTransport {
    /// Create a local transport.
    ///
    /// # Safety
    ///
    /// Every address later passed to `read_into` or `write` must be valid
    /// for the requested length.
    pub unsafe fn new() -> Self {
        Self {
            allocations: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live allocations
    pub fn live_allocations(&self) -> usize {
        self.allocations.lock().len()
    }
}

impl MemoryTransport for LocalTransport {
    fn shares_address_space(&self) -> bool {
        true
    }

    fn read_into(&self, addr: RemoteAddr, buf: &mut [u8]) -> Result<()> {
        if addr.is_null() {
            return Err(TransportError::NullAddress);
        }
        // SAFETY: guaranteed by the constructor contract
        unsafe {
            std::ptr::copy_nonoverlapping(addr.0 as usize as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn write(&self, addr: RemoteAddr, bytes: &[u8]) -> Result<()> {
        if addr.is_null() {
            return Err(TransportError::NullAddress);
        }
        // SAFETY: guaranteed by the constructor contract
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr.0 as usize as *mut u8, bytes.len());
        }
        Ok(())
    }

    fn alloc(&self, size: usize, align: usize) -> Result<RemoteAddr> {
        let layout = Layout::from_size_align(size.max(1), align.max(1))
            .map_err(|_| TransportError::OutOfMemory(size))?;
        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(TransportError::OutOfMemory(size));
        }
        let addr = RemoteAddr::from_ptr(ptr);
        self.allocations.lock().insert(addr.0, layout);
        Ok(addr)
    }

    fn free(&self, addr: RemoteAddr) -> Result<()> {
        let layout = self
            .allocations
            .lock()
            .remove(&addr.0)
            .ok_or(TransportError::UnknownAllocation(addr))?;
        // SAFETY: allocated by `alloc` with this layout
        unsafe { alloc::dealloc(addr.0 as usize as *mut u8, layout) };
        Ok(())
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        let allocations = std::mem::take(&mut *self.allocations.lock());
        if !allocations.is_empty() {
            log::warn!("Releasing {} leaked local allocations", allocations.len());
        }
        for (addr, layout) in allocations {
            // SAFETY: allocated by `alloc` with this layout
            unsafe { alloc::dealloc(addr as usize as *mut u8, layout) };
        }
    }
}
