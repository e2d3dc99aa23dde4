//! Separate-address-space transport
//!
//! Models an engine reachable only through a linear memory, as when the
//! host runs inside a WASM sandbox. Addresses are byte offsets into that
//! memory and every access is bounds checked.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, TransportError};
use crate::transport::{MemoryTransport, RemoteAddr};

/// Page size of the linear memory
pub const PAGE_SIZE: usize = 64 * 1024;

/// Offsets below this are never handed out, so zero stays null
const RESERVED: u64 = 16;

/// Configuration for a sandboxed memory
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Pages mapped at start
    pub initial_pages: usize,
    /// Upper bound on growth
    pub max_pages: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            initial_pages: 1,
            max_pages: 256, // 16MB
        }
    }
}

#[derive(Default)]
struct Allocations {
    next: u64,
    live: HashMap<u64, usize>,
    free: Vec<(u64, usize)>,
}

/// Transport over a bounds-checked linear memory
pub struct SandboxTransport {
    config: SandboxConfig,
    memory: RwLock<Vec<u8>>,
    allocations: Mutex<Allocations>,
}

impl SandboxTransport {
    pub fn new(config: SandboxConfig) -> Self {
        let memory = vec![0u8; config.initial_pages.max(1) * PAGE_SIZE];
        Self {
            config,
            memory: RwLock::new(memory),
            allocations: Mutex::new(Allocations {
                next: RESERVED,
                ..Default::default()
            }),
        }
    }

    /// Current memory size in bytes
    pub fn memory_size(&self) -> usize {
        self.memory.read().len()
    }

    /// Number of live allocations
    pub fn live_allocations(&self) -> usize {
        self.allocations.lock().live.len()
    }

    fn range(&self, addr: RemoteAddr, len: usize, size: usize) -> Result<std::ops::Range<usize>> {
        if addr.is_null() {
            return Err(TransportError::NullAddress);
        }
        let start = addr.0 as usize;
        match start.checked_add(len) {
            Some(end) if end <= size => Ok(start..end),
            _ => Err(TransportError::OutOfBounds { addr, len, size }),
        }
    }

    fn grow_to(&self, end: usize) -> Result<()> {
        let mut memory = self.memory.write();
        if end <= memory.len() {
            return Ok(());
        }
        let pages = end.div_ceil(PAGE_SIZE);
        if pages > self.config.max_pages {
            return Err(TransportError::OutOfMemory(end - memory.len()));
        }
        log::debug!("Growing sandbox memory to {pages} pages");
        memory.resize(pages * PAGE_SIZE, 0);
        Ok(())
    }
}

impl Default for SandboxTransport {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

impl MemoryTransport for SandboxTransport {
    fn shares_address_space(&self) -> bool {
        false
    }

    fn read_into(&self, addr: RemoteAddr, buf: &mut [u8]) -> Result<()> {
        let memory = self.memory.read();
        let range = self.range(addr, buf.len(), memory.len())?;
        buf.copy_from_slice(&memory[range]);
        Ok(())
    }

    fn write(&self, addr: RemoteAddr, bytes: &[u8]) -> Result<()> {
        let mut memory = self.memory.write();
        let size = memory.len();
        let range = self.range(addr, bytes.len(), size)?;
        memory[range].copy_from_slice(bytes);
        Ok(())
    }

    fn alloc(&self, size: usize, align: usize) -> Result<RemoteAddr> {
        let size = size.max(1);
        let align = align.max(1) as u64;
        let mut allocations = self.allocations.lock();

        // first fit from released blocks
        if let Some(index) = allocations
            .free
            .iter()
            .position(|&(addr, len)| len >= size && addr % align == 0)
        {
            let (addr, len) = allocations.free.swap_remove(index);
            allocations.live.insert(addr, len);
            self.write(RemoteAddr(addr), &vec![0u8; len])?;
            return Ok(RemoteAddr(addr));
        }

        let addr = allocations.next.div_ceil(align) * align;
        let end = addr as usize + size;
        self.grow_to(end)?;
        allocations.next = end as u64;
        allocations.live.insert(addr, size);
        Ok(RemoteAddr(addr))
    }

    fn free(&self, addr: RemoteAddr) -> Result<()> {
        let mut allocations = self.allocations.lock();
        let len = allocations
            .live
            .remove(&addr.0)
            .ok_or(TransportError::UnknownAllocation(addr))?;
        allocations.free.push((addr.0, len));
        Ok(())
    }
}
