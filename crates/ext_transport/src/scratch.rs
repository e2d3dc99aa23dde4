//! Scratch-buffer pool
//!
//! A fixed set of remote buffers allocated once and reused across calls.
//! Each call checks a buffer out exclusively and the guard returns it on
//! drop. A buffer is never handed to two callers at once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::transport::{MemoryTransport, RemoteAddr};

/// What a checkout does when every buffer is in use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutPolicy {
    /// Wait for a release, optionally bounded by a timeout
    #[default]
    Block,
    /// Fail immediately
    FailFast,
}

/// Configuration for a scratch pool
#[derive(Debug, Clone)]
pub struct ScratchConfig {
    pub buffers: usize,
    pub buffer_size: usize,
    pub policy: CheckoutPolicy,
    /// Upper bound on a blocking wait, `None` waits forever
    pub timeout: Option<Duration>,
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            buffers: 4,
            buffer_size: 4096,
            policy: CheckoutPolicy::Block,
            timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// Checkout counters
#[derive(Debug, Default)]
pub struct ScratchStats {
    pub checkouts: AtomicU64,
    pub waits: AtomicU64,
    pub failures: AtomicU64,
}

struct Slot {
    addr: RemoteAddr,
    in_use: AtomicBool,
}

/// Pool of reusable remote buffers
pub struct ScratchPool {
    transport: Arc<dyn MemoryTransport>,
    slots: Vec<Slot>,
    config: ScratchConfig,
    lock: Mutex<()>,
    released: Condvar,
    stats: ScratchStats,
}

impl ScratchPool {
    /// Allocate every buffer up front
    pub fn new(transport: Arc<dyn MemoryTransport>, config: ScratchConfig) -> Result<Self> {
        let mut slots = Vec::with_capacity(config.buffers);
        for _ in 0..config.buffers {
            match transport.alloc(config.buffer_size, 16) {
                Ok(addr) => slots.push(Slot {
                    addr,
                    in_use: AtomicBool::new(false),
                }),
                Err(e) => {
                    for slot in &slots {
                        let _ = transport.free(slot.addr);
                    }
                    return Err(e);
                }
            }
        }
        log::debug!(
            "Scratch pool ready: {} buffers of {} bytes",
            config.buffers,
            config.buffer_size
        );
        Ok(Self {
            transport,
            slots,
            config,
            lock: Mutex::new(()),
            released: Condvar::new(),
            stats: ScratchStats::default(),
        })
    }

    pub fn transport(&self) -> &Arc<dyn MemoryTransport> {
        &self.transport
    }

    pub fn buffer_size(&self) -> usize {
        self.config.buffer_size
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Buffers currently checked out
    pub fn in_use(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.in_use.load(Ordering::Acquire))
            .count()
    }

    pub fn stats(&self) -> &ScratchStats {
        &self.stats
    }

    fn try_claim(&self) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    /// Check out a buffer, applying the configured policy when none is free
    pub fn checkout(&self) -> Result<ScratchBuffer<'_>> {
        let mut guard = self.lock.lock();
        let deadline = self.config.timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(index) = self.try_claim() {
                self.stats.checkouts.fetch_add(1, Ordering::Relaxed);
                return Ok(ScratchBuffer {
                    pool: self,
                    index,
                    released: false,
                });
            }
            if self.config.policy == CheckoutPolicy::FailFast || self.slots.is_empty() {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                return Err(TransportError::PoolExhausted(self.slots.len()));
            }
            self.stats.waits.fetch_add(1, Ordering::Relaxed);
            match deadline {
                Some(deadline) => {
                    if self.released.wait_until(&mut guard, deadline).timed_out()
                        && self.in_use() == self.slots.len()
                    {
                        self.stats.failures.fetch_add(1, Ordering::Relaxed);
                        return Err(TransportError::CheckoutTimeout(
                            self.config.timeout.unwrap_or_default(),
                        ));
                    }
                }
                None => self.released.wait(&mut guard),
            }
        }
    }

    /// Check out a buffer able to hold `len` bytes
    pub fn checkout_for(&self, len: usize) -> Result<ScratchBuffer<'_>> {
        if len > self.config.buffer_size {
            return Err(TransportError::BufferTooSmall {
                requested: len,
                capacity: self.config.buffer_size,
            });
        }
        self.checkout()
    }

    fn release(&self, index: usize) {
        let _guard = self.lock.lock();
        let was_in_use = self.slots[index].in_use.swap(false, Ordering::AcqRel);
        if !was_in_use {
            panic!("scratch buffer {index} released twice");
        }
        self.released.notify_one();
    }
}

impl Drop for ScratchPool {
    fn drop(&mut self) {
        for slot in &self.slots {
            if let Err(e) = self.transport.free(slot.addr) {
                log::warn!("Failed to free scratch buffer at {}: {e}", slot.addr);
            }
        }
    }
}

/// Exclusive checkout of one scratch buffer
pub struct ScratchBuffer<'a> {
    pool: &'a ScratchPool,
    index: usize,
    released: bool,
}

impl ScratchBuffer<'_> {
    /// Remote address of the buffer
    pub fn addr(&self) -> RemoteAddr {
        self.pool.slots[self.index].addr
    }

    pub fn len(&self) -> usize {
        self.pool.config.buffer_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, offset: usize, len: usize) -> Result<RemoteAddr> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(self.addr().offset(offset)),
            _ => Err(TransportError::BufferTooSmall {
                requested: offset.saturating_add(len),
                capacity: self.len(),
            }),
        }
    }

    /// Copy bytes into the buffer at `offset`
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let addr = self.check(offset, bytes.len())?;
        self.pool.transport.write(addr, bytes)
    }

    /// Copy `len` bytes out of the buffer at `offset`
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let addr = self.check(offset, len)?;
        self.pool.transport.read(addr, len)
    }

    /// Return the buffer to the pool
    pub fn release(mut self) {
        self.released = true;
        self.pool.release(self.index);
    }
}

impl Drop for ScratchBuffer<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.pool.release(self.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxTransport;

    fn pool(buffers: usize, policy: CheckoutPolicy) -> ScratchPool {
        ScratchPool::new(
            Arc::new(SandboxTransport::default()),
            ScratchConfig {
                buffers,
                buffer_size: 64,
                policy,
                timeout: Some(Duration::from_millis(50)),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_checkouts_never_alias() {
        let pool = pool(2, CheckoutPolicy::FailFast);
        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();
        assert_ne!(a.addr(), b.addr());
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.checkout().err(), Some(TransportError::PoolExhausted(2)));
        drop(a);
        let c = pool.checkout().unwrap();
        assert_ne!(c.addr(), b.addr());
    }

    #[test]
    fn test_block_times_out() {
        let pool = pool(1, CheckoutPolicy::Block);
        let _held = pool.checkout().unwrap();
        assert!(matches!(pool.checkout(), Err(TransportError::CheckoutTimeout(_))));
    }

    #[test]
    fn test_block_waits_for_release() {
        let pool = ScratchPool::new(
            Arc::new(SandboxTransport::default()),
            ScratchConfig {
                buffers: 1,
                buffer_size: 16,
                policy: CheckoutPolicy::Block,
                timeout: None,
            },
        )
        .unwrap();
        let held = pool.checkout().unwrap();
        std::thread::scope(|s| {
            let waiter = s.spawn(|| pool.checkout().map(|b| b.addr()));
            std::thread::sleep(Duration::from_millis(20));
            let addr = held.addr();
            held.release();
            assert_eq!(waiter.join().unwrap(), Ok(addr));
        });
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_buffer_bounds() {
        let pool = pool(1, CheckoutPolicy::FailFast);
        let mut buf = pool.checkout().unwrap();
        buf.write(60, &[1, 2, 3, 4]).unwrap();
        assert_eq!(buf.read(62, 2).unwrap(), vec![3, 4]);
        assert!(buf.write(62, &[0; 4]).is_err());
        assert!(pool.checkout_for(65).is_err());
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn test_double_release_panics() {
        let pool = pool(1, CheckoutPolicy::FailFast);
        let buf = pool.checkout().unwrap();
        let index = buf.index;
        buf.release();
        pool.release(index);
    }
}
