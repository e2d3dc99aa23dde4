//! Error types for the memory transport

use std::time::Duration;

use thiserror::Error;

use crate::transport::RemoteAddr;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors raised while moving bytes across the boundary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Address is null
    #[error("Null remote address")]
    NullAddress,

    /// Access falls outside remote memory
    #[error("Access of {len} bytes at {addr} exceeds remote memory of {size} bytes")]
    OutOfBounds {
        addr: RemoteAddr,
        len: usize,
        size: usize,
    },

    /// Remote allocation failed
    #[error("Cannot allocate {0} remote bytes")]
    OutOfMemory(usize),

    /// Freed address was never allocated
    #[error("Address {0} was not allocated by this transport")]
    UnknownAllocation(RemoteAddr),

    /// No scratch buffer free under the fail-fast policy
    #[error("All {0} scratch buffers are checked out")]
    PoolExhausted(usize),

    /// No scratch buffer became free in time
    #[error("Timed out after {0:?} waiting for a scratch buffer")]
    CheckoutTimeout(Duration),

    /// Request larger than a scratch buffer
    #[error("Request of {requested} bytes exceeds scratch buffer size {capacity}")]
    BufferTooSmall { requested: usize, capacity: usize },
}
