//! # ext_transport - Remote Memory Transport
//!
//! Moves fixed-size chunks of bytes between the host and engine-owned
//! memory. When both share an address space ([`LocalTransport`]) every
//! operation is a direct pointer copy; otherwise ([`SandboxTransport`])
//! addresses are offsets into a bounds-checked linear memory. Callers see
//! the same [`MemoryTransport`] contract either way.
//!
//! [`ScratchPool`] keeps a fixed set of remote buffers for call frames so
//! no call allocates remotely. Checkouts are exclusive.

mod error;
mod local;
mod sandbox;
mod scratch;
mod transport;

pub use error::{Result, TransportError};
pub use local::LocalTransport;
pub use sandbox::{SandboxConfig, SandboxTransport, PAGE_SIZE};
pub use scratch::{CheckoutPolicy, ScratchBuffer, ScratchConfig, ScratchPool, ScratchStats};
pub use transport::{MemoryTransport, RemoteAddr};
