//! # ext_signal - Signal Relay
//!
//! Named event streams that host code can subscribe to and emit, first
//! in-process and later through the engine's own signal system.
//!
//! ## Overview
//!
//! - [`Signal`]: attach/remove/emit with duplicate detection, deferred and
//!   one-shot delivery, and a one-way switch to an engine-native
//!   [`SignalBackend`].
//! - [`DeferredQueue`]: FIFO of closures flushed on the engine's main
//!   context.
//! - [`ChannelRelay`]: background thread turning channel messages into
//!   emits, joined deterministically on close.
//!
//! ## Example
//!
//! ```ignore
//! use ext_signal::{ConsumerFlags, Signal};
//!
//! let died = Signal::new("died");
//! died.attach(on_died, ConsumerFlags::ONE_SHOT)?;
//! died.emit(&[Value::Int(killer_id)])?;
//! ```

mod deferred;
mod error;
mod flags;
mod relay;
mod signal;

pub use deferred::DeferredQueue;
pub use error::{Result, SignalError};
pub use flags::ConsumerFlags;
pub use relay::{ChannelRelay, RelayWatch, Relayed, SignalSender};
pub use signal::{Consumer, Signal, SignalBackend, SignalHost};
