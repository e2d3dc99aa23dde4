//! # ext_bridge - Extension Instance Bridge
//!
//! Binds host types to engine classes: host structs are registered as
//! engine classes, every engine object of such a class is paired with a
//! host value, and the engine calls back into the host for virtuals,
//! methods, properties and notifications.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │ ExtensionClass  │────▶│  ClassRegistry  │──── submit_* ───▶ engine
//! │ + ClassBuilder  │     │ (validate once) │
//! └─────────────────┘     └────────┬────────┘
//!                                  │ ClassDescriptor
//!                                  ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │   callbacks     │────▶│    Lifecycle    │──▶ InstanceTable<HostState>
//! │  (extern "C")   │     │ create / destroy│
//! └────────┬────────┘     └─────────────────┘
//!          │
//!          ├──▶ VirtualResolver ──▶ Trampoline
//!          └──▶ CallBridge ── variant / direct conventions
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use ext_bridge::{BridgeConfig, ClassBuilder, ExtensionBridge, ExtensionClass};
//!
//! #[derive(Default)]
//! struct Counter {
//!     value: i64,
//! }
//!
//! impl ExtensionClass for Counter {
//!     const NAME: &'static str = "Counter";
//!     const PARENT: &'static str = "Node";
//!
//!     fn declare(class: &mut ClassBuilder<Self>) {
//!         class.property("value", |c: &Counter| c.value, |c: &mut Counter, v| c.value = v);
//!         class.method("increment", |c: &mut Counter| {
//!             c.value += 1;
//!             c.value
//!         });
//!     }
//! }
//!
//! let bridge = ExtensionBridge::new(engine, BridgeConfig::default())?;
//! bridge.queue::<Counter>();
//! bridge.install()?;
//! ```

mod binding;
mod bridge;
pub mod callbacks;
mod call;
mod class;
mod config;
mod engine;
mod error;
mod ffi;
mod ffi_engine;
mod flags;
mod headless;
mod instance;
mod lifecycle;
mod native;
mod registry;
mod signals;
mod virtuals;

pub use binding::{
    ArgInfo, Exclusive, IntoMethod, IntoStaticMethod, MethodBinding, MethodId, Receiver, Shared,
    Signature,
};
pub use bridge::ExtensionBridge;
pub use call::{CallBridge, CallFrame};
pub use class::{
    ChildDecl, ClassBuilder, ClassDescriptor, ConstantDecl, ExtensionClass, InstanceContext,
    MethodDecl, PropertyDecl, PropertyDescriptor, PropertyGroup, Releasable, SignalDecl,
};
pub use config::BridgeConfig;
pub use engine::{ClassId, ClassInfo, EngineInterface, MethodInfo, PropertyHint, PropertyInfo};
pub use error::{BridgeError, CallError, CallErrorKind, ConfigError, Result};
pub use ffi::*;
pub use ffi_engine::FfiEngine;
pub use flags::{MethodFlags, PropertyUsage};
pub use headless::{ClassRecord, HeadlessEngine};
pub use instance::{HostState, InstanceHandle, InstanceTable};
pub use lifecycle::{Lifecycle, NOTIFICATION_POSTINITIALIZE, NOTIFICATION_READY};
pub use native::{NativeCaps, NativeClass, NativeClassDb, VirtualSignature};
pub use registry::{ClassRegistry, InitLevel};
pub use signals::{EngineSignal, EngineSignalHost};
pub use virtuals::{convert_virtual_name, Trampoline, VirtualResolver};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::bridge::ExtensionBridge;
    pub use crate::class::{ClassBuilder, ExtensionClass, InstanceContext, Releasable};
    pub use crate::config::BridgeConfig;
    pub use crate::engine::{EngineInterface, PropertyHint};
    pub use crate::error::{BridgeError, CallError, ConfigError, Result};
    pub use crate::instance::InstanceHandle;
    pub use crate::registry::InitLevel;
    pub use ext_signal::{ConsumerFlags, Signal, SignalSender};
    pub use ext_variant::{ArgMetadata, ObjectId, Value, VariantType};
}
