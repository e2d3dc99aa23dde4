//! # ext_variant - Value Marshalling
//!
//! Converts host values to and from the engine's two wire conventions.
//!
//! ## Conventions
//!
//! ```text
//!              ┌──────────────┐
//!   host T ───▶│  ToValue     │───▶ Value ──┬──▶ encode_variant ──▶ RawVariant (tagged, 24 bytes)
//!              └──────────────┘             │
//!              ┌──────────────┐             └──▶ write_direct ────▶ fixed-width slot
//!   host T ◀───│  FromValue   │◀─── Value ◀─┬─── decode_variant ◀── RawVariant
//!              └──────────────┘             └─── read_direct ◀──── fixed-width slot
//! ```
//!
//! The variant convention carries a run-time tag; the direct convention
//! relies on the kind declared at registration and a static dispatch table.
//!
//! ## Ownership
//!
//! [`Variant`] owns its heap payload and frees it on drop, or transfers it
//! to the engine with [`Variant::into_raw`]. [`VariantRef`] borrows a
//! variant for a single call and never frees it.

mod callable;
mod direct;
mod error;
mod marshal;
mod math;
mod types;
mod value;
mod variant;

pub use callable::{Callable, CallableFn};
pub use direct::{direct_codec, read_direct, release_direct, write_direct, DirectCodec};
pub use error::{Result, VariantError};
pub use marshal::{FromValue, HostOnly, Marshal, PackedElement, ToValue};
pub use math::*;
pub use types::{ArgMetadata, ArgType, VariantType};
pub use value::{Array, Dictionary, ObjectId, Rid, SignalRef, Value};
pub use variant::{
    decode_variant, encode_variant, ext_variant_destroy, ext_variant_new_copy, release_variant,
    RawVariant, Variant, VariantRef,
};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::callable::Callable;
    pub use crate::error::{Result, VariantError};
    pub use crate::marshal::{FromValue, Marshal, ToValue};
    pub use crate::types::{ArgMetadata, ArgType, VariantType};
    pub use crate::value::{Array, Dictionary, ObjectId, Value};
    pub use crate::variant::{RawVariant, Variant, VariantRef};
}
