//! Error types for value marshalling

use thiserror::Error;

use crate::types::{ArgMetadata, VariantType};

/// Result type for marshalling operations
pub type Result<T> = std::result::Result<T, VariantError>;

/// Errors raised while converting between host values and wire forms
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VariantError {
    /// Variant tag is not a known kind
    #[error("Invalid variant tag {0}")]
    InvalidTag(u32),

    /// Heap-backed variant carries a null payload pointer
    #[error("Variant of kind {0:?} has a null payload")]
    NullPayload(VariantType),

    /// Payload kind disagrees with the variant tag
    #[error("Variant tagged {tag:?} carries a {found:?} payload")]
    PayloadMismatch { tag: VariantType, found: VariantType },

    /// Value cannot be converted to the requested kind
    #[error("Cannot convert {from:?} to {to}")]
    Conversion { from: VariantType, to: String },

    /// Integer does not fit the target width
    #[error("Value {value} does not fit in {target}")]
    OutOfRange { value: i64, target: &'static str },

    /// Host type has no wire representation
    #[error("Type '{0}' has no wire representation")]
    Unrepresentable(&'static str),

    /// Declared slot width cannot hold the host width
    #[error("Host width {host:?} cannot be stored in a slot declared {declared:?}")]
    Narrowing {
        host: ArgMetadata,
        declared: ArgMetadata,
    },

    /// Integer and real metadata mixed in one slot
    #[error("No compatible width between {host:?} and {declared:?}")]
    IncompatibleWidth {
        host: ArgMetadata,
        declared: ArgMetadata,
    },

    /// Direct-call slot is smaller than the kind requires
    #[error("Slot for {kind:?} needs {needed} bytes, got {got}")]
    SlotTooSmall {
        kind: VariantType,
        needed: usize,
        got: usize,
    },

    /// Element rejected by a typed array
    #[error("Typed array of {expected:?} cannot hold {found:?}")]
    ArrayElement {
        expected: VariantType,
        found: VariantType,
    },

    /// Callable invocation failed
    #[error("Callable failed: {0}")]
    CallFailed(String),
}

impl VariantError {
    /// Create a conversion error
    pub fn conversion(from: VariantType, to: impl Into<String>) -> Self {
        Self::Conversion {
            from,
            to: to.into(),
        }
    }

    /// Create a callable failure
    pub fn call_failed(msg: impl Into<String>) -> Self {
        Self::CallFailed(msg.into())
    }
}
