//! Error types for the extension bridge

use ext_signal::SignalError;
use ext_transport::TransportError;
use ext_variant::{VariantError, VariantType};
use thiserror::Error;

use crate::instance::InstanceHandle;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur in the bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Class shape or binding rejected at registration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Call failed
    #[error(transparent)]
    Call(#[from] CallError),

    /// Value conversion failed
    #[error(transparent)]
    Variant(#[from] VariantError),

    /// Signal operation failed
    #[error(transparent)]
    Signal(#[from] SignalError),

    /// Memory transport failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Handle does not name a live instance
    #[error("Instance {0:?} is not live")]
    StaleHandle(InstanceHandle),

    /// Instance is already executing a call on this thread
    #[error("Instance {0:?} is busy")]
    InstanceBusy(InstanceHandle),

    /// Class not registered
    #[error("Class '{0}' not registered")]
    ClassNotFound(String),

    /// Engine rejected an operation
    #[error("Engine error: {0}")]
    Engine(String),

    /// Bridge settings could not be loaded
    #[error("Failed to load settings from '{path}': {message}")]
    Settings { path: String, message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Create an engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }
}

/// Fatal class configuration errors, raised once at registration
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Class name missing
    #[error("Class name must not be empty")]
    EmptyName,

    /// Class name taken
    #[error("Class '{0}' is already registered")]
    DuplicateClass(String),

    /// Type does not have the shape of an extension class
    #[error("Class '{class}' is malformed: {reason}")]
    MalformedClass { class: String, reason: String },

    /// Parent class unknown to the engine and the registry
    #[error("Class '{class}' extends unknown class '{parent}'")]
    UnknownParent { class: String, parent: String },

    /// Member uses a type with no wire representation
    #[error("{class}.{member} uses a type with no wire representation")]
    Unrepresentable { class: String, member: String },

    /// Declared slot width cannot hold the host width
    #[error("{class}.{member}: {source}")]
    Width {
        class: String,
        member: String,
        source: VariantError,
    },

    /// Virtual override has the wrong shape
    #[error("{class}.{method} does not match virtual {virtual_name}: is {found}, want {expected}")]
    VirtualMismatch {
        class: String,
        method: String,
        virtual_name: String,
        expected: String,
        found: String,
    },

    /// Override names a method the engine never declared virtual
    #[error("{class}.{method} overrides no virtual of '{parent}'")]
    UnknownVirtual {
        class: String,
        method: String,
        parent: String,
    },

    /// Kind missing from the direct-call table
    #[error("{class}.{member} uses kind {kind} with no direct-call codec")]
    UnsupportedKind {
        class: String,
        member: String,
        kind: u32,
    },
}

/// Engine call error codes
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallErrorKind {
    Ok = 0,
    InvalidMethod = 1,
    InvalidArgument = 2,
    TooManyArguments = 3,
    TooFewArguments = 4,
    InstanceIsNull = 5,
    MethodNotConst = 6,
}

/// Call-local failure reported back to the engine
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    #[error("Method '{0}' does not exist")]
    InvalidMethod(String),

    #[error("Argument {index} cannot be converted to {expected}: {reason}")]
    InvalidArgument {
        index: usize,
        expected: VariantType,
        reason: String,
    },

    #[error("Too many arguments: expected {expected}, got {got}")]
    TooManyArguments { expected: usize, got: usize },

    #[error("Too few arguments: expected {expected}, got {got}")]
    TooFewArguments { expected: usize, got: usize },

    #[error("Instance is null")]
    InstanceIsNull,

    #[error("Call failed: {0}")]
    Failed(String),
}

impl CallError {
    /// Engine error code
    pub fn kind(&self) -> CallErrorKind {
        match self {
            CallError::InvalidMethod(_) | CallError::Failed(_) => CallErrorKind::InvalidMethod,
            CallError::InvalidArgument { .. } => CallErrorKind::InvalidArgument,
            CallError::TooManyArguments { .. } => CallErrorKind::TooManyArguments,
            CallError::TooFewArguments { .. } => CallErrorKind::TooFewArguments,
            CallError::InstanceIsNull => CallErrorKind::InstanceIsNull,
        }
    }

    /// Argument index, or expected count for arity errors
    pub fn argument(&self) -> i32 {
        match self {
            CallError::InvalidArgument { index, .. } => *index as i32,
            CallError::TooManyArguments { expected, .. }
            | CallError::TooFewArguments { expected, .. } => *expected as i32,
            _ => 0,
        }
    }

    /// Expected kind for argument errors
    pub fn expected(&self) -> i32 {
        match self {
            CallError::InvalidArgument { expected, .. } => *expected as i32,
            _ => 0,
        }
    }

    pub(crate) fn argument_error(index: usize, expected: VariantType, err: VariantError) -> Self {
        CallError::InvalidArgument {
            index,
            expected,
            reason: err.to_string(),
        }
    }
}
