//! Host callables
//!
//! A callable wraps a host closure. Identity is assigned at construction
//! and survives cloning, so two clones of one callable compare equal while
//! two separately built callables never do.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::value::Value;

/// Closure type stored in a callable
pub type CallableFn = dyn Fn(&[Value]) -> Result<Value> + Send + Sync;

static NEXT_CALLABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity-compared host closure
#[derive(Clone)]
pub struct Callable {
    id: u64,
    name: Option<Arc<str>>,
    func: Arc<CallableFn>,
}

impl Callable {
    /// Wrap a closure
    pub fn from_fn<F>(func: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            id: NEXT_CALLABLE_ID.fetch_add(1, Ordering::Relaxed),
            name: None,
            func: Arc::new(func),
        }
    }

    /// Wrap a closure under a debug name
    pub fn named<F>(name: &str, func: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        let mut callable = Self::from_fn(func);
        callable.name = Some(Arc::from(name));
        callable
    }

    /// Identity of this callable
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Debug name, if any
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Invoke the closure
    pub fn call(&self, args: &[Value]) -> Result<Value> {
        (self.func)(args)
    }
}

impl PartialEq for Callable {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Callable {}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}
