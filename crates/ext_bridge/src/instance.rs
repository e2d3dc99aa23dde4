//! Instance handles and the handle table
//!
//! Every extension instance is reachable from the engine only through an
//! [`InstanceHandle`]: a 32-bit slot index plus a 32-bit generation. The
//! generation of a slot is bumped when its instance is removed, so a handle
//! kept past `free` no longer resolves.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ext_signal::{ChannelRelay, Signal};
use ext_variant::ObjectId;
use parking_lot::{Mutex, ReentrantMutex, RwLock};

use crate::class::ClassDescriptor;
use crate::error::{BridgeError, Result};

/// Opaque identifier the engine stores for an extension instance
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InstanceHandle(u64);

impl InstanceHandle {
    /// Never handed out
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Bits passed across the ABI
    #[inline]
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
}

impl fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "InstanceHandle(null)")
        } else {
            write!(f, "InstanceHandle({}v{})", self.index(), self.generation())
        }
    }
}

struct Slot<T> {
    // starts at 1 so that no live handle is null
    generation: u32,
    value: Option<Arc<T>>,
}

struct Slots<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

/// Generation-counted table, safe under concurrent insert/lookup/remove
pub struct InstanceTable<T> {
    inner: RwLock<Slots<T>>,
}

impl<T> InstanceTable<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    /// Insert a value built from its own handle
    pub fn insert_with(&self, build: impl FnOnce(InstanceHandle) -> T) -> (InstanceHandle, Arc<T>) {
        let mut inner = self.inner.write();
        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                inner.slots.push(Slot {
                    generation: 1,
                    value: None,
                });
                (inner.slots.len() - 1) as u32
            }
        };
        let slot = &mut inner.slots[index as usize];
        let handle = InstanceHandle::new(index, slot.generation);
        let value = Arc::new(build(handle));
        slot.value = Some(value.clone());
        inner.live += 1;
        (handle, value)
    }

    pub fn get(&self, handle: InstanceHandle) -> Option<Arc<T>> {
        let inner = self.inner.read();
        let slot = inner.slots.get(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.value.clone()
    }

    pub fn contains(&self, handle: InstanceHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Remove and invalidate `handle`. Returns `None` for stale handles.
    pub fn remove(&self, handle: InstanceHandle) -> Option<Arc<T>> {
        let mut inner = self.inner.write();
        let slot = inner.slots.get_mut(handle.index() as usize)?;
        if slot.generation != handle.generation() || slot.value.is_none() {
            return None;
        }
        let value = slot.value.take();
        slot.generation = match slot.generation.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        inner.free.push(handle.index());
        inner.live -= 1;
        value
    }

    pub fn len(&self) -> usize {
        self.inner.read().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handles of every live entry
    pub fn handles(&self) -> Vec<InstanceHandle> {
        let inner = self.inner.read();
        inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(index, slot)| InstanceHandle::new(index as u32, slot.generation))
            .collect()
    }
}

impl<T> Default for InstanceTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Host half of an engine object
pub struct HostState {
    handle: InstanceHandle,
    class: Arc<ClassDescriptor>,
    object: ObjectId,
    in_editor: bool,
    value: ReentrantMutex<RefCell<Box<dyn Any + Send>>>,
    pub(crate) signals: Mutex<Vec<Signal>>,
    pub(crate) relays: Mutex<Vec<ChannelRelay>>,
    pub(crate) ready_done: AtomicBool,
    pub(crate) freed: AtomicBool,
}

impl HostState {
    pub(crate) fn new(
        handle: InstanceHandle,
        class: Arc<ClassDescriptor>,
        object: ObjectId,
        value: Box<dyn Any + Send>,
        in_editor: bool,
    ) -> Self {
        Self {
            handle,
            class,
            object,
            in_editor,
            value: ReentrantMutex::new(RefCell::new(value)),
            signals: Mutex::new(Vec::new()),
            relays: Mutex::new(Vec::new()),
            ready_done: AtomicBool::new(false),
            freed: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> InstanceHandle {
        self.handle
    }

    pub fn class(&self) -> &Arc<ClassDescriptor> {
        &self.class
    }

    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// Non-tool instance living inside the editor
    pub fn in_editor(&self) -> bool {
        self.in_editor
    }

    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    pub fn signal_count(&self) -> usize {
        self.signals.lock().len()
    }

    pub fn relay_count(&self) -> usize {
        self.relays.lock().len()
    }

    /// Run `f` on the host value. Calls from other threads wait; a nested
    /// call on the same thread fails with [`BridgeError::InstanceBusy`].
    pub fn with_value<R>(&self, f: impl FnOnce(&mut dyn Any) -> R) -> Result<R> {
        let guard = self.value.lock();
        let mut cell = guard
            .try_borrow_mut()
            .map_err(|_| BridgeError::InstanceBusy(self.handle))?;
        let value: &mut dyn Any = &mut **cell;
        Ok(f(value))
    }

    /// Run `f` on the host value downcast to `T`
    pub fn with<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        self.with_value(|value| value.downcast_mut::<T>().map(f))?
            .ok_or_else(|| {
                BridgeError::engine(format!(
                    "Instance of '{}' is not a {}",
                    self.class.name(),
                    std::any::type_name::<T>()
                ))
            })
    }
}

impl fmt::Debug for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostState")
            .field("handle", &self.handle)
            .field("class", &self.class.name())
            .field("object", &self.object)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_bits() {
        let handle = InstanceHandle::new(7, 3);
        assert_eq!(handle.index(), 7);
        assert_eq!(handle.generation(), 3);
        assert_eq!(InstanceHandle::from_bits(handle.to_bits()), handle);
        assert!(InstanceHandle::NULL.is_null());
    }

    #[test]
    fn test_insert_get_remove() {
        let table = InstanceTable::new();
        let (a, _) = table.insert_with(|_| "a");
        let (b, _) = table.insert_with(|_| "b");
        assert!(!a.is_null());
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(a).as_deref(), Some(&"a"));

        assert_eq!(table.remove(a).as_deref(), Some(&"a"));
        assert!(table.get(a).is_none());
        assert!(table.remove(a).is_none());
        assert_eq!(table.handles(), vec![b]);
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let table = InstanceTable::new();
        let (old, _) = table.insert_with(|_| 1);
        table.remove(old);
        let (new, _) = table.insert_with(|_| 2);
        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert!(table.get(old).is_none());
        assert_eq!(table.get(new).as_deref(), Some(&2));
    }

    #[test]
    fn test_build_sees_own_handle() {
        let table = InstanceTable::new();
        let (handle, value) = table.insert_with(|h| h);
        assert_eq!(*value, handle);
    }
}
