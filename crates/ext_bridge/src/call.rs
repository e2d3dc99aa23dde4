//! Method and property calls
//!
//! [`CallBridge`] resolves an instance handle and a method id, then runs
//! the binding through one of the two conventions:
//!
//! - variant: arguments are [`VariantRef`]s borrowed for the call and the
//!   result is an owned [`Variant`] whose payload goes to the caller.
//! - direct: arguments are fixed-width slots in a [`CallFrame`], read and
//!   written through the static codec table.
//!
//! Frames for calls that cross a memory boundary are loaded through the
//! bridge's [`MemoryTransport`], and host-initiated direct calls are staged
//! in a buffer checked out of the [`ScratchPool`].

use std::any::Any;
use std::sync::Arc;

use ext_transport::{MemoryTransport, RemoteAddr, ScratchPool};
use ext_variant::{
    read_direct, release_direct, write_direct, Value, Variant, VariantRef, VariantType,
};

use crate::binding::{MethodBinding, MethodId};
use crate::error::{BridgeError, CallError, Result};
use crate::instance::{HostState, InstanceHandle, InstanceTable};
use crate::registry::ClassRegistry;

const POINTER_SIZE: usize = 8;

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

struct Slot {
    kind: VariantType,
    bytes: Vec<u8>,
}

/// Argument slots and result slot of one direct call
pub struct CallFrame {
    args: Vec<Slot>,
    ret_kind: Option<VariantType>,
    ret: Vec<u8>,
    // staged frames own the payloads of their argument slots
    owns_args: bool,
    // result slot holds a payload nobody has taken
    ret_live: bool,
}

impl CallFrame {
    fn empty(ret_kind: Option<VariantType>, owns_args: bool) -> Self {
        Self {
            args: Vec::new(),
            ret_kind,
            ret: vec![0; ret_kind.map_or(0, |k| k.direct_size())],
            owns_args,
            ret_live: false,
        }
    }

    /// Encode host values into a frame owned by the caller
    pub fn stage(
        kinds: &[VariantType],
        values: &[Value],
        ret_kind: Option<VariantType>,
    ) -> Result<Self> {
        if values.len() != kinds.len() {
            let (expected, got) = (kinds.len(), values.len());
            return Err(if got > expected {
                CallError::TooManyArguments { expected, got }
            } else {
                CallError::TooFewArguments { expected, got }
            }
            .into());
        }
        let mut frame = Self::empty(ret_kind, true);
        for (index, (kind, value)) in kinds.iter().zip(values).enumerate() {
            let mut bytes = vec![0; kind.direct_size()];
            write_direct(*kind, value, &mut bytes)
                .map_err(|e| CallError::argument_error(index, *kind, e))?;
            frame.args.push(Slot { kind: *kind, bytes });
        }
        Ok(frame)
    }

    /// Wrap slots whose payloads belong to someone else
    ///
    /// # Safety
    ///
    /// Heap-kind slots must hold null or live payload pointers that stay
    /// valid for the lifetime of the frame.
    pub unsafe fn from_slots(args: Vec<(VariantType, Vec<u8>)>, ret_kind: Option<VariantType>) -> Self {
        let mut frame = Self::empty(ret_kind, false);
        frame.args = args
            .into_iter()
            .map(|(kind, bytes)| Slot { kind, bytes })
            .collect();
        frame
    }

    /// Copy a frame laid out by the engine: `args` points to an array of
    /// slot addresses, one per kind.
    ///
    /// # Safety
    ///
    /// `args` and every slot address must be readable through `transport`,
    /// and heap-kind slots must hold live payload pointers.
    pub unsafe fn load(
        transport: &dyn MemoryTransport,
        args: RemoteAddr,
        kinds: &[VariantType],
        ret_kind: Option<VariantType>,
    ) -> Result<Self> {
        let mut frame = Self::empty(ret_kind, false);
        if kinds.is_empty() {
            return Ok(frame);
        }
        let table = transport.read(args, kinds.len() * POINTER_SIZE)?;
        for (kind, entry) in kinds.iter().zip(table.chunks_exact(POINTER_SIZE)) {
            let mut addr = [0u8; POINTER_SIZE];
            addr.copy_from_slice(entry);
            let slot = RemoteAddr(u64::from_ne_bytes(addr));
            let bytes = transport.read(slot, kind.direct_size())?;
            frame.args.push(Slot { kind: *kind, bytes });
        }
        Ok(frame)
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn arg(&self, index: usize) -> &[u8] {
        &self.args[index].bytes
    }

    pub fn arg_kind(&self, index: usize) -> VariantType {
        self.args[index].kind
    }

    pub fn ret_kind(&self) -> Option<VariantType> {
        self.ret_kind
    }

    /// Whether the result slot holds an untaken value
    pub fn has_return(&self) -> bool {
        self.ret_live
    }

    pub fn return_bytes(&self) -> &[u8] {
        &self.ret
    }

    pub(crate) fn ret_slot(&mut self, kind: VariantType) -> &mut [u8] {
        if self.ret_kind != Some(kind) || self.ret.len() < kind.direct_size() {
            self.ret_kind = Some(kind);
            self.ret = vec![0; kind.direct_size()];
        }
        &mut self.ret
    }

    pub(crate) fn mark_returned(&mut self) {
        self.ret_live = true;
    }

    /// Decode and free the result
    pub fn take_return(&mut self) -> Result<Option<Value>> {
        let Some(kind) = self.ret_kind.filter(|_| self.ret_live) else {
            return Ok(None);
        };
        // SAFETY: a live result slot was written by `write_direct`
        let value = unsafe { read_direct(kind, &self.ret) };
        unsafe { release_direct(kind, &mut self.ret) };
        self.ret_live = false;
        Ok(Some(value?))
    }

    /// Hand the result to the engine at `addr`
    pub fn store(&mut self, transport: &dyn MemoryTransport, addr: RemoteAddr) -> Result<()> {
        if !self.ret_live {
            return Ok(());
        }
        transport.write(addr, &self.ret)?;
        self.ret_live = false;
        Ok(())
    }

    fn set_return(&mut self, kind: VariantType, bytes: Vec<u8>) {
        self.ret_kind = Some(kind);
        self.ret = bytes;
        self.ret_live = true;
    }
}

impl Drop for CallFrame {
    fn drop(&mut self) {
        if self.ret_live {
            if let Some(kind) = self.ret_kind {
                // SAFETY: written by `write_direct` and never handed out
                unsafe { release_direct(kind, &mut self.ret) };
            }
        }
        if self.owns_args {
            for slot in &mut self.args {
                // SAFETY: staged slots were written by `write_direct`
                unsafe { release_direct(slot.kind, &mut slot.bytes) };
            }
        }
    }
}

impl std::fmt::Debug for CallFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<_> = self.args.iter().map(|s| s.kind).collect();
        f.debug_struct("CallFrame")
            .field("args", &kinds)
            .field("ret_kind", &self.ret_kind)
            .field("ret_live", &self.ret_live)
            .finish()
    }
}

/// Byte layout of a frame staged in one scratch buffer
struct StagedLayout {
    ret: usize,
    slots: Vec<usize>,
    size: usize,
}

impl StagedLayout {
    fn new(kinds: &[VariantType], ret_kind: Option<VariantType>) -> Self {
        let ret = align8(kinds.len() * POINTER_SIZE);
        let mut offset = align8(ret + ret_kind.map_or(0, |k| k.direct_size()));
        let mut slots = Vec::with_capacity(kinds.len());
        for kind in kinds {
            slots.push(offset);
            offset = align8(offset + kind.direct_size());
        }
        Self {
            ret,
            slots,
            size: offset.max(POINTER_SIZE),
        }
    }
}

/// Executes bound methods and properties on live instances
pub struct CallBridge {
    registry: Arc<ClassRegistry>,
    instances: Arc<InstanceTable<HostState>>,
    scratch: ScratchPool,
}

impl CallBridge {
    pub fn new(
        registry: Arc<ClassRegistry>,
        instances: Arc<InstanceTable<HostState>>,
        scratch: ScratchPool,
    ) -> Self {
        Self {
            registry,
            instances,
            scratch,
        }
    }

    pub fn transport(&self) -> &Arc<dyn MemoryTransport> {
        self.scratch.transport()
    }

    pub fn scratch(&self) -> &ScratchPool {
        &self.scratch
    }

    fn binding(&self, method: MethodId) -> Result<Arc<MethodBinding>> {
        self.registry
            .method(method)
            .ok_or_else(|| CallError::InvalidMethod(format!("#{method}")).into())
    }

    fn live_state(&self, handle: InstanceHandle) -> Result<Arc<HostState>> {
        let state = self
            .instances
            .get(handle)
            .ok_or(BridgeError::StaleHandle(handle))?;
        if state.is_freed() {
            return Err(BridgeError::StaleHandle(handle));
        }
        Ok(state)
    }

    /// Run `f` with the receiver the binding expects. The instance lock
    /// is held for the whole call, so `destroy` cannot interleave.
    fn with_receiver<R>(
        &self,
        handle: Option<InstanceHandle>,
        binding: &MethodBinding,
        f: impl FnOnce(Option<&mut dyn Any>) -> R,
    ) -> Result<R> {
        if binding.is_static() {
            return Ok(f(None));
        }
        let handle = handle
            .filter(|h| !h.is_null())
            .ok_or(CallError::InstanceIsNull)?;
        let state = self.live_state(handle)?;
        state.with_value(|value| f(Some(value)))
    }

    /// Variant convention
    pub fn call_variant(
        &self,
        handle: Option<InstanceHandle>,
        method: MethodId,
        args: &[VariantRef<'_>],
    ) -> Result<Variant> {
        let binding = self.binding(method)?;
        let result = self.with_receiver(handle, &binding, |receiver| {
            binding.call_variant(receiver, args)
        })?;
        Ok(result?)
    }

    /// Direct convention over a local frame
    pub fn call_direct(
        &self,
        handle: Option<InstanceHandle>,
        method: MethodId,
        frame: &mut CallFrame,
    ) -> Result<()> {
        let binding = self.binding(method)?;
        self.with_receiver(handle, &binding, |receiver| {
            binding.call_direct(receiver, frame)
        })??;
        Ok(())
    }

    /// Direct convention over a frame in engine memory
    ///
    /// # Safety
    ///
    /// `args` must point to the slot-address array of a frame matching the
    /// method's declared layout, readable through the bridge transport, and
    /// `ret` must be writable for the result width.
    pub unsafe fn call_direct_remote(
        &self,
        handle: Option<InstanceHandle>,
        method: MethodId,
        args: RemoteAddr,
        ret: RemoteAddr,
    ) -> Result<()> {
        let binding = self.binding(method)?;
        let transport = self.transport().as_ref();
        let mut frame = CallFrame::load(
            transport,
            args,
            &binding.arg_kinds(),
            binding.ret().map(|r| r.variant_type),
        )?;
        self.with_receiver(handle, &binding, |receiver| {
            binding.call_direct(receiver, &mut frame)
        })??;
        if !ret.is_null() {
            frame.store(transport, ret)?;
        }
        Ok(())
    }

    /// Host-initiated direct call, staged through a scratch buffer
    pub fn invoke_direct(
        &self,
        handle: Option<InstanceHandle>,
        method: MethodId,
        args: &[Value],
    ) -> Result<Value> {
        let binding = self.binding(method)?;
        let kinds = binding.arg_kinds();
        let ret_kind = binding.ret().map(|r| r.variant_type);
        let mut staged = CallFrame::stage(&kinds, args, ret_kind)?;
        let layout = StagedLayout::new(&kinds, ret_kind);

        let mut buffer = self.scratch.checkout_for(layout.size)?;
        let base = buffer.addr();
        let mut table = Vec::with_capacity(kinds.len() * POINTER_SIZE);
        for (index, offset) in layout.slots.iter().enumerate() {
            buffer.write(*offset, staged.arg(index))?;
            table.extend_from_slice(&base.offset(*offset).0.to_ne_bytes());
        }
        buffer.write(0, &table)?;

        // SAFETY: the frame was laid out above in a buffer owned by the
        // transport, with payloads owned by `staged`
        unsafe { self.call_direct_remote(handle, method, base, base.offset(layout.ret))? };

        if let Some(kind) = ret_kind {
            let bytes = buffer.read(layout.ret, kind.direct_size())?;
            staged.set_return(kind, bytes);
        }
        buffer.release();
        Ok(staged.take_return()?.unwrap_or(Value::Nil))
    }

    /// Call a method by name with host values
    pub fn call(&self, handle: InstanceHandle, name: &str, args: Vec<Value>) -> Result<Value> {
        let state = self.live_state(handle)?;
        let method = state
            .class()
            .method_id(name)
            .ok_or_else(|| CallError::InvalidMethod(name.to_owned()))?;
        let binding = self.binding(method)?;
        let result = self.with_receiver(Some(handle), &binding, |receiver| {
            binding.invoke(receiver, args)
        })?;
        Ok(result?)
    }

    fn accessor(&self, handle: InstanceHandle, property: &str, setter: bool) -> Result<Option<MethodId>> {
        let state = self.live_state(handle)?;
        Ok(state
            .class()
            .property(property)
            .map(|p| if setter { p.setter } else { p.getter }))
    }

    /// Read a property; `None` when the class does not declare it
    pub fn get_property(&self, handle: InstanceHandle, property: &str) -> Result<Option<Value>> {
        let Some(getter) = self.accessor(handle, property, false)? else {
            return Ok(None);
        };
        let binding = self.binding(getter)?;
        let value = self.with_receiver(Some(handle), &binding, |receiver| {
            binding.invoke(receiver, Vec::new())
        })??;
        Ok(Some(value))
    }

    /// Write a property; `false` when the class does not declare it
    pub fn set_property(&self, handle: InstanceHandle, property: &str, value: Value) -> Result<bool> {
        let Some(setter) = self.accessor(handle, property, true)? else {
            return Ok(false);
        };
        let binding = self.binding(setter)?;
        self.with_receiver(Some(handle), &binding, |receiver| {
            binding.invoke(receiver, vec![value])
        })??;
        Ok(true)
    }

    /// Read a property into the frame's result slot
    pub fn get_property_direct(
        &self,
        handle: InstanceHandle,
        property: &str,
        frame: &mut CallFrame,
    ) -> Result<bool> {
        match self.accessor(handle, property, false)? {
            Some(getter) => self.call_direct(Some(handle), getter, frame).map(|_| true),
            None => Ok(false),
        }
    }

    /// Write a property from the frame's single argument slot
    pub fn set_property_direct(
        &self,
        handle: InstanceHandle,
        property: &str,
        frame: &mut CallFrame,
    ) -> Result<bool> {
        match self.accessor(handle, property, true)? {
            Some(setter) => self.call_direct(Some(handle), setter, frame).map(|_| true),
            None => Ok(false),
        }
    }

    /// Value the property had on a freshly constructed instance
    pub fn property_default(&self, handle: InstanceHandle, property: &str) -> Result<Option<Value>> {
        let state = self.live_state(handle)?;
        Ok(state
            .class()
            .property(property)
            .and_then(|p| p.default.clone()))
    }
}
