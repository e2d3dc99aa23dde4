//! Virtual dispatch
//!
//! The engine asks for overrides by engine name (`_process`). The resolver
//! maps that to the host name the override was declared under, checks the
//! shape against the engine's virtual signature and caches the answer per
//! class, so later lookups do no conversion.

use std::collections::HashMap;
use std::sync::Arc;

use ext_variant::{Value, Variant, VariantRef};
use parking_lot::RwLock;

use crate::binding::{MethodBinding, MethodId};
use crate::call::{CallBridge, CallFrame};
use crate::class::ClassDescriptor;
use crate::error::Result;
use crate::instance::InstanceHandle;
use crate::registry::ClassRegistry;

/// Host name for an engine virtual.
///
/// The leading underscore is dropped. `_seek` and `_type_string` map to
/// `seek_to` and `type_to_string`. `_ready` never resolves: the bridge
/// runs its own ready pass and calls [`crate::ExtensionClass::ready`].
pub fn convert_virtual_name(engine_name: &str) -> Option<String> {
    let name = engine_name.strip_prefix('_')?;
    match name {
        "" | "ready" => None,
        "seek" => Some("seek_to".to_owned()),
        "type_string" => Some("type_to_string".to_owned()),
        other => Some(other.to_ascii_lowercase()),
    }
}

/// Resolved override, ready to be called
#[derive(Clone)]
pub struct Trampoline {
    id: MethodId,
    binding: Arc<MethodBinding>,
}

impl Trampoline {
    /// Method id handed to the engine
    pub fn id(&self) -> MethodId {
        self.id
    }

    pub fn binding(&self) -> &MethodBinding {
        &self.binding
    }

    pub fn call_direct(&self, calls: &CallBridge, handle: InstanceHandle, frame: &mut CallFrame) -> Result<()> {
        calls.call_direct(Some(handle), self.id, frame)
    }

    pub fn call_variant(&self, calls: &CallBridge, handle: InstanceHandle, args: &[VariantRef<'_>]) -> Result<Variant> {
        calls.call_variant(Some(handle), self.id, args)
    }

    /// Call with host values through the direct convention
    pub fn call(&self, calls: &CallBridge, handle: InstanceHandle, args: &[Value]) -> Result<Value> {
        calls.invoke_direct(Some(handle), self.id, args)
    }
}

impl std::fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trampoline")
            .field("id", &self.id)
            .field("method", &self.binding.name())
            .finish()
    }
}

type ClassCache = HashMap<String, Option<Trampoline>>;

/// Finds host overrides of engine virtuals
pub struct VirtualResolver {
    registry: Arc<ClassRegistry>,
    in_editor: bool,
    cache: RwLock<HashMap<usize, ClassCache>>,
}

impl VirtualResolver {
    pub fn new(registry: Arc<ClassRegistry>, in_editor: bool) -> Self {
        Self {
            registry,
            in_editor,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Override of `engine_name` on `class`, if any.
    ///
    /// Non-tool classes resolve nothing inside the editor.
    ///
    /// # Panics
    ///
    /// If the override's shape differs from the virtual's signature.
    pub fn resolve(&self, class: &ClassDescriptor, engine_name: &str) -> Option<Trampoline> {
        if self.in_editor && !class.is_tool() {
            return None;
        }
        if let Some(hit) = self
            .cache
            .read()
            .get(&class.index())
            .and_then(|c| c.get(engine_name))
        {
            return hit.clone();
        }
        let resolved = self.lookup(class, engine_name);
        self.cache
            .write()
            .entry(class.index())
            .or_default()
            .insert(engine_name.to_owned(), resolved.clone());
        resolved
    }

    /// Resolve by class name, as the engine callback does
    pub fn resolve_named(&self, class: &str, engine_name: &str) -> Option<Trampoline> {
        let desc = self.registry.class(class)?;
        self.resolve(&desc, engine_name)
    }

    /// Forget every cached answer. Class indices are reused once the
    /// registry is emptied.
    pub fn clear(&self) {
        self.cache.write().clear();
    }

    /// Number of cached answers
    pub fn cached(&self) -> usize {
        self.cache.read().values().map(HashMap::len).sum()
    }

    fn lookup(&self, class: &ClassDescriptor, engine_name: &str) -> Option<Trampoline> {
        let expected = class.virtual_signature(engine_name)?;
        let host_name = convert_virtual_name(engine_name)?;
        let id = class.override_id(&host_name)?;
        let binding = self.registry.method(id)?;

        let args = binding.arg_kinds();
        let ret = binding.ret().map(|r| r.variant_type);
        if args != expected.args || ret != expected.ret {
            panic!(
                "{}.{} does not match {}: is {:?} -> {:?}, want {}",
                class.name(),
                host_name,
                engine_name,
                args,
                ret,
                expected
            );
        }
        log::debug!("Resolved {}.{} to method #{id}", class.name(), engine_name);
        Some(Trampoline { id, binding })
    }
}
