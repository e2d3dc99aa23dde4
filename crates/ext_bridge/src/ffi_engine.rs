//! Engine interface over the C function table

use std::collections::HashMap;
use std::ffi::c_char;

use ext_signal::{Consumer, ConsumerFlags};
use ext_variant::{Callable, ObjectId, RawVariant, Value, Variant};
use parking_lot::Mutex;

use crate::callbacks::{ext_callable_call, ext_callable_free};
use crate::engine::{ClassId, ClassInfo, EngineInterface, MethodInfo, PropertyInfo};
use crate::error::{BridgeError, Result};
use crate::ffi::{
    c_string, EngineInterfaceTable, FfiCallable, FfiMethodInfo, OwnedClassInfo, OwnedMethodInfo,
    OwnedPropertyInfo, OwnedPropertyList, EXT_BRIDGE_API_VERSION,
};
use crate::instance::InstanceHandle;

const CLASS_NAME_BUFFER: usize = 64;

/// The real engine, reached through [`EngineInterfaceTable`]
pub struct FfiEngine {
    table: EngineInterfaceTable,
    // Callables handed to the engine, per object signal
    connections: Mutex<HashMap<(ObjectId, String), Vec<Consumer>>>,
}

impl FfiEngine {
    /// Wrap the engine's function table
    ///
    /// # Safety
    ///
    /// Every function pointer in `table` must be callable with
    /// `table.userdata` for the lifetime of the returned engine.
    pub unsafe fn new(table: EngineInterfaceTable) -> Result<Self> {
        if table.api_version != EXT_BRIDGE_API_VERSION {
            return Err(BridgeError::engine(format!(
                "API version mismatch: engine has {}, bridge expects {}",
                table.api_version, EXT_BRIDGE_API_VERSION
            )));
        }
        Ok(Self {
            table,
            connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn table(&self) -> &EngineInterfaceTable {
        &self.table
    }

    fn func<F: Copy>(&self, f: Option<F>, name: &str) -> Result<F> {
        f.ok_or_else(|| BridgeError::engine(format!("Engine function '{name}' not provided")))
    }

    fn check(ok: bool, what: impl FnOnce() -> String) -> Result<()> {
        if ok {
            Ok(())
        } else {
            Err(BridgeError::Engine(what()))
        }
    }
}

impl EngineInterface for FfiEngine {
    fn submit_class(&self, info: &ClassInfo) -> Result<ClassId> {
        let f = self.func(self.table.submit_class, "submit_class")?;
        let owned = OwnedClassInfo::new(info);
        match f(self.table.userdata, owned.as_ffi()) {
            0 => Err(BridgeError::engine(format!("Engine rejected class '{}'", info.name))),
            id => Ok(id),
        }
    }

    fn submit_methods(&self, class: ClassId, methods: &[MethodInfo]) -> Result<()> {
        if methods.is_empty() {
            return Ok(());
        }
        let f = self.func(self.table.submit_methods, "submit_methods")?;
        let owned: Vec<_> = methods.iter().map(OwnedMethodInfo::new).collect();
        let raw: Vec<FfiMethodInfo> = owned.iter().map(OwnedMethodInfo::as_ffi).collect();
        let ok = f(self.table.userdata, class, raw.as_ptr(), raw.len() as u32);
        Self::check(ok, || format!("Engine rejected methods of class #{class}"))
    }

    fn submit_property_group(&self, class: ClassId, group: &str, prefix: &str) -> Result<()> {
        let f = self.func(self.table.submit_property_group, "submit_property_group")?;
        let (group_c, prefix_c) = (c_string(group), c_string(prefix));
        let ok = f(self.table.userdata, class, group_c.as_ptr(), prefix_c.as_ptr());
        Self::check(ok, || format!("Engine rejected property group '{group}'"))
    }

    fn submit_property(
        &self,
        class: ClassId,
        property: &PropertyInfo,
        setter: &str,
        getter: &str,
    ) -> Result<()> {
        let f = self.func(self.table.submit_property, "submit_property")?;
        let owned = OwnedPropertyInfo::new(property);
        let raw = owned.as_ffi();
        let (setter_c, getter_c) = (c_string(setter), c_string(getter));
        let ok = f(self.table.userdata, class, &raw, setter_c.as_ptr(), getter_c.as_ptr());
        Self::check(ok, || format!("Engine rejected property '{}'", property.name))
    }

    fn submit_signal(&self, class: ClassId, signal: &str, args: &[PropertyInfo]) -> Result<()> {
        let f = self.func(self.table.submit_signal, "submit_signal")?;
        let name = c_string(signal);
        let list = OwnedPropertyList::new(args);
        let ok = f(self.table.userdata, class, name.as_ptr(), list.as_ptr(), list.len() as u32);
        Self::check(ok, || format!("Engine rejected signal '{signal}'"))
    }

    fn submit_constant(
        &self,
        class: ClassId,
        enum_name: &str,
        name: &str,
        value: i64,
        is_bitfield: bool,
    ) -> Result<()> {
        let f = self.func(self.table.submit_constant, "submit_constant")?;
        let (enum_c, name_c) = (c_string(enum_name), c_string(name));
        let ok = f(
            self.table.userdata,
            class,
            enum_c.as_ptr(),
            name_c.as_ptr(),
            value,
            is_bitfield,
        );
        Self::check(ok, || format!("Engine rejected constant '{name}'"))
    }

    fn unregister_class(&self, name: &str) -> Result<()> {
        let f = self.func(self.table.unregister_class, "unregister_class")?;
        let name_c = c_string(name);
        Self::check(f(self.table.userdata, name_c.as_ptr()), || {
            format!("Engine could not unregister '{name}'")
        })
    }

    fn construct_object(&self, class: &str) -> Result<ObjectId> {
        let f = self.func(self.table.construct_object, "construct_object")?;
        let class_c = c_string(class);
        match f(self.table.userdata, class_c.as_ptr()) {
            0 => Err(BridgeError::engine(format!("Engine could not construct '{class}'"))),
            id => Ok(ObjectId(id)),
        }
    }

    fn set_instance(&self, object: ObjectId, class: &str, instance: InstanceHandle) -> Result<()> {
        let f = self.func(self.table.set_instance, "set_instance")?;
        let class_c = c_string(class);
        let ok = f(self.table.userdata, object.0, class_c.as_ptr(), instance.to_bits());
        Self::check(ok, || format!("Engine could not attach {class} to {object}"))
    }

    fn init_ref(&self, object: ObjectId) -> Result<()> {
        let f = self.func(self.table.init_ref, "init_ref")?;
        Self::check(f(self.table.userdata, object.0), || {
            format!("Engine could not init reference of {object}")
        })
    }

    fn notify(&self, object: ObjectId, what: i32) -> Result<()> {
        let f = self.func(self.table.notify, "notify")?;
        Self::check(f(self.table.userdata, object.0, what), || {
            format!("Engine could not notify {object} of {what}")
        })
    }

    fn free_object(&self, object: ObjectId) -> Result<()> {
        let f = self.func(self.table.free_object, "free_object")?;
        Self::check(f(self.table.userdata, object.0), || {
            format!("Engine could not free {object}")
        })
    }

    fn get_class(&self, object: ObjectId) -> Option<String> {
        let f = self.table.get_class?;
        let mut buf = vec![0u8; CLASS_NAME_BUFFER];
        loop {
            let len = f(
                self.table.userdata,
                object.0,
                buf.as_mut_ptr() as *mut c_char,
                buf.len(),
            );
            if len == 0 {
                return None;
            }
            if len < buf.len() {
                buf.truncate(len);
                return String::from_utf8(buf).ok();
            }
            buf = vec![0u8; len + 1];
        }
    }

    fn is_editor_hint(&self) -> bool {
        self.table
            .is_editor_hint
            .map(|f| f(self.table.userdata))
            .unwrap_or(false)
    }

    fn add_editor_plugin(&self, class: &str) -> Result<()> {
        let f = self.func(self.table.add_editor_plugin, "add_editor_plugin")?;
        let class_c = c_string(class);
        Self::check(f(self.table.userdata, class_c.as_ptr()), || {
            format!("Engine could not add editor plugin '{class}'")
        })
    }

    fn get_node(&self, parent: ObjectId, path: &str) -> Option<ObjectId> {
        let f = self.table.get_node?;
        let path_c = c_string(path);
        match f(self.table.userdata, parent.0, path_c.as_ptr()) {
            0 => None,
            id => Some(ObjectId(id)),
        }
    }

    fn add_child(&self, parent: ObjectId, child: ObjectId, name: &str) -> Result<()> {
        let f = self.func(self.table.add_child, "add_child")?;
        let name_c = c_string(name);
        Self::check(f(self.table.userdata, parent.0, child.0, name_c.as_ptr()), || {
            format!("Engine could not add {child} under {parent}")
        })
    }

    fn signal_connect(
        &self,
        object: ObjectId,
        signal: &str,
        callable: &Callable,
        flags: ConsumerFlags,
    ) -> Result<()> {
        let f = self.func(self.table.signal_connect, "signal_connect")?;
        let signal_c = c_string(signal);
        let ffi = FfiCallable::new(callable, ext_callable_call, ext_callable_free);
        if !f(self.table.userdata, object.0, signal_c.as_ptr(), &ffi, flags.bits()) {
            ffi.discard();
            return Err(BridgeError::engine(format!(
                "Engine refused connection to '{signal}' on {object}"
            )));
        }
        self.connections
            .lock()
            .entry((object, signal.to_owned()))
            .or_default()
            .push(Consumer::new(callable.clone(), flags));
        Ok(())
    }

    fn signal_disconnect(&self, object: ObjectId, signal: &str, callable: &Callable) {
        if let Some(f) = self.table.signal_disconnect {
            let signal_c = c_string(signal);
            f(self.table.userdata, object.0, signal_c.as_ptr(), callable.id());
        }
        let mut connections = self.connections.lock();
        let key = (object, signal.to_owned());
        if let Some(list) = connections.get_mut(&key) {
            list.retain(|c| c.callable != *callable);
            if list.is_empty() {
                connections.remove(&key);
            }
        }
    }

    fn signal_is_connected(&self, object: ObjectId, signal: &str, callable: &Callable) -> bool {
        match self.table.signal_is_connected {
            Some(f) => {
                let signal_c = c_string(signal);
                f(self.table.userdata, object.0, signal_c.as_ptr(), callable.id())
            }
            None => false,
        }
    }

    fn signal_emit(&self, object: ObjectId, signal: &str, args: &[Value]) -> Result<()> {
        let f = self.func(self.table.signal_emit, "signal_emit")?;
        let signal_c = c_string(signal);
        // payloads stay owned here; the engine only borrows them
        let owned: Vec<Variant> = args.iter().cloned().map(Variant::new).collect();
        let raw: Vec<RawVariant> = owned.iter().map(|v| *v.as_raw()).collect();
        let ok = f(
            self.table.userdata,
            object.0,
            signal_c.as_ptr(),
            raw.as_ptr(),
            raw.len() as u32,
        );
        Self::check(ok, || format!("Engine could not emit '{signal}' on {object}"))
    }

    fn signal_connections(&self, object: ObjectId, signal: &str) -> Vec<Consumer> {
        self.connections
            .lock()
            .get(&(object, signal.to_owned()))
            .cloned()
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for FfiEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FfiEngine")
            .field("table", &self.table)
            .field("connections", &self.connections.lock().len())
            .finish()
    }
}
