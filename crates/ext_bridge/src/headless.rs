//! In-process engine
//!
//! [`HeadlessEngine`] implements [`EngineInterface`] with plain tables: it
//! records submitted classes, keeps an object tree with names and
//! notifications, and runs a native signal system with deferred and
//! one-shot delivery. The bridge runs against it unchanged, without a
//! native engine loaded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ext_signal::{Consumer, ConsumerFlags, DeferredQueue};
use ext_variant::{Callable, ObjectId, Value};
use parking_lot::{Mutex, RwLock};

use crate::engine::{ClassId, ClassInfo, EngineInterface, MethodInfo, PropertyInfo};
use crate::error::{BridgeError, Result};
use crate::instance::InstanceHandle;
use crate::native::NativeClassDb;

/// Everything submitted for one class
#[derive(Debug, Clone, PartialEq)]
pub struct ClassRecord {
    pub id: ClassId,
    pub info: ClassInfo,
    pub methods: Vec<MethodInfo>,
    /// Property with its setter and getter names
    pub properties: Vec<(PropertyInfo, String, String)>,
    /// Group name and prefix, in submission order
    pub groups: Vec<(String, String)>,
    pub signals: Vec<(String, Vec<PropertyInfo>)>,
    /// Enum name, constant name and value
    pub constants: Vec<(String, String, i64)>,
    /// Enums submitted as bitfields
    pub bitfields: Vec<String>,
}

#[derive(Debug, Clone)]
struct ObjectRecord {
    class: String,
    name: String,
    instance: Option<InstanceHandle>,
    refcount: i64,
    parent: Option<ObjectId>,
    children: Vec<ObjectId>,
    notifications: Vec<i32>,
}

/// Engine stand-in with no native code behind it
pub struct HeadlessEngine {
    natives: Arc<NativeClassDb>,
    editor: AtomicBool,
    next_class: AtomicU64,
    next_object: AtomicU64,
    classes: RwLock<HashMap<String, ClassRecord>>,
    objects: RwLock<HashMap<ObjectId, ObjectRecord>>,
    connections: Mutex<HashMap<(ObjectId, String), Vec<Consumer>>>,
    deferred: DeferredQueue,
    editor_plugins: Mutex<Vec<String>>,
    unregistered: Mutex<Vec<String>>,
    refused: Mutex<Vec<&'static str>>,
}

impl HeadlessEngine {
    pub fn new() -> Self {
        Self::with_natives(Arc::new(NativeClassDb::builtin()))
    }

    pub fn with_natives(natives: Arc<NativeClassDb>) -> Self {
        Self {
            natives,
            editor: AtomicBool::new(false),
            next_class: AtomicU64::new(1),
            next_object: AtomicU64::new(1),
            classes: RwLock::new(HashMap::new()),
            objects: RwLock::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            deferred: DeferredQueue::new(),
            editor_plugins: Mutex::new(Vec::new()),
            unregistered: Mutex::new(Vec::new()),
            refused: Mutex::new(Vec::new()),
        }
    }

    /// Run as the editor
    pub fn with_editor(self, editor: bool) -> Self {
        self.editor.store(editor, Ordering::Release);
        self
    }

    pub fn natives(&self) -> &Arc<NativeClassDb> {
        &self.natives
    }

    /// Run deferred signal deliveries, as the engine does once per frame
    pub fn process_frame(&self) -> usize {
        self.deferred.flush()
    }

    pub fn class_record(&self, name: &str) -> Option<ClassRecord> {
        self.classes.read().get(name).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    pub fn instance_of(&self, object: ObjectId) -> Option<InstanceHandle> {
        self.objects.read().get(&object)?.instance
    }

    pub fn refcount(&self, object: ObjectId) -> Option<i64> {
        self.objects.read().get(&object).map(|o| o.refcount)
    }

    pub fn notifications(&self, object: ObjectId) -> Vec<i32> {
        self.objects
            .read()
            .get(&object)
            .map(|o| o.notifications.clone())
            .unwrap_or_default()
    }

    pub fn name_of(&self, object: ObjectId) -> Option<String> {
        self.objects.read().get(&object).map(|o| o.name.clone())
    }

    pub fn children(&self, object: ObjectId) -> Vec<ObjectId> {
        self.objects
            .read()
            .get(&object)
            .map(|o| o.children.clone())
            .unwrap_or_default()
    }

    pub fn editor_plugins(&self) -> Vec<String> {
        self.editor_plugins.lock().clone()
    }

    /// Classes unregistered so far, in order
    pub fn unregistered(&self) -> Vec<String> {
        self.unregistered.lock().clone()
    }

    /// Make every later call of the named interface operation fail
    pub fn refuse(&self, operation: &'static str) {
        self.refused.lock().push(operation);
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        if self.refused.lock().contains(&operation) {
            return Err(BridgeError::engine(format!("{operation} refused")));
        }
        Ok(())
    }

    fn with_class<R>(&self, class: ClassId, f: impl FnOnce(&mut ClassRecord) -> R) -> Result<R> {
        let mut classes = self.classes.write();
        let record = classes
            .values_mut()
            .find(|c| c.id == class)
            .ok_or_else(|| BridgeError::engine(format!("Unknown class id {class}")))?;
        Ok(f(record))
    }

    fn with_object<R>(&self, object: ObjectId, f: impl FnOnce(&mut ObjectRecord) -> R) -> Result<R> {
        let mut objects = self.objects.write();
        let record = objects
            .get_mut(&object)
            .ok_or_else(|| BridgeError::engine(format!("Unknown object {object}")))?;
        Ok(f(record))
    }

    fn class_exists(&self, name: &str) -> bool {
        self.natives.contains(name) || self.classes.read().contains_key(name)
    }
}

impl Default for HeadlessEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineInterface for HeadlessEngine {
    fn submit_class(&self, info: &ClassInfo) -> Result<ClassId> {
        self.check("submit_class")?;
        if self.class_exists(&info.name) {
            return Err(BridgeError::engine(format!("Class '{}' exists", info.name)));
        }
        if !self.class_exists(&info.parent) {
            return Err(BridgeError::engine(format!(
                "Parent class '{}' does not exist",
                info.parent
            )));
        }
        let id = self.next_class.fetch_add(1, Ordering::Relaxed);
        self.classes.write().insert(
            info.name.clone(),
            ClassRecord {
                id,
                info: info.clone(),
                methods: Vec::new(),
                properties: Vec::new(),
                groups: Vec::new(),
                signals: Vec::new(),
                constants: Vec::new(),
                bitfields: Vec::new(),
            },
        );
        Ok(id)
    }

    fn submit_methods(&self, class: ClassId, methods: &[MethodInfo]) -> Result<()> {
        self.check("submit_methods")?;
        self.with_class(class, |c| c.methods.extend_from_slice(methods))
    }

    fn submit_property_group(&self, class: ClassId, group: &str, prefix: &str) -> Result<()> {
        self.with_class(class, |c| c.groups.push((group.to_owned(), prefix.to_owned())))
    }

    fn submit_property(
        &self,
        class: ClassId,
        property: &PropertyInfo,
        setter: &str,
        getter: &str,
    ) -> Result<()> {
        self.check("submit_property")?;
        self.with_class(class, |c| {
            let known = |name: &str| c.methods.iter().any(|m| m.name == name);
            if !known(setter) || !known(getter) {
                return Err(BridgeError::engine(format!(
                    "Property '{}' names unknown accessors",
                    property.name
                )));
            }
            c.properties
                .push((property.clone(), setter.to_owned(), getter.to_owned()));
            Ok(())
        })?
    }

    fn submit_signal(&self, class: ClassId, signal: &str, args: &[PropertyInfo]) -> Result<()> {
        self.check("submit_signal")?;
        self.with_class(class, |c| c.signals.push((signal.to_owned(), args.to_vec())))
    }

    fn submit_constant(
        &self,
        class: ClassId,
        enum_name: &str,
        name: &str,
        value: i64,
        is_bitfield: bool,
    ) -> Result<()> {
        self.check("submit_constant")?;
        self.with_class(class, |c| {
            c.constants
                .push((enum_name.to_owned(), name.to_owned(), value));
            if is_bitfield && !c.bitfields.iter().any(|b| b == enum_name) {
                c.bitfields.push(enum_name.to_owned());
            }
        })
    }

    fn unregister_class(&self, name: &str) -> Result<()> {
        if self.classes.write().remove(name).is_none() {
            return Err(BridgeError::engine(format!("Class '{name}' is not registered")));
        }
        self.unregistered.lock().push(name.to_owned());
        Ok(())
    }

    fn construct_object(&self, class: &str) -> Result<ObjectId> {
        self.check("construct_object")?;
        if !self.class_exists(class) {
            return Err(BridgeError::engine(format!("Cannot construct unknown class '{class}'")));
        }
        let id = ObjectId(self.next_object.fetch_add(1, Ordering::Relaxed));
        self.objects.write().insert(
            id,
            ObjectRecord {
                class: class.to_owned(),
                name: String::new(),
                instance: None,
                refcount: 0,
                parent: None,
                children: Vec::new(),
                notifications: Vec::new(),
            },
        );
        Ok(id)
    }

    fn set_instance(&self, object: ObjectId, class: &str, instance: InstanceHandle) -> Result<()> {
        self.check("set_instance")?;
        self.with_object(object, |o| {
            o.class = class.to_owned();
            o.instance = Some(instance);
        })
    }

    fn init_ref(&self, object: ObjectId) -> Result<()> {
        self.check("init_ref")?;
        self.with_object(object, |o| o.refcount = 1)
    }

    fn notify(&self, object: ObjectId, what: i32) -> Result<()> {
        self.check("notify")?;
        self.with_object(object, |o| o.notifications.push(what))
    }

    fn free_object(&self, object: ObjectId) -> Result<()> {
        let mut objects = self.objects.write();
        let record = objects
            .remove(&object)
            .ok_or_else(|| BridgeError::engine(format!("Unknown object {object}")))?;
        if let Some(parent) = record.parent.and_then(|p| objects.get_mut(&p)) {
            parent.children.retain(|c| *c != object);
        }
        drop(objects);
        self.connections.lock().retain(|(owner, _), _| *owner != object);
        Ok(())
    }

    fn get_class(&self, object: ObjectId) -> Option<String> {
        self.objects.read().get(&object).map(|o| o.class.clone())
    }

    fn is_editor_hint(&self) -> bool {
        self.editor.load(Ordering::Acquire)
    }

    fn add_editor_plugin(&self, class: &str) -> Result<()> {
        self.editor_plugins.lock().push(class.to_owned());
        Ok(())
    }

    fn get_node(&self, parent: ObjectId, path: &str) -> Option<ObjectId> {
        let objects = self.objects.read();
        let mut current = parent;
        for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
            let node = objects.get(&current)?;
            current = if part == ".." {
                node.parent?
            } else {
                *node
                    .children
                    .iter()
                    .find(|c| objects.get(*c).is_some_and(|o| o.name == part))?
            };
        }
        Some(current)
    }

    fn add_child(&self, parent: ObjectId, child: ObjectId, name: &str) -> Result<()> {
        let mut objects = self.objects.write();
        if !objects.contains_key(&parent) {
            return Err(BridgeError::engine(format!("Unknown object {parent}")));
        }
        let record = objects
            .get_mut(&child)
            .ok_or_else(|| BridgeError::engine(format!("Unknown object {child}")))?;
        if record.parent.is_some() {
            return Err(BridgeError::engine(format!("Object {child} already has a parent")));
        }
        record.parent = Some(parent);
        record.name = name.to_owned();
        if let Some(parent) = objects.get_mut(&parent) {
            parent.children.push(child);
        }
        Ok(())
    }

    fn signal_connect(
        &self,
        object: ObjectId,
        signal: &str,
        callable: &Callable,
        flags: ConsumerFlags,
    ) -> Result<()> {
        if !self.objects.read().contains_key(&object) {
            return Err(BridgeError::engine(format!("Unknown object {object}")));
        }
        let mut connections = self.connections.lock();
        let list = connections.entry((object, signal.to_owned())).or_default();
        if list.iter().any(|c| c.callable == *callable) {
            return Err(BridgeError::engine(format!(
                "Signal '{signal}' is already connected to callable {}",
                callable.id()
            )));
        }
        list.push(Consumer::new(callable.clone(), flags));
        Ok(())
    }

    fn signal_disconnect(&self, object: ObjectId, signal: &str, callable: &Callable) {
        if let Some(list) = self.connections.lock().get_mut(&(object, signal.to_owned())) {
            list.retain(|c| c.callable != *callable);
        }
    }

    fn signal_is_connected(&self, object: ObjectId, signal: &str, callable: &Callable) -> bool {
        self.connections
            .lock()
            .get(&(object, signal.to_owned()))
            .is_some_and(|list| list.iter().any(|c| c.callable == *callable))
    }

    fn signal_emit(&self, object: ObjectId, signal: &str, args: &[Value]) -> Result<()> {
        let snapshot = {
            let mut connections = self.connections.lock();
            let Some(list) = connections.get_mut(&(object, signal.to_owned())) else {
                return Ok(());
            };
            let snapshot = list.clone();
            list.retain(|c| !c.is_one_shot());
            snapshot
        };
        for consumer in snapshot {
            if consumer.is_deferred() {
                let args = args.to_vec();
                let name = signal.to_owned();
                self.deferred.push(move || {
                    if let Err(e) = consumer.callable.call(&args) {
                        log::warn!("Deferred consumer of '{name}' failed: {e}");
                    }
                });
            } else if let Err(e) = consumer.callable.call(args) {
                log::warn!("Consumer of '{signal}' failed: {e}");
            }
        }
        Ok(())
    }

    fn signal_connections(&self, object: ObjectId, signal: &str) -> Vec<Consumer> {
        self.connections
            .lock()
            .get(&(object, signal.to_owned()))
            .cloned()
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for HeadlessEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessEngine")
            .field("classes", &self.classes.read().len())
            .field("objects", &self.object_count())
            .field("editor", &self.is_editor_hint())
            .finish()
    }
}
