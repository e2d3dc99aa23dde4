//! Class registration
//!
//! [`ClassRegistry::register`] validates an [`ExtensionClass`], submits it
//! to the engine and freezes it into a [`ClassDescriptor`]. Every check
//! runs before anything is submitted, and a class the engine rejects
//! halfway is withdrawn again, so a rejected class leaves no trace in the
//! engine or the registry.
//!
//! Method ids are positions in one flat binding table shared by all
//! classes. Id 0 is never assigned.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use ext_variant::{direct_codec, ArgMetadata, ArgType};
use parking_lot::{Mutex, RwLock};

use crate::binding::{ArgInfo, MethodBinding, MethodId, Signature};
use crate::class::{
    ClassBuilder, ClassDescriptor, ConstantDecl, ExtensionClass, MethodDecl, PropertyDescriptor,
    PropertyGroup, SignalDecl,
};
use crate::engine::{ClassId, ClassInfo, EngineInterface, MethodInfo, PropertyInfo};
use crate::error::{BridgeError, ConfigError, Result};
use crate::native::{NativeClassDb, VirtualSignature};
use crate::virtuals::convert_virtual_name;

/// Engine initialization stages
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitLevel {
    Core = 0,
    Servers = 1,
    /// Ordinary classes register here
    Scene = 2,
    /// Classes extending editor-only engine classes register here
    Editor = 3,
}

impl InitLevel {
    pub fn from_u32(level: u32) -> Option<Self> {
        match level {
            0 => Some(InitLevel::Core),
            1 => Some(InitLevel::Servers),
            2 => Some(InitLevel::Scene),
            3 => Some(InitLevel::Editor),
            _ => None,
        }
    }
}

struct Pending {
    name: &'static str,
    parent: &'static str,
    register: fn(&ClassRegistry) -> Result<Arc<ClassDescriptor>>,
}

/// Property validated but not yet given method ids
struct DraftProperty {
    info: PropertyInfo,
    group: Option<PropertyGroup>,
    getter: MethodBinding,
    setter: MethodBinding,
}

/// Every class registered by this extension
pub struct ClassRegistry {
    engine: Arc<dyn EngineInterface>,
    natives: Arc<NativeClassDb>,
    strict: bool,
    in_editor: bool,
    classes: RwLock<Vec<Arc<ClassDescriptor>>>,
    by_name: RwLock<HashMap<String, usize>>,
    methods: RwLock<Vec<Arc<MethodBinding>>>,
    pending: Mutex<Vec<Pending>>,
    // one registration at a time; lookups stay lock-free of it
    registering: Mutex<()>,
}

impl ClassRegistry {
    pub fn new(
        engine: Arc<dyn EngineInterface>,
        natives: Arc<NativeClassDb>,
        strict: bool,
        in_editor: bool,
    ) -> Self {
        Self {
            engine,
            natives,
            strict,
            in_editor,
            classes: RwLock::new(Vec::new()),
            by_name: RwLock::new(HashMap::new()),
            methods: RwLock::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            registering: Mutex::new(()),
        }
    }

    pub fn engine(&self) -> &Arc<dyn EngineInterface> {
        &self.engine
    }

    pub fn natives(&self) -> &NativeClassDb {
        &self.natives
    }

    pub fn in_editor(&self) -> bool {
        self.in_editor
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn method(&self, id: MethodId) -> Option<Arc<MethodBinding>> {
        let index = usize::try_from(id).ok()?.checked_sub(1)?;
        self.methods.read().get(index).cloned()
    }

    pub fn method_count(&self) -> usize {
        self.methods.read().len()
    }

    pub fn class(&self, name: &str) -> Option<Arc<ClassDescriptor>> {
        let index = *self.by_name.read().get(name)?;
        self.class_at(index)
    }

    pub fn class_at(&self, index: usize) -> Option<Arc<ClassDescriptor>> {
        self.classes.read().get(index).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.read().contains_key(name)
    }

    /// Registered classes, in registration order
    pub fn classes(&self) -> Vec<Arc<ClassDescriptor>> {
        self.classes.read().clone()
    }

    pub fn len(&self) -> usize {
        self.classes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `class` is `base` or derives from it, through extension and
    /// engine classes alike
    pub fn is_a(&self, class: &str, base: &str) -> bool {
        let mut current = class.to_owned();
        loop {
            if current == base {
                return true;
            }
            match self.class(&current) {
                Some(desc) => current = desc.parent.clone(),
                None => return self.natives.is_a(&current, base),
            }
        }
    }

    /// Defer registration of `T` to [`ClassRegistry::flush`]
    pub fn queue<T: ExtensionClass>(&self) {
        self.pending.lock().push(Pending {
            name: T::NAME,
            parent: T::PARENT,
            register: |registry| registry.register::<T>(),
        });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Init level a queued class registers at
    fn level_of(&self, parent: &str) -> InitLevel {
        let mut current = parent.to_owned();
        while let Some(desc) = self.class(&current) {
            current = desc.parent.clone();
        }
        if self.natives.caps(&current).editor_only {
            InitLevel::Editor
        } else {
            InitLevel::Scene
        }
    }

    /// Register every queued class belonging to `level`, in queue order.
    /// Failures are logged and returned; the remaining classes still
    /// register.
    pub fn flush(&self, level: InitLevel) -> Vec<(String, BridgeError)> {
        let due: Vec<Pending> = {
            let mut pending = self.pending.lock();
            let (due, rest) = pending
                .drain(..)
                .partition(|p| self.level_of(p.parent) == level);
            *pending = rest;
            due
        };
        let mut failures = Vec::new();
        for entry in due {
            if let Err(e) = (entry.register)(self) {
                log::error!("Failed to register class '{}': {e}", entry.name);
                failures.push((entry.name.to_owned(), e));
            }
        }
        failures
    }

    /// Submit a validated class with its members. A failure after the
    /// class itself was accepted unregisters it again.
    fn submit(
        &self,
        info: &ClassInfo,
        methods: &[MethodInfo],
        properties: &[PropertyDescriptor],
        signals: &[SignalDecl],
        constants: &[ConstantDecl],
    ) -> Result<ClassId> {
        let class_id = self.engine.submit_class(info)?;
        let members = || -> Result<()> {
            if !methods.is_empty() {
                self.engine.submit_methods(class_id, methods)?;
            }
            let mut group: Option<&PropertyGroup> = None;
            for property in properties {
                if let Some(next) = &property.group {
                    if group != Some(next) {
                        self.engine
                            .submit_property_group(class_id, &next.name, &next.prefix)?;
                    }
                }
                group = property.group.as_ref();
                self.engine.submit_property(
                    class_id,
                    &property.info,
                    &property.setter_name,
                    &property.getter_name,
                )?;
            }
            for signal in signals {
                self.engine.submit_signal(class_id, &signal.name, &signal.args)?;
            }
            for constant in constants {
                self.engine.submit_constant(
                    class_id,
                    &constant.enum_name,
                    &constant.name,
                    constant.value,
                    constant.is_bitfield,
                )?;
            }
            Ok(())
        };
        if let Err(e) = members() {
            log::warn!("Engine rejected a member of '{}', withdrawing the class", info.name);
            if let Err(undo) = self.engine.unregister_class(&info.name) {
                log::error!("Failed to withdraw '{}': {undo}", info.name);
            }
            return Err(e);
        }
        Ok(class_id)
    }

    /// Unregister every class, most recent first. Returns the names in the
    /// order they were removed.
    pub fn unregister_all(&self) -> Vec<String> {
        let _guard = self.registering.lock();
        let classes = std::mem::take(&mut *self.classes.write());
        self.by_name.write().clear();
        self.methods.write().clear();
        let mut removed = Vec::with_capacity(classes.len());
        for desc in classes.iter().rev() {
            if let Err(e) = self.engine.unregister_class(&desc.name) {
                log::warn!("Engine refused to unregister '{}': {e}", desc.name);
            }
            removed.push(desc.name.clone());
        }
        if !removed.is_empty() {
            log::info!("Unregistered {} classes", removed.len());
        }
        removed
    }

    /// Validate and submit `T`
    pub fn register<T: ExtensionClass>(&self) -> Result<Arc<ClassDescriptor>> {
        let _guard = self.registering.lock();
        let name = T::NAME;
        validate_name(name, T::PARENT)?;

        if self.contains(name) || self.natives.contains(name) {
            return Err(ConfigError::DuplicateClass(name.to_owned()).into());
        }
        let ext_parent = self.class(T::PARENT);
        let native_parent = match &ext_parent {
            Some(parent) => parent.native_parent.clone(),
            None if self.natives.contains(T::PARENT) => T::PARENT.to_owned(),
            None => {
                return Err(ConfigError::UnknownParent {
                    class: name.to_owned(),
                    parent: T::PARENT.to_owned(),
                }
                .into())
            }
        };
        let caps = self.natives.caps(&native_parent);
        let is_tool = T::TOOL || caps.editor_only;

        let mut builder = ClassBuilder::<T>::new();
        T::declare(&mut builder);
        let hooks = builder.hooks();

        let inherited = |method: &str| {
            self.natives.has_method(&native_parent, method)
                || ext_parent
                    .as_ref()
                    .is_some_and(|p| p.method_id(method).is_some())
        };

        // methods
        let mut methods: Vec<MethodBinding> = Vec::new();
        for decl in builder.methods.drain(..) {
            if inherited(&decl.name) {
                log::debug!("{name}.{} is defined by '{}', skipped", decl.name, T::PARENT);
                continue;
            }
            if methods.iter().any(|m| m.name() == decl.name) {
                log::warn!("{name}.{} declared twice, keeping the first", decl.name);
                continue;
            }
            if let Some(binding) = self.validate_method(name, decl)? {
                methods.push(binding);
            }
        }

        // properties
        let mut properties: Vec<DraftProperty> = Vec::new();
        for decl in builder.properties.drain(..) {
            if properties.iter().any(|p| p.info.name == decl.name) {
                log::warn!("{name}.{} declared twice, keeping the first", decl.name);
                continue;
            }
            let getter = self.validate_method(name, decl.getter)?;
            let setter = self.validate_method(name, decl.setter)?;
            let (Some(getter), Some(setter)) = (getter, setter) else {
                continue;
            };
            let Some(ty) = getter.ret() else {
                continue;
            };
            let mut info = PropertyInfo::new(decl.name, &ty);
            info.hint = decl.hint;
            info.usage = decl.usage;
            properties.push(DraftProperty {
                info,
                group: decl.group,
                getter,
                setter,
            });
        }

        // virtual overrides
        let virtuals = self.natives.virtuals(&native_parent);
        let by_host_name: HashMap<String, &VirtualSignature> = virtuals
            .values()
            .filter_map(|v| convert_virtual_name(&v.name).map(|host| (host, v)))
            .collect();
        let mut overrides: Vec<(String, MethodBinding)> = Vec::new();
        for decl in builder.overrides.drain(..) {
            let Some(expected) = by_host_name.get(decl.name.as_str()) else {
                return Err(ConfigError::UnknownVirtual {
                    class: name.to_owned(),
                    method: decl.name,
                    parent: T::PARENT.to_owned(),
                }
                .into());
            };
            check_virtual(name, &decl.name, &decl.signature, expected)?;
            let host_name = decl.name.clone();
            if let Some(binding) = self.validate_method(name, decl)? {
                overrides.push((host_name, binding));
            }
        }

        // defaults, read from a fresh instance
        let mut sample = (hooks.construct)();
        let defaults: Vec<Option<ext_variant::Value>> = properties
            .iter()
            .map(|p| {
                let value: &mut dyn Any = sample.as_mut();
                p.getter.invoke(Some(value), Vec::new()).ok()
            })
            .collect();

        // ids
        let method_base = self.method_count();
        let mut method_ids = HashMap::new();
        let mut infos: Vec<MethodInfo> = Vec::new();
        let mut descriptors = Vec::with_capacity(properties.len());
        let mut override_ids = HashMap::new();
        {
            let mut table = self.methods.write();
            let mut push = |binding: MethodBinding| -> MethodId {
                table.push(Arc::new(binding));
                table.len() as MethodId
            };
            for binding in methods {
                let method_name = binding.name().to_owned();
                let info_binding = binding.info(0);
                let id = push(binding);
                infos.push(MethodInfo {
                    userdata: id,
                    ..info_binding
                });
                method_ids.insert(method_name, id);
            }
            for (property, default) in properties.into_iter().zip(defaults) {
                let getter_name = property.getter.name().to_owned();
                let setter_name = property.setter.name().to_owned();
                let getter_info = property.getter.info(0);
                let setter_info = property.setter.info(0);
                let getter = push(property.getter);
                let setter = push(property.setter);
                infos.push(MethodInfo {
                    userdata: getter,
                    ..getter_info
                });
                infos.push(MethodInfo {
                    userdata: setter,
                    ..setter_info
                });
                method_ids.insert(getter_name.clone(), getter);
                method_ids.insert(setter_name.clone(), setter);
                descriptors.push(PropertyDescriptor {
                    info: property.info,
                    group: property.group,
                    getter,
                    setter,
                    getter_name,
                    setter_name,
                    default,
                });
            }
            for (host_name, binding) in overrides {
                override_ids.insert(host_name, push(binding));
            }
        }

        // engine
        let index = self.classes.read().len();
        let info = ClassInfo {
            name: name.to_owned(),
            parent: T::PARENT.to_owned(),
            is_virtual: false,
            is_abstract: T::ABSTRACT,
            is_exposed: true,
            is_runtime: T::RUNTIME_ONLY,
            icon_path: T::ICON.to_owned(),
            userdata: index as u64,
        };
        let class_id =
            match self.submit(&info, &infos, &descriptors, &builder.signals, &builder.constants) {
                Ok(id) => id,
                Err(e) => {
                    self.methods.write().truncate(method_base);
                    return Err(e);
                }
            };

        let property_index = descriptors
            .iter()
            .enumerate()
            .map(|(i, p)| (p.info.name.clone(), i))
            .collect();
        let desc = Arc::new(ClassDescriptor {
            index,
            class_id,
            name: name.to_owned(),
            parent: T::PARENT.to_owned(),
            native_parent,
            type_id: TypeId::of::<T>(),
            is_abstract: T::ABSTRACT,
            is_runtime_only: T::RUNTIME_ONLY,
            is_tool,
            icon: T::ICON.to_owned(),
            caps,
            properties: descriptors,
            property_index,
            methods: method_ids,
            virtuals,
            overrides: override_ids,
            signals: std::mem::take(&mut builder.signals),
            children: std::mem::take(&mut builder.children),
            resources: std::mem::take(&mut builder.resources),
            constants: std::mem::take(&mut builder.constants),
            hooks,
        });
        self.classes.write().push(desc.clone());
        self.by_name.write().insert(name.to_owned(), index);

        (desc.hooks.on_register)(sample.as_mut());

        if self.in_editor && caps.editor_plugin {
            self.engine.add_editor_plugin(name)?;
        }

        log::info!(
            "Registered class '{}' extends '{}' ({} methods, {} properties, {} signals)",
            name,
            T::PARENT,
            desc.methods.len(),
            desc.properties.len(),
            desc.signals.len()
        );
        Ok(desc)
    }

    /// Turn a declaration into a binding. `Ok(None)` skips a member with
    /// an unrepresentable type outside strict mode.
    fn validate_method(&self, class: &str, decl: MethodDecl) -> Result<Option<MethodBinding>> {
        if !decl.signature.is_representable() {
            if self.strict {
                return Err(ConfigError::Unrepresentable {
                    class: class.to_owned(),
                    member: decl.name,
                }
                .into());
            }
            log::warn!(
                "{class}.{} uses a type with no wire representation, skipped",
                decl.name
            );
            return Ok(None);
        }

        let mut args = Vec::with_capacity(decl.signature.args.len());
        for (index, host) in decl.signature.args.iter().flatten().enumerate() {
            let ty = resolve_width(class, &decl.name, *host, decl.declared_width(index), decl.narrowing)?;
            args.push(ArgInfo {
                name: decl.arg_name(index),
                ty,
            });
        }
        let ret = match decl.signature.ret {
            Some(host) if decl.signature.returns => Some(resolve_width(
                class,
                &decl.name,
                host,
                decl.return_width,
                decl.narrowing,
            )?),
            _ => None,
        };
        Ok(Some(MethodBinding::new(
            decl.name,
            args,
            ret,
            decl.flags,
            decl.invoker,
        )))
    }
}

impl std::fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassRegistry")
            .field("classes", &self.len())
            .field("methods", &self.method_count())
            .field("strict", &self.strict)
            .field("in_editor", &self.in_editor)
            .finish()
    }
}

fn validate_name(name: &str, parent: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ConfigError::EmptyName.into());
    }
    let malformed = |reason: &str| -> BridgeError {
        ConfigError::MalformedClass {
            class: name.to_owned(),
            reason: reason.to_owned(),
        }
        .into()
    };
    if !is_identifier(name) {
        return Err(malformed("name is not an identifier"));
    }
    if parent.is_empty() {
        return Err(malformed("no parent class"));
    }
    if parent == name {
        return Err(malformed("class extends itself"));
    }
    Ok(())
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn resolve_width(
    class: &str,
    member: &str,
    host: ArgType,
    declared: ArgMetadata,
    allow_narrowing: bool,
) -> Result<ArgType> {
    if direct_codec(host.variant_type.as_u32()).is_none() {
        return Err(ConfigError::UnsupportedKind {
            class: class.to_owned(),
            member: member.to_owned(),
            kind: host.variant_type.as_u32(),
        }
        .into());
    }
    let metadata = ArgMetadata::check_width(host.metadata, declared, allow_narrowing).map_err(
        |source| ConfigError::Width {
            class: class.to_owned(),
            member: member.to_owned(),
            source,
        },
    )?;
    Ok(ArgType { metadata, ..host })
}

fn check_virtual(
    class: &str,
    method: &str,
    found: &Signature,
    expected: &VirtualSignature,
) -> Result<()> {
    let args: Vec<_> = found
        .args
        .iter()
        .map(|a| a.map(|t| t.variant_type))
        .collect();
    let ret = found.ret.filter(|_| found.returns).map(|t| t.variant_type);
    let args_match = args.len() == expected.args.len()
        && args
            .iter()
            .zip(&expected.args)
            .all(|(a, e)| *a == Some(*e));
    let ret_match = found.returns == expected.ret.is_some() && ret == expected.ret;
    if args_match && ret_match {
        return Ok(());
    }
    Err(ConfigError::VirtualMismatch {
        class: class.to_owned(),
        method: method.to_owned(),
        virtual_name: expected.name.clone(),
        expected: expected.to_string(),
        found: found.describe(),
    }
    .into())
}
