//! Extension classes and their descriptors
//!
//! A host type becomes an engine class by implementing [`ExtensionClass`]
//! and describing its members to a [`ClassBuilder`]. Registration turns the
//! builder into an immutable [`ClassDescriptor`].
//!
//! ```ignore
//! #[derive(Default)]
//! struct Counter {
//!     value: i64,
//! }
//!
//! impl Counter {
//!     fn increment(&mut self) -> i64 {
//!         self.value += 1;
//!         self.value
//!     }
//! }
//!
//! impl ExtensionClass for Counter {
//!     const NAME: &'static str = "Counter";
//!     const PARENT: &'static str = "Node";
//!
//!     fn declare(class: &mut ClassBuilder<Self>) {
//!         class.property("value", |c: &Counter| c.value, |c: &mut Counter, v| c.value = v);
//!         class.method("increment", Counter::increment);
//!     }
//! }
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use ext_signal::{Signal, SignalSender};
use ext_variant::{ArgMetadata, ArgType, ObjectId, Value, VariantType};

use crate::binding::{Exclusive, Invoker, IntoMethod, IntoStaticMethod, MethodId, Shared, Signature};
use crate::engine::{ClassId, PropertyHint, PropertyInfo};
use crate::flags::{MethodFlags, PropertyUsage};
use crate::instance::InstanceHandle;
use crate::native::{NativeCaps, VirtualSignature};

/// What an instance learns about itself when created
#[derive(Debug, Clone)]
pub struct InstanceContext<'a> {
    pub handle: InstanceHandle,
    pub object: ObjectId,
    pub class: &'a str,
    /// Non-tool instance living inside the editor
    pub in_editor: bool,
}

/// A host type exposed to the engine as a class
pub trait ExtensionClass: Any + Send + Default {
    /// Engine-visible class name
    const NAME: &'static str;
    /// Engine or extension class this one extends
    const PARENT: &'static str;
    /// Run inside the editor like a game instance
    const TOOL: bool = false;
    const ABSTRACT: bool = false;
    const RUNTIME_ONLY: bool = false;
    const ICON: &'static str = "";

    /// Describe members
    fn declare(class: &mut ClassBuilder<Self>);

    /// Called once after registration on a throwaway instance
    fn on_register(&mut self) {}

    /// Called after the instance is paired with its engine object
    fn on_create(&mut self, _ctx: &InstanceContext<'_>) {}

    /// Called during teardown, after signals and resources are released
    fn on_free(&mut self) {}

    /// Called once after child nodes are in place
    fn ready(&mut self) {}

    fn notification(&mut self, _what: i32, _reversed: bool) {}

    /// Text the engine shows for the object
    fn stringify(&self) -> Option<String> {
        None
    }
}

/// Owned resource released when its instance is freed
pub trait Releasable {
    fn release(&mut self);
}

/// Field projection erased over the host value
pub(crate) trait FieldAccess<F: ?Sized>: Send + Sync {
    fn access<'a>(&self, value: &'a mut dyn Any) -> Option<&'a mut F>;
}

pub(crate) trait ResourceField: Send + Sync {
    fn release(&self, value: &mut dyn Any);
}

struct Field<T, F: ?Sized>(fn(&mut T) -> &mut F);

impl<T: 'static, F: ?Sized + 'static> FieldAccess<F> for Field<T, F> {
    fn access<'a>(&self, value: &'a mut dyn Any) -> Option<&'a mut F> {
        value.downcast_mut::<T>().map(self.0)
    }
}

impl<T: 'static, R: Releasable + 'static> ResourceField for Field<T, R> {
    fn release(&self, value: &mut dyn Any) {
        if let Some(resource) = value.downcast_mut::<T>().map(self.0) {
            resource.release();
        }
    }
}

/// Lifecycle hooks erased over the host value
pub(crate) struct ClassHooks {
    pub construct: Box<dyn Fn() -> Box<dyn Any + Send> + Send + Sync>,
    pub on_register: fn(&mut dyn Any),
    pub on_create: fn(&mut dyn Any, &InstanceContext<'_>),
    pub on_free: fn(&mut dyn Any),
    pub ready: fn(&mut dyn Any),
    pub notification: fn(&mut dyn Any, i32, bool),
    pub stringify: fn(&dyn Any) -> Option<String>,
}

impl ClassHooks {
    fn of<T: ExtensionClass>(constructor: Option<fn() -> T>) -> Self {
        Self {
            construct: match constructor {
                Some(ctor) => Box::new(move || Box::new(ctor()) as Box<dyn Any + Send>),
                None => Box::new(|| Box::new(T::default()) as Box<dyn Any + Send>),
            },
            on_register: |v| {
                if let Some(t) = v.downcast_mut::<T>() {
                    t.on_register();
                }
            },
            on_create: |v, ctx| {
                if let Some(t) = v.downcast_mut::<T>() {
                    t.on_create(ctx);
                }
            },
            on_free: |v| {
                if let Some(t) = v.downcast_mut::<T>() {
                    t.on_free();
                }
            },
            ready: |v| {
                if let Some(t) = v.downcast_mut::<T>() {
                    t.ready();
                }
            },
            notification: |v, what, reversed| {
                if let Some(t) = v.downcast_mut::<T>() {
                    t.notification(what, reversed);
                }
            },
            stringify: |v| v.downcast_ref::<T>().and_then(T::stringify),
        }
    }
}

/// Method as declared, before validation
pub struct MethodDecl {
    pub(crate) name: String,
    pub(crate) signature: Signature,
    pub(crate) arg_names: Vec<String>,
    pub(crate) widths: Vec<(usize, ArgMetadata)>,
    pub(crate) return_width: ArgMetadata,
    pub(crate) narrowing: bool,
    pub(crate) flags: MethodFlags,
    pub(crate) invoker: Arc<Invoker>,
}

impl MethodDecl {
    fn new(name: &str, signature: Signature, flags: MethodFlags, invoker: Arc<Invoker>) -> Self {
        Self {
            name: name.to_owned(),
            signature,
            arg_names: Vec::new(),
            widths: Vec::new(),
            return_width: ArgMetadata::None,
            narrowing: false,
            flags,
            invoker,
        }
    }

    /// Argument names reported to the engine
    pub fn args(&mut self, names: &[&str]) -> &mut Self {
        self.arg_names = names.iter().map(|n| (*n).to_owned()).collect();
        self
    }

    /// Declare the engine-side width of argument `index`
    pub fn width(&mut self, index: usize, width: ArgMetadata) -> &mut Self {
        self.widths.push((index, width));
        self
    }

    /// Declare the engine-side width of the return value
    pub fn return_width(&mut self, width: ArgMetadata) -> &mut Self {
        self.return_width = width;
        self
    }

    /// Accept declared widths narrower than the host type
    pub fn narrowing(&mut self) -> &mut Self {
        self.narrowing = true;
        self
    }

    pub fn editor_only(&mut self) -> &mut Self {
        self.flags = self.flags | MethodFlags::EDITOR;
        self
    }

    pub(crate) fn arg_name(&self, index: usize) -> String {
        self.arg_names
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("arg{index}"))
    }

    pub(crate) fn declared_width(&self, index: usize) -> ArgMetadata {
        self.widths
            .iter()
            .rev()
            .find(|(i, _)| *i == index)
            .map_or(ArgMetadata::None, |(_, w)| *w)
    }
}

/// Group header preceding a run of properties
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyGroup {
    pub name: String,
    pub prefix: String,
}

/// Property as declared, before validation
pub struct PropertyDecl {
    pub(crate) name: String,
    pub(crate) hint: PropertyHint,
    pub(crate) usage: PropertyUsage,
    pub(crate) group: Option<PropertyGroup>,
    pub(crate) getter: MethodDecl,
    pub(crate) setter: MethodDecl,
}

impl PropertyDecl {
    pub fn hint(&mut self, hint: PropertyHint) -> &mut Self {
        self.hint = hint;
        self
    }

    /// Range hint for numeric properties
    pub fn range(&mut self, min: f64, max: f64, step: Option<f64>) -> &mut Self {
        self.hint(PropertyHint::Range { min, max, step })
    }

    pub fn usage(&mut self, usage: PropertyUsage) -> &mut Self {
        self.usage = usage;
        self
    }

    /// Declare the engine-side width of the value
    pub fn width(&mut self, width: ArgMetadata) -> &mut Self {
        self.getter.return_width = width;
        self.setter.widths = vec![(0, width)];
        self
    }
}

pub(crate) enum SignalSlot {
    Emitter(Box<dyn FieldAccess<Signal>>),
    Channel(Box<dyn FieldAccess<SignalSender>>),
}

/// Signal declared by a field
pub struct SignalDecl {
    pub name: String,
    pub args: Vec<PropertyInfo>,
    pub(crate) slot: SignalSlot,
}

impl SignalDecl {
    /// Backed by a channel and a relay thread
    pub fn is_channel(&self) -> bool {
        matches!(self.slot, SignalSlot::Channel(_))
    }
}

/// Child node declared by a field
pub struct ChildDecl {
    /// Node path under the owner, also the child's name
    pub path: String,
    pub class: String,
    pub(crate) field: Box<dyn FieldAccess<ObjectId>>,
}

pub(crate) struct ResourceDecl {
    pub name: String,
    pub field: Box<dyn ResourceField>,
}

/// Integer constant, optionally in an enum or bitfield
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantDecl {
    pub enum_name: String,
    pub name: String,
    pub value: i64,
    pub is_bitfield: bool,
}

/// Collects the members of `T`
pub struct ClassBuilder<T> {
    pub(crate) constructor: Option<fn() -> T>,
    pub(crate) properties: Vec<PropertyDecl>,
    pub(crate) methods: Vec<MethodDecl>,
    pub(crate) overrides: Vec<MethodDecl>,
    pub(crate) signals: Vec<SignalDecl>,
    pub(crate) children: Vec<ChildDecl>,
    pub(crate) resources: Vec<ResourceDecl>,
    pub(crate) constants: Vec<ConstantDecl>,
    group: Option<PropertyGroup>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: ExtensionClass> ClassBuilder<T> {
    pub(crate) fn new() -> Self {
        Self {
            constructor: None,
            properties: Vec::new(),
            methods: Vec::new(),
            overrides: Vec::new(),
            signals: Vec::new(),
            children: Vec::new(),
            resources: Vec::new(),
            constants: Vec::new(),
            group: None,
            _marker: PhantomData,
        }
    }

    /// Use `ctor` instead of `Default` when the engine instantiates
    pub fn constructor(&mut self, ctor: fn() -> T) -> &mut Self {
        self.constructor = Some(ctor);
        self
    }

    /// Start a property group; following properties belong to it
    pub fn group(&mut self, name: &str, prefix: &str) -> &mut Self {
        self.group = Some(PropertyGroup {
            name: name.to_owned(),
            prefix: prefix.to_owned(),
        });
        self
    }

    pub fn end_group(&mut self) -> &mut Self {
        self.group = None;
        self
    }

    /// Exported property with `get_<name>`/`set_<name>` accessors
    pub fn property<V, G, S>(&mut self, name: &str, get: G, set: S) -> &mut PropertyDecl
    where
        V: ext_variant::Marshal,
        G: Fn(&T) -> V + Send + Sync + 'static,
        S: Fn(&mut T, V) + Send + Sync + 'static,
    {
        let mut setter = MethodDecl::new(
            &format!("set_{name}"),
            <S as IntoMethod<T, (Exclusive, (), V)>>::signature(),
            MethodFlags::NORMAL,
            <S as IntoMethod<T, (Exclusive, (), V)>>::into_invoker(set),
        );
        setter.arg_names = vec!["value".to_owned()];
        let getter = MethodDecl::new(
            &format!("get_{name}"),
            <G as IntoMethod<T, (Shared, V)>>::signature(),
            MethodFlags::NORMAL | MethodFlags::CONST,
            <G as IntoMethod<T, (Shared, V)>>::into_invoker(get),
        );
        self.properties.push(PropertyDecl {
            name: name.to_owned(),
            hint: PropertyHint::None,
            usage: PropertyUsage::DEFAULT,
            group: self.group.clone(),
            getter,
            setter,
        });
        let last = self.properties.len() - 1;
        &mut self.properties[last]
    }

    /// Instance method
    pub fn method<M, F: IntoMethod<T, M>>(&mut self, name: &str, f: F) -> &mut MethodDecl {
        let signature = F::signature();
        let flags = match signature.receiver {
            crate::binding::Receiver::Shared => MethodFlags::NORMAL | MethodFlags::CONST,
            _ => MethodFlags::NORMAL,
        };
        self.methods
            .push(MethodDecl::new(name, signature, flags, f.into_invoker()));
        let last = self.methods.len() - 1;
        &mut self.methods[last]
    }

    /// Function bound without an instance
    pub fn static_method<M, F: IntoStaticMethod<M>>(&mut self, name: &str, f: F) -> &mut MethodDecl {
        self.methods.push(MethodDecl::new(
            name,
            F::signature(),
            MethodFlags::NORMAL | MethodFlags::STATIC,
            f.into_invoker(),
        ));
        let last = self.methods.len() - 1;
        &mut self.methods[last]
    }

    /// Override of an engine virtual, named in host form (`process` for
    /// `_process`)
    pub fn override_virtual<M, F: IntoMethod<T, M>>(&mut self, name: &str, f: F) -> &mut MethodDecl {
        self.overrides.push(MethodDecl::new(
            name,
            F::signature(),
            MethodFlags::NORMAL | MethodFlags::VIRTUAL,
            f.into_invoker(),
        ));
        let last = self.overrides.len() - 1;
        &mut self.overrides[last]
    }

    /// Signal emitted through a [`Signal`] field
    pub fn signal(
        &mut self,
        name: &str,
        args: &[(&str, VariantType)],
        field: fn(&mut T) -> &mut Signal,
    ) -> &mut Self {
        self.signals.push(SignalDecl {
            name: name.to_owned(),
            args: signal_args(args),
            slot: SignalSlot::Emitter(Box::new(Field(field))),
        });
        self
    }

    /// Signal fed through a [`SignalSender`] field and a relay thread
    pub fn channel_signal(
        &mut self,
        name: &str,
        args: &[(&str, VariantType)],
        field: fn(&mut T) -> &mut SignalSender,
    ) -> &mut Self {
        self.signals.push(SignalDecl {
            name: name.to_owned(),
            args: signal_args(args),
            slot: SignalSlot::Channel(Box::new(Field(field))),
        });
        self
    }

    /// Child node asserted under the instance when it becomes ready
    pub fn child(&mut self, path: &str, class: &str, field: fn(&mut T) -> &mut ObjectId) -> &mut Self {
        self.children.push(ChildDecl {
            path: path.to_owned(),
            class: class.to_owned(),
            field: Box::new(Field(field)),
        });
        self
    }

    /// Resource released when the instance is freed
    pub fn resource<R: Releasable + 'static>(&mut self, name: &str, field: fn(&mut T) -> &mut R) -> &mut Self {
        self.resources.push(ResourceDecl {
            name: name.to_owned(),
            field: Box::new(Field(field)),
        });
        self
    }

    pub fn constant(&mut self, name: &str, value: i64) -> &mut Self {
        self.push_constant("", name, value, false)
    }

    pub fn enum_constant(&mut self, enum_name: &str, name: &str, value: i64) -> &mut Self {
        self.push_constant(enum_name, name, value, false)
    }

    pub fn bitfield_constant(&mut self, enum_name: &str, name: &str, value: i64) -> &mut Self {
        self.push_constant(enum_name, name, value, true)
    }

    fn push_constant(&mut self, enum_name: &str, name: &str, value: i64, is_bitfield: bool) -> &mut Self {
        self.constants.push(ConstantDecl {
            enum_name: enum_name.to_owned(),
            name: name.to_owned(),
            value,
            is_bitfield,
        });
        self
    }

    pub(crate) fn hooks(&self) -> ClassHooks {
        ClassHooks::of::<T>(self.constructor)
    }
}

fn signal_args(args: &[(&str, VariantType)]) -> Vec<PropertyInfo> {
    args.iter()
        .map(|(name, ty)| PropertyInfo::new(*name, &ArgType::of(*ty)))
        .collect()
}

/// Validated property
#[derive(Debug, Clone)]
pub struct PropertyDescriptor {
    pub info: PropertyInfo,
    pub group: Option<PropertyGroup>,
    pub getter: MethodId,
    pub setter: MethodId,
    pub getter_name: String,
    pub setter_name: String,
    /// Value on a freshly constructed instance
    pub default: Option<Value>,
}

/// Registered class, immutable for the life of the extension
pub struct ClassDescriptor {
    pub(crate) index: usize,
    pub(crate) class_id: ClassId,
    pub(crate) name: String,
    pub(crate) parent: String,
    pub(crate) native_parent: String,
    pub(crate) type_id: TypeId,
    pub(crate) is_abstract: bool,
    pub(crate) is_runtime_only: bool,
    pub(crate) is_tool: bool,
    pub(crate) icon: String,
    pub(crate) caps: NativeCaps,
    pub(crate) properties: Vec<PropertyDescriptor>,
    pub(crate) property_index: HashMap<String, usize>,
    pub(crate) methods: HashMap<String, MethodId>,
    pub(crate) virtuals: HashMap<String, VirtualSignature>,
    pub(crate) overrides: HashMap<String, MethodId>,
    pub(crate) signals: Vec<SignalDecl>,
    pub(crate) children: Vec<ChildDecl>,
    pub(crate) resources: Vec<ResourceDecl>,
    pub(crate) constants: Vec<ConstantDecl>,
    pub(crate) hooks: ClassHooks,
}

impl ClassDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> &str {
        &self.parent
    }

    /// Nearest engine class in the ancestry; constructed for each instance
    pub fn native_parent(&self) -> &str {
        &self.native_parent
    }

    /// Position in the registry, passed to the engine as class userdata
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn class_id(&self) -> ClassId {
        self.class_id
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    pub fn is_runtime_only(&self) -> bool {
        self.is_runtime_only
    }

    pub fn is_tool(&self) -> bool {
        self.is_tool
    }

    pub fn icon(&self) -> &str {
        &self.icon
    }

    pub fn caps(&self) -> NativeCaps {
        self.caps
    }

    pub fn properties(&self) -> &[PropertyDescriptor] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.property_index.get(name).map(|i| &self.properties[*i])
    }

    pub fn method_id(&self, name: &str) -> Option<MethodId> {
        self.methods.get(name).copied()
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Engine virtuals this class may override, by engine name
    pub fn virtual_signature(&self, engine_name: &str) -> Option<&VirtualSignature> {
        self.virtuals.get(engine_name)
    }

    /// Override registered under a host name
    pub fn override_id(&self, host_name: &str) -> Option<MethodId> {
        self.overrides.get(host_name).copied()
    }

    pub fn signals(&self) -> &[SignalDecl] {
        &self.signals
    }

    pub fn children(&self) -> &[ChildDecl] {
        &self.children
    }

    pub fn resource_names(&self) -> impl Iterator<Item = &str> {
        self.resources.iter().map(|r| r.name.as_str())
    }

    pub fn constants(&self) -> &[ConstantDecl] {
        &self.constants
    }

    /// Fresh host value, as the engine would get it
    pub fn construct(&self) -> Box<dyn Any + Send> {
        (self.hooks.construct)()
    }
}

impl std::fmt::Debug for ClassDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassDescriptor")
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("class_id", &self.class_id)
            .field("properties", &self.properties.len())
            .field("methods", &self.methods.len())
            .field("signals", &self.signals.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Lamp {
        on: bool,
        watts: i32,
        switched: Signal,
        flicker: SignalSender,
        bulb: ObjectId,
        cache: Cache,
    }

    #[derive(Default)]
    struct Cache {
        released: bool,
    }

    impl Releasable for Cache {
        fn release(&mut self) {
            self.released = true;
        }
    }

    impl Lamp {
        fn toggle(&mut self) -> bool {
            self.on = !self.on;
            self.on
        }
    }

    impl ExtensionClass for Lamp {
        const NAME: &'static str = "Lamp";
        const PARENT: &'static str = "Node";

        fn declare(class: &mut ClassBuilder<Self>) {
            class.group("Power", "power_");
            class
                .property("watts", |l: &Lamp| l.watts, |l: &mut Lamp, w| l.watts = w)
                .range(0.0, 200.0, Some(5.0));
            class.end_group();
            class.method("toggle", Lamp::toggle);
            class.signal("switched", &[("on", VariantType::Bool)], |l| &mut l.switched);
            class.channel_signal("flicker", &[], |l| &mut l.flicker);
            class.child("Bulb", "Sprite2D", |l| &mut l.bulb);
            class.resource("cache", |l| &mut l.cache);
            class.enum_constant("Mode", "MODE_WARM", 0);
            class.bitfield_constant("Flags", "FLAG_DIM", 1);
        }
    }

    fn builder() -> ClassBuilder<Lamp> {
        let mut builder = ClassBuilder::new();
        Lamp::declare(&mut builder);
        builder
    }

    #[test]
    fn test_builder_collects_members() {
        let builder = builder();
        assert_eq!(builder.properties.len(), 1);
        let watts = &builder.properties[0];
        assert_eq!(watts.getter.name, "get_watts");
        assert_eq!(watts.setter.name, "set_watts");
        assert_eq!(watts.group.as_ref().map(|g| g.prefix.as_str()), Some("power_"));
        assert_eq!(watts.hint.hint_string(), "0,200,5");
        assert!(watts.getter.flags.contains(MethodFlags::CONST));

        assert_eq!(builder.methods.len(), 1);
        assert_eq!(builder.signals.len(), 2);
        assert!(builder.signals[1].is_channel());
        assert_eq!(builder.children[0].class, "Sprite2D");
        assert_eq!(builder.constants.len(), 2);
        assert!(builder.constants[1].is_bitfield);
    }

    #[test]
    fn test_field_access() {
        let builder = builder();
        let mut value: Box<dyn Any + Send> = Box::new(Lamp::default());
        let any: &mut dyn Any = value.as_mut();

        *builder.children[0].field.access(any).unwrap() = ObjectId(9);
        builder.resources[0].field.release(any);
        let lamp = any.downcast_ref::<Lamp>().unwrap();
        assert_eq!(lamp.bulb, ObjectId(9));
        assert!(lamp.cache.released);
    }

    #[test]
    fn test_hooks_use_constructor() {
        let mut builder = builder();
        builder.constructor(|| Lamp {
            watts: 60,
            ..Default::default()
        });
        let hooks = builder.hooks();
        let value = (hooks.construct)();
        assert_eq!(value.downcast_ref::<Lamp>().map(|l| l.watts), Some(60));
        assert_eq!((hooks.stringify)(value.as_ref()), None);
    }

    #[test]
    fn test_declared_widths() {
        let mut builder = builder();
        builder
            .method("toggle", Lamp::toggle)
            .width(0, ArgMetadata::IntIsInt8)
            .width(0, ArgMetadata::IntIsInt16);
        let decl = builder.methods.last().unwrap();
        assert_eq!(decl.declared_width(0), ArgMetadata::IntIsInt16);
        assert_eq!(decl.declared_width(1), ArgMetadata::None);
        assert_eq!(decl.arg_name(0), "arg0");
    }
}
