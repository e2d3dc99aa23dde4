//! The engine as seen from the bridge
//!
//! [`EngineInterface`] collects every call the bridge makes into the
//! engine: class submission, object construction, node-tree access and the
//! native signal system. [`crate::FfiEngine`] implements it over the C
//! function table and [`crate::HeadlessEngine`] implements it in-process.

use ext_signal::{Consumer, ConsumerFlags};
use ext_variant::{ArgMetadata, ArgType, Callable, ObjectId, Value, VariantType};

use crate::error::Result;
use crate::flags::{MethodFlags, PropertyUsage};
use crate::instance::InstanceHandle;

/// Engine-assigned class identifier
pub type ClassId = u64;

/// Editor hints attached to a property
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PropertyHint {
    #[default]
    None,
    /// Numeric range
    Range { min: f64, max: f64, step: Option<f64> },
    /// One of the listed names
    Enum(Vec<String>),
    /// Any combination of the listed names
    Flags(Vec<String>),
    /// File path matching the filters
    File(String),
    /// Free text with several lines
    MultilineText,
    /// Raw engine hint id and string
    Custom { hint: u32, text: String },
}

impl PropertyHint {
    /// Engine hint id
    pub fn id(&self) -> u32 {
        match self {
            PropertyHint::None => 0,
            PropertyHint::Range { .. } => 1,
            PropertyHint::Enum(_) => 2,
            PropertyHint::Flags(_) => 6,
            PropertyHint::File(_) => 13,
            PropertyHint::MultilineText => 18,
            PropertyHint::Custom { hint, .. } => *hint,
        }
    }

    /// Engine hint string
    pub fn hint_string(&self) -> String {
        match self {
            PropertyHint::None | PropertyHint::MultilineText => String::new(),
            PropertyHint::Range { min, max, step } => match step {
                Some(step) => format!("{min},{max},{step}"),
                None => format!("{min},{max}"),
            },
            PropertyHint::Enum(names) | PropertyHint::Flags(names) => names.join(","),
            PropertyHint::File(filter) => filter.clone(),
            PropertyHint::Custom { text, .. } => text.clone(),
        }
    }
}

/// Property descriptor as submitted to the engine
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyInfo {
    pub name: String,
    pub variant_type: VariantType,
    pub class_name: String,
    pub hint: PropertyHint,
    pub usage: PropertyUsage,
}

impl PropertyInfo {
    /// Describe a value of `ty` named `name`
    pub fn new(name: impl Into<String>, ty: &ArgType) -> Self {
        let usage = if ty.variant_type == VariantType::Nil {
            PropertyUsage::DEFAULT | PropertyUsage::NIL_IS_VARIANT
        } else {
            PropertyUsage::DEFAULT
        };
        Self {
            name: name.into(),
            variant_type: ty.variant_type,
            class_name: ty.class_name.unwrap_or_default().to_owned(),
            hint: PropertyHint::None,
            usage,
        }
    }
}

/// Method descriptor as submitted to the engine
#[derive(Debug, Clone, PartialEq)]
pub struct MethodInfo {
    pub name: String,
    /// Method id passed back on every call
    pub userdata: u64,
    pub flags: MethodFlags,
    pub arguments: Vec<PropertyInfo>,
    pub argument_metadata: Vec<ArgMetadata>,
    pub return_value: Option<PropertyInfo>,
    pub return_metadata: ArgMetadata,
}

/// Class descriptor as submitted to the engine
#[derive(Debug, Clone, PartialEq)]
pub struct ClassInfo {
    pub name: String,
    pub parent: String,
    pub is_virtual: bool,
    pub is_abstract: bool,
    pub is_exposed: bool,
    pub is_runtime: bool,
    pub icon_path: String,
    /// Index of the class in the registry, passed back on create
    pub userdata: u64,
}

/// Everything the bridge asks of the engine
pub trait EngineInterface: Send + Sync {
    // ========== Registration ==========

    fn submit_class(&self, info: &ClassInfo) -> Result<ClassId>;

    fn submit_methods(&self, class: ClassId, methods: &[MethodInfo]) -> Result<()>;

    fn submit_property_group(&self, class: ClassId, group: &str, prefix: &str) -> Result<()>;

    fn submit_property(
        &self,
        class: ClassId,
        property: &PropertyInfo,
        setter: &str,
        getter: &str,
    ) -> Result<()>;

    fn submit_signal(&self, class: ClassId, signal: &str, args: &[PropertyInfo]) -> Result<()>;

    fn submit_constant(
        &self,
        class: ClassId,
        enum_name: &str,
        name: &str,
        value: i64,
        is_bitfield: bool,
    ) -> Result<()>;

    fn unregister_class(&self, name: &str) -> Result<()>;

    // ========== Objects ==========

    /// Construct a native object of `class`, the engine half of a pair
    fn construct_object(&self, class: &str) -> Result<ObjectId>;

    /// Attach an extension instance to an engine object
    fn set_instance(&self, object: ObjectId, class: &str, instance: InstanceHandle) -> Result<()>;

    /// Initialize the reference count of a reference-counted object
    fn init_ref(&self, object: ObjectId) -> Result<()>;

    /// Send a notification to an engine object
    fn notify(&self, object: ObjectId, what: i32) -> Result<()>;

    /// Destroy an engine object along with its native connections
    fn free_object(&self, object: ObjectId) -> Result<()>;

    /// Class of a live engine object
    fn get_class(&self, object: ObjectId) -> Option<String>;

    /// Whether the engine runs as the editor
    fn is_editor_hint(&self) -> bool;

    /// Register an editor plugin class with the editor
    fn add_editor_plugin(&self, class: &str) -> Result<()>;

    // ========== Node tree ==========

    /// Find a node by path relative to `parent`
    fn get_node(&self, parent: ObjectId, path: &str) -> Option<ObjectId>;

    /// Attach `child` under `parent` with the given name
    fn add_child(&self, parent: ObjectId, child: ObjectId, name: &str) -> Result<()>;

    // ========== Native signals ==========

    fn signal_connect(
        &self,
        object: ObjectId,
        signal: &str,
        callable: &Callable,
        flags: ConsumerFlags,
    ) -> Result<()>;

    fn signal_disconnect(&self, object: ObjectId, signal: &str, callable: &Callable);

    fn signal_is_connected(&self, object: ObjectId, signal: &str, callable: &Callable) -> bool;

    fn signal_emit(&self, object: ObjectId, signal: &str, args: &[Value]) -> Result<()>;

    fn signal_connections(&self, object: ObjectId, signal: &str) -> Vec<Consumer>;
}
