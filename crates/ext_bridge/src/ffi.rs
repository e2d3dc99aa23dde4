//! FFI types and function signatures for the engine ABI
//!
//! This module defines the C ABI types exchanged with the engine. All types
//! use `#[repr(C)]`. Descriptors handed to the engine are built from owned
//! buffers ([`OwnedPropertyInfo`], [`OwnedMethodInfo`], [`OwnedClassInfo`])
//! that must outlive the engine call they are passed to.

use std::ffi::{c_char, c_void, CStr, CString};

use ext_variant::{ArgType, Callable, RawVariant, VariantType};

use crate::engine::{ClassInfo, MethodInfo, PropertyInfo};
use crate::error::{CallError, CallErrorKind};

/// API version for compatibility checking
pub const EXT_BRIDGE_API_VERSION: u32 = 1;

/// Call outcome reported to the engine
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FfiCallError {
    /// [`CallErrorKind`] code
    pub error: u32,
    /// Failing argument index, or expected count for arity errors
    pub argument: i32,
    /// Expected variant kind for argument errors
    pub expected: i32,
}

impl FfiCallError {
    pub const OK: Self = Self {
        error: CallErrorKind::Ok as u32,
        argument: 0,
        expected: 0,
    };

    pub fn from_error(err: &CallError) -> Self {
        Self {
            error: err.kind() as u32,
            argument: err.argument(),
            expected: err.expected(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error == CallErrorKind::Ok as u32
    }
}

impl Default for FfiCallError {
    fn default() -> Self {
        Self::OK
    }
}

/// Property descriptor for FFI
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FfiPropertyInfo {
    pub variant_type: u32,
    pub name: *const c_char,
    pub class_name: *const c_char,
    pub hint: u32,
    pub hint_string: *const c_char,
    pub usage: u32,
}

unsafe impl Send for FfiPropertyInfo {}
unsafe impl Sync for FfiPropertyInfo {}

/// Method descriptor for FFI
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FfiMethodInfo {
    pub name: *const c_char,
    /// Method id passed back on every call
    pub method_userdata: u64,
    pub flags: u32,
    pub has_return: bool,
    pub return_value: FfiPropertyInfo,
    pub return_metadata: u32,
    pub argument_count: u32,
    pub arguments: *const FfiPropertyInfo,
    pub argument_metadata: *const u32,
}

/// Class descriptor for FFI
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FfiClassCreationInfo {
    pub name: *const c_char,
    pub parent: *const c_char,
    pub is_virtual: bool,
    pub is_abstract: bool,
    pub is_exposed: bool,
    pub is_runtime: bool,
    pub icon_path: *const c_char,
    /// Passed back to the create and virtual lookup callbacks
    pub class_userdata: u64,
}

/// Callable handed to the engine's signal system.
///
/// `userdata` owns a boxed [`Callable`]. Ownership passes to the engine
/// once `signal_connect` accepts it; the engine releases it with `free`.
#[repr(C)]
#[derive(Debug)]
pub struct FfiCallable {
    pub id: u64,
    pub userdata: *mut c_void,
    pub call: Option<CallableCallFn>,
    pub free: Option<CallableFreeFn>,
}

impl FfiCallable {
    /// Box a clone of `callable` behind the given entry points
    pub fn new(callable: &Callable, call: CallableCallFn, free: CallableFreeFn) -> Self {
        Self {
            id: callable.id(),
            userdata: Box::into_raw(Box::new(callable.clone())) as *mut c_void,
            call: Some(call),
            free: Some(free),
        }
    }

    /// Release the boxed callable without handing it over
    pub fn discard(self) {
        if let Some(free) = self.free {
            free(self.userdata);
        }
    }
}

// ========== Callback signatures ==========

pub type CallableCallFn = extern "C" fn(
    userdata: *mut c_void,
    args: *const RawVariant,
    argc: u32,
    ret: *mut RawVariant,
    error: *mut FfiCallError,
);
pub type CallableFreeFn = extern "C" fn(userdata: *mut c_void);

pub type CreateInstanceFn = extern "C" fn(class_userdata: u64, notify_postinit: bool) -> u64;
pub type FreeInstanceFn = extern "C" fn(instance: u64);
pub type InstanceSetFn = extern "C" fn(u64, *const c_char, *const RawVariant) -> bool;
pub type InstanceGetFn = extern "C" fn(u64, *const c_char, *mut RawVariant) -> bool;
pub type PropertyListFn = extern "C" fn(u64, *mut u32) -> *const FfiPropertyInfo;
pub type PropertyListFreeFn = extern "C" fn(u64, *const FfiPropertyInfo);
pub type PropertyCanRevertFn = extern "C" fn(u64, *const c_char) -> bool;
pub type PropertyGetRevertFn = extern "C" fn(u64, *const c_char, *mut RawVariant) -> bool;
pub type NotificationFn = extern "C" fn(u64, i32, bool);
pub type ToStringFn = extern "C" fn(u64, *mut bool, *mut RawVariant);
pub type ReferenceFn = extern "C" fn(u64, bool) -> bool;
pub type GetRidFn = extern "C" fn(u64) -> u64;
pub type GetVirtualFn = extern "C" fn(class_userdata: u64, name: *const c_char, hash: u32) -> u64;
pub type CallVirtualFn = extern "C" fn(u64, u64, *const *const c_void, *mut c_void);
pub type CheckedCallFn = extern "C" fn(u64, u64, *const *const c_void, *mut c_void);
pub type VariantCallFn = extern "C" fn(u64, u64, *const *const RawVariant, u32, *mut RawVariant);
pub type DynamicCallFn =
    extern "C" fn(u64, u64, *const *const RawVariant, u32, *mut RawVariant, *mut FfiCallError);
pub type InitializeFn = extern "C" fn(level: u32);
pub type FlushDeferredFn = extern "C" fn() -> u32;

/// Entry points the extension exposes to the engine
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FfiExtensionCallbacks {
    pub api_version: u32,
    pub create_instance: Option<CreateInstanceFn>,
    pub free_instance: Option<FreeInstanceFn>,
    pub set: Option<InstanceSetFn>,
    pub get: Option<InstanceGetFn>,
    pub property_list: Option<PropertyListFn>,
    pub property_list_free: Option<PropertyListFreeFn>,
    pub property_can_revert: Option<PropertyCanRevertFn>,
    pub property_get_revert: Option<PropertyGetRevertFn>,
    pub notification: Option<NotificationFn>,
    pub to_string: Option<ToStringFn>,
    pub reference: Option<ReferenceFn>,
    pub get_rid: Option<GetRidFn>,
    pub get_virtual: Option<GetVirtualFn>,
    pub call_virtual: Option<CallVirtualFn>,
    pub method_checked_call: Option<CheckedCallFn>,
    pub method_variant_call: Option<VariantCallFn>,
    pub method_dynamic_call: Option<DynamicCallFn>,
    pub initialize: Option<InitializeFn>,
    pub deinitialize: Option<InitializeFn>,
    pub flush_deferred: Option<FlushDeferredFn>,
}

// ========== Engine function table ==========

pub type SubmitClassFn = extern "C" fn(*mut c_void, *const FfiClassCreationInfo) -> u64;
pub type SubmitMethodsFn = extern "C" fn(*mut c_void, u64, *const FfiMethodInfo, u32) -> bool;
pub type SubmitPropertyGroupFn = extern "C" fn(*mut c_void, u64, *const c_char, *const c_char) -> bool;
pub type SubmitPropertyFn =
    extern "C" fn(*mut c_void, u64, *const FfiPropertyInfo, *const c_char, *const c_char) -> bool;
pub type SubmitSignalFn =
    extern "C" fn(*mut c_void, u64, *const c_char, *const FfiPropertyInfo, u32) -> bool;
pub type SubmitConstantFn =
    extern "C" fn(*mut c_void, u64, *const c_char, *const c_char, i64, bool) -> bool;
pub type NameFn = extern "C" fn(*mut c_void, *const c_char) -> bool;
pub type ConstructObjectFn = extern "C" fn(*mut c_void, *const c_char) -> u64;
pub type SetInstanceFn = extern "C" fn(*mut c_void, u64, *const c_char, u64) -> bool;
pub type ObjectFn = extern "C" fn(*mut c_void, u64) -> bool;
pub type NotifyFn = extern "C" fn(*mut c_void, u64, i32) -> bool;
pub type GetClassFn = extern "C" fn(*mut c_void, u64, *mut c_char, usize) -> usize;
pub type IsEditorHintFn = extern "C" fn(*mut c_void) -> bool;
pub type GetNodeFn = extern "C" fn(*mut c_void, u64, *const c_char) -> u64;
pub type AddChildFn = extern "C" fn(*mut c_void, u64, u64, *const c_char) -> bool;
pub type SignalConnectFn =
    extern "C" fn(*mut c_void, u64, *const c_char, *const FfiCallable, u32) -> bool;
pub type SignalDisconnectFn = extern "C" fn(*mut c_void, u64, *const c_char, u64);
pub type SignalIsConnectedFn = extern "C" fn(*mut c_void, u64, *const c_char, u64) -> bool;
pub type SignalEmitFn =
    extern "C" fn(*mut c_void, u64, *const c_char, *const RawVariant, u32) -> bool;

/// Engine functions callable from the extension
#[repr(C)]
pub struct EngineInterfaceTable {
    /// Opaque engine pointer passed to every function
    pub userdata: *mut c_void,
    pub api_version: u32,

    // Registration
    pub submit_class: Option<SubmitClassFn>,
    pub submit_methods: Option<SubmitMethodsFn>,
    pub submit_property_group: Option<SubmitPropertyGroupFn>,
    pub submit_property: Option<SubmitPropertyFn>,
    pub submit_signal: Option<SubmitSignalFn>,
    pub submit_constant: Option<SubmitConstantFn>,
    pub unregister_class: Option<NameFn>,

    // Objects
    pub construct_object: Option<ConstructObjectFn>,
    pub set_instance: Option<SetInstanceFn>,
    pub init_ref: Option<ObjectFn>,
    pub notify: Option<NotifyFn>,
    pub free_object: Option<ObjectFn>,
    /// Writes the class name into the buffer, returns its full length
    pub get_class: Option<GetClassFn>,
    pub is_editor_hint: Option<IsEditorHintFn>,
    pub add_editor_plugin: Option<NameFn>,

    // Node tree
    pub get_node: Option<GetNodeFn>,
    pub add_child: Option<AddChildFn>,

    // Native signals
    pub signal_connect: Option<SignalConnectFn>,
    pub signal_disconnect: Option<SignalDisconnectFn>,
    pub signal_is_connected: Option<SignalIsConnectedFn>,
    pub signal_emit: Option<SignalEmitFn>,
}

unsafe impl Send for EngineInterfaceTable {}
unsafe impl Sync for EngineInterfaceTable {}

impl Default for EngineInterfaceTable {
    fn default() -> Self {
        Self {
            userdata: std::ptr::null_mut(),
            api_version: EXT_BRIDGE_API_VERSION,
            submit_class: None,
            submit_methods: None,
            submit_property_group: None,
            submit_property: None,
            submit_signal: None,
            submit_constant: None,
            unregister_class: None,
            construct_object: None,
            set_instance: None,
            init_ref: None,
            notify: None,
            free_object: None,
            get_class: None,
            is_editor_hint: None,
            add_editor_plugin: None,
            get_node: None,
            add_child: None,
            signal_connect: None,
            signal_disconnect: None,
            signal_is_connected: None,
            signal_emit: None,
        }
    }
}

impl std::fmt::Debug for EngineInterfaceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineInterfaceTable")
            .field("userdata", &self.userdata)
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

// ========== Owned buffers ==========

/// C string copy of `s`; interior NULs are dropped
pub fn c_string(s: &str) -> CString {
    CString::new(s.replace('\0', "")).unwrap_or_default()
}

/// Borrow a C string from the engine
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string valid for `'a`.
pub unsafe fn str_from<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// [`FfiPropertyInfo`] with its strings
#[derive(Debug)]
pub struct OwnedPropertyInfo {
    _name: CString,
    _class_name: CString,
    _hint_string: CString,
    raw: FfiPropertyInfo,
}

impl OwnedPropertyInfo {
    pub fn new(info: &PropertyInfo) -> Self {
        let name = c_string(&info.name);
        let class_name = c_string(&info.class_name);
        let hint_string = c_string(&info.hint.hint_string());
        let raw = FfiPropertyInfo {
            variant_type: info.variant_type.as_u32(),
            name: name.as_ptr(),
            class_name: class_name.as_ptr(),
            hint: info.hint.id(),
            hint_string: hint_string.as_ptr(),
            usage: info.usage.bits(),
        };
        Self {
            _name: name,
            _class_name: class_name,
            _hint_string: hint_string,
            raw,
        }
    }

    pub fn as_ffi(&self) -> FfiPropertyInfo {
        self.raw
    }
}

/// A list of [`FfiPropertyInfo`] kept alive while the engine reads it
#[derive(Debug)]
pub struct OwnedPropertyList {
    _owned: Vec<OwnedPropertyInfo>,
    raw: Vec<FfiPropertyInfo>,
}

impl OwnedPropertyList {
    pub fn new(infos: &[PropertyInfo]) -> Self {
        let owned: Vec<_> = infos.iter().map(OwnedPropertyInfo::new).collect();
        let raw = owned.iter().map(OwnedPropertyInfo::as_ffi).collect();
        Self { _owned: owned, raw }
    }

    pub fn as_ptr(&self) -> *const FfiPropertyInfo {
        self.raw.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

/// [`FfiMethodInfo`] with its strings and arrays
#[derive(Debug)]
pub struct OwnedMethodInfo {
    _name: CString,
    _arguments: OwnedPropertyList,
    _metadata: Vec<u32>,
    _return_value: Option<OwnedPropertyInfo>,
    raw: FfiMethodInfo,
}

impl OwnedMethodInfo {
    pub fn new(info: &MethodInfo) -> Self {
        let name = c_string(&info.name);
        let arguments = OwnedPropertyList::new(&info.arguments);
        let metadata: Vec<u32> = info.argument_metadata.iter().map(|m| *m as u32).collect();
        let return_value = info.return_value.as_ref().map(OwnedPropertyInfo::new);
        let nil = OwnedPropertyInfo::new(&PropertyInfo::new("", &ArgType::of(VariantType::Nil)));
        let raw = FfiMethodInfo {
            name: name.as_ptr(),
            method_userdata: info.userdata,
            flags: info.flags.bits(),
            has_return: return_value.is_some(),
            return_value: return_value.as_ref().unwrap_or(&nil).as_ffi(),
            return_metadata: info.return_metadata as u32,
            argument_count: arguments.len() as u32,
            arguments: arguments.as_ptr(),
            argument_metadata: metadata.as_ptr(),
        };
        Self {
            _name: name,
            _arguments: arguments,
            _metadata: metadata,
            _return_value: return_value.or(Some(nil)),
            raw,
        }
    }

    pub fn as_ffi(&self) -> FfiMethodInfo {
        self.raw
    }
}

/// [`FfiClassCreationInfo`] with its strings
#[derive(Debug)]
pub struct OwnedClassInfo {
    _name: CString,
    _parent: CString,
    _icon_path: CString,
    raw: FfiClassCreationInfo,
}

impl OwnedClassInfo {
    pub fn new(info: &ClassInfo) -> Self {
        let name = c_string(&info.name);
        let parent = c_string(&info.parent);
        let icon_path = c_string(&info.icon_path);
        let raw = FfiClassCreationInfo {
            name: name.as_ptr(),
            parent: parent.as_ptr(),
            is_virtual: info.is_virtual,
            is_abstract: info.is_abstract,
            is_exposed: info.is_exposed,
            is_runtime: info.is_runtime,
            icon_path: icon_path.as_ptr(),
            class_userdata: info.userdata,
        };
        Self {
            _name: name,
            _parent: parent,
            _icon_path: icon_path,
            raw,
        }
    }

    pub fn as_ffi(&self) -> &FfiClassCreationInfo {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PropertyHint;
    use crate::flags::MethodFlags;
    use ext_variant::ArgMetadata;

    #[test]
    fn test_c_string_drops_nul() {
        assert_eq!(c_string("a\0b").to_str().unwrap(), "ab");
        assert!(unsafe { str_from(std::ptr::null()) }.is_none());
    }

    #[test]
    fn test_property_info_strings() {
        let mut info = PropertyInfo::new("speed", &ArgType::of(VariantType::Float));
        info.hint = PropertyHint::Range {
            min: 0.0,
            max: 10.0,
            step: None,
        };
        let owned = OwnedPropertyInfo::new(&info);
        let raw = owned.as_ffi();
        assert_eq!(raw.variant_type, VariantType::Float.as_u32());
        assert_eq!(raw.hint, 1);
        assert_eq!(unsafe { str_from(raw.name) }, Some("speed"));
        assert_eq!(unsafe { str_from(raw.hint_string) }, Some("0,10"));
    }

    #[test]
    fn test_method_info_arrays() {
        let info = MethodInfo {
            name: "add".into(),
            userdata: 7,
            flags: MethodFlags::NORMAL,
            arguments: vec![
                PropertyInfo::new("a", &ArgType::of(VariantType::Int)),
                PropertyInfo::new("b", &ArgType::of(VariantType::Int)),
            ],
            argument_metadata: vec![ArgMetadata::IntIsInt32, ArgMetadata::None],
            return_value: None,
            return_metadata: ArgMetadata::None,
        };
        let owned = OwnedMethodInfo::new(&info);
        let raw = owned.as_ffi();
        assert_eq!(raw.method_userdata, 7);
        assert!(!raw.has_return);
        assert_eq!(raw.argument_count, 2);
        let args = unsafe { std::slice::from_raw_parts(raw.arguments, 2) };
        assert_eq!(unsafe { str_from(args[1].name) }, Some("b"));
        let metadata = unsafe { std::slice::from_raw_parts(raw.argument_metadata, 2) };
        assert_eq!(metadata, &[ArgMetadata::IntIsInt32 as u32, 0]);
    }

    #[test]
    fn test_call_error_codes() {
        let err = CallError::TooFewArguments {
            expected: 2,
            got: 1,
        };
        let ffi = FfiCallError::from_error(&err);
        assert_eq!(ffi.error, 4);
        assert_eq!(ffi.argument, 2);
        assert!(FfiCallError::OK.is_ok());
    }
}
