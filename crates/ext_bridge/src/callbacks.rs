//! `extern "C"` entry points called by the engine
//!
//! Every callback runs its body inside [`std::panic::catch_unwind`] so that
//! no panic unwinds into the engine. Failures are logged and answered with
//! the callback's neutral value (`0`, `false`, nil). An instance handle
//! that no longer resolves is a fatal engine/extension desync: it is logged
//! and the process aborts.
//!
//! The callbacks reach the bridge installed with
//! [`ExtensionBridge::install`]. [`callback_table`] collects them for the
//! engine.

use std::any::Any;
use std::collections::HashMap;
use std::ffi::{c_char, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use ext_transport::RemoteAddr;
use ext_variant::{decode_variant, Callable, RawVariant, Value, Variant, VariantRef};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::bridge::ExtensionBridge;
use crate::engine::PropertyInfo;
use crate::error::{BridgeError, CallError, Result};
use crate::ffi::{
    str_from, FfiCallError, FfiExtensionCallbacks, FfiPropertyInfo, OwnedPropertyList,
    EXT_BRIDGE_API_VERSION,
};
use crate::instance::InstanceHandle;
use crate::registry::InitLevel;

// Property lists handed out and not yet freed, keyed by address
static PROPERTY_LISTS: Lazy<Mutex<HashMap<usize, OwnedPropertyList>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

/// Run a callback body without letting a panic escape
fn catch<R>(name: &str, fallback: R, f: impl FnOnce() -> Result<R>) -> R {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => value,
        Ok(Err(BridgeError::StaleHandle(handle))) => {
            log::error!("{name}: instance {handle:?} is not live, aborting");
            std::process::abort();
        }
        Ok(Err(e)) => {
            log::warn!("{name}: {e}");
            fallback
        }
        Err(payload) => {
            log::error!("{name} panicked: {}", panic_message(payload));
            fallback
        }
    }
}

/// [`catch`] with the installed bridge
fn guard<R>(name: &str, fallback: R, f: impl FnOnce(&ExtensionBridge) -> Result<R>) -> R {
    catch(name, fallback, || {
        let bridge = ExtensionBridge::global()
            .ok_or_else(|| BridgeError::engine("No extension bridge installed"))?;
        f(bridge)
    })
}

fn handle(bits: u64) -> InstanceHandle {
    InstanceHandle::from_bits(bits)
}

/// Static methods are called with a null instance
fn receiver(bits: u64) -> Option<InstanceHandle> {
    (bits != 0).then(|| handle(bits))
}

/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn name_arg<'a>(ptr: *const c_char) -> Result<&'a str> {
    str_from(ptr).ok_or_else(|| BridgeError::engine("Name is null or not UTF-8"))
}

/// # Safety
///
/// `args` must be null or point to `argc` pointers, each satisfying the
/// [`VariantRef::from_ptr`] contract for the duration of the call.
unsafe fn variant_args<'a>(args: *const *const RawVariant, argc: u32) -> Result<Vec<VariantRef<'a>>> {
    if args.is_null() || argc == 0 {
        return Ok(Vec::new());
    }
    (0..argc as usize)
        .map(|i| {
            VariantRef::from_ptr(*args.add(i)).ok_or_else(|| {
                CallError::Failed(format!("Argument {i} is a null pointer")).into()
            })
        })
        .collect()
}

/// # Safety
///
/// `dst` must be null or valid for writes.
unsafe fn write_variant(dst: *mut RawVariant, value: Value) {
    if !dst.is_null() {
        dst.write(Variant::new(value).into_raw());
    }
}

// ========== Lifecycle ==========

/// Create an instance of the class registered at `class_userdata`;
/// returns the engine object, or 0
#[no_mangle]
pub extern "C" fn ext_create_instance(class_userdata: u64, notify_postinit: bool) -> u64 {
    guard("create_instance", 0, |bridge| {
        let desc = bridge
            .registry()
            .class_at(class_userdata as usize)
            .ok_or_else(|| BridgeError::engine(format!("No class at index {class_userdata}")))?;
        let (_, object) = bridge.lifecycle().create(&desc, notify_postinit)?;
        Ok(object.0)
    })
}

#[no_mangle]
pub extern "C" fn ext_free_instance(instance: u64) {
    guard("free_instance", (), |bridge| {
        bridge.lifecycle().destroy(handle(instance))
    })
}

// ========== Per-instance ==========

#[no_mangle]
pub extern "C" fn ext_instance_set(instance: u64, name: *const c_char, value: *const RawVariant) -> bool {
    guard("instance_set", false, |bridge| {
        // SAFETY: the engine passes a valid name and a variant it owns for the call
        let (name, value) = unsafe { (name_arg(name)?, VariantRef::from_ptr(value)) };
        let value = value.map(|v| v.to_value()).transpose()?.unwrap_or(Value::Nil);
        bridge.calls().set_property(handle(instance), name, value)
    })
}

#[no_mangle]
pub extern "C" fn ext_instance_get(instance: u64, name: *const c_char, ret: *mut RawVariant) -> bool {
    guard("instance_get", false, |bridge| {
        // SAFETY: the engine passes a valid name
        let name = unsafe { name_arg(name)? };
        match bridge.calls().get_property(handle(instance), name)? {
            Some(value) => {
                // SAFETY: `ret` is the engine's result slot
                unsafe { write_variant(ret, value) };
                Ok(true)
            }
            None => Ok(false),
        }
    })
}

/// Properties of the instance's class; the list stays valid until
/// [`ext_property_list_free`]
#[no_mangle]
pub extern "C" fn ext_property_list(instance: u64, count: *mut u32) -> *const FfiPropertyInfo {
    let list = guard("property_list", ptr::null(), |bridge| {
        let state = bridge.lifecycle().instance(handle(instance))?;
        let infos: Vec<PropertyInfo> = state
            .class()
            .properties()
            .iter()
            .map(|p| p.info.clone())
            .collect();
        if !count.is_null() {
            // SAFETY: `count` is the engine's out parameter
            unsafe { count.write(infos.len() as u32) };
        }
        if infos.is_empty() {
            return Ok(ptr::null());
        }
        let list = OwnedPropertyList::new(&infos);
        let ptr = list.as_ptr();
        PROPERTY_LISTS.lock().insert(ptr as usize, list);
        Ok(ptr)
    });
    if list.is_null() && !count.is_null() {
        // SAFETY: as above
        unsafe { count.write(0) };
    }
    list
}

#[no_mangle]
pub extern "C" fn ext_property_list_free(_instance: u64, list: *const FfiPropertyInfo) {
    catch("property_list_free", (), || {
        if !list.is_null() && PROPERTY_LISTS.lock().remove(&(list as usize)).is_none() {
            log::warn!("Freed a property list that was never handed out");
        }
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn ext_property_can_revert(instance: u64, name: *const c_char) -> bool {
    guard("property_can_revert", false, |bridge| {
        // SAFETY: the engine passes a valid name
        let name = unsafe { name_arg(name)? };
        Ok(bridge.calls().property_default(handle(instance), name)?.is_some())
    })
}

#[no_mangle]
pub extern "C" fn ext_property_get_revert(instance: u64, name: *const c_char, ret: *mut RawVariant) -> bool {
    guard("property_get_revert", false, |bridge| {
        // SAFETY: the engine passes a valid name
        let name = unsafe { name_arg(name)? };
        match bridge.calls().property_default(handle(instance), name)? {
            Some(value) => {
                // SAFETY: `ret` is the engine's result slot
                unsafe { write_variant(ret, value) };
                Ok(true)
            }
            None => Ok(false),
        }
    })
}

#[no_mangle]
pub extern "C" fn ext_instance_notification(instance: u64, what: i32, reversed: bool) {
    guard("instance_notification", (), |bridge| {
        bridge.lifecycle().notification(handle(instance), what, reversed)
    })
}

#[no_mangle]
pub extern "C" fn ext_instance_to_string(instance: u64, is_valid: *mut bool, out: *mut RawVariant) {
    let rendered = guard("instance_to_string", None, |bridge| {
        bridge.lifecycle().stringify(handle(instance))
    });
    // SAFETY: out parameters supplied by the engine
    unsafe {
        if !is_valid.is_null() {
            is_valid.write(rendered.is_some());
        }
        if let Some(text) = rendered {
            write_variant(out, Value::String(text));
        }
    }
}

/// Reference count change on a reference-counted instance. The host
/// state does not track references; live instances acknowledge.
#[no_mangle]
pub extern "C" fn ext_instance_reference(instance: u64, increment: bool) -> bool {
    guard("instance_reference", false, |bridge| {
        bridge.lifecycle().instance(handle(instance))?;
        log::trace!("Reference {} on {:?}", if increment { "+1" } else { "-1" }, handle(instance));
        Ok(true)
    })
}

/// Server resource of the instance: the `_get_rid` override when the class
/// has one, otherwise 0
#[no_mangle]
pub extern "C" fn ext_instance_get_rid(instance: u64) -> u64 {
    guard("instance_get_rid", 0, |bridge| {
        let state = bridge.lifecycle().instance(handle(instance))?;
        let Some(trampoline) = bridge.resolver().resolve(state.class(), "_get_rid") else {
            return Ok(0);
        };
        match trampoline.call(bridge.calls(), handle(instance), &[])? {
            Value::Rid(rid) => Ok(rid.0),
            _ => Ok(0),
        }
    })
}

// ========== Virtuals ==========

/// Method id overriding `name` on the class, or 0
#[no_mangle]
pub extern "C" fn ext_get_virtual(class_userdata: u64, name: *const c_char, _hash: u32) -> u64 {
    guard("get_virtual", 0, |bridge| {
        // SAFETY: the engine passes a valid name
        let name = unsafe { name_arg(name)? };
        let Some(desc) = bridge.registry().class_at(class_userdata as usize) else {
            return Ok(0);
        };
        Ok(bridge
            .resolver()
            .resolve(&desc, name)
            .map_or(0, |trampoline| trampoline.id()))
    })
}

#[no_mangle]
pub extern "C" fn ext_call_virtual(
    instance: u64,
    method_userdata: u64,
    args: *const *const c_void,
    ret: *mut c_void,
) {
    guard("call_virtual", (), |bridge| {
        // SAFETY: the engine lays out the frame for the method it resolved
        unsafe {
            bridge.calls().call_direct_remote(
                Some(handle(instance)),
                method_userdata,
                RemoteAddr(args as u64),
                RemoteAddr(ret as u64),
            )
        }
    })
}

// ========== Methods ==========

/// Direct convention: `args` holds one slot pointer per argument
#[no_mangle]
pub extern "C" fn ext_method_checked_call(
    method_userdata: u64,
    instance: u64,
    args: *const *const c_void,
    ret: *mut c_void,
) {
    guard("method_checked_call", (), |bridge| {
        // SAFETY: the engine validated the argument shapes for this method
        unsafe {
            bridge.calls().call_direct_remote(
                receiver(instance),
                method_userdata,
                RemoteAddr(args as u64),
                RemoteAddr(ret as u64),
            )
        }
    })
}

/// Variant convention; failures leave nil in `ret`
#[no_mangle]
pub extern "C" fn ext_method_variant_call(
    method_userdata: u64,
    instance: u64,
    args: *const *const RawVariant,
    argc: u32,
    ret: *mut RawVariant,
) {
    guard("method_variant_call", (), |bridge| {
        // SAFETY: `ret` is the engine's result slot, the argument variants
        // are engine-owned and live for the call
        let args = unsafe {
            write_variant(ret, Value::Nil);
            variant_args(args, argc)?
        };
        let result = bridge.calls().call_variant(receiver(instance), method_userdata, &args)?;
        if !ret.is_null() {
            // SAFETY: `ret` holds the nil written above
            unsafe { ret.write(result.into_raw()) };
        }
        Ok(())
    })
}

/// Variant convention reporting call errors through `error`
#[no_mangle]
pub extern "C" fn ext_method_dynamic_call(
    method_userdata: u64,
    instance: u64,
    args: *const *const RawVariant,
    argc: u32,
    ret: *mut RawVariant,
    error: *mut FfiCallError,
) {
    let report = |outcome: FfiCallError| {
        if !error.is_null() {
            // SAFETY: `error` is the engine's out parameter
            unsafe { error.write(outcome) };
        }
    };
    report(FfiCallError::from_error(&CallError::Failed(String::new())));
    guard("method_dynamic_call", (), |bridge| {
        // SAFETY: as in `ext_method_variant_call`
        unsafe { write_variant(ret, Value::Nil) };
        let outcome = unsafe { variant_args(args, argc) }
            .and_then(|args| bridge.calls().call_variant(receiver(instance), method_userdata, &args));
        match outcome {
            Ok(result) => {
                if !ret.is_null() {
                    // SAFETY: `ret` holds the nil written above
                    unsafe { ret.write(result.into_raw()) };
                }
                report(FfiCallError::OK);
                Ok(())
            }
            Err(BridgeError::Call(e)) => {
                report(FfiCallError::from_error(&e));
                Ok(())
            }
            Err(e) => Err(e),
        }
    })
}

// ========== Callables ==========

/// Invoke a callable handed out through `signal_connect`
#[no_mangle]
pub extern "C" fn ext_callable_call(
    userdata: *mut c_void,
    args: *const RawVariant,
    argc: u32,
    ret: *mut RawVariant,
    error: *mut FfiCallError,
) {
    let outcome = catch("callable_call", Err(CallError::InstanceIsNull), || {
        // SAFETY: `userdata` was produced by `FfiCallable::new` and not freed
        let callable = unsafe { (userdata as *const Callable).as_ref() };
        let Some(callable) = callable else {
            return Ok(Err(CallError::InstanceIsNull));
        };
        let mut values = Vec::with_capacity(argc as usize);
        for i in 0..argc as usize {
            // SAFETY: the engine passes `argc` contiguous variants
            let value = unsafe { decode_variant(&*args.add(i)) }
                .map_err(|e| CallError::Failed(format!("argument {i}: {e}")));
            match value {
                Ok(value) => values.push(value),
                Err(e) => return Ok(Err(e)),
            }
        }
        Ok(callable
            .call(&values)
            .map_err(|e| CallError::Failed(e.to_string())))
    });
    // SAFETY: out parameters supplied by the engine
    unsafe {
        match outcome {
            Ok(value) => {
                write_variant(ret, value);
                if !error.is_null() {
                    error.write(FfiCallError::OK);
                }
            }
            Err(e) => {
                write_variant(ret, Value::Nil);
                if !error.is_null() {
                    error.write(FfiCallError::from_error(&e));
                }
            }
        }
    }
}

#[no_mangle]
pub extern "C" fn ext_callable_free(userdata: *mut c_void) {
    if !userdata.is_null() {
        // SAFETY: produced by `Box::into_raw` in `FfiCallable::new`
        drop(unsafe { Box::from_raw(userdata as *mut Callable) });
    }
}

// ========== Initialization ==========

#[no_mangle]
pub extern "C" fn ext_initialize(level: u32) {
    guard("initialize", (), |bridge| {
        let level = InitLevel::from_u32(level)
            .ok_or_else(|| BridgeError::engine(format!("Unknown init level {level}")))?;
        let failed = bridge.initialize(level);
        if !failed.is_empty() {
            log::warn!("{} classes failed to register at {level:?}", failed.len());
        }
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn ext_deinitialize(level: u32) {
    guard("deinitialize", (), |bridge| {
        let level = InitLevel::from_u32(level)
            .ok_or_else(|| BridgeError::engine(format!("Unknown init level {level}")))?;
        bridge.deinitialize(level);
        Ok(())
    })
}

/// Run deferred work on the engine main context; returns how many ran
#[no_mangle]
pub extern "C" fn ext_flush_deferred() -> u32 {
    guard("flush_deferred", 0, |bridge| Ok(bridge.flush_deferred() as u32))
}

/// Every entry point, for the engine
pub fn callback_table() -> FfiExtensionCallbacks {
    FfiExtensionCallbacks {
        api_version: EXT_BRIDGE_API_VERSION,
        create_instance: Some(ext_create_instance),
        free_instance: Some(ext_free_instance),
        set: Some(ext_instance_set),
        get: Some(ext_instance_get),
        property_list: Some(ext_property_list),
        property_list_free: Some(ext_property_list_free),
        property_can_revert: Some(ext_property_can_revert),
        property_get_revert: Some(ext_property_get_revert),
        notification: Some(ext_instance_notification),
        to_string: Some(ext_instance_to_string),
        reference: Some(ext_instance_reference),
        get_rid: Some(ext_instance_get_rid),
        get_virtual: Some(ext_get_virtual),
        call_virtual: Some(ext_call_virtual),
        method_checked_call: Some(ext_method_checked_call),
        method_variant_call: Some(ext_method_variant_call),
        method_dynamic_call: Some(ext_method_dynamic_call),
        initialize: Some(ext_initialize),
        deinitialize: Some(ext_deinitialize),
        flush_deferred: Some(ext_flush_deferred),
    }
}

#[no_mangle]
pub extern "C" fn ext_bridge_callbacks() -> FfiExtensionCallbacks {
    callback_table()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ext_variant::encode_variant;

    #[test]
    fn test_catch_turns_panic_into_fallback() {
        let value = catch("boom", 7, || -> Result<i32> { panic!("boom") });
        assert_eq!(value, 7);
        let value = catch("fails", 7, || -> Result<i32> { Err(BridgeError::engine("no")) });
        assert_eq!(value, 7);
    }

    #[test]
    fn test_callable_round_trip() {
        let callable = Callable::from_fn(|args| match args {
            [Value::Int(a), Value::Int(b)] => Ok(Value::Int(a + b)),
            _ => Ok(Value::Nil),
        });
        let userdata = Box::into_raw(Box::new(callable)) as *mut c_void;
        let args = [encode_variant(Value::Int(2)), encode_variant(Value::Int(3))];
        let mut ret = RawVariant::NIL;
        let mut error = FfiCallError::default();

        ext_callable_call(userdata, args.as_ptr(), 2, &mut ret, &mut error);
        assert!(error.is_ok());
        let result = unsafe { Variant::from_raw(ret) };
        assert_eq!(result.to_value().unwrap(), Value::Int(5));
        ext_callable_free(userdata);
    }

    #[test]
    fn test_callable_call_null_userdata() {
        let mut ret = RawVariant::NIL;
        let mut error = FfiCallError::OK;
        ext_callable_call(ptr::null_mut(), ptr::null(), 0, &mut ret, &mut error);
        assert_eq!(error.error, CallError::InstanceIsNull.kind() as u32);
    }

    #[test]
    fn test_callback_table_is_complete() {
        let table = callback_table();
        assert_eq!(table.api_version, EXT_BRIDGE_API_VERSION);
        assert!(table.create_instance.is_some());
        assert!(table.method_dynamic_call.is_some());
        assert!(table.flush_deferred.is_some());
    }
}
