//! Host type descriptors and conversions
//!
//! [`Marshal`] tells registration how a host type travels over the wire.
//! A type whose [`Marshal::arg_type`] is `None` has no wire form; bindings
//! using it are rejected or skipped once, at registration.

use crate::callable::Callable;
use crate::error::{Result, VariantError};
use crate::math::*;
use crate::types::{ArgMetadata, ArgType, VariantType};
use crate::value::{Array, Dictionary, ObjectId, Rid, SignalRef, Value};

/// Host value to engine value
pub trait ToValue {
    fn to_value(&self) -> Value;
}

/// Engine value to host value
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

/// Wire descriptor of a host type
pub trait Marshal: ToValue + FromValue + 'static {
    /// `true` only for `()`, meaning "no return value"
    const IS_VOID: bool = false;

    /// Wire type, `None` when the type cannot cross the boundary
    fn arg_type() -> Option<ArgType>;

    fn variant_type() -> Option<VariantType> {
        Self::arg_type().map(|t| t.variant_type)
    }

    fn metadata() -> ArgMetadata {
        Self::arg_type().map(|t| t.metadata).unwrap_or_default()
    }

    fn is_representable() -> bool {
        Self::arg_type().is_some()
    }
}

fn wrong_kind(value: &Value, to: &'static str) -> VariantError {
    VariantError::conversion(value.variant_type(), to)
}

// ========== Primitives ==========

impl ToValue for () {
    fn to_value(&self) -> Value {
        Value::Nil
    }
}

impl FromValue for () {
    fn from_value(_: Value) -> Result<Self> {
        Ok(())
    }
}

impl Marshal for () {
    const IS_VOID: bool = true;

    fn arg_type() -> Option<ArgType> {
        Some(ArgType::of(VariantType::Nil))
    }
}

impl ToValue for bool {
    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self> {
        match value.convert(VariantType::Bool)? {
            Value::Bool(b) => Ok(b),
            other => Err(wrong_kind(&other, "bool")),
        }
    }
}

impl Marshal for bool {
    fn arg_type() -> Option<ArgType> {
        Some(ArgType::of(VariantType::Bool))
    }
}

macro_rules! marshal_int {
    ($($ty:ty => $meta:ident),* $(,)?) => {
        $(
            impl ToValue for $ty {
                fn to_value(&self) -> Value {
                    Value::Int(*self as i64)
                }
            }

            impl FromValue for $ty {
                fn from_value(value: Value) -> Result<Self> {
                    match value.convert(VariantType::Int)? {
                        Value::Int(i) => <$ty>::try_from(i).map_err(|_| VariantError::OutOfRange {
                            value: i,
                            target: stringify!($ty),
                        }),
                        other => Err(wrong_kind(&other, stringify!($ty))),
                    }
                }
            }

            impl Marshal for $ty {
                fn arg_type() -> Option<ArgType> {
                    Some(ArgType::with_metadata(VariantType::Int, ArgMetadata::$meta))
                }
            }
        )*
    };
}

marshal_int!(
    i8 => IntIsInt8,
    i16 => IntIsInt16,
    i32 => IntIsInt32,
    i64 => IntIsInt64,
    u8 => IntIsUint8,
    u16 => IntIsUint16,
    u32 => IntIsUint32,
    u64 => IntIsUint64,
);

macro_rules! marshal_real {
    ($($ty:ty => $meta:ident),* $(,)?) => {
        $(
            impl ToValue for $ty {
                fn to_value(&self) -> Value {
                    Value::Float(*self as f64)
                }
            }

            impl FromValue for $ty {
                fn from_value(value: Value) -> Result<Self> {
                    match value.convert(VariantType::Float)? {
                        Value::Float(f) => Ok(f as $ty),
                        other => Err(wrong_kind(&other, stringify!($ty))),
                    }
                }
            }

            impl Marshal for $ty {
                fn arg_type() -> Option<ArgType> {
                    Some(ArgType::with_metadata(VariantType::Float, ArgMetadata::$meta))
                }
            }
        )*
    };
}

marshal_real!(f32 => RealIsFloat, f64 => RealIsDouble);

impl ToValue for String {
    fn to_value(&self) -> Value {
        Value::String(self.clone())
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(s) | Value::StringName(s) | Value::NodePath(s) => Ok(s),
            other => Err(wrong_kind(&other, "String")),
        }
    }
}

impl Marshal for String {
    fn arg_type() -> Option<ArgType> {
        Some(ArgType::of(VariantType::String))
    }
}

// ========== Value-typed kinds ==========

macro_rules! marshal_exact {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl ToValue for $ty {
                fn to_value(&self) -> Value {
                    Value::$kind(self.clone())
                }
            }

            impl FromValue for $ty {
                fn from_value(value: Value) -> Result<Self> {
                    match value.convert(VariantType::$kind)? {
                        Value::$kind(v) => Ok(v),
                        other => Err(wrong_kind(&other, stringify!($ty))),
                    }
                }
            }

            impl Marshal for $ty {
                fn arg_type() -> Option<ArgType> {
                    Some(ArgType::of(VariantType::$kind))
                }
            }
        )*
    };
}

marshal_exact!(
    Vector2 => Vector2,
    Vector2i => Vector2i,
    Rect2 => Rect2,
    Rect2i => Rect2i,
    Vector3 => Vector3,
    Vector3i => Vector3i,
    Transform2D => Transform2D,
    Vector4 => Vector4,
    Vector4i => Vector4i,
    Plane => Plane,
    Quaternion => Quaternion,
    Aabb => Aabb,
    Basis => Basis,
    Transform3D => Transform3D,
    Projection => Projection,
    Color => Color,
    Rid => Rid,
    ObjectId => Object,
    Callable => Callable,
    SignalRef => Signal,
    Dictionary => Dictionary,
    Array => Array,
);

impl ToValue for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl Marshal for Value {
    fn arg_type() -> Option<ArgType> {
        Some(ArgType::of(VariantType::Nil))
    }
}

// ========== Packed arrays ==========

/// Element types with a packed array kind
pub trait PackedElement: Sized + Clone + 'static {
    const PACKED: VariantType;

    fn pack(items: Vec<Self>) -> Value;
    fn unpack(value: Value) -> Option<Vec<Self>>;
}

macro_rules! packed_element {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl PackedElement for $ty {
                const PACKED: VariantType = VariantType::$kind;

                fn pack(items: Vec<Self>) -> Value {
                    Value::$kind(items)
                }

                fn unpack(value: Value) -> Option<Vec<Self>> {
                    match value {
                        Value::$kind(items) => Some(items),
                        _ => None,
                    }
                }
            }
        )*
    };
}

packed_element!(
    u8 => PackedByteArray,
    i32 => PackedInt32Array,
    i64 => PackedInt64Array,
    f32 => PackedFloat32Array,
    f64 => PackedFloat64Array,
    String => PackedStringArray,
    Vector2 => PackedVector2Array,
    Vector3 => PackedVector3Array,
    Color => PackedColorArray,
    Vector4 => PackedVector4Array,
);

impl<T: PackedElement> ToValue for Vec<T> {
    fn to_value(&self) -> Value {
        T::pack(self.clone())
    }
}

impl<T: PackedElement> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self> {
        let from = value.variant_type();
        value
            .convert(T::PACKED)
            .ok()
            .and_then(T::unpack)
            .ok_or_else(|| VariantError::conversion(from, T::PACKED.name()))
    }
}

impl<T: PackedElement> Marshal for Vec<T> {
    fn arg_type() -> Option<ArgType> {
        Some(ArgType::of(T::PACKED))
    }
}

// ========== Host-only values ==========

/// Host value with no wire representation.
///
/// Bindings mentioning it are never callable from the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostOnly<T>(pub T);

impl<T> ToValue for HostOnly<T> {
    fn to_value(&self) -> Value {
        Value::Nil
    }
}

impl<T> FromValue for HostOnly<T> {
    fn from_value(_: Value) -> Result<Self> {
        Err(VariantError::Unrepresentable(std::any::type_name::<T>()))
    }
}

impl<T: 'static> Marshal for HostOnly<T> {
    fn arg_type() -> Option<ArgType> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_widths() {
        assert_eq!(i8::from_value(Value::Int(-5)), Ok(-5));
        assert!(matches!(
            i8::from_value(Value::Int(500)),
            Err(VariantError::OutOfRange { target: "i8", .. })
        ));
        assert_eq!(u16::metadata(), ArgMetadata::IntIsUint16);
        assert_eq!(i64::variant_type(), Some(VariantType::Int));
    }

    #[test]
    fn test_float_accepts_int() {
        assert_eq!(f32::from_value(Value::Int(2)), Ok(2.0));
        assert!(f64::from_value(Value::from("2")).is_err());
    }

    #[test]
    fn test_packed_vec() {
        let v = vec![1.5f32, 2.5];
        assert_eq!(v.to_value(), Value::PackedFloat32Array(vec![1.5, 2.5]));
        assert_eq!(Vec::<f32>::from_value(v.to_value()), Ok(v));
        assert_eq!(Vec::<String>::arg_type(), Some(ArgType::of(VariantType::PackedStringArray)));
    }

    #[test]
    fn test_host_only_is_unrepresentable() {
        assert!(!HostOnly::<std::time::Instant>::is_representable());
        assert!(HostOnly::<u8>::from_value(Value::Nil).is_err());
        assert!(<()>::IS_VOID);
        assert!(!i32::IS_VOID);
    }
}
