//! Host-side dynamic values

use std::fmt;

use crate::callable::Callable;
use crate::error::{Result, VariantError};
use crate::math::*;
use crate::types::VariantType;

/// Engine object identifier. Zero is the null object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectId(pub u64);

impl ObjectId {
    pub const NULL: Self = Self(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Object#{}>", self.0)
    }
}

/// Engine resource identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rid(pub u64);

/// Reference to a named signal on an engine object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignalRef {
    pub object: ObjectId,
    pub name: String,
}

impl SignalRef {
    pub fn new(object: ObjectId, name: impl Into<String>) -> Self {
        Self {
            object,
            name: name.into(),
        }
    }
}

/// Dynamic array, optionally restricted to one element kind
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Array {
    element: Option<VariantType>,
    items: Vec<Value>,
}

impl Array {
    /// Untyped empty array
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty array accepting only `element`
    pub fn typed(element: VariantType) -> Self {
        Self {
            element: Some(element),
            items: Vec::new(),
        }
    }

    /// Element kind of a typed array
    pub fn element_type(&self) -> Option<VariantType> {
        self.element
    }

    /// Append a value, converting it for typed arrays
    pub fn push(&mut self, value: Value) -> Result<()> {
        let found = value.variant_type();
        let value = match self.element {
            Some(expected) => value
                .convert(expected)
                .map_err(|_| VariantError::ArrayElement { expected, found })?,
            None => value,
        };
        self.items.push(value);
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.items.get(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.items.iter()
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.items
    }
}

impl FromIterator<Value> for Array {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self {
            element: None,
            items: iter.into_iter().collect(),
        }
    }
}

/// Insertion-ordered key/value map
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dictionary {
    entries: Vec<(Value, Value)>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace, returning the previous value
    pub fn insert(&mut self, key: Value, value: Value) -> Option<Value> {
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            return Some(std::mem::replace(&mut slot.1, value));
        }
        self.entries.push((key, value));
        None
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }
}

/// A value of any kind the engine understands
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Vector2(Vector2),
    Vector2i(Vector2i),
    Rect2(Rect2),
    Rect2i(Rect2i),
    Vector3(Vector3),
    Vector3i(Vector3i),
    Transform2D(Transform2D),
    Vector4(Vector4),
    Vector4i(Vector4i),
    Plane(Plane),
    Quaternion(Quaternion),
    Aabb(Aabb),
    Basis(Basis),
    Transform3D(Transform3D),
    Projection(Projection),
    Color(Color),
    StringName(String),
    NodePath(String),
    Rid(Rid),
    Object(ObjectId),
    Callable(Callable),
    Signal(SignalRef),
    Dictionary(Dictionary),
    Array(Array),
    PackedByteArray(Vec<u8>),
    PackedInt32Array(Vec<i32>),
    PackedInt64Array(Vec<i64>),
    PackedFloat32Array(Vec<f32>),
    PackedFloat64Array(Vec<f64>),
    PackedStringArray(Vec<String>),
    PackedVector2Array(Vec<Vector2>),
    PackedVector3Array(Vec<Vector3>),
    PackedColorArray(Vec<Color>),
    PackedVector4Array(Vec<Vector4>),
}

impl Value {
    /// Kind tag of this value
    pub fn variant_type(&self) -> VariantType {
        match self {
            Value::Nil => VariantType::Nil,
            Value::Bool(_) => VariantType::Bool,
            Value::Int(_) => VariantType::Int,
            Value::Float(_) => VariantType::Float,
            Value::String(_) => VariantType::String,
            Value::Vector2(_) => VariantType::Vector2,
            Value::Vector2i(_) => VariantType::Vector2i,
            Value::Rect2(_) => VariantType::Rect2,
            Value::Rect2i(_) => VariantType::Rect2i,
            Value::Vector3(_) => VariantType::Vector3,
            Value::Vector3i(_) => VariantType::Vector3i,
            Value::Transform2D(_) => VariantType::Transform2D,
            Value::Vector4(_) => VariantType::Vector4,
            Value::Vector4i(_) => VariantType::Vector4i,
            Value::Plane(_) => VariantType::Plane,
            Value::Quaternion(_) => VariantType::Quaternion,
            Value::Aabb(_) => VariantType::Aabb,
            Value::Basis(_) => VariantType::Basis,
            Value::Transform3D(_) => VariantType::Transform3D,
            Value::Projection(_) => VariantType::Projection,
            Value::Color(_) => VariantType::Color,
            Value::StringName(_) => VariantType::StringName,
            Value::NodePath(_) => VariantType::NodePath,
            Value::Rid(_) => VariantType::Rid,
            Value::Object(_) => VariantType::Object,
            Value::Callable(_) => VariantType::Callable,
            Value::Signal(_) => VariantType::Signal,
            Value::Dictionary(_) => VariantType::Dictionary,
            Value::Array(_) => VariantType::Array,
            Value::PackedByteArray(_) => VariantType::PackedByteArray,
            Value::PackedInt32Array(_) => VariantType::PackedInt32Array,
            Value::PackedInt64Array(_) => VariantType::PackedInt64Array,
            Value::PackedFloat32Array(_) => VariantType::PackedFloat32Array,
            Value::PackedFloat64Array(_) => VariantType::PackedFloat64Array,
            Value::PackedStringArray(_) => VariantType::PackedStringArray,
            Value::PackedVector2Array(_) => VariantType::PackedVector2Array,
            Value::PackedVector3Array(_) => VariantType::PackedVector3Array,
            Value::PackedColorArray(_) => VariantType::PackedColorArray,
            Value::PackedVector4Array(_) => VariantType::PackedVector4Array,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// String-like payload of `String`, `StringName` and `NodePath`
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::StringName(s) | Value::NodePath(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Value::Object(id) => Some(*id),
            Value::Nil => Some(ObjectId::NULL),
            _ => None,
        }
    }

    pub fn as_callable(&self) -> Option<&Callable> {
        match self {
            Value::Callable(c) => Some(c),
            _ => None,
        }
    }

    /// Convert to `target` using the engine's implicit conversions.
    ///
    /// `Nil` as a target accepts any value unchanged.
    pub fn convert(self, target: VariantType) -> Result<Value> {
        let from = self.variant_type();
        if from == target || target == VariantType::Nil {
            return Ok(self);
        }
        let converted = match (self, target) {
            (Value::Bool(b), VariantType::Int) => Value::Int(b as i64),
            (Value::Bool(b), VariantType::Float) => Value::Float(if b { 1.0 } else { 0.0 }),
            (Value::Int(i), VariantType::Bool) => Value::Bool(i != 0),
            (Value::Int(i), VariantType::Float) => Value::Float(i as f64),
            (Value::Float(f), VariantType::Int) => Value::Int(f as i64),
            (Value::Float(f), VariantType::Bool) => Value::Bool(f != 0.0),
            (Value::String(s) | Value::StringName(s) | Value::NodePath(s), to) => match to {
                VariantType::String => Value::String(s),
                VariantType::StringName => Value::StringName(s),
                VariantType::NodePath => Value::NodePath(s),
                _ => return Err(VariantError::conversion(from, target.name())),
            },
            (Value::Nil, VariantType::Object) => Value::Object(ObjectId::NULL),
            (Value::Vector2i(v), VariantType::Vector2) => {
                Value::Vector2(Vector2::new(v.x as f32, v.y as f32))
            }
            (Value::Vector2(v), VariantType::Vector2i) => {
                Value::Vector2i(Vector2i::new(v.x as i32, v.y as i32))
            }
            (Value::Vector3i(v), VariantType::Vector3) => {
                Value::Vector3(Vector3::new(v.x as f32, v.y as f32, v.z as f32))
            }
            (Value::Vector3(v), VariantType::Vector3i) => {
                Value::Vector3i(Vector3i::new(v.x as i32, v.y as i32, v.z as i32))
            }
            (Value::Array(array), to) => array_to_packed(array, to)?,
            (packed, VariantType::Array) => match packed_to_array(packed) {
                Some(array) => Value::Array(array),
                None => return Err(VariantError::conversion(from, target.name())),
            },
            _ => return Err(VariantError::conversion(from, target.name())),
        };
        Ok(converted)
    }
}

fn collect_packed<T>(
    items: Vec<Value>,
    target: VariantType,
    unwrap: impl Fn(Value) -> Option<T>,
) -> Result<Vec<T>> {
    items
        .into_iter()
        .map(|item| {
            let from = item.variant_type();
            unwrap(item).ok_or_else(|| VariantError::conversion(from, target.name()))
        })
        .collect()
}

fn array_to_packed(array: Array, target: VariantType) -> Result<Value> {
    let items = array.into_vec();
    let value = match target {
        VariantType::PackedByteArray => Value::PackedByteArray(collect_packed(items, target, |v| {
            v.as_int().and_then(|i| u8::try_from(i).ok())
        })?),
        VariantType::PackedInt32Array => Value::PackedInt32Array(collect_packed(items, target, |v| {
            v.as_int().and_then(|i| i32::try_from(i).ok())
        })?),
        VariantType::PackedInt64Array => {
            Value::PackedInt64Array(collect_packed(items, target, |v| v.as_int())?)
        }
        VariantType::PackedFloat32Array => Value::PackedFloat32Array(collect_packed(
            items,
            target,
            |v| v.as_float().map(|f| f as f32),
        )?),
        VariantType::PackedFloat64Array => {
            Value::PackedFloat64Array(collect_packed(items, target, |v| v.as_float())?)
        }
        VariantType::PackedStringArray => Value::PackedStringArray(collect_packed(
            items,
            target,
            |v| v.as_str().map(str::to_owned),
        )?),
        VariantType::PackedVector2Array => {
            Value::PackedVector2Array(collect_packed(items, target, |v| match v {
                Value::Vector2(v) => Some(v),
                _ => None,
            })?)
        }
        VariantType::PackedVector3Array => {
            Value::PackedVector3Array(collect_packed(items, target, |v| match v {
                Value::Vector3(v) => Some(v),
                _ => None,
            })?)
        }
        VariantType::PackedColorArray => {
            Value::PackedColorArray(collect_packed(items, target, |v| match v {
                Value::Color(c) => Some(c),
                _ => None,
            })?)
        }
        VariantType::PackedVector4Array => {
            Value::PackedVector4Array(collect_packed(items, target, |v| match v {
                Value::Vector4(v) => Some(v),
                _ => None,
            })?)
        }
        _ => return Err(VariantError::conversion(VariantType::Array, target.name())),
    };
    Ok(value)
}

fn packed_to_array(value: Value) -> Option<Array> {
    let array = match value {
        Value::PackedByteArray(v) => v.into_iter().map(|x| Value::Int(x as i64)).collect(),
        Value::PackedInt32Array(v) => v.into_iter().map(|x| Value::Int(x as i64)).collect(),
        Value::PackedInt64Array(v) => v.into_iter().map(Value::Int).collect(),
        Value::PackedFloat32Array(v) => v.into_iter().map(|x| Value::Float(x as f64)).collect(),
        Value::PackedFloat64Array(v) => v.into_iter().map(Value::Float).collect(),
        Value::PackedStringArray(v) => v.into_iter().map(Value::String).collect(),
        Value::PackedVector2Array(v) => v.into_iter().map(Value::Vector2).collect(),
        Value::PackedVector3Array(v) => v.into_iter().map(Value::Vector3).collect(),
        Value::PackedColorArray(v) => v.into_iter().map(Value::Color).collect(),
        Value::PackedVector4Array(v) => v.into_iter().map(Value::Vector4).collect(),
        _ => return None,
    };
    Some(array)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("<null>"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) | Value::StringName(s) | Value::NodePath(s) => f.write_str(s),
            Value::Object(id) => write!(f, "{id}"),
            other => write!(f, "{other:?}"),
        }
    }
}

macro_rules! impl_from_for_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from_for_value!(
    bool => Bool,
    i64 => Int,
    f64 => Float,
    String => String,
    Vector2 => Vector2,
    Vector3 => Vector3,
    Vector4 => Vector4,
    Color => Color,
    ObjectId => Object,
    Callable => Callable,
    Dictionary => Dictionary,
    Array => Array,
);

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_conversion() {
        assert_eq!(Value::Int(3).convert(VariantType::Float), Ok(Value::Float(3.0)));
        assert_eq!(Value::Float(2.9).convert(VariantType::Int), Ok(Value::Int(2)));
        assert_eq!(Value::Bool(true).convert(VariantType::Int), Ok(Value::Int(1)));
    }

    #[test]
    fn test_string_kinds_interconvert() {
        let name = Value::from("health").convert(VariantType::StringName).unwrap();
        assert_eq!(name, Value::StringName("health".into()));
        assert!(Value::from("x").convert(VariantType::Vector2).is_err());
    }

    #[test]
    fn test_array_to_packed() {
        let array: Array = vec![Value::Int(1), Value::Int(2)].into_iter().collect();
        let packed = Value::Array(array).convert(VariantType::PackedInt32Array).unwrap();
        assert_eq!(packed, Value::PackedInt32Array(vec![1, 2]));

        let bad: Array = vec![Value::Int(300)].into_iter().collect();
        assert!(Value::Array(bad).convert(VariantType::PackedByteArray).is_err());
    }

    #[test]
    fn test_typed_array_rejects_wrong_kind() {
        let mut array = Array::typed(VariantType::Int);
        array.push(Value::Float(1.5)).unwrap();
        assert_eq!(array.get(0), Some(&Value::Int(1)));
        assert!(array.push(Value::from("nope")).is_err());
    }

    #[test]
    fn test_dictionary_preserves_order() {
        let mut dict = Dictionary::new();
        dict.insert(Value::from("b"), Value::Int(1));
        dict.insert(Value::from("a"), Value::Int(2));
        assert_eq!(dict.insert(Value::from("b"), Value::Int(3)), Some(Value::Int(1)));
        let keys: Vec<_> = dict.iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(keys, vec!["b", "a"]);
    }
}
