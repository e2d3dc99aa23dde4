//! Engine value kinds and argument width metadata
//!
//! Every kind has a fixed byte width and alignment in the direct calling
//! convention. Heap-backed kinds (strings, containers, callables) occupy a
//! single pointer-sized slot holding a boxed payload.

use std::fmt;

use crate::error::{Result, VariantError};

/// Kinds the engine variant can carry. Discriminants match the engine tags.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VariantType {
    Nil = 0,
    Bool = 1,
    Int = 2,
    Float = 3,
    String = 4,
    Vector2 = 5,
    Vector2i = 6,
    Rect2 = 7,
    Rect2i = 8,
    Vector3 = 9,
    Vector3i = 10,
    Transform2D = 11,
    Vector4 = 12,
    Vector4i = 13,
    Plane = 14,
    Quaternion = 15,
    Aabb = 16,
    Basis = 17,
    Transform3D = 18,
    Projection = 19,
    Color = 20,
    StringName = 21,
    NodePath = 22,
    Rid = 23,
    Object = 24,
    Callable = 25,
    Signal = 26,
    Dictionary = 27,
    Array = 28,
    PackedByteArray = 29,
    PackedInt32Array = 30,
    PackedInt64Array = 31,
    PackedFloat32Array = 32,
    PackedFloat64Array = 33,
    PackedStringArray = 34,
    PackedVector2Array = 35,
    PackedVector3Array = 36,
    PackedColorArray = 37,
    PackedVector4Array = 38,
}

impl VariantType {
    /// Number of kinds
    pub const COUNT: usize = 39;

    /// All kinds in tag order
    pub const ALL: [VariantType; Self::COUNT] = [
        Self::Nil,
        Self::Bool,
        Self::Int,
        Self::Float,
        Self::String,
        Self::Vector2,
        Self::Vector2i,
        Self::Rect2,
        Self::Rect2i,
        Self::Vector3,
        Self::Vector3i,
        Self::Transform2D,
        Self::Vector4,
        Self::Vector4i,
        Self::Plane,
        Self::Quaternion,
        Self::Aabb,
        Self::Basis,
        Self::Transform3D,
        Self::Projection,
        Self::Color,
        Self::StringName,
        Self::NodePath,
        Self::Rid,
        Self::Object,
        Self::Callable,
        Self::Signal,
        Self::Dictionary,
        Self::Array,
        Self::PackedByteArray,
        Self::PackedInt32Array,
        Self::PackedInt64Array,
        Self::PackedFloat32Array,
        Self::PackedFloat64Array,
        Self::PackedStringArray,
        Self::PackedVector2Array,
        Self::PackedVector3Array,
        Self::PackedColorArray,
        Self::PackedVector4Array,
    ];

    /// Look up a kind from its wire tag
    pub fn from_u32(tag: u32) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    /// Wire tag
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Byte width of a direct-convention slot of this kind
    pub fn direct_size(self) -> usize {
        use VariantType::*;
        match self {
            // any value travels as a whole variant
            Nil => 24,
            Bool => 1,
            Int | Float | Rid | Object => 8,
            Vector2 | Vector2i => 8,
            Vector3 | Vector3i => 12,
            Rect2 | Rect2i | Vector4 | Vector4i | Plane | Quaternion | Color => 16,
            Transform2D | Aabb => 24,
            Basis => 36,
            Transform3D => 48,
            Projection => 64,
            // boxed payload pointer
            _ => 8,
        }
    }

    /// Alignment of a direct-convention slot of this kind
    pub fn direct_align(self) -> usize {
        use VariantType::*;
        match self {
            Bool => 1,
            Vector2 | Vector2i | Vector3 | Vector3i | Rect2 | Rect2i | Vector4 | Vector4i
            | Plane | Quaternion | Color | Transform2D | Aabb | Basis | Transform3D
            | Projection => 4,
            _ => 8,
        }
    }

    /// Whether the value is stored directly in the variant payload words
    pub fn is_inline(self) -> bool {
        use VariantType::*;
        matches!(
            self,
            Nil | Bool
                | Int
                | Float
                | Vector2
                | Vector2i
                | Rect2
                | Rect2i
                | Vector3
                | Vector3i
                | Vector4
                | Vector4i
                | Plane
                | Quaternion
                | Color
                | Rid
                | Object
        )
    }

    /// Whether the value lives behind a boxed payload pointer
    pub fn is_heap(self) -> bool {
        !self.is_inline()
    }

    /// Engine-facing name of the kind
    pub fn name(self) -> &'static str {
        use VariantType::*;
        match self {
            Nil => "Nil",
            Bool => "bool",
            Int => "int",
            Float => "float",
            String => "String",
            Vector2 => "Vector2",
            Vector2i => "Vector2i",
            Rect2 => "Rect2",
            Rect2i => "Rect2i",
            Vector3 => "Vector3",
            Vector3i => "Vector3i",
            Transform2D => "Transform2D",
            Vector4 => "Vector4",
            Vector4i => "Vector4i",
            Plane => "Plane",
            Quaternion => "Quaternion",
            Aabb => "AABB",
            Basis => "Basis",
            Transform3D => "Transform3D",
            Projection => "Projection",
            Color => "Color",
            StringName => "StringName",
            NodePath => "NodePath",
            Rid => "RID",
            Object => "Object",
            Callable => "Callable",
            Signal => "Signal",
            Dictionary => "Dictionary",
            Array => "Array",
            PackedByteArray => "PackedByteArray",
            PackedInt32Array => "PackedInt32Array",
            PackedInt64Array => "PackedInt64Array",
            PackedFloat32Array => "PackedFloat32Array",
            PackedFloat64Array => "PackedFloat64Array",
            PackedStringArray => "PackedStringArray",
            PackedVector2Array => "PackedVector2Array",
            PackedVector3Array => "PackedVector3Array",
            PackedColorArray => "PackedColorArray",
            PackedVector4Array => "PackedVector4Array",
        }
    }
}

impl fmt::Display for VariantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Numeric width carried alongside int and float arguments
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ArgMetadata {
    #[default]
    None = 0,
    IntIsInt8 = 1,
    IntIsInt16 = 2,
    IntIsInt32 = 3,
    IntIsInt64 = 4,
    IntIsUint8 = 5,
    IntIsUint16 = 6,
    IntIsUint32 = 7,
    IntIsUint64 = 8,
    RealIsFloat = 9,
    RealIsDouble = 10,
}

impl ArgMetadata {
    /// Whether this describes an integer width
    pub fn is_int(self) -> bool {
        (self as u32) >= 1 && (self as u32) <= 8
    }

    /// Whether this describes a floating point width
    pub fn is_real(self) -> bool {
        matches!(self, Self::RealIsFloat | Self::RealIsDouble)
    }

    /// Width in bits, zero when unspecified
    pub fn bits(self) -> u32 {
        use ArgMetadata::*;
        match self {
            None => 0,
            IntIsInt8 | IntIsUint8 => 8,
            IntIsInt16 | IntIsUint16 => 16,
            IntIsInt32 | IntIsUint32 | RealIsFloat => 32,
            IntIsInt64 | IntIsUint64 | RealIsDouble => 64,
        }
    }

    /// Whether this describes a signed integer
    pub fn is_signed(self) -> bool {
        use ArgMetadata::*;
        matches!(self, IntIsInt8 | IntIsInt16 | IntIsInt32 | IntIsInt64)
    }

    /// Whether every value of `self` is representable in `declared`
    fn fits_in(self, declared: ArgMetadata) -> bool {
        if self.is_real() {
            return self.bits() <= declared.bits();
        }
        match (self.is_signed(), declared.is_signed()) {
            (true, true) | (false, false) => self.bits() <= declared.bits(),
            (false, true) => self.bits() < declared.bits(),
            (true, false) => false,
        }
    }

    /// Resolve the width a slot is marshalled with.
    ///
    /// An unspecified declaration accepts the host width. A declaration
    /// narrower than the host width is accepted only when
    /// `allow_narrowing` is set; mixing integer and real widths never is.
    pub fn check_width(
        host: ArgMetadata,
        declared: ArgMetadata,
        allow_narrowing: bool,
    ) -> Result<ArgMetadata> {
        if declared == ArgMetadata::None {
            return Ok(host);
        }
        if host == ArgMetadata::None {
            return Ok(declared);
        }
        if host.is_int() != declared.is_int() {
            return Err(VariantError::IncompatibleWidth { host, declared });
        }
        if host.fits_in(declared) || allow_narrowing {
            Ok(declared)
        } else {
            Err(VariantError::Narrowing { host, declared })
        }
    }

    /// Check that an integer fits this width
    pub fn check_int(self, value: i64) -> Result<i64> {
        use ArgMetadata::*;
        let (min, max, target): (i128, i128, &'static str) = match self {
            IntIsInt8 => (i8::MIN as i128, i8::MAX as i128, "i8"),
            IntIsInt16 => (i16::MIN as i128, i16::MAX as i128, "i16"),
            IntIsInt32 => (i32::MIN as i128, i32::MAX as i128, "i32"),
            IntIsUint8 => (0, u8::MAX as i128, "u8"),
            IntIsUint16 => (0, u16::MAX as i128, "u16"),
            IntIsUint32 => (0, u32::MAX as i128, "u32"),
            _ => return Ok(value),
        };
        let wide = value as i128;
        if wide < min || wide > max {
            return Err(VariantError::OutOfRange { value, target });
        }
        Ok(value)
    }
}

/// Wire description of a host argument or return type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgType {
    /// Variant kind
    pub variant_type: VariantType,
    /// Numeric width
    pub metadata: ArgMetadata,
    /// Engine class name for object arguments
    pub class_name: Option<&'static str>,
}

impl ArgType {
    /// Describe a plain kind
    pub const fn of(variant_type: VariantType) -> Self {
        Self {
            variant_type,
            metadata: ArgMetadata::None,
            class_name: None,
        }
    }

    /// Describe a numeric kind with a width
    pub const fn with_metadata(variant_type: VariantType, metadata: ArgMetadata) -> Self {
        Self {
            variant_type,
            metadata,
            class_name: None,
        }
    }

    /// Describe an object of the given engine class
    pub const fn object(class_name: &'static str) -> Self {
        Self {
            variant_type: VariantType::Object,
            metadata: ArgMetadata::None,
            class_name: Some(class_name),
        }
    }

    /// Whether a value of kind `other` may be passed where `self` is declared
    pub fn accepts(&self, other: &ArgType) -> bool {
        if self.variant_type == VariantType::Nil {
            // any value
            return true;
        }
        self.variant_type == other.variant_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_round_trip() {
        for (i, ty) in VariantType::ALL.iter().enumerate() {
            assert_eq!(ty.as_u32() as usize, i);
            assert_eq!(VariantType::from_u32(i as u32), Some(*ty));
        }
        assert_eq!(VariantType::from_u32(39), None);
    }

    #[test]
    fn test_direct_layout() {
        assert_eq!(VariantType::Bool.direct_size(), 1);
        assert_eq!(VariantType::Int.direct_size(), 8);
        assert_eq!(VariantType::Vector3.direct_size(), 12);
        assert_eq!(VariantType::Projection.direct_size(), 64);
        assert_eq!(VariantType::String.direct_size(), 8);
        assert_eq!(VariantType::Color.direct_align(), 4);
        assert!(VariantType::Color.is_inline());
        assert!(!VariantType::Transform3D.is_inline());
    }

    #[test]
    fn test_check_width() {
        use ArgMetadata::*;
        assert_eq!(ArgMetadata::check_width(IntIsInt32, IntIsInt64, false), Ok(IntIsInt64));
        assert_eq!(ArgMetadata::check_width(IntIsUint32, IntIsInt64, false), Ok(IntIsInt64));
        assert!(ArgMetadata::check_width(IntIsInt64, IntIsInt32, false).is_err());
        assert_eq!(ArgMetadata::check_width(IntIsInt64, IntIsInt32, true), Ok(IntIsInt32));
        assert!(ArgMetadata::check_width(IntIsInt8, IntIsUint64, false).is_err());
        assert!(matches!(
            ArgMetadata::check_width(IntIsInt64, RealIsDouble, true),
            Err(VariantError::IncompatibleWidth { .. })
        ));
        assert_eq!(ArgMetadata::check_width(RealIsDouble, None, false), Ok(RealIsDouble));
    }

    #[test]
    fn test_check_int() {
        assert!(ArgMetadata::IntIsInt8.check_int(127).is_ok());
        assert!(ArgMetadata::IntIsInt8.check_int(128).is_err());
        assert!(ArgMetadata::IntIsUint16.check_int(-1).is_err());
        assert!(ArgMetadata::IntIsInt64.check_int(i64::MIN).is_ok());
    }
}
