//! Direct (ptrcall) convention codecs
//!
//! Each kind owns one entry in a static table, indexed by its tag, holding
//! the slot width and the functions that read and write a slot. Integers
//! always travel as 64-bit and reals as 64-bit; declared widths only
//! constrain the host-side range. Heap kinds travel as a pointer to a boxed
//! payload and `Nil` (any value) travels as a whole [`RawVariant`].

use std::mem::size_of;

use crate::error::{Result, VariantError};
use crate::math::*;
use crate::types::VariantType;
use crate::value::{ObjectId, Rid, Value};
use crate::variant::{decode_variant, encode_variant, release_variant, RawVariant};

/// One row of the dispatch table
pub struct DirectCodec {
    pub kind: VariantType,
    pub size: usize,
    /// Slot holds a pointer to a boxed payload
    pub boxed: bool,
    read: fn(&[u8]) -> Result<Value>,
    write: fn(&Value, &mut [u8]) -> Result<()>,
}

fn mismatch(kind: VariantType, value: &Value) -> VariantError {
    VariantError::conversion(value.variant_type(), kind.name())
}

macro_rules! pod_codec {
    ($kind:ident, $ty:ty) => {
        DirectCodec {
            kind: VariantType::$kind,
            size: size_of::<$ty>(),
            boxed: false,
            read: |src| {
                Ok(Value::$kind(bytemuck::pod_read_unaligned::<$ty>(
                    &src[..size_of::<$ty>()],
                )))
            },
            write: |value, dst| match value {
                Value::$kind(v) => {
                    dst[..size_of::<$ty>()].copy_from_slice(bytemuck::bytes_of(v));
                    Ok(())
                }
                other => Err(mismatch(VariantType::$kind, other)),
            },
        }
    };
}

macro_rules! heap_codec {
    ($kind:ident) => {
        DirectCodec {
            kind: VariantType::$kind,
            size: size_of::<u64>(),
            boxed: true,
            read: |src| read_boxed(VariantType::$kind, src),
            write: |value, dst| write_boxed(VariantType::$kind, value, dst),
        }
    };
}

fn read_u64(src: &[u8]) -> u64 {
    bytemuck::pod_read_unaligned(&src[..8])
}

fn write_u64(dst: &mut [u8], v: u64) {
    dst[..8].copy_from_slice(&v.to_ne_bytes());
}

fn read_boxed(kind: VariantType, src: &[u8]) -> Result<Value> {
    let ptr = read_u64(src) as usize as *const Value;
    if ptr.is_null() {
        return Err(VariantError::NullPayload(kind));
    }
    // SAFETY: only reachable through `read_direct`, whose caller vouches
    // for the slot
    let payload = unsafe { &*ptr };
    if payload.variant_type() != kind {
        return Err(VariantError::PayloadMismatch {
            tag: kind,
            found: payload.variant_type(),
        });
    }
    Ok(payload.clone())
}

fn write_boxed(kind: VariantType, value: &Value, dst: &mut [u8]) -> Result<()> {
    if value.variant_type() != kind {
        return Err(mismatch(kind, value));
    }
    let ptr = Box::into_raw(Box::new(value.clone()));
    write_u64(dst, ptr as usize as u64);
    Ok(())
}

static DIRECT_TABLE: [DirectCodec; VariantType::COUNT] = [
    DirectCodec {
        kind: VariantType::Nil,
        size: size_of::<RawVariant>(),
        boxed: false,
        read: |src| {
            let raw: RawVariant = bytemuck::pod_read_unaligned(&src[..size_of::<RawVariant>()]);
            // SAFETY: see `read_boxed`
            unsafe { decode_variant(&raw) }
        },
        write: |value, dst| {
            let raw = encode_variant(value.clone());
            dst[..size_of::<RawVariant>()].copy_from_slice(bytemuck::bytes_of(&raw));
            Ok(())
        },
    },
    DirectCodec {
        kind: VariantType::Bool,
        size: 1,
        boxed: false,
        read: |src| Ok(Value::Bool(src[0] != 0)),
        write: |value, dst| match value {
            Value::Bool(b) => {
                dst[0] = *b as u8;
                Ok(())
            }
            other => Err(mismatch(VariantType::Bool, other)),
        },
    },
    DirectCodec {
        kind: VariantType::Int,
        size: 8,
        boxed: false,
        read: |src| Ok(Value::Int(read_u64(src) as i64)),
        write: |value, dst| match value {
            Value::Int(i) => {
                write_u64(dst, *i as u64);
                Ok(())
            }
            other => Err(mismatch(VariantType::Int, other)),
        },
    },
    DirectCodec {
        kind: VariantType::Float,
        size: 8,
        boxed: false,
        read: |src| Ok(Value::Float(f64::from_bits(read_u64(src)))),
        write: |value, dst| match value {
            Value::Float(f) => {
                write_u64(dst, f.to_bits());
                Ok(())
            }
            other => Err(mismatch(VariantType::Float, other)),
        },
    },
    heap_codec!(String),
    pod_codec!(Vector2, Vector2),
    pod_codec!(Vector2i, Vector2i),
    pod_codec!(Rect2, Rect2),
    pod_codec!(Rect2i, Rect2i),
    pod_codec!(Vector3, Vector3),
    pod_codec!(Vector3i, Vector3i),
    pod_codec!(Transform2D, Transform2D),
    pod_codec!(Vector4, Vector4),
    pod_codec!(Vector4i, Vector4i),
    pod_codec!(Plane, Plane),
    pod_codec!(Quaternion, Quaternion),
    pod_codec!(Aabb, Aabb),
    pod_codec!(Basis, Basis),
    pod_codec!(Transform3D, Transform3D),
    pod_codec!(Projection, Projection),
    pod_codec!(Color, Color),
    heap_codec!(StringName),
    heap_codec!(NodePath),
    DirectCodec {
        kind: VariantType::Rid,
        size: 8,
        boxed: false,
        read: |src| Ok(Value::Rid(Rid(read_u64(src)))),
        write: |value, dst| match value {
            Value::Rid(rid) => {
                write_u64(dst, rid.0);
                Ok(())
            }
            other => Err(mismatch(VariantType::Rid, other)),
        },
    },
    DirectCodec {
        kind: VariantType::Object,
        size: 8,
        boxed: false,
        read: |src| Ok(Value::Object(ObjectId(read_u64(src)))),
        write: |value, dst| match value {
            Value::Object(id) => {
                write_u64(dst, id.0);
                Ok(())
            }
            Value::Nil => {
                write_u64(dst, 0);
                Ok(())
            }
            other => Err(mismatch(VariantType::Object, other)),
        },
    },
    heap_codec!(Callable),
    heap_codec!(Signal),
    heap_codec!(Dictionary),
    heap_codec!(Array),
    heap_codec!(PackedByteArray),
    heap_codec!(PackedInt32Array),
    heap_codec!(PackedInt64Array),
    heap_codec!(PackedFloat32Array),
    heap_codec!(PackedFloat64Array),
    heap_codec!(PackedStringArray),
    heap_codec!(PackedVector2Array),
    heap_codec!(PackedVector3Array),
    heap_codec!(PackedColorArray),
    heap_codec!(PackedVector4Array),
];

/// Table row for a raw kind tag, `None` for kinds the table does not cover
pub fn direct_codec(tag: u32) -> Option<&'static DirectCodec> {
    DIRECT_TABLE.get(tag as usize)
}

fn codec_for(kind: VariantType, len: usize) -> Result<&'static DirectCodec> {
    let codec = &DIRECT_TABLE[kind as usize];
    if len < codec.size {
        return Err(VariantError::SlotTooSmall {
            kind,
            needed: codec.size,
            got: len,
        });
    }
    Ok(codec)
}

/// Read a slot of `kind` into a host value. Heap payloads are copied.
///
/// # Safety
///
/// For heap kinds and `Nil`, the slot must hold a null or live payload
/// pointer produced by [`write_direct`] or the variant encoder.
pub unsafe fn read_direct(kind: VariantType, src: &[u8]) -> Result<Value> {
    let codec = codec_for(kind, src.len())?;
    (codec.read)(src)
}

/// Write a host value into a slot of `kind`. Heap payloads are boxed and
/// owned by whoever receives the slot.
pub fn write_direct(kind: VariantType, value: &Value, dst: &mut [u8]) -> Result<()> {
    let codec = codec_for(kind, dst.len())?;
    (codec.write)(value, dst)
}

/// Free whatever a slot of `kind` owns and zero it.
///
/// # Safety
///
/// Same contract as [`read_direct`]; the payload must not be used again.
pub unsafe fn release_direct(kind: VariantType, slot: &mut [u8]) {
    let codec = &DIRECT_TABLE[kind as usize];
    let size = codec.size.min(slot.len());
    if kind == VariantType::Nil && slot.len() >= size_of::<RawVariant>() {
        let mut raw: RawVariant = bytemuck::pod_read_unaligned(&slot[..size_of::<RawVariant>()]);
        release_variant(&mut raw);
    } else if codec.boxed && slot.len() >= 8 {
        let ptr = read_u64(slot) as usize as *mut Value;
        if !ptr.is_null() {
            drop(Box::from_raw(ptr));
        }
    }
    slot[..size].fill(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callable::Callable;
    use crate::value::{Array, Dictionary, SignalRef};

    /// Aggregate whose every float reads 1.0
    fn filled<T: bytemuck::Pod>() -> T {
        let bytes: Vec<u8> = 1.0f32
            .to_ne_bytes()
            .into_iter()
            .cycle()
            .take(size_of::<T>())
            .collect();
        bytemuck::pod_read_unaligned(&bytes)
    }

    fn sample(kind: VariantType) -> Value {
        use VariantType as K;
        match kind {
            K::Nil => Value::Nil,
            K::Bool => Value::Bool(true),
            K::Int => Value::Int(-7),
            K::Float => Value::Float(2.5),
            K::String => Value::String("text".into()),
            K::Vector2 => Value::Vector2(filled()),
            K::Vector2i => Value::Vector2i(filled()),
            K::Rect2 => Value::Rect2(filled()),
            K::Rect2i => Value::Rect2i(filled()),
            K::Vector3 => Value::Vector3(filled()),
            K::Vector3i => Value::Vector3i(filled()),
            K::Transform2D => Value::Transform2D(Transform2D::IDENTITY),
            K::Vector4 => Value::Vector4(filled()),
            K::Vector4i => Value::Vector4i(filled()),
            K::Plane => Value::Plane(filled()),
            K::Quaternion => Value::Quaternion(Quaternion::IDENTITY),
            K::Aabb => Value::Aabb(filled()),
            K::Basis => Value::Basis(Basis::IDENTITY),
            K::Transform3D => Value::Transform3D(Transform3D::IDENTITY),
            K::Projection => Value::Projection(filled()),
            K::Color => Value::Color(Color::WHITE),
            K::StringName => Value::StringName("name".into()),
            K::NodePath => Value::NodePath("a/b".into()),
            K::Rid => Value::Rid(Rid(9)),
            K::Object => Value::Object(ObjectId(3)),
            K::Callable => Value::Callable(Callable::from_fn(|_| Ok(Value::Nil))),
            K::Signal => Value::Signal(SignalRef::new(ObjectId(3), "hit")),
            K::Dictionary => Value::Dictionary(Dictionary::new()),
            K::Array => {
                let mut array = Array::new();
                array.push(Value::Int(1)).unwrap();
                Value::Array(array)
            }
            K::PackedByteArray => Value::PackedByteArray(vec![1, 2]),
            K::PackedInt32Array => Value::PackedInt32Array(vec![1, 2]),
            K::PackedInt64Array => Value::PackedInt64Array(vec![1, 2]),
            K::PackedFloat32Array => Value::PackedFloat32Array(vec![0.5]),
            K::PackedFloat64Array => Value::PackedFloat64Array(vec![0.25]),
            K::PackedStringArray => Value::PackedStringArray(vec!["s".into()]),
            K::PackedVector2Array => Value::PackedVector2Array(vec![filled()]),
            K::PackedVector3Array => Value::PackedVector3Array(vec![filled()]),
            K::PackedColorArray => Value::PackedColorArray(vec![Color::BLACK]),
            K::PackedVector4Array => Value::PackedVector4Array(vec![filled()]),
        }
    }

    fn round_trip(value: Value) {
        let kind = value.variant_type();
        let mut slot = vec![0u8; kind.direct_size()];
        write_direct(kind, &value, &mut slot).unwrap();
        let back = unsafe { read_direct(kind, &slot) }.unwrap();
        assert_eq!(back, value);
        unsafe { release_direct(kind, &mut slot) };
    }

    #[test]
    fn test_table_is_indexed_by_tag() {
        for (i, codec) in DIRECT_TABLE.iter().enumerate() {
            assert_eq!(codec.kind as usize, i);
            assert_eq!(codec.size, codec.kind.direct_size(), "{:?}", codec.kind);
        }
        assert!(direct_codec(VariantType::COUNT as u32).is_none());
    }

    #[test]
    fn test_round_trip_direct() {
        round_trip(Value::Bool(true));
        round_trip(Value::Int(i64::MIN));
        round_trip(Value::Float(-0.5));
        round_trip(Value::Vector3(Vector3::new(1.0, 2.0, 3.0)));
        round_trip(Value::Transform2D(Transform2D::IDENTITY));
        round_trip(Value::Basis(Basis::IDENTITY));
        round_trip(Value::Aabb(Aabb::default()));
        round_trip(Value::Object(ObjectId(5)));
        round_trip(Value::String("direct".into()));
        round_trip(Value::PackedStringArray(vec!["a".into(), "b".into()]));
        round_trip(Value::Callable(Callable::from_fn(|_| Ok(Value::Nil))));
        let mut dict = Dictionary::new();
        dict.insert(Value::Int(1), Value::Bool(false));
        round_trip(Value::Dictionary(dict));
    }

    #[test]
    fn test_every_kind_round_trips_and_releases() {
        for kind in VariantType::ALL {
            let value = sample(kind);
            assert_eq!(value.variant_type(), kind);
            let mut slot = vec![0u8; kind.direct_size()];
            write_direct(kind, &value, &mut slot).unwrap();
            let back = unsafe { read_direct(kind, &slot) }.unwrap();
            assert_eq!(back, value, "{kind:?}");
            unsafe { release_direct(kind, &mut slot) };
            assert!(slot.iter().all(|b| *b == 0), "{kind:?}");
        }
    }

    #[test]
    fn test_aggregates_are_not_boxed() {
        for kind in [
            VariantType::Transform2D,
            VariantType::Aabb,
            VariantType::Basis,
            VariantType::Transform3D,
            VariantType::Projection,
        ] {
            assert!(kind.is_heap());
            assert!(!direct_codec(kind.as_u32()).unwrap().boxed);
        }
        assert!(direct_codec(VariantType::String.as_u32()).unwrap().boxed);
    }

    #[test]
    fn test_any_slot_carries_variant() {
        let mut slot = vec![0u8; VariantType::Nil.direct_size()];
        write_direct(VariantType::Nil, &Value::from("any"), &mut slot).unwrap();
        let back = unsafe { read_direct(VariantType::Nil, &slot) }.unwrap();
        assert_eq!(back, Value::from("any"));
        unsafe { release_direct(VariantType::Nil, &mut slot) };
        assert!(slot.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_short_slot_is_rejected() {
        let mut slot = [0u8; 4];
        assert!(matches!(
            write_direct(VariantType::Int, &Value::Int(1), &mut slot),
            Err(VariantError::SlotTooSmall { needed: 8, got: 4, .. })
        ));
    }

    #[test]
    fn test_wrong_kind_is_rejected() {
        let mut slot = [0u8; 8];
        assert!(write_direct(VariantType::Int, &Value::from("x"), &mut slot).is_err());
    }
}
