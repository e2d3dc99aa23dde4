//! The engine's three-word variant and its two ownership modes
//!
//! ```text
//! ┌────────┬────────┬──────────────────┬──────────────────┐
//! │ tag u32│ pad u32│ data[0] u64      │ data[1] u64      │
//! └────────┴────────┴──────────────────┴──────────────────┘
//!   inline kinds: value bytes packed into data
//!   heap kinds:   data[0] = pointer to a boxed `Value`
//! ```
//!
//! [`Variant`] owns its payload: dropping it frees the box and
//! [`Variant::into_raw`] hands that responsibility to the engine, which
//! releases it through [`ext_variant_destroy`]. [`VariantRef`] only borrows
//! a variant for the duration of a call and never frees anything.

use std::marker::PhantomData;
use std::mem::ManuallyDrop;

use bytemuck::{Pod, Zeroable};

use crate::error::{Result, VariantError};
use crate::math::*;
use crate::value::{ObjectId, Rid, Value};
use crate::types::VariantType;

/// Wire form of a variant
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct RawVariant {
    pub tag: u32,
    pub _pad: u32,
    pub data: [u64; 2],
}

impl RawVariant {
    pub const NIL: Self = Self {
        tag: 0,
        _pad: 0,
        data: [0, 0],
    };

    /// Kind named by the tag
    pub fn variant_type(&self) -> Result<VariantType> {
        VariantType::from_u32(self.tag).ok_or(VariantError::InvalidTag(self.tag))
    }

    fn payload_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(&self.data)
    }

    fn payload_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::bytes_of_mut(&mut self.data)
    }
}

fn pack<T: Pod>(raw: &mut RawVariant, value: &T) {
    let bytes = bytemuck::bytes_of(value);
    raw.payload_bytes_mut()[..bytes.len()].copy_from_slice(bytes);
}

fn unpack<T: Pod>(raw: &RawVariant) -> T {
    bytemuck::pod_read_unaligned(&raw.payload_bytes()[..std::mem::size_of::<T>()])
}

/// Encode a value, boxing heap payloads. The caller owns the result.
pub fn encode_variant(value: Value) -> RawVariant {
    let ty = value.variant_type();
    let mut raw = RawVariant {
        tag: ty.as_u32(),
        ..RawVariant::NIL
    };
    match value {
        Value::Nil => {}
        Value::Bool(b) => raw.data[0] = b as u64,
        Value::Int(i) => raw.data[0] = i as u64,
        Value::Float(f) => raw.data[0] = f.to_bits(),
        Value::Vector2(v) => pack(&mut raw, &v),
        Value::Vector2i(v) => pack(&mut raw, &v),
        Value::Rect2(v) => pack(&mut raw, &v),
        Value::Rect2i(v) => pack(&mut raw, &v),
        Value::Vector3(v) => pack(&mut raw, &v),
        Value::Vector3i(v) => pack(&mut raw, &v),
        Value::Vector4(v) => pack(&mut raw, &v),
        Value::Vector4i(v) => pack(&mut raw, &v),
        Value::Plane(v) => pack(&mut raw, &v),
        Value::Quaternion(v) => pack(&mut raw, &v),
        Value::Color(v) => pack(&mut raw, &v),
        Value::Rid(rid) => raw.data[0] = rid.0,
        Value::Object(id) => raw.data[0] = id.0,
        heap => raw.data[0] = Box::into_raw(Box::new(heap)) as usize as u64,
    }
    raw
}

/// Decode a variant into a fresh host value without taking ownership.
///
/// # Safety
///
/// For heap kinds `raw.data[0]` must be null or point to a live payload
/// produced by [`encode_variant`].
pub unsafe fn decode_variant(raw: &RawVariant) -> Result<Value> {
    let ty = raw.variant_type()?;
    let value = match ty {
        VariantType::Nil => Value::Nil,
        VariantType::Bool => Value::Bool(raw.data[0] & 0xff != 0),
        VariantType::Int => Value::Int(raw.data[0] as i64),
        VariantType::Float => Value::Float(f64::from_bits(raw.data[0])),
        VariantType::Vector2 => Value::Vector2(unpack(raw)),
        VariantType::Vector2i => Value::Vector2i(unpack(raw)),
        VariantType::Rect2 => Value::Rect2(unpack(raw)),
        VariantType::Rect2i => Value::Rect2i(unpack(raw)),
        VariantType::Vector3 => Value::Vector3(unpack::<Vector3>(raw)),
        VariantType::Vector3i => Value::Vector3i(unpack::<Vector3i>(raw)),
        VariantType::Vector4 => Value::Vector4(unpack(raw)),
        VariantType::Vector4i => Value::Vector4i(unpack(raw)),
        VariantType::Plane => Value::Plane(unpack(raw)),
        VariantType::Quaternion => Value::Quaternion(unpack(raw)),
        VariantType::Color => Value::Color(unpack(raw)),
        VariantType::Rid => Value::Rid(Rid(raw.data[0])),
        VariantType::Object => Value::Object(ObjectId(raw.data[0])),
        heap => {
            let ptr = raw.data[0] as usize as *const Value;
            if ptr.is_null() {
                return Err(VariantError::NullPayload(heap));
            }
            let payload = &*ptr;
            let found = payload.variant_type();
            if found != heap {
                return Err(VariantError::PayloadMismatch { tag: heap, found });
            }
            payload.clone()
        }
    };
    Ok(value)
}

/// Free a heap payload and reset the variant to nil.
///
/// # Safety
///
/// Same contract as [`decode_variant`]; the payload must not be used again.
pub unsafe fn release_variant(raw: &mut RawVariant) {
    match raw.variant_type() {
        Ok(ty) if ty.is_heap() => {
            let ptr = raw.data[0] as usize as *mut Value;
            if !ptr.is_null() {
                drop(Box::from_raw(ptr));
            }
        }
        Ok(_) => {}
        Err(_) => log::warn!("Releasing variant with unknown tag {}", raw.tag),
    }
    *raw = RawVariant::NIL;
}

/// Owned variant. Dropping it frees the payload.
#[derive(Debug)]
pub struct Variant {
    raw: RawVariant,
}

impl Variant {
    pub fn nil() -> Self {
        Self { raw: RawVariant::NIL }
    }

    /// Encode a host value into an owned variant
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            raw: encode_variant(value.into()),
        }
    }

    /// Take ownership of a variant produced elsewhere.
    ///
    /// # Safety
    ///
    /// `raw` must satisfy the [`decode_variant`] contract and must not be
    /// released by anyone else.
    pub unsafe fn from_raw(raw: RawVariant) -> Self {
        Self { raw }
    }

    /// Transfer the payload to the caller, typically the engine
    pub fn into_raw(self) -> RawVariant {
        let this = ManuallyDrop::new(self);
        this.raw
    }

    pub fn as_raw(&self) -> &RawVariant {
        &self.raw
    }

    pub fn variant_type(&self) -> VariantType {
        self.raw.variant_type().unwrap_or(VariantType::Nil)
    }

    /// Decode a copy of the value
    pub fn to_value(&self) -> Result<Value> {
        self.borrow().to_value()
    }

    /// Borrow for a call
    pub fn borrow(&self) -> VariantRef<'_> {
        VariantRef {
            raw: &self.raw,
            _marker: PhantomData,
        }
    }
}

impl Clone for Variant {
    fn clone(&self) -> Self {
        match self.to_value() {
            Ok(value) => Variant::new(value),
            Err(_) => Variant::nil(),
        }
    }
}

impl Default for Variant {
    fn default() -> Self {
        Self::nil()
    }
}

impl Drop for Variant {
    fn drop(&mut self) {
        // SAFETY: an owned variant is the sole owner of its payload
        unsafe { release_variant(&mut self.raw) }
    }
}

impl From<Value> for Variant {
    fn from(value: Value) -> Self {
        Variant::new(value)
    }
}

/// Variant borrowed for the duration of one call
#[derive(Debug, Clone, Copy)]
pub struct VariantRef<'a> {
    raw: &'a RawVariant,
    _marker: PhantomData<&'a Value>,
}

impl<'a> VariantRef<'a> {
    /// Borrow a variant from an engine pointer. Returns `None` for null.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or valid for `'a` and satisfy the
    /// [`decode_variant`] contract.
    pub unsafe fn from_ptr(ptr: *const RawVariant) -> Option<Self> {
        ptr.as_ref().map(|raw| Self {
            raw,
            _marker: PhantomData,
        })
    }

    pub fn raw(&self) -> &'a RawVariant {
        self.raw
    }

    pub fn variant_type(&self) -> Result<VariantType> {
        self.raw.variant_type()
    }

    /// Decode a copy of the value
    pub fn to_value(&self) -> Result<Value> {
        // SAFETY: upheld by the constructor contract
        unsafe { decode_variant(self.raw) }
    }
}

/// Release a variant whose payload was transferred to the engine.
///
/// # Safety
///
/// `variant` must be null or point to a variant produced by
/// [`Variant::into_raw`] that has not been released yet.
#[no_mangle]
pub unsafe extern "C" fn ext_variant_destroy(variant: *mut RawVariant) {
    if let Some(raw) = variant.as_mut() {
        release_variant(raw);
    }
}

/// Write an independently owned copy of `src` into `dst`.
///
/// # Safety
///
/// `src` must satisfy the [`decode_variant`] contract and `dst` must be
/// valid for writes.
#[no_mangle]
pub unsafe extern "C" fn ext_variant_new_copy(dst: *mut RawVariant, src: *const RawVariant) {
    if dst.is_null() {
        return;
    }
    let copy = match VariantRef::from_ptr(src).map(|v| v.to_value()) {
        Some(Ok(value)) => encode_variant(value),
        _ => RawVariant::NIL,
    };
    dst.write(copy);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Array, Dictionary};

    fn round_trip(value: Value) {
        let owned = Variant::new(value.clone());
        assert_eq!(owned.variant_type(), value.variant_type());
        assert_eq!(owned.to_value().unwrap(), value);
    }

    #[test]
    fn test_variant_is_three_words() {
        assert_eq!(std::mem::size_of::<RawVariant>(), 24);
    }

    #[test]
    fn test_round_trip_inline_kinds() {
        round_trip(Value::Nil);
        round_trip(Value::Bool(true));
        round_trip(Value::Int(-42));
        round_trip(Value::Float(1.25));
        round_trip(Value::Vector2(Vector2::new(1.0, 2.0)));
        round_trip(Value::Vector3i(Vector3i::new(1, -2, 3)));
        round_trip(Value::Rect2(Rect2::new(Vector2::new(0.0, 1.0), Vector2::new(2.0, 3.0))));
        round_trip(Value::Quaternion(Quaternion::IDENTITY));
        round_trip(Value::Color(Color::WHITE));
        round_trip(Value::Object(ObjectId(77)));
        round_trip(Value::Rid(Rid(9)));
    }

    #[test]
    fn test_round_trip_heap_kinds() {
        round_trip(Value::String("hello".into()));
        round_trip(Value::StringName("ready".into()));
        round_trip(Value::Transform3D(Transform3D::IDENTITY));
        round_trip(Value::Projection(Projection::default()));
        round_trip(Value::PackedFloat32Array(vec![1.0, 2.5]));
        let mut dict = Dictionary::new();
        dict.insert(Value::from("k"), Value::Int(1));
        round_trip(Value::Dictionary(dict));
        let array: Array = vec![Value::Int(1), Value::from("two")].into_iter().collect();
        round_trip(Value::Array(array));
    }

    #[test]
    fn test_into_raw_transfers_ownership() {
        let mut raw = Variant::new("owned by engine").into_raw();
        let borrowed = unsafe { VariantRef::from_ptr(&raw) }.unwrap();
        assert_eq!(borrowed.to_value().unwrap(), Value::from("owned by engine"));
        unsafe { ext_variant_destroy(&mut raw) };
        assert_eq!(raw, RawVariant::NIL);
    }

    #[test]
    fn test_garbage_is_rejected() {
        let bad_tag = RawVariant {
            tag: 999,
            ..RawVariant::NIL
        };
        assert_eq!(unsafe { decode_variant(&bad_tag) }, Err(VariantError::InvalidTag(999)));

        let null_string = RawVariant {
            tag: VariantType::String.as_u32(),
            ..RawVariant::NIL
        };
        assert!(matches!(
            unsafe { decode_variant(&null_string) },
            Err(VariantError::NullPayload(VariantType::String))
        ));
    }

    #[test]
    fn test_copy_is_independent() {
        let source = Variant::new(Value::PackedInt64Array(vec![1, 2, 3]));
        let mut copy = RawVariant::NIL;
        unsafe { ext_variant_new_copy(&mut copy, source.as_raw()) };
        drop(source);
        let copy = unsafe { Variant::from_raw(copy) };
        assert_eq!(copy.to_value().unwrap(), Value::PackedInt64Array(vec![1, 2, 3]));
    }
}
