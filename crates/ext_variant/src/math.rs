//! Fixed-layout math aggregates
//!
//! All types are `#[repr(C)]` plain old data so that direct-convention slots
//! are read and written as raw bytes.

use bytemuck::{Pod, Zeroable};

macro_rules! pod_struct {
    ($(#[$meta:meta])* $name:ident { $($field:ident: $ty:ty),* $(,)? }) => {
        $(#[$meta])*
        #[repr(C)]
        #[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
        pub struct $name {
            $(pub $field: $ty),*
        }

        impl $name {
            #[allow(clippy::too_many_arguments)]
            pub const fn new($($field: $ty),*) -> Self {
                Self { $($field),* }
            }
        }
    };
}

pod_struct!(
    /// 2D float vector
    Vector2 { x: f32, y: f32 }
);
pod_struct!(
    /// 2D integer vector
    Vector2i { x: i32, y: i32 }
);
pod_struct!(
    /// 3D float vector
    Vector3 { x: f32, y: f32, z: f32 }
);
pod_struct!(
    /// 3D integer vector
    Vector3i { x: i32, y: i32, z: i32 }
);
pod_struct!(
    /// 4D float vector
    Vector4 { x: f32, y: f32, z: f32, w: f32 }
);
pod_struct!(
    /// 4D integer vector
    Vector4i { x: i32, y: i32, z: i32, w: i32 }
);
pod_struct!(
    /// Axis-aligned rectangle
    Rect2 { position: Vector2, size: Vector2 }
);
pod_struct!(
    /// Axis-aligned integer rectangle
    Rect2i { position: Vector2i, size: Vector2i }
);
pod_struct!(
    /// Plane in normal-distance form
    Plane { normal: Vector3, d: f32 }
);
pod_struct!(
    /// Rotation quaternion
    Quaternion { x: f32, y: f32, z: f32, w: f32 }
);
pod_struct!(
    /// RGBA color
    Color { r: f32, g: f32, b: f32, a: f32 }
);
pod_struct!(
    /// Axis-aligned bounding box
    Aabb { position: Vector3, size: Vector3 }
);
pod_struct!(
    /// 3x3 matrix stored as rows
    Basis { rows: [Vector3; 3] }
);
pod_struct!(
    /// 2D affine transform
    Transform2D { x: Vector2, y: Vector2, origin: Vector2 }
);
pod_struct!(
    /// 3D affine transform
    Transform3D { basis: Basis, origin: Vector3 }
);
pod_struct!(
    /// 4x4 projection matrix stored as columns
    Projection { columns: [Vector4; 4] }
);

impl Quaternion {
    pub const IDENTITY: Self = Self::new(0.0, 0.0, 0.0, 1.0);
}

impl Color {
    pub const WHITE: Self = Self::new(1.0, 1.0, 1.0, 1.0);
    pub const BLACK: Self = Self::new(0.0, 0.0, 0.0, 1.0);
}

impl Basis {
    pub const IDENTITY: Self = Self::new([
        Vector3::new(1.0, 0.0, 0.0),
        Vector3::new(0.0, 1.0, 0.0),
        Vector3::new(0.0, 0.0, 1.0),
    ]);
}

impl Transform2D {
    pub const IDENTITY: Self = Self::new(
        Vector2::new(1.0, 0.0),
        Vector2::new(0.0, 1.0),
        Vector2::new(0.0, 0.0),
    );
}

impl Transform3D {
    pub const IDENTITY: Self = Self::new(Basis::IDENTITY, Vector3::new(0.0, 0.0, 0.0));
}
