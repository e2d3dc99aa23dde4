//! Property and method flag sets

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $value:expr;)* }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(transparent)]
        pub struct $name(u32);

        impl $name {
            $($(#[$fmeta])* pub const $flag: Self = Self($value);)*

            /// Create from raw bits
            #[inline]
            pub const fn from_bits(bits: u32) -> Self {
                Self(bits)
            }

            /// Get raw bits
            #[inline]
            pub const fn bits(&self) -> u32 {
                self.0
            }

            /// Check if contains flag
            #[inline]
            pub const fn contains(&self, other: Self) -> bool {
                (self.0 & other.0) == other.0
            }

            /// Union of two flag sets
            #[inline]
            pub const fn union(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                self.union(rhs)
            }
        }
    };
}

flag_set!(
    /// How the engine uses a property (bitflags-style)
    PropertyUsage {
        NONE = 0;
        /// Saved with the object
        STORAGE = 1 << 1;
        /// Shown in the inspector
        EDITOR = 1 << 2;
        /// Storage and editor
        DEFAULT = (1 << 1) | (1 << 2);
        /// Marks a group header
        GROUP = 1 << 6;
        /// Marks a category header
        CATEGORY = 1 << 7;
        /// Value is one of the class's enum constants
        CLASS_IS_ENUM = 1 << 16;
        /// Value accepts any variant
        NIL_IS_VARIANT = 1 << 17;
    }
);

flag_set!(
    /// Method traits reported to the engine (bitflags-style)
    MethodFlags {
        NORMAL = 1;
        EDITOR = 1 << 1;
        CONST = 1 << 2;
        VIRTUAL = 1 << 3;
        VARARG = 1 << 4;
        STATIC = 1 << 5;
    }
);

impl Default for PropertyUsage {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Default for MethodFlags {
    fn default() -> Self {
        Self::NORMAL
    }
}
