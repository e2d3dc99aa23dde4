//! Consumer delivery flags

/// Delivery flags of a signal consumer (bitflags-style).
///
/// Bit values match the engine's connect flags so they pass through
/// unchanged once a signal is proxied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ConsumerFlags(u32);

impl ConsumerFlags {
    /// Immediate delivery
    pub const NONE: Self = Self(0);

    /// Queue delivery for the main context instead of calling inline
    pub const DEFERRED: Self = Self(1 << 0);

    /// Disconnect after the first delivery
    pub const ONE_SHOT: Self = Self(1 << 2);

    /// Create empty flags
    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

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

    /// Check if empty
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
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

impl std::ops::BitOr for ConsumerFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let flags = ConsumerFlags::DEFERRED | ConsumerFlags::ONE_SHOT;
        assert!(flags.contains(ConsumerFlags::DEFERRED));
        assert!(flags.contains(ConsumerFlags::ONE_SHOT));
        assert_eq!(flags.bits(), 5);
        assert!(ConsumerFlags::empty().is_empty());
    }
}
