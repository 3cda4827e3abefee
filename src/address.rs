//! Logical addresses into the main log and the read-cache log.
//!
//! An address is a 64-bit word: bits 0-47 hold the absolute offset into a
//! log, and bit 63 flags that the offset refers to the read-cache log rather
//! than the main log. The remaining bits are unused and always zero.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// A logical address into either the main log or the read-cache log.
///
/// The comparison operators order by the raw word, so a read-cache address
/// never compares equal to a main-log address at the same offset.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Address(u64);

impl Address {
    /// The null address. Terminates every hash chain.
    pub const INVALID: Self = Self(0);

    /// Marks a record detached from any chain.
    ///
    /// Distinct from [`Address::INVALID`] so a detached record cannot be
    /// confused with the zeroed header that pads a page remainder.
    pub const TEMP_INVALID: Self = Self(1);

    /// Number of bits in the absolute offset.
    pub const ADDRESS_BITS: u32 = 48;

    /// Mask selecting the absolute offset.
    pub const ABSOLUTE_MASK: u64 = (1 << Self::ADDRESS_BITS) - 1;

    /// Flag bit marking an address as referring to the read-cache log.
    pub const READ_CACHE_MASK: u64 = 1 << 63;

    /// Largest representable absolute offset.
    pub const MAX_ABSOLUTE: u64 = Self::ABSOLUTE_MASK;

    /// Create a main-log address from an absolute offset.
    #[inline]
    pub const fn new(absolute: u64) -> Self {
        debug_assert!(absolute <= Self::MAX_ABSOLUTE);
        Self(absolute)
    }

    /// Create an address from a raw 64-bit word.
    #[inline]
    pub const fn from_control(control: u64) -> Self {
        Self(control)
    }

    /// Raw 64-bit word, flag included.
    #[inline]
    pub const fn control(&self) -> u64 {
        self.0
    }

    /// Absolute offset with the read-cache flag stripped.
    #[inline]
    pub const fn absolute(&self) -> u64 {
        self.0 & Self::ABSOLUTE_MASK
    }

    /// Does this address refer to the read-cache log?
    #[inline]
    pub const fn in_read_cache(&self) -> bool {
        (self.0 & Self::READ_CACHE_MASK) != 0
    }

    /// The same offset, flagged as a read-cache address.
    #[inline]
    pub const fn with_read_cache(&self) -> Self {
        Self(self.0 | Self::READ_CACHE_MASK)
    }

    /// The same offset as a plain main-log address.
    #[inline]
    pub const fn strip_read_cache(&self) -> Self {
        Self(self.0 & Self::ABSOLUTE_MASK)
    }

    /// Is this the null address?
    #[inline]
    pub const fn is_invalid(&self) -> bool {
        self.0 == Self::INVALID.0
    }

    /// Is this the detached-record sentinel?
    #[inline]
    pub const fn is_temp_invalid(&self) -> bool {
        self.0 == Self::TEMP_INVALID.0
    }

    /// True for both sentinels. Records whose previous address satisfies
    /// this need no chain maintenance on eviction.
    #[inline]
    pub const fn is_sentinel(&self) -> bool {
        self.0 <= Self::TEMP_INVALID.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Address")
            .field("absolute", &self.absolute())
            .field("read_cache", &self.in_read_cache())
            .finish()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.in_read_cache() {
            write!(f, "rc:{:#x}", self.absolute())
        } else {
            write!(f, "{:#x}", self.absolute())
        }
    }
}

impl PartialOrd for Address {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Add<u64> for Address {
    type Output = Self;

    #[inline]
    fn add(self, delta: u64) -> Self::Output {
        debug_assert!(self.absolute() + delta <= Self::MAX_ABSOLUTE);
        Self(self.0 + delta)
    }
}

impl AddAssign<u64> for Address {
    #[inline]
    fn add_assign(&mut self, delta: u64) {
        debug_assert!(self.absolute() + delta <= Self::MAX_ABSOLUTE);
        self.0 += delta;
    }
}

impl Sub for Address {
    type Output = u64;

    #[inline]
    fn sub(self, other: Self) -> Self::Output {
        self.absolute() - other.absolute()
    }
}

impl From<u64> for Address {
    #[inline]
    fn from(control: u64) -> Self {
        Self(control)
    }
}

impl From<Address> for u64 {
    #[inline]
    fn from(addr: Address) -> Self {
        addr.0
    }
}

/// Atomic cell holding an [`Address`].
#[repr(transparent)]
pub struct AtomicAddress {
    control: AtomicU64,
}

impl AtomicAddress {
    /// Create a new atomic address.
    #[inline]
    pub const fn new(address: Address) -> Self {
        Self {
            control: AtomicU64::new(address.0),
        }
    }

    /// Load the address.
    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> Address {
        Address(self.control.load(ordering))
    }

    /// Store an address.
    #[inline]
    pub fn store(&self, address: Address, ordering: AtomicOrdering) {
        self.control.store(address.0, ordering);
    }

    /// Compare-and-exchange the address.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: Address,
        new: Address,
        success: AtomicOrdering,
        failure: AtomicOrdering,
    ) -> Result<Address, Address> {
        self.control
            .compare_exchange(current.0, new.0, success, failure)
            .map(Address)
            .map_err(Address)
    }

    /// Advance the address to `new` if it is greater than the current value.
    ///
    /// Used for the monotone frontiers (head, safe-head, tail).
    pub fn advance_to(&self, new: Address) -> Address {
        let mut current = self.load(AtomicOrdering::Acquire);
        while new > current {
            match self.control.compare_exchange_weak(
                current.0,
                new.0,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            ) {
                Ok(_) => return new,
                Err(actual) => current = Address(actual),
            }
        }
        current
    }
}

impl Default for AtomicAddress {
    fn default() -> Self {
        Self::new(Address::INVALID)
    }
}

impl fmt::Debug for AtomicAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicAddress")
            .field(&self.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels() {
        assert!(Address::INVALID.is_invalid());
        assert!(Address::TEMP_INVALID.is_temp_invalid());
        assert!(Address::INVALID.is_sentinel());
        assert!(Address::TEMP_INVALID.is_sentinel());
        assert!(!Address::new(64).is_sentinel());
        assert_ne!(Address::INVALID, Address::TEMP_INVALID);
    }

    #[test]
    fn test_read_cache_flag() {
        let addr = Address::new(0x1000);
        assert!(!addr.in_read_cache());

        let rc = addr.with_read_cache();
        assert!(rc.in_read_cache());
        assert_eq!(rc.absolute(), 0x1000);
        assert_eq!(rc.strip_read_cache(), addr);
    }

    #[test]
    fn test_ordering_within_log_kind() {
        let a = Address::new(0x1000).with_read_cache();
        let b = Address::new(0x2000).with_read_cache();
        assert!(a < b);
        assert_eq!(b - a, 0x1000);
    }

    #[test]
    fn test_arithmetic() {
        let addr = Address::new(100);
        assert_eq!((addr + 28).absolute(), 128);

        let rc = Address::new(100).with_read_cache() + 28;
        assert!(rc.in_read_cache());
        assert_eq!(rc.absolute(), 128);
    }

    #[test]
    fn test_atomic_advance_to() {
        let atomic = AtomicAddress::new(Address::new(64));
        assert_eq!(atomic.advance_to(Address::new(128)), Address::new(128));
        // A lower target never moves the frontier backwards.
        assert_eq!(atomic.advance_to(Address::new(96)), Address::new(128));
    }

    #[test]
    fn test_atomic_cas() {
        let atomic = AtomicAddress::new(Address::INVALID);
        let new = Address::new(0x40).with_read_cache();
        assert!(atomic
            .compare_exchange(
                Address::INVALID,
                new,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire
            )
            .is_ok());
        assert_eq!(atomic.load(AtomicOrdering::Acquire), new);
    }
}
