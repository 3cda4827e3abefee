//! Record headers and in-log record layout.
//!
//! Every record in either log is laid out as an 8-byte [`RecordInfo`] header
//! followed by the key and the value, each padded to its alignment. The
//! header packs the hash-chain link, lock state, and lifecycle flags into a
//! single atomic word so that chain splices, lock transfers, and
//! invalidation are all plain 64-bit atomic operations.

use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::Address;
use crate::utility::{murmur3_finalize, pad_alignment};

/// Record header.
///
/// Control-word layout:
/// - bits 0-47: previous address in the hash chain (absolute part)
/// - bit 48: previous address points into the read-cache log
/// - bits 49-55: shared-lock count
/// - bit 56: exclusive-lock bit
/// - bit 61: invalid
/// - bit 62: tombstone
/// - bit 63: sealed
///
/// The sealed bit is only ever set on main-log records. Closed read-cache
/// records are marked invalid instead; sealing means "retry", which a lookup
/// over an immutable cache record could never satisfy.
#[repr(transparent)]
pub struct RecordInfo {
    control: AtomicU64,
}

impl RecordInfo {
    /// Mask for the absolute previous address (48 bits).
    const PREV_ADDR_MASK: u64 = (1 << 48) - 1;
    /// Previous address points into the read-cache log.
    const PREV_READ_CACHE_BIT: u64 = 1 << 48;
    /// Mask for the whole previous-address field including the log-kind bit.
    const PREV_FIELD_MASK: u64 = Self::PREV_ADDR_MASK | Self::PREV_READ_CACHE_BIT;

    /// Shift of the shared-lock count.
    const SHARED_SHIFT: u32 = 49;
    /// Width of the shared-lock count.
    const SHARED_BITS: u32 = 7;
    /// Maximum number of concurrent shared locks.
    pub const MAX_SHARED_LOCKS: u64 = (1 << Self::SHARED_BITS) - 1;
    /// Mask of the shared-lock count, in place.
    const SHARED_MASK: u64 = Self::MAX_SHARED_LOCKS << Self::SHARED_SHIFT;
    /// One shared lock, in place.
    const SHARED_ONE: u64 = 1 << Self::SHARED_SHIFT;

    /// Exclusive-lock bit.
    const EXCLUSIVE_BIT: u64 = 1 << 56;
    /// Invalid bit.
    const INVALID_BIT: u64 = 1 << 61;
    /// Tombstone bit.
    const TOMBSTONE_BIT: u64 = 1 << 62;
    /// Sealed bit.
    const SEALED_BIT: u64 = 1 << 63;

    /// Create a header whose previous address is `previous` and whose flag
    /// bits are all clear.
    pub fn new(previous: Address) -> Self {
        Self {
            control: AtomicU64::new(Self::encode_previous(previous)),
        }
    }

    /// Create a tombstone header.
    pub fn new_tombstone(previous: Address) -> Self {
        Self {
            control: AtomicU64::new(Self::encode_previous(previous) | Self::TOMBSTONE_BIT),
        }
    }

    #[inline]
    const fn encode_previous(addr: Address) -> u64 {
        let mut word = addr.absolute();
        if addr.in_read_cache() {
            word |= Self::PREV_READ_CACHE_BIT;
        }
        word
    }

    #[inline]
    const fn decode_previous(control: u64) -> Address {
        let addr = Address::new(control & Self::PREV_ADDR_MASK);
        if control & Self::PREV_READ_CACHE_BIT != 0 {
            addr.with_read_cache()
        } else {
            addr
        }
    }

    /// All-zero header: the page-padding sentinel.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.control.load(Ordering::Acquire) == 0
    }

    /// The previous record in the hash chain.
    #[inline]
    pub fn previous_address(&self) -> Address {
        Self::decode_previous(self.control.load(Ordering::Acquire))
    }

    /// CAS replacing only the previous-address field, leaving lock and flag
    /// bits untouched.
    ///
    /// Fails as soon as the observed previous address differs from
    /// `expected`; concurrent lock-bit traffic only causes internal retries.
    pub fn try_update_address(&self, expected: Address, new: Address) -> bool {
        let expected_field = Self::encode_previous(expected);
        let new_field = Self::encode_previous(new);
        let mut current = self.control.load(Ordering::Acquire);
        loop {
            if current & Self::PREV_FIELD_MASK != expected_field {
                return false;
            }
            let desired = (current & !Self::PREV_FIELD_MASK) | new_field;
            match self.control.compare_exchange_weak(
                current,
                desired,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Unconditional store of the previous-address field.
    ///
    /// Only valid while the record is not yet published, or after it has
    /// been unlinked from every chain.
    pub fn set_previous_address(&self, addr: Address) {
        let field = Self::encode_previous(addr);
        let mut current = self.control.load(Ordering::Acquire);
        loop {
            let desired = (current & !Self::PREV_FIELD_MASK) | field;
            match self.control.compare_exchange_weak(
                current,
                desired,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Is the record invalid?
    #[inline]
    pub fn is_invalid(&self) -> bool {
        (self.control.load(Ordering::Acquire) & Self::INVALID_BIT) != 0
    }

    /// Mark the record invalid. Idempotent.
    #[inline]
    pub fn set_invalid(&self) {
        self.control.fetch_or(Self::INVALID_BIT, Ordering::AcqRel);
    }

    /// Is this a delete marker?
    #[inline]
    pub fn is_tombstone(&self) -> bool {
        (self.control.load(Ordering::Acquire) & Self::TOMBSTONE_BIT) != 0
    }

    /// Is the record sealed? Never true for a read-cache record.
    #[inline]
    pub fn is_sealed(&self) -> bool {
        (self.control.load(Ordering::Acquire) & Self::SEALED_BIT) != 0
    }

    /// Seal the record. Main-log use only.
    #[inline]
    pub fn seal(&self) {
        self.control.fetch_or(Self::SEALED_BIT, Ordering::AcqRel);
    }

    /// Current number of shared locks.
    #[inline]
    pub fn shared_lock_count(&self) -> u64 {
        (self.control.load(Ordering::Acquire) & Self::SHARED_MASK) >> Self::SHARED_SHIFT
    }

    /// Is the exclusive lock held?
    #[inline]
    pub fn is_locked_exclusive(&self) -> bool {
        (self.control.load(Ordering::Acquire) & Self::EXCLUSIVE_BIT) != 0
    }

    /// Take a shared lock. Fails on a closed (invalid or sealed) record,
    /// while the exclusive lock is held, or when the counter is saturated.
    ///
    /// Refusing closed records makes the lock-transfer snapshot exact: every
    /// lock granted on a record precedes the `fetch_or` that closes it, so
    /// the transferred count covers all of them.
    pub fn try_lock_shared(&self) -> bool {
        let mut current = self.control.load(Ordering::Acquire);
        loop {
            if current & (Self::EXCLUSIVE_BIT | Self::INVALID_BIT | Self::SEALED_BIT) != 0 {
                return false;
            }
            if current & Self::SHARED_MASK == Self::SHARED_MASK {
                return false;
            }
            match self.control.compare_exchange_weak(
                current,
                current + Self::SHARED_ONE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Release one shared lock.
    pub fn unlock_shared(&self) {
        let prior = self.control.fetch_sub(Self::SHARED_ONE, Ordering::AcqRel);
        debug_assert!(prior & Self::SHARED_MASK != 0);
    }

    /// Take the exclusive lock. Fails if any lock is held.
    pub fn try_lock_exclusive(&self) -> bool {
        let mut current = self.control.load(Ordering::Acquire);
        loop {
            if current & (Self::EXCLUSIVE_BIT | Self::SHARED_MASK) != 0 {
                return false;
            }
            match self.control.compare_exchange_weak(
                current,
                current | Self::EXCLUSIVE_BIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Release the exclusive lock.
    pub fn unlock_exclusive(&self) {
        let prior = self.control.fetch_and(!Self::EXCLUSIVE_BIT, Ordering::AcqRel);
        debug_assert!(prior & Self::EXCLUSIVE_BIT != 0);
    }

    /// Transfer shared locks from a doomed record onto this one and mark the
    /// source invalid: one `fetch_or` on the source captures its count and
    /// closes it, one `fetch_add` applies the count here.
    ///
    /// Exclusive locks are not transferred; a competing exclusive holder on
    /// the source has already lost its CAS and will retry. When
    /// `remove_ephemeral` is set, one shared lock (the caller's own, taken
    /// on the source during the lookup) is dropped instead of migrated.
    ///
    /// Returns the number of locks moved.
    pub fn copy_read_locks_from_and_mark_source(
        &self,
        src: &RecordInfo,
        remove_ephemeral: bool,
    ) -> u64 {
        let prior = src.control.fetch_or(Self::INVALID_BIT, Ordering::AcqRel);
        let mut count = (prior & Self::SHARED_MASK) >> Self::SHARED_SHIFT;
        if remove_ephemeral && count > 0 {
            count -= 1;
        }
        if count > 0 {
            let prior_here = self
                .control
                .fetch_add(count << Self::SHARED_SHIFT, Ordering::AcqRel);
            debug_assert!(
                ((prior_here & Self::SHARED_MASK) >> Self::SHARED_SHIFT) + count
                    <= Self::MAX_SHARED_LOCKS
            );
        }
        count
    }

    /// Raw control word.
    #[inline]
    pub fn control(&self) -> u64 {
        self.control.load(Ordering::Acquire)
    }
}

impl Default for RecordInfo {
    fn default() -> Self {
        Self {
            control: AtomicU64::new(0),
        }
    }
}

impl std::fmt::Debug for RecordInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordInfo")
            .field("previous_address", &self.previous_address())
            .field("invalid", &self.is_invalid())
            .field("tombstone", &self.is_tombstone())
            .field("sealed", &self.is_sealed())
            .field("shared_locks", &self.shared_lock_count())
            .field("exclusive", &self.is_locked_exclusive())
            .finish()
    }
}

const _: () = assert!(mem::size_of::<RecordInfo>() == 8);

/// A record stored in a log: header, then key, then value, each padded to
/// its alignment. The struct itself only names the header; key and value are
/// reached through the computed offsets.
#[repr(C)]
pub struct Record<K, V> {
    /// Record header.
    pub header: RecordInfo,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> Record<K, V> {
    /// Offset of the key from the record start.
    #[inline]
    pub const fn key_offset() -> usize {
        pad_alignment(mem::size_of::<RecordInfo>(), mem::align_of::<K>())
    }

    /// Offset of the value from the record start.
    #[inline]
    pub const fn value_offset() -> usize {
        pad_alignment(
            Self::key_offset() + mem::size_of::<K>(),
            mem::align_of::<V>(),
        )
    }

    /// Total in-log size of a record, including trailing padding so the next
    /// header is aligned.
    #[inline]
    pub const fn size() -> usize {
        pad_alignment(
            Self::value_offset() + mem::size_of::<V>(),
            mem::align_of::<RecordInfo>(),
        )
    }

    /// Reference to the key.
    ///
    /// # Safety
    /// The record must have been fully initialized at this location.
    #[inline]
    pub unsafe fn key(&self) -> &K {
        let head = self as *const _ as *const u8;
        &*(head.add(Self::key_offset()) as *const K)
    }

    /// Reference to the value.
    ///
    /// # Safety
    /// Same as [`Record::key`].
    #[inline]
    pub unsafe fn value(&self) -> &V {
        let head = self as *const _ as *const u8;
        &*(head.add(Self::value_offset()) as *const V)
    }

    /// Write the key into an uninitialized record.
    ///
    /// # Safety
    /// The caller must own the allocation and the slot must be
    /// uninitialized.
    #[inline]
    pub unsafe fn write_key(&mut self, key: K) {
        let head = self as *mut _ as *mut u8;
        std::ptr::write(head.add(Self::key_offset()) as *mut K, key);
    }

    /// Write the value into an uninitialized record.
    ///
    /// # Safety
    /// Same as [`Record::write_key`].
    #[inline]
    pub unsafe fn write_value(&mut self, value: V) {
        let head = self as *mut _ as *mut u8;
        std::ptr::write(head.add(Self::value_offset()) as *mut V, value);
    }
}

/// Trait for keys stored in the logs.
pub trait Key: Clone + Eq + Send + Sync + 'static {
    /// Stable 64-bit hash of the key.
    fn get_hash(&self) -> u64;
}

/// Trait for values stored in the logs.
pub trait Value: Clone + Send + Sync + 'static {}

impl Key for u64 {
    #[inline]
    fn get_hash(&self) -> u64 {
        murmur3_finalize(*self)
    }
}

impl Key for i64 {
    #[inline]
    fn get_hash(&self) -> u64 {
        murmur3_finalize(*self as u64)
    }
}

impl Value for u64 {}
impl Value for i64 {}
