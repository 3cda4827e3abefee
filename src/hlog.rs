//! The log seam shared by chain traversals, and the main-log collaborator.
//!
//! A hash chain spans two log instances, distinguished by one bit in each
//! address. [`LogAccess`] is the seam that lets a single walk step resolve a
//! record through whichever log the address selects.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::{Address, AtomicAddress};
use crate::record::{Key, Record, RecordInfo, Value};
use crate::status::Status;
use crate::utility::AlignedBuffer;

/// Record access common to the main log and the read-cache log.
pub trait LogAccess<K: Key, V: Value> {
    /// Lowest address whose record is resident in memory.
    fn head_address(&self) -> Address;

    /// Lowest address that has not been truncated away.
    fn begin_address(&self) -> Address;

    /// Address one past the last allocated record.
    fn tail_address(&self) -> Address;

    /// The record header at `logical`.
    ///
    /// `logical` must be in `[head_address, tail_address)`; the reference is
    /// stable for the lifetime of the caller's epoch acquisition.
    fn get_info(&self, logical: Address) -> &RecordInfo;

    /// The key of the record at `logical`. Same bounds as [`LogAccess::get_info`].
    fn get_key(&self, logical: Address) -> &K;
}

/// Minimal in-memory main log.
///
/// Stands in for the engine's hybrid-log allocator at the subsystem
/// boundary: an append-only bump allocator over one fixed buffer, with
/// monotone `begin`/`head` frontiers. Advancing `head_address` past a record
/// models that record escaping to disk; the bytes stay resident so records
/// above `begin_address` remain readable by tests, but the engine treats
/// addresses below `head_address` as non-memory.
pub struct MainLog<K: Key, V: Value> {
    buffer: AlignedBuffer,
    begin_address: AtomicAddress,
    head_address: AtomicAddress,
    tail: AtomicU64,
    _marker: std::marker::PhantomData<(K, V)>,
}

/// First usable offset; keeps live records clear of the address sentinels.
const LOG_BASE: u64 = 64;

impl<K: Key, V: Value> MainLog<K, V> {
    /// Create a main log backed by `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self, Status> {
        let buffer =
            AlignedBuffer::zeroed(crate::constants::CACHE_LINE_BYTES, capacity)
                .ok_or(Status::OutOfMemory)?;
        Ok(Self {
            buffer,
            begin_address: AtomicAddress::new(Address::new(LOG_BASE)),
            head_address: AtomicAddress::new(Address::new(LOG_BASE)),
            tail: AtomicU64::new(LOG_BASE),
            _marker: std::marker::PhantomData,
        })
    }

    /// Reserve `size` bytes at the tail.
    pub fn try_allocate(&self, size: usize) -> Option<Address> {
        let size = size as u64;
        let mut tail = self.tail.load(Ordering::Acquire);
        loop {
            if tail + size > self.buffer.size() as u64 {
                return None;
            }
            match self.tail.compare_exchange_weak(
                tail,
                tail + size,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(Address::new(tail)),
                Err(actual) => tail = actual,
            }
        }
    }

    /// Append a fully initialized record; returns its address.
    pub fn append(&self, key: K, value: V, previous: Address) -> Result<Address, Status> {
        let address = self
            .try_allocate(Record::<K, V>::size())
            .ok_or(Status::OutOfMemory)?;
        // SAFETY: the allocation is exclusive to this call and in bounds.
        unsafe {
            let record = &mut *(self.physical(address) as *mut Record<K, V>);
            record.header = RecordInfo::new(previous);
            record.write_key(key);
            record.write_value(value);
        }
        Ok(address)
    }

    /// The value of the record at `logical`.
    pub fn get_value(&self, logical: Address) -> &V {
        // SAFETY: bounds asserted in `physical`; records are immutable once
        // published.
        unsafe { (*(self.physical(logical) as *const Record<K, V>)).value() }
    }

    /// Advance the in-memory frontier, modeling a flush to disk.
    pub fn advance_head(&self, new_head: Address) {
        self.head_address.advance_to(new_head.strip_read_cache());
    }

    /// Advance the truncation frontier.
    pub fn advance_begin(&self, new_begin: Address) {
        self.begin_address.advance_to(new_begin.strip_read_cache());
    }

    #[inline]
    fn physical(&self, logical: Address) -> *mut u8 {
        let offset = logical.absolute();
        debug_assert!(!logical.in_read_cache());
        debug_assert!(offset >= LOG_BASE && offset < self.tail.load(Ordering::Acquire));
        // SAFETY: offset is within the buffer per the assertions above.
        unsafe { self.buffer.as_mut_ptr().add(offset as usize) }
    }
}

impl<K: Key, V: Value> LogAccess<K, V> for MainLog<K, V> {
    #[inline]
    fn head_address(&self) -> Address {
        self.head_address.load(Ordering::Acquire)
    }

    #[inline]
    fn begin_address(&self) -> Address {
        self.begin_address.load(Ordering::Acquire)
    }

    #[inline]
    fn tail_address(&self) -> Address {
        Address::new(self.tail.load(Ordering::Acquire))
    }

    fn get_info(&self, logical: Address) -> &RecordInfo {
        // SAFETY: see `physical`; the header is an atomic cell.
        unsafe { &(*(self.physical(logical) as *const Record<K, V>)).header }
    }

    fn get_key(&self, logical: Address) -> &K {
        // SAFETY: see `get_value`.
        unsafe { (*(self.physical(logical) as *const Record<K, V>)).key() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read_back() {
        let log = MainLog::<u64, u64>::new(1 << 16).unwrap();
        let addr = log.append(7, 700, Address::INVALID).unwrap();

        assert_eq!(*log.get_key(addr), 7);
        assert_eq!(*log.get_value(addr), 700);
        assert_eq!(log.get_info(addr).previous_address(), Address::INVALID);
    }

    #[test]
    fn test_chain_through_previous() {
        let log = MainLog::<u64, u64>::new(1 << 16).unwrap();
        let first = log.append(1, 10, Address::INVALID).unwrap();
        let second = log.append(1, 11, first).unwrap();

        assert!(first < second);
        assert_eq!(log.get_info(second).previous_address(), first);
    }

    #[test]
    fn test_head_advance_is_monotone() {
        let log = MainLog::<u64, u64>::new(1 << 16).unwrap();
        let a = log.append(1, 10, Address::INVALID).unwrap();
        let b = log.append(2, 20, Address::INVALID).unwrap();

        log.advance_head(b);
        assert_eq!(LogAccess::<u64, u64>::head_address(&log), b);
        // Moving backwards is a no-op.
        log.advance_head(a);
        assert_eq!(LogAccess::<u64, u64>::head_address(&log), b);
    }

    #[test]
    fn test_allocation_exhaustion() {
        let log = MainLog::<u64, u64>::new(128).unwrap();
        // 64 base + two 24-byte records exhaust the buffer.
        assert!(log.append(1, 1, Address::INVALID).is_ok());
        assert!(log.append(2, 2, Address::INVALID).is_ok());
        assert!(log.append(3, 3, Address::INVALID).is_err());
    }
}
