//! The circular in-memory log backing the read cache.
//!
//! A fixed power-of-two capacity is divided into power-of-two pages. The
//! tail address grows monotonically; physical placement wraps modulo the
//! capacity. Three frontiers order the lifecycle:
//!
//! ```text
//!   safe_head_address <= head_address <= tail_address
//! ```
//!
//! Records below `head_address` are being evicted (traversals spin until the
//! evictor closes them); memory below `safe_head_address` has quiesced and
//! may be reused by new allocations.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use crate::address::Address;
use crate::hlog::LogAccess;
use crate::record::{Key, Record, RecordInfo, Value};
use crate::status::Status;
use crate::utility::AlignedBuffer;

/// First usable offset; keeps live records clear of the address sentinels.
pub(crate) const LOG_BASE: u64 = 64;

/// Outcome of a tail reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// Space was reserved at this address (read-cache flag set).
    Allocated(Address),
    /// The log is out of pages; the oldest page must be evicted first.
    PageClosed,
    /// Eviction has been published but its memory has not yet quiesced.
    /// Refresh the epoch and retry.
    Busy,
}

/// Circular in-memory log of fixed pages.
///
/// Every address handed out or accepted by this log carries the read-cache
/// flag.
pub struct ReadCacheLog<K: Key, V: Value> {
    buffer: AlignedBuffer,
    capacity: u64,
    page_size: u64,
    tail: AtomicU64,
    head: AtomicU64,
    safe_head: AtomicU64,
    _marker: std::marker::PhantomData<(K, V)>,
}

impl<K: Key, V: Value> ReadCacheLog<K, V> {
    /// Create a log with the given capacity and page size (both powers of
    /// two, capacity a multiple of page size).
    pub fn new(capacity: u64, page_size: u64) -> Result<Self, Status> {
        if !crate::utility::is_power_of_two(capacity)
            || !crate::utility::is_power_of_two(page_size)
            || capacity < page_size
            || (Record::<K, V>::size() as u64) > page_size
        {
            return Err(Status::InvalidArgument);
        }
        let buffer = AlignedBuffer::zeroed(crate::constants::CACHE_LINE_BYTES, capacity as usize)
            .ok_or(Status::OutOfMemory)?;
        Ok(Self {
            buffer,
            capacity,
            page_size,
            tail: AtomicU64::new(LOG_BASE),
            head: AtomicU64::new(LOG_BASE),
            safe_head: AtomicU64::new(LOG_BASE),
            _marker: std::marker::PhantomData,
        })
    }

    /// Page size in bytes.
    #[inline]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// The eviction frontier.
    #[inline]
    pub fn head_address(&self) -> Address {
        Address::new(self.head.load(Ordering::Acquire)).with_read_cache()
    }

    /// The reclamation frontier.
    #[inline]
    pub fn safe_head_address(&self) -> Address {
        Address::new(self.safe_head.load(Ordering::Acquire)).with_read_cache()
    }

    /// One past the last reserved byte.
    #[inline]
    pub fn tail_address(&self) -> Address {
        Address::new(self.tail.load(Ordering::Acquire)).with_read_cache()
    }

    /// Reserve `size` contiguous bytes at the tail.
    ///
    /// An allocation never straddles a page boundary: if the current page
    /// cannot fit the record, the remainder stays zeroed (a null header that
    /// scanners skip) and the record starts on the next page.
    pub fn try_allocate(&self, size: usize) -> Allocation {
        debug_assert!(size as u64 <= self.page_size);
        let size = size as u64;
        let page_mask = self.page_size - 1;

        let mut tail = self.tail.load(Ordering::Acquire);
        loop {
            let offset_in_page = tail & page_mask;
            let start = if offset_in_page + size > self.page_size {
                (tail & !page_mask) + self.page_size
            } else {
                tail
            };
            let new_tail = start + size;

            if new_tail - self.head.load(Ordering::Acquire) > self.capacity {
                trace!(tail = new_tail, "read-cache page closed, eviction required");
                return Allocation::PageClosed;
            }
            if new_tail - self.safe_head.load(Ordering::Acquire) > self.capacity {
                return Allocation::Busy;
            }

            match self.tail.compare_exchange_weak(
                tail,
                new_tail,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Allocation::Allocated(Address::new(start).with_read_cache()),
                Err(actual) => tail = actual,
            }
        }
    }

    /// Advance the eviction frontier. Monotone.
    pub fn advance_head(&self, new_head: Address) {
        let new_head = new_head.absolute();
        let mut current = self.head.load(Ordering::Acquire);
        while new_head > current {
            match self.head.compare_exchange_weak(
                current,
                new_head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Advance the reclamation frontier over `[from, to)`, zeroing the
    /// reclaimed bytes so reused pages read as null headers.
    ///
    /// Called from the epoch drain action; by then no thread can hold a
    /// reference into the range.
    pub fn advance_safe_head(&self, from: Address, to: Address) {
        let (from, to) = (from.absolute(), to.absolute());
        debug_assert!(from <= to);
        let mask = self.capacity - 1;

        let mut offset = from;
        while offset < to {
            let physical = offset & mask;
            let run = (to - offset).min(self.capacity - physical);
            // SAFETY: the range is below the eviction frontier and has
            // quiesced; no live references into it remain.
            unsafe {
                std::ptr::write_bytes(
                    self.buffer.as_mut_ptr().add(physical as usize),
                    0,
                    run as usize,
                );
            }
            offset += run;
        }

        let mut current = self.safe_head.load(Ordering::Acquire);
        while to > current {
            match self.safe_head.compare_exchange_weak(
                current,
                to,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Start of the page after the one containing `addr`.
    #[inline]
    pub fn next_page_start(&self, addr: Address) -> Address {
        let absolute = (addr.absolute() & !(self.page_size - 1)) + self.page_size;
        Address::new(absolute).with_read_cache()
    }

    /// The record header at `logical`.
    #[inline]
    pub fn get_info(&self, logical: Address) -> &RecordInfo {
        // SAFETY: see `physical`; the header is an atomic cell.
        unsafe { &(*(self.physical(logical) as *const Record<K, V>)).header }
    }

    /// The key of the record at `logical`.
    #[inline]
    pub fn get_key(&self, logical: Address) -> &K {
        // SAFETY: the record was fully initialized before it was published.
        unsafe { (*(self.physical(logical) as *const Record<K, V>)).key() }
    }

    /// The value of the record at `logical`.
    #[inline]
    pub fn get_value(&self, logical: Address) -> &V {
        // SAFETY: see `get_key`.
        unsafe { (*(self.physical(logical) as *const Record<K, V>)).value() }
    }

    /// In-log size of a record.
    #[inline]
    pub fn record_size(&self) -> usize {
        Record::<K, V>::size()
    }

    /// Exclusive access to a freshly allocated, not yet published record.
    ///
    /// # Safety
    /// `logical` must come from a [`ReadCacheLog::try_allocate`] call whose
    /// record has not been published to any chain.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn record_mut(&self, logical: Address) -> &mut Record<K, V> {
        &mut *(self.physical(logical) as *mut Record<K, V>)
    }

    #[inline]
    fn physical(&self, logical: Address) -> *mut u8 {
        debug_assert!(logical.in_read_cache());
        let offset = logical.absolute();
        debug_assert!(offset >= self.safe_head.load(Ordering::Acquire));
        debug_assert!(offset < self.tail.load(Ordering::Acquire));
        // SAFETY: physical placement wraps modulo the capacity.
        unsafe {
            self.buffer
                .as_mut_ptr()
                .add((offset & (self.capacity - 1)) as usize)
        }
    }
}

impl<K: Key, V: Value> LogAccess<K, V> for ReadCacheLog<K, V> {
    #[inline]
    fn head_address(&self) -> Address {
        ReadCacheLog::head_address(self)
    }

    #[inline]
    fn begin_address(&self) -> Address {
        // Memory below the reclamation frontier is gone for good.
        self.safe_head_address()
    }

    #[inline]
    fn tail_address(&self) -> Address {
        ReadCacheLog::tail_address(self)
    }

    #[inline]
    fn get_info(&self, logical: Address) -> &RecordInfo {
        ReadCacheLog::get_info(self, logical)
    }

    #[inline]
    fn get_key(&self, logical: Address) -> &K {
        ReadCacheLog::get_key(self, logical)
    }
}

// Safety: record headers are atomic; record bodies are immutable once
// published, and unpublished bodies are exclusive to the allocating thread.
unsafe impl<K: Key, V: Value> Send for ReadCacheLog<K, V> {}
unsafe impl<K: Key, V: Value> Sync for ReadCacheLog<K, V> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> ReadCacheLog<u64, u64> {
        ReadCacheLog::new(4096, 1024).unwrap()
    }

    #[test]
    fn test_rejects_bad_geometry() {
        assert!(ReadCacheLog::<u64, u64>::new(1000, 100).is_err());
        assert!(ReadCacheLog::<u64, u64>::new(512, 1024).is_err());
        assert!(ReadCacheLog::<u64, u64>::new(4096, 1024).is_ok());
    }

    #[test]
    fn test_allocate_is_flagged_and_sequential() {
        let log = log();
        let Allocation::Allocated(first) = log.try_allocate(24) else {
            panic!("allocation failed");
        };
        assert!(first.in_read_cache());
        assert_eq!(first.absolute(), LOG_BASE);

        let Allocation::Allocated(second) = log.try_allocate(24) else {
            panic!("allocation failed");
        };
        assert_eq!(second.absolute(), LOG_BASE + 24);
    }

    #[test]
    fn test_allocation_never_straddles_pages() {
        let log = log();
        // Fill to 8 bytes short of the first page boundary.
        let mut last = Address::INVALID;
        loop {
            match log.try_allocate(24) {
                Allocation::Allocated(addr) => {
                    let page_before = last.absolute() / 1024;
                    let page_now = addr.absolute() / 1024;
                    if page_now > page_before && !last.is_invalid() {
                        // The straddling record moved wholly onto the new page.
                        assert_eq!(addr.absolute() % 1024, 0);
                        break;
                    }
                    last = addr;
                }
                other => panic!("unexpected allocation result {other:?}"),
            }
        }
    }

    #[test]
    fn test_page_closed_when_full() {
        let log = log();
        loop {
            match log.try_allocate(24) {
                Allocation::Allocated(_) => continue,
                Allocation::PageClosed => break,
                Allocation::Busy => panic!("no eviction was published"),
            }
        }
    }

    #[test]
    fn test_busy_until_safe_head_catches_up() {
        let log = log();
        while matches!(log.try_allocate(24), Allocation::Allocated(_)) {}

        // Evictor publishes the frontier, but memory has not quiesced.
        let head = log.head_address();
        let one_page_up = log.next_page_start(head);
        log.advance_head(one_page_up);
        assert_eq!(log.try_allocate(24), Allocation::Busy);

        // After the drain action runs, allocation proceeds.
        log.advance_safe_head(head, one_page_up);
        assert!(matches!(log.try_allocate(24), Allocation::Allocated(_)));
    }

    #[test]
    fn test_reclaimed_pages_read_as_null() {
        let log = log();
        let Allocation::Allocated(addr) = log.try_allocate(24) else {
            panic!("allocation failed");
        };
        // SAFETY: freshly allocated, unpublished.
        unsafe {
            let record = log.record_mut(addr);
            record.header = RecordInfo::new(Address::INVALID.with_read_cache());
            record.write_key(1);
            record.write_value(2);
        }
        assert!(!log.get_info(addr).is_null());

        // Exhaust the log so the tail laps the first page, then reclaim it.
        while matches!(log.try_allocate(24), Allocation::Allocated(_)) {}
        let next = log.next_page_start(addr);
        log.advance_head(next);
        log.advance_safe_head(log.safe_head_address(), next);

        // The tail wraps around; keep allocating until it lands inside the
        // reclaimed physical page and observe the zeroed header there.
        loop {
            let Allocation::Allocated(reused) = log.try_allocate(24) else {
                panic!("reclaimed page should be allocatable");
            };
            let physical = reused.absolute() & (4096 - 1);
            if (64..1024).contains(&physical) {
                assert!(log.get_info(reused).is_null());
                break;
            }
        }
    }
}
