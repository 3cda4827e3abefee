//! Shared chain-traversal state and primitives.
//!
//! Every engine operation walks the same structure: a bucket entry heading a
//! read-cache prefix that transitions, at most once, into a main-log suffix.
//! [`ChainWalker`] resolves each address through whichever log its read-cache
//! bit selects, so every traversal shares one step implementation, and
//! [`RecordSource`] carries what a walk learned so the caller can splice,
//! verify, or retry against exactly what was observed.

use crossbeam_utils::Backoff;

use crate::address::Address;
use crate::cache::log::ReadCacheLog;
use crate::hlog::{LogAccess, MainLog};
use crate::index::HashEntryInfo;
use crate::record::{Key, RecordInfo, Value};

/// Outcome of resolving one chain address.
pub(crate) enum WalkStep<'a, K> {
    /// A resident record in the selected log.
    Record {
        /// The record's header.
        info: &'a RecordInfo,
        /// The record's key.
        key: &'a K,
    },
    /// The address lies below the selected log's in-memory frontier: the
    /// record is being evicted (read cache) or has escaped to disk (main
    /// log).
    BelowFrontier,
    /// A sentinel address; the chain ends here.
    End,
}

/// The single walk step shared by every chain traversal.
///
/// A chain spans two log instances, distinguished by one bit in each
/// address; the walker selects the log by that bit and resolves the record
/// through the common [`LogAccess`] surface. Callers own loop shape and
/// retry policy, the walker owns address resolution.
pub(crate) struct ChainWalker<'a, K: Key, V: Value> {
    read_cache: &'a ReadCacheLog<K, V>,
    hlog: &'a MainLog<K, V>,
}

impl<'a, K: Key, V: Value> ChainWalker<'a, K, V> {
    pub(crate) fn new(read_cache: &'a ReadCacheLog<K, V>, hlog: &'a MainLog<K, V>) -> Self {
        Self { read_cache, hlog }
    }

    /// The log `addr`'s read-cache bit selects.
    pub(crate) fn log_for(&self, addr: Address) -> &'a dyn LogAccess<K, V> {
        if addr.in_read_cache() {
            self.read_cache
        } else {
            self.hlog
        }
    }

    /// Resolve one chain address.
    pub(crate) fn step(&self, addr: Address) -> WalkStep<'a, K> {
        if addr.is_sentinel() {
            return WalkStep::End;
        }
        let log = self.log_for(addr);
        if addr < log.head_address() {
            return WalkStep::BelowFrontier;
        }
        WalkStep::Record {
            info: log.get_info(addr),
            key: log.get_key(addr),
        }
    }
}

/// Traversal context threaded through an operation.
///
/// Built from the hash-entry snapshot at operation start; updated by
/// [`find_in_read_cache`](crate::cache::ReadCacheEngine::find_in_read_cache)
/// and [`skip_read_cache`](crate::cache::ReadCacheEngine::skip_read_cache).
pub struct RecordSource {
    /// The located bucket slot; CAS target for chain-head updates.
    pub hei: HashEntryInfo,
    /// First non-read-cache address reached (top of the main-log suffix).
    latest_logical_address: Address,
    /// Last read-cache record visited: the splice-point candidate.
    lowest_rc_logical: Address,
    /// Header of the splice-point candidate.
    lowest_rc_info: *const RecordInfo,
    /// The matched record, if any.
    logical_address: Address,
}

impl RecordSource {
    /// Create a context rooted at the located bucket slot.
    pub fn new(hei: HashEntryInfo) -> Self {
        let latest = hei.address();
        Self {
            hei,
            latest_logical_address: latest,
            lowest_rc_logical: Address::INVALID,
            lowest_rc_info: std::ptr::null(),
            logical_address: Address::INVALID,
        }
    }

    /// Reset the walk-derived fields, re-rooting at the current snapshot.
    pub(crate) fn restart(&mut self) {
        self.latest_logical_address = self.hei.address();
        self.lowest_rc_logical = Address::INVALID;
        self.lowest_rc_info = std::ptr::null();
        self.logical_address = Address::INVALID;
    }

    /// The first non-read-cache address reached by the last walk.
    #[inline]
    pub fn latest_logical_address(&self) -> Address {
        self.latest_logical_address
    }

    /// The lowest read-cache record visited, or `INVALID` if the chain has
    /// no read-cache prefix.
    #[inline]
    pub fn lowest_read_cache_address(&self) -> Address {
        self.lowest_rc_logical
    }

    /// The matched record, or `INVALID` on a miss.
    #[inline]
    pub fn matched_address(&self) -> Address {
        self.logical_address
    }

    /// Did the last walk visit any read-cache record?
    #[inline]
    pub fn has_read_cache_prefix(&self) -> bool {
        !self.lowest_rc_logical.is_invalid()
    }

    pub(crate) fn set_latest(&mut self, addr: Address) {
        self.latest_logical_address = addr;
    }

    pub(crate) fn set_lowest(&mut self, logical: Address, info: *const RecordInfo) {
        self.lowest_rc_logical = logical;
        self.lowest_rc_info = info;
    }

    pub(crate) fn set_match(&mut self, logical: Address) {
        self.logical_address = logical;
    }

    /// Header of the splice-point candidate.
    ///
    /// # Safety
    /// Only valid while the caller's epoch acquisition pins the read-cache
    /// page the record lives on.
    pub(crate) unsafe fn lowest_info(&self) -> Option<&RecordInfo> {
        self.lowest_rc_info.as_ref()
    }
}

impl std::fmt::Debug for RecordSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordSource")
            .field("bucket_head", &self.hei.address())
            .field("latest_logical_address", &self.latest_logical_address)
            .field("lowest_rc_logical", &self.lowest_rc_logical)
            .field("logical_address", &self.logical_address)
            .finish()
    }
}

/// Block until the evictor has closed the record at `addr`.
///
/// A traversal that reaches an address below the eviction frontier cannot
/// follow its `previous_address`: the evictor may be rewriting the chain
/// around it. Closed means the record was detached (`TEMP_INVALID`) or its
/// page was already reclaimed and re-zeroed.
pub(crate) fn spin_wait_until_record_is_closed<K: Key, V: Value>(
    read_cache: &ReadCacheLog<K, V>,
    addr: Address,
) {
    debug_assert!(addr.in_read_cache());
    let backoff = Backoff::new();
    loop {
        if addr < read_cache.safe_head_address() {
            break;
        }
        let info = read_cache.get_info(addr);
        if info.is_null() || info.previous_address().is_temp_invalid() {
            break;
        }
        backoff.snooze();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::log::Allocation;
    use crate::index::{HashIndex, KeyHash};

    fn harness() -> (HashIndex, ReadCacheLog<u64, u64>) {
        (
            HashIndex::new(64).unwrap(),
            ReadCacheLog::new(4096, 1024).unwrap(),
        )
    }

    #[test]
    fn test_record_source_roots_at_bucket_head() {
        let (index, _log) = harness();
        let hash = KeyHash::new(42u64);
        let mut hei = index.find_or_create_tag(hash).unwrap();
        let head = Address::new(0x80).with_read_cache();
        assert!(hei.try_cas(head));

        let ctx = RecordSource::new(index.find_tag(hash).unwrap());
        assert_eq!(ctx.latest_logical_address(), head);
        assert!(!ctx.has_read_cache_prefix());
        assert_eq!(ctx.matched_address(), Address::INVALID);
    }

    #[test]
    fn test_walker_selects_log_by_address_bit() {
        let log = ReadCacheLog::<u64, u64>::new(4096, 1024).unwrap();
        let hlog = MainLog::<u64, u64>::new(1 << 16).unwrap();

        let main_addr = hlog.append(7, 70, Address::INVALID).unwrap();
        let Allocation::Allocated(rc_addr) = log.try_allocate(24) else {
            panic!("allocation failed");
        };
        // SAFETY: unpublished record.
        unsafe {
            let record = log.record_mut(rc_addr);
            record.header = RecordInfo::new(main_addr);
            record.write_key(7);
            record.write_value(71);
        }

        let walker = ChainWalker::new(&log, &hlog);
        let WalkStep::Record { info, key } = walker.step(rc_addr) else {
            panic!("cached record must resolve");
        };
        assert_eq!(*key, 7);
        assert_eq!(info.previous_address(), main_addr);

        let WalkStep::Record { key, .. } = walker.step(main_addr) else {
            panic!("main-log record must resolve");
        };
        assert_eq!(*key, 7);

        assert!(matches!(walker.step(Address::INVALID), WalkStep::End));
        assert!(matches!(walker.step(Address::TEMP_INVALID), WalkStep::End));
    }

    #[test]
    fn test_walker_reports_evicted_addresses() {
        let log = ReadCacheLog::<u64, u64>::new(4096, 1024).unwrap();
        let hlog = MainLog::<u64, u64>::new(1 << 16).unwrap();
        let Allocation::Allocated(rc_addr) = log.try_allocate(24) else {
            panic!("allocation failed");
        };

        log.advance_head(log.next_page_start(rc_addr));
        let walker = ChainWalker::new(&log, &hlog);
        assert!(matches!(walker.step(rc_addr), WalkStep::BelowFrontier));
    }

    #[test]
    fn test_spin_wait_returns_on_detached_record() {
        let (_, log) = harness();
        let Allocation::Allocated(addr) = log.try_allocate(24) else {
            panic!("allocation failed");
        };
        // SAFETY: unpublished record.
        unsafe {
            let record = log.record_mut(addr);
            record.header = RecordInfo::new(Address::TEMP_INVALID);
            record.write_key(1);
            record.write_value(1);
        }
        // Already closed: returns immediately.
        spin_wait_until_record_is_closed(&log, addr);
    }
}
