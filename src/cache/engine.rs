//! The read-cache engine: chain maintenance over the shared hash chain.
//!
//! The read cache and the main log share one hash chain per bucket:
//!
//! ```text
//! bucket -> rc_N -> ... -> rc_1 -> m_K -> ... -> m_1 -> 0
//! ```
//!
//! Read-cache records are linked in front of main-log records. New cached
//! records are CAS'd onto the bucket head; new main-log records are spliced
//! at the boundary below `rc_1`, so a main-log replacement never discards
//! the cached prefix above it. All chain edges are published by CAS on a
//! bucket slot or a record's `previous_address`; traversals that reach an
//! address below the eviction frontier wait for the evictor to close the
//! record, then restart from the bucket head.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::address::Address;
use crate::cache::chain::{spin_wait_until_record_is_closed, ChainWalker, RecordSource, WalkStep};
use crate::cache::config::ReadCacheConfig;
use crate::cache::log::{Allocation, ReadCacheLog};
use crate::cache::stats::ReadCacheStats;
use crate::epoch::{get_thread_id, LightEpoch};
use crate::hlog::{LogAccess, MainLog};
use crate::index::{HashBucket, HashBucketEntry, HashEntryInfo, HashIndex, KeyHash};
use crate::record::{Key, RecordInfo, Value};
use crate::status::{OperationStatus, Status};

/// Lock-free read cache in front of a main log.
pub struct ReadCacheEngine<K: Key, V: Value> {
    config: ReadCacheConfig,
    read_cache: Arc<ReadCacheLog<K, V>>,
    hlog: Arc<MainLog<K, V>>,
    index: Arc<HashIndex>,
    epoch: Arc<LightEpoch>,
    stats: ReadCacheStats,
    eviction_in_progress: AtomicBool,
}

impl<K: Key, V: Value> ReadCacheEngine<K, V> {
    /// Create an engine over the given collaborators.
    pub fn new(
        config: ReadCacheConfig,
        hlog: Arc<MainLog<K, V>>,
        index: Arc<HashIndex>,
        epoch: Arc<LightEpoch>,
    ) -> Result<Self, Status> {
        config.validate()?;
        let read_cache = Arc::new(ReadCacheLog::new(config.memory_size, config.page_size)?);
        Ok(Self {
            config,
            read_cache,
            hlog,
            index,
            epoch,
            stats: ReadCacheStats::new(),
            eviction_in_progress: AtomicBool::new(false),
        })
    }

    /// The engine's configuration.
    pub fn config(&self) -> &ReadCacheConfig {
        &self.config
    }

    /// The circular log backing the cache.
    pub fn read_cache(&self) -> &ReadCacheLog<K, V> {
        &self.read_cache
    }

    /// The main log the cache fronts.
    pub fn main_log(&self) -> &MainLog<K, V> {
        &self.hlog
    }

    /// Operation counters.
    pub fn stats(&self) -> &ReadCacheStats {
        &self.stats
    }

    /// The epoch instance guarding traversals.
    pub fn epoch(&self) -> &LightEpoch {
        &self.epoch
    }

    /// Locate the chain for `key`, if its bucket tag exists.
    pub fn source_for(&self, key: &K) -> Option<RecordSource> {
        let hash = KeyHash::new(key.get_hash());
        self.index.find_tag(hash).map(RecordSource::new)
    }

    /// Locate the chain for `key`, creating the bucket tag if absent.
    pub fn source_for_update(&self, key: &K) -> Result<RecordSource, Status> {
        let hash = KeyHash::new(key.get_hash());
        self.index.find_or_create_tag(hash).map(RecordSource::new)
    }

    fn walker(&self) -> ChainWalker<'_, K, V> {
        ChainWalker::new(&self.read_cache, &self.hlog)
    }

    // ======== Traversal ========

    /// Walk the read-cache prefix looking for `key`.
    ///
    /// Returns `true` iff a valid cached record for `key` with address
    /// >= `min_address` was reached. On return `ctx` carries the first
    /// main-log address (`latest_logical_address`), the splice-point
    /// candidate (`lowest_read_cache_address`), and the match, if any.
    ///
    /// With `always_find_latest` set the walk continues past a hit so that
    /// callers performing updates learn the full splice position; otherwise
    /// it returns at the hit and `latest_logical_address` is not meaningful.
    ///
    /// A `min_address` that is not a read-cache address, or that has been
    /// evicted, is clamped to the cache's head address.
    pub fn find_in_read_cache(
        &self,
        key: &K,
        ctx: &mut RecordSource,
        min_address: Address,
        always_find_latest: bool,
    ) -> bool {
        let walker = self.walker();
        'restart: loop {
            ctx.restart();
            let mut current = ctx.hei.address();
            if !current.in_read_cache() {
                return false;
            }
            let min_address = self.clamp_min_address(min_address);

            loop {
                let (info, record_key) = match walker.step(current) {
                    WalkStep::Record { info, key } => (info, key),
                    WalkStep::BelowFrontier => {
                        // The evictor owns this record; wait for it to
                        // publish the unlinked state, then re-read the chain.
                        spin_wait_until_record_is_closed(&*self.read_cache, current);
                        ctx.hei.reload();
                        continue 'restart;
                    }
                    WalkStep::End => {
                        debug_assert!(false, "read-cache address cannot be a sentinel");
                        return false;
                    }
                };
                ctx.set_lowest(current, info as *const RecordInfo);

                if ctx.matched_address().is_invalid()
                    && !info.is_invalid()
                    && current >= min_address
                    && record_key == key
                {
                    ctx.set_match(current);
                    if !always_find_latest {
                        return true;
                    }
                }

                let prev = info.previous_address();
                if prev.is_temp_invalid() {
                    // Detached under us mid-walk.
                    ctx.hei.reload();
                    continue 'restart;
                }
                if !prev.in_read_cache() {
                    ctx.set_latest(prev);
                    return !ctx.matched_address().is_invalid();
                }
                debug_assert!(prev < current, "read-cache prefix must be monotone");
                current = prev;
            }
        }
    }

    /// Walk past the read-cache prefix without key comparison.
    ///
    /// Used by updaters: advances `ctx.latest_logical_address` to the first
    /// main-log address and records the splice-point candidate. Returns
    /// `true` if the walk had to wait out an eviction, in which case any
    /// state the caller derived from an earlier walk must be re-verified.
    pub fn skip_read_cache(&self, ctx: &mut RecordSource) -> bool {
        let walker = self.walker();
        let mut did_refresh = false;
        'restart: loop {
            ctx.restart();
            let mut current = ctx.hei.address();

            while current.in_read_cache() {
                let info = match walker.step(current) {
                    WalkStep::Record { info, .. } => info,
                    WalkStep::BelowFrontier => {
                        spin_wait_until_record_is_closed(&*self.read_cache, current);
                        ctx.hei.reload();
                        did_refresh = true;
                        continue 'restart;
                    }
                    WalkStep::End => {
                        debug_assert!(false, "read-cache address cannot be a sentinel");
                        return did_refresh;
                    }
                };
                debug_assert!(!info.is_sealed(), "read-cache records are never sealed");
                ctx.set_lowest(current, info as *const RecordInfo);

                let prev = info.previous_address();
                if prev.is_temp_invalid() {
                    ctx.hei.reload();
                    did_refresh = true;
                    continue 'restart;
                }
                current = prev;
            }
            ctx.set_latest(current);
            return did_refresh;
        }
    }

    fn clamp_min_address(&self, min_address: Address) -> Address {
        let head = self.read_cache.head_address();
        if !min_address.in_read_cache() || min_address < head {
            head
        } else {
            min_address
        }
    }

    // ======== Splice and post-insert verification ========

    /// Swap the main-log head below the splice point: one CAS on the lowest
    /// read-cache record's `previous_address`, from the observed
    /// `latest_logical_address` to `new_main_address`.
    ///
    /// Returns whether the CAS won; the caller handles retry. Splicing here
    /// rather than at the bucket keeps the cached prefix above the new
    /// record.
    pub fn splice_at_boundary(&self, ctx: &RecordSource, new_main_address: Address) -> bool {
        debug_assert!(!new_main_address.in_read_cache());
        debug_assert!(ctx.lowest_read_cache_address() >= self.read_cache.head_address());
        // SAFETY: the caller's epoch acquisition pins the splice-point page.
        let Some(info) = (unsafe { ctx.lowest_info() }) else {
            return false;
        };
        info.try_update_address(ctx.latest_logical_address(), new_main_address)
    }

    /// Close the race window between reading the chain and publishing a new
    /// read-cache record: a main-log record for `key` may have been spliced
    /// below the prefix in the meantime.
    ///
    /// `splice_point` is the lowest read-cache record; `until_logical_address`
    /// is the main-log address that sat at the boundary when the operation
    /// started. If the boundary moved, the spliced region is searched for
    /// `key`:
    ///
    /// - key found in memory: the caller's insertion is stale
    ///   ([`OperationStatus::RecordExists`]);
    /// - intervening records escaped below the main log's head address: a
    ///   match on disk cannot be ruled out
    ///   ([`OperationStatus::RecordOnDisk`]);
    /// - otherwise the insertion stands.
    pub fn ensure_no_new_main_log_record_was_spliced(
        &self,
        key: &K,
        splice_point: Address,
        until_logical_address: Address,
    ) -> OperationStatus {
        debug_assert!(splice_point.in_read_cache());
        let info = self.read_cache.get_info(splice_point);
        let current_prev = info.previous_address();
        if current_prev.in_read_cache() || current_prev <= until_logical_address {
            return OperationStatus::Success;
        }

        let walker = self.walker();
        let mut addr = current_prev;
        while addr > until_logical_address {
            debug_assert!(!addr.in_read_cache(), "a chain never re-enters the read cache");
            match walker.step(addr) {
                WalkStep::Record { info, key: record_key } => {
                    if !info.is_invalid() && record_key == key {
                        return OperationStatus::RecordExists;
                    }
                    addr = info.previous_address();
                }
                WalkStep::BelowFrontier => {
                    // One or more intervening records escaped to disk; a
                    // key match there cannot be ruled out from memory.
                    return OperationStatus::RecordOnDisk;
                }
                WalkStep::End => break,
            }
        }
        OperationStatus::Success
    }

    /// After a main-log record for `key` has been spliced in at
    /// `new_main_address`, find any read-cache record for the same key that
    /// a concurrent reader inserted above the position observed at operation
    /// start, transfer its shared locks onto the new record, and invalidate
    /// it.
    ///
    /// Exclusive locks are not transferred: the new record's writer has
    /// already won its CAS, so a competing exclusive holder on the stale
    /// cached record loses and retries. The walk stops at the originally
    /// observed position; the caller holds the epoch, so no chain change
    /// below that point is possible.
    pub fn check_tail_after_splice(
        &self,
        key: &K,
        ctx: &mut RecordSource,
        new_main_address: Address,
    ) {
        let walker = self.walker();
        let until_entry = ctx.hei.address();
        'restart: loop {
            let mut current = ctx.hei.reload().address();
            while current.in_read_cache() {
                if until_entry.in_read_cache() && current <= until_entry {
                    break;
                }
                let (info, record_key) = match walker.step(current) {
                    WalkStep::Record { info, key } => (info, key),
                    WalkStep::BelowFrontier => {
                        spin_wait_until_record_is_closed(&*self.read_cache, current);
                        continue 'restart;
                    }
                    WalkStep::End => return,
                };
                if !info.is_invalid() && record_key == key {
                    let new_info = self.hlog.get_info(new_main_address);
                    new_info.copy_read_locks_from_and_mark_source(info, false);
                    self.stats.record_lock_transfer();
                    return;
                }
                let prev = info.previous_address();
                if prev.is_temp_invalid() {
                    continue 'restart;
                }
                current = prev;
            }
            return;
        }
    }

    /// Detach a record whose publication CAS failed.
    ///
    /// Marks it invalid and points it at `TEMP_INVALID` so the evictor skips
    /// chain maintenance for it. `TEMP_INVALID` rather than `INVALID` keeps
    /// it distinct from the null headers that pad page remainders.
    pub fn abandon_record(&self, addr: Address) {
        debug_assert!(addr.in_read_cache());
        let info = self.read_cache.get_info(addr);
        info.set_invalid();
        info.set_previous_address(Address::TEMP_INVALID);
        self.stats.record_insert_abandoned();
    }

    // ======== Read and insert paths ========

    /// Look up `key`: in the cached prefix first, then the in-memory part
    /// of the main-log suffix.
    pub fn read(&self, key: &K) -> Option<V> {
        self.stats.record_read();
        let tid = get_thread_id().ok()?;
        self.epoch.protect_and_drain(tid);
        let result = self.read_inner(key);
        self.epoch.unprotect(tid);
        result
    }

    fn read_inner(&self, key: &K) -> Option<V> {
        let walker = self.walker();
        let mut ctx = self.source_for(key)?;
        if self.find_in_read_cache(key, &mut ctx, Address::INVALID, true) {
            let addr = ctx.matched_address();
            // No lock needed: cached values are immutable once published,
            // the epoch pins the page, and a record that is replaced after
            // the key comparison only makes the value stale, which reads
            // are allowed to be.
            if let WalkStep::Record { info, .. } = walker.step(addr) {
                if !info.is_invalid() {
                    let value = self.read_cache.get_value(addr).clone();
                    self.stats.record_hit();
                    return Some(value);
                }
            }
        }

        let mut addr = ctx.latest_logical_address();
        loop {
            debug_assert!(!addr.in_read_cache(), "a chain never re-enters the read cache");
            match walker.step(addr) {
                WalkStep::Record { info, key: record_key } => {
                    if !info.is_invalid() && record_key == key {
                        if info.is_tombstone() {
                            return None;
                        }
                        return Some(self.hlog.get_value(addr).clone());
                    }
                    addr = info.previous_address();
                }
                WalkStep::BelowFrontier | WalkStep::End => return None,
            }
        }
    }

    /// Insert a record for `key` at the read-cache tail: the completion of
    /// a pending read whose main-log copy is no longer in memory.
    ///
    /// `ctx` is the traversal context from the lookup that went pending.
    /// The new record is linked in front of the observed bucket head; after
    /// the CAS wins, the splice region is re-verified per
    /// [`ReadCacheEngine::ensure_no_new_main_log_record_was_spliced`].
    pub fn try_cache_record(
        &self,
        key: &K,
        value: &V,
        ctx: &mut RecordSource,
    ) -> OperationStatus {
        self.stats.record_insert();

        let record_size = self.read_cache.record_size();
        let mut evictions = 0;
        let addr = loop {
            match self.read_cache.try_allocate(record_size) {
                Allocation::Allocated(addr) => break addr,
                Allocation::PageClosed => {
                    evictions += 1;
                    if evictions > self.config.num_pages() || !self.evict_oldest_pages() {
                        return OperationStatus::AllocateFailed;
                    }
                }
                Allocation::Busy => {
                    if let Ok(tid) = get_thread_id() {
                        self.epoch.refresh(tid);
                    }
                    return OperationStatus::RetryLater;
                }
            }
        };

        let observed_head = ctx.hei.address();
        // SAFETY: the allocation is exclusive to this call and unpublished.
        unsafe {
            let record = self.read_cache.record_mut(addr);
            record.header = RecordInfo::new(observed_head);
            record.write_key(key.clone());
            record.write_value(value.clone());
        }

        if addr < self.read_cache.head_address() {
            // Eviction lapped the allocation before publication.
            self.abandon_record(addr);
            return OperationStatus::RetryLater;
        }

        if !ctx.hei.try_cas(addr) {
            self.abandon_record(addr);
            return OperationStatus::RetryLater;
        }

        // The new record is the lowest read-cache record if the chain had
        // no cached prefix before.
        let splice_point = if ctx.has_read_cache_prefix() {
            ctx.lowest_read_cache_address()
        } else {
            addr
        };
        let status = self.ensure_no_new_main_log_record_was_spliced(
            key,
            splice_point,
            ctx.latest_logical_address(),
        );
        if !status.is_success() {
            self.read_cache.get_info(addr).set_invalid();
            self.stats.record_insert_abandoned();
            return status;
        }

        self.stats.record_insert_success();
        OperationStatus::Success
    }

    /// Updater flow: append a record for `key` at the main-log tail and
    /// link it below the cached prefix (or at the bucket head if there is
    /// none), then close the concurrent-reader race.
    pub fn insert_at_tail(&self, key: &K, value: &V) -> OperationStatus {
        let Ok(tid) = get_thread_id() else {
            return OperationStatus::RetryLater;
        };
        self.epoch.protect_and_drain(tid);
        let status = self.insert_at_tail_inner(key, value);
        self.epoch.unprotect(tid);
        status
    }

    fn insert_at_tail_inner(&self, key: &K, value: &V) -> OperationStatus {
        let Ok(mut ctx) = self.source_for_update(key) else {
            return OperationStatus::AllocateFailed;
        };
        // Full walk: learn the splice position and locate any cached copy
        // of the key, which this insert replaces.
        self.find_in_read_cache(key, &mut ctx, Address::INVALID, true);
        let latest = ctx.latest_logical_address();

        let Ok(new_addr) = self.hlog.append(key.clone(), value.clone(), latest) else {
            return OperationStatus::AllocateFailed;
        };
        let new_info = self.hlog.get_info(new_addr);
        // Tentative exclusive lock, confirmed by winning the publication CAS.
        let locked = new_info.try_lock_exclusive();
        debug_assert!(locked);

        let published = if ctx.has_read_cache_prefix() {
            ctx.lowest_read_cache_address() >= self.read_cache.head_address()
                && self.splice_at_boundary(&ctx, new_addr)
        } else {
            ctx.hei.try_cas(new_addr)
        };
        if !published {
            new_info.unlock_exclusive();
            new_info.set_invalid();
            return OperationStatus::RetryLater;
        }

        // The cached copy found during the walk is now stale: migrate its
        // shared locks here and close it.
        let matched = ctx.matched_address();
        if !matched.is_invalid() {
            let src = self.read_cache.get_info(matched);
            new_info.copy_read_locks_from_and_mark_source(src, false);
            self.stats.record_lock_transfer();
        }

        if ctx.has_read_cache_prefix() {
            self.check_tail_after_splice(key, &mut ctx, new_addr);
        }
        new_info.unlock_exclusive();
        OperationStatus::Success
    }

    // ======== Eviction ========

    /// Unlink every read-cache record in `[rc_from, rc_to)` from its hash
    /// chain and close it.
    ///
    /// Chains are selected through the bucket of each record's key hash, so
    /// colliding keys sharing the chain are all walked; no key equality is
    /// consulted. Callers must have advanced the cache's head address to at
    /// least `rc_to` first.
    pub fn evict(&self, rc_from: Address, rc_to: Address) {
        debug_assert!(rc_from.in_read_cache() && rc_to.in_read_cache());
        debug_assert!(self.read_cache.head_address() >= rc_to);

        let record_size = self.read_cache.record_size() as u64;
        let mut evicted = 0u64;
        let mut already_invalid = 0u64;

        let mut la = rc_from;
        while la < rc_to {
            let page_end = self.read_cache.next_page_start(la);
            if la + record_size > page_end {
                la = page_end;
                continue;
            }
            let info = self.read_cache.get_info(la);
            if info.previous_address().is_sentinel() {
                // Page padding, an abandoned record, or one already closed
                // by an earlier chain walk.
                la = la + record_size;
                continue;
            }

            evicted += 1;
            if info.is_invalid() {
                already_invalid += 1;
            }

            let hash = KeyHash::new(self.read_cache.get_key(la).get_hash());
            if let Some(mut hei) = self.index.find_tag(hash) {
                self.unlink_in_range(&mut hei, rc_from, rc_to);
            }
            la = la + record_size;
        }

        self.stats.record_eviction(evicted, already_invalid);
        debug!(
            from = rc_from.absolute(),
            to = rc_to.absolute(),
            evicted,
            already_invalid,
            "evicted read-cache range"
        );
    }

    /// Walk one chain from the bucket head, unlinking every read-cache
    /// record that falls inside the eviction range.
    fn unlink_in_range(&self, hei: &mut HashEntryInfo, rc_from: Address, rc_to: Address) {
        // A record we closed but have not yet unlinked, with its suffix;
        // carried across restarts so the suffix is never lost.
        let mut pending: Option<(Address, Address)> = None;

        'restart: loop {
            let mut next_info: Option<&RecordInfo> = None;
            let mut current = hei.address();

            loop {
                if !current.in_read_cache() {
                    return;
                }
                let info = self.read_cache.get_info(current);

                if current >= rc_to {
                    // Above the range: the closest surviving predecessor.
                    let prev = info.previous_address();
                    if prev.is_temp_invalid() {
                        hei.reload();
                        continue 'restart;
                    }
                    next_info = Some(info);
                    current = prev;
                    continue;
                }
                debug_assert!(current >= rc_from);

                // Close the record first: once its previous address is
                // TEMP_INVALID, no updater can splice below it, and the
                // last published suffix is ours to re-link.
                let suffix = match pending {
                    Some((rec, suffix)) if rec == current => suffix,
                    _ => match self.close_record(info) {
                        Some(suffix) => suffix,
                        None => {
                            // Already closed and unlinked through another
                            // record's walk; the chain snapshot is stale.
                            hei.reload();
                            continue 'restart;
                        }
                    },
                };
                pending = Some((current, suffix));

                let unlinked = match next_info {
                    Some(pred) => pred.try_update_address(current, suffix),
                    None => hei.try_cas(suffix),
                };
                if !unlinked {
                    // A new record was inserted above; its chain still runs
                    // through `current`, which the restart walk re-links
                    // using the pending suffix.
                    hei.reload();
                    continue 'restart;
                }
                pending = None;
                current = suffix;
            }
        }
    }

    /// CAS a record's previous address to `TEMP_INVALID`, chasing any
    /// concurrent splices, and return the last published suffix. Returns
    /// `None` if the record was already closed.
    fn close_record(&self, info: &RecordInfo) -> Option<Address> {
        let mut observed = info.previous_address();
        loop {
            if observed.is_temp_invalid() {
                return None;
            }
            if info.try_update_address(observed, Address::TEMP_INVALID) {
                return Some(observed);
            }
            observed = info.previous_address();
        }
    }

    /// Retire the oldest page(s): advance the eviction frontier, unlink the
    /// range, and defer the reclamation frontier behind the epoch.
    ///
    /// A single evictor runs at a time; returns `false` if another thread
    /// is evicting or the frontier cannot advance without entering the
    /// protected second-chance tail region.
    pub fn evict_oldest_pages(&self) -> bool {
        if self
            .eviction_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let head = self.read_cache.head_address();
        let tail = self.read_cache.tail_address();
        let page_mask = self.config.page_size - 1;
        let max_head = tail
            .absolute()
            .saturating_sub(self.config.second_chance_size())
            & !page_mask;
        // The frontier advances in whole pages; the first advance rounds
        // the base offset up to the end of page zero.
        let new_head_abs =
            ((head.absolute() + self.config.page_size) & !page_mask).min(max_head);

        if new_head_abs <= head.absolute() {
            self.eviction_in_progress.store(false, Ordering::Release);
            return false;
        }
        let new_head = Address::new(new_head_abs).with_read_cache();

        self.read_cache.advance_head(new_head);
        self.evict(head, new_head);

        let read_cache = Arc::clone(&self.read_cache);
        self.epoch
            .bump_current_epoch_with_action(move || {
                read_cache.advance_safe_head(head, new_head);
            });

        self.eviction_in_progress.store(false, Ordering::Release);
        true
    }

    // ======== Checkpoint support ========

    /// Produce a copy of a bucket in which every slot pointing into the
    /// read cache is rewritten to the first main-log address reachable
    /// through the cached prefix. The in-memory table is not modified.
    pub fn flatten_bucket_for_checkpoint(&self, bucket_index: usize) -> HashBucket {
        let live = self.index.bucket(bucket_index);
        let copy = live.clone();

        for (live_slot, copy_slot) in live.entries.iter().zip(copy.entries.iter()) {
            loop {
                let entry = live_slot.load(Ordering::Acquire);
                if entry.is_unused() || !entry.in_read_cache() {
                    copy_slot.store(entry, Ordering::Relaxed);
                    break;
                }
                if let Some(flat) = self.try_skip_prefix(entry.address()) {
                    copy_slot.store(
                        HashBucketEntry::new(flat, entry.tag(), false),
                        Ordering::Relaxed,
                    );
                    break;
                }
                // The prefix was evicted under us; re-read the live slot.
            }
        }
        copy
    }

    fn try_skip_prefix(&self, mut addr: Address) -> Option<Address> {
        let walker = self.walker();
        while addr.in_read_cache() {
            let info = match walker.step(addr) {
                WalkStep::Record { info, .. } => info,
                WalkStep::BelowFrontier => {
                    spin_wait_until_record_is_closed(&*self.read_cache, addr);
                    return None;
                }
                WalkStep::End => return None,
            };
            let prev = info.previous_address();
            if prev.is_temp_invalid() {
                return None;
            }
            addr = prev;
        }
        Some(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ReadCacheEngine<u64, u64> {
        let config = ReadCacheConfig::new(1 << 16)
            .with_page_size(1 << 12)
            .with_second_chance_fraction(0.25);
        let hlog = Arc::new(MainLog::new(1 << 16).unwrap());
        let index = Arc::new(HashIndex::new(256).unwrap());
        let epoch = Arc::new(LightEpoch::new());
        ReadCacheEngine::new(config, hlog, index, epoch).unwrap()
    }

    /// Append to the main log and publish through the bucket, bypassing the
    /// cache, to set up chains.
    fn seed_main(engine: &ReadCacheEngine<u64, u64>, key: u64, value: u64) -> Address {
        let mut ctx = engine.source_for_update(&key).unwrap();
        engine.skip_read_cache(&mut ctx);
        let addr = engine
            .hlog
            .append(key, value, ctx.latest_logical_address())
            .unwrap();
        assert!(ctx.hei.try_cas(addr));
        addr
    }

    /// Insert a read-cache record for `key` and return its address.
    fn cache(engine: &ReadCacheEngine<u64, u64>, key: u64, value: u64) -> Address {
        let mut ctx = engine.source_for_update(&key).unwrap();
        engine.find_in_read_cache(&key, &mut ctx, Address::INVALID, true);
        assert_eq!(
            engine.try_cache_record(&key, &value, &mut ctx),
            OperationStatus::Success
        );
        ctx.hei.reload().address()
    }

    #[test]
    fn test_find_on_empty_bucket_head() {
        let engine = engine();
        let main = seed_main(&engine, 7, 70);

        let mut ctx = engine.source_for(&7).unwrap();
        assert!(!engine.find_in_read_cache(&7, &mut ctx, Address::INVALID, true));
        assert_eq!(ctx.latest_logical_address(), main);
        assert!(!ctx.has_read_cache_prefix());
    }

    #[test]
    fn test_cache_then_find() {
        let engine = engine();
        let main = seed_main(&engine, 7, 70);
        let rc = cache(&engine, 7, 70);
        assert!(rc.in_read_cache());

        let mut ctx = engine.source_for(&7).unwrap();
        assert!(engine.find_in_read_cache(&7, &mut ctx, Address::INVALID, true));
        assert_eq!(ctx.matched_address(), rc);
        assert_eq!(ctx.latest_logical_address(), main);
        assert_eq!(ctx.lowest_read_cache_address(), rc);
    }

    #[test]
    fn test_read_prefers_cache_and_falls_back() {
        let engine = engine();
        seed_main(&engine, 1, 10);
        assert_eq!(engine.read(&1), Some(10));

        cache(&engine, 1, 10);
        assert_eq!(engine.read(&1), Some(10));
        assert_eq!(engine.stats().read_hits(), 1);
    }

    #[test]
    fn test_abandon_detaches() {
        let engine = engine();
        let Allocation::Allocated(addr) = engine.read_cache().try_allocate(24) else {
            panic!("allocation failed");
        };
        // SAFETY: unpublished.
        unsafe {
            let record = engine.read_cache().record_mut(addr);
            record.header = RecordInfo::new(Address::INVALID);
            record.write_key(9);
            record.write_value(9);
        }
        engine.abandon_record(addr);

        let info = engine.read_cache().get_info(addr);
        assert!(info.is_invalid());
        assert!(info.previous_address().is_temp_invalid());
    }

    #[test]
    fn test_splice_at_boundary() {
        let engine = engine();
        let main_a = seed_main(&engine, 3, 30);
        let rc = cache(&engine, 3, 30);

        let mut ctx = engine.source_for(&3).unwrap();
        engine.skip_read_cache(&mut ctx);
        assert_eq!(ctx.lowest_read_cache_address(), rc);
        assert_eq!(ctx.latest_logical_address(), main_a);

        let main_b = engine.hlog.append(3, 31, main_a).unwrap();
        assert!(engine.splice_at_boundary(&ctx, main_b));
        assert_eq!(
            engine.read_cache().get_info(rc).previous_address(),
            main_b
        );
        // Stale splice loses.
        let main_c = engine.hlog.append(3, 32, main_a).unwrap();
        assert!(!engine.splice_at_boundary(&ctx, main_c));
    }

    #[test]
    fn test_insert_at_tail_invalidates_cached_copy() {
        let engine = engine();
        seed_main(&engine, 5, 50);
        let rc = cache(&engine, 5, 50);

        assert_eq!(engine.insert_at_tail(&5, &51), OperationStatus::Success);

        // The stale cached record is closed and the new record is spliced
        // below the prefix.
        assert!(engine.read_cache().get_info(rc).is_invalid());
        let mut ctx = engine.source_for(&5).unwrap();
        engine.skip_read_cache(&mut ctx);
        let new_main = ctx.latest_logical_address();
        assert_eq!(*engine.hlog.get_value(new_main), 51);
        assert_eq!(engine.read(&5), Some(51));
    }

    #[test]
    fn test_insert_transfers_shared_locks() {
        let engine = engine();
        seed_main(&engine, 6, 60);
        let rc = cache(&engine, 6, 60);

        let src = engine.read_cache().get_info(rc);
        assert!(src.try_lock_shared());
        assert!(src.try_lock_shared());

        assert_eq!(engine.insert_at_tail(&6, &61), OperationStatus::Success);

        let mut ctx = engine.source_for(&6).unwrap();
        engine.skip_read_cache(&mut ctx);
        let new_info = engine.hlog.get_info(ctx.latest_logical_address());
        assert_eq!(new_info.shared_lock_count(), 2);
        assert!(src.is_invalid());
        assert_eq!(engine.stats().lock_transfers(), 1);
    }

    #[test]
    fn test_flatten_bucket() {
        let engine = engine();
        let main = seed_main(&engine, 11, 110);
        cache(&engine, 11, 110);

        let hash = KeyHash::new(11u64.get_hash());
        let bucket_index = engine.index.bucket_index(hash);
        let flat = engine.flatten_bucket_for_checkpoint(bucket_index);

        let slot = flat
            .entries
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .find(|entry| !entry.is_unused() && entry.tag() == hash.tag())
            .expect("flattened bucket keeps the tag");
        assert!(!slot.in_read_cache());
        assert_eq!(slot.address(), main);

        // The live table is untouched.
        let live = engine.index.find_tag(hash).unwrap();
        assert!(live.address().in_read_cache());
    }
}
