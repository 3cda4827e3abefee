//! Lightweight epoch protection.
//!
//! Threads announce the epoch they operate in; memory unlinked under epoch
//! `E` may only be reused once every thread has advanced past `E`. Deferred
//! actions (here: advancing the read-cache reclamation frontier) ride a
//! fixed drain list and run when their trigger epoch becomes safe.

use std::cell::{RefCell, UnsafeCell};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::constants::{CACHE_LINE_BYTES, MAX_THREADS};
use crate::status::Status;

/// Epoch value meaning "thread not protected".
pub const UNPROTECTED: u64 = 0;

/// Size of the drain list for deferred actions.
const DRAIN_LIST_SIZE: usize = 256;

// ============ Thread ID allocation ============

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(0);
static FREE_THREAD_IDS: OnceLock<Mutex<Vec<usize>>> = OnceLock::new();

fn free_thread_ids() -> &'static Mutex<Vec<usize>> {
    FREE_THREAD_IDS.get_or_init(|| Mutex::new(Vec::new()))
}

#[derive(Debug)]
struct ThreadIdGuard {
    id: usize,
}

impl Drop for ThreadIdGuard {
    fn drop(&mut self) {
        if let Some(free) = FREE_THREAD_IDS.get() {
            free.lock().push(self.id);
        }
    }
}

fn try_allocate_thread_id() -> Option<ThreadIdGuard> {
    if let Some(id) = free_thread_ids().lock().pop() {
        return Some(ThreadIdGuard { id });
    }

    match NEXT_THREAD_ID.fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
        if next < MAX_THREADS {
            Some(next + 1)
        } else {
            None
        }
    }) {
        Ok(id) => Some(ThreadIdGuard { id }),
        // Another thread may have just returned an ID. Re-check before giving up.
        Err(_) => free_thread_ids()
            .lock()
            .pop()
            .map(|id| ThreadIdGuard { id }),
    }
}

thread_local! {
    static THREAD_ID: RefCell<Option<ThreadIdGuard>> = const { RefCell::new(None) };
}

/// Get the calling thread's stable ID for epoch protection.
///
/// Allocated on first call, recycled when the thread exits.
///
/// # Errors
/// Returns `Status::TooManyThreads` if more than [`MAX_THREADS`] threads
/// concurrently use the library.
#[inline]
pub fn get_thread_id() -> Result<usize, Status> {
    try_get_thread_id().ok_or(Status::TooManyThreads)
}

/// Fallible variant of [`get_thread_id`].
#[inline]
pub fn try_get_thread_id() -> Option<usize> {
    THREAD_ID.with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some(guard) = slot.as_ref() {
            return Some(guard.id);
        }
        let guard = try_allocate_thread_id()?;
        let id = guard.id;
        *slot = Some(guard);
        Some(id)
    })
}

// ============ Epoch table ============

/// Per-thread epoch slot, one cache line each.
#[repr(C, align(64))]
struct Entry {
    local_current_epoch: AtomicU64,
    _padding: [u8; CACHE_LINE_BYTES - 8],
}

impl Entry {
    const fn new() -> Self {
        Self {
            local_current_epoch: AtomicU64::new(UNPROTECTED),
            _padding: [0; CACHE_LINE_BYTES - 8],
        }
    }
}

/// Deferred action slot in the drain list.
struct EpochAction {
    /// Trigger epoch, or one of the sentinels below.
    epoch: AtomicU64,
    callback: UnsafeCell<Option<Box<dyn FnOnce() + Send + 'static>>>,
}

impl EpochAction {
    const FREE: u64 = u64::MAX;
    const LOCKED: u64 = u64::MAX - 1;

    const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(Self::FREE),
            callback: UnsafeCell::new(None),
        }
    }

    /// Pop and run the action if its trigger epoch is still `expected`.
    fn try_pop(&self, expected_epoch: u64) -> bool {
        if self
            .epoch
            .compare_exchange(expected_epoch, Self::LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // SAFETY: the LOCKED sentinel gives this thread sole access.
        let callback = unsafe { (*self.callback.get()).take() };
        self.epoch.store(Self::FREE, Ordering::Release);
        if let Some(cb) = callback {
            cb();
        }
        true
    }

    /// Install a callback into a FREE slot.
    fn try_push<F>(&self, trigger_epoch: u64, callback: F) -> Result<(), F>
    where
        F: FnOnce() + Send + 'static,
    {
        if self
            .epoch
            .compare_exchange(Self::FREE, Self::LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(callback);
        }
        // SAFETY: see try_pop.
        unsafe {
            *self.callback.get() = Some(Box::new(callback));
        }
        self.epoch.store(trigger_epoch, Ordering::Release);
        Ok(())
    }
}

// Safety: callback access is serialized by the LOCKED sentinel.
unsafe impl Send for EpochAction {}
unsafe impl Sync for EpochAction {}

/// Lightweight epoch protection framework.
pub struct LightEpoch {
    table: Box<[Entry]>,
    drain_list: Box<[EpochAction]>,
    drain_count: AtomicU32,
    /// Current global epoch.
    pub current_epoch: AtomicU64,
    /// Cached safe-to-reclaim epoch.
    pub safe_to_reclaim_epoch: AtomicU64,
}

impl LightEpoch {
    /// Create a new epoch instance.
    pub fn new() -> Self {
        let table = (0..MAX_THREADS)
            .map(|_| Entry::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let drain_list = (0..DRAIN_LIST_SIZE)
            .map(|_| EpochAction::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            table,
            drain_list,
            drain_count: AtomicU32::new(0),
            current_epoch: AtomicU64::new(1),
            safe_to_reclaim_epoch: AtomicU64::new(0),
        }
    }

    /// Enter the protected region; returns the epoch entered.
    #[inline]
    pub fn protect(&self, thread_id: usize) -> u64 {
        debug_assert!(thread_id < MAX_THREADS);
        let epoch = self.current_epoch.load(Ordering::Acquire);
        self.table[thread_id]
            .local_current_epoch
            .store(epoch, Ordering::Release);
        epoch
    }

    /// Enter the protected region and run any drainable deferred actions.
    #[inline]
    pub fn protect_and_drain(&self, thread_id: usize) -> u64 {
        let epoch = self.protect(thread_id);
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(epoch);
        }
        epoch
    }

    /// Re-announce the current epoch without leaving the protected region.
    ///
    /// Callers stuck in a retry loop call this so they do not hold the
    /// reclamation frontier back.
    #[inline]
    pub fn refresh(&self, thread_id: usize) -> u64 {
        self.protect_and_drain(thread_id)
    }

    /// Is the thread inside the protected region?
    #[inline]
    pub fn is_protected(&self, thread_id: usize) -> bool {
        debug_assert!(thread_id < MAX_THREADS);
        self.table[thread_id]
            .local_current_epoch
            .load(Ordering::Acquire)
            != UNPROTECTED
    }

    /// Leave the protected region.
    #[inline]
    pub fn unprotect(&self, thread_id: usize) {
        debug_assert!(thread_id < MAX_THREADS);
        self.table[thread_id]
            .local_current_epoch
            .store(UNPROTECTED, Ordering::Release);
    }

    fn drain(&self, next_epoch: u64) {
        let safe_epoch = self.compute_safe_to_reclaim_epoch(next_epoch);

        for action in self.drain_list.iter() {
            let trigger = action.epoch.load(Ordering::Acquire);
            if trigger == EpochAction::FREE
                || trigger == EpochAction::LOCKED
                || trigger > safe_epoch
            {
                continue;
            }
            if action.try_pop(trigger) && self.drain_count.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }

    /// Increment the global epoch.
    pub fn bump_current_epoch(&self) -> u64 {
        let next_epoch = self.current_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(next_epoch);
        }
        next_epoch
    }

    /// Increment the global epoch and register `callback` to run once the
    /// prior epoch is safe to reclaim.
    ///
    /// If the drain list stays full, the caller drains other slots until one
    /// frees up; the callback is never dropped. After a bounded number of
    /// fruitless passes it waits for the prior epoch to quiesce and runs the
    /// callback inline instead.
    pub fn bump_current_epoch_with_action<F>(&self, callback: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        const MAX_FULL_SCANS: usize = 500;

        let prior_epoch = self.bump_current_epoch() - 1;

        let mut callback = Some(callback);
        let mut i = 0;
        let mut full_scans = 0;
        loop {
            let action = &self.drain_list[i];
            let trigger = action.epoch.load(Ordering::Acquire);

            if trigger == EpochAction::FREE {
                if let Some(cb) = callback.take() {
                    match action.try_push(prior_epoch, cb) {
                        Ok(()) => {
                            self.drain_count.fetch_add(1, Ordering::AcqRel);
                            return prior_epoch + 1;
                        }
                        Err(returned) => callback = Some(returned),
                    }
                }
            } else if trigger != EpochAction::LOCKED
                && trigger <= self.safe_to_reclaim_epoch.load(Ordering::Acquire)
                && action.try_pop(trigger)
            {
                self.drain_count.fetch_sub(1, Ordering::AcqRel);
            }

            i = (i + 1) % DRAIN_LIST_SIZE;
            if i == 0 {
                // Keep the frontier fresh while scanning.
                let current = self.current_epoch.load(Ordering::Acquire);
                self.compute_safe_to_reclaim_epoch(current);

                full_scans += 1;
                if full_scans >= MAX_FULL_SCANS {
                    tracing::warn!(
                        prior_epoch,
                        "epoch drain list still full; running action inline"
                    );
                    // The deferral contract must hold even here: wait for
                    // the prior epoch to quiesce before executing.
                    loop {
                        let current = self.current_epoch.load(Ordering::Acquire);
                        if self.compute_safe_to_reclaim_epoch(current) >= prior_epoch {
                            break;
                        }
                        std::thread::yield_now();
                    }
                    if let Some(cb) = callback.take() {
                        cb();
                    }
                    return prior_epoch + 1;
                }
                std::thread::yield_now();
            }
        }
    }

    /// Recompute the safe-to-reclaim epoch by scanning all thread slots.
    pub fn compute_safe_to_reclaim_epoch(&self, current_epoch: u64) -> u64 {
        let mut oldest_ongoing = current_epoch;
        for entry in self.table.iter() {
            let entry_epoch = entry.local_current_epoch.load(Ordering::Acquire);
            if entry_epoch != UNPROTECTED && entry_epoch < oldest_ongoing {
                oldest_ongoing = entry_epoch;
            }
        }
        let safe = oldest_ongoing.saturating_sub(1);
        self.safe_to_reclaim_epoch.store(safe, Ordering::Release);
        safe
    }

    /// Is `epoch` safe to reclaim, per the cached frontier?
    #[inline]
    pub fn is_safe_to_reclaim(&self, epoch: u64) -> bool {
        epoch <= self.safe_to_reclaim_epoch.load(Ordering::Acquire)
    }
}

impl Default for LightEpoch {
    fn default() -> Self {
        Self::new()
    }
}
