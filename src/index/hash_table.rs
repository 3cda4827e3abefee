//! Fixed-size hash table mapping key hashes to chain heads.

use std::sync::atomic::Ordering;

use crate::address::Address;
use crate::index::hash_bucket::{AtomicHashBucketEntry, HashBucket, HashBucketEntry};
use crate::index::KeyHash;
use crate::status::Status;
use crate::utility::is_power_of_two;

/// Snapshot of a located bucket slot.
///
/// Carries the observed entry word and a pointer to the slot so the caller
/// can CAS against exactly what it saw. All bucket updates go through
/// [`HashEntryInfo::try_cas`].
#[derive(Debug)]
pub struct HashEntryInfo {
    /// The entry as observed at lookup time.
    pub entry: HashBucketEntry,
    /// The slot the entry was read from.
    slot: *const AtomicHashBucketEntry,
    /// Tag of the key hash that located this slot.
    pub tag: u16,
}

// Safety: the slot pointer targets a bucket owned by the HashIndex, which
// outlives every operation through the Arc held by the engine; the slot
// itself is only accessed atomically.
unsafe impl Send for HashEntryInfo {}
unsafe impl Sync for HashEntryInfo {}

impl HashEntryInfo {
    /// The chain head observed at lookup (or on the last reload).
    #[inline]
    pub fn address(&self) -> Address {
        self.entry.address()
    }

    /// CAS the slot from the observed entry to one pointing at `new`.
    ///
    /// On success the snapshot follows the update. On failure the snapshot
    /// is reloaded so the caller can re-examine the new head and retry.
    pub fn try_cas(&mut self, new: Address) -> bool {
        let desired = HashBucketEntry::new(new, self.tag, false);
        // SAFETY: slot outlives this snapshot, see Send impl.
        let slot = unsafe { &*self.slot };
        match slot.compare_exchange(self.entry, desired, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                self.entry = desired;
                true
            }
            Err(actual) => {
                self.entry = actual;
                false
            }
        }
    }

    /// Re-read the slot into the snapshot.
    pub fn reload(&mut self) -> HashBucketEntry {
        // SAFETY: see Send impl.
        let slot = unsafe { &*self.slot };
        self.entry = slot.load(Ordering::Acquire);
        self.entry
    }
}

/// Fixed-size bucket table.
///
/// Each slot maps a 14-bit tag to the head of a record chain. There is no
/// table growth and no overflow chaining; a bucket holds at most
/// [`HashBucket::NUM_ENTRIES`] distinct tags.
pub struct HashIndex {
    table: Box<[HashBucket]>,
}

impl HashIndex {
    /// Create an index with `table_size` buckets (power of two, < 2^31).
    pub fn new(table_size: u64) -> Result<Self, Status> {
        if !is_power_of_two(table_size) || table_size >= (1 << 31) {
            return Err(Status::InvalidArgument);
        }
        let table = (0..table_size)
            .map(|_| HashBucket::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self { table })
    }

    /// Number of buckets.
    #[inline]
    pub fn num_buckets(&self) -> u64 {
        self.table.len() as u64
    }

    /// Bucket index for a hash: the low bits, masked by table size.
    #[inline]
    pub fn bucket_index(&self, hash: KeyHash) -> usize {
        hash.table_index(self.num_buckets())
    }

    /// The bucket holding a hash's slot.
    #[inline]
    pub fn bucket(&self, index: usize) -> &HashBucket {
        &self.table[index]
    }

    /// Locate the slot for a hash's tag.
    ///
    /// Returns `None` if no non-tentative slot with the tag exists; the
    /// caller treats the chain as empty.
    pub fn find_tag(&self, hash: KeyHash) -> Option<HashEntryInfo> {
        let bucket = &self.table[self.bucket_index(hash)];
        let tag = hash.tag();

        for slot in bucket.entries.iter() {
            let entry = slot.load(Ordering::Acquire);
            if entry.is_unused() || entry.is_tentative() {
                continue;
            }
            if entry.tag() == tag {
                return Some(HashEntryInfo {
                    entry,
                    slot: slot as *const _,
                    tag,
                });
            }
        }
        None
    }

    /// Locate the slot for a hash's tag, installing an empty one if absent.
    ///
    /// New slots are first published tentative, checked against the rest of
    /// the bucket for a racing insert of the same tag, and only then
    /// finalized. Returns `Status::OutOfMemory` if the bucket has no free
    /// slot.
    pub fn find_or_create_tag(&self, hash: KeyHash) -> Result<HashEntryInfo, Status> {
        let bucket = &self.table[self.bucket_index(hash)];
        let tag = hash.tag();

        loop {
            if let Some(found) = self.find_tag(hash) {
                return Ok(found);
            }

            let Some(free_slot) = bucket
                .entries
                .iter()
                .find(|slot| slot.load(Ordering::Acquire).is_unused())
            else {
                return Err(Status::OutOfMemory);
            };

            let tentative = HashBucketEntry::new(Address::INVALID, tag, true);
            if free_slot
                .compare_exchange(
                    HashBucketEntry::INVALID,
                    tentative,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }

            if self.has_conflicting_slot(bucket, free_slot, tag) {
                // Back off; the competing insert wins and the retry finds it.
                free_slot.store(HashBucketEntry::INVALID, Ordering::Release);
                continue;
            }

            let final_entry = HashBucketEntry::new(Address::INVALID, tag, false);
            free_slot.store(final_entry, Ordering::Release);
            return Ok(HashEntryInfo {
                entry: final_entry,
                slot: free_slot as *const _,
                tag,
            });
        }
    }

    fn has_conflicting_slot(
        &self,
        bucket: &HashBucket,
        ours: &AtomicHashBucketEntry,
        tag: u16,
    ) -> bool {
        bucket.entries.iter().any(|slot| {
            if std::ptr::eq(slot, ours) {
                return false;
            }
            let entry = slot.load(Ordering::Acquire);
            !entry.is_unused() && !entry.is_tentative() && entry.tag() == tag
        })
    }
}

// Safety: all slot access is atomic.
unsafe impl Send for HashIndex {}
unsafe impl Sync for HashIndex {}
