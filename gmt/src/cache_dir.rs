//! The cache directory (spec §3 "Cache record", §4.3 step 1-2, §9 "cyclic
//! ownership in the cache directory").
//!
//! A cache record is owned by exactly one directory entry; the record also
//! needs to find its directory to unregister itself at refcount 0. Rather
//! than model that as a true back-reference (which the spec flags as a
//! cyclic-ownership hazard to avoid), the directory is the sole owner and
//! records are looked up again by object id when `unlocalize` drops the
//! last handle — an arena-with-handles shape, per the design note's second
//! option.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::gptr::GPtr;

/// A refcounted local mirror of the contiguous span `[base, base + buf.len())`
/// of one distributed object, covering every block in `blocks`.
pub struct CacheRecord {
    pub obj_id: u32,
    pub base: GPtr,
    pub blocks: Vec<u64>,
    pub buf: RwLock<Vec<u8>>,
    refcount: AtomicUsize,
}

impl CacheRecord {
    fn new(obj_id: u32, base: GPtr, blocks: Vec<u64>, buf: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            obj_id,
            base,
            blocks,
            buf: RwLock::new(buf),
            refcount: AtomicUsize::new(1),
        })
    }

    /// Does this record's block set cover `blocks` (spec §4.3 step 2: "a
    /// sub-sequence")? `blocks` must already be sorted and deduplicated.
    fn covers(&self, blocks: &[u64]) -> bool {
        blocks.iter().all(|b| self.blocks.binary_search(b).is_ok())
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Try to join an existing record: succeeds only if the record is still
    /// live (refcount >= 1) at the moment of increment, matching the "≥1 to
    /// ≥2" CAS-style language in §4.3.
    fn try_acquire(&self) -> bool {
        loop {
            let cur = self.refcount.load(Ordering::Acquire);
            if cur == 0 {
                return false;
            }
            if self
                .refcount
                .compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Release one reference, returning `true` if this was the last one.
    fn release(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

#[derive(Default)]
struct ObjectDirectory {
    records: Vec<Arc<CacheRecord>>,
}

/// Per-process cache directory, one entry per distributed object id (spec
/// §4.3, §5: "one read/write lock per distributed object").
#[derive(Default)]
pub struct CacheDirectory {
    objects: RwLock<HashMap<u32, RwLock<ObjectDirectory>>>,
}

impl CacheDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a live record covering `blocks` (sorted, deduped) and bump its
    /// refcount, or return `None` so the caller materializes a fresh one.
    pub fn acquire_existing(&self, obj_id: u32, blocks: &[u64]) -> Option<Arc<CacheRecord>> {
        let objects = self.objects.read().unwrap();
        let dir = objects.get(&obj_id)?.read().unwrap();
        dir.records
            .iter()
            .find(|r| r.covers(blocks) && r.try_acquire())
            .cloned()
    }

    /// Register a freshly materialized record with refcount 1.
    pub fn insert_new(
        &self,
        obj_id: u32,
        base: GPtr,
        blocks: Vec<u64>,
        buf: Vec<u8>,
    ) -> Arc<CacheRecord> {
        let record = CacheRecord::new(obj_id, base, blocks, buf);
        let mut objects = self.objects.write().unwrap();
        let dir = objects.entry(obj_id).or_default();
        dir.write().unwrap().records.push(record.clone());
        record
    }

    /// Drop one reference to `record`; if it was the last one, unregister
    /// and free it (spec §3: "when refcount transitions 1→0 the record is
    /// unregistered and freed atomically").
    pub fn release(&self, record: &Arc<CacheRecord>) {
        if !record.release() {
            return;
        }
        let objects = self.objects.read().unwrap();
        if let Some(dir) = objects.get(&record.obj_id) {
            let mut dir = dir.write().unwrap();
            dir.records.retain(|r| !Arc::ptr_eq(r, record));
        }
    }
}

/// An ordered stack of cache records pushed by `localize` calls and popped
/// LIFO by `unlocalize` (spec §3 "Localize handle").
#[derive(Default)]
pub struct LocalizeHandle {
    stack: Vec<Arc<CacheRecord>>,
}

impl LocalizeHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: Arc<CacheRecord>) {
        self.stack.push(record);
    }

    /// Pop and release every record pushed into this handle, in reverse
    /// push order (spec §8 "Localize LIFO").
    pub fn unlocalize_all(&mut self, dir: &CacheDirectory) {
        while let Some(record) = self.stack.pop() {
            dir.release(&record);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

impl Drop for LocalizeHandle {
    fn drop(&mut self) {
        debug_assert!(
            self.stack.is_empty(),
            "LocalizeHandle dropped with {} un-unlocalized cache record(s)",
            self.stack.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_localize_over_same_blocks_shares_record() {
        let dir = CacheDirectory::new();
        assert!(dir.acquire_existing(1, &[0, 1]).is_none());
        let r = dir.insert_new(1, GPtr::make_dist(1, 0), vec![0, 1], vec![0u8; 128]);
        assert_eq!(r.refcount(), 1);

        let shared = dir.acquire_existing(1, &[0, 1]).unwrap();
        assert!(Arc::ptr_eq(&r, &shared));
        assert_eq!(r.refcount(), 2);
    }

    #[test]
    fn release_at_zero_unregisters_record() {
        let dir = CacheDirectory::new();
        let r = dir.insert_new(1, GPtr::make_dist(1, 0), vec![0], vec![0u8; 64]);
        dir.release(&r);
        assert!(dir.acquire_existing(1, &[0]).is_none());
    }

    #[test]
    fn handle_unlocalizes_in_lifo_order() {
        let dir = CacheDirectory::new();
        let a = dir.insert_new(1, GPtr::make_dist(1, 0), vec![0], vec![0u8; 8]);
        let b = dir.insert_new(1, GPtr::make_dist(1, 64), vec![1], vec![0u8; 8]);
        let mut handle = LocalizeHandle::new();
        handle.push(a.clone());
        handle.push(b.clone());
        handle.unlocalize_all(&dir);
        assert_eq!(a.refcount(), 0);
        assert_eq!(b.refcount(), 0);
        assert!(handle.is_empty());
    }
}
