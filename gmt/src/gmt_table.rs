//! The global memory table: gptr → page metadata, plus the two allocation
//! paths (`alloc_slocal`, `alloc_dist`).
//!
//! The original keeps a flat array indexed by block id per distributed
//! object; we keep that idea but back it with a `HashMap` grown lazily on
//! first reference rather than a pre-sized two-level array, since this
//! runtime doesn't know object sizes ahead of time the way a fixed compiled
//! kernel does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use spinning_top::{RwSpinlock, Spinlock};

use crate::error::{GmtError, RtResult};
use crate::gptr::{Distribution, GPtr};
use crate::transport::Pid;

/// Owner sentinel: this page has never been touched by anyone.
pub const INVALID_PID: Pid = u32::MAX;
/// Owner sentinel: a migration is in flight; the home has committed to a
/// new owner but the transfer hasn't finalized yet.
pub const MIGRATING: Pid = u32::MAX - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Invalid,
    Owned,
}

/// Per-page metadata, shared between every process holding a reference to
/// this page's home. Two independently-locked fields: the page buffer
/// guarded by a reader-preferring RW lock, and the `owner` field guarded by
/// its own mutex. The two never nest in the reverse order.
pub struct Entry {
    pub block_size: usize,
    /// `RwSpinlock` rather than a parking lock: a reader-preferring
    /// spinlock that yields to poll between retries is exactly what
    /// `spinning_top` gives us cheaply.
    ///
    /// State and buffer share *one* lock (a single "page lock" gating the
    /// buffer) rather than two, so a caller holding a guard can always
    /// trust `guard.state` to describe `guard.buf` atomically.
    page: RwSpinlock<PageData>,
    owner: Spinlock<Pid>,
}

pub struct PageData {
    pub state: PageState,
    pub buf: Option<Vec<u8>>,
}

pub type PageReadGuard<'a> = spinning_top::RwSpinlockReadGuard<'a, PageData>;
pub type PageWriteGuard<'a> = spinning_top::RwSpinlockWriteGuard<'a, PageData>;

impl Entry {
    fn new_invalid(block_size: usize) -> Self {
        Self {
            block_size,
            page: RwSpinlock::new(PageData {
                state: PageState::Invalid,
                buf: None,
            }),
            owner: Spinlock::new(INVALID_PID),
        }
    }

    fn new_owned(block_size: usize, owner: Pid) -> Self {
        Self {
            block_size,
            page: RwSpinlock::new(PageData {
                state: PageState::Owned,
                buf: Some(vec![0u8; block_size]),
            }),
            owner: Spinlock::new(owner),
        }
    }

    pub fn state(&self) -> PageState {
        self.page.read().state
    }

    pub fn owner(&self) -> Pid {
        *self.owner.lock()
    }

    /// Read the page buffer under the page read-lock. Panics if invalid —
    /// callers must have already validated the entry.
    pub fn with_buf<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.page.read();
        f(guard.buf.as_ref().expect("page read while INVALID"))
    }

    pub fn with_buf_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.page.write();
        f(guard.buf.as_mut().expect("page write while INVALID"))
    }

    /// Try to acquire the page for reading without blocking; used by the
    /// copy protocol's "read-lock or add to retry list" step.
    pub fn try_read(&self) -> Option<PageReadGuard<'_>> {
        self.page.try_read()
    }

    /// `GET` uses [`Entry::try_read`]; `PUT`/`OWN` use this. The original
    /// read-locks `PUT` too, but that requires mutating the
    /// buffer through a shared reference, which Rust's aliasing rules
    /// don't allow — a write-lock is the idiomatic equivalent and doesn't
    /// change observable coherence, since a page still has one writer at a
    /// time either way.
    pub fn try_write(&self) -> Option<PageWriteGuard<'_>> {
        self.page.try_write()
    }

    /// First-touch / OWN resolution under the owner mutex: atomically
    /// decide the new owner and the entry's local state.
    /// Returns the previous owner value (possibly `INVALID_PID`).
    pub fn resolve_owner(&self, access: crate::wire::Access, initiator: Pid) -> Pid {
        let mut owner = self.owner.lock();
        let prev = *owner;
        match (prev, access) {
            (INVALID_PID, _) => *owner = initiator,
            (p, crate::wire::Access::Own) if p != MIGRATING => *owner = MIGRATING,
            _ => {}
        }
        prev
    }

    /// Finalize a migration on the home (`MIGRATING -> new_owner`), per the
    /// `OWNER_CHANGE` step of the copy protocol.
    pub fn finalize_owner(&self, new_owner: Pid) {
        let mut owner = self.owner.lock();
        debug_assert_eq!(*owner, MIGRATING);
        *owner = new_owner;
    }

    pub fn mark_invalid(&self) {
        let mut guard = self.page.write();
        guard.state = PageState::Invalid;
        guard.buf = None;
    }

    pub fn mark_owned(&self, data: Vec<u8>) {
        let mut guard = self.page.write();
        guard.buf = Some(data);
        guard.state = PageState::Owned;
    }

    /// Atomically materialize a never-touched page as OWNED with a zeroed
    /// buffer and apply `f` to it in the same write-lock critical section,
    /// so a first-touching `rmw` never releases the lock between becoming
    /// owner and applying its operator.
    pub fn materialize_owned_and<R>(&self, block_size: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.page.write();
        guard.state = PageState::Owned;
        guard.buf = Some(vec![0u8; block_size]);
        f(guard.buf.as_mut().expect("just set"))
    }
}

/// Key into the GMT's per-block entry table: for shared-local allocations,
/// the block id is always 0 (the whole allocation is one block); for
/// distributed allocations it's the row-major block id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct EntryKey {
    obj_id: u32,
    block_id: u64,
}

struct SlocalObject {
    size: usize,
    home: Pid,
}

struct DistObject {
    dist: Distribution,
}

/// The global memory table for one process.
pub struct Gmt {
    pid: Pid,
    nprocs: u32,
    entries: RwLock<HashMap<EntryKey, Arc<Entry>>>,
    slocal_objects: RwLock<HashMap<u32, SlocalObject>>,
    dist_objects: RwLock<HashMap<u32, DistObject>>,
    next_slocal_id: AtomicU32,
}

impl Gmt {
    pub fn new(pid: Pid, nprocs: u32) -> Self {
        Self {
            pid,
            nprocs,
            entries: RwLock::new(HashMap::new()),
            slocal_objects: RwLock::new(HashMap::new()),
            dist_objects: RwLock::new(HashMap::new()),
            next_slocal_id: AtomicU32::new(1), // id 0 reserved, per gptr.rs
        }
    }

    /// `alloc_slocal(size) -> gptr`: process-local id from an id pool; the
    /// page is allocated lazily on first touch, so this only reserves the
    /// id and installs the object's size for later lookups.
    pub fn alloc_slocal(&self, size: usize) -> RtResult<GPtr> {
        let id = self.next_slocal_id.fetch_add(1, Ordering::Relaxed);
        if id >= crate::gptr::MAX_SLOCAL_IDS {
            return Err(GmtError::PageAllocExhausted {
                pid: self.pid,
                gptr: GPtr::NULL,
                size,
            }
            .into());
        }
        self.slocal_objects.write().unwrap().insert(
            id,
            SlocalObject {
                size,
                home: self.pid,
            },
        );
        Ok(GPtr::make_slocal(self.pid, id, 0))
    }

    /// `alloc_dist(size, dims, nprocs) -> gptr`: collective,
    /// would run behind a `barrier`+`broadcast` from pid 0 in the full
    /// runtime (see [`crate::context::ProcessContext::alloc_dist`]); this
    /// method just installs the locally-known descriptor and materializes
    /// the home blocks, which is what every process does once it has
    /// received the broadcast id and descriptor.
    pub fn install_dist(&self, id: u32, dist: Distribution, expected_size: usize) -> RtResult<()> {
        if dist.total_size() as usize != expected_size {
            return Err(GmtError::DistSizeMismatch {
                pid: self.pid,
                expected: dist.total_size() as usize,
                actual: expected_size,
            }
            .into());
        }
        let block_bytes = dist.block_bytes() as usize;
        let total_blocks = dist.total_blocks();
        let mut entries = self.entries.write().unwrap();
        for block_id in 0..total_blocks {
            let home = dist.home_of_block(block_id);
            let key = EntryKey { obj_id: id, block_id };
            let entry = if home == self.pid {
                Arc::new(Entry::new_owned(block_bytes, self.pid))
            } else {
                Arc::new(Entry::new_invalid(block_bytes))
            };
            entries.insert(key, entry);
        }
        self.dist_objects.write().unwrap().insert(id, DistObject { dist });
        Ok(())
    }

    pub fn distribution(&self, obj_id: u32) -> Option<Distribution> {
        self.dist_objects
            .read()
            .unwrap()
            .get(&obj_id)
            .map(|o| o.dist.clone())
    }

    /// `find_entry(gptr) -> &Entry`, creating the slocal entry lazily on
    /// first reference, mirroring the original's lazily-allocated pages.
    pub fn find_entry(&self, g: GPtr) -> Arc<Entry> {
        let key = if g.is_dist() {
            EntryKey {
                obj_id: g.dist_id(),
                block_id: self.distribution(g.dist_id())
                    .expect("dist object installed")
                    .block_id(g.dist_offset()),
            }
        } else {
            EntryKey {
                obj_id: g.slocal_id(),
                block_id: 0,
            }
        };

        if let Some(e) = self.entries.read().unwrap().get(&key) {
            return e.clone();
        }

        let mut entries = self.entries.write().unwrap();
        entries
            .entry(key)
            .or_insert_with(|| {
                let size = self
                    .slocal_objects
                    .read()
                    .unwrap()
                    .get(&g.slocal_id())
                    .map(|o| o.size)
                    .unwrap_or(0);
                Arc::new(Entry::new_invalid(size))
            })
            .clone()
    }

    pub fn calc_home(&self, g: GPtr) -> Pid {
        if g.is_dist() {
            self.distribution(g.dist_id())
                .expect("dist object installed")
                .home(g.dist_offset())
        } else {
            g.slocal_home()
        }
    }

    pub fn calc_block_base(&self, g: GPtr) -> GPtr {
        if g.is_dist() {
            let base = self
                .distribution(g.dist_id())
                .expect("dist object installed")
                .block_base_offset(g.dist_offset());
            GPtr::make_dist(g.dist_id(), base)
        } else {
            g.slocal_base()
        }
    }

    pub fn calc_block_offset(&self, g: GPtr) -> u64 {
        if g.is_dist() {
            self.distribution(g.dist_id())
                .expect("dist object installed")
                .block_offset(g.dist_offset())
        } else {
            0
        }
    }

    pub fn calc_block_size(&self, g: GPtr) -> usize {
        if g.is_dist() {
            self.distribution(g.dist_id())
                .expect("dist object installed")
                .block_size_bytes() as usize
        } else {
            self.slocal_objects
                .read()
                .unwrap()
                .get(&g.slocal_id())
                .map(|o| o.size)
                .unwrap_or(0)
        }
    }

    pub fn calc_row_size(&self, g: GPtr) -> usize {
        if g.is_dist() {
            self.distribution(g.dist_id())
                .expect("dist object installed")
                .row_size_bytes() as usize
        } else {
            self.calc_block_size(g)
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn nprocs(&self) -> u32 {
        self.nprocs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slocal_first_touch_is_invalid_until_put() {
        let gmt = Gmt::new(0, 2);
        let g = gmt.alloc_slocal(4096).unwrap();
        let e = gmt.find_entry(g);
        assert_eq!(e.state(), PageState::Invalid);
        assert_eq!(e.owner(), INVALID_PID);
    }

    #[test]
    fn dist_install_materializes_home_blocks_only() {
        let gmt = Gmt::new(0, 2);
        let dist = Distribution::new(&[(64, 4)], 2);
        let size = dist.total_size() as usize;
        gmt.install_dist(1, dist, size).unwrap();
        let home_block = GPtr::make_dist(1, 0); // block 0 -> home 0
        let other_block = GPtr::make_dist(1, 64); // block 1 -> home 1
        assert_eq!(gmt.find_entry(home_block).state(), PageState::Owned);
        assert_eq!(gmt.find_entry(other_block).state(), PageState::Invalid);
    }

    #[test]
    fn resolve_owner_first_touch_elects_initiator() {
        let gmt = Gmt::new(0, 2);
        let dist = Distribution::new(&[(64, 4)], 2);
        let size = dist.total_size() as usize;
        gmt.install_dist(1, dist, size).unwrap();
        let g = GPtr::make_dist(1, 64); // home is pid 1, invalid there too initially
        let e = gmt.find_entry(g);
        let prev = e.resolve_owner(crate::wire::Access::Get, 7);
        assert_eq!(prev, INVALID_PID);
        assert_eq!(e.owner(), 7);
    }
}
