//! The distributed future/promise pool (spec §3 "Future cell", §4.4).
//!
//! Each process holds a symmetric RMA buffer `BUF`; a future id is a byte
//! offset into it, and a handle is `(id, home_pid)`. Cells are bump
//! allocated out of `BUF` and recycled through a per-size-class free list
//! plus a remote return-pool so that a consumer on another process can give
//! an id back to its home.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::distpool::DistPool;
use crate::error::{retry_or_fuse, FutureError, RtResult};
use crate::transport::local::SharedRegion;
use crate::transport::{Pid, Transport};

/// Byte offset of the `done` word within a cell; kept separate from the
/// value so a consumer can poll it with a single-word `get_value`.
const DONE_OFF: usize = 0;
const VALUE_OFF: usize = 8;

fn cell_size<T>() -> usize {
    VALUE_OFF + std::mem::size_of::<T>()
}

fn size_class(bytes: usize) -> u32 {
    (usize::BITS - (bytes.max(1) - 1).leading_zeros()).max(3)
}

/// A future id plus the process that hosts its cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FutureHandle {
    pub id: u64,
    pub home: Pid,
}

pub struct FuturePool {
    transport: std::sync::Arc<dyn Transport>,
    buf: SharedRegion,
    buf_size: usize,
    bump: AtomicU64,
    free_lists: Mutex<HashMap<u32, Vec<u64>>>,
    return_pool: DistPool,
}

impl FuturePool {
    /// Collective: every process must call this together. `buf_size` and
    /// `return_pool_capacity` come from [`crate::config::RuntimeConfig`].
    pub fn new(
        transport: std::sync::Arc<dyn Transport>,
        buf_size: usize,
        return_pool_capacity: u64,
    ) -> Self {
        let buf = transport.shared_alloc(buf_size);
        let return_region = transport.shared_alloc(DistPool::region_size(return_pool_capacity));
        Self {
            transport,
            buf,
            buf_size,
            bump: AtomicU64::new(0),
            free_lists: Mutex::new(HashMap::new()),
            return_pool: DistPool::new(return_region, return_pool_capacity),
        }
    }

    fn drain_return_pool_into_free_lists(&self, class: u32) -> RtResult<bool> {
        let mut drained_any = false;
        while let Some(id) = self.return_pool.pop_local(self.transport.as_ref())? {
            drained_any = true;
            self.free_lists
                .lock()
                .unwrap()
                .entry(class)
                .or_default()
                .push(id);
        }
        Ok(drained_any)
    }

    /// `make<T>()` (spec §4.4): returns a handle to a freshly reset cell
    /// (`done = 0`), homed on this process.
    pub fn make<T>(&self) -> RtResult<FutureHandle> {
        let size = cell_size::<T>();
        let class = size_class(size);
        let class_size = 1usize << class;
        let me = self.transport.pid();

        let id = {
            let mut lists = self.free_lists.lock().unwrap();
            lists.get_mut(&class).and_then(|v| v.pop())
        };
        let id = match id {
            Some(id) => id,
            None => {
                if self.drain_return_pool_into_free_lists(class)? {
                    self.free_lists
                        .lock()
                        .unwrap()
                        .get_mut(&class)
                        .and_then(|v| v.pop())
                        .unwrap_or_else(|| self.bump_alloc(class_size, me))
                } else {
                    self.bump_alloc(class_size, me)
                }
            }
        };
        let id = id.ok_or(FutureError::PoolExhausted {
            pid: me,
            buf_size: self.buf_size,
        })?;

        self.transport.put_value_u64(&self.buf, id as usize + DONE_OFF, 0, me);
        Ok(FutureHandle { id, home: me })
    }

    fn bump_alloc(&self, class_size: usize, _me: Pid) -> Option<u64> {
        let aligned = class_size as u64;
        let mut cur = self.bump.load(Ordering::Relaxed);
        loop {
            let base = cur.next_multiple_of(aligned);
            let next = base + aligned;
            if next as usize > self.buf_size {
                return None;
            }
            match self
                .bump
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(base),
                Err(actual) => cur = actual,
            }
        }
    }

    /// `set(handle, value)` (spec §4.4). If local, a direct write followed
    /// by `done = 1`; if remote, one buffered put for the value and one
    /// single-word put for `done` — the transport's same-target ordering
    /// guarantee means the consumer never observes `done = 1` before the
    /// value lands.
    pub fn set<T>(&self, handle: FutureHandle, value: T) -> RtResult<()>
    where
        T: IntoBytes + Immutable + Copy,
    {
        let me = self.transport.pid();
        let value_off = handle.id as usize + VALUE_OFF;
        let done_off = handle.id as usize + DONE_OFF;
        self.transport
            .put(&self.buf, value_off, value.as_bytes(), handle.home);
        let _ = me;
        self.transport.put_value_u64(&self.buf, done_off, 1, handle.home);
        Ok(())
    }

    /// `get(handle) -> T` (spec §4.4): poll `done`, then read `value`, then
    /// return the id to its home's return-pool (retrying until the pool has
    /// room — remote ids must never be leaked).
    pub fn get<T>(&self, handle: FutureHandle) -> RtResult<T>
    where
        T: FromBytes + IntoBytes + Immutable + KnownLayout + Copy,
    {
        let done_off = handle.id as usize + DONE_OFF;
        let value_off = handle.id as usize + VALUE_OFF;
        let mut attempts = 0u32;
        loop {
            let done = self
                .transport
                .get_value_u64(&self.buf, done_off, handle.home);
            if done == 1 {
                break;
            }
            self.transport.poll();
            retry_or_fuse(
                self.transport.pid(),
                "future get: waiting for done",
                crate::error::RETRY_FUSE,
                &mut attempts,
            )?;
        }

        let mut bytes = vec![0u8; std::mem::size_of::<T>()];
        self.transport
            .get(&self.buf, value_off, &mut bytes, handle.home);
        let value = *T::ref_from_bytes(&bytes).expect("cell value is well-formed");

        self.reclaim::<T>(handle)?;
        Ok(value)
    }

    fn reclaim<T>(&self, handle: FutureHandle) -> RtResult<()> {
        let class = size_class(cell_size::<T>());
        if handle.home == self.transport.pid() {
            self.free_lists
                .lock()
                .unwrap()
                .entry(class)
                .or_default()
                .push(handle.id);
            return Ok(());
        }
        let mut attempts = 0u32;
        loop {
            if self
                .return_pool
                .push(self.transport.as_ref(), handle.home, handle.id)?
            {
                return Ok(());
            }
            self.transport.poll();
            retry_or_fuse(
                self.transport.pid(),
                "future return-pool push",
                crate::error::RETRY_FUSE,
                &mut attempts,
            )?;
        }
    }
}

/// A typed view over [`FuturePool`], matching the original's `future<T>`
/// handle-plus-pool pairing without forcing every call site to juggle a
/// turbofish.
pub struct Future<T> {
    pub handle: FutureHandle,
    _marker: PhantomData<T>,
}

impl<T> Future<T>
where
    T: FromBytes + IntoBytes + Immutable + KnownLayout + Copy,
{
    pub fn make(pool: &FuturePool) -> RtResult<Self> {
        Ok(Self {
            handle: pool.make::<T>()?,
            _marker: PhantomData,
        })
    }

    pub fn set(&self, pool: &FuturePool, value: T) -> RtResult<()> {
        pool.set(self.handle, value)
    }

    pub fn get(&self, pool: &FuturePool) -> RtResult<T> {
        pool.get(self.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn local_set_then_get_round_trips() {
        let mut cluster = LocalTransport::new_cluster(1);
        let t: Arc<dyn Transport> = Arc::new(cluster.remove(0));
        let pool = FuturePool::new(t, 1 << 16, 64);
        let f = Future::<u64>::make(&pool).unwrap();
        f.set(&pool, 42).unwrap();
        assert_eq!(f.get(&pool).unwrap(), 42);
    }

    #[test]
    fn remote_set_then_get_returns_id_to_home() {
        // shared_alloc is collective: pid 0 builds the pool on this thread
        // while pid 1 just needs to rendezvous the same two allocations.
        let mut cluster = LocalTransport::new_cluster(2);
        let t1 = cluster.remove(1);
        let t0: Arc<dyn Transport> = Arc::new(cluster.remove(0));

        let peer = thread::spawn(move || {
            let _ = t1.shared_alloc(1 << 16);
            let _ = t1.shared_alloc(crate::distpool::DistPool::region_size(64));
        });
        let pool0 = FuturePool::new(t0, 1 << 16, 64);
        peer.join().unwrap();

        let f = Future::<u64>::make(&pool0).unwrap();
        pool0.set(f.handle, 7u64).unwrap();
        assert_eq!(f.get(&pool0).unwrap(), 7);
    }
}
