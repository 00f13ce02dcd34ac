//! An in-process stand-in for the RDMA/AM transport, modeled on
//! GASNet's "smp" conduit: every simulated `pid` is an OS thread, and
//! puts/gets/active-messages are synchronous operations against shared
//! state instead of real network I/O. See the module doc on [`super`].

use std::collections::HashMap;
use std::sync::{Arc, Barrier, Mutex, RwLock};

use super::{AmHandler, Pid, ReduceOp, Transport};

/// A symmetric allocation shared by every peer.
#[derive(Clone)]
pub struct SharedRegion {
    per_peer: Arc<Vec<Mutex<Vec<u8>>>>,
    size_per_peer: usize,
}

impl super::SymmetricRegion for SharedRegion {
    fn size_per_peer(&self) -> usize {
        self.size_per_peer
    }
}

struct ClusterState {
    nprocs: u32,
    handlers: Vec<RwLock<HashMap<u32, Box<AmHandler>>>>,
    /// Serializes handler execution per receiver: AM handlers run one at a
    /// time for any given receiver.
    recv_lock: Vec<Mutex<()>>,

    barrier_a: Barrier,
    barrier_b: Barrier,
    barrier_c: Barrier,

    bcast_slot: Mutex<Vec<u8>>,
    gather_slots: Vec<Mutex<Vec<u8>>>,
    reduce_slots: Vec<Mutex<i64>>,
    alloc_slot: Mutex<Option<SharedRegion>>,
}

/// A handle to the shared cluster state, scoped to one simulated `pid`.
/// Cheap to clone; every peer's handle shares the same [`ClusterState`].
pub struct LocalTransport {
    inner: Arc<ClusterState>,
    pid: Pid,
}

impl LocalTransport {
    /// Build `nprocs` transport handles, one per simulated pid, all wired
    /// to the same in-process cluster.
    pub fn new_cluster(nprocs: u32) -> Vec<LocalTransport> {
        assert!(nprocs > 0);
        let state = Arc::new(ClusterState {
            nprocs,
            handlers: (0..nprocs).map(|_| RwLock::new(HashMap::new())).collect(),
            recv_lock: (0..nprocs).map(|_| Mutex::new(())).collect(),
            barrier_a: Barrier::new(nprocs as usize),
            barrier_b: Barrier::new(nprocs as usize),
            barrier_c: Barrier::new(nprocs as usize),
            bcast_slot: Mutex::new(Vec::new()),
            gather_slots: (0..nprocs).map(|_| Mutex::new(Vec::new())).collect(),
            reduce_slots: (0..nprocs).map(|_| Mutex::new(0)).collect(),
            alloc_slot: Mutex::new(None),
        });
        (0..nprocs)
            .map(|pid| LocalTransport {
                inner: state.clone(),
                pid,
            })
            .collect()
    }
}

impl Transport for LocalTransport {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn nprocs(&self) -> u32 {
        self.inner.nprocs
    }

    fn poll(&self) {
        // All delivery in this transport is synchronous (direct calls), so
        // there is no backlog to drain. Still yield the thread: every
        // spin-loop in the runtime calls `poll` between retries, and doing
        // so here keeps contended paths from starving peers.
        std::thread::yield_now();
    }

    fn shared_alloc(&self, size_per_peer: usize) -> SharedRegion {
        // Collective: every peer must call this with the same size.
        self.inner.barrier_a.wait();
        if self.pid == 0 {
            let region = SharedRegion {
                per_peer: Arc::new(
                    (0..self.inner.nprocs)
                        .map(|_| Mutex::new(vec![0u8; size_per_peer]))
                        .collect(),
                ),
                size_per_peer,
            };
            *self.inner.alloc_slot.lock().unwrap() = Some(region);
        }
        self.inner.barrier_b.wait();
        let region = self
            .inner
            .alloc_slot
            .lock()
            .unwrap()
            .clone()
            .expect("pid 0 populated the alloc slot");
        self.inner.barrier_c.wait();
        region
    }

    fn put(&self, region: &SharedRegion, offset: usize, src: &[u8], target: Pid) {
        let mut buf = region.per_peer[target as usize].lock().unwrap();
        buf[offset..offset + src.len()].copy_from_slice(src);
    }

    fn get(&self, region: &SharedRegion, offset: usize, dst: &mut [u8], target: Pid) {
        let buf = region.per_peer[target as usize].lock().unwrap();
        dst.copy_from_slice(&buf[offset..offset + dst.len()]);
    }

    fn put_value_u64(&self, region: &SharedRegion, offset: usize, value: u64, target: Pid) {
        self.put(region, offset, &value.to_le_bytes(), target);
    }

    fn get_value_u64(&self, region: &SharedRegion, offset: usize, target: Pid) -> u64 {
        let mut bytes = [0u8; 8];
        self.get(region, offset, &mut bytes, target);
        u64::from_le_bytes(bytes)
    }

    fn fetch_and_add_u64(
        &self,
        region: &SharedRegion,
        offset: usize,
        delta: i64,
        target: Pid,
    ) -> u64 {
        let mut buf = region.per_peer[target as usize].lock().unwrap();
        let slot = &mut buf[offset..offset + 8];
        let prev = u64::from_le_bytes(slot.try_into().unwrap());
        let next = (prev as i64).wrapping_add(delta) as u64;
        slot.copy_from_slice(&next.to_le_bytes());
        prev
    }

    fn register_handler(&self, handler_id: u32, handler: Box<AmHandler>) {
        self.inner.handlers[self.pid as usize]
            .write()
            .unwrap()
            .insert(handler_id, handler);
    }

    fn am_request(&self, target: Pid, handler_id: u32, payload: &[u8]) -> Vec<u8> {
        let _serialize = self.inner.recv_lock[target as usize].lock().unwrap();
        let handlers = self.inner.handlers[target as usize].read().unwrap();
        let handler = handlers
            .get(&handler_id)
            .unwrap_or_else(|| panic!("pid {target}: no handler registered for id {handler_id}"));
        handler(self.pid, payload)
    }

    fn barrier(&self) {
        self.inner.barrier_a.wait();
    }

    fn broadcast(&self, root: Pid, data: &[u8]) -> Vec<u8> {
        self.inner.barrier_a.wait();
        if self.pid == root {
            *self.inner.bcast_slot.lock().unwrap() = data.to_vec();
        }
        self.inner.barrier_b.wait();
        let out = self.inner.bcast_slot.lock().unwrap().clone();
        self.inner.barrier_c.wait();
        out
    }

    fn gather(&self, root: Pid, data: &[u8]) -> Option<Vec<Vec<u8>>> {
        *self.inner.gather_slots[self.pid as usize].lock().unwrap() = data.to_vec();
        self.inner.barrier_a.wait();
        let result = if self.pid == root {
            Some(
                self.inner
                    .gather_slots
                    .iter()
                    .map(|s| s.lock().unwrap().clone())
                    .collect(),
            )
        } else {
            None
        };
        self.inner.barrier_b.wait();
        result
    }

    fn reduce_long(&self, value: i64, op: ReduceOp) -> i64 {
        *self.inner.reduce_slots[self.pid as usize].lock().unwrap() = value;
        self.inner.barrier_a.wait();
        let result = self
            .inner
            .reduce_slots
            .iter()
            .map(|s| *s.lock().unwrap())
            .fold(None, |acc: Option<i64>, v| {
                Some(match acc {
                    None => v,
                    Some(a) => match op {
                        ReduceOp::Sum => a + v,
                        ReduceOp::Max => a.max(v),
                        ReduceOp::Min => a.min(v),
                    },
                })
            })
            .unwrap_or(0);
        self.inner.barrier_b.wait();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// `shared_alloc` is collective: every peer in the cluster must call it,
    /// so exercising it needs one thread per simulated pid.
    fn alloc_together(handles: Vec<LocalTransport>, size: usize) -> Vec<SharedRegion> {
        let joins: Vec<_> = handles
            .into_iter()
            .map(|h| thread::spawn(move || h.shared_alloc(size)))
            .collect();
        joins.into_iter().map(|j| j.join().unwrap()).collect()
    }

    #[test]
    fn put_get_roundtrip() {
        let cluster = LocalTransport::new_cluster(2);
        let t0 = LocalTransport {
            inner: cluster[0].inner.clone(),
            pid: 0,
        };
        let regions = alloc_together(cluster, 64);
        let region = &regions[0];
        t0.put(region, 0, &[1, 2, 3, 4], 1);
        let mut dst = [0u8; 4];
        t0.get(region, 0, &mut dst, 1);
        assert_eq!(dst, [1, 2, 3, 4]);
    }

    #[test]
    fn fetch_and_add_is_atomic_across_threads() {
        let cluster = LocalTransport::new_cluster(4);
        let t0 = LocalTransport {
            inner: cluster[0].inner.clone(),
            pid: 0,
        };
        let regions = alloc_together(cluster, 8);
        let region = regions[0].clone();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let region = region.clone();
                let t = LocalTransport {
                    inner: t0.inner.clone(),
                    pid: 0,
                };
                thread::spawn(move || {
                    for _ in 0..100 {
                        t.fetch_and_add_u64(&region, 0, 1, 0);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(t0.get_value_u64(&region, 0, 0), 800);
    }
}
