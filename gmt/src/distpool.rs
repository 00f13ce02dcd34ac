//! Dist-pool: a fixed-capacity ring per process, serialized by a
//! dist-spinlock held at the reader (spec §3, §5). Backs the future
//! return-pool; generally usable for any many-writer/one-reader
//! cross-process queue.
//!
//! Layout of one process's region, all in its own slice of the symmetric
//! [`SharedRegion`]: `[lock:u64][head:u64][tail:u64][data: capacity * 8]`.
//! Elements are always one 64-bit word (an id or byte offset); callers that
//! need smaller payloads just widen them.

use crate::error::{retry_or_fuse, RtResult};
use crate::transport::local::SharedRegion;
use crate::transport::{Pid, Transport};

const LOCK_OFF: usize = 0;
const HEAD_OFF: usize = 8;
const TAIL_OFF: usize = 16;
const DATA_OFF: usize = 24;

pub struct DistPool {
    region: SharedRegion,
    capacity: u64,
}

impl DistPool {
    /// Bytes a [`Transport::shared_alloc`] must reserve per peer for a pool
    /// of `capacity` elements.
    pub fn region_size(capacity: u64) -> usize {
        DATA_OFF + capacity as usize * 8
    }

    /// Wrap an already-allocated symmetric region (every peer must call
    /// `shared_alloc(DistPool::region_size(capacity))` collectively first).
    pub fn new(region: SharedRegion, capacity: u64) -> Self {
        Self { region, capacity }
    }

    fn slot_offset(&self, index: u64) -> usize {
        DATA_OFF + (index % self.capacity) as usize * 8
    }

    fn lock(&self, transport: &dyn Transport, target: Pid) -> RtResult<()> {
        let mut attempts = 0u32;
        loop {
            let prev = transport.fetch_and_add_u64(&self.region, LOCK_OFF, 1, target);
            if prev == 0 {
                return Ok(());
            }
            transport.fetch_and_add_u64(&self.region, LOCK_OFF, -1, target);
            transport.poll();
            retry_or_fuse(
                transport.pid(),
                "dist-pool lock",
                crate::error::RETRY_FUSE,
                &mut attempts,
            )?;
        }
    }

    fn unlock(&self, transport: &dyn Transport, target: Pid) {
        transport.fetch_and_add_u64(&self.region, LOCK_OFF, -1, target);
    }

    /// Push `value` onto the ring hosted at `target`. Returns `Ok(false)` if
    /// the ring was full (caller should retry later, per spec §4.4: "if
    /// pushing fails because the home's return-pool is full, retry later").
    pub fn push(&self, transport: &dyn Transport, target: Pid, value: u64) -> RtResult<bool> {
        self.lock(transport, target)?;
        let head = transport.get_value_u64(&self.region, HEAD_OFF, target);
        let tail = transport.get_value_u64(&self.region, TAIL_OFF, target);
        if tail - head >= self.capacity {
            self.unlock(transport, target);
            return Ok(false);
        }
        let offset = self.slot_offset(tail);
        transport.put_value_u64(&self.region, offset, value, target);
        transport.put_value_u64(&self.region, TAIL_OFF, tail + 1, target);
        self.unlock(transport, target);
        Ok(true)
    }

    /// Pop one value from this process's own ring (the reader is always the
    /// process hosting the pool).
    pub fn pop_local(&self, transport: &dyn Transport) -> RtResult<Option<u64>> {
        let me = transport.pid();
        self.lock(transport, me)?;
        let head = transport.get_value_u64(&self.region, HEAD_OFF, me);
        let tail = transport.get_value_u64(&self.region, TAIL_OFF, me);
        if head == tail {
            self.unlock(transport, me);
            return Ok(None);
        }
        let value = transport.get_value_u64(&self.region, self.slot_offset(head), me);
        transport.put_value_u64(&self.region, HEAD_OFF, head + 1, me);
        self.unlock(transport, me);
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;

    #[test]
    fn push_then_pop_round_trips() {
        let cluster = LocalTransport::new_cluster(1);
        let region = cluster[0].shared_alloc(DistPool::region_size(4));
        let pool = DistPool::new(region, 4);
        assert!(pool.push(&cluster[0], 0, 42).unwrap());
        assert_eq!(pool.pop_local(&cluster[0]).unwrap(), Some(42));
        assert_eq!(pool.pop_local(&cluster[0]).unwrap(), None);
    }

    #[test]
    fn push_past_capacity_reports_full() {
        let cluster = LocalTransport::new_cluster(1);
        let region = cluster[0].shared_alloc(DistPool::region_size(2));
        let pool = DistPool::new(region, 2);
        assert!(pool.push(&cluster[0], 0, 1).unwrap());
        assert!(pool.push(&cluster[0], 0, 2).unwrap());
        assert!(!pool.push(&cluster[0], 0, 3).unwrap());
    }
}
