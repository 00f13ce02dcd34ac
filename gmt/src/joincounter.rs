//! Join counters: a single machine word plus polling.
//!
//! Used by the DSM copy protocol to track outstanding `OWNER_REQ`/`OWNER_RES`
//! round trips across however many homes a `copy_v` call touches, and
//! exposed generally for anything that needs a fan-out/fan-in barrier
//! cheaper than a full collective `barrier()`.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::{retry_or_fuse, RtResult};
use crate::transport::{Pid, Transport};

pub struct JoinCounter {
    remaining: AtomicI64,
}

impl JoinCounter {
    pub fn new(initial: i64) -> Self {
        Self {
            remaining: AtomicI64::new(initial),
        }
    }

    /// Subtract `k` from the counter. Called once per completed reply.
    pub fn notify(&self, k: i64) {
        self.remaining.fetch_sub(k, Ordering::AcqRel);
    }

    pub fn is_done(&self) -> bool {
        self.remaining.load(Ordering::Acquire) <= 0
    }

    /// Poll the transport until the counter reaches zero, bounded by the
    /// retry fuse like every other spin-loop in the runtime.
    pub fn wait(&self, transport: &dyn Transport) -> RtResult<()> {
        let mut attempts = 0u32;
        while !self.is_done() {
            transport.poll();
            retry_or_fuse(
                transport.pid(),
                "join counter wait",
                crate::error::RETRY_FUSE,
                &mut attempts,
            )?;
        }
        Ok(())
    }
}

/// A counter resident on a remote process, manipulated only through the
/// transport's atomic add. Not currently exercised by the in-process DSM
/// engine (which resolves owners synchronously per home), but kept as the
/// primitive the wire format's `jc_ptr` field names.
pub struct RemoteJoinCounter {
    pub owner: Pid,
    pub offset: usize,
}

impl RemoteJoinCounter {
    pub fn notify(
        &self,
        transport: &dyn Transport,
        region: &crate::transport::local::SharedRegion,
        k: i64,
    ) {
        transport.fetch_and_add_u64(region, self.offset, -k, self.owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_to_zero_marks_done() {
        let jc = JoinCounter::new(3);
        assert!(!jc.is_done());
        jc.notify(2);
        assert!(!jc.is_done());
        jc.notify(1);
        assert!(jc.is_done());
    }
}
