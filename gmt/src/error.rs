//! Error taxonomy for the runtime.
//!
//! Resource exhaustion and transport failure are modeled as typed, fatal
//! errors; precondition violations stay as `debug_assert!`s (fatal in
//! debug, undefined behavior in release) rather than `Result` variants,
//! since they must not be recoverable.

use crate::gptr::GPtr;
use crate::transport::Pid;

/// Errors raised by the global memory table / cache allocator.
#[derive(Debug, thiserror::Error)]
pub enum GmtError {
    #[error("pid {pid}: page buffer allocator exhausted while materializing {size} bytes for {gptr:?}")]
    PageAllocExhausted { pid: Pid, gptr: GPtr, size: usize },

    #[error("pid {pid}: distributed object size mismatch: descriptor implies {expected} bytes, caller passed {actual}")]
    DistSizeMismatch {
        pid: Pid,
        expected: usize,
        actual: usize,
    },
}

/// Errors raised by the distributed future pool.
#[derive(Debug, thiserror::Error)]
pub enum FutureError {
    #[error("pid {pid}: future pool exhausted (buffer of {buf_size} bytes is full)")]
    PoolExhausted { pid: Pid, buf_size: usize },

    #[error("pid {pid}: future return-pool is full, id could not be returned to home {home}")]
    ReturnPoolFull { pid: Pid, home: Pid },
}

/// Errors raised by the work-stealing scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("pid {pid}: task deque overflow (capacity {capacity})")]
    DequeOverflow { pid: Pid, capacity: usize },
}

/// Errors surfaced by `rmw`: only the initiator of an RMW observes failure,
/// which it is expected to retry.
#[derive(Debug, thiserror::Error)]
pub enum RmwError {
    #[error("rmw on {gptr:?} could not acquire the owner's page lock, retry")]
    Busy { gptr: GPtr },
}

/// A transient-contention retry loop exceeded its fuse: bounded implicitly
/// by a 100 000-retry ceiling that upgrades contention into a fatal error.
#[derive(Debug, thiserror::Error)]
#[error("pid {pid}: {what} did not resolve after {retries} retries, giving up")]
pub struct RetryFuseBlown {
    pub pid: Pid,
    pub what: &'static str,
    pub retries: u32,
}

/// The crate-wide error type. Subsystem errors convert into this at the
/// public API boundary; `Fatal` is for the cases §7 calls unconditionally
/// fatal (resource exhaustion, transport failure).
#[derive(Debug, thiserror::Error)]
pub enum RtError {
    #[error(transparent)]
    Gmt(#[from] GmtError),

    #[error(transparent)]
    Future(#[from] FutureError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Rmw(#[from] RmwError),

    #[error(transparent)]
    RetryFuseBlown(#[from] RetryFuseBlown),

    #[error("transport failure on pid {pid}: {reason}")]
    Transport { pid: Pid, reason: String },
}

impl RtError {
    /// Log at `error!` and abort the process, matching "a fatal error in a
    /// child aborts the whole process" — there is no unwinding across forks.
    pub fn abort(self) -> ! {
        log::error!("fatal runtime error: {self}");
        std::process::abort();
    }
}

pub type RtResult<T> = Result<T, RtError>;

/// Default retry fuse for busy-wait loops that have no
/// [`crate::config::RuntimeConfig`] in scope (pool plumbing constructed
/// before a config is threaded through, e.g. [`crate::joincounter`],
/// [`crate::distpool`], [`crate::future_pool`]). Call sites that do hold a
/// `RuntimeConfig` pass `cfg.retry_fuse` instead, so the fuse is
/// configurable everywhere the DSM engine itself spins (`Dsm`'s `rmw` and
/// `copy_v`'s owner-resolution loop).
pub const RETRY_FUSE: u32 = 100_000;

/// Poll the transport and count down a retry fuse; returns `Err` once the
/// fuse blows. Call sites pass a short, human-readable `what` for the error
/// plus the fuse ceiling to use (`cfg.retry_fuse` where a config is in
/// scope, [`RETRY_FUSE`] otherwise).
pub fn retry_or_fuse(
    pid: Pid,
    what: &'static str,
    fuse: u32,
    attempts: &mut u32,
) -> Result<(), RetryFuseBlown> {
    *attempts += 1;
    if *attempts >= fuse {
        return Err(RetryFuseBlown {
            pid,
            what,
            retries: *attempts,
        });
    }
    Ok(())
}
