//! The transport abstraction.
//!
//! The real system treats the transport as an opaque RDMA/active-message
//! primitive, which this crate does not reimplement. [`Transport`] is the
//! narrow surface the rest of the runtime is written against; [`local`]
//! supplies the one implementation this crate ships, modeled on GASNet's
//! "smp" conduit (see `original_source/comm/src/gasnet_ext.cc`): peers are
//! OS threads inside a single process and puts/gets are plain memory
//! copies guarded by locks instead of real network I/O.

pub mod local;

pub use local::LocalTransport;

/// A dense, stable-for-the-run process identifier.
pub type Pid = u32;

/// A symmetric allocation: every peer holds an equally-sized region at the
/// same logical address, reachable from any peer via [`Transport::put`]/
/// [`Transport::get`]. Backs the future pool and dist-pool.
pub trait SymmetricRegion: Send + Sync {
    fn size_per_peer(&self) -> usize;
}

/// Reduction operator for [`Transport::reduce_long`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
}

/// A registered active-message handler: given the sending pid and the
/// request payload, produce a reply payload. Runs inside the receiver's
/// progress context, serialized per receiver.
pub type AmHandler = dyn Fn(Pid, &[u8]) -> Vec<u8> + Send + Sync;

/// The portable transport surface every other subsystem is written against.
///
/// Failure is fatal: implementations should abort rather than return
/// an error for genuine transport failures; `Result` is reserved for the
/// runtime's own retry/fuse logic, not transport plumbing.
pub trait Transport: Send + Sync {
    fn pid(&self) -> Pid;
    fn nprocs(&self) -> u32;

    /// Advance incoming message processing. Callable from any thread; must
    /// not be called recursively from inside a handler it is driving.
    fn poll(&self);

    fn shared_alloc(&self, size_per_peer: usize) -> local::SharedRegion;

    fn put(&self, region: &local::SharedRegion, offset: usize, src: &[u8], target: Pid);
    fn get(&self, region: &local::SharedRegion, offset: usize, dst: &mut [u8], target: Pid);

    fn put_value_u64(&self, region: &local::SharedRegion, offset: usize, value: u64, target: Pid);
    fn get_value_u64(&self, region: &local::SharedRegion, offset: usize, target: Pid) -> u64;

    /// Atomic `prev = *addr; *addr += delta; return prev` at `target`.
    fn fetch_and_add_u64(
        &self,
        region: &local::SharedRegion,
        offset: usize,
        delta: i64,
        target: Pid,
    ) -> u64;

    /// Register the handler for `handler_id`, scoped to messages addressed
    /// to *this* pid.
    fn register_handler(&self, handler_id: u32, handler: Box<AmHandler>);

    /// Synchronous request/reply active message (folds `am_request` +
    /// exactly-one `am_reply` from §4.1 into one call, since this transport
    /// runs in-process rather than over a real network).
    fn am_request(&self, target: Pid, handler_id: u32, payload: &[u8]) -> Vec<u8>;

    fn barrier(&self);
    fn broadcast(&self, root: Pid, data: &[u8]) -> Vec<u8>;
    fn gather(&self, root: Pid, data: &[u8]) -> Option<Vec<Vec<u8>>>;
    fn reduce_long(&self, value: i64, op: ReduceOp) -> i64;
}
