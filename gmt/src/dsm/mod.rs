//! The DSM engine: `localize`/`commit`/`unlocalize`, the
//! one-shot `put`/`get`/`set`, and `rmw`.

mod copy;

pub use copy::{register_handlers, CopyPair};

use std::sync::Arc;

use crate::cache_dir::{CacheDirectory, LocalizeHandle};
use crate::config::RuntimeConfig;
use crate::error::{retry_or_fuse, RmwError, RtResult};
use crate::gmt_table::Gmt;
use crate::gptr::GPtr;
use crate::transport::Transport;
use crate::wire::Access;

/// `localize` flags: a subset of `{RO, RW-shared, OWN}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalizeFlags {
    /// Reuse an existing cache if one covers the block set.
    Ro,
    /// Force a fresh `GET` from the current owner(s) even if a cache exists.
    RwShared,
    /// `RW-shared`, and additionally migrate ownership to this process.
    Own,
}

impl LocalizeFlags {
    fn access(self) -> Access {
        match self {
            LocalizeFlags::Ro | LocalizeFlags::RwShared => Access::Get,
            LocalizeFlags::Own => Access::Own,
        }
    }
}

/// One `{gptr, size}` element of a `localize_v`/`commit_v` scatter-gather
/// vector.
#[derive(Debug, Clone, Copy)]
pub struct Mv {
    pub gptr: GPtr,
    pub size: usize,
}

/// The DSM engine for one process: GMT + cache directory + transport.
pub struct Dsm {
    pid: crate::transport::Pid,
    transport: Arc<dyn Transport>,
    gmt: Arc<Gmt>,
    cache_dir: Arc<CacheDirectory>,
    cfg: RuntimeConfig,
}

impl Dsm {
    pub fn new(transport: Arc<dyn Transport>, gmt: Arc<Gmt>, cfg: RuntimeConfig) -> Self {
        let cache_dir = Arc::new(CacheDirectory::new());
        register_handlers(transport.as_ref(), gmt.clone());
        Self {
            pid: transport.pid(),
            transport,
            gmt,
            cache_dir,
            cfg,
        }
    }

    pub fn gmt(&self) -> &Arc<Gmt> {
        &self.gmt
    }

    /// `localize(gptr, size, flags, &handle) -> *u8`: the
    /// single-range special case of [`Dsm::localize_v`].
    pub fn localize(
        &self,
        g: GPtr,
        size: usize,
        flags: LocalizeFlags,
        handle: &mut LocalizeHandle,
    ) -> RtResult<Vec<u8>> {
        self.localize_v(g, &[Mv { gptr: g, size }], flags, handle)
    }

    /// `localize_v`, the vector form of localize. Returns the
    /// contiguous cache buffer covering every block the vector touches;
    /// `g` must be one of the gptrs in `mvs` and is used only to anchor the
    /// returned buffer's relative offset for callers that want it (the
    /// whole buffer is returned here since Rust has no raw base-pointer
    /// arithmetic to hand back).
    pub fn localize_v(
        &self,
        g: GPtr,
        mvs: &[Mv],
        flags: LocalizeFlags,
        handle: &mut LocalizeHandle,
    ) -> RtResult<Vec<u8>> {
        let obj_id = if g.is_dist() { g.dist_id() } else { g.slocal_id() };

        let mut blocks: Vec<u64> = mvs
            .iter()
            .map(|mv| {
                let base = self.gmt.calc_block_base(mv.gptr);
                if base.is_dist() {
                    base.dist_offset()
                } else {
                    0
                }
            })
            .collect();
        blocks.sort_unstable();
        blocks.dedup();

        if flags != LocalizeFlags::Ro {
            if let Some(existing) = self.cache_dir.acquire_existing(obj_id, &blocks) {
                self.cache_dir.release(&existing);
            }
        } else if let Some(existing) = self.cache_dir.acquire_existing(obj_id, &blocks) {
            let buf = existing.buf.read().unwrap().clone();
            handle.push(existing);
            return Ok(buf);
        }

        let min_base = self.gmt.calc_block_base(mvs.iter().map(|m| m.gptr).min().unwrap());
        let max_mv = mvs
            .iter()
            .max_by_key(|m| m.gptr.0)
            .copied()
            .expect("mvs is non-empty");
        let block_size = self.gmt.calc_block_size(max_mv.gptr);
        let span = (self.gmt.calc_block_offset(max_mv.gptr) as usize + max_mv.size)
            .max(block_size)
            + (mvs
                .iter()
                .map(|m| {
                    let base_off = if self.gmt.calc_block_base(m.gptr).is_dist() {
                        self.gmt.calc_block_base(m.gptr).dist_offset()
                    } else {
                        0
                    };
                    let min_off = if min_base.is_dist() { min_base.dist_offset() } else { 0 };
                    base_off - min_off
                })
                .max()
                .unwrap_or(0) as usize);

        let mut buf = vec![0u8; span];
        let pairs: Vec<CopyPair> = mvs
            .iter()
            .map(|m| {
                let base_off = if min_base.is_dist() { min_base.dist_offset() } else { 0 };
                let my_base = if self.gmt.calc_block_base(m.gptr).is_dist() {
                    self.gmt.calc_block_base(m.gptr).dist_offset()
                } else {
                    0
                };
                let data_offset = (my_base - base_off) as usize + self.gmt.calc_block_offset(m.gptr) as usize;
                CopyPair {
                    gptr: m.gptr,
                    data_offset,
                    size: m.size,
                }
            })
            .collect();

        copy::copy_v(self.transport.as_ref(), &self.gmt, &pairs, &mut buf, flags.access(), &self.cfg)?;

        let record = self.cache_dir.insert_new(obj_id, min_base, blocks, buf.clone());
        handle.push(record);
        Ok(buf)
    }

    /// `localize_s`: the strided alias of `localize_v`, built
    /// from `calc_row_size`'s bytes-per-row convention (§11).
    pub fn localize_s(
        &self,
        g: GPtr,
        stride: u64,
        rows: usize,
        row_bytes: usize,
        flags: LocalizeFlags,
        handle: &mut LocalizeHandle,
    ) -> RtResult<Vec<u8>> {
        let mvs: Vec<Mv> = (0..rows)
            .map(|r| Mv {
                gptr: g.offset_by(r as u64 * stride),
                size: row_bytes,
            })
            .collect();
        self.localize_v(g, &mvs, flags, handle)
    }

    /// `commit(gptr, local_buf, size)`: write a locally
    /// modified buffer back to the owner(s).
    pub fn commit(&self, g: GPtr, local_buf: &[u8]) -> RtResult<()> {
        self.commit_v(&[Mv { gptr: g, size: local_buf.len() }], local_buf)
    }

    pub fn commit_v(&self, mvs: &[Mv], local_buf: &[u8]) -> RtResult<()> {
        let mut data = local_buf.to_vec();
        let mut offset = 0usize;
        let pairs: Vec<CopyPair> = mvs
            .iter()
            .map(|m| {
                let pair = CopyPair {
                    gptr: m.gptr,
                    data_offset: offset,
                    size: m.size,
                };
                offset += m.size;
                pair
            })
            .collect();
        copy::copy_v(self.transport.as_ref(), &self.gmt, &pairs, &mut data, Access::Put, &self.cfg)
    }

    pub fn commit_s(
        &self,
        g: GPtr,
        stride: u64,
        rows: usize,
        row_bytes: usize,
        local_buf: &[u8],
    ) -> RtResult<()> {
        let mvs: Vec<Mv> = (0..rows)
            .map(|r| Mv {
                gptr: g.offset_by(r as u64 * stride),
                size: row_bytes,
            })
            .collect();
        self.commit_v(&mvs, local_buf)
    }

    /// `unlocalize(&handle)`: pop the handle's localize LIFO.
    pub fn unlocalize(&self, handle: &mut LocalizeHandle) {
        handle.unlocalize_all(&self.cache_dir);
    }

    /// One-shot `put`/`get`/`set`: bypass the cache directory
    /// entirely, same transfer protocol, no caching.
    pub fn put(&self, g: GPtr, src: &[u8]) -> RtResult<()> {
        let mut data = src.to_vec();
        let pair = CopyPair { gptr: g, data_offset: 0, size: src.len() };
        copy::copy_v(self.transport.as_ref(), &self.gmt, &[pair], &mut data, Access::Put, &self.cfg)
    }

    pub fn get(&self, g: GPtr, size: usize) -> RtResult<Vec<u8>> {
        let mut data = vec![0u8; size];
        let pair = CopyPair { gptr: g, data_offset: 0, size };
        copy::copy_v(self.transport.as_ref(), &self.gmt, &[pair], &mut data, Access::Get, &self.cfg)?;
        Ok(data)
    }

    pub fn set(&self, g: GPtr, src: &[u8]) -> RtResult<()> {
        self.put(g, src)
    }

    /// `rmw(fn, gptr, size, param_in, param_out)`: atomically
    /// apply `op` to the owner's page under the page write-lock; if not
    /// owned locally, forward the operator itself (spec §9's "dynamic
    /// dispatch of RMW functions": a handler id plus a bounded payload) to
    /// the current owner and have it run there under that owner's page
    /// lock, never splitting the read and the write-back across a
    /// `localize`/`commit` pair.
    pub fn rmw(
        &self,
        g: GPtr,
        size: usize,
        op: impl Fn(&mut [u8]) + Send + Sync + 'static,
    ) -> RtResult<()> {
        let op: Arc<copy::RmwOp> = Arc::new(op);
        let mut attempts = 0u32;
        loop {
            let base = self.gmt.calc_block_base(g);
            let entry = self.gmt.find_entry(base);
            let local_off = self.gmt.calc_block_offset(g) as usize;

            // Check `state` from inside the write-lock guard, never from a
            // separate `state()` call beforehand: a concurrent OWN migration
            // (`handle_data_req`'s `Access::Own` arm) can take the buffer and
            // flip this entry to `Invalid` in between, so `try_write()`
            // succeeding is not itself proof the page is still ours.
            match entry.try_write() {
                Some(mut guard) if guard.state == crate::gmt_table::PageState::Owned => {
                    let buf = guard.buf.as_mut().expect("OWNED implies a buffer");
                    op(&mut buf[local_off..local_off + size]);
                    return Ok(());
                }
                Some(_) | None => {}
            }

            // Not owned locally (or lost the race above): resolve the
            // current owner through the home and forward the operator to
            // run under that owner's own page lock.
            let (owner, block_size) = copy::resolve_owner(self.transport.as_ref(), &self.gmt, g, &self.cfg);
            if owner == crate::gmt_table::INVALID_PID {
                // This resolve itself first-touched the page and elected us
                // owner at the home; materialize it locally (sized from the
                // home's reply, since a non-home process may never have
                // learned this block's size any other way) and apply `op`
                // in the same critical section rather than round-tripping
                // through the AM path for a page nobody else has ever seen.
                entry.materialize_owned_and(block_size, |buf| op(&mut buf[local_off..local_off + size]));
                return Ok(());
            }
            if owner == crate::gmt_table::MIGRATING || owner == self.pid {
                self.transport.poll();
                retry_or_fuse(self.pid, "rmw: owner migrating", self.cfg.retry_fuse, &mut attempts)?;
                continue;
            }

            if !copy::forward_rmw(self.transport.as_ref(), owner, g, size, op.clone(), &self.cfg) {
                self.transport.poll();
                retry_or_fuse(self.pid, "rmw: owner busy or migrated", self.cfg.retry_fuse, &mut attempts)?;
                continue;
            }
            return Ok(());
        }
    }
}

/// The scheduler's [`crate::scheduler::StealCallbacks`] for this DSM, covering
/// the design question of rebinding the per-task "localize handle chain"
/// across a steal. The original keeps that chain as implicit per-worker state
/// and must splice it onto whichever stack a continuation resumes on; here
/// [`LocalizeHandle`] is instead an explicit value the forked closures
/// capture and carry themselves, so it already moves with the continuation
/// through ordinary Rust ownership — there is nothing left to splice. These
/// callbacks exist to keep the boundary observable for diagnostics.
pub struct DsmStealCallbacks;

impl crate::scheduler::StealCallbacks for DsmStealCallbacks {
    fn at_parent_is_stolen(&self, worker: &crate::scheduler::Worker) {
        log::trace!(
            "pid {}: continuation stolen; its localize handle chain travels with the closure",
            worker.pid()
        );
    }

    fn at_thread_resuming(&self, worker: &crate::scheduler::Worker) {
        log::trace!("pid {}: resuming a stolen continuation", worker.pid());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmt_table::Gmt;
    use crate::gptr::Distribution;
    use crate::transport::LocalTransport;

    fn one_pid() -> (Arc<dyn Transport>, Arc<Gmt>) {
        let mut cluster = LocalTransport::new_cluster(1);
        let t: Arc<dyn Transport> = Arc::new(cluster.remove(0));
        let gmt = Arc::new(Gmt::new(t.pid(), t.nprocs()));
        (t, gmt)
    }

    #[test]
    fn first_touch_put_then_localize_ro_sees_it() {
        let (t, gmt) = one_pid();
        let dist = Distribution::new(&[(64, 2)], 1);
        gmt.install_dist(1, dist, 128).unwrap();
        let dsm = Dsm::new(t, gmt, RuntimeConfig::default());

        let g = GPtr::make_dist(1, 0);
        dsm.put(g, &[7u8; 64]).unwrap();

        let mut handle = LocalizeHandle::new();
        let buf = dsm.localize(g, 64, LocalizeFlags::Ro, &mut handle).unwrap();
        assert_eq!(buf, vec![7u8; 64]);
        dsm.unlocalize(&mut handle);
    }

    #[test]
    fn rmw_applies_exactly_once() {
        let (t, gmt) = one_pid();
        let dist = Distribution::new(&[(8, 1)], 1);
        gmt.install_dist(1, dist, 8).unwrap();
        let dsm = Dsm::new(t, gmt, RuntimeConfig::default());
        let g = GPtr::make_dist(1, 0);
        dsm.put(g, &0u64.to_le_bytes()).unwrap();

        for _ in 0..10 {
            dsm.rmw(g, 8, |buf| {
                let v = u64::from_le_bytes(buf.try_into().unwrap());
                buf.copy_from_slice(&(v + 1).to_le_bytes());
            })
            .unwrap();
        }

        let result = dsm.get(g, 8).unwrap();
        assert_eq!(u64::from_le_bytes(result.try_into().unwrap()), 10);
    }

    /// A forked child that calls into the DSM still completes correctly when
    /// its continuation is stolen onto another worker, with
    /// [`DsmStealCallbacks`] installed on the pool.
    #[test]
    fn dsm_call_survives_continuation_steal() {
        use crate::scheduler::Pool;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::thread;

        let (t, gmt) = one_pid();
        let dist = Distribution::new(&[(64, 1)], 1);
        gmt.install_dist(1, dist, 64).unwrap();
        let dsm = Arc::new(Dsm::new(t, gmt, RuntimeConfig::default()));

        let pool = Pool::new(&[0, 1], 1024);
        pool.set_callbacks(Arc::new(DsmStealCallbacks));

        let done = Arc::new(AtomicUsize::new(0));
        let p1 = pool.clone();
        let done1 = done.clone();
        let thief = thread::spawn(move || {
            let w1 = p1.worker_for(1, 2);
            let mut spins = 0;
            while done1.load(Ordering::SeqCst) == 0 && spins < 2_000_000 {
                w1.try_help_once();
                spins += 1;
            }
        });

        let w0 = pool.worker_for(0, 1);
        let g = GPtr::make_dist(1, 0);
        let dsm_child = dsm.clone();
        let dsm_cont = dsm.clone();
        let done2 = done.clone();
        let r = w0
            .fork(
                move |_w| {
                    dsm_child.put(g, &[9u8; 64]).unwrap();
                    thread::yield_now();
                    g
                },
                move |_w, g: GPtr| {
                    let mut handle = LocalizeHandle::new();
                    let buf = dsm_cont.localize(g, 64, LocalizeFlags::Ro, &mut handle).unwrap();
                    dsm_cont.unlocalize(&mut handle);
                    done2.store(1, Ordering::SeqCst);
                    buf
                },
            )
            .unwrap();

        assert_eq!(r, vec![9u8; 64]);
        thief.join().unwrap();
    }
}
