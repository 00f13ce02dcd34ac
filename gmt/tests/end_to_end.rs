//! Integration tests driving a `LocalTransport` cluster of several
//! simulated pids through the six scenarios enumerated in SPEC_FULL.md: a
//! first-touch `PUT` observed remotely, an `OWN` migration round trip, a
//! future handed between two processes through a forked task, concurrent
//! steal-correctness across a worker pool, a strided localize spanning
//! several owners, and an RMW counter incremented from several processes at
//! once.
//!
//! The DSM engine (`Gmt`/`Dsm`/`copy_v`) never calls a collective transport
//! primitive, so scenarios that only exercise it drive every simulated pid's
//! `Dsm` from a single test thread -- `LocalTransport::am_request` is a
//! direct synchronous call into the target pid's registered handler, so
//! there is no need for that pid to be its own OS thread. Scenarios that do
//! touch a collective (`FuturePool::new`'s `shared_alloc`) or need genuine
//! concurrency (the scheduler's steal loop, concurrent RMW) spawn one OS
//! thread per simulated pid, as the unit tests in `future_pool.rs` and
//! `scheduler/mod.rs` already do.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use gmt::cache_dir::LocalizeHandle;
use gmt::dsm::{LocalizeFlags, Mv};
use gmt::future_pool::{Future, FuturePool};
use gmt::gmt_table::Gmt;
use gmt::scheduler::Pool;
use gmt::transport::{LocalTransport, Transport};
use gmt::{Distribution, Dsm, GPtr, RuntimeConfig};

fn dsm_for(t: LocalTransport, nprocs: u32) -> Arc<Dsm> {
    let pid = t.pid();
    let transport: Arc<dyn Transport> = Arc::new(t);
    let gmt = Arc::new(Gmt::new(pid, nprocs));
    Arc::new(Dsm::new(transport, gmt, RuntimeConfig::default()))
}

fn init() {
    let _ = env_logger::try_init();
}

/// Scenario 1: a shared-local object's first-ever touch comes from a
/// process other than its home. The home elects the *remote* requester as
/// owner and replies with the block size from its own (correctly sized)
/// entry, since the requester's own placeholder entry never learned the
/// size -- this is the cross-process path the home-owned fast path inside
/// `copy_v` can't reach, and the one the first-touch buffer-sizing fix in
/// `copy_v` (see DESIGN.md) was written for.
#[test]
fn first_touch_from_non_home_process_then_home_reads_it_back() {
    init();
    let mut cluster = LocalTransport::new_cluster(2);
    let t1 = cluster.remove(1);
    let t0 = cluster.remove(0);

    let dsm0 = dsm_for(t0, 2);
    let g = dsm0.gmt().alloc_slocal(64).unwrap(); // home = pid 0

    // pid 1 touches it first, with pid 0 never having called put/get.
    let dsm1 = dsm_for(t1, 2);
    dsm1.put(g, &[5u8; 64]).unwrap();

    let seen = dsm0.get(g, 64).unwrap();
    assert_eq!(seen, vec![5u8; 64]);
}

/// Scenario 2: `OWN` migrates a block's owner away from its home, and a
/// subsequent access from the home has to fetch it back -- exercising both
/// the `OWNER_CHANGE` finalize step and the case where the fast local path
/// in `copy_v` no longer applies on the (un-owning) home.
#[test]
fn own_migration_round_trip_across_home_and_migrant() {
    init();
    let mut cluster = LocalTransport::new_cluster(2);
    let t1 = cluster.remove(1);
    let t0 = cluster.remove(0);

    let dist = Distribution::new(&[(64, 2)], 2);
    let obj_id = 1;
    let size = dist.total_size() as usize;

    let dsm0 = dsm_for(t0, 2);
    dsm0.gmt().install_dist(obj_id, dist.clone(), size).unwrap();
    let dsm1 = dsm_for(t1, 2);
    dsm1.gmt().install_dist(obj_id, dist, size).unwrap();

    let g = GPtr::make_dist(obj_id, 0); // block 0, home pid 0

    dsm0.put(g, &[1u8; 64]).unwrap();

    // pid 1 migrates the block to itself, bumps every byte, and commits.
    let mut h1 = LocalizeHandle::new();
    let mut buf = dsm1.localize(g, 64, LocalizeFlags::Own, &mut h1).unwrap();
    assert_eq!(buf, vec![1u8; 64]);
    for b in buf.iter_mut() {
        *b += 9;
    }
    dsm1.commit(g, &buf).unwrap();
    dsm1.unlocalize(&mut h1);

    // pid 0, the home but no longer the owner, must fetch the new value.
    let seen = dsm0.get(g, 64).unwrap();
    assert_eq!(seen, vec![10u8; 64]);

    // pid 0 migrates it back and mutates again, completing the round trip.
    let mut h0 = LocalizeHandle::new();
    let mut buf = dsm0.localize(g, 64, LocalizeFlags::Own, &mut h0).unwrap();
    assert_eq!(buf, vec![10u8; 64]);
    for b in buf.iter_mut() {
        *b += 1;
    }
    dsm0.commit(g, &buf).unwrap();
    dsm0.unlocalize(&mut h0);

    assert_eq!(dsm1.get(g, 64).unwrap(), vec![11u8; 64]);
}

/// Scenario 3: a task forked on one process resolves a future whose home is
/// a different process, and the consumer on the home blocks on `get` until
/// the value (and not just `done`) has actually landed.
#[test]
fn future_round_trip_between_forked_task_and_home() {
    init();
    let mut cluster = LocalTransport::new_cluster(2);
    let t1 = cluster.remove(1);
    let t0 = cluster.remove(0);

    // shared_alloc is collective: pid 1 only needs to rendezvous the same
    // two allocations `FuturePool::new` makes, the way
    // `remote_set_then_get_returns_id_to_home` does in future_pool.rs.
    let peer = thread::spawn(move || {
        let _ = t1.shared_alloc(1 << 16);
        let _ = t1.shared_alloc(gmt::distpool::DistPool::region_size(64));
    });
    let pool0 = FuturePool::new(Arc::new(t0), 1 << 16, 64);
    peer.join().unwrap();
    let pool_for_pool = Arc::new(pool0);

    let sched = Pool::new(&[0, 1], 64);
    let w0 = sched.worker_for(0, 1);

    let pool_child = pool_for_pool.clone();
    let handle = w0
        .fork(
            move |_w| {
                let f = Future::<u64>::make(&pool_child).unwrap();
                f.set(&pool_child, 41).unwrap();
                f
            },
            move |_w, f: Future<u64>| f,
        )
        .unwrap();

    let value = handle.get(&pool_for_pool).unwrap();
    assert_eq!(value, 41);
}

/// Scenario 4: many small forked tasks, stolen across a pool of several
/// worker threads, each run exactly once and contribute exactly their
/// expected amount to a shared accumulator -- steal correctness and
/// idempotence at the scheduler level rather than the single-deque level
/// `scheduler/deque.rs`'s unit test covers.
#[test]
fn steal_correctness_across_a_worker_pool() {
    init();
    const N_TASKS: u64 = 400;
    const N_WORKERS: u32 = 4;

    let pids: Vec<u32> = (0..N_WORKERS).collect();
    let pool = Pool::new(&pids, 1024);
    let total = Arc::new(AtomicU64::new(0));
    let done = Arc::new(AtomicU64::new(0));

    let helpers: Vec<_> = (1..N_WORKERS)
        .map(|pid| {
            let pool = pool.clone();
            let done = done.clone();
            thread::spawn(move || {
                let w = pool.worker_for(pid, pid as u64 + 1);
                while done.load(Ordering::Acquire) < N_TASKS {
                    w.try_help_once();
                }
            })
        })
        .collect();

    let w0 = pool.worker_for(0, 99);
    for i in 0..N_TASKS {
        let total = total.clone();
        let done = done.clone();
        w0.spawn(move |_w| {
            total.fetch_add(i, Ordering::AcqRel);
            done.fetch_add(1, Ordering::AcqRel);
        })
        .unwrap();
    }

    while done.load(Ordering::Acquire) < N_TASKS {
        w0.try_help_once();
    }
    for h in helpers {
        h.join().unwrap();
    }

    let expected: u64 = (0..N_TASKS).sum();
    assert_eq!(total.load(Ordering::Acquire), expected);
    assert_eq!(done.load(Ordering::Acquire), N_TASKS);
}

/// Scenario 5: a strided localize spanning rows that live on several
/// different owners in a block-cyclic distribution (one row per block, as
/// in `gptr::tests::one_dim_block_cyclic_home`) comes back as one
/// contiguous buffer in row order, and a matching `commit_s` writes every
/// row back to its correct owner.
#[test]
fn strided_localize_spans_several_owners() {
    init();
    const NPROCS: u32 = 4;
    const ELEM: u64 = 8; // one f64-sized element, though bytes only matter here
    const ROWS: u64 = 8;
    const COLS: u64 = 8;

    let row_bytes_u64 = COLS * ELEM;
    let dist = Distribution::new(&[(row_bytes_u64, ROWS)], NPROCS);
    let obj_id = 7;
    let size = dist.total_size() as usize;

    let cluster = LocalTransport::new_cluster(NPROCS);
    let dsms: Vec<Arc<Dsm>> = cluster
        .into_iter()
        .map(|t| {
            let dsm = dsm_for(t, NPROCS);
            dsm.gmt().install_dist(obj_id, dist.clone(), size).unwrap();
            dsm
        })
        .collect();

    // Seed every row from whichever process owns its block, with row `r`
    // filled with byte value `r`.
    let row_bytes = (COLS * ELEM) as usize;
    for r in 0..ROWS {
        let home = dist.home(r * row_bytes as u64);
        let g = GPtr::make_dist(obj_id, r * row_bytes as u64);
        dsms[home as usize].put(g, &vec![r as u8; row_bytes]).unwrap();
    }

    // pid 0 pulls all 8 rows via one strided localize.
    let base = GPtr::make_dist(obj_id, 0);
    let mut handle = LocalizeHandle::new();
    let mvs: Vec<Mv> = (0..ROWS)
        .map(|r| Mv {
            gptr: base.offset_by(r * row_bytes as u64),
            size: row_bytes,
        })
        .collect();
    let buf = dsms[0].localize_v(base, &mvs, LocalizeFlags::Ro, &mut handle).unwrap();
    for r in 0..ROWS {
        let off = (r as usize) * row_bytes;
        assert_eq!(&buf[off..off + row_bytes], vec![r as u8; row_bytes].as_slice());
    }
    dsms[0].unlocalize(&mut handle);

    // And localize_s/commit_s round-trip the same span, mutating every row.
    let mut handle = LocalizeHandle::new();
    let mut strided = dsms[0]
        .localize_s(base, row_bytes as u64, ROWS as usize, row_bytes, LocalizeFlags::RwShared, &mut handle)
        .unwrap();
    for b in strided.iter_mut() {
        *b = b.wrapping_add(100);
    }
    dsms[0]
        .commit_s(base, row_bytes as u64, ROWS as usize, row_bytes, &strided)
        .unwrap();
    dsms[0].unlocalize(&mut handle);

    for r in 0..ROWS {
        let home = dist.home(r * row_bytes as u64);
        let g = GPtr::make_dist(obj_id, r * row_bytes as u64);
        let seen = dsms[home as usize].get(g, row_bytes).unwrap();
        assert_eq!(seen, vec![(r as u8).wrapping_add(100); row_bytes]);
    }
}

/// Scenario 6: several processes concurrently `rmw` the same counter; each
/// increment must be applied exactly once regardless of which process
/// happens to hold ownership when it runs.
#[test]
fn rmw_counter_increments_exactly_once_from_every_process() {
    init();
    const NPROCS: u32 = 4;
    const PER_PROC: u64 = 250;

    let dist = Distribution::new(&[(8, 1)], NPROCS);
    let obj_id = 3;
    let size = dist.total_size() as usize;

    let cluster = LocalTransport::new_cluster(NPROCS);
    let dsms: Vec<Arc<Dsm>> = cluster
        .into_iter()
        .map(|t| {
            let dsm = dsm_for(t, NPROCS);
            dsm.gmt().install_dist(obj_id, dist.clone(), size).unwrap();
            dsm
        })
        .collect();

    let g = GPtr::make_dist(obj_id, 0);
    dsms[0].put(g, &0u64.to_le_bytes()).unwrap();

    let threads: Vec<_> = dsms
        .into_iter()
        .map(|dsm| {
            thread::spawn(move || {
                for _ in 0..PER_PROC {
                    dsm.rmw(g, 8, |buf| {
                        let v = u64::from_le_bytes(buf.try_into().unwrap());
                        buf.copy_from_slice(&(v + 1).to_le_bytes());
                    })
                    .unwrap();
                }
                dsm
            })
        })
        .collect();

    let dsms: Vec<Arc<Dsm>> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    let result = dsms[0].get(g, 8).unwrap();
    assert_eq!(u64::from_le_bytes(result.try_into().unwrap()), NPROCS as u64 * PER_PROC);
}
