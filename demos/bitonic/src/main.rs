//! Distributed bitonic sort over the DSM, ported from
//! `original_source/mgas/examples/bitonic_sort/bitonic_sort.cpp`'s
//! `bitonic_sort_recursive` / `bitonic_merge` / `bitonic_compare`: sort the
//! left half ascending and the right half descending (making the whole range
//! bitonic), then merge by recursively compare-exchanging halves down to a
//! leaf threshold. The original keeps two separate thresholds (one for when
//! to stop localizing through the cache, one for when to stop forking and
//! fall back to `std::sort`); this port collapses both into the single
//! `leaf` parameter, since a pure compare-exchange network already sorts
//! correctly all the way down to single elements and a thin demo has no
//! need for the extra tier. Argument parsing, timing, and verification are
//! the out-of-scope "CLI example" bits the core doesn't carry, so this
//! stays a thin `std::env::args` binary.

use std::sync::Arc;

use gmt::cache_dir::LocalizeHandle;
use gmt::dsm::{Dsm, LocalizeFlags};
use gmt::gptr::{Distribution, GPtr};
use gmt::scheduler::{Pool, Worker};
use gmt::transport::{LocalTransport, Transport};
use gmt::RuntimeConfig;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

const ARR_ID: u32 = 1;
const BLOCK_ELEMS: usize = 64;

fn usage_exit() -> ! {
    eprintln!("usage: bitonic N nprocs leaf_elems");
    std::process::exit(64); // EX_USAGE
}

/// Compare-exchange `left[0..len)` against `right[0..len)` elementwise,
/// swapping a pair when it's out of `asc` order. Splits in half and forks
/// until `len <= leaf`, then localizes both sides and does the swap.
fn compare_exchange(dsm: Arc<Dsm>, worker: &Worker, asc: bool, left: GPtr, right: GPtr, len: usize, leaf: usize) {
    if len == 0 {
        return;
    }
    if len <= leaf {
        let size = len * 4;
        let mut hl = LocalizeHandle::new();
        let mut hr = LocalizeHandle::new();
        let mut lbuf = dsm.localize(left, size, LocalizeFlags::Own, &mut hl).unwrap_or_else(|e| e.abort());
        let mut rbuf = dsm.localize(right, size, LocalizeFlags::Own, &mut hr).unwrap_or_else(|e| e.abort());

        for i in 0..len {
            let off = i * 4;
            let lv = i32::from_le_bytes(lbuf[off..off + 4].try_into().unwrap());
            let rv = i32::from_le_bytes(rbuf[off..off + 4].try_into().unwrap());
            if (asc && lv > rv) || (!asc && lv < rv) {
                lbuf[off..off + 4].copy_from_slice(&rv.to_le_bytes());
                rbuf[off..off + 4].copy_from_slice(&lv.to_le_bytes());
            }
        }

        dsm.commit(left, &lbuf).unwrap_or_else(|e| e.abort());
        dsm.commit(right, &rbuf).unwrap_or_else(|e| e.abort());
        dsm.unlocalize(&mut hl);
        dsm.unlocalize(&mut hr);
        return;
    }

    let half = len / 2;
    let half_bytes = (half * 4) as u64;
    let (l2, r2) = (left.offset_by(half_bytes), right.offset_by(half_bytes));
    let dsm1 = dsm.clone();
    worker
        .fork(
            move |w| compare_exchange(dsm1, w, asc, left, right, half, leaf),
            move |w, ()| compare_exchange(dsm, w, asc, l2, r2, len - half, leaf),
        )
        .unwrap_or_else(|e| e.abort());
}

/// Merge a bitonic range of `len` elements starting at `base` into `asc`
/// order: compare-exchange the two halves against each other, then
/// recursively merge each half on its own.
fn bitonic_merge(dsm: Arc<Dsm>, worker: &Worker, asc: bool, base: GPtr, len: usize, leaf: usize) {
    if len <= 1 {
        return;
    }
    let half = len / 2;
    let half_bytes = (half * 4) as u64;
    let right = base.offset_by(half_bytes);

    compare_exchange(dsm.clone(), worker, asc, base, right, half, leaf);

    let dsm1 = dsm.clone();
    worker
        .fork(
            move |w| bitonic_merge(dsm1, w, asc, base, half, leaf),
            move |w, ()| bitonic_merge(dsm, w, asc, right, len - half, leaf),
        )
        .unwrap_or_else(|e| e.abort());
}

/// Sort `base[0..len)` into `asc` order: sort the left half ascending and
/// the right half descending to form a bitonic sequence, then merge.
fn bitonic_sort_rec(dsm: Arc<Dsm>, worker: &Worker, asc: bool, base: GPtr, len: usize, leaf: usize) {
    if len <= 1 {
        return;
    }
    let half = len / 2;
    let half_bytes = (half * 4) as u64;
    let right = base.offset_by(half_bytes);

    let dsm1 = dsm.clone();
    let dsm2 = dsm.clone();
    worker
        .fork(
            move |w| bitonic_sort_rec(dsm1, w, true, base, half, leaf),
            move |w, ()| bitonic_sort_rec(dsm2, w, false, right, len - half, leaf),
        )
        .unwrap_or_else(|e| e.abort());

    bitonic_merge(dsm, worker, asc, base, len, leaf);
}

fn main() {
    let _ = env_logger::try_init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 4 {
        usage_exit();
    }
    let n: usize = args[1].parse().unwrap_or_else(|_| usage_exit());
    let nprocs: u32 = args[2].parse().unwrap_or_else(|_| usage_exit());
    let leaf: usize = args[3].parse().unwrap_or_else(|_| usage_exit());
    if !n.is_power_of_two() {
        eprintln!("N must be a power of two");
        std::process::exit(64);
    }
    if n % BLOCK_ELEMS != 0 {
        eprintln!("N must be a multiple of {BLOCK_ELEMS}");
        std::process::exit(64);
    }

    let cluster = LocalTransport::new_cluster(nprocs);
    let pids: Vec<u32> = (0..nprocs).collect();
    let cfg = RuntimeConfig::default();
    let pool = Pool::new(&pids, cfg.deque_capacity);

    let threads: Vec<_> = cluster
        .into_iter()
        .map(|t| {
            let pool = pool.clone();
            let cfg = cfg.clone();
            std::thread::spawn(move || {
                let pid = t.pid();
                let transport: Arc<dyn Transport> = Arc::new(t);
                let gmt = Arc::new(gmt::Gmt::new(pid, nprocs));

                let block_bytes = (BLOCK_ELEMS * 4) as u64;
                let n_blocks = (n * 4) as u64 / block_bytes;
                let dist = Distribution::new(&[(block_bytes, n_blocks)], nprocs);
                gmt.install_dist(ARR_ID, dist, n * 4).unwrap_or_else(|e| e.abort());

                let dsm = Arc::new(Dsm::new(transport.clone(), gmt, cfg));

                // First touch: each pid seeds the blocks it owns with
                // pseudo-random keys. Duplicates are fine for a sort.
                let mut rng = SmallRng::seed_from_u64(pid as u64);
                for block in (0..n_blocks).filter(|&b| (b as u32) % nprocs == pid) {
                    let off = block * block_bytes;
                    let bytes: Vec<u8> = (0..BLOCK_ELEMS)
                        .flat_map(|_| rng.gen_range(0..1_000_000i32).to_le_bytes())
                        .collect();
                    dsm.put(GPtr::make_dist(ARR_ID, off), &bytes).unwrap_or_else(|e| e.abort());
                }
                transport.barrier();

                let worker = pool.worker_for(pid, pid as u64 + 1);
                if pid == 0 {
                    let dsm_root = dsm.clone();
                    worker
                        .fork(
                            move |w| bitonic_sort_rec(dsm_root, w, true, GPtr::make_dist(ARR_ID, 0), n, leaf),
                            |_w, ()| (),
                        )
                        .unwrap_or_else(|e| e.abort());
                } else {
                    let mut spins = 0u64;
                    while spins < 50_000_000 {
                        if !worker.try_help_once() {
                            std::thread::yield_now();
                        }
                        spins += 1;
                    }
                }
                transport.barrier();

                if pid == 0 {
                    let whole = dsm.get(GPtr::make_dist(ARR_ID, 0), n * 4).unwrap_or_else(|e| e.abort());
                    let keys: Vec<i32> = (0..n)
                        .map(|i| i32::from_le_bytes(whole[i * 4..i * 4 + 4].try_into().unwrap()))
                        .collect();
                    assert!(keys.windows(2).all(|w| w[0] <= w[1]), "array not sorted: {keys:?}");
                    log::info!("bitonic demo ok: N={n} nprocs={nprocs} leaf={leaf}");
                }
            })
        })
        .collect();

    for t in threads {
        t.join().unwrap();
    }
}
