//! STREAM-like distributed daxpy (`C[i] += A[i] * B[i]`), ported from
//! `original_source/mgas/examples/stream/stream.c`'s `daxpy_rec`: each
//! process owns a contiguous slice of three distributed vectors and
//! recursively halves its own slice until a leaf threshold, localizing and
//! committing through the DSM at each leaf. Argument parsing, timing, and
//! verification are the out-of-scope "CLI example" bits the core doesn't
//! carry, so this stays a thin `std::env::args` binary.

use std::sync::Arc;

use gmt::dsm::{Dsm, LocalizeFlags};
use gmt::gptr::{Distribution, GPtr};
use gmt::scheduler::{Pool, Worker};
use gmt::transport::{LocalTransport, Transport};
use gmt::RuntimeConfig;

const A_ID: u32 = 1;
const B_ID: u32 = 2;
const C_ID: u32 = 3;
const BLOCK_ELEMS: usize = 512; // 4096 bytes/block, matching the original's N_LEAF-sized blocks

fn usage_exit() -> ! {
    eprintln!("usage: stream N nprocs leaf_elems");
    std::process::exit(64); // EX_USAGE
}

/// Halve `[a, b, c)` (each `n` `f64`s long) until `leaf` elements remain,
/// then localize, run the daxpy kernel, and commit.
fn daxpy_rec(dsm: Arc<Dsm>, worker: &Worker, a: GPtr, b: GPtr, c: GPtr, n: usize, leaf: usize) {
    if n <= leaf {
        let size = n * 8;
        let mut ha = gmt::cache_dir::LocalizeHandle::new();
        let mut hb = gmt::cache_dir::LocalizeHandle::new();
        let mut hc = gmt::cache_dir::LocalizeHandle::new();

        let abuf = dsm.localize(a, size, LocalizeFlags::Ro, &mut ha).unwrap_or_else(|e| e.abort());
        let bbuf = dsm.localize(b, size, LocalizeFlags::Ro, &mut hb).unwrap_or_else(|e| e.abort());
        let mut cbuf = dsm.localize(c, size, LocalizeFlags::Own, &mut hc).unwrap_or_else(|e| e.abort());

        for i in 0..n {
            let off = i * 8;
            let av = f64::from_le_bytes(abuf[off..off + 8].try_into().unwrap());
            let bv = f64::from_le_bytes(bbuf[off..off + 8].try_into().unwrap());
            let cv = f64::from_le_bytes(cbuf[off..off + 8].try_into().unwrap());
            cbuf[off..off + 8].copy_from_slice(&(cv + av * bv).to_le_bytes());
        }

        dsm.commit(c, &cbuf).unwrap_or_else(|e| e.abort());
        dsm.unlocalize(&mut ha);
        dsm.unlocalize(&mut hb);
        dsm.unlocalize(&mut hc);
        return;
    }

    let half = n / 2;
    let half_bytes = (half * 8) as u64;
    let (a1, b1, c1) = (a, b, c);
    let (a2, b2, c2) = (a.offset_by(half_bytes), b.offset_by(half_bytes), c.offset_by(half_bytes));
    let dsm1 = dsm.clone();
    worker
        .fork(
            move |w| daxpy_rec(dsm1, w, a1, b1, c1, half, leaf),
            move |w, ()| daxpy_rec(dsm, w, a2, b2, c2, n - half, leaf),
        )
        .unwrap_or_else(|e| e.abort());
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

                let block_bytes = (BLOCK_ELEMS * 8) as u64;
                let n_blocks = (n * 8) as u64 / block_bytes;
                let total_size = n * 8;
                for id in [A_ID, B_ID, C_ID] {
                    let dist = Distribution::new(&[(block_bytes, n_blocks)], nprocs);
                    gmt.install_dist(id, dist, total_size).unwrap_or_else(|e| e.abort());
                }

                let dsm = Arc::new(Dsm::new(transport.clone(), gmt, cfg));

                // Block-cyclic first touch: seed A=2, B=4, C=6 on every
                // block this pid owns, matching the expected C = 6 + 2*4.
                let n_block_elems = BLOCK_ELEMS as u64;
                for block in (0..n_blocks).filter(|&b| (b as u32) % nprocs == pid) {
                    let off = block * block_bytes;
                    let seed = |id: u32, v: f64| {
                        let bytes: Vec<u8> = (0..n_block_elems).flat_map(|_| v.to_le_bytes()).collect();
                        dsm.put(GPtr::make_dist(id, off), &bytes).unwrap_or_else(|e| e.abort());
                    };
                    seed(A_ID, 2.0);
                    seed(B_ID, 4.0);
                    seed(C_ID, 6.0);
                }
                transport.barrier();

                let worker = pool.worker_for(pid, pid as u64 + 1);
                let my_n = n / nprocs as usize;
                let rem = n % nprocs as usize;
                let my_start_elems = pid as usize * my_n + (pid as usize).min(rem);
                let my_n = my_n + if (pid as usize) < rem { 1 } else { 0 };
                if my_n > 0 {
                    let base = (my_start_elems * 8) as u64;
                    let a0 = GPtr::make_dist(A_ID, base);
                    let b0 = GPtr::make_dist(B_ID, base);
                    let c0 = GPtr::make_dist(C_ID, base);
                    let dsm_for_rec = dsm.clone();
                    worker
                        .fork(
                            move |w| daxpy_rec(dsm_for_rec, w, a0, b0, c0, my_n, leaf),
                            |_w, ()| (),
                        )
                        .unwrap_or_else(|e| e.abort());
                }
                transport.barrier();

                if pid == 0 {
                    for block in 0..n_blocks {
                        let off = block * block_bytes;
                        let c = dsm
                            .get(GPtr::make_dist(C_ID, off), block_bytes as usize)
                            .unwrap_or_else(|e| e.abort());
                        for i in 0..BLOCK_ELEMS {
                            let v = f64::from_le_bytes(c[i * 8..i * 8 + 8].try_into().unwrap());
                            assert!((v - 14.0).abs() < 1e-9, "C[{}] = {v}, expected 14.0", block as usize * BLOCK_ELEMS + i);
                        }
                    }
                    log::info!("stream demo ok: N={n} nprocs={nprocs} leaf={leaf}");
                }
            })
        })
        .collect();

    for t in threads {
        t.join().unwrap();
    }
}
