//! Recursive divide-and-conquer matrix multiply over the DSM, ported from
//! `original_source/madm/examples/mm/mm.cc`'s `mm_rec`: split C's row range
//! in half until a leaf threshold, localize the row slabs of A/B/C involved,
//! run a dense kernel, commit C back. Argument parsing, timing, and
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

fn usage_exit() -> ! {
    eprintln!("usage: matmul N nprocs leaf_size");
    std::process::exit(64); // EX_USAGE
}

/// Recursively halve C's row range until `leaf` rows remain, then localize
/// the A/B/C row slabs involved, run the dense kernel, and commit C.
fn mm_rec(dsm: Arc<Dsm>, worker: &Worker, n: usize, leaf: usize, row_lo: usize, row_hi: usize) {
    let rows = row_hi - row_lo;
    if rows <= leaf {
        let row_bytes = n * 8;
        let a_base = GPtr::make_dist(A_ID, (row_lo * row_bytes) as u64);
        let b_base = GPtr::make_dist(B_ID, 0);
        let c_base = GPtr::make_dist(C_ID, (row_lo * row_bytes) as u64);

        let mut ha = gmt::cache_dir::LocalizeHandle::new();
        let mut hb = gmt::cache_dir::LocalizeHandle::new();
        let mut hc = gmt::cache_dir::LocalizeHandle::new();

        let a = dsm
            .localize_s(a_base, row_bytes as u64, rows, row_bytes, LocalizeFlags::Ro, &mut ha)
            .unwrap_or_else(|e| e.abort());
        let b = dsm
            .localize_s(b_base, row_bytes as u64, n, row_bytes, LocalizeFlags::Ro, &mut hb)
            .unwrap_or_else(|e| e.abort());
        let mut c = dsm
            .localize_s(c_base, row_bytes as u64, rows, row_bytes, LocalizeFlags::Own, &mut hc)
            .unwrap_or_else(|e| e.abort());

        for i in 0..rows {
            for k in 0..n {
                let a_ik = f64::from_le_bytes(a[(i * n + k) * 8..(i * n + k) * 8 + 8].try_into().unwrap());
                if a_ik == 0.0 {
                    continue;
                }
                for j in 0..n {
                    let b_kj = f64::from_le_bytes(b[(k * n + j) * 8..(k * n + j) * 8 + 8].try_into().unwrap());
                    let off = (i * n + j) * 8;
                    let prev = f64::from_le_bytes(c[off..off + 8].try_into().unwrap());
                    c[off..off + 8].copy_from_slice(&(prev + a_ik * b_kj).to_le_bytes());
                }
            }
        }

        dsm.commit_s(c_base, row_bytes as u64, rows, row_bytes, &c)
            .unwrap_or_else(|e| e.abort());
        dsm.unlocalize(&mut ha);
        dsm.unlocalize(&mut hb);
        dsm.unlocalize(&mut hc);
        return;
    }

    let mid = row_lo + rows / 2;
    let dsm1 = dsm.clone();
    worker
        .fork(
            move |w| mm_rec(dsm1, w, n, leaf, row_lo, mid),
            move |w, ()| mm_rec(dsm, w, n, leaf, mid, row_hi),
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

                let row_bytes = n * 8;
                let dist_a = Distribution::new(&[(row_bytes as u64, n as u64)], nprocs);
                let dist_b = Distribution::new(&[(row_bytes as u64, n as u64)], nprocs);
                let dist_c = Distribution::new(&[(row_bytes as u64, n as u64)], nprocs);
                gmt.install_dist(A_ID, dist_a, n * row_bytes).unwrap_or_else(|e| e.abort());
                gmt.install_dist(B_ID, dist_b, n * row_bytes).unwrap_or_else(|e| e.abort());
                gmt.install_dist(C_ID, dist_c, n * row_bytes).unwrap_or_else(|e| e.abort());

                let dsm = Arc::new(Dsm::new(transport.clone(), gmt, cfg));

                // Seed: A is the identity matrix, B is filled with 2.0, so
                // the expected result C is just B -- a cheap, exact check.
                let my_rows: Vec<usize> = (0..n).filter(|&r| r as u32 % nprocs == pid).collect();
                for r in my_rows {
                    let mut a_row = vec![0u8; row_bytes];
                    a_row[r * 8..r * 8 + 8].copy_from_slice(&1.0f64.to_le_bytes());
                    dsm.put(GPtr::make_dist(A_ID, (r * row_bytes) as u64), &a_row)
                        .unwrap_or_else(|e| e.abort());
                    let b_bytes: Vec<u8> = (0..n).flat_map(|_| 2.0f64.to_le_bytes()).collect();
                    dsm.put(GPtr::make_dist(B_ID, (r * row_bytes) as u64), &b_bytes)
                        .unwrap_or_else(|e| e.abort());
                    dsm.put(GPtr::make_dist(C_ID, (r * row_bytes) as u64), &vec![0u8; row_bytes])
                        .unwrap_or_else(|e| e.abort());
                }
                transport.barrier();

                let worker = pool.worker_for(pid, pid as u64 + 1);
                if pid == 0 {
                    worker
                        .fork(
                            {
                                let dsm = dsm.clone();
                                move |w| mm_rec(dsm, w, n, leaf, 0, n)
                            },
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
                    for r in 0..n {
                        let c_row = dsm
                            .get(GPtr::make_dist(C_ID, (r * row_bytes) as u64), row_bytes)
                            .unwrap_or_else(|e| e.abort());
                        for j in 0..n {
                            let v = f64::from_le_bytes(c_row[j * 8..j * 8 + 8].try_into().unwrap());
                            assert!((v - 2.0).abs() < 1e-9, "C[{r}][{j}] = {v}, expected 2.0");
                        }
                    }
                    log::info!("matmul demo ok: N={n} nprocs={nprocs} leaf={leaf}");
                }
            })
        })
        .collect();

    for t in threads {
        t.join().unwrap();
    }
}
