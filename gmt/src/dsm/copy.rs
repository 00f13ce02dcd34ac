//! The generic copy protocol and the
//! active-message handlers that answer it on the owning/home side.
//!
//! `LocalTransport::am_request` is synchronous (one in-process call
//! standing in for a request followed by exactly one reply), so the
//! `OWNER_RES`/`DATA_RES` replies here carry the transferred bytes inline
//! instead of the original's "reply triggers a separate vector RDMA
//! transfer" shape — a deliberate simplification recorded in DESIGN.md,
//! not a change to the protocol's visible behavior.

use std::collections::HashMap;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::config::RuntimeConfig;
use crate::error::{retry_or_fuse, RtResult};
use crate::gmt_table::{Gmt, INVALID_PID, MIGRATING};
use crate::gptr::GPtr;
use crate::transport::{Pid, Transport};
use crate::wire::{Access, FragmentHeader, Reassembler};
use zerocopy::FromBytes;

/// Every active message sent through [`send_am`] carries one [`FragmentHeader`]
/// per chunk, even when it fits in a single chunk — this keeps the wire
/// format uniform instead of needing a second, header-less encoding for the
/// common case.
static NEXT_MSG_ID: AtomicU32 = AtomicU32::new(0);

pub const OWNER_REQ_HANDLER: u32 = crate::wire::MsgTag::OwnerReq as u32;
pub const DATA_REQ_HANDLER: u32 = crate::wire::MsgTag::DataReq as u32;
pub const OWNER_CHANGE_HANDLER: u32 = crate::wire::MsgTag::OwnerChange as u32;
pub const RMW_REQ_HANDLER: u32 = crate::wire::MsgTag::RmwReq as u32;

/// The operator an `rmw` forwards to its current owner. Only the `op_key`
/// travels on the wire (spec §9's "dynamic dispatch of RMW functions": a
/// handler id plus a bounded payload); the closure itself lives in this
/// process-wide table, keyed by `(initiator, op_key)` so two initiators can
/// never collide. This is only sound because `LocalTransport` is an
/// in-process stand-in that runs every "remote" handler on the initiator's
/// own call stack — a real RDMA transport would need the closure replaced by
/// a statically registered numeric operator id, per the same design note.
pub type RmwOp = dyn Fn(&mut [u8]) + Send + Sync;
static RMW_OPS: OnceLock<Mutex<HashMap<(Pid, u64), Arc<RmwOp>>>> = OnceLock::new();
static NEXT_RMW_OP_ID: AtomicU64 = AtomicU64::new(0);

fn rmw_ops() -> &'static Mutex<HashMap<(Pid, u64), Arc<RmwOp>>> {
    RMW_OPS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// One `{gptr, data_offset, size}` triple to transfer into/out of `data`
/// (a pair is `{gptr, local_p, size}`). `data_offset`/`size`
/// index into the caller's contiguous destination buffer rather than a raw
/// pointer, since this is safe Rust.
#[derive(Debug, Clone, Copy)]
pub struct CopyPair {
    pub gptr: GPtr,
    pub data_offset: usize,
    pub size: usize,
}

/// Register the home-side and owner-side AM handlers for one process's GMT.
/// Must run once per process before any `copy_v` call can reach it remotely.
pub fn register_handlers(transport: &dyn Transport, gmt: std::sync::Arc<Gmt>) {
    let g1 = gmt.clone();
    transport.register_handler(
        OWNER_REQ_HANDLER,
        fragmenting_handler(move |initiator, payload| handle_owner_req(&g1, initiator, payload)),
    );
    let g2 = gmt.clone();
    transport.register_handler(
        DATA_REQ_HANDLER,
        fragmenting_handler(move |_initiator, payload| handle_data_req(&g2, payload)),
    );
    let g3 = gmt.clone();
    transport.register_handler(
        OWNER_CHANGE_HANDLER,
        fragmenting_handler(move |initiator, payload| handle_owner_change(&g3, initiator, payload)),
    );
    let g4 = gmt;
    transport.register_handler(
        RMW_REQ_HANDLER,
        fragmenting_handler(move |initiator, payload| handle_rmw_req(&g4, initiator, payload)),
    );
}

/// Send one active message, fragmenting it into `max_am_payload`-sized chunks
/// when it doesn't fit in one (see `RuntimeConfig::max_am_payload`).
/// Every chunk but the last gets an empty ack reply from
/// [`fragmenting_handler`]'s reassembler; the real reply comes back on the
/// chunk that completes the message.
fn send_am(transport: &dyn Transport, target: Pid, handler: u32, payload: &[u8], max_am_payload: usize) -> Vec<u8> {
    let max_chunk = max_am_payload.saturating_sub(size_of::<FragmentHeader>()).max(1);
    let msg_id = NEXT_MSG_ID.fetch_add(1, Ordering::Relaxed);
    let chunks = crate::wire::fragment(transport.pid(), msg_id, payload, max_chunk);
    let mut reply = Vec::new();
    for chunk in &chunks {
        reply = transport.am_request(target, handler, chunk);
    }
    reply
}

/// Wrap a real AM handler so it only ever sees a fully reassembled payload.
/// Reassembly state is keyed by `(sender, msg_id)`; the transport's
/// same-sender/same-receiver ordering guarantee means fragments for
/// one message always arrive contiguously, so a single in-progress entry per
/// sender is enough in practice, but keying by `msg_id` too keeps two
/// concurrent fragmented sends from the same sender from corrupting each
/// other if that guarantee is ever loosened.
fn fragmenting_handler<F>(inner: F) -> Box<crate::transport::AmHandler>
where
    F: Fn(Pid, &[u8]) -> Vec<u8> + Send + Sync + 'static,
{
    let reassemblers: Mutex<HashMap<(Pid, u32), Reassembler>> = Mutex::new(HashMap::new());
    Box::new(move |sender, fragment| {
        let header: &FragmentHeader = FragmentHeader::ref_from_bytes(&fragment[..size_of::<FragmentHeader>()])
            .expect("fragment header is well-formed");
        let key = (sender, header.msg_id);
        let mut table = reassemblers.lock().unwrap();
        let entry = table.entry(key).or_insert_with(Reassembler::new);
        match entry.push(fragment) {
            Some(full_payload) => {
                table.remove(&key);
                drop(table);
                inner(sender, &full_payload)
            }
            None => Vec::new(),
        }
    })
}

// --- wire encoding helpers -------------------------------------------------
//
// Fixed-size fields follow the header shapes in `wire.rs`; variable-length
// gptr/byte vectors are hand-packed since their lengths aren't known at
// compile time, following the original's va_body convention.

fn encode_owner_req(access: Access, gptrs: &[GPtr]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 8 + gptrs.len() * 8);
    out.push(access as u8);
    out.extend_from_slice(&(gptrs.len() as u64).to_le_bytes());
    for g in gptrs {
        out.extend_from_slice(&g.0.to_le_bytes());
    }
    out
}

fn decode_owner_req(payload: &[u8]) -> (Access, Vec<GPtr>) {
    let access = Access::from_u8(payload[0]);
    let n = u64::from_le_bytes(payload[1..9].try_into().unwrap()) as usize;
    let mut gptrs = Vec::with_capacity(n);
    let mut off = 9;
    for _ in 0..n {
        gptrs.push(GPtr(u64::from_le_bytes(payload[off..off + 8].try_into().unwrap())));
        off += 8;
    }
    (access, gptrs)
}

fn encode_owner_res(entries: &[(Pid, usize)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * 12);
    for (owner, block_size) in entries {
        out.extend_from_slice(&owner.to_le_bytes());
        out.extend_from_slice(&(*block_size as u64).to_le_bytes());
    }
    out
}

fn decode_owner_res(payload: &[u8], n: usize) -> Vec<(Pid, usize)> {
    let mut out = Vec::with_capacity(n);
    let mut off = 0;
    for _ in 0..n {
        let owner = u32::from_le_bytes(payload[off..off + 4].try_into().unwrap());
        let block_size = u64::from_le_bytes(payload[off + 4..off + 12].try_into().unwrap()) as usize;
        out.push((owner, block_size));
        off += 12;
    }
    out
}

struct DataReqItem {
    gptr: GPtr,
    size: usize,
    bytes: Vec<u8>, // payload to write, for PUT; empty otherwise
}

fn encode_data_req(access: Access, items: &[DataReqItem]) -> Vec<u8> {
    let mut out = vec![access as u8];
    out.extend_from_slice(&(items.len() as u64).to_le_bytes());
    for item in items {
        out.extend_from_slice(&item.gptr.0.to_le_bytes());
        out.extend_from_slice(&(item.size as u64).to_le_bytes());
        if access == Access::Put {
            out.extend_from_slice(&item.bytes);
        }
    }
    out
}

fn decode_data_req(payload: &[u8]) -> (Access, Vec<(GPtr, usize, Vec<u8>)>) {
    let access = Access::from_u8(payload[0]);
    let n = u64::from_le_bytes(payload[1..9].try_into().unwrap()) as usize;
    let mut off = 9;
    let mut items = Vec::with_capacity(n);
    for _ in 0..n {
        let gptr = GPtr(u64::from_le_bytes(payload[off..off + 8].try_into().unwrap()));
        off += 8;
        let size = u64::from_le_bytes(payload[off..off + 8].try_into().unwrap()) as usize;
        off += 8;
        let bytes = if access == Access::Put {
            let b = payload[off..off + size].to_vec();
            off += size;
            b
        } else {
            Vec::new()
        };
        items.push((gptr, size, bytes));
    }
    (access, items)
}

/// `DATA_RES`: a retry-index list plus, for GET/OWN, the transferred bytes
/// for every pair that was *not* retried (concatenated in order).
struct DataRes {
    retry: Vec<usize>,
    bytes: Vec<u8>,
}

fn encode_data_res(res: &DataRes) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(res.retry.len() as u64).to_le_bytes());
    for idx in &res.retry {
        out.extend_from_slice(&(*idx as u64).to_le_bytes());
    }
    out.extend_from_slice(&res.bytes);
    out
}

fn decode_data_res(payload: &[u8]) -> DataRes {
    let n = u64::from_le_bytes(payload[0..8].try_into().unwrap()) as usize;
    let mut off = 8;
    let mut retry = Vec::with_capacity(n);
    for _ in 0..n {
        retry.push(u64::from_le_bytes(payload[off..off + 8].try_into().unwrap()) as usize);
        off += 8;
    }
    DataRes {
        retry,
        bytes: payload[off..].to_vec(),
    }
}

fn encode_owner_change(gptrs: &[GPtr]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + gptrs.len() * 8);
    out.extend_from_slice(&(gptrs.len() as u64).to_le_bytes());
    for g in gptrs {
        out.extend_from_slice(&g.0.to_le_bytes());
    }
    out
}

fn decode_owner_change(payload: &[u8]) -> Vec<GPtr> {
    let n = u64::from_le_bytes(payload[0..8].try_into().unwrap()) as usize;
    let mut off = 8;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(GPtr(u64::from_le_bytes(payload[off..off + 8].try_into().unwrap())));
        off += 8;
    }
    out
}

// --- handlers (home / owner side) -----------------------------------------

/// Home-side resolution: first-touch or OWN-migration
/// bookkeeping under the entry's owner mutex, replying with the *previous*
/// owner value so the initiator knows what to do next.
fn handle_owner_req(gmt: &Gmt, initiator: Pid, payload: &[u8]) -> Vec<u8> {
    let (access, gptrs) = decode_owner_req(payload);
    let entries: Vec<(Pid, usize)> = gptrs
        .iter()
        .map(|&g| {
            let entry = gmt.find_entry(g);
            let prev = entry.resolve_owner(access, initiator);
            (prev, entry.block_size)
        })
        .collect();
    encode_owner_res(&entries)
}

/// Owner-side transfer: try to lock each page, copy
/// bytes in (PUT) or out (GET/OWN), invalidate on OWN, and report anything
/// that couldn't be locked immediately so the initiator retries it.
fn handle_data_req(gmt: &Gmt, payload: &[u8]) -> Vec<u8> {
    let (access, items) = decode_data_req(payload);
    let DataRes { retry, bytes } = process_data_req(gmt, access, items);
    encode_data_res(&DataRes { retry, bytes })
}

/// Finalize an OWN migration on the home: `MIGRATING -> initiator`.
fn handle_owner_change(gmt: &Gmt, initiator: Pid, payload: &[u8]) -> Vec<u8> {
    for g in decode_owner_change(payload) {
        gmt.find_entry(g).finalize_owner(initiator);
    }
    Vec::new()
}

fn encode_rmw_req(gptr: GPtr, size: usize, op_key: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&gptr.0.to_le_bytes());
    out.extend_from_slice(&(size as u64).to_le_bytes());
    out.extend_from_slice(&op_key.to_le_bytes());
    out
}

fn decode_rmw_req(payload: &[u8]) -> (GPtr, usize, u64) {
    let gptr = GPtr(u64::from_le_bytes(payload[0..8].try_into().unwrap()));
    let size = u64::from_le_bytes(payload[8..16].try_into().unwrap()) as usize;
    let op_key = u64::from_le_bytes(payload[16..24].try_into().unwrap());
    (gptr, size, op_key)
}

/// Owner-side RMW application: look up the operator the initiator
/// registered under `op_key`, apply it under the page write-lock in one
/// critical section (read, mutate, and publish never unlock in between —
/// spec §4.3 "atomically applies `fn` on the owner's page"), and report
/// whether it ran. A `false` reply (lock busy, or the page migrated away
/// since the caller last resolved its owner) tells the initiator to
/// re-resolve the owner and retry, never to assume success.
fn handle_rmw_req(gmt: &Gmt, initiator: Pid, payload: &[u8]) -> Vec<u8> {
    let (gptr, size, op_key) = decode_rmw_req(payload);
    let op = rmw_ops().lock().unwrap().get(&(initiator, op_key)).cloned();
    let Some(op) = op else {
        return vec![0];
    };
    let base = gmt.calc_block_base(gptr);
    let entry = gmt.find_entry(base);
    let local_off = gmt.calc_block_offset(gptr) as usize;
    match entry.try_write() {
        Some(mut guard) if guard.state == crate::gmt_table::PageState::Owned => {
            let buf = guard.buf.as_mut().expect("OWNED implies a buffer");
            op(&mut buf[local_off..local_off + size]);
            vec![1]
        }
        _ => vec![0],
    }
}

/// Resolve `g`'s current owner through its home, without migrating
/// ownership (an `Access::Get` resolve: spec §4.3 step 2 only moves
/// ownership for `OWN`). Returns `INVALID_PID` if this call itself just
/// first-touched the page (the home already recorded *this* process as
/// owner) and `MIGRATING` if an `OWN` is concurrently in flight. The
/// accompanying block size comes from the home's bookkeeping, not this
/// process's own entry, since a process that isn't the object's home has no
/// other way to learn it (see `copy_v`'s identical first-touch handling).
pub fn resolve_owner(transport: &dyn Transport, gmt: &Gmt, g: GPtr, cfg: &RuntimeConfig) -> (Pid, usize) {
    let me = transport.pid();
    let home = gmt.calc_home(g);
    let base = gmt.calc_block_base(g);
    if home == me {
        let entry = gmt.find_entry(base);
        (entry.resolve_owner(Access::Get, me), entry.block_size)
    } else {
        let req = encode_owner_req(Access::Get, &[base]);
        let res = send_am(transport, home, OWNER_REQ_HANDLER, &req, cfg.max_am_payload);
        decode_owner_res(&res, 1)[0]
    }
}

/// Forward `op` to run under `owner`'s page write-lock and wait for its
/// reply. Returns `false` (not an error) when the owner couldn't serve it
/// right now, so `Dsm::rmw` re-resolves the owner and retries rather than
/// silently treating a busy/migrated page as success.
pub fn forward_rmw(
    transport: &dyn Transport,
    owner: Pid,
    g: GPtr,
    size: usize,
    op: Arc<RmwOp>,
    cfg: &RuntimeConfig,
) -> bool {
    let me = transport.pid();
    let op_key = NEXT_RMW_OP_ID.fetch_add(1, Ordering::Relaxed);
    rmw_ops().lock().unwrap().insert((me, op_key), op);
    let payload = encode_rmw_req(g, size, op_key);
    let reply = send_am(transport, owner, RMW_REQ_HANDLER, &payload, cfg.max_am_payload);
    rmw_ops().lock().unwrap().remove(&(me, op_key));
    reply.first().copied() == Some(1)
}

// --- the initiator-side algorithm -----------------------------------------

/// `copy_v(pairs, access)`. `data` is the contiguous local
/// buffer the pairs read from (PUT) or write into (GET/OWN).
pub fn copy_v(
    transport: &dyn Transport,
    gmt: &Gmt,
    pairs: &[CopyPair],
    data: &mut [u8],
    access: Access,
    cfg: &RuntimeConfig,
) -> RtResult<()> {
    let me = transport.pid();
    let mut remaining: Vec<CopyPair> = Vec::new();

    // Step 1: fast path -- pages this process already owns.
    for &pair in pairs {
        let base = gmt.calc_block_base(pair.gptr);
        let entry = gmt.find_entry(base);
        let local_off = gmt.calc_block_offset(pair.gptr) as usize;
        let handled = match access {
            Access::Get => entry.try_read().is_some_and(|guard| {
                if guard.state != crate::gmt_table::PageState::Owned {
                    return false;
                }
                let buf = guard.buf.as_ref().expect("OWNED page has a buffer");
                data[pair.data_offset..pair.data_offset + pair.size]
                    .copy_from_slice(&buf[local_off..local_off + pair.size]);
                true
            }),
            Access::Put | Access::Own => entry.try_write().is_some_and(|mut guard| {
                if guard.state != crate::gmt_table::PageState::Owned {
                    return false;
                }
                let buf = guard.buf.as_mut().expect("OWNED page has a buffer");
                if access == Access::Put {
                    buf[local_off..local_off + pair.size]
                        .copy_from_slice(&data[pair.data_offset..pair.data_offset + pair.size]);
                } else {
                    data[pair.data_offset..pair.data_offset + pair.size]
                        .copy_from_slice(&buf[local_off..local_off + pair.size]);
                }
                true
            }),
        };
        if !handled {
            remaining.push(pair);
        }
    }

    let mut attempts = 0u32;
    while !remaining.is_empty() {
        retry_or_fuse(me, "copy_v owner resolution round", cfg.retry_fuse, &mut attempts)?;

        // Step 2: resolve owners, grouped by home.
        let mut by_home: HashMap<Pid, Vec<CopyPair>> = HashMap::new();
        for pair in remaining.drain(..) {
            by_home
                .entry(gmt.calc_home(pair.gptr))
                .or_default()
                .push(pair);
        }

        // Step 3/4: prepare pages, partition by resolved owner.
        let mut by_owner: HashMap<Pid, Vec<CopyPair>> = HashMap::new();
        let mut next_remaining: Vec<CopyPair> = Vec::new();
        let mut own_finalize: HashMap<Pid, Vec<GPtr>> = HashMap::new();

        for (home, home_pairs) in by_home {
            let bases: Vec<GPtr> = home_pairs
                .iter()
                .map(|p| gmt.calc_block_base(p.gptr))
                .collect();
            let reply = if home == me {
                // No need to go through the transport to talk to ourselves.
                let entries: Vec<(Pid, usize)> = bases
                    .iter()
                    .map(|&g| {
                        let entry = gmt.find_entry(g);
                        (entry.resolve_owner(access, me), entry.block_size)
                    })
                    .collect();
                entries
            } else {
                let req = encode_owner_req(access, &bases);
                let res = send_am(transport, home, OWNER_REQ_HANDLER, &req, cfg.max_am_payload);
                decode_owner_res(&res, bases.len())
            };

            for (pair, (owner, home_block_size)) in home_pairs.into_iter().zip(reply) {
                match owner {
                    INVALID_PID => {
                        // First touch: this process is already the owner
                        // (the resolve step recorded that on the home). Size
                        // the fresh buffer from the home's reply, not this
                        // process's own (possibly never-populated) entry --
                        // a process that is not the object's home has no
                        // other way to learn the block size.
                        let entry = gmt.find_entry(gmt.calc_block_base(pair.gptr));
                        entry.mark_owned(vec![0u8; home_block_size]);
                        let local_off = gmt.calc_block_offset(pair.gptr);
                        match access {
                            Access::Put => entry.with_buf_mut(|buf| {
                                buf[local_off as usize..local_off as usize + pair.size]
                                    .copy_from_slice(&data[pair.data_offset..pair.data_offset + pair.size]);
                            }),
                            Access::Get | Access::Own => entry.with_buf(|buf| {
                                data[pair.data_offset..pair.data_offset + pair.size]
                                    .copy_from_slice(&buf[local_off as usize..local_off as usize + pair.size]);
                            }),
                        }
                        if access == Access::Own && home != me {
                            own_finalize.entry(home).or_default().push(gmt.calc_block_base(pair.gptr));
                        }
                    }
                    MIGRATING => next_remaining.push(pair),
                    owner_pid => {
                        by_owner.entry(owner_pid).or_default().push(pair);
                        if access == Access::Own {
                            own_finalize.entry(home).or_default().push(gmt.calc_block_base(pair.gptr));
                        }
                    }
                }
            }
        }

        // Step 5: transfer, grouped by current owner. `noncontig_packed`
        // (§9/§11) selects whether every pair bound for one owner rides in a
        // single coalesced `DATA_REQ` (fewer, larger messages) or each pair
        // gets its own round trip (one message per pair, no coalescing).
        for (owner, owner_pairs) in by_owner {
            let batches: Vec<Vec<CopyPair>> = if cfg.noncontig_packed {
                vec![owner_pairs]
            } else {
                owner_pairs.into_iter().map(|p| vec![p]).collect()
            };

            for batch in batches {
                let items: Vec<DataReqItem> = batch
                    .iter()
                    .map(|p| DataReqItem {
                        gptr: p.gptr,
                        size: p.size,
                        bytes: if access == Access::Put {
                            data[p.data_offset..p.data_offset + p.size].to_vec()
                        } else {
                            Vec::new()
                        },
                    })
                    .collect();

                let data_res = if owner == me {
                    let decoded = items
                        .iter()
                        .map(|i| (i.gptr, i.size, i.bytes.clone()))
                        .collect();
                    process_data_req(gmt, access, decoded)
                } else {
                    let req = encode_data_req(access, &items);
                    let res = send_am(transport, owner, DATA_REQ_HANDLER, &req, cfg.max_am_payload);
                    decode_data_res(&res)
                };

                let retried: std::collections::HashSet<usize> = data_res.retry.iter().copied().collect();
                let mut cursor = 0usize;
                for (idx, pair) in batch.into_iter().enumerate() {
                    if retried.contains(&idx) {
                        next_remaining.push(pair);
                        continue;
                    }
                    match access {
                        Access::Get => {
                            data[pair.data_offset..pair.data_offset + pair.size]
                                .copy_from_slice(&data_res.bytes[cursor..cursor + pair.size]);
                            cursor += pair.size;
                        }
                        // The owner sent the whole page (see `process_data_req`),
                        // not just this pair's sub-range, so migrating doesn't
                        // zero out the rest of the block's contents.
                        Access::Own => {
                            let entry = gmt.find_entry(gmt.calc_block_base(pair.gptr));
                            let block_size = entry.block_size;
                            let full_block = data_res.bytes[cursor..cursor + block_size].to_vec();
                            cursor += block_size;
                            let local_off = gmt.calc_block_offset(pair.gptr) as usize;
                            data[pair.data_offset..pair.data_offset + pair.size]
                                .copy_from_slice(&full_block[local_off..local_off + pair.size]);
                            entry.mark_owned(full_block);
                        }
                        Access::Put => {}
                    }
                }
            }
        }

        // Step 6: finalize OWN migrations on each home.
        for (home, gptrs) in own_finalize {
            if home == me {
                for g in gptrs {
                    gmt.find_entry(g).finalize_owner(me);
                }
            } else {
                let payload = encode_owner_change(&gptrs);
                send_am(transport, home, OWNER_CHANGE_HANDLER, &payload, cfg.max_am_payload);
            }
        }

        remaining = next_remaining;
        if !remaining.is_empty() {
            transport.poll();
        }
    }

    Ok(())
}

/// Shared implementation between the real AM handler and the "owner == me"
/// fast path inside `copy_v`, so self-targeted transfers don't need to
/// round-trip through the transport's handler table.
fn process_data_req(gmt: &Gmt, access: Access, items: Vec<(GPtr, usize, Vec<u8>)>) -> DataRes {
    let mut retry = Vec::new();
    let mut bytes = Vec::new();
    for (idx, (gptr, size, put_bytes)) in items.into_iter().enumerate() {
        let base = gmt.calc_block_base(gptr);
        let entry = gmt.find_entry(base);
        let local_off = gmt.calc_block_offset(gptr) as usize;
        // Re-check `guard.state` after acquiring the lock rather than
        // trusting the owner resolution that routed this pair here: a
        // concurrent OWN migration can invalidate the page (take its
        // buffer, flip the state) between that resolution and this
        // request's arrival, even though the lock itself was free. Treat
        // that as "couldn't serve it right now" and let the caller retry
        // against whatever the home now reports as owner, instead of
        // panicking on a `None` buffer.
        match access {
            Access::Get => match entry.try_read() {
                Some(guard) if guard.state == crate::gmt_table::PageState::Owned => {
                    let buf = guard.buf.as_ref().expect("OWNED implies a buffer");
                    bytes.extend_from_slice(&buf[local_off..local_off + size]);
                }
                _ => retry.push(idx),
            },
            Access::Put => match entry.try_write() {
                Some(mut guard) if guard.state == crate::gmt_table::PageState::Owned => {
                    let buf = guard.buf.as_mut().expect("OWNED implies a buffer");
                    buf[local_off..local_off + size].copy_from_slice(&put_bytes);
                }
                _ => retry.push(idx),
            },
            // OWN migrates the whole page, not just the requested sub-range,
            // so data outside `[local_off, local_off+size)` that the previous
            // owner held isn't lost; the initiator overlays its own write at
            // `local_off` after receiving this.
            Access::Own => match entry.try_write() {
                Some(mut guard) if guard.state == crate::gmt_table::PageState::Owned => {
                    let buf = guard.buf.take().expect("OWNED implies a buffer");
                    bytes.extend_from_slice(&buf);
                    guard.state = crate::gmt_table::PageState::Invalid;
                }
                _ => retry.push(idx),
            },
        }
    }
    DataRes { retry, bytes }
}
