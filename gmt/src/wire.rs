//! The active-message wire format (spec §6).
//!
//! Message bodies (`OWNER_REQ`/`OWNER_RES`/`DATA_REQ`/`RMW_REQ`/...) are
//! hand-encoded little-endian byte layouts in `dsm::copy`, one
//! `encode_*`/`decode_*` pair per message kind, rather than routed through
//! `zerocopy`-derived structs here: this module only carries the pieces that
//! are genuinely shared across message kinds ([`MsgTag`], [`Access`]) and the
//! fragmentation header, which is the one struct actually placed on the wire
//! via `zerocopy` (the teacher's `panda-abi::encoding` module uses the same
//! crate for its own on-wire structures).
//!
//! Per §9's design note, raw function pointers are replaced by small
//! integer handler ids resolved against a table registered at init.

use std::mem::size_of;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgTag {
    Alloc = 0,
    Free = 1,
    OwnerReq = 2,
    OwnerRes = 3,
    OwnerChange = 4,
    DataReq = 5,
    DataRes = 6,
    RmwReq = 7,
    RmwRes = 8,
    AmReq = 9,
}

impl MsgTag {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Alloc,
            1 => Self::Free,
            2 => Self::OwnerReq,
            3 => Self::OwnerRes,
            4 => Self::OwnerChange,
            5 => Self::DataReq,
            6 => Self::DataRes,
            7 => Self::RmwReq,
            8 => Self::RmwRes,
            9 => Self::AmReq,
            _ => return None,
        })
    }
}

/// Access mode carried on `OWNER_REQ`/`DATA_REQ` (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Access {
    Put = 0,
    Get = 1,
    Own = 2,
}

impl Access {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Put,
            1 => Self::Get,
            _ => Self::Own,
        }
    }
}

/// Fragmentation header for payloads larger than one "medium" AM (spec §4.3,
/// §6): `(sender, msg_id, offset, total_size)`.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FragmentHeader {
    pub sender: u32,
    pub msg_id: u32,
    pub offset: u32,
    pub total_size: u32,
}

/// Split `payload` into `max_chunk`-sized fragments, each prefixed by a
/// [`FragmentHeader`]. Used when a vector transfer's payload would exceed
/// `RuntimeConfig::max_am_payload`.
pub fn fragment(sender: u32, msg_id: u32, payload: &[u8], max_chunk: usize) -> Vec<Vec<u8>> {
    let total = payload.len() as u32;
    payload
        .chunks(max_chunk.max(1))
        .enumerate()
        .map(|(i, chunk)| {
            let header = FragmentHeader {
                sender,
                msg_id,
                offset: (i * max_chunk) as u32,
                total_size: total,
            };
            let mut out = Vec::with_capacity(size_of::<FragmentHeader>() + chunk.len());
            out.extend_from_slice(header.as_bytes());
            out.extend_from_slice(chunk);
            out
        })
        .collect()
}

/// Reassembles fragments for one `(sender, msg_id)` pair, in arrival order
/// (the transport guarantees same-sender/same-receiver ordering, so offsets
/// always arrive ascending).
#[derive(Default)]
pub struct Reassembler {
    buf: Vec<u8>,
    expected_total: Option<u32>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment (header + chunk bytes). Returns the reassembled
    /// payload once `total_size` bytes have been accumulated.
    pub fn push(&mut self, fragment: &[u8]) -> Option<Vec<u8>> {
        let header = FragmentHeader::ref_from_bytes(&fragment[..size_of::<FragmentHeader>()])
            .expect("fragment header is well-formed");
        let chunk = &fragment[size_of::<FragmentHeader>()..];
        self.expected_total = Some(header.total_size);
        self.buf.extend_from_slice(chunk);
        if self.buf.len() as u32 >= header.total_size {
            Some(std::mem::take(&mut self.buf))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_and_reassemble() {
        let payload: Vec<u8> = (0u8..=255).cycle().take(10_000).collect();
        let frags = fragment(0, 42, &payload, 1500);
        assert!(frags.len() > 1);
        let mut reassembler = Reassembler::new();
        let mut result = None;
        for f in &frags {
            if let Some(r) = reassembler.push(f) {
                result = Some(r);
            }
        }
        assert_eq!(result.unwrap(), payload);
    }
}
