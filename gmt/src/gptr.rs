//! The global pointer (`gptr`) and the distribution descriptor it is
//! resolved against.
//!
//! Bit layout, ported from the original's `mgasptr_t` bitfields
//! (`dist.h`): a debug tag, a type bit, and then either a shared-local
//! `(home_pid, object_id, offset)` triple or a distributed `(object_id,
//! offset)` pair.

use std::fmt;

const DEBUG_BITS: u32 = 4;
const TYPE_BITS: u32 = 1;

const SLOCAL_PID_BITS: u32 = 20;
const SLOCAL_ID_BITS: u32 = 20;
const SLOCAL_OFFSET_BITS: u32 = 19;

const DIST_ID_BITS: u32 = 10;
const DIST_OFFSET_BITS: u32 = 49;

const SLOCAL_OFFSET_BASE: u32 = 0;
const SLOCAL_ID_BASE: u32 = SLOCAL_OFFSET_BASE + SLOCAL_OFFSET_BITS;
const SLOCAL_PID_BASE: u32 = SLOCAL_ID_BASE + SLOCAL_ID_BITS;

const DIST_OFFSET_BASE: u32 = 0;
const DIST_ID_BASE: u32 = DIST_OFFSET_BASE + DIST_OFFSET_BITS;

const TYPE_BASE: u32 = DIST_ID_BASE + DIST_ID_BITS; // == SLOCAL_PID_BASE + SLOCAL_PID_BITS == 59
const DEBUG_BASE: u32 = TYPE_BASE + TYPE_BITS;

const _: () = assert!(TYPE_BASE == SLOCAL_PID_BASE + SLOCAL_PID_BITS);
const _: () = assert!(TYPE_BASE == 59);
const _: () = assert!(DEBUG_BASE == 60);

pub const MAX_SLOCAL_IDS: u32 = (1 << SLOCAL_ID_BITS) - 2; // id 0 reserved
pub const MAX_DIST_IDS: u32 = (1 << DIST_ID_BITS) - 1;
pub const DIST_MAX_DIMS: usize = 8;

fn mask_bits(bits: u32) -> u64 {
    (1u64 << bits) - 1
}

fn extract(value: u64, base: u32, bits: u32) -> u64 {
    (value >> base) & mask_bits(bits)
}

/// A 64-bit global pointer. Zero is the null gptr.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GPtr(pub u64);

impl fmt::Debug for GPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "GPtr(null)")
        } else if self.is_dist() {
            write!(
                f,
                "GPtr(dist id={} off={})",
                self.dist_id(),
                self.dist_offset()
            )
        } else {
            write!(
                f,
                "GPtr(slocal home={} id={} off={})",
                self.slocal_home(),
                self.slocal_id(),
                self.slocal_offset()
            )
        }
    }
}

impl GPtr {
    pub const NULL: GPtr = GPtr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn is_dist(self) -> bool {
        extract(self.0, TYPE_BASE, TYPE_BITS) == 1
    }

    pub fn is_slocal(self) -> bool {
        !self.is_null() && extract(self.0, TYPE_BASE, TYPE_BITS) == 0
    }

    pub fn slocal_home(self) -> u32 {
        debug_assert!(!self.is_dist());
        extract(self.0, SLOCAL_PID_BASE, SLOCAL_PID_BITS) as u32
    }

    pub fn slocal_id(self) -> u32 {
        debug_assert!(!self.is_dist());
        extract(self.0, SLOCAL_ID_BASE, SLOCAL_ID_BITS) as u32
    }

    pub fn slocal_offset(self) -> u64 {
        debug_assert!(!self.is_dist());
        extract(self.0, SLOCAL_OFFSET_BASE, SLOCAL_OFFSET_BITS)
    }

    pub fn slocal_base(self) -> GPtr {
        GPtr(self.0 & !mask_bits(SLOCAL_OFFSET_BITS))
    }

    pub fn make_slocal(home: u32, id: u32, offset: u64) -> GPtr {
        debug_assert!(home < (1 << SLOCAL_PID_BITS));
        debug_assert!(id < (1 << SLOCAL_ID_BITS));
        debug_assert!(offset < (1 << SLOCAL_OFFSET_BITS));
        let mut v = home as u64;
        v = (v << SLOCAL_ID_BITS) | id as u64;
        v = (v << SLOCAL_OFFSET_BITS) | offset;
        GPtr(v)
    }

    pub fn dist_id(self) -> u32 {
        debug_assert!(self.is_dist());
        extract(self.0, DIST_ID_BASE, DIST_ID_BITS) as u32
    }

    pub fn dist_offset(self) -> u64 {
        debug_assert!(self.is_dist());
        extract(self.0, DIST_OFFSET_BASE, DIST_OFFSET_BITS)
    }

    pub fn dist_base(self) -> GPtr {
        GPtr(self.0 & !mask_bits(DIST_OFFSET_BITS))
    }

    pub fn make_dist(id: u32, offset: u64) -> GPtr {
        debug_assert!(id <= MAX_DIST_IDS);
        debug_assert!(offset < (1 << DIST_OFFSET_BITS));
        let mut v = 1u64; // type bit
        v = (v << DIST_ID_BITS) | id as u64;
        v = (v << DIST_OFFSET_BITS) | offset;
        GPtr(v)
    }

    /// `self + delta`, staying within the same object (offset bits only).
    pub fn offset_by(self, delta: u64) -> GPtr {
        if self.is_dist() {
            GPtr::make_dist(self.dist_id(), self.dist_offset() + delta)
        } else {
            GPtr::make_slocal(self.slocal_home(), self.slocal_id(), self.slocal_offset() + delta)
        }
    }
}

/// Distribution descriptor for a collectively allocated distributed object:
/// up to 8 dimensions, each with its own block size and block count. The
/// offset→block-id mapping is row-major over blocks; the block-id→home
/// mapping is block-cyclic (`block_id mod N`).
#[derive(Debug, Clone)]
pub struct Distribution {
    pub n_dims: usize,
    pub block_size: [u64; DIST_MAX_DIMS],
    pub n_blocks: [u64; DIST_MAX_DIMS],
    pub nprocs: u32,
}

impl Distribution {
    pub fn new(dims: &[(u64, u64)], nprocs: u32) -> Self {
        assert!(!dims.is_empty() && dims.len() <= DIST_MAX_DIMS);
        let mut block_size = [0u64; DIST_MAX_DIMS];
        let mut n_blocks = [0u64; DIST_MAX_DIMS];
        for (i, (bs, nb)) in dims.iter().enumerate() {
            block_size[i] = *bs;
            n_blocks[i] = *nb;
        }
        Self {
            n_dims: dims.len(),
            block_size,
            n_blocks,
            nprocs,
        }
    }

    /// Total byte size of the whole distributed object.
    pub fn total_size(&self) -> u64 {
        (0..self.n_dims)
            .map(|i| self.block_size[i] * self.n_blocks[i])
            .product()
    }

    /// Bytes in one block (product of per-dimension block sizes).
    pub fn block_bytes(&self) -> u64 {
        (0..self.n_dims).map(|i| self.block_size[i]).product()
    }

    /// Total block count (row-major product of per-dimension block counts).
    pub fn total_blocks(&self) -> u64 {
        (0..self.n_dims).map(|i| self.n_blocks[i]).product()
    }

    /// The per-dimension extent of the whole object, in bytes.
    fn dim_extent_bytes(&self, dim: usize) -> u64 {
        self.block_size[dim] * self.n_blocks[dim]
    }

    /// Decompose a byte offset into (per-dimension index, per-dimension
    /// within-block offset).
    fn decompose(&self, offset: u64) -> ([u64; DIST_MAX_DIMS], [u64; DIST_MAX_DIMS]) {
        let mut idx = [0u64; DIST_MAX_DIMS];
        let mut within = [0u64; DIST_MAX_DIMS];
        let mut rem = offset;
        // Row-major: the last dimension varies fastest.
        for d in (0..self.n_dims).rev() {
            let extent = self.dim_extent_bytes(d);
            let coord = rem % extent;
            rem /= extent;
            idx[d] = coord / self.block_size[d];
            within[d] = coord % self.block_size[d];
        }
        (idx, within)
    }

    /// Row-major block id for the block that contains `offset`.
    pub fn block_id(&self, offset: u64) -> u64 {
        let (idx, _) = self.decompose(offset);
        let mut id = 0u64;
        for d in 0..self.n_dims {
            id = id * self.n_blocks[d] + idx[d];
        }
        id
    }

    /// Owning process for a block id: block-cyclic `block_id mod N`.
    pub fn home_of_block(&self, block_id: u64) -> u32 {
        (block_id % self.nprocs as u64) as u32
    }

    pub fn home(&self, offset: u64) -> u32 {
        self.home_of_block(self.block_id(offset))
    }

    /// Byte offset of the start of the block containing `offset`.
    pub fn block_base_offset(&self, offset: u64) -> u64 {
        let (idx, _) = self.decompose(offset);
        let mut byte_off = 0u64;
        let mut stride = 1u64;
        for d in (0..self.n_dims).rev() {
            byte_off += idx[d] * self.block_size[d] * stride;
            stride *= self.n_blocks[d];
        }
        byte_off
    }

    /// Offset of `offset` within its containing block.
    pub fn block_offset(&self, offset: u64) -> u64 {
        let (_, within) = self.decompose(offset);
        let mut off = 0u64;
        let mut stride = 1u64;
        for d in (0..self.n_dims).rev() {
            off += within[d] * stride;
            stride *= self.block_size[d];
        }
        off
    }

    /// Size, in bytes, of one block — constant across the object.
    pub fn block_size_bytes(&self) -> u64 {
        self.block_bytes()
    }

    /// Byte pitch of one "row" (all dimensions but the first), used by the
    /// strided localize/commit paths. Expressed in bytes, not elements.
    pub fn row_size_bytes(&self) -> u64 {
        if self.n_dims <= 1 {
            self.block_bytes()
        } else {
            (1..self.n_dims).map(|d| self.dim_extent_bytes(d)).product()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slocal_roundtrip() {
        let p = GPtr::make_slocal(3, 7, 100);
        assert!(p.is_slocal());
        assert!(!p.is_dist());
        assert_eq!(p.slocal_home(), 3);
        assert_eq!(p.slocal_id(), 7);
        assert_eq!(p.slocal_offset(), 100);
    }

    #[test]
    fn dist_roundtrip() {
        let p = GPtr::make_dist(5, 12345);
        assert!(p.is_dist());
        assert_eq!(p.dist_id(), 5);
        assert_eq!(p.dist_offset(), 12345);
    }

    #[test]
    fn null_is_zero() {
        assert!(GPtr::NULL.is_null());
        assert_eq!(GPtr::NULL.0, 0);
    }

    #[test]
    fn one_dim_block_cyclic_home() {
        let dist = Distribution::new(&[(64, 8)], 4); // 8 blocks of 64B over 4 procs
        assert_eq!(dist.block_id(0), 0);
        assert_eq!(dist.block_id(64), 1);
        assert_eq!(dist.block_id(127), 1);
        assert_eq!(dist.home(64), 1);
        assert_eq!(dist.home(3 * 64), 3);
        assert_eq!(dist.home(4 * 64), 0); // wraps: block 4 mod 4 procs = 0
    }

    #[test]
    fn two_dim_row_major_block_id() {
        // 4x4 grid of 2x2-block matrix distributed as 2 block-rows x 2 block-cols.
        let dist = Distribution::new(&[(2 * 8, 2), (2 * 8, 2)], 4);
        // block (0,0) -> id 0, (0,1) -> id 1, (1,0) -> id 2, (1,1) -> id 3
        let elem = 8u64;
        let row_bytes = 4 * elem;
        let off = |r: u64, c: u64| r * row_bytes + c * elem;
        assert_eq!(dist.block_id(off(0, 0)), 0);
        assert_eq!(dist.block_id(off(0, 2)), 1);
        assert_eq!(dist.block_id(off(2, 0)), 2);
        assert_eq!(dist.block_id(off(2, 2)), 3);
    }

    #[test]
    fn block_base_and_offset_recompose() {
        let dist = Distribution::new(&[(16, 4)], 3);
        let off = 5 * 16 + 3; // block 5, within-block offset 3
        assert_eq!(dist.block_base_offset(off), 5 * 16);
        assert_eq!(dist.block_offset(off), 3);
    }
}
