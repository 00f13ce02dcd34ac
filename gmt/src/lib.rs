//! Work-stealing scheduler and software-DSM runtime over a partitioned
//! global address space.
//!
//! `gptr`/`gmt_table` model the address space and its first-touch/MIGRATING
//! ownership protocol; `dsm` implements `localize`/`commit`/`put`/`get`/`rmw`
//! on top of it; `future_pool`/`distpool`/`joincounter` give distributed
//! futures a home in the symmetric heap; `scheduler` runs the per-process
//! work-stealing fork/join engine; `transport` is the active-message
//! boundary everything else is built against.

pub mod cache_dir;
pub mod config;
pub mod distpool;
pub mod dsm;
pub mod error;
pub mod future_pool;
pub mod gmt_table;
pub mod gptr;
pub mod joincounter;
pub mod scheduler;
pub mod transport;
pub mod wire;

pub use config::RuntimeConfig;
pub use dsm::{Dsm, LocalizeFlags, Mv};
pub use error::{RtError, RtResult};
pub use gmt_table::Gmt;
pub use gptr::{Distribution, GPtr};
pub use scheduler::{NoopCallbacks, Pool, StealCallbacks, Worker};
