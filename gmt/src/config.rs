//! Runtime configuration.
//!
//! The original system compiles most of these in as constants; here they
//! load from a layered TOML config at process start, the way `cognitod`
//! does it, so this crate exposes a small `RuntimeConfig` with sane
//! defaults, overridable from a TOML file.

use serde::{Deserialize, Serialize};

/// Tunables for one runtime instance. All fields have defaults sized for
/// ordinary use; only tests and demos that need non-default sizes should
/// construct one directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads per process. Typically 1.
    pub workers_per_process: usize,

    /// Entries per worker's task deque. Fixed capacity, a power of two.
    pub deque_capacity: usize,

    /// Bytes in each process's symmetric future-pool buffer.
    pub future_pool_buf_size: usize,

    /// Capacity of a dist-pool ring (used by the future return-pool and other
    /// many-writer/one-reader cross-process queues).
    pub dist_pool_capacity: usize,

    /// Maximum active-message payload before the initiator fragments it into
    /// ordered chunks.
    pub max_am_payload: usize,

    /// Mirrors `MGAS_COMM_NONCONTIG_PACKED` from the original: when true,
    /// `copy_v` coalesces same-owner pairs into one packed RDMA transfer;
    /// when false, each pair is transferred individually.
    pub noncontig_packed: bool,

    /// Retry fuse for the DSM engine's own busy-loops (`rmw`'s local-page
    /// wait, `copy_v`'s owner-resolution round). Other spin-loops in the
    /// runtime (join counters, dist-pool locks, the scheduler's steal loop)
    /// are constructed before a config is available and use
    /// [`crate::error::RETRY_FUSE`] directly.
    pub retry_fuse: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers_per_process: 1,
            deque_capacity: 1 << 16,
            future_pool_buf_size: 1 << 20,
            dist_pool_capacity: 4096,
            max_am_payload: 8192,
            noncontig_packed: true,
            retry_fuse: crate::error::RETRY_FUSE,
        }
    }
}

impl RuntimeConfig {
    /// Load a config, falling back to defaults for any field the file omits.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = RuntimeConfig::from_toml_str("workers_per_process = 4\n").unwrap();
        assert_eq!(cfg.workers_per_process, 4);
        assert_eq!(cfg.deque_capacity, RuntimeConfig::default().deque_capacity);
    }

    #[test]
    fn roundtrip() {
        let cfg = RuntimeConfig::default();
        let s = cfg.to_toml_string().unwrap();
        let back = RuntimeConfig::from_toml_str(&s).unwrap();
        assert_eq!(back.workers_per_process, cfg.workers_per_process);
    }
}
