//! Fixed-capacity buffering primitives used on the audio hot paths.
//!
//! Two building blocks live here:
//!
//! - [`ring::PcmRing`] — lock-free SPSC PCM ring buffers between the capture
//!   step and the front-end feed (one per mic channel, one for the playback
//!   reference).
//! - [`pool::MemoryPools`] — the fixed bitmap-indexed block pools backing
//!   every per-packet allocation. No hot path touches the global allocator.

pub mod pool;
pub mod ring;

pub use pool::{MemoryPools, PoolBlock, PoolClass, PoolStats};
pub use ring::PcmRing;
