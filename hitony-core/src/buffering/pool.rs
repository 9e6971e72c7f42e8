//! Fixed-capacity block pools for per-packet allocations.
//!
//! Five size classes, each a preallocated set of blocks tracked by a 32-bit
//! free bitmap behind its own mutex. Acquire and release are O(1): a
//! trailing-zeros scan plus a mask. Callers never see raw pointers — a
//! [`PoolBlock`] owns its block and returns it to the pool on drop, which
//! makes double free and cross-class free unrepresentable.
//!
//! On exhaustion `acquire` returns `None` and the caller drops the unit of
//! work; nothing ever spins or blocks on a pool.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

/// Size classes. Capacities are sized so no in-flight path exhausts a class
/// under nominal load: 256 B covers the outbound queue of small codec frames,
/// 4 KB covers worst-case reassembled batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolClass {
    S64,
    S128,
    S256,
    L2k,
    L4k,
}

impl PoolClass {
    pub const ALL: [PoolClass; 5] = [
        PoolClass::S64,
        PoolClass::S128,
        PoolClass::S256,
        PoolClass::L2k,
        PoolClass::L4k,
    ];

    pub fn block_size(self) -> usize {
        match self {
            PoolClass::S64 => 64,
            PoolClass::S128 => 128,
            PoolClass::S256 => 256,
            PoolClass::L2k => 2048,
            PoolClass::L4k => 4096,
        }
    }

    pub fn capacity(self) -> usize {
        match self {
            PoolClass::S64 => 32,
            PoolClass::S128 => 32,
            PoolClass::S256 => 32,
            PoolClass::L2k => 16,
            PoolClass::L4k => 24,
        }
    }

    /// Smallest class whose blocks hold `len` bytes.
    pub fn for_len(len: usize) -> Option<PoolClass> {
        PoolClass::ALL
            .into_iter()
            .find(|class| len <= class.block_size())
    }

    fn index(self) -> usize {
        match self {
            PoolClass::S64 => 0,
            PoolClass::S128 => 1,
            PoolClass::S256 => 2,
            PoolClass::L2k => 3,
            PoolClass::L4k => 4,
        }
    }
}

impl fmt::Display for PoolClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.block_size())
    }
}

/// Largest payload any pool block can carry.
pub const MAX_BLOCK: usize = 4096;

struct ClassState {
    /// Bit set = slot free.
    free_bitmap: u32,
    /// Block storage; `None` while the block is out with a caller.
    slots: Vec<Option<Box<[u8]>>>,
}

struct ClassPool {
    class: PoolClass,
    state: Mutex<ClassState>,
    acquires: AtomicU64,
    releases: AtomicU64,
    exhausted: AtomicU64,
    peak_in_use: AtomicU32,
}

impl ClassPool {
    fn new(class: PoolClass) -> Self {
        let capacity = class.capacity();
        assert!(capacity <= 32, "bitmap tracks at most 32 blocks");
        let slots = (0..capacity)
            .map(|_| Some(vec![0u8; class.block_size()].into_boxed_slice()))
            .collect();
        let free_bitmap = if capacity == 32 {
            u32::MAX
        } else {
            (1u32 << capacity) - 1
        };
        Self {
            class,
            state: Mutex::new(ClassState { free_bitmap, slots }),
            acquires: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            peak_in_use: AtomicU32::new(0),
        }
    }

    fn acquire(&self) -> Option<(usize, Box<[u8]>)> {
        let mut state = self.state.lock();
        if state.free_bitmap == 0 {
            drop(state);
            self.exhausted.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let slot = state.free_bitmap.trailing_zeros() as usize;
        state.free_bitmap &= !(1u32 << slot);
        let block = state.slots[slot].take();
        let in_use = self.class.capacity() as u32 - state.free_bitmap.count_ones();
        drop(state);

        self.acquires.fetch_add(1, Ordering::Relaxed);
        self.peak_in_use.fetch_max(in_use, Ordering::Relaxed);
        // The slot bit was free, so the box must be present.
        block.map(|b| (slot, b))
    }

    fn release(&self, slot: usize, block: Box<[u8]>) {
        let mut state = self.state.lock();
        state.slots[slot] = Some(block);
        state.free_bitmap |= 1u32 << slot;
        drop(state);
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    fn in_use(&self) -> usize {
        let state = self.state.lock();
        self.class.capacity() - state.free_bitmap.count_ones() as usize
    }
}

/// Per-class counter snapshot.
#[derive(Debug, Clone, Copy)]
pub struct PoolClassStats {
    pub class: PoolClass,
    pub in_use: usize,
    pub acquires: u64,
    pub releases: u64,
    pub exhausted: u64,
    pub peak_in_use: u32,
}

impl PoolClassStats {
    /// `acquires − releases`: blocks currently out with callers. A value
    /// that stays elevated while the queues are drained means a block
    /// escaped its owner.
    pub fn leak(&self) -> i64 {
        self.acquires as i64 - self.releases as i64
    }
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub classes: [PoolClassStats; 5],
}

/// All five class pools. Shared as `Arc<MemoryPools>` between the workers and
/// the transport sink.
pub struct MemoryPools {
    classes: [ClassPool; 5],
}

impl Default for MemoryPools {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPools {
    pub fn new() -> Self {
        Self {
            classes: PoolClass::ALL.map(ClassPool::new),
        }
    }

    /// Acquire a block for a `len`-byte payload from the smallest fitting
    /// class. Returns `None` when `len` exceeds the largest class or the
    /// class is exhausted; the caller drops the work unit.
    pub fn acquire(self: &Arc<Self>, len: usize) -> Option<PoolBlock> {
        let class = PoolClass::for_len(len)?;
        let (slot, data) = self.classes[class.index()].acquire()?;
        Some(PoolBlock {
            data: Some(data),
            len,
            class,
            slot,
            pools: Arc::clone(self),
        })
    }

    /// Acquire a block and copy `payload` into it.
    pub fn acquire_copy(self: &Arc<Self>, payload: &[u8]) -> Option<PoolBlock> {
        let mut block = self.acquire(payload.len())?;
        block.as_mut_slice().copy_from_slice(payload);
        Some(block)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            classes: PoolClass::ALL.map(|class| {
                let pool = &self.classes[class.index()];
                PoolClassStats {
                    class,
                    in_use: pool.in_use(),
                    acquires: pool.acquires.load(Ordering::Relaxed),
                    releases: pool.releases.load(Ordering::Relaxed),
                    exhausted: pool.exhausted.load(Ordering::Relaxed),
                    peak_in_use: pool.peak_in_use.load(Ordering::Relaxed),
                }
            }),
        }
    }

    /// Log one line per class. Called from the periodic stats pass.
    pub fn log_stats(&self) {
        for stats in self.stats().classes {
            info!(
                class = %stats.class,
                in_use = stats.in_use,
                peak = stats.peak_in_use,
                acquires = stats.acquires,
                releases = stats.releases,
                exhausted = stats.exhausted,
                leak = stats.leak(),
                "pool stats"
            );
        }
    }

    fn release(&self, class: PoolClass, slot: usize, block: Box<[u8]>) {
        self.classes[class.index()].release(slot, block);
    }
}

/// An acquired block. The payload view is `len` bytes into a block of the
/// class size; the block returns to its pool on drop.
pub struct PoolBlock {
    data: Option<Box<[u8]>>,
    len: usize,
    class: PoolClass,
    slot: usize,
    pools: Arc<MemoryPools>,
}

impl PoolBlock {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.class.block_size()
    }

    pub fn class(&self) -> PoolClass {
        self.class
    }

    /// Shrink or grow the payload view within the block capacity.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity(), "payload exceeds block capacity");
        self.len = len;
    }

    pub fn as_slice(&self) -> &[u8] {
        // Present until drop.
        self.data.as_ref().map(|d| &d[..self.len]).unwrap_or(&[])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len;
        self.data
            .as_mut()
            .map(|d| &mut d[..len])
            .unwrap_or(&mut [])
    }
}

impl fmt::Debug for PoolBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBlock")
            .field("class", &self.class)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl Drop for PoolBlock {
    fn drop(&mut self) {
        if let Some(block) = self.data.take() {
            self.pools.release(self.class, self.slot, block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pools() -> Arc<MemoryPools> {
        Arc::new(MemoryPools::new())
    }

    #[test]
    fn acquire_picks_smallest_fitting_class() {
        let pools = pools();
        assert_eq!(pools.acquire(1).unwrap().class(), PoolClass::S64);
        assert_eq!(pools.acquire(64).unwrap().class(), PoolClass::S64);
        assert_eq!(pools.acquire(65).unwrap().class(), PoolClass::S128);
        assert_eq!(pools.acquire(200).unwrap().class(), PoolClass::S256);
        assert_eq!(pools.acquire(2000).unwrap().class(), PoolClass::L2k);
        assert_eq!(pools.acquire(4096).unwrap().class(), PoolClass::L4k);
    }

    #[test]
    fn oversized_request_is_refused() {
        let pools = pools();
        assert!(pools.acquire(4097).is_none());
    }

    #[test]
    fn exhaustion_returns_none_and_counts() {
        let pools = pools();
        let held: Vec<_> = (0..PoolClass::S64.capacity())
            .map(|_| pools.acquire(16).unwrap())
            .collect();
        assert!(pools.acquire(16).is_none());

        let stats = pools.stats().classes[0];
        assert_eq!(stats.in_use, PoolClass::S64.capacity());
        assert_eq!(stats.exhausted, 1);
        drop(held);
        assert!(pools.acquire(16).is_some());
    }

    #[test]
    fn drop_returns_block_to_the_pool() {
        let pools = pools();
        {
            let mut block = pools.acquire_copy(&[1, 2, 3]).unwrap();
            assert_eq!(block.as_slice(), &[1, 2, 3]);
            block.as_mut_slice()[0] = 9;
            assert_eq!(block.as_slice(), &[9, 2, 3]);
        }
        let stats = pools.stats().classes[0];
        assert_eq!(stats.acquires, 1);
        assert_eq!(stats.releases, 1);
        assert_eq!(stats.leak(), 0);
    }

    #[test]
    fn round_trips_stay_balanced() {
        let pools = pools();
        for i in 0..10_000usize {
            let len = 1 + (i % MAX_BLOCK);
            let block = pools.acquire(len).unwrap();
            assert_eq!(block.len(), len);
        }
        for stats in pools.stats().classes {
            assert_eq!(stats.acquires, stats.releases, "class {}", stats.class);
            assert_eq!(stats.in_use, 0);
            assert_eq!(stats.leak(), 0);
        }
    }

    #[test]
    fn peak_tracks_high_water_mark() {
        let pools = pools();
        let a = pools.acquire(16).unwrap();
        let b = pools.acquire(16).unwrap();
        drop(a);
        drop(b);
        let _c = pools.acquire(16).unwrap();
        assert_eq!(pools.stats().classes[0].peak_in_use, 2);
    }
}
