//! The thin network-thread callback.
//!
//! Runs on the network library's worker thread and does exactly three
//! things: reassemble fragmented frames, copy payloads into pool blocks, and
//! push onto the single bounded receive queue. It never parses, never
//! touches the UI, and never takes a lock the workers hold — any heavier
//! work here deadlocks the network task under load.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::warn;

use crate::buffering::{MemoryPools, PoolBlock};
use crate::protocol::MAX_BATCH_BYTES;

use super::{Opcode, RawMessage};

/// Drop accounting, readable from the control worker for stats.
#[derive(Debug, Default)]
pub struct SinkCounters {
    /// Frames dropped because the receive queue was full.
    pub queue_full: AtomicU64,
    /// Frames dropped because a pool class was exhausted.
    pub pool_exhausted: AtomicU64,
    /// Frames refused for size or protocol reasons.
    pub refused: AtomicU64,
}

pub struct TransportSink {
    pools: Arc<MemoryPools>,
    queue: Sender<RawMessage>,
    counters: Arc<SinkCounters>,
    /// In-progress fragmented frame, with the byte count received so far.
    reassembly: Option<(PoolBlock, usize)>,
}

impl TransportSink {
    pub fn new(
        pools: Arc<MemoryPools>,
        queue: Sender<RawMessage>,
        counters: Arc<SinkCounters>,
    ) -> Self {
        Self {
            pools,
            queue,
            counters,
            reassembly: None,
        }
    }

    pub fn on_connected(&mut self) {
        self.reassembly = None;
        self.push(RawMessage::Connected);
    }

    pub fn on_disconnected(&mut self) {
        self.reassembly = None;
        self.push(RawMessage::Disconnected);
    }

    /// One complete (non-fragmented) frame.
    pub fn on_frame(&mut self, opcode: Opcode, payload: &[u8]) {
        // A complete frame invalidates any half-done reassembly.
        if self.reassembly.take().is_some() {
            warn!("stale fragment reassembly discarded");
        }
        if payload.is_empty() || payload.len() > MAX_BATCH_BYTES {
            self.counters.refused.fetch_add(1, Ordering::Relaxed);
            warn!(len = payload.len(), "frame size refused");
            return;
        }
        let Some(block) = self.pools.acquire_copy(payload) else {
            self.counters.pool_exhausted.fetch_add(1, Ordering::Relaxed);
            warn!(len = payload.len(), "pool exhausted, frame dropped");
            return;
        };
        let msg = match opcode {
            Opcode::Binary => RawMessage::Binary(block),
            Opcode::Text => RawMessage::Text(block),
        };
        self.push(msg);
    }

    /// One chunk of a fragmented frame. `total_len` is the full payload
    /// length, `offset` this chunk's position. On the final chunk the
    /// reassembled frame is pushed as a single message.
    pub fn on_fragment(&mut self, opcode: Opcode, chunk: &[u8], total_len: usize, offset: usize) {
        if offset == 0 {
            if self.reassembly.take().is_some() {
                warn!("stale fragment reassembly discarded");
            }
            if total_len == 0 || total_len > MAX_BATCH_BYTES {
                self.counters.refused.fetch_add(1, Ordering::Relaxed);
                warn!(total_len, "fragmented frame size refused");
                return;
            }
            let Some(block) = self.pools.acquire(total_len) else {
                self.counters.pool_exhausted.fetch_add(1, Ordering::Relaxed);
                warn!(total_len, "pool exhausted, fragmented frame dropped");
                return;
            };
            self.reassembly = Some((block, 0));
        }

        let Some((mut block, mut filled)) = self.reassembly.take() else {
            // First chunk was refused; ignore the rest of the frame.
            return;
        };
        if offset != filled || filled + chunk.len() > block.len() {
            self.counters.refused.fetch_add(1, Ordering::Relaxed);
            warn!(
                offset,
                filled,
                chunk = chunk.len(),
                total = block.len(),
                "fragment out of sequence, frame dropped"
            );
            return;
        }
        block.as_mut_slice()[filled..filled + chunk.len()].copy_from_slice(chunk);
        filled += chunk.len();

        if filled >= block.len() {
            let msg = match opcode {
                Opcode::Binary => RawMessage::Binary(block),
                Opcode::Text => RawMessage::Text(block),
            };
            self.push(msg);
        } else {
            self.reassembly = Some((block, filled));
        }
    }

    fn push(&self, msg: RawMessage) {
        // Non-blocking only: the block inside a refused message returns to
        // its pool on drop.
        if self.queue.try_send(msg).is_err() {
            self.counters.queue_full.fetch_add(1, Ordering::Relaxed);
            warn!("receive queue full, frame dropped");
        }
    }
}
