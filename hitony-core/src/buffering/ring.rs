//! Lock-free SPSC ring buffer for int16 PCM samples.
//!
//! ## Contract
//!
//! Exactly one producer calls [`PcmRing::write`] and exactly one consumer
//! calls [`PcmRing::read`] at any time. Under that contract both operations
//! are wait-free: each is bounded by a copy of the requested span plus two
//! atomic accesses.
//!
//! Publication ordering: the producer stores samples, then publishes the
//! write cursor with `Release`; the consumer loads the write cursor with
//! `Acquire` before touching the samples. The consumer never observes an
//! advanced cursor ahead of the stored data (no torn samples). Symmetrically
//! for the read cursor, so the producer never overwrites unread samples.
//!
//! One slot stays reserved so that `read_pos == write_pos` always means
//! empty, never full.

#![allow(unsafe_code)]

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct PcmRing {
    /// Sample storage. `Cell` keeps the disjoint-index accesses of producer
    /// and consumer free of aliasing trouble; the cursor handoff below is
    /// what orders accesses to the same index.
    buf: Box<[Cell<i16>]>,
    capacity: usize,
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
}

// Soundness rests on the single-producer/single-consumer contract documented
// above: writer and reader touch disjoint index ranges, separated by the
// Release/Acquire cursor handoff.
unsafe impl Sync for PcmRing {}
unsafe impl Send for PcmRing {}

impl PcmRing {
    /// Create a ring holding up to `capacity - 1` samples.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "ring capacity must hold at least one sample");
        Self {
            buf: (0..capacity).map(|_| Cell::new(0)).collect(),
            capacity,
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Readable sample count at the latest cursor snapshot.
    pub fn available(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        (write + self.capacity - read) % self.capacity
    }

    /// Writable sample count (one slot stays reserved).
    pub fn free(&self) -> usize {
        self.capacity - 1 - self.available()
    }

    /// Store up to `data.len()` samples; returns the count actually stored.
    ///
    /// Never blocks. When space is insufficient the tail of `data` is not
    /// stored and the caller accounts the dropped samples.
    pub fn write(&self, data: &[i16]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);
        let space = (read + self.capacity - write - 1) % self.capacity;
        let to_write = data.len().min(space);
        if to_write == 0 {
            return 0;
        }

        let part1 = (self.capacity - write).min(to_write);
        for (i, &sample) in data[..part1].iter().enumerate() {
            self.buf[write + i].set(sample);
        }
        for (i, &sample) in data[part1..to_write].iter().enumerate() {
            self.buf[i].set(sample);
        }

        // Release: samples become visible before the cursor does.
        self.write_pos
            .store((write + to_write) % self.capacity, Ordering::Release);
        to_write
    }

    /// Copy up to `out.len()` samples; returns the count actually copied.
    pub fn read(&self, out: &mut [i16]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let read = self.read_pos.load(Ordering::Relaxed);
        // Acquire pairs with the producer's Release store.
        let write = self.write_pos.load(Ordering::Acquire);
        let available = (write + self.capacity - read) % self.capacity;
        let to_read = out.len().min(available);
        if to_read == 0 {
            return 0;
        }

        let part1 = (self.capacity - read).min(to_read);
        for (i, slot) in out[..part1].iter_mut().enumerate() {
            *slot = self.buf[read + i].get();
        }
        for (i, slot) in out[part1..to_read].iter_mut().enumerate() {
            *slot = self.buf[i].get();
        }

        // Release: the producer may reuse the slots only after the copy.
        self.read_pos
            .store((read + to_read) % self.capacity, Ordering::Release);
        to_read
    }

    /// Set both cursors to zero, discarding stale samples.
    ///
    /// Only the owner may call this, during a mode transition when no
    /// concurrent write or read is possible.
    pub fn reset(&self) {
        self.read_pos.store(0, Ordering::Release);
        self.write_pos.store(0, Ordering::Release);
    }
}
