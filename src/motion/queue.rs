// src/motion/queue.rs
//! Ring of planned blocks shared by exactly one producer (the planner)
//! and one consumer (the step executor).
//!
//! `head` and `tail` are monotonic sequence numbers; a block's slot is
//! `seq % capacity`. One slot always stays free, so at most
//! `capacity - 1` blocks are queued. Each slot sits behind its own lock,
//! which is the critical section both sides use to read or change a
//! block. When two slots are locked, the older sequence number is always
//! locked first.

use std::ops::{Deref, DerefMut, Range};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use super::block::{Block, BlockFlags};

#[derive(Debug)]
struct Slot {
    seq: u64,
    block: Block,
}

#[derive(Debug)]
pub struct BlockQueue {
    slots: Box<[Mutex<Slot>]>,
    head: AtomicU64,
    tail: AtomicU64,
    runtime_us: AtomicU64,
}

/// Exclusive access to one queued block, released on drop.
pub struct CriticalSection<'a> {
    guard: MutexGuard<'a, Slot>,
}

impl CriticalSection<'_> {
    pub fn seq(&self) -> u64 {
        self.guard.seq
    }
}

impl Deref for CriticalSection<'_> {
    type Target = Block;

    fn deref(&self) -> &Block {
        &self.guard.block
    }
}

impl DerefMut for CriticalSection<'_> {
    fn deref_mut(&mut self) -> &mut Block {
        &mut self.guard.block
    }
}

/// A block handed to the executor. The copy is immutable; retiring it
/// needs the ticket so a block dropped by a quick stop cannot retire a
/// newer one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveBlock {
    seq: u64,
    pub block: Block,
}

impl ActiveBlock {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl BlockQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        let slots = (0..capacity)
            .map(|_| Mutex::new(Slot { seq: u64::MAX, block: Block::default() }))
            .collect();
        Self {
            slots,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            runtime_us: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, seq: u64) -> &Mutex<Slot> {
        &self.slots[(seq % self.slots.len() as u64) as usize]
    }

    /// Sequence number the next pushed block will get.
    pub fn head_seq(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Sequence number of the oldest queued block.
    pub fn tail_seq(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    /// Sequence numbers currently queued, oldest first.
    pub fn queued(&self) -> Range<u64> {
        let tail = self.tail_seq();
        let head = self.head_seq();
        tail..head.max(tail)
    }

    pub fn len(&self) -> usize {
        let range = self.queued();
        (range.end - range.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() + 1 >= self.capacity()
    }

    /// Advisory time left in queued blocks that the executor has not
    /// started yet.
    pub fn estimated_runtime(&self) -> Duration {
        Duration::from_micros(self.runtime_us.load(Ordering::Relaxed))
    }

    pub fn critical_section(&self, seq: u64) -> Option<CriticalSection<'_>> {
        let guard = self.slot(seq).lock();
        (guard.seq == seq).then(|| CriticalSection { guard })
    }

    pub fn snapshot(&self, seq: u64) -> Option<Block> {
        self.critical_section(seq).map(|cs| *cs)
    }

    // ---- producer side ----

    /// Appends a block. Returns its sequence number, or `None` when the
    /// ring is full.
    pub fn push(&self, block: Block) -> Option<u64> {
        if self.is_full() {
            return None;
        }
        let seq = self.head.load(Ordering::Acquire);
        {
            let mut slot = self.slot(seq).lock();
            slot.seq = seq;
            slot.block = block;
        }
        self.runtime_us.fetch_add(block.segment_time_us, Ordering::Relaxed);
        self.head.store(seq + 1, Ordering::Release);
        Some(seq)
    }

    /// Flags a queued, not yet taken block for recalculation. Returns
    /// false when the executor already owns it.
    pub fn mark_for_recalculation(&self, seq: u64) -> bool {
        if seq < self.tail_seq() {
            return false;
        }
        match self.critical_section(seq) {
            Some(mut block) if !block.is_busy() => {
                block.flags.insert(BlockFlags::RECALCULATE);
                true
            }
            _ => false,
        }
    }

    /// Changes a block's entry side. Refused for the tail block, a taken
    /// block, or a block whose predecessor is taken: their entry speed
    /// is already fixed.
    pub fn update_entry(&self, seq: u64, f: impl FnOnce(&mut Block)) -> bool {
        if seq == 0 || seq <= self.tail_seq() {
            return false;
        }
        let previous = self.slot(seq - 1).lock();
        let mut current = self.slot(seq).lock();
        if previous.seq != seq - 1 || current.seq != seq {
            return false;
        }
        if previous.block.is_busy() || current.block.is_busy() {
            return false;
        }
        f(&mut current.block);
        true
    }

    /// Writes new timing for a block and clears its recalculate flag. The
    /// write is skipped if the executor has taken the block.
    pub fn update_trapezoid(&self, seq: u64, f: impl FnOnce(&mut Block)) -> bool {
        let Some(mut block) = self.critical_section(seq) else {
            return false;
        };
        block.flags.remove(BlockFlags::RECALCULATE);
        if block.is_busy() {
            return false;
        }
        f(&mut *block);
        true
    }

    /// Drops every queued block, including one the executor is running.
    /// Returns how many were dropped.
    pub fn discard_all(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let mut tail = self.tail.load(Ordering::Acquire);
        while tail < head {
            match self
                .tail
                .compare_exchange(tail, head, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.runtime_us.store(0, Ordering::Relaxed);
                    return (head - tail) as usize;
                }
                Err(actual) => tail = actual,
            }
        }
        0
    }

    // ---- consumer side ----

    pub fn is_block_available(&self) -> bool {
        self.tail_seq() < self.head_seq()
    }

    /// Hands the tail block to the executor and marks it busy. Returns
    /// `None` while the queue is empty or while the tail or its successor
    /// still waits for trapezoid recalculation.
    pub fn take_current_block(&self) -> Option<ActiveBlock> {
        let tail = self.tail_seq();
        if tail >= self.head_seq() {
            self.runtime_us.store(0, Ordering::Relaxed);
            return None;
        }

        let mut current = self.slot(tail).lock();
        if current.seq != tail || self.tail_seq() != tail {
            return None;
        }
        if current.block.needs_recalculation() {
            return None;
        }
        if tail + 1 < self.head_seq() {
            let next = self.slot(tail + 1).lock();
            if next.seq == tail + 1 && next.block.needs_recalculation() {
                return None;
            }
        }

        if !current.block.is_busy() {
            current.block.flags.insert(BlockFlags::BUSY);
            let spent = current.block.segment_time_us;
            let _ = self
                .runtime_us
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |t| {
                    Some(t.saturating_sub(spent))
                });
        }
        Some(ActiveBlock { seq: tail, block: current.block })
    }

    /// Frees the executor's finished block. Returns false if the block was
    /// already dropped by [`BlockQueue::discard_all`].
    pub fn retire_current_block(&self, active: &ActiveBlock) -> bool {
        self.tail
            .compare_exchange(active.seq, active.seq + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
