// src/motion/planner/lookahead.rs
//! Entry-speed relaxation over the queued blocks.
//!
//! The reverse pass raises entry speeds as far as each block can still
//! decelerate into its successor; the forward pass lowers them to what the
//! predecessor can actually reach. Every write goes through the queue's
//! critical section and is refused for blocks the executor already owns.

use crate::motion::block::{Block, BlockFlags};
use crate::motion::queue::BlockQueue;
use crate::motion::trapezoid::{compute_trapezoid, max_allowable_speed};

/// Recomputes entry speeds and profiles after a block was appended.
pub fn recalculate(queue: &BlockQueue, minimal_step_rate: u32) {
    reverse_pass(queue);
    forward_pass(queue);
    recalculate_trapezoids(queue, minimal_step_rate);
}

fn reverse_entry(current: &Block, next_entry: f64) -> f64 {
    let max_entry = current.max_entry_speed;
    if current.flags.contains(BlockFlags::NOMINAL_LENGTH) || max_entry <= next_entry {
        max_entry
    } else {
        max_entry.min(max_allowable_speed(
            -current.acceleration,
            next_entry,
            current.millimeters,
        ))
    }
}

/// Newest to oldest. Stops at a block that starts from a full halt, since
/// nothing after it can change anything before it.
pub fn reverse_pass(queue: &BlockQueue) {
    let range = queue.queued();
    if range.end - range.start < 2 {
        return;
    }
    let newest = range.end - 1;
    let Some(mut next_entry) = queue.snapshot(newest).map(|b| b.entry_speed) else {
        return;
    };

    for seq in (range.start + 1..newest).rev() {
        let Some(current) = queue.snapshot(seq) else {
            break;
        };
        if current.flags.contains(BlockFlags::START_FROM_FULL_HALT) {
            break;
        }
        if current.entry_speed != current.max_entry_speed {
            let entry = reverse_entry(&current, next_entry);
            if entry != current.entry_speed {
                let written = queue.update_entry(seq, |block| {
                    block.entry_speed = entry;
                    block.flags.insert(BlockFlags::RECALCULATE);
                });
                if !written {
                    break;
                }
                tracing::trace!("Reverse pass: block {} entry {:.3}", seq, entry);
            }
            next_entry = entry;
        } else {
            next_entry = current.entry_speed;
        }
    }
}

/// Oldest to newest. A block cannot enter faster than its predecessor can
/// accelerate to over its own length.
pub fn forward_pass(queue: &BlockQueue) {
    let range = queue.queued();
    if range.is_empty() {
        return;
    }
    let Some(mut previous) = queue.snapshot(range.start) else {
        return;
    };

    for seq in range.start + 1..range.end {
        let Some(mut current) = queue.snapshot(seq) else {
            break;
        };
        if !previous.flags.contains(BlockFlags::NOMINAL_LENGTH)
            && previous.entry_speed < current.entry_speed
        {
            let reachable = max_allowable_speed(
                -previous.acceleration,
                previous.entry_speed,
                previous.millimeters,
            );
            if reachable < current.entry_speed {
                let written = queue.update_entry(seq, |block| {
                    block.entry_speed = reachable;
                    block.flags.insert(BlockFlags::RECALCULATE);
                });
                if written {
                    tracing::trace!("Forward pass: block {} entry {:.3}", seq, reachable);
                    current.entry_speed = reachable;
                }
            }
        }
        previous = current;
    }
}

/// Regenerates the profile of every block whose entry or exit moved. The
/// newest block always plans to stop at its end.
pub fn recalculate_trapezoids(queue: &BlockQueue, minimal_step_rate: u32) {
    let range = queue.queued();
    if range.is_empty() {
        return;
    }
    let mut seq = range.start;
    let Some(mut current) = queue.snapshot(seq) else {
        return;
    };

    while seq + 1 < range.end {
        let Some(next) = queue.snapshot(seq + 1) else {
            return;
        };
        if current.needs_recalculation() || next.needs_recalculation() {
            let profile =
                compute_trapezoid(&current, current.entry_speed, next.entry_speed, minimal_step_rate);
            queue.update_trapezoid(seq, |block| profile.apply(block));
        }
        seq += 1;
        current = next;
    }

    let profile = compute_trapezoid(&current, current.entry_speed, 0.0, minimal_step_rate);
    queue.update_trapezoid(seq, |block| profile.apply(block));
}
