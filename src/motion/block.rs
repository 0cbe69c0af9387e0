// src/motion/block.rs
use std::ops::BitOr;

use super::axis::{Axis, AxisArray, AxisSet};

pub const MAX_FANS: usize = 4;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BlockFlags(u8);

impl BlockFlags {
    /// Entry speed changed; the trapezoid must be regenerated before the
    /// executor may start this block.
    pub const RECALCULATE: Self = Self(1 << 0);
    /// The block can reach nominal speed from any entry speed, so its
    /// entry speed never depends on the block after it.
    pub const NOMINAL_LENGTH: Self = Self(1 << 1);
    /// The junction into this block was planned as a full stop.
    pub const START_FROM_FULL_HALT: Self = Self(1 << 2);
    /// Taken by the executor. Nothing but flags may change afterwards.
    pub const BUSY: Self = Self(1 << 3);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: Self, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

impl BitOr for BlockFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::fmt::Debug for BlockFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        for (flag, name) in [
            (Self::RECALCULATE, "RECALCULATE"),
            (Self::NOMINAL_LENGTH, "NOMINAL_LENGTH"),
            (Self::START_FROM_FULL_HALT, "START_FROM_FULL_HALT"),
            (Self::BUSY, "BUSY"),
        ] {
            if self.contains(flag) {
                names.push(name);
            }
        }
        write!(f, "BlockFlags({})", names.join(" | "))
    }
}

/// One planned linear move, in actuator steps.
///
/// Speeds are in mm/s along the move, rates in steps/s of the dominant
/// actuator. `accelerate_until` and `decelerate_after` are step indices
/// into the block's `step_event_count` events.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Block {
    pub flags: BlockFlags,
    pub tool: u8,

    pub steps: AxisArray<u32>,
    pub step_event_count: u32,
    pub direction: AxisSet,
    pub head_direction: AxisSet,

    pub millimeters: f64,
    pub nominal_speed: f64,
    pub nominal_rate: u32,
    pub entry_speed: f64,
    pub max_entry_speed: f64,
    /// mm/s²
    pub acceleration: f64,
    pub acceleration_steps_per_s2: u32,

    pub initial_rate: u32,
    pub final_rate: u32,
    pub accelerate_until: u32,
    pub decelerate_after: u32,

    pub fan_duty: [u8; MAX_FANS],
    pub segment_time_us: u64,
}

impl Block {
    pub fn is_busy(&self) -> bool {
        self.flags.contains(BlockFlags::BUSY)
    }

    pub fn needs_recalculation(&self) -> bool {
        self.flags.contains(BlockFlags::RECALCULATE)
    }

    pub fn accelerate_steps(&self) -> u32 {
        self.accelerate_until
    }

    pub fn cruise_steps(&self) -> u32 {
        self.decelerate_after.saturating_sub(self.accelerate_until)
    }

    pub fn decelerate_steps(&self) -> u32 {
        self.step_event_count.saturating_sub(self.decelerate_after)
    }

    /// Actuators with at least one step in this block.
    pub fn active_actuators(&self) -> AxisSet {
        self.steps.iter().filter(|(_, steps)| **steps > 0).map(|(axis, _)| axis).collect()
    }

    pub fn moves_head(&self) -> bool {
        Axis::POSITIONING.iter().any(|axis| self.steps[*axis] > 0)
    }

    /// Step rate for a speed along this block.
    pub fn rate_for_speed(&self, speed: f64) -> f64 {
        if self.nominal_speed > 0.0 {
            speed * self.nominal_rate as f64 / self.nominal_speed
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let mut flags = BlockFlags::RECALCULATE | BlockFlags::NOMINAL_LENGTH;
        assert!(flags.contains(BlockFlags::RECALCULATE));
        assert!(!flags.contains(BlockFlags::BUSY));
        flags.remove(BlockFlags::RECALCULATE);
        assert_eq!(flags, BlockFlags::NOMINAL_LENGTH);
        assert_eq!(format!("{:?}", flags), "BlockFlags(NOMINAL_LENGTH)");
    }

    #[test]
    fn test_phase_lengths() {
        let block = Block {
            step_event_count: 1000,
            accelerate_until: 200,
            decelerate_after: 900,
            steps: AxisArray::new(1000, 0, 0, 40),
            ..Block::default()
        };
        assert_eq!(block.accelerate_steps(), 200);
        assert_eq!(block.cruise_steps(), 700);
        assert_eq!(block.decelerate_steps(), 100);
        assert_eq!(block.active_actuators().iter().collect::<Vec<_>>(), vec![Axis::X, Axis::E]);
        assert!(block.moves_head());
    }
}
