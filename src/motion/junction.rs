// src/motion/junction.rs
//! Jerk-limited speeds at the start of a block and at the junction with
//! the block before it.

use super::axis::{Axis, AxisArray};

/// Junctions whose planned speed is within this factor of the smaller
/// nominal speed are checked for a stop-and-go start instead.
const FULL_HALT_THRESHOLD: f64 = 0.99;

/// Velocity summary of the previously planned block.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PreviousSegment {
    /// Per-actuator velocity, mm/s.
    pub speeds: AxisArray<f64>,
    pub nominal_speed: f64,
    pub safe_speed: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JunctionPlan {
    pub max_entry_speed: f64,
    pub start_from_full_halt: bool,
}

/// Highest speed at which the block may start from rest without any
/// actuator exceeding its jerk limit.
pub fn safe_speed(nominal_speed: f64, speeds: &AxisArray<f64>, max_jerk: &AxisArray<f64>) -> f64 {
    let mut factor: f64 = 1.0;
    for axis in Axis::ALL {
        let jerk = speeds[axis].abs();
        if jerk > max_jerk[axis] {
            factor = factor.min(max_jerk[axis] / jerk);
        }
    }
    nominal_speed * factor
}

/// Speed change an actuator sees going from `exit` (end of the previous
/// block) to `entry` (start of this one). When the actuator keeps its
/// direction it only has to absorb the difference; on a reversal it has to
/// stop and restart, so the larger magnitude counts.
pub fn actuator_jerk(exit: f64, entry: f64) -> f64 {
    if exit > entry {
        if entry > 0.0 || exit < 0.0 { exit - entry } else { exit.max(-entry) }
    } else if entry < 0.0 || exit > 0.0 {
        entry - exit
    } else {
        (-exit).max(entry)
    }
}

/// Plans the entry of a block following `previous`.
///
/// The junction starts at the smaller nominal speed. Each actuator's
/// velocities are scaled to that speed and the whole junction is slowed
/// until every actuator's jerk fits its limit. If both blocks could start
/// from rest at least as fast, the block is planned as a full halt at
/// its safe speed instead.
pub fn plan_junction(
    previous: &PreviousSegment,
    nominal_speed: f64,
    speeds: &AxisArray<f64>,
    safe_speed: f64,
    max_jerk: &AxisArray<f64>,
) -> JunctionPlan {
    let previous_larger = previous.nominal_speed > nominal_speed;
    let junction = previous.nominal_speed.min(nominal_speed);
    let exit_scale = if previous_larger { junction / previous.nominal_speed } else { 1.0 };
    let entry_scale = if previous_larger { 1.0 } else { junction / nominal_speed };

    let mut factor: f64 = 1.0;
    for axis in Axis::ALL {
        let exit = previous.speeds[axis] * exit_scale;
        let entry = speeds[axis] * entry_scale;
        let jerk = actuator_jerk(exit, entry);
        if jerk > max_jerk[axis] {
            factor = factor.min(max_jerk[axis] / jerk);
        }
    }
    let vmax_junction = junction * factor;

    let threshold = vmax_junction * FULL_HALT_THRESHOLD;
    if previous.safe_speed > threshold && safe_speed > threshold {
        JunctionPlan { max_entry_speed: safe_speed, start_from_full_halt: true }
    } else {
        JunctionPlan { max_entry_speed: vmax_junction, start_from_full_halt: false }
    }
}

/// Entry for a block with no usable predecessor.
pub fn plan_from_rest(safe_speed: f64) -> JunctionPlan {
    JunctionPlan { max_entry_speed: safe_speed, start_from_full_halt: true }
}
