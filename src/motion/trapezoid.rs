// src/motion/trapezoid.rs
//! Constant-acceleration formulas and the per-block speed profile.

use super::block::Block;

/// Distance needed to change speed from `initial` to `target` at constant
/// `acceleration`. Zero when `acceleration` is zero.
pub fn estimate_acceleration_distance(initial: f64, target: f64, acceleration: f64) -> f64 {
    if acceleration == 0.0 {
        return 0.0;
    }
    (target * target - initial * initial) / (2.0 * acceleration)
}

/// Point at which accelerating from `initial` and decelerating to `final`
/// over `distance` meet, for a block too short to reach nominal speed.
pub fn intersection_distance(initial: f64, final_: f64, acceleration: f64, distance: f64) -> f64 {
    if acceleration == 0.0 {
        return 0.0;
    }
    (2.0 * acceleration * distance - initial * initial + final_ * final_) / (4.0 * acceleration)
}

/// Speed reachable after `distance` from `target_velocity` with
/// `acceleration`: `sqrt(v² - 2·a·d)`. Pass a negative acceleration for
/// the highest entry speed that can still slow to `target_velocity`.
pub fn max_allowable_speed(acceleration: f64, target_velocity: f64, distance: f64) -> f64 {
    let radicand = target_velocity * target_velocity - 2.0 * acceleration * distance;
    if radicand > 0.0 { radicand.sqrt() } else { 0.0 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrapezoidProfile {
    pub initial_rate: u32,
    pub final_rate: u32,
    pub accelerate_until: u32,
    pub decelerate_after: u32,
}

impl TrapezoidProfile {
    pub fn apply(&self, block: &mut Block) {
        block.initial_rate = self.initial_rate;
        block.final_rate = self.final_rate;
        block.accelerate_until = self.accelerate_until;
        block.decelerate_after = self.decelerate_after;
    }
}

/// Step-space profile of `block` between `entry_speed` and `exit_speed`.
///
/// Rates never drop below `minimal_step_rate`. Acceleration steps round
/// up and deceleration steps round down, so a block never arrives at its
/// exit faster than planned.
pub fn compute_trapezoid(
    block: &Block,
    entry_speed: f64,
    exit_speed: f64,
    minimal_step_rate: u32,
) -> TrapezoidProfile {
    let count = block.step_event_count as i64;
    let initial_rate = to_rate(block.rate_for_speed(entry_speed).ceil()).max(minimal_step_rate);
    let final_rate = to_rate(block.rate_for_speed(exit_speed).ceil()).max(minimal_step_rate);

    let nominal = block.nominal_rate as f64;
    let accel = block.acceleration_steps_per_s2 as f64;
    let initial = initial_rate as f64;
    let final_ = final_rate as f64;

    let accelerate_steps =
        (estimate_acceleration_distance(initial, nominal, accel).ceil() as i64).max(0);
    let decelerate_steps =
        (estimate_acceleration_distance(nominal, final_, -accel).floor() as i64).max(0);

    let (accelerate_until, decelerate_after) = if accelerate_steps + decelerate_steps <= count {
        (accelerate_steps, count - decelerate_steps)
    } else {
        // Never reaches nominal: accelerate up to the meeting point, then
        // decelerate straight away.
        let meet = (intersection_distance(initial, final_, accel, count as f64).ceil() as i64)
            .clamp(0, count);
        (meet, meet)
    };

    TrapezoidProfile {
        initial_rate,
        final_rate,
        accelerate_until: accelerate_until as u32,
        decelerate_after: decelerate_after as u32,
    }
}

fn to_rate(rate: f64) -> u32 {
    if rate.is_finite() && rate > 0.0 {
        rate.min(u32::MAX as f64) as u32
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(steps: u32, nominal_speed: f64, nominal_rate: u32, accel_steps: u32) -> Block {
        Block {
            step_event_count: steps,
            millimeters: steps as f64 / 80.0,
            nominal_speed,
            nominal_rate,
            acceleration_steps_per_s2: accel_steps,
            acceleration: accel_steps as f64 / 80.0,
            ..Block::default()
        }
    }

    #[test]
    fn test_acceleration_distance() {
        assert_eq!(estimate_acceleration_distance(0.0, 10.0, 0.0), 0.0);
        assert!((estimate_acceleration_distance(0.0, 100.0, 1000.0) - 5.0).abs() < 1e-12);
        assert!((estimate_acceleration_distance(100.0, 0.0, -1000.0) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_max_allowable_speed() {
        // From rest over 5 mm at 1000 mm/s² reaches 100 mm/s.
        assert!((max_allowable_speed(-1000.0, 0.0, 5.0) - 100.0).abs() < 1e-9);
        assert_eq!(max_allowable_speed(1000.0, 10.0, 5.0), 0.0);
    }

    #[test]
    fn test_full_trapezoid() {
        // 100 mm at 80 steps/mm, 50 mm/s nominal, 1000 mm/s².
        let b = block(8000, 50.0, 4000, 80_000);
        let profile = compute_trapezoid(&b, 0.0, 0.0, 120);
        assert_eq!(profile.initial_rate, 120);
        assert_eq!(profile.final_rate, 120);
        // (4000² - 120²) / 160000 = 99.91 -> 100
        assert_eq!(profile.accelerate_until, 100);
        // 8000 - floor(99.91)
        assert_eq!(profile.decelerate_after, 7901);
    }

    #[test]
    fn test_triangle_when_too_short() {
        let b = block(100, 50.0, 4000, 80_000);
        let profile = compute_trapezoid(&b, 0.0, 0.0, 120);
        assert_eq!(profile.accelerate_until, profile.decelerate_after);
        assert_eq!(profile.accelerate_until, 50);
    }

    #[test]
    fn test_zero_acceleration_cruises() {
        let b = block(500, 50.0, 4000, 0);
        let profile = compute_trapezoid(&b, 10.0, 10.0, 120);
        assert_eq!(profile.accelerate_until, 0);
        assert_eq!(profile.decelerate_after, 500);
        assert_eq!(profile.initial_rate, 800);
    }

    #[test]
    fn test_rates_below_nominal_stay_ordered() {
        // Nominal rate under the floor: both phases collapse to zero.
        let b = block(50, 0.5, 40, 80_000);
        let profile = compute_trapezoid(&b, 0.0, 0.0, 120);
        assert!(profile.accelerate_until <= profile.decelerate_after);
        assert!(profile.decelerate_after <= 50);
    }
}
