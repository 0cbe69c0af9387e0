// src/motion/planner/mod.rs
//! Producer side of the motion pipeline: turns requested moves into
//! blocks, links them through junction speeds and keeps the queued
//! profiles consistent.

mod lookahead;

pub use lookahead::{forward_pass, recalculate, recalculate_trapezoids, reverse_pass};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, ConfigError, PlannerConfig};

use super::axis::{Axis, AxisArray, AxisSet};
use super::block::{Block, BlockFlags, MAX_FANS};
use super::junction::{self, PreviousSegment};
use super::kinematics::{KinematicMapper, create_kinematics};
use super::leveling::Leveling;
use super::queue::BlockQueue;
use super::stepper::StepperDriver;
use super::trapezoid::max_allowable_speed;
use super::{MotionError, QueueStats};

/// A previous block slower than this (mm/s) is treated as standing still.
const MIN_PREVIOUS_NOMINAL_SPEED: f64 = 0.0001;

/// Largest Planner Position magnitude in steps. Differences of two
/// positions, and the coupled sums built from them, stay inside `i64`.
const MAX_POSITION_STEPS: f64 = (i64::MAX / 4) as f64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Too few steps to plan; the position did not advance, so the
    /// distance carries over into the next move.
    Absorbed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisActivity {
    /// Actuators moved by any queued block.
    pub active: AxisSet,
    /// Fan duty of the block at the tail, or the current setting when
    /// nothing is queued.
    pub fan_duty: [u8; MAX_FANS],
}

/// Per-axis limits and accelerations, adjustable at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionLimits {
    pub steps_per_mm: AxisArray<f64>,
    pub steps_to_mm: AxisArray<f64>,
    pub max_feedrate: AxisArray<f64>,
    pub max_acceleration: AxisArray<f64>,
    /// `max_acceleration` in steps/s².
    pub max_acceleration_steps: AxisArray<u64>,
    pub max_jerk: AxisArray<f64>,
    pub acceleration: f64,
    pub retract_acceleration: f64,
    pub travel_acceleration: f64,
    pub min_feedrate: f64,
    pub min_travel_feedrate: f64,
}

impl MotionLimits {
    pub fn from_config(config: &Config) -> Self {
        let mut limits = Self {
            steps_per_mm: config.axes.collect(|a| a.steps_per_mm),
            steps_to_mm: AxisArray::splat(0.0),
            max_feedrate: config.axes.collect(|a| a.max_feedrate),
            max_acceleration: config.axes.collect(|a| a.max_acceleration),
            max_acceleration_steps: AxisArray::splat(0),
            max_jerk: config.axes.collect(|a| a.max_jerk),
            acceleration: config.planner.acceleration,
            retract_acceleration: config.planner.retract_acceleration,
            travel_acceleration: config.planner.travel_acceleration,
            min_feedrate: config.planner.min_feedrate,
            min_travel_feedrate: config.planner.min_travel_feedrate,
        };
        limits.refresh_steps_to_mm();
        limits.reset_acceleration_rates();
        limits
    }

    fn refresh_steps_to_mm(&mut self) {
        self.steps_to_mm = self.steps_per_mm.map(|_, steps| 1.0 / steps);
    }

    fn reset_acceleration_rates(&mut self) {
        self.max_acceleration_steps = AxisArray::from_fn(|axis| {
            (self.max_acceleration[axis] * self.steps_per_mm[axis]) as u64
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ToolState {
    flow_percentage: f64,
    volumetric_multiplier: f64,
}

impl ToolState {
    fn extrusion_factor(&self) -> f64 {
        self.flow_percentage / 100.0 * self.volumetric_multiplier
    }
}

impl Default for ToolState {
    fn default() -> Self {
        Self { flow_percentage: 100.0, volumetric_multiplier: 1.0 }
    }
}

pub struct Planner<D: StepperDriver> {
    settings: PlannerConfig,
    limits: MotionLimits,
    mapper: KinematicMapper,
    queue: Arc<BlockQueue>,
    driver: D,
    /// Planner Position in logical axis steps.
    position: AxisArray<i64>,
    /// Planner Position in leveled mm.
    position_mm: AxisArray<f64>,
    /// Actuator steps the logical position cannot express, left over
    /// after resynchronizing from odd coupled actuator counts.
    actuator_remainder: AxisArray<i64>,
    /// Actuators powered down while no queued block moves them.
    disable_inactive: AxisSet,
    previous: PreviousSegment,
    tools: Vec<ToolState>,
    fan_duty: [u8; MAX_FANS],
    extrusion_blocked: bool,
    idle: Box<dyn FnMut() + Send>,
}

impl<D: StepperDriver> fmt::Debug for Planner<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Planner")
            .field("kinematics", &self.mapper.kinematics().kind())
            .field("position", &self.position)
            .field("queued", &self.queue.len())
            .field("capacity", &self.queue.capacity())
            .finish()
    }
}

impl<D: StepperDriver> Planner<D> {
    pub fn new(config: &Config, queue: Arc<BlockQueue>, driver: D) -> Result<Self, ConfigError> {
        config.validate()?;
        let leveling = match &config.leveling {
            Some(leveling) => Leveling::from_config(leveling)?,
            None => None,
        };
        let mapper = KinematicMapper::new(create_kinematics(config.planner.kinematics), leveling);
        tracing::debug!(
            "Planner created: {:?} kinematics, {} block buffer",
            config.planner.kinematics,
            queue.capacity()
        );
        Ok(Self {
            settings: config.planner.clone(),
            limits: MotionLimits::from_config(config),
            mapper,
            queue,
            driver,
            position: AxisArray::splat(0),
            position_mm: AxisArray::splat(0.0),
            actuator_remainder: AxisArray::splat(0),
            disable_inactive: config.planner.disable_inactive.iter().copied().collect(),
            previous: PreviousSegment::default(),
            tools: vec![ToolState::default(); config.planner.tool_count as usize],
            fan_duty: [0; MAX_FANS],
            extrusion_blocked: false,
            idle: Box::new(std::thread::yield_now),
        })
    }

    /// Plans a straight move from the Planner Position to `target`
    /// (logical mm, extruder included) at `feed_rate` mm/s.
    ///
    /// Blocks, calling the idle hook, while the queue is full. A rejected
    /// move leaves the Planner Position and the queue untouched.
    pub fn enqueue(
        &mut self,
        target: AxisArray<f64>,
        feed_rate: f64,
        tool: u8,
    ) -> Result<EnqueueOutcome, MotionError> {
        if !(feed_rate.is_finite() && feed_rate > 0.0) {
            return Err(MotionError::InvalidFeedRate(feed_rate));
        }
        check_finite(&target)?;
        let tool_state = self.tool(tool)?;

        let target_mm = self.mapper.to_planner(&target);
        let target_steps = self.target_steps(&target_mm)?;
        let mut delta = AxisArray::splat(0);
        for axis in Axis::ALL {
            delta[axis] = target_steps[axis]
                .checked_sub(self.position[axis])
                .ok_or(MotionError::TargetOutOfRange(axis))?;
        }

        let e_refused = delta[Axis::E] != 0 && self.extrusion_refused(delta[Axis::E], &tool_state);
        if e_refused {
            delta[Axis::E] = 0;
        }

        let kinematics = self.mapper.kinematics();
        let e_steps = delta[Axis::E] as f64 * tool_state.extrusion_factor();
        let e_count = e_steps.abs().round();
        if e_count > u32::MAX as f64 {
            return Err(MotionError::TargetOutOfRange(Axis::E));
        }
        let mut step_delta = kinematics.steps_from_delta(&delta)?;
        step_delta.steps[Axis::E] = e_count as u32;
        step_delta.direction.set(Axis::E, e_steps < 0.0);
        step_delta.head_direction.set(Axis::E, e_steps < 0.0);

        if e_refused {
            // The extruder position still advances so later moves stay relative to it.
            self.position[Axis::E] = target_steps[Axis::E];
            self.position_mm[Axis::E] = target_mm[Axis::E];
        }

        let step_event_count = step_delta.steps.values().copied().max().unwrap_or(0);
        if step_event_count < self.settings.min_steps_per_segment {
            tracing::debug!("Skipping very small move: {} steps", step_event_count);
            return Ok(EnqueueOutcome::Absorbed);
        }

        self.wait_for_space();

        let kinematics = self.mapper.kinematics();
        let steps = step_delta.steps;
        let extruding = steps[Axis::E] > 0;
        let moves_head = Axis::POSITIONING.iter().any(|axis| steps[*axis] > 0);
        let feed_rate = feed_rate.max(if extruding {
            self.limits.min_feedrate
        } else {
            self.limits.min_travel_feedrate
        });

        let e_mm = e_steps * self.limits.steps_to_mm[Axis::E];
        let mut head_mm = kinematics.head_travel_mm(&delta, &self.limits.steps_to_mm);
        let mut actuator_mm = kinematics.actuator_travel_mm(&step_delta, &self.limits.steps_to_mm);
        head_mm[Axis::E] = e_mm;
        actuator_mm[Axis::E] = e_mm;

        let min_steps = self.settings.min_steps_per_segment;
        let millimeters = if Axis::POSITIONING.iter().all(|axis| steps[*axis] < min_steps) {
            e_mm.abs()
        } else {
            Axis::POSITIONING
                .iter()
                .map(|axis| head_mm[*axis] * head_mm[*axis])
                .sum::<f64>()
                .sqrt()
        };

        let moves_queued = self.queue.len();
        let mut inverse_mm_s = feed_rate / millimeters;
        if self.settings.slowdown {
            let segment_time_us = (1_000_000.0 / inverse_mm_s).round();
            let min_segment_time_us = self.settings.min_segment_time_us as f64;
            let half = self.queue.capacity() / 2;
            if (2..half).contains(&moves_queued) && segment_time_us < min_segment_time_us {
                let stretched = segment_time_us
                    + (2.0 * (min_segment_time_us - segment_time_us) / moves_queued as f64).round();
                inverse_mm_s = 1_000_000.0 / stretched;
            }
        }

        let mut nominal_speed = millimeters * inverse_mm_s;
        let mut nominal_rate = (step_event_count as f64 * inverse_mm_s).ceil();
        let mut speeds = actuator_mm.map(|_, mm| mm * inverse_mm_s);

        let mut speed_factor: f64 = 1.0;
        for axis in Axis::ALL {
            let speed = speeds[axis].abs();
            if speed > self.limits.max_feedrate[axis] {
                speed_factor = speed_factor.min(self.limits.max_feedrate[axis] / speed);
            }
        }
        if speed_factor < 1.0 {
            speeds = speeds.map(|_, v| v * speed_factor);
            nominal_speed *= speed_factor;
            nominal_rate *= speed_factor;
        }
        let nominal_rate = (nominal_rate as u32).max(1);
        let segment_time_us = (1_000_000.0 * millimeters / nominal_speed).round() as u64;

        let steps_per_mm = step_event_count as f64 / millimeters;
        let base_acceleration = if !moves_head {
            self.limits.retract_acceleration
        } else if extruding {
            self.limits.acceleration
        } else {
            self.limits.travel_acceleration
        };
        let mut accel = (base_acceleration * steps_per_mm).ceil() as u64;
        for axis in Axis::ALL {
            let axis_steps = steps[axis] as u64;
            let axis_max = self.limits.max_acceleration_steps[axis];
            if axis_steps > 0 && axis_max < accel {
                let comp = axis_max.saturating_mul(step_event_count as u64);
                if accel.saturating_mul(axis_steps) > comp {
                    accel = comp / axis_steps;
                }
            }
        }
        let acceleration_steps_per_s2 = accel.min(u32::MAX as u64) as u32;
        let acceleration = acceleration_steps_per_s2 as f64 / steps_per_mm;

        let safe_speed = junction::safe_speed(nominal_speed, &speeds, &self.limits.max_jerk);
        let linked = self
            .queue
            .head_seq()
            .checked_sub(1)
            .is_some_and(|seq| self.queue.mark_for_recalculation(seq));
        let plan = if linked && self.previous.nominal_speed > MIN_PREVIOUS_NOMINAL_SPEED {
            junction::plan_junction(
                &self.previous,
                nominal_speed,
                &speeds,
                safe_speed,
                &self.limits.max_jerk,
            )
        } else {
            junction::plan_from_rest(safe_speed)
        };

        let v_allowable = max_allowable_speed(-acceleration, 0.0, millimeters);
        let mut flags = BlockFlags::RECALCULATE;
        flags.set(BlockFlags::NOMINAL_LENGTH, nominal_speed <= v_allowable);
        flags.set(BlockFlags::START_FROM_FULL_HALT, plan.start_from_full_halt);

        let block = Block {
            flags,
            tool,
            steps,
            step_event_count,
            direction: step_delta.direction,
            head_direction: step_delta.head_direction,
            millimeters,
            nominal_speed,
            nominal_rate,
            entry_speed: plan.max_entry_speed.min(v_allowable),
            max_entry_speed: plan.max_entry_speed,
            acceleration,
            acceleration_steps_per_s2,
            fan_duty: self.fan_duty,
            segment_time_us,
            ..Block::default()
        };

        self.enable_actuators(&block);
        let seq = loop {
            match self.queue.push(block) {
                Some(seq) => break seq,
                None => (self.idle)(),
            }
        };

        self.position = target_steps;
        self.position_mm = target_mm;
        self.previous = PreviousSegment { speeds, nominal_speed, safe_speed };

        recalculate(&self.queue, self.settings.minimal_step_rate);
        self.driver.wake();
        tracing::debug!(
            "Planned block {}: {} steps, {:.3} mm at {:.2} mm/s (entry {:.2})",
            seq,
            step_event_count,
            millimeters,
            nominal_speed,
            block.entry_speed
        );
        Ok(EnqueueOutcome::Queued)
    }

    fn wait_for_space(&mut self) {
        while self.queue.is_full() {
            self.check_axes_activity();
            (self.idle)();
        }
    }

    /// Waits, calling the idle hook, until the executor has finished
    /// every queued block.
    pub fn synchronize(&mut self) {
        while !self.queue.is_empty() {
            self.check_axes_activity();
            (self.idle)();
        }
    }

    fn tool(&self, tool: u8) -> Result<ToolState, MotionError> {
        self.tools.get(tool as usize).copied().ok_or(MotionError::UnknownTool {
            tool,
            count: self.settings.tool_count,
        })
    }

    fn extrusion_refused(&self, e_steps: i64, tool: &ToolState) -> bool {
        if self.extrusion_blocked {
            tracing::warn!("Cold extrusion prevented");
            return true;
        }
        if let Some(limit) = self.settings.max_extrude_length {
            let length = (e_steps as f64 * tool.extrusion_factor() * self.limits.steps_to_mm[Axis::E]).abs();
            if length > limit {
                tracing::warn!("Too long extrusion prevented: {:.2} mm", length);
                return true;
            }
        }
        false
    }

    /// Widens an actuator set to whole coupled pairs.
    fn with_coupled(&self, mut active: AxisSet) -> AxisSet {
        if let Some(pair) = self.mapper.kinematics().coupled_actuators() {
            if pair.iter().any(|axis| active.contains(*axis)) {
                pair.iter().for_each(|axis| active.insert(*axis));
            }
        }
        active
    }

    fn enable_actuators(&self, block: &Block) {
        let active = self.with_coupled(block.active_actuators());
        for axis in active.iter() {
            match axis {
                Axis::E => self.driver.enable_extruder(block.tool),
                _ => self.driver.enable_actuator(axis),
            }
        }
    }

    fn axis_steps(&self, axis: Axis, mm: f64) -> Result<i64, MotionError> {
        let steps = (mm * self.limits.steps_per_mm[axis]).round();
        if steps.is_finite() && steps.abs() <= MAX_POSITION_STEPS {
            Ok(steps as i64)
        } else {
            Err(MotionError::TargetOutOfRange(axis))
        }
    }

    fn target_steps(&self, mm: &AxisArray<f64>) -> Result<AxisArray<i64>, MotionError> {
        let mut steps = AxisArray::splat(0);
        for axis in Axis::ALL {
            steps[axis] = self.axis_steps(axis, mm[axis])?;
        }
        Ok(steps)
    }

    fn reset_previous(&mut self) {
        self.previous = PreviousSegment::default();
    }

    // ---- position ----

    /// Sets the Planner Position from logical mm and pushes the matching
    /// actuator positions to the driver.
    pub fn set_position(&mut self, logical: AxisArray<f64>) -> Result<(), MotionError> {
        check_finite(&logical)?;
        let planner_mm = self.mapper.to_planner(&logical);
        self.set_planner_position(planner_mm)
    }

    /// Sets one axis in planner coordinates (leveling is not applied).
    pub fn set_axis_position(&mut self, axis: Axis, value: f64) -> Result<(), MotionError> {
        if !value.is_finite() {
            return Err(MotionError::NonFiniteTarget(axis));
        }
        let mut position = self.position;
        position[axis] = self.axis_steps(axis, value)?;

        let kinematics = self.mapper.kinematics();
        let actuator = kinematics.actuator_position(&position)?;
        let affected: AxisSet = match kinematics.coupled_actuators() {
            Some(pair) if pair.contains(&axis) => pair.into_iter().collect(),
            _ => [axis].into_iter().collect(),
        };
        self.position = position;
        self.position_mm[axis] = value;
        for actuator_axis in affected.iter() {
            self.driver.set_actuator_position(actuator_axis, actuator[actuator_axis]);
            self.actuator_remainder[actuator_axis] = 0;
            self.previous.speeds[actuator_axis] = 0.0;
        }
        tracing::debug!("Planner {} position set to {}", axis, self.position[axis]);
        Ok(())
    }

    /// Sets the Planner Position from planner mm and pushes the matching
    /// actuator positions. Nothing changes if the position is out of range.
    fn set_planner_position(&mut self, planner_mm: AxisArray<f64>) -> Result<(), MotionError> {
        let position = self.target_steps(&planner_mm)?;
        let actuator = self.mapper.kinematics().actuator_position(&position)?;
        self.position_mm = planner_mm;
        self.position = position;
        self.actuator_remainder = AxisArray::splat(0);
        for axis in Axis::ALL {
            self.driver.set_actuator_position(axis, actuator[axis]);
        }
        self.reset_previous();
        tracing::debug!("Planner position set to {:?}", self.position);
        Ok(())
    }

    /// Reloads the Planner Position from the executor's step counters.
    pub fn sync_from_steppers(&mut self) {
        let actuator = self.driver.report_axis_positions();
        let kinematics = self.mapper.kinematics();
        let position = kinematics.logical_position(&actuator);
        self.actuator_remainder = kinematics.actuator_position(&position).map_or(
            AxisArray::splat(0),
            |mapped| AxisArray::from_fn(|axis| actuator[axis].saturating_sub(mapped[axis])),
        );
        self.position = position;
        self.position_mm =
            AxisArray::from_fn(|axis| self.position[axis] as f64 * self.limits.steps_to_mm[axis]);
        tracing::debug!("Planner position synced from steppers: {:?}", self.position);
    }

    /// Planner Position in logical steps.
    pub fn position_steps(&self) -> AxisArray<i64> {
        self.position
    }

    /// Actuator positions the executor reaches once every queued block
    /// has run.
    pub fn actuator_position(&self) -> Result<AxisArray<i64>, MotionError> {
        let mapped = self.mapper.kinematics().actuator_position(&self.position)?;
        Ok(AxisArray::from_fn(|axis| {
            mapped[axis].saturating_add(self.actuator_remainder[axis])
        }))
    }

    /// Planner Position in logical mm, leveling removed.
    pub fn current_position(&self) -> AxisArray<f64> {
        self.mapper.from_planner(&self.position_mm)
    }

    /// Stops motion now: drops every queued block, abandons the running
    /// one and resynchronizes the position from the executor.
    pub fn quick_stop(&mut self) {
        let dropped = self.queue.discard_all();
        self.driver.quick_stop();
        tracing::warn!("Motion queue cleared ({} blocks dropped)", dropped);
        self.sync_from_steppers();
        self.reset_previous();
    }

    // ---- settings ----

    pub fn limits(&self) -> &MotionLimits {
        &self.limits
    }

    pub fn set_steps_per_mm(&mut self, axis: Axis, steps_per_mm: f64) -> Result<(), MotionError> {
        check_positive("steps_per_mm", steps_per_mm)?;
        let previous = self.limits.steps_per_mm[axis];
        self.limits.steps_per_mm[axis] = steps_per_mm;
        if let Err(err) = self.refresh_positioning() {
            self.limits.steps_per_mm[axis] = previous;
            self.limits.refresh_steps_to_mm();
            return Err(err);
        }
        Ok(())
    }

    /// Re-derives everything that depends on steps-per-mm.
    fn refresh_positioning(&mut self) -> Result<(), MotionError> {
        self.limits.refresh_steps_to_mm();
        let planner_mm = self.position_mm;
        self.set_planner_position(planner_mm)?;
        self.limits.reset_acceleration_rates();
        Ok(())
    }

    pub fn set_max_feedrate(&mut self, axis: Axis, feed_rate: f64) -> Result<(), MotionError> {
        check_positive("max_feedrate", feed_rate)?;
        self.limits.max_feedrate[axis] = feed_rate;
        Ok(())
    }

    pub fn set_max_acceleration(&mut self, axis: Axis, acceleration: f64) -> Result<(), MotionError> {
        check_positive("max_acceleration", acceleration)?;
        self.limits.max_acceleration[axis] = acceleration;
        self.limits.reset_acceleration_rates();
        Ok(())
    }

    pub fn set_max_jerk(&mut self, axis: Axis, jerk: f64) -> Result<(), MotionError> {
        if !(jerk.is_finite() && jerk >= 0.0) {
            return Err(MotionError::InvalidSetting { name: "max_jerk", value: jerk });
        }
        self.limits.max_jerk[axis] = jerk;
        Ok(())
    }

    pub fn set_accelerations(&mut self, print: f64, retract: f64, travel: f64) -> Result<(), MotionError> {
        check_positive("acceleration", print)?;
        check_positive("retract_acceleration", retract)?;
        check_positive("travel_acceleration", travel)?;
        self.limits.acceleration = print;
        self.limits.retract_acceleration = retract;
        self.limits.travel_acceleration = travel;
        Ok(())
    }

    pub fn set_min_feedrates(&mut self, print: f64, travel: f64) -> Result<(), MotionError> {
        for (name, value) in [("min_feedrate", print), ("min_travel_feedrate", travel)] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(MotionError::InvalidSetting { name, value });
            }
        }
        self.limits.min_feedrate = print;
        self.limits.min_travel_feedrate = travel;
        Ok(())
    }

    pub fn set_flow_percentage(&mut self, tool: u8, percentage: f64) -> Result<(), MotionError> {
        check_positive("flow_percentage", percentage)?;
        self.tool(tool)?;
        self.tools[tool as usize].flow_percentage = percentage;
        Ok(())
    }

    pub fn set_volumetric_multiplier(&mut self, tool: u8, multiplier: f64) -> Result<(), MotionError> {
        check_positive("volumetric_multiplier", multiplier)?;
        self.tool(tool)?;
        self.tools[tool as usize].volumetric_multiplier = multiplier;
        Ok(())
    }

    /// Fan duty recorded into blocks queued from now on.
    pub fn set_fan_duty(&mut self, fan: usize, duty: u8) -> Result<(), MotionError> {
        if fan >= self.settings.fan_count {
            return Err(MotionError::UnknownFan { fan, count: self.settings.fan_count });
        }
        self.fan_duty[fan] = duty;
        Ok(())
    }

    /// Set by the thermal side while the hotend is too cold to extrude.
    pub fn set_extrusion_blocked(&mut self, blocked: bool) {
        self.extrusion_blocked = blocked;
    }

    /// Called repeatedly while `enqueue` waits for a free slot and while
    /// [`Planner::synchronize`] waits for the queue to drain.
    pub fn set_idle_hook(&mut self, idle: impl FnMut() + Send + 'static) {
        self.idle = Box::new(idle);
    }

    /// Replaces the leveling correction. Waits for the queue to drain,
    /// then keeps the logical position and moves the Planner Position to
    /// match the new correction.
    pub fn set_leveling(&mut self, leveling: Option<Leveling>) -> Result<(), MotionError> {
        self.switch_leveling(|mapper| mapper.set_leveling(leveling))
    }

    pub fn set_leveling_enabled(&mut self, enabled: bool) -> Result<(), MotionError> {
        self.switch_leveling(|mapper| mapper.set_leveling_enabled(enabled))
    }

    fn switch_leveling(&mut self, change: impl FnOnce(&mut KinematicMapper)) -> Result<(), MotionError> {
        self.synchronize();
        let logical = self.current_position();
        change(&mut self.mapper);
        let planner_mm = self.mapper.to_planner(&logical);
        self.set_planner_position(planner_mm)
    }

    // ---- diagnostics ----

    pub fn queue(&self) -> &Arc<BlockQueue> {
        &self.queue
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn queued_move_count(&self) -> usize {
        self.queue.len()
    }

    pub fn is_buffer_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn estimated_runtime(&self) -> Duration {
        self.queue.estimated_runtime()
    }

    /// Nominal speed (mm/s) and rate (steps/s) of the block at the tail.
    pub fn current_block_speed(&self) -> Option<(f64, u32)> {
        let range = self.queue.queued();
        if range.is_empty() {
            return None;
        }
        self.queue
            .snapshot(range.start)
            .map(|block| (block.nominal_speed, block.nominal_rate))
    }

    pub fn queue_stats(&self) -> QueueStats {
        QueueStats {
            length: self.queue.len(),
            capacity: self.queue.capacity(),
            estimated_runtime: self.queue.estimated_runtime(),
            current_block: self.current_block_speed(),
        }
    }

    pub fn axes_activity(&self) -> AxisActivity {
        let range = self.queue.queued();
        let mut active = AxisSet::empty();
        let mut fan_duty = self.fan_duty;
        for seq in range.clone() {
            if let Some(block) = self.queue.snapshot(seq) {
                if seq == range.start {
                    fan_duty = block.fan_duty;
                }
                active = active.union(block.active_actuators());
            }
        }
        AxisActivity { active, fan_duty }
    }

    /// Powers down the configured actuators no queued block moves and
    /// applies the fan duty of the block at the tail.
    pub fn check_axes_activity(&self) -> AxisActivity {
        let activity = self.axes_activity();
        let active = self.with_coupled(activity.active);
        for axis in self.disable_inactive.iter() {
            if !active.contains(axis) {
                self.driver.disable_actuator(axis);
            }
        }
        for (fan, duty) in activity.fan_duty.iter().enumerate().take(self.settings.fan_count) {
            self.driver.set_fan_duty(fan, *duty);
        }
        activity
    }
}

fn check_finite(values: &AxisArray<f64>) -> Result<(), MotionError> {
    match values.iter().find(|(_, value)| !value.is_finite()) {
        Some((axis, _)) => Err(MotionError::NonFiniteTarget(axis)),
        None => Ok(()),
    }
}

fn check_positive(name: &'static str, value: f64) -> Result<(), MotionError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(MotionError::InvalidSetting { name, value })
    }
}
