// src/motion/stepper.rs
use std::sync::Arc;

use parking_lot::Mutex;

use super::axis::{Axis, AxisArray, AxisSet};
use super::block::{Block, MAX_FANS};
use super::queue::{ActiveBlock, BlockQueue};

/// Hooks into the step executor used by the planner.
///
/// Positions are actuator steps. Implementations are shared between the
/// planner thread and the executor context, so every method takes `&self`.
pub trait StepperDriver: Send {
    /// A block was queued; start executing if idle.
    fn wake(&self);

    /// Abandon the running block immediately.
    fn quick_stop(&self);

    fn report_axis_positions(&self) -> AxisArray<i64>;

    fn set_actuator_position(&self, axis: Axis, steps: i64);

    fn enable_actuator(&self, axis: Axis);

    fn enable_extruder(&self, tool: u8) {
        let _ = tool;
        self.enable_actuator(Axis::E);
    }

    /// Powers down an idle actuator. For `Axis::E` this covers every tool.
    fn disable_actuator(&self, axis: Axis) {
        let _ = axis;
    }

    fn set_fan_duty(&self, fan: usize, duty: u8) {
        let _ = (fan, duty);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ExecutorStats {
    pub completed_blocks: u64,
    pub abandoned_blocks: u64,
    pub step_events: u64,
    /// Simulated seconds spent stepping.
    pub elapsed: f64,
    pub peak_step_rate: f64,
    pub wake_count: u64,
}

#[derive(Debug)]
struct Execution {
    active: ActiveBlock,
    step: u32,
    counters: AxisArray<i64>,
    /// Time already spent waiting for the next step.
    partial: f64,
}

impl Execution {
    fn new(active: ActiveBlock) -> Self {
        let start = -((active.block.step_event_count >> 1) as i64);
        Self { active, step: 0, counters: AxisArray::splat(start), partial: 0.0 }
    }
}

#[derive(Debug, Default)]
struct ExecutorState {
    current: Option<Execution>,
    position: AxisArray<i64>,
    enabled: AxisSet,
    enabled_tools: u32,
    fan_duty: [u8; MAX_FANS],
    stats: ExecutorStats,
    history: Option<Vec<Block>>,
}

/// Reference executor that consumes the queue in simulated time.
///
/// It steps with Bresenham distribution and follows each block's
/// trapezoid, so tests and the harness can check what a real step
/// generator would do with the planned blocks.
#[derive(Debug, Clone)]
pub struct SimulatedStepper {
    queue: Arc<BlockQueue>,
    state: Arc<Mutex<ExecutorState>>,
}

impl SimulatedStepper {
    pub fn new(queue: Arc<BlockQueue>) -> Self {
        Self { queue, state: Arc::new(Mutex::new(ExecutorState::default())) }
    }

    /// Keeps a copy of every block it finishes.
    pub fn with_history(self) -> Self {
        self.state.lock().history = Some(Vec::new());
        self
    }

    pub fn take_history(&self) -> Vec<Block> {
        self.state.lock().history.as_mut().map(std::mem::take).unwrap_or_default()
    }

    pub fn stats(&self) -> ExecutorStats {
        self.state.lock().stats
    }

    pub fn position(&self) -> AxisArray<i64> {
        self.state.lock().position
    }

    pub fn enabled_actuators(&self) -> AxisSet {
        self.state.lock().enabled
    }

    pub fn is_tool_enabled(&self, tool: u8) -> bool {
        tool < 32 && self.state.lock().enabled_tools & (1 << tool) != 0
    }

    /// Fan duty last applied by the planner.
    pub fn fan_duty(&self) -> [u8; MAX_FANS] {
        self.state.lock().fan_duty
    }

    /// Sequence number of the block being stepped, if any.
    pub fn current_seq(&self) -> Option<u64> {
        self.state.lock().current.as_ref().map(|e| e.active.seq())
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().current.is_none() && !self.queue.is_block_available()
    }

    /// Runs `dt` seconds of machine time. Returns the step events issued.
    pub fn tick(&self, dt: f64) -> u64 {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut budget = dt;
        let mut issued = 0;

        while budget > 0.0 {
            if state.current.is_none() {
                match self.queue.take_current_block() {
                    Some(active) => state.current = Some(Execution::new(active)),
                    None => break,
                }
            }
            let Some(exec) = state.current.as_mut() else {
                break;
            };
            let block = exec.active.block;

            let rate = step_rate(&block, exec.step);
            state.stats.peak_step_rate = state.stats.peak_step_rate.max(rate);
            let needed = 1.0 / rate - exec.partial;
            if needed > budget {
                exec.partial += budget;
                state.stats.elapsed += budget;
                break;
            }
            budget -= needed;
            state.stats.elapsed += needed;
            exec.partial = 0.0;

            let count = block.step_event_count as i64;
            for axis in Axis::ALL {
                exec.counters[axis] += block.steps[axis] as i64;
                if exec.counters[axis] > 0 {
                    exec.counters[axis] -= count;
                    state.position[axis] += if block.direction.contains(axis) { -1 } else { 1 };
                }
            }
            exec.step += 1;
            issued += 1;
            state.stats.step_events += 1;

            if exec.step >= block.step_event_count {
                let finished = exec.active;
                state.current = None;
                if self.queue.retire_current_block(&finished) {
                    state.stats.completed_blocks += 1;
                    if let Some(history) = state.history.as_mut() {
                        history.push(finished.block);
                    }
                }
            }
        }
        issued
    }

    /// Ticks until the queue is drained or `max_ticks` is reached. Returns
    /// the number of ticks used.
    pub fn run_until_idle(&self, dt: f64, max_ticks: usize) -> usize {
        for ticks in 0..max_ticks {
            if self.is_idle() {
                return ticks;
            }
            self.tick(dt);
        }
        max_ticks
    }
}

/// Step rate (steps/s) at step index `step` of a block.
pub fn step_rate(block: &Block, step: u32) -> f64 {
    let initial = block.initial_rate as f64;
    let final_ = block.final_rate as f64;
    let accel = block.acceleration_steps_per_s2 as f64;
    let nominal = (block.nominal_rate as f64).max(initial);
    let peak = (initial * initial + 2.0 * accel * block.accelerate_until as f64)
        .sqrt()
        .min(nominal);

    let rate = if step < block.accelerate_until {
        (initial * initial + 2.0 * accel * step as f64).sqrt().min(peak)
    } else if step < block.decelerate_after {
        peak
    } else {
        let slowed = peak * peak - 2.0 * accel * (step - block.decelerate_after) as f64;
        slowed.max(final_ * final_).sqrt()
    };
    rate.max(1.0)
}

impl StepperDriver for SimulatedStepper {
    fn wake(&self) {
        self.state.lock().stats.wake_count += 1;
    }

    fn quick_stop(&self) {
        let mut state = self.state.lock();
        if state.current.take().is_some() {
            state.stats.abandoned_blocks += 1;
        }
    }

    fn report_axis_positions(&self) -> AxisArray<i64> {
        self.state.lock().position
    }

    fn set_actuator_position(&self, axis: Axis, steps: i64) {
        self.state.lock().position[axis] = steps;
    }

    fn enable_actuator(&self, axis: Axis) {
        self.state.lock().enabled.insert(axis);
    }

    fn enable_extruder(&self, tool: u8) {
        let mut state = self.state.lock();
        state.enabled.insert(Axis::E);
        if tool < 32 {
            state.enabled_tools |= 1 << tool;
        }
    }

    fn disable_actuator(&self, axis: Axis) {
        let mut state = self.state.lock();
        state.enabled.remove(axis);
        if axis == Axis::E {
            state.enabled_tools = 0;
        }
    }

    fn set_fan_duty(&self, fan: usize, duty: u8) {
        if let Some(slot) = self.state.lock().fan_duty.get_mut(fan) {
            *slot = duty;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::trapezoid::compute_trapezoid;

    fn planned_block(steps: AxisArray<u32>, direction: AxisSet) -> Block {
        let count = steps.values().copied().max().unwrap();
        let mut block = Block {
            steps,
            step_event_count: count,
            direction,
            millimeters: count as f64 / 80.0,
            nominal_speed: 50.0,
            nominal_rate: 4000,
            acceleration: 1000.0,
            acceleration_steps_per_s2: 80_000,
            ..Block::default()
        };
        compute_trapezoid(&block, 0.0, 0.0, 120).apply(&mut block);
        block
    }

    #[test]
    fn test_executes_block_with_bresenham() {
        let queue = Arc::new(BlockQueue::new(4));
        let mut dir = AxisSet::empty();
        dir.insert(Axis::Y);
        queue.push(planned_block(AxisArray::new(800, 300, 0, 17), dir));
        let stepper = SimulatedStepper::new(queue.clone()).with_history();

        stepper.run_until_idle(0.01, 10_000);
        assert_eq!(stepper.position(), AxisArray::new(800, -300, 0, 17));
        let stats = stepper.stats();
        assert_eq!(stats.completed_blocks, 1);
        assert_eq!(stats.step_events, 800);
        assert!(stats.peak_step_rate <= 4000.0 + 1e-9);
        assert_eq!(stepper.take_history().len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_quick_stop_abandons_block() {
        let queue = Arc::new(BlockQueue::new(4));
        queue.push(planned_block(AxisArray::new(8000, 0, 0, 0), AxisSet::empty()));
        let stepper = SimulatedStepper::new(queue.clone());
        stepper.tick(0.05);
        assert!(stepper.current_seq().is_some());

        queue.discard_all();
        stepper.quick_stop();
        let stopped_at = stepper.position()[Axis::X];
        assert!(stopped_at > 0 && stopped_at < 8000);
        stepper.tick(1.0);
        assert_eq!(stepper.position()[Axis::X], stopped_at);
        assert_eq!(stepper.stats().abandoned_blocks, 1);
    }

    #[test]
    fn test_step_rate_follows_profile() {
        let block = planned_block(AxisArray::new(8000, 0, 0, 0), AxisSet::empty());
        assert_eq!(step_rate(&block, 0), 120.0);
        assert_eq!(step_rate(&block, 4000), 4000.0);
        assert!(step_rate(&block, 7999) < 1000.0);
    }
}
